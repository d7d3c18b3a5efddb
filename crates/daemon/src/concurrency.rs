//! Concurrency planning for media-relay
//!
//! Turns the configured per-class limits and the machine's core count into
//! the capacities the admission gate enforces.

use crate::job::JobClass;
use media_relay_config::Config;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum concurrent fetches (`None` = unbounded)
    pub fetch_limit: Option<u32>,
    /// Maximum concurrent transcodes (`None` = unbounded)
    pub transcode_limit: Option<u32>,
    /// Maximum concurrent uploads (`None` = unbounded)
    pub transfer_limit: Option<u32>,
    /// Encoder threads handed to each transcode
    pub transcode_threads: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// - A limit of 0 leaves the class unbounded
    /// - Encoder threads use the explicit setting when non-zero, otherwise
    ///   the cores are split evenly across the transcode slots
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    pub fn derive_with_cores(cfg: &Config, total_cores: u32) -> Self {
        let total_cores = total_cores.max(1);
        let transcode_limit = bounded(cfg.limits.transcode);

        let transcode_threads = if cfg.transcode.threads > 0 {
            cfg.transcode.threads
        } else {
            derive_threads(total_cores, transcode_limit)
        };

        Self {
            total_cores,
            fetch_limit: bounded(cfg.limits.fetch),
            transcode_limit,
            transfer_limit: bounded(cfg.limits.transfer),
            transcode_threads,
        }
    }

    pub fn capacity_for(&self, class: JobClass) -> Option<u32> {
        match class {
            JobClass::Fetch => self.fetch_limit,
            JobClass::Transcode => self.transcode_limit,
            JobClass::Transfer => self.transfer_limit,
        }
    }
}

fn bounded(limit: u32) -> Option<u32> {
    (limit > 0).then_some(limit)
}

/// Split cores across transcode slots; unbounded transcodes let the encoder decide
fn derive_threads(cores: u32, transcode_limit: Option<u32>) -> u32 {
    match transcode_limit {
        Some(slots) => (cores / slots).max(1),
        None => 0,
    }
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use media_relay_config::LimitsConfig;
    use proptest::prelude::*;

    // Property: cores are split evenly across transcode slots, never below one
    // thread per job.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_thread_split(
            cores in 1u32..256,
            transcode in 1u32..32,
        ) {
            let mut cfg = Config::default();
            cfg.limits.transcode = transcode;

            let plan = ConcurrencyPlan::derive_with_cores(&cfg, cores);

            prop_assert_eq!(plan.total_cores, cores);
            prop_assert_eq!(plan.transcode_limit, Some(transcode));
            prop_assert_eq!(plan.transcode_threads, (cores / transcode).max(1));
            prop_assert!(plan.transcode_threads * transcode <= cores.max(transcode));
        }
    }

    // Property: explicit encoder threads are used unchanged.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_explicit_threads_override(
            cores in 1u32..256,
            threads in 1u32..64,
        ) {
            let mut cfg = Config::default();
            cfg.transcode.threads = threads;

            let plan = ConcurrencyPlan::derive_with_cores(&cfg, cores);

            prop_assert_eq!(plan.transcode_threads, threads);
        }
    }

    #[test]
    fn test_zero_limit_is_unbounded() {
        let cfg = Config {
            limits: LimitsConfig {
                fetch: 0,
                transcode: 0,
                transfer: 5,
            },
            ..Config::default()
        };

        let plan = ConcurrencyPlan::derive_with_cores(&cfg, 8);

        assert_eq!(plan.capacity_for(JobClass::Fetch), None);
        assert_eq!(plan.capacity_for(JobClass::Transcode), None);
        assert_eq!(plan.capacity_for(JobClass::Transfer), Some(5));
        assert_eq!(plan.transcode_threads, 0);
    }

    #[test]
    fn test_default_limits() {
        let plan = ConcurrencyPlan::derive_with_cores(&Config::default(), 12);
        assert_eq!(plan.fetch_limit, Some(4));
        assert_eq!(plan.transcode_limit, Some(3));
        assert_eq!(plan.transfer_limit, Some(2));
        assert_eq!(plan.transcode_threads, 4);
    }
}
