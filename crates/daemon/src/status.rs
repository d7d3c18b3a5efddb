//! Status snapshots for media-relay
//!
//! Live jobs, gate occupancy, outcome totals and host load, serialised as the
//! JSON served by the status server.

use crate::gate::GateStatus;
use crate::job::{JobInfo, JobOutcome, JobOutput};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Outcome counts since startup
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobTotals {
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Bytes of finished artifacts: downloads, encodes and uploads
    pub bytes_delivered: u64,
}

/// Lock-free accumulator behind [`JobTotals`]
#[derive(Debug, Default)]
pub struct OutcomeCounters {
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    bytes_delivered: AtomicU64,
}

impl OutcomeCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Succeeded(output) => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                self.bytes_delivered
                    .fetch_add(delivered_bytes(output), Ordering::Relaxed);
            }
            JobOutcome::Failed(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            JobOutcome::Cancelled => {
                self.cancelled.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn totals(&self) -> JobTotals {
        JobTotals {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            bytes_delivered: self.bytes_delivered.load(Ordering::Relaxed),
        }
    }
}

fn delivered_bytes(output: &JobOutput) -> u64 {
    match output {
        JobOutput::Fetch(out) => out.size_bytes,
        JobOutput::Transcode(out) => out.size_bytes,
        JobOutput::Transfer(receipt) => receipt.size_bytes,
    }
}

/// Complete status snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub timestamp_unix_ms: i64,
    pub jobs: Vec<JobInfo>,
    pub gates: Vec<GateStatus>,
    pub totals: JobTotals,
    pub system: SystemMetrics,
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let total_memory = sys.total_memory();
    let mem_usage = if total_memory > 0 {
        (sys.used_memory() as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };
    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: sys.global_cpu_usage(),
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}

pub fn timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
