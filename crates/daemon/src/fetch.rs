//! Fetch jobs: downloads driven by aria2c
//!
//! aria2c chooses its own file names, so the driver trusts the path the tool
//! reports on completion and falls back to scanning the output directory.

use crate::artifact::{has_control_file, is_media_file, rename_to, ArtifactResolver, Resolution};
use crate::job::JobError;
use crate::orchestrator::JobContext;
use crate::process::{CommandSpec, OutputLine, OutputObserver, RunningProcess, WaitLimits, WaitOutcome};
use crate::progress::{parse_fetch_done_bytes, parse_fetch_line, FetchLine, Progress};
use crate::retry::RetryPolicy;
use media_relay_config::Config;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Parameters for one download
#[derive(Debug, Clone, PartialEq)]
pub struct FetchParams {
    /// Magnet link, torrent URL or plain URL
    pub source: String,
    /// Final file name without extension; the tool's name is kept when unset
    pub output_name: Option<String>,
}

impl FetchParams {
    pub fn new(source: impl Into<String>, output_name: Option<String>) -> Self {
        Self {
            source: source.into(),
            output_name,
        }
    }

    pub fn label(&self) -> String {
        match &self.output_name {
            Some(name) => name.clone(),
            None => {
                let mut label: String = self.source.chars().take(48).collect();
                if self.source.chars().count() > 48 {
                    label.push_str("...");
                }
                label
            }
        }
    }
}

/// Everything the fetch driver needs besides the request itself
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub aria2c: PathBuf,
    pub output_dir: PathBuf,
    pub limits: WaitLimits,
    /// Elapsed-time progress cadence while the tool is quiet
    pub heartbeat: Duration,
    pub retry: RetryPolicy,
    pub resolver: ArtifactResolver,
    pub tail_bytes: usize,
}

impl FetchSettings {
    pub fn from_config(cfg: &Config, aria2c: PathBuf) -> Self {
        Self {
            aria2c,
            output_dir: cfg.fetch.output_dir.clone(),
            limits: WaitLimits {
                poll_interval: Duration::from_millis(cfg.fetch.poll_interval_ms.max(10)),
                total_timeout: non_zero_secs(cfg.fetch.total_timeout_secs),
                idle_timeout: non_zero_secs(cfg.fetch.idle_timeout_secs),
                grace_period: Duration::from_secs(cfg.process.grace_period_secs),
            },
            heartbeat: Duration::from_secs(cfg.fetch.heartbeat_secs.max(1)),
            retry: RetryPolicy::for_fetch(&cfg.fetch),
            resolver: ArtifactResolver::with_recency_window(Duration::from_secs(
                cfg.fetch.recency_window_hours * 3600,
            )),
            tail_bytes: cfg.process.output_tail_bytes,
        }
    }
}

pub(crate) fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Result of a finished download
#[derive(Debug, Clone)]
pub struct FetchOutput {
    /// Final file; `None` when the tool exited but files are still being written
    pub artifact: Option<PathBuf>,
    pub size_bytes: u64,
    pub directory: PathBuf,
    /// In-progress files seen when no artifact was found
    pub pending: Vec<PathBuf>,
    pub elapsed: Duration,
}

/// Build the aria2c invocation for `source`
pub fn build_aria2c_command(
    aria2c: &Path,
    source: &str,
    output_dir: &Path,
    retry: &RetryPolicy,
) -> CommandSpec {
    CommandSpec::new(aria2c)
        .arg("--seed-time=0")
        .arg(format!("--dir={}", output_dir.display()))
        .arg("--max-connection-per-server=16")
        .arg("--split=8")
        .arg("--min-split-size=1M")
        .arg("--continue=true")
        .arg("--file-allocation=prealloc")
        .arg("--summary-interval=2")
        .arg("--console-log-level=notice")
        .arg("--timeout=60")
        .arg(format!("--max-tries={}", retry.max_attempts))
        .arg(format!("--retry-wait={}", retry.base_delay.as_secs().max(1)))
        .arg("--bt-max-peers=50")
        .arg("--bt-request-peer-speed-limit=50M")
        .arg("--max-overall-download-limit=0")
        .arg(source)
}

struct FetchObserver<'a> {
    ctx: &'a mut JobContext,
    reported: Vec<PathBuf>,
    heartbeat: Duration,
    last_emit: Instant,
    best_percent: Option<u8>,
    best_bytes: Option<u64>,
}

impl FetchObserver<'_> {
    /// Percent or byte counter moved past anything seen before
    fn advanced(&mut self, percent: u8, done_bytes: Option<u64>) -> bool {
        let mut advanced = false;
        if self.best_percent.map_or(true, |best| percent > best) {
            self.best_percent = Some(percent);
            advanced = true;
        }
        if let Some(done) = done_bytes {
            if self.best_bytes.map_or(true, |best| done > best) {
                self.best_bytes = Some(done);
                advanced = true;
            }
        }
        advanced
    }
}

impl OutputObserver for FetchObserver<'_> {
    fn on_line(&mut self, line: &OutputLine) -> bool {
        trace!(job_id = %self.ctx.id(), line = %line.text, "aria2c");
        match parse_fetch_line(&line.text) {
            Some(FetchLine::Progress(progress)) => {
                let advanced = self.advanced(progress.percent, parse_fetch_done_bytes(&line.text));
                self.ctx.report(progress);
                self.last_emit = Instant::now();
                advanced
            }
            Some(FetchLine::Completed(path)) => {
                debug!(job_id = %self.ctx.id(), path = %path.display(), "tool reported completion");
                self.reported.push(path);
                true
            }
            None => false,
        }
    }

    fn on_tick(&mut self, elapsed: Duration) {
        if self.last_emit.elapsed() >= self.heartbeat {
            self.ctx.heartbeat(elapsed);
            self.last_emit = Instant::now();
        }
    }
}

/// Largest reported media file that exists and is no longer being written
fn best_reported(paths: &[PathBuf]) -> Option<PathBuf> {
    paths
        .iter()
        .filter(|p| is_media_file(p) && !has_control_file(p))
        .filter_map(|p| Some((std::fs::metadata(p).ok()?.len(), p)))
        .max_by_key(|(size, _)| *size)
        .map(|(_, p)| p.clone())
}

/// Run one download to completion
pub async fn run_fetch(
    settings: &FetchSettings,
    params: &FetchParams,
    ctx: &mut JobContext,
) -> Result<FetchOutput, JobError> {
    let source = params.source.trim();
    if source.is_empty() {
        return Err(JobError::InvalidInput("empty download source".to_string()));
    }
    tokio::fs::create_dir_all(&settings.output_dir)
        .await
        .map_err(|e| JobError::InvalidInput(format!(
            "cannot create {}: {}",
            settings.output_dir.display(),
            e
        )))?;

    let spec = build_aria2c_command(&settings.aria2c, source, &settings.output_dir, &settings.retry);
    let started = Instant::now();
    let mut process = RunningProcess::start(&spec, settings.tail_bytes)?;
    ctx.mark_running(process.pid());
    ctx.report(Progress::new(0, "", None));
    info!(job_id = %ctx.id(), pid = ?process.pid(), dir = %settings.output_dir.display(), "download started");

    let mut cancel = ctx.cancel_signal();
    let mut observer = FetchObserver {
        ctx: &mut *ctx,
        reported: Vec::new(),
        heartbeat: settings.heartbeat,
        last_emit: Instant::now(),
        best_percent: None,
        best_bytes: None,
    };
    let outcome = process
        .wait(&settings.limits, &mut cancel, &mut observer)
        .await?;
    let reported = std::mem::take(&mut observer.reported);

    let exit = match outcome {
        WaitOutcome::Exited(exit) => exit,
        WaitOutcome::Cancelled(stop) => return Err(JobError::Cancelled { forced: stop.forced }),
    };

    // a failed run leaves a preallocated, incomplete file under its final name
    if !exit.success() {
        return Err(JobError::RuntimeFailure {
            reason: format!("aria2c failed with {}", exit.describe()),
            tail: process.tail(),
        });
    }

    let desired = params.output_name.as_deref();
    let resolution = match best_reported(&reported) {
        Some(path) => Resolution::Found(rename_to(&path, desired)),
        None => settings
            .resolver
            .resolve(&settings.output_dir, desired)
            .map_err(|e| JobError::RuntimeFailure {
                reason: e.to_string(),
                tail: process.tail(),
            })?,
    };

    match resolution {
        Resolution::Found(path) => {
            let size_bytes = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
            ctx.report(Progress::complete(""));
            Ok(FetchOutput {
                artifact: Some(path),
                size_bytes,
                directory: settings.output_dir.clone(),
                pending: Vec::new(),
                elapsed: started.elapsed(),
            })
        }
        Resolution::Pending(pending) => {
            warn!(job_id = %ctx.id(), count = pending.len(), "tool exited while files are still being written");
            Ok(FetchOutput {
                artifact: None,
                size_bytes: 0,
                directory: settings.output_dir.clone(),
                pending,
                elapsed: started.elapsed(),
            })
        }
        Resolution::NotFound => Err(JobError::ArtifactNotFound {
            dir: settings.output_dir.clone(),
        }),
    }
}
