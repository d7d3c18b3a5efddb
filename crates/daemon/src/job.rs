//! Job model for media-relay
//!
//! Identifiers, job classes, the phase state machine, and the terminal
//! report every submitted job produces exactly once.

use crate::encode::TranscodeOutput;
use crate::fetch::FetchOutput;
use crate::process::{DriverError, TimeoutKind};
use crate::progress::Progress;
use crate::transfer::{UploadError, UploadReceipt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Opaque job identifier, unique for the lifetime of the process
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh identifier such as `T-3F2A9C1B`
    pub fn generate(class: JobClass) -> Self {
        let raw = Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", class.prefix(), raw[..8].to_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Kind of external work; selects the admission gate and progress parser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobClass {
    Fetch,
    Transcode,
    Transfer,
}

impl JobClass {
    pub const ALL: [JobClass; 3] = [JobClass::Fetch, JobClass::Transcode, JobClass::Transfer];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobClass::Fetch => "fetch",
            JobClass::Transcode => "transcode",
            JobClass::Transfer => "transfer",
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            JobClass::Fetch => "F",
            JobClass::Transcode => "T",
            JobClass::Transfer => "U",
        }
    }
}

impl fmt::Display for JobClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job phase
///
/// ```text
/// Pending -> Running -> {Succeeded, Failed}
///               |
///               +-> Stopping -> Cancelled
/// ```
///
/// `Pending` may also go straight to `Failed` (spawn failure) or to
/// `Stopping`/`Cancelled` when a stop arrives before the tool started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    Pending,
    Running,
    Stopping,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Pending => "pending",
            JobPhase::Running => "running",
            JobPhase::Stopping => "stopping",
            JobPhase::Succeeded => "succeeded",
            JobPhase::Failed => "failed",
            JobPhase::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobPhase::Succeeded | JobPhase::Failed | JobPhase::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the state machine
    pub fn can_transition_to(&self, next: JobPhase) -> bool {
        use JobPhase::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Stopping)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Stopping)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Stopping, Cancelled)
        )
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a registered job, as served to status displays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub class: JobClass,
    pub label: String,
    pub phase: JobPhase,
    pub started_at_unix_ms: i64,
    pub elapsed_secs: u64,
    pub pid: Option<u32>,
    pub last_progress: Option<Progress>,
}

/// Terminal error of a job
#[derive(Debug, Error)]
pub enum JobError {
    /// The external tool could not be launched
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The tool ran but failed; `tail` holds its last output
    #[error("{reason}")]
    RuntimeFailure { reason: String, tail: String },

    /// Total or idle budget exhausted
    #[error("timed out ({kind}) after {}s", .elapsed.as_secs())]
    Timeout { kind: TimeoutKind, elapsed: Duration },

    /// Upload made no forward progress for too many steps
    #[error("transfer stalled after {steps} steps without progress")]
    StalledTransfer { steps: u32 },

    /// Upload failed with a classified cause
    #[error("transfer failed: {0}")]
    Transfer(UploadError),

    /// The tool finished but produced nothing recognisable
    #[error("no output file found in {}", .dir.display())]
    ArtifactNotFound { dir: PathBuf },

    /// Inputs were missing or malformed; nothing was started
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Stop request honoured; mapped to the `Cancelled` outcome
    #[error("cancelled")]
    Cancelled { forced: bool },
}

impl JobError {
    /// Short machine-readable reason code
    pub fn code(&self) -> &'static str {
        match self {
            JobError::Spawn { .. } => "spawn_error",
            JobError::RuntimeFailure { .. } => "runtime_failure",
            JobError::Timeout {
                kind: TimeoutKind::Total,
                ..
            } => "timeout_total",
            JobError::Timeout {
                kind: TimeoutKind::Idle,
                ..
            } => "timeout_idle",
            JobError::StalledTransfer { .. } => "stalled_transfer",
            JobError::Transfer(e) => e.code(),
            JobError::ArtifactNotFound { .. } => "artifact_not_found",
            JobError::InvalidInput(_) => "invalid_input",
            JobError::Cancelled { .. } => "cancelled",
        }
    }

    /// Diagnostic output tail, when the failure came from a running tool
    pub fn tail(&self) -> Option<&str> {
        match self {
            JobError::RuntimeFailure { tail, .. } if !tail.is_empty() => Some(tail),
            _ => None,
        }
    }
}

impl From<DriverError> for JobError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::Spawn { program, source } => JobError::Spawn { program, source },
            DriverError::Timeout { kind, elapsed, .. } => JobError::Timeout { kind, elapsed },
            DriverError::Io(e) => JobError::RuntimeFailure {
                reason: format!("lost track of process: {}", e),
                tail: String::new(),
            },
        }
    }
}

impl From<UploadError> for JobError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Stalled { steps } => JobError::StalledTransfer { steps },
            UploadError::Cancelled => JobError::Cancelled { forced: false },
            other => JobError::Transfer(other),
        }
    }
}

/// Success payload per job class
#[derive(Debug, Clone)]
pub enum JobOutput {
    Fetch(FetchOutput),
    Transcode(TranscodeOutput),
    Transfer(UploadReceipt),
}

/// How a job ended
#[derive(Debug)]
pub enum JobOutcome {
    Succeeded(JobOutput),
    Failed(JobError),
    Cancelled,
}

impl JobOutcome {
    pub fn phase(&self) -> JobPhase {
        match self {
            JobOutcome::Succeeded(_) => JobPhase::Succeeded,
            JobOutcome::Failed(_) => JobPhase::Failed,
            JobOutcome::Cancelled => JobPhase::Cancelled,
        }
    }
}

/// Terminal result delivered once per submitted job
#[derive(Debug)]
pub struct JobReport {
    pub id: JobId,
    pub class: JobClass,
    pub label: String,
    pub elapsed: Duration,
    pub outcome: JobOutcome,
}

impl JobReport {
    pub fn phase(&self) -> JobPhase {
        self.outcome.phase()
    }

    /// Human-readable one-line outcome
    pub fn message(&self) -> String {
        let took = format_elapsed(self.elapsed);
        match &self.outcome {
            JobOutcome::Succeeded(JobOutput::Fetch(out)) => match &out.artifact {
                Some(path) => format!(
                    "[{}] download complete: {} ({:.1} MB) in {}",
                    self.id,
                    display_name(path),
                    out.size_bytes as f64 / MIB,
                    took
                ),
                None => format!(
                    "[{}] download finished but files are still being written in {}; check again shortly",
                    self.id,
                    out.directory.display()
                ),
            },
            JobOutcome::Succeeded(JobOutput::Transcode(out)) => format!(
                "[{}] encode complete: {} ({:.1} MB) in {}",
                self.id,
                display_name(&out.output_path),
                out.size_bytes as f64 / MIB,
                took
            ),
            JobOutcome::Succeeded(JobOutput::Transfer(receipt)) => format!(
                "[{}] upload complete: {} ({:.1} MB, {:.1} MB/s) {}",
                self.id,
                receipt.remote_name,
                receipt.size_bytes as f64 / MIB,
                receipt.average_rate_bytes / MIB,
                receipt.view_url
            ),
            JobOutcome::Failed(err) => {
                format!("[{}] {} failed after {}: {}", self.id, self.class, took, err)
            }
            JobOutcome::Cancelled => {
                format!("[{}] {} cancelled after {}", self.id, self.class, took)
            }
        }
    }
}

const MIB: f64 = 1024.0 * 1024.0;

fn display_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// `75s` -> `1m 15s`
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}
