//! media-relay
//!
//! Runs fetch (aria2c), transcode (ffmpeg) and transfer (resumable upload)
//! jobs under per-class admission limits, with progress reporting,
//! cancellation and a status server.

pub mod artifact;
pub mod concurrency;
pub mod daemon;
pub mod encode;
pub mod fetch;
pub mod gate;
pub mod job;
pub mod logging;
pub mod orchestrator;
pub mod process;
pub mod progress;
pub mod registry;
pub mod retry;
pub mod startup;
pub mod status;
pub mod status_server;
pub mod transfer;

pub use media_relay_config as config;
pub use media_relay_config::Config;
pub use artifact::{ArtifactResolver, Resolution};
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use daemon::{Daemon, DaemonError};
pub use encode::{run_transcode, EncodeError, EncodeSettings, TranscodeOutput, TranscodeParams};
pub use fetch::{run_fetch, FetchOutput, FetchParams, FetchSettings};
pub use gate::{AdmissionRejected, ConcurrencyGate, GateStatus, GateToken};
pub use job::{JobClass, JobError, JobId, JobInfo, JobOutcome, JobOutput, JobPhase, JobReport};
pub use logging::init_logging;
pub use orchestrator::{
    silent_sink, JobContext, JobRequest, JobTicket, Orchestrator, OrchestratorSettings, ProgressSink,
    SubmitError,
};
pub use process::{CommandSpec, DriverError, RunningProcess, TimeoutKind, WaitLimits};
pub use progress::Progress;
pub use registry::{JobRegistry, RegistryError};
pub use retry::{ErrorKind, RetryDecision, RetryPolicy};
pub use startup::{run_startup_checks, StartupError, ToolPaths};
pub use status::{collect_system_metrics, JobTotals, StatusSnapshot, SystemMetrics};
pub use status_server::{create_status_router, run_status_server, ServerError};
pub use transfer::{
    DriveClient, TransferClient, TransferEngine, TransferError, TransferParams, TransferSettings,
    UploadError, UploadReceipt,
};
