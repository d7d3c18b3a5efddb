//! Job orchestration for media-relay
//!
//! The [`Orchestrator`] admits a job through the [`ConcurrencyGate`],
//! registers it, drives it on its own task, and delivers exactly one
//! [`JobReport`]. The gate token and the registry entry live on that task, so
//! both are released on every exit path, panics included.

use crate::concurrency::ConcurrencyPlan;
use crate::encode::{run_transcode, EncodeSettings, TranscodeParams};
use crate::fetch::{run_fetch, FetchParams, FetchSettings};
use crate::gate::{AdmissionRejected, ConcurrencyGate, GateStatus};
use crate::job::{JobClass, JobError, JobId, JobInfo, JobOutcome, JobOutput, JobPhase, JobReport};
use crate::progress::{Progress, ProgressTracker};
use crate::registry::{CancelSignal, JobHandle, JobRegistry, RegistryError};
use crate::status::{JobTotals, OutcomeCounters};
use crate::transfer::{TransferEngine, TransferObserver, TransferParams};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Progress callback: `(percent, rate, eta_text)`
pub type ProgressSink = Arc<dyn Fn(u8, &str, &str) + Send + Sync>;

/// A sink that drops every event
pub fn silent_sink() -> ProgressSink {
    Arc::new(|_: u8, _: &str, _: &str| {})
}

/// Per-job view handed to the drivers
///
/// Forwards progress to the registry and the caller's sink, only when the
/// percentage moves forward.
pub struct JobContext {
    handle: JobHandle,
    cancel: CancelSignal,
    tracker: ProgressTracker,
    sink: ProgressSink,
}

impl JobContext {
    pub fn new(handle: JobHandle, cancel: CancelSignal, sink: ProgressSink) -> Self {
        Self {
            handle,
            cancel,
            tracker: ProgressTracker::new(),
            sink,
        }
    }

    pub fn id(&self) -> &JobId {
        self.handle.id()
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// The underlying process or transfer has started
    pub fn mark_running(&self, pid: Option<u32>) {
        self.handle.set_pid(pid);
        if !self.handle.set_phase(JobPhase::Running) {
            debug!(job_id = %self.id(), phase = ?self.handle.phase(), "job not moved to running");
        }
    }

    pub fn report(&mut self, progress: Progress) {
        if let Some(progress) = self.tracker.advance(progress) {
            self.emit(&progress);
        }
    }

    /// Elapsed-time update at the last known percentage
    pub fn heartbeat(&mut self, elapsed: Duration) {
        let progress = self.tracker.heartbeat(elapsed);
        self.emit(&progress);
    }

    fn emit(&self, progress: &Progress) {
        self.handle.record_progress(progress);
        (self.sink)(progress.percent, &progress.rate, &progress.eta_text());
    }
}

impl TransferObserver for JobContext {
    fn on_progress(&mut self, progress: Progress) {
        self.report(progress);
    }
}

/// What to run
#[derive(Debug, Clone, PartialEq)]
pub enum JobRequest {
    Fetch(FetchParams),
    Transcode(TranscodeParams),
    Transfer(TransferParams),
}

impl JobRequest {
    pub fn class(&self) -> JobClass {
        match self {
            JobRequest::Fetch(_) => JobClass::Fetch,
            JobRequest::Transcode(_) => JobClass::Transcode,
            JobRequest::Transfer(_) => JobClass::Transfer,
        }
    }

    pub fn label(&self) -> String {
        match self {
            JobRequest::Fetch(p) => p.label(),
            JobRequest::Transcode(p) => p.label(),
            JobRequest::Transfer(p) => p.label(),
        }
    }
}

/// Error returned by [`Orchestrator::submit`]
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Rejected(#[from] AdmissionRejected),

    /// The class's external tool was not found at startup
    #[error("{0} jobs are unavailable on this host")]
    Unavailable(JobClass),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Driver settings per class; `None` disables the class
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub fetch: Option<FetchSettings>,
    pub transcode: Option<EncodeSettings>,
    pub transfer: TransferEngine,
}

impl OrchestratorSettings {
    pub fn is_available(&self, class: JobClass) -> bool {
        match class {
            JobClass::Fetch => self.fetch.is_some(),
            JobClass::Transcode => self.transcode.is_some(),
            // an engine without a client still runs and reports the failure
            JobClass::Transfer => true,
        }
    }
}

/// Handle to a submitted job
#[derive(Debug)]
pub struct JobTicket {
    id: JobId,
    class: JobClass,
    label: String,
    submitted: Instant,
    report: oneshot::Receiver<JobReport>,
}

impl JobTicket {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn class(&self) -> JobClass {
        self.class
    }

    /// Wait for the terminal report
    pub async fn wait(self) -> JobReport {
        match self.report.await {
            Ok(report) => report,
            Err(_) => JobReport {
                id: self.id,
                class: self.class,
                label: self.label,
                elapsed: self.submitted.elapsed(),
                outcome: JobOutcome::Failed(JobError::RuntimeFailure {
                    reason: "job task ended without a report".to_string(),
                    tail: String::new(),
                }),
            },
        }
    }
}

/// Front door for every job; cheap to clone
#[derive(Clone)]
pub struct Orchestrator {
    gate: Arc<ConcurrencyGate>,
    registry: JobRegistry,
    settings: Arc<OrchestratorSettings>,
    counters: Arc<OutcomeCounters>,
}

impl Orchestrator {
    pub fn new(plan: &ConcurrencyPlan, settings: OrchestratorSettings) -> Self {
        Self {
            gate: Arc::new(ConcurrencyGate::new(plan)),
            registry: JobRegistry::new(),
            settings: Arc::new(settings),
            counters: Arc::new(OutcomeCounters::new()),
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Admit, register and start a job
    ///
    /// Never waits for capacity: a full class is rejected immediately.
    pub fn submit(&self, request: JobRequest, sink: ProgressSink) -> Result<JobTicket, SubmitError> {
        let class = request.class();
        if !self.settings.is_available(class) {
            return Err(SubmitError::Unavailable(class));
        }

        let token = self.gate.admit(class).map_err(|rejected| {
            warn!(%class, in_flight = rejected.in_flight, capacity = rejected.capacity, "job rejected");
            rejected
        })?;

        let id = JobId::generate(class);
        let label = request.label();
        let registration = self.registry.register(id.clone(), class, label.clone())?;
        let handle = registration.handle();
        let ctx = JobContext::new(handle.clone(), registration.cancel_signal(), sink);
        info!(job_id = %id, %class, label = %label, "job admitted");

        let (report_tx, report_rx) = oneshot::channel();
        let settings = Arc::clone(&self.settings);
        let counters = Arc::clone(&self.counters);
        let submitted = Instant::now();
        let driver = tokio::spawn(drive(settings, request, ctx));

        let task_id = id.clone();
        let task_label = label.clone();
        tokio::spawn(async move {
            let result = match driver.await {
                Ok(result) => result,
                Err(join_err) => {
                    error!(job_id = %task_id, error = %join_err, "job driver panicked");
                    Err(JobError::RuntimeFailure {
                        reason: format!("job driver panicked: {}", join_err),
                        tail: String::new(),
                    })
                }
            };

            let outcome = match result {
                Err(JobError::Cancelled { forced }) => {
                    debug!(job_id = %task_id, forced, "job stopped");
                    JobOutcome::Cancelled
                }
                // a stop request wins over whatever the driver finished with
                _ if handle.phase() == Some(JobPhase::Stopping) => JobOutcome::Cancelled,
                Ok(output) => JobOutcome::Succeeded(output),
                Err(err) => JobOutcome::Failed(err),
            };
            handle.set_phase(outcome.phase());
            counters.record(&outcome);

            let report = JobReport {
                id: task_id,
                class,
                label: task_label,
                elapsed: submitted.elapsed(),
                outcome,
            };
            match &report.outcome {
                JobOutcome::Failed(err) => {
                    warn!(job_id = %report.id, %class, code = err.code(), "{}", report.message())
                }
                _ => info!(job_id = %report.id, %class, phase = %report.phase(), "{}", report.message()),
            }

            drop(registration);
            token.release();
            // the caller may have stopped listening
            let _ = report_tx.send(report);
        });

        Ok(JobTicket {
            id,
            class,
            label,
            submitted,
            report: report_rx,
        })
    }

    /// Request a graceful stop; false for unknown or finished jobs
    pub fn stop(&self, id: &JobId) -> bool {
        let stopped = self.registry.request_stop(id);
        if stopped {
            info!(job_id = %id, "stop requested");
        }
        stopped
    }

    /// Request a stop for every live job
    pub fn stop_all(&self) -> usize {
        let count = self.registry.stop_all();
        if count > 0 {
            info!(count, "stop requested for all jobs");
        }
        count
    }

    pub fn snapshot(&self) -> Vec<JobInfo> {
        self.registry.snapshot()
    }

    pub fn get(&self, id: &JobId) -> Option<JobInfo> {
        self.registry.get(id)
    }

    pub fn gate_status(&self) -> Vec<GateStatus> {
        self.gate.status()
    }

    pub fn totals(&self) -> JobTotals {
        self.counters.totals()
    }
}

async fn drive(
    settings: Arc<OrchestratorSettings>,
    request: JobRequest,
    mut ctx: JobContext,
) -> Result<JobOutput, JobError> {
    let class = request.class();
    let unavailable = || JobError::InvalidInput(format!("{} jobs are unavailable on this host", class));
    match request {
        JobRequest::Fetch(params) => {
            let fetch = settings.fetch.as_ref().ok_or_else(unavailable)?;
            run_fetch(fetch, &params, &mut ctx).await.map(JobOutput::Fetch)
        }
        JobRequest::Transcode(params) => {
            let encode = settings.transcode.as_ref().ok_or_else(unavailable)?;
            run_transcode(encode, &params, &mut ctx)
                .await
                .map(JobOutput::Transcode)
        }
        JobRequest::Transfer(params) => {
            ctx.mark_running(None);
            let cancel = ctx.cancel_signal();
            let receipt = settings
                .transfer
                .upload(&params.source, params.max_retries, cancel, &mut ctx)
                .await?;
            Ok(JobOutput::Transfer(receipt))
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::registry::Registration;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    pub type Events = Arc<Mutex<Vec<(u8, String, String)>>>;

    /// Write an executable `/bin/sh` script standing in for an external tool
    pub fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    pub fn recording_sink() -> (ProgressSink, Events) {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        let sink: ProgressSink = Arc::new(move |percent: u8, rate: &str, eta: &str| {
            sink_events
                .lock()
                .unwrap()
                .push((percent, rate.to_string(), eta.to_string()));
        });
        (sink, events)
    }

    /// A registered job and a context recording every emitted event
    pub fn test_context(class: JobClass) -> (JobRegistry, Registration, JobContext, Events) {
        let registry = JobRegistry::new();
        let registration = registry
            .register(JobId::generate(class), class, "test")
            .unwrap();
        let (sink, events) = recording_sink();
        let ctx = JobContext::new(registration.handle(), registration.cancel_signal(), sink);
        (registry, registration, ctx, events)
    }
}
