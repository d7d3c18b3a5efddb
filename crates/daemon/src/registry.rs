//! Registry of live jobs
//!
//! A job is visible from the moment it is admitted until its terminal report
//! has been delivered. Registration is tied to a [`Registration`] guard, so a
//! job leaves the registry exactly once however its task ends.

use crate::job::{JobClass, JobId, JobInfo, JobPhase};
use crate::progress::Progress;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("job {0} is already registered")]
    Duplicate(JobId),
}

/// Receiving side of a job's stop request
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    /// Handle/signal pair not attached to any registry
    pub fn pair() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle(tx), CancelSignal(rx))
    }

    /// A signal that never fires
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        CancelSignal(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once a stop has been requested; pends forever if the
    /// requesting side is gone.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Sending side of a job's stop request
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

#[derive(Debug)]
struct JobEntry {
    class: JobClass,
    label: String,
    phase: JobPhase,
    started: Instant,
    started_at_unix_ms: i64,
    pid: Option<u32>,
    last_progress: Option<Progress>,
    cancel: CancelHandle,
}

impl JobEntry {
    fn info(&self, id: &JobId) -> JobInfo {
        JobInfo {
            id: id.clone(),
            class: self.class,
            label: self.label.clone(),
            phase: self.phase,
            started_at_unix_ms: self.started_at_unix_ms,
            elapsed_secs: self.started.elapsed().as_secs(),
            pid: self.pid,
            last_progress: self.last_progress.clone(),
        }
    }
}

/// Concurrent map of live jobs; cheap to clone
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    inner: Arc<RwLock<HashMap<JobId, JobEntry>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave an entry half-written, so
    // poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, JobEntry>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, JobEntry>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a `Pending` entry; the returned guard unregisters on drop
    pub fn register(
        &self,
        id: JobId,
        class: JobClass,
        label: impl Into<String>,
    ) -> Result<Registration, RegistryError> {
        let mut jobs = self.write();
        if jobs.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }

        let (cancel, signal) = CancelSignal::pair();
        let started_at_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        jobs.insert(
            id.clone(),
            JobEntry {
                class,
                label: label.into(),
                phase: JobPhase::Pending,
                started: Instant::now(),
                started_at_unix_ms,
                pid: None,
                last_progress: None,
                cancel,
            },
        );
        debug!(job_id = %id, %class, "job registered");

        Ok(Registration {
            handle: JobHandle {
                registry: self.clone(),
                id,
            },
            signal,
        })
    }

    pub fn get(&self, id: &JobId) -> Option<JobInfo> {
        self.read().get(id).map(|entry| entry.info(id))
    }

    /// Every live job, oldest first
    pub fn snapshot(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self
            .read()
            .iter()
            .map(|(id, entry)| entry.info(id))
            .collect();
        jobs.sort_by(|a, b| {
            a.started_at_unix_ms
                .cmp(&b.started_at_unix_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        jobs
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Move a live job to `Stopping` and fire its cancel signal
    ///
    /// Returns false for unknown or already-terminal jobs. Repeated requests
    /// for a job that is already stopping return true.
    pub fn request_stop(&self, id: &JobId) -> bool {
        let mut jobs = self.write();
        let Some(entry) = jobs.get_mut(id) else {
            return false;
        };
        match entry.phase {
            JobPhase::Stopping => true,
            JobPhase::Pending | JobPhase::Running => {
                entry.phase = JobPhase::Stopping;
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Request a stop for every live job; returns how many were signalled
    pub fn stop_all(&self) -> usize {
        let ids: Vec<JobId> = self.read().keys().cloned().collect();
        ids.iter().filter(|id| self.request_stop(id)).count()
    }

    fn set_phase(&self, id: &JobId, next: JobPhase) -> bool {
        let mut jobs = self.write();
        match jobs.get_mut(id) {
            Some(entry) if entry.phase.can_transition_to(next) => {
                entry.phase = next;
                true
            }
            _ => false,
        }
    }

    fn phase(&self, id: &JobId) -> Option<JobPhase> {
        self.read().get(id).map(|entry| entry.phase)
    }

    fn update<F: FnOnce(&mut JobEntry)>(&self, id: &JobId, f: F) {
        if let Some(entry) = self.write().get_mut(id) {
            f(entry);
        }
    }

    fn unregister(&self, id: &JobId) {
        if self.write().remove(id).is_some() {
            debug!(job_id = %id, "job unregistered");
        }
    }
}

/// Cloneable accessor for one registered job
#[derive(Debug, Clone)]
pub struct JobHandle {
    registry: JobRegistry,
    id: JobId,
}

impl JobHandle {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn phase(&self) -> Option<JobPhase> {
        self.registry.phase(&self.id)
    }

    /// Apply a transition if the state machine allows it
    pub fn set_phase(&self, next: JobPhase) -> bool {
        self.registry.set_phase(&self.id, next)
    }

    pub fn set_pid(&self, pid: Option<u32>) {
        self.registry.update(&self.id, |entry| entry.pid = pid);
    }

    pub fn record_progress(&self, progress: &Progress) {
        self.registry
            .update(&self.id, |entry| entry.last_progress = Some(progress.clone()));
    }
}

/// Owning guard for a registry entry
#[derive(Debug)]
pub struct Registration {
    handle: JobHandle,
    signal: CancelSignal,
}

impl Registration {
    pub fn id(&self) -> &JobId {
        &self.handle.id
    }

    pub fn handle(&self) -> JobHandle {
        self.handle.clone()
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.signal.clone()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.handle.registry.unregister(&self.handle.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_drop_unregisters() {
        let registry = JobRegistry::new();
        let id = JobId::from("F-00000001");
        let reg = registry
            .register(id.clone(), JobClass::Fetch, "episode")
            .unwrap();

        let info = registry.get(&id).expect("registered");
        assert_eq!(info.phase, JobPhase::Pending);
        assert_eq!(info.label, "episode");

        drop(reg);
        assert!(registry.get(&id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = JobRegistry::new();
        let id = JobId::from("T-00000001");
        let _reg = registry.register(id.clone(), JobClass::Transcode, "a").unwrap();
        let err = registry
            .register(id.clone(), JobClass::Transcode, "b")
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate(id));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stop_moves_to_stopping_and_fires_signal() {
        let registry = JobRegistry::new();
        let id = JobId::from("U-00000001");
        let reg = registry.register(id.clone(), JobClass::Transfer, "x").unwrap();
        let handle = reg.handle();
        let signal = reg.cancel_signal();

        assert!(handle.set_phase(JobPhase::Running));
        assert!(!signal.is_cancelled());

        assert!(registry.request_stop(&id));
        assert!(signal.is_cancelled());
        assert_eq!(handle.phase(), Some(JobPhase::Stopping));
        // Idempotent while stopping
        assert!(registry.request_stop(&id));
        // Stopping can only resolve to Cancelled
        assert!(!handle.set_phase(JobPhase::Succeeded));
        assert!(handle.set_phase(JobPhase::Cancelled));
        assert!(!registry.request_stop(&id));
    }

    #[test]
    fn test_stop_unknown_job() {
        let registry = JobRegistry::new();
        assert!(!registry.request_stop(&JobId::from("F-FFFFFFFF")));
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let registry = JobRegistry::new();
        let a = registry.register(JobId::from("F-A"), JobClass::Fetch, "a").unwrap();
        let _b = registry.register(JobId::from("F-B"), JobClass::Fetch, "b").unwrap();

        let snapshot = registry.snapshot();
        a.handle().record_progress(&Progress::new(40, "1.0MiB/s", Some(30)));
        drop(a);

        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|job| job.last_progress.is_none()));
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn test_stop_all_signals_live_jobs() {
        let registry = JobRegistry::new();
        let regs: Vec<_> = (0..3)
            .map(|i| {
                registry
                    .register(JobId::from(format!("F-{i}")), JobClass::Fetch, "x")
                    .unwrap()
            })
            .collect();
        assert_eq!(registry.stop_all(), 3);
        assert!(regs.iter().all(|r| r.cancel_signal().is_cancelled()));
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves_after_stop() {
        let (handle, mut signal) = CancelSignal::pair();
        let waiter = tokio::spawn(async move {
            signal.cancelled().await;
            true
        });
        tokio::task::yield_now().await;
        handle.cancel();
        assert!(waiter.await.unwrap());
    }
}
