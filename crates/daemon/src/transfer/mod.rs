//! Chunked, resumable uploads to remote storage
//!
//! [`TransferEngine`] drives any [`TransferClient`]: it sizes chunks, retries
//! transient chunk failures with backoff, recovers once from expired
//! credentials, detects stalls, and restarts whole attempts on server or
//! network failures.

pub mod chunk;
pub mod client;
pub mod drive;

pub use chunk::{chunk_size_for, mime_type_for, ChunkReader};
pub use client::{
    classify_status, ChunkAck, RemoteObject, TransferClient, TransferError, UploadRequest, UploadSession,
};
pub use drive::{AuthorizedUser, CredentialsError, DriveClient};

use crate::progress::{transfer_progress, Progress, ProgressTracker};
use crate::registry::CancelSignal;
use crate::retry::{ErrorKind, RetryDecision, RetryPolicy};
use media_relay_config::TransferConfig;
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Classified upload failure
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("transfer client unavailable: {0}")]
    Unavailable(String),

    #[error("source file not found: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("source file is empty: {}", .0.display())]
    EmptySource(PathBuf),

    #[error("file too large: {size} bytes (limit {limit})")]
    TooLarge { size: u64, limit: u64 },

    #[error("quota or rate limit exceeded: {0}")]
    Quota(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("remote server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    /// The upload session disappeared; a new attempt starts from zero
    #[error("upload session lost: {0}")]
    SessionLost(String),

    #[error("upload stalled after {steps} steps without progress")]
    Stalled { steps: u32 },

    #[error("upload cancelled")]
    Cancelled,

    #[error("failed to read source: {0}")]
    Io(#[from] std::io::Error),

    #[error("upload failed: {0}")]
    Other(String),
}

impl UploadError {
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::Unavailable(_) => "transfer_unavailable",
            UploadError::SourceMissing(_) | UploadError::EmptySource(_) | UploadError::TooLarge { .. } => {
                "invalid_input"
            }
            UploadError::Quota(_) => "quota_exceeded",
            UploadError::Permission(_) => "permission_denied",
            UploadError::Authentication(_) => "authentication_failed",
            UploadError::Server { .. } => "server_error",
            UploadError::Network(_) => "network_error",
            UploadError::SessionLost(_) => "session_lost",
            UploadError::Stalled { .. } => "stalled_transfer",
            UploadError::Cancelled => "cancelled",
            UploadError::Io(_) => "io_error",
            UploadError::Other(_) => "runtime_failure",
        }
    }

    /// Kind used to decide whether a whole new attempt is worthwhile
    fn attempt_kind(&self) -> ErrorKind {
        match self {
            UploadError::Server { status, .. } => ErrorKind::Server(*status),
            UploadError::Network(_) | UploadError::SessionLost(_) => ErrorKind::Connection,
            _ => ErrorKind::Other,
        }
    }
}

impl From<TransferError> for UploadError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::AuthExpired(m) => UploadError::Authentication(m),
            TransferError::RateLimited(m) => UploadError::Quota(format!("rate limited: {}", m)),
            TransferError::QuotaExceeded(m) => UploadError::Quota(m),
            TransferError::PermissionDenied(m) => UploadError::Permission(m),
            TransferError::NotFound(m) => UploadError::SessionLost(m),
            TransferError::Server { status, message } => UploadError::Server { status, message },
            TransferError::Network(m) => UploadError::Network(m),
            TransferError::Protocol(m) => UploadError::Other(m),
        }
    }
}

/// Parameters for one upload
#[derive(Debug, Clone, PartialEq)]
pub struct TransferParams {
    pub source: PathBuf,
    /// Whole-upload attempts; the configured default when `None`
    pub max_retries: Option<u32>,
}

impl TransferParams {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            max_retries: None,
        }
    }

    pub fn label(&self) -> String {
        self.source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.source.display().to_string())
    }
}

/// Receives upload progress; only forward movement is reported
pub trait TransferObserver: Send {
    fn on_progress(&mut self, progress: Progress);
}

/// Successful upload summary
#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub remote_id: String,
    pub remote_name: String,
    pub size_bytes: u64,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
    pub average_rate_bytes: f64,
    pub view_url: String,
    pub download_url: String,
    pub shared: bool,
    pub attempts: u32,
    pub chunk_retries: u32,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

/// Engine limits
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub max_retries: u32,
    pub max_file_size: u64,
    pub stall_limit: u32,
    pub chunk_policy: RetryPolicy,
    pub attempt_policy: RetryPolicy,
    /// Fixed chunk size instead of the size tiers
    pub chunk_size: Option<u64>,
}

impl TransferSettings {
    pub fn from_config(cfg: &TransferConfig) -> Self {
        Self {
            max_retries: cfg.max_retries.max(1),
            max_file_size: cfg.max_file_size_bytes,
            stall_limit: cfg.stall_limit,
            chunk_policy: RetryPolicy::for_chunks(cfg),
            attempt_policy: RetryPolicy::for_uploads(cfg, cfg.max_retries),
            chunk_size: None,
        }
    }
}

/// Counters carried across attempts
struct UploadRun<'a, O: TransferObserver + ?Sized> {
    path: &'a Path,
    request: UploadRequest,
    chunk_size: u64,
    started: Instant,
    tracker: ProgressTracker,
    chunk_retries: u32,
    cancel: CancelSignal,
    observer: &'a mut O,
}

impl<O: TransferObserver + ?Sized> UploadRun<'_, O> {
    fn report(&mut self, committed: u64) {
        let progress = transfer_progress(committed, self.request.size, self.started.elapsed());
        if let Some(progress) = self.tracker.advance(progress) {
            self.observer.on_progress(progress);
        }
    }

    /// Sleep unless cancelled first
    async fn pause(&mut self, delay: Duration) -> Result<(), UploadError> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.cancel.cancelled() => Err(UploadError::Cancelled),
        }
    }
}

/// Await `call` unless a stop arrives first; the call is dropped on stop
async fn unless_cancelled<F: Future>(cancel: &mut CancelSignal, call: F) -> Result<F::Output, UploadError> {
    tokio::select! {
        output = call => Ok(output),
        _ = cancel.cancelled() => Err(UploadError::Cancelled),
    }
}

/// Resumable upload driver over a [`TransferClient`]
#[derive(Clone)]
pub struct TransferEngine {
    client: Option<Arc<dyn TransferClient>>,
    settings: TransferSettings,
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("available", &self.client.is_some())
            .field("settings", &self.settings)
            .finish()
    }
}

impl TransferEngine {
    pub fn new(client: Option<Arc<dyn TransferClient>>, settings: TransferSettings) -> Self {
        Self { client, settings }
    }

    pub fn is_available(&self) -> bool {
        self.client.is_some()
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Upload `path`, retrying whole attempts up to `max_retries` times
    pub async fn upload<O: TransferObserver + ?Sized>(
        &self,
        path: &Path,
        max_retries: Option<u32>,
        cancel: CancelSignal,
        observer: &mut O,
    ) -> Result<UploadReceipt, UploadError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| UploadError::Unavailable("no credentials configured".to_string()))?;

        let size = match tokio::fs::metadata(path).await {
            Ok(m) if m.is_file() => m.len(),
            _ => return Err(UploadError::SourceMissing(path.to_path_buf())),
        };
        if size == 0 {
            return Err(UploadError::EmptySource(path.to_path_buf()));
        }
        if size > self.settings.max_file_size {
            return Err(UploadError::TooLarge {
                size,
                limit: self.settings.max_file_size,
            });
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());
        let mut run = UploadRun {
            path,
            request: UploadRequest {
                name,
                mime_type: mime_type_for(path).to_string(),
                size,
            },
            chunk_size: self.settings.chunk_size.unwrap_or_else(|| chunk_size_for(size)).max(1),
            started: Instant::now(),
            tracker: ProgressTracker::new(),
            chunk_retries: 0,
            cancel,
            observer,
        };
        run.report(0);

        let attempt_policy = RetryPolicy {
            max_attempts: max_retries.unwrap_or(self.settings.max_retries).max(1),
            ..self.settings.attempt_policy
        };
        let mut attempt = 1;
        let object = loop {
            if run.cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            info!(file = %run.request.name, size, attempt, "upload attempt started");
            match self.attempt(client.as_ref(), &mut run).await {
                Ok(object) => break object,
                Err(err) => match attempt_policy.decide(attempt, err.attempt_kind()) {
                    RetryDecision::NoRetry => return Err(err),
                    RetryDecision::RetryAfter(delay) => {
                        warn!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "upload attempt failed, retrying");
                        run.pause(delay).await?;
                        attempt += 1;
                    }
                },
            }
        };

        let shared = match unless_cancelled(&mut run.cancel, client.share_publicly(&object)).await? {
            Ok(()) => true,
            Err(e) => {
                warn!(id = %object.id, error = %e, "could not make upload public");
                false
            }
        };

        let elapsed = run.started.elapsed();
        let secs = elapsed.as_secs_f64();
        Ok(UploadReceipt {
            view_url: client.view_url(&object),
            download_url: client.download_url(&object),
            remote_name: if object.name.is_empty() {
                run.request.name.clone()
            } else {
                object.name.clone()
            },
            remote_id: object.id,
            size_bytes: size,
            elapsed,
            average_rate_bytes: if secs > 0.0 { size as f64 / secs } else { 0.0 },
            shared,
            attempts: attempt,
            chunk_retries: run.chunk_retries,
        })
    }

    /// One session from first byte to completion
    async fn attempt<O: TransferObserver + ?Sized>(
        &self,
        client: &dyn TransferClient,
        run: &mut UploadRun<'_, O>,
    ) -> Result<RemoteObject, UploadError> {
        let mut reauthenticated = false;
        let session = loop {
            match unless_cancelled(&mut run.cancel, client.begin(&run.request)).await? {
                Ok(session) => break session,
                Err(TransferError::AuthExpired(m)) if !reauthenticated => {
                    warn!(error = %m, "credentials expired, re-authenticating");
                    unless_cancelled(&mut run.cancel, client.reauthenticate()).await??;
                    reauthenticated = true;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let mut reader = ChunkReader::open(run.path).await?;
        let total = run.request.size;
        let mut offset = 0u64;
        let mut chunk_attempt = 1u32;
        let mut stalled_steps = 0u32;

        loop {
            if run.cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            let data = reader.read_at(offset, run.chunk_size).await?;
            let result = unless_cancelled(&mut run.cancel, client.send_chunk(&session, offset, data, total)).await?;

            let committed = match result {
                Ok(ChunkAck::Complete(object)) => {
                    run.report(total);
                    debug!(id = %object.id, "upload committed");
                    return Ok(object);
                }
                Ok(ChunkAck::Incomplete { committed }) => {
                    chunk_attempt = 1;
                    committed
                }
                Err(TransferError::AuthExpired(m)) => {
                    if reauthenticated {
                        return Err(UploadError::Authentication(m));
                    }
                    warn!(error = %m, offset, "credentials expired mid-upload, re-authenticating");
                    unless_cancelled(&mut run.cancel, client.reauthenticate()).await??;
                    reauthenticated = true;
                    match unless_cancelled(&mut run.cancel, client.query_offset(&session, total)).await?? {
                        ChunkAck::Complete(object) => {
                            run.report(total);
                            return Ok(object);
                        }
                        ChunkAck::Incomplete { committed } => committed,
                    }
                }
                Err(e) => match self.settings.chunk_policy.decide(chunk_attempt, e.kind()) {
                    RetryDecision::NoRetry => return Err(e.into()),
                    RetryDecision::RetryAfter(delay) => {
                        run.chunk_retries += 1;
                        chunk_attempt += 1;
                        warn!(offset, error = %e, delay_ms = delay.as_millis() as u64, "chunk failed, retrying");
                        run.pause(delay).await?;
                        continue;
                    }
                },
            };

            if committed > offset {
                stalled_steps = 0;
            } else {
                stalled_steps += 1;
                if stalled_steps > self.settings.stall_limit {
                    return Err(UploadError::Stalled { steps: stalled_steps });
                }
            }
            offset = committed.min(total);
            run.report(offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// In-memory store with scripted failures
    #[derive(Default)]
    struct FakeClient {
        state: Mutex<FakeState>,
    }

    #[derive(Default)]
    struct FakeState {
        committed: u64,
        chunk_calls: u32,
        /// Errors returned by the n-th send_chunk call (1-based)
        failures: Vec<(u32, TransferError)>,
        /// Every call fails with this once past the given call number
        persistent: Option<(u32, TransferError)>,
        /// Acknowledge chunks without committing anything
        swallow: bool,
        reauths: u32,
        begins: u32,
        share_fails: bool,
        shares: u32,
        /// Every send_chunk call takes this long
        chunk_delay: Option<Duration>,
    }

    impl FakeClient {
        fn with(f: impl FnOnce(&mut FakeState)) -> Arc<Self> {
            let client = Self::default();
            f(&mut client.state.lock().unwrap());
            Arc::new(client)
        }
    }

    #[async_trait]
    impl TransferClient for FakeClient {
        async fn begin(&self, _request: &UploadRequest) -> Result<UploadSession, TransferError> {
            let mut state = self.state.lock().unwrap();
            state.begins += 1;
            state.committed = 0;
            Ok(UploadSession {
                uri: format!("session-{}", state.begins),
            })
        }

        async fn send_chunk(
            &self,
            _session: &UploadSession,
            offset: u64,
            data: Vec<u8>,
            total: u64,
        ) -> Result<ChunkAck, TransferError> {
            let delay = self.state.lock().unwrap().chunk_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut state = self.state.lock().unwrap();
            state.chunk_calls += 1;
            let call = state.chunk_calls;
            if let Some(pos) = state.failures.iter().position(|(n, _)| *n == call) {
                return Err(state.failures.remove(pos).1);
            }
            if let Some((from, err)) = &state.persistent {
                if call >= *from {
                    return Err(err.clone());
                }
            }
            if state.swallow {
                return Ok(ChunkAck::Incomplete {
                    committed: state.committed,
                });
            }
            assert_eq!(offset, state.committed, "chunk must resume at committed offset");
            state.committed = offset + data.len() as u64;
            if state.committed >= total {
                Ok(ChunkAck::Complete(RemoteObject {
                    id: "file-1".into(),
                    name: "ep.mp4".into(),
                }))
            } else {
                Ok(ChunkAck::Incomplete {
                    committed: state.committed,
                })
            }
        }

        async fn query_offset(&self, _session: &UploadSession, _total: u64) -> Result<ChunkAck, TransferError> {
            Ok(ChunkAck::Incomplete {
                committed: self.state.lock().unwrap().committed,
            })
        }

        async fn reauthenticate(&self) -> Result<(), TransferError> {
            self.state.lock().unwrap().reauths += 1;
            Ok(())
        }

        async fn share_publicly(&self, _object: &RemoteObject) -> Result<(), TransferError> {
            let mut state = self.state.lock().unwrap();
            state.shares += 1;
            if state.share_fails {
                Err(TransferError::PermissionDenied("sharing disabled".into()))
            } else {
                Ok(())
            }
        }

        fn view_url(&self, object: &RemoteObject) -> String {
            format!("https://example.test/{}/view", object.id)
        }

        fn download_url(&self, object: &RemoteObject) -> String {
            format!("https://example.test/{}/download", object.id)
        }
    }

    #[derive(Default)]
    struct Percents(Vec<u8>);

    impl TransferObserver for Percents {
        fn on_progress(&mut self, progress: Progress) {
            self.0.push(progress.percent);
        }
    }

    const CHUNK: u64 = 4096;

    fn settings() -> TransferSettings {
        let fast = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            retryable: crate::retry::TRANSIENT,
        };
        TransferSettings {
            max_retries: 3,
            max_file_size: 1024 * 1024,
            stall_limit: 50,
            chunk_policy: fast,
            attempt_policy: fast,
            chunk_size: Some(CHUNK),
        }
    }

    fn source(tmp: &TempDir, len: u64) -> PathBuf {
        let path = tmp.path().join("ep.mp4");
        std::fs::write(&path, vec![7u8; len as usize]).unwrap();
        path
    }

    fn engine(client: Arc<FakeClient>) -> TransferEngine {
        TransferEngine::new(Some(client as Arc<dyn TransferClient>), settings())
    }

    #[tokio::test]
    async fn test_transient_chunk_failures_are_retried() {
        let tmp = TempDir::new().unwrap();
        let path = source(&tmp, 10 * CHUNK);
        let server = |msg: &str| TransferError::Server {
            status: 500,
            message: msg.into(),
        };
        let client = FakeClient::with(|s| s.failures = vec![(4, server("a")), (5, server("b"))]);
        let mut percents = Percents::default();

        let receipt = engine(client.clone())
            .upload(&path, None, CancelSignal::never(), &mut percents)
            .await
            .unwrap();

        assert_eq!(receipt.chunk_retries, 2);
        assert_eq!(receipt.attempts, 1);
        assert_eq!(receipt.size_bytes, 10 * CHUNK);
        assert_eq!(receipt.remote_id, "file-1");
        assert!(receipt.shared);
        assert!(percents.0.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(percents.0.first(), Some(&0));
        assert_eq!(percents.0.last(), Some(&100));
    }

    #[tokio::test]
    async fn test_auth_expiry_recovers_once() {
        let tmp = TempDir::new().unwrap();
        let path = source(&tmp, 3 * CHUNK);
        let client = FakeClient::with(|s| {
            s.failures = vec![(2, TransferError::AuthExpired("token expired".into()))]
        });

        let receipt = engine(client.clone())
            .upload(&path, None, CancelSignal::never(), &mut Percents::default())
            .await
            .unwrap();

        assert_eq!(client.state.lock().unwrap().reauths, 1);
        assert_eq!(receipt.chunk_retries, 0);
    }

    #[tokio::test]
    async fn test_repeated_auth_expiry_fails() {
        let tmp = TempDir::new().unwrap();
        let path = source(&tmp, 3 * CHUNK);
        let client = FakeClient::with(|s| {
            s.persistent = Some((2, TransferError::AuthExpired("revoked".into())))
        });

        let err = engine(client.clone())
            .upload(&path, None, CancelSignal::never(), &mut Percents::default())
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Authentication(_)));
        assert_eq!(client.state.lock().unwrap().reauths, 1);
    }

    #[tokio::test]
    async fn test_quota_is_not_retried() {
        let tmp = TempDir::new().unwrap();
        let path = source(&tmp, 2 * CHUNK);
        let client = FakeClient::with(|s| {
            s.persistent = Some((1, TransferError::QuotaExceeded("storage full".into())))
        });

        let err = engine(client.clone())
            .upload(&path, None, CancelSignal::never(), &mut Percents::default())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "quota_exceeded");
        assert_eq!(client.state.lock().unwrap().begins, 1);
    }

    #[tokio::test]
    async fn test_persistent_server_errors_restart_attempts() {
        let tmp = TempDir::new().unwrap();
        let path = source(&tmp, 2 * CHUNK);
        let client = FakeClient::with(|s| {
            s.persistent = Some((
                1,
                TransferError::Server {
                    status: 502,
                    message: "bad gateway".into(),
                },
            ))
        });

        let err = engine(client.clone())
            .upload(&path, Some(2), CancelSignal::never(), &mut Percents::default())
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Server { status: 502, .. }));
        assert_eq!(client.state.lock().unwrap().begins, 2);
    }

    #[tokio::test]
    async fn test_no_forward_progress_is_a_stall() {
        let tmp = TempDir::new().unwrap();
        let path = source(&tmp, 2 * CHUNK);
        let client = FakeClient::with(|s| s.swallow = true);

        let err = engine(client)
            .upload(&path, None, CancelSignal::never(), &mut Percents::default())
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Stalled { steps: 51 }));
    }

    #[tokio::test]
    async fn test_share_failure_only_warns() {
        let tmp = TempDir::new().unwrap();
        let path = source(&tmp, CHUNK);
        let client = FakeClient::with(|s| s.share_fails = true);

        let receipt = engine(client)
            .upload(&path, None, CancelSignal::never(), &mut Percents::default())
            .await
            .unwrap();

        assert!(!receipt.shared);
        assert_eq!(receipt.view_url, "https://example.test/file-1/view");
    }

    #[tokio::test]
    async fn test_input_validation() {
        let tmp = TempDir::new().unwrap();
        let empty = tmp.path().join("empty.mp4");
        std::fs::write(&empty, b"").unwrap();
        let big = tmp.path().join("big.mp4");
        std::fs::File::create(&big).unwrap().set_len(2 * 1024 * 1024).unwrap();
        let engine = engine(FakeClient::with(|_| {}));

        for (path, code) in [
            (tmp.path().join("missing.mp4"), "invalid_input"),
            (empty, "invalid_input"),
            (big, "invalid_input"),
        ] {
            let err = engine
                .upload(&path, None, CancelSignal::never(), &mut Percents::default())
                .await
                .unwrap_err();
            assert_eq!(err.code(), code);
        }
    }

    #[tokio::test]
    async fn test_without_client_refuses_to_start() {
        let tmp = TempDir::new().unwrap();
        let path = source(&tmp, CHUNK);
        let engine = TransferEngine::new(None, settings());

        let err = engine
            .upload(&path, None, CancelSignal::never(), &mut Percents::default())
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Unavailable(_)));
        assert!(!engine.is_available());
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let tmp = TempDir::new().unwrap();
        let path = source(&tmp, 4 * CHUNK);
        let (handle, signal) = CancelSignal::pair();
        handle.cancel();

        let err = engine(FakeClient::with(|_| {}))
            .upload(&path, None, signal, &mut Percents::default())
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Cancelled));
    }

    #[tokio::test]
    async fn test_stop_interrupts_slow_chunk() {
        let tmp = TempDir::new().unwrap();
        let path = source(&tmp, 4 * CHUNK);
        let client = FakeClient::with(|s| s.chunk_delay = Some(Duration::from_secs(20)));
        let (handle, signal) = CancelSignal::pair();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.cancel();
            handle
        });

        let started = Instant::now();
        let err = engine(client.clone())
            .upload(&path, None, signal, &mut Percents::default())
            .await
            .unwrap_err();
        let _handle = stopper.await.unwrap();

        assert!(matches!(err, UploadError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
        let state = client.state.lock().unwrap();
        assert_eq!(state.committed, 0);
        assert_eq!(state.shares, 0);
    }
}
