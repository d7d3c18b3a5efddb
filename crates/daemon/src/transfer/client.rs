//! Remote storage seam for resumable uploads.

use crate::retry::ErrorKind;
use async_trait::async_trait;
use thiserror::Error;

/// Metadata announced when a session is opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
}

/// Handle of an open resumable session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub uri: String,
}

/// The stored object once the last byte is committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub id: String,
    pub name: String,
}

/// Server's answer to a chunk or status query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkAck {
    /// Bytes `0..committed` are stored; continue from `committed`
    Incomplete { committed: u64 },
    Complete(RemoteObject),
}

/// Error reported by a transfer client call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("authentication expired: {0}")]
    AuthExpired(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The session or object no longer exists
    #[error("not found: {0}")]
    NotFound(String),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::AuthExpired(_) => ErrorKind::Auth,
            TransferError::RateLimited(_) => ErrorKind::Throttled,
            TransferError::Server { status, .. } => ErrorKind::Server(*status),
            TransferError::Network(_) => ErrorKind::Connection,
            TransferError::QuotaExceeded(_)
            | TransferError::PermissionDenied(_)
            | TransferError::NotFound(_)
            | TransferError::Protocol(_) => ErrorKind::Other,
        }
    }
}

/// Classify a non-success HTTP response
pub fn classify_status(status: u16, body: &str) -> TransferError {
    let message = summarize_body(body);
    match status {
        401 => TransferError::AuthExpired(message),
        403 if body.contains("rateLimitExceeded") || body.contains("userRateLimitExceeded") => {
            TransferError::RateLimited(message)
        }
        403 if body.to_lowercase().contains("quota") => TransferError::QuotaExceeded(message),
        403 => TransferError::PermissionDenied(message),
        404 | 410 => TransferError::NotFound(message),
        429 => TransferError::RateLimited(message),
        500..=599 => TransferError::Server { status, message },
        _ => TransferError::Protocol(format!("HTTP {}: {}", status, message)),
    }
}

fn summarize_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= 200 {
        return trimmed.to_string();
    }
    let mut end = 200;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}

/// A remote store that accepts resumable chunked uploads
#[async_trait]
pub trait TransferClient: Send + Sync {
    /// Open a session for `request`
    async fn begin(&self, request: &UploadRequest) -> Result<UploadSession, TransferError>;

    /// Send `data` starting at `offset` of a `total`-byte upload
    async fn send_chunk(
        &self,
        session: &UploadSession,
        offset: u64,
        data: Vec<u8>,
        total: u64,
    ) -> Result<ChunkAck, TransferError>;

    /// Ask how much of the upload the server has committed
    async fn query_offset(&self, session: &UploadSession, total: u64) -> Result<ChunkAck, TransferError>;

    /// Refresh credentials after `AuthExpired`
    async fn reauthenticate(&self) -> Result<(), TransferError>;

    /// Make the object readable by anyone with the link
    async fn share_publicly(&self, object: &RemoteObject) -> Result<(), TransferError>;

    fn view_url(&self, object: &RemoteObject) -> String;

    fn download_url(&self, object: &RemoteObject) -> String;
}
