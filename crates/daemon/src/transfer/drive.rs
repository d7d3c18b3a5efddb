//! Google Drive resumable upload client.
//!
//! Speaks the resumable protocol directly over HTTP: one POST opens the
//! session, each chunk is a PUT with `Content-Range`, a `308` carries the
//! committed `Range`, and the final `200`/`201` returns the file resource.

use super::client::{
    classify_status, ChunkAck, RemoteObject, TransferClient, TransferError, UploadRequest, UploadSession,
};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_RANGE, LOCATION, RANGE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

const UPLOAD_ENDPOINT: &str =
    "https://www.googleapis.com/upload/drive/v3/files?uploadType=resumable&fields=id,name";
const FILES_ENDPOINT: &str = "https://www.googleapis.com/drive/v3/files";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("cannot read token file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid token file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// OAuth2 authorized-user credentials as written by the consent flow
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizedUser {
    /// Last access token, possibly expired
    #[serde(default)]
    pub token: Option<String>,
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl AuthorizedUser {
    pub fn load(path: &Path) -> Result<Self, CredentialsError> {
        let content = std::fs::read_to_string(path).map_err(|source| CredentialsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| CredentialsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct FileResource {
    id: String,
    #[serde(default)]
    name: String,
}

/// Parse a `Range: bytes=0-N` header into the committed byte count
pub fn committed_from_range(range: Option<&str>) -> u64 {
    range
        .and_then(|r| r.trim().strip_prefix("bytes="))
        .and_then(|r| r.split('-').nth(1))
        .and_then(|end| end.trim().parse::<u64>().ok())
        .map(|end| end + 1)
        .unwrap_or(0)
}

fn network(err: reqwest::Error) -> TransferError {
    if err.is_timeout() {
        TransferError::Network(format!("request timed out: {}", err))
    } else {
        TransferError::Network(err.to_string())
    }
}

/// Drive client holding a refreshable access token
#[derive(Debug)]
pub struct DriveClient {
    http: Client,
    credentials: AuthorizedUser,
    access_token: RwLock<Option<String>>,
}

impl DriveClient {
    pub fn new(credentials: AuthorizedUser) -> Result<Self, CredentialsError> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            // 308 is the resumable protocol's "keep going", not a redirect
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            http,
            access_token: RwLock::new(credentials.token.clone()),
            credentials,
        })
    }

    pub fn from_token_file(path: &Path) -> Result<Self, CredentialsError> {
        let client = Self::new(AuthorizedUser::load(path)?)?;
        info!(token_file = %path.display(), "drive credentials loaded");
        Ok(client)
    }

    async fn bearer(&self) -> Result<String, TransferError> {
        if let Some(token) = self.access_token.read().await.clone() {
            return Ok(token);
        }
        self.refresh().await
    }

    async fn refresh(&self) -> Result<String, TransferError> {
        let response = self
            .http
            .post(&self.credentials.token_uri)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", self.credentials.refresh_token.as_str()),
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(network)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                400 | 401 => TransferError::AuthExpired(format!("token refresh rejected: {}", body.trim())),
                code => classify_status(code, &body),
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| TransferError::Protocol(format!("token response: {}", e)))?;
        *self.access_token.write().await = Some(token.access_token.clone());
        debug!("access token refreshed");
        Ok(token.access_token)
    }

    async fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder, TransferError> {
        Ok(builder.header(AUTHORIZATION, format!("Bearer {}", self.bearer().await?)))
    }

    async fn error_from(response: Response) -> TransferError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        classify_status(status, &body)
    }

    async fn chunk_ack(response: Response) -> Result<ChunkAck, TransferError> {
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                let file: FileResource = response
                    .json()
                    .await
                    .map_err(|e| TransferError::Protocol(format!("file resource: {}", e)))?;
                Ok(ChunkAck::Complete(RemoteObject {
                    id: file.id,
                    name: file.name,
                }))
            }
            StatusCode::PERMANENT_REDIRECT => {
                let range = response
                    .headers()
                    .get(RANGE)
                    .and_then(|v| v.to_str().ok());
                Ok(ChunkAck::Incomplete {
                    committed: committed_from_range(range),
                })
            }
            _ => Err(Self::error_from(response).await),
        }
    }
}

#[async_trait]
impl TransferClient for DriveClient {
    async fn begin(&self, request: &UploadRequest) -> Result<UploadSession, TransferError> {
        let builder = self
            .http
            .post(UPLOAD_ENDPOINT)
            .header("X-Upload-Content-Type", request.mime_type.as_str())
            .header("X-Upload-Content-Length", request.size.to_string())
            .json(&serde_json::json!({ "name": request.name }));
        let response = self.authorized(builder).await?.send().await.map_err(network)?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        let uri = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| TransferError::Protocol("session response without Location".to_string()))?;
        debug!(name = %request.name, size = request.size, "upload session opened");
        Ok(UploadSession { uri })
    }

    async fn send_chunk(
        &self,
        session: &UploadSession,
        offset: u64,
        data: Vec<u8>,
        total: u64,
    ) -> Result<ChunkAck, TransferError> {
        let len = data.len() as u64;
        let range = if len == 0 {
            format!("bytes */{}", total)
        } else {
            format!("bytes {}-{}/{}", offset, offset + len - 1, total)
        };
        let builder = self
            .http
            .put(&session.uri)
            .header(CONTENT_LENGTH, len)
            .header(CONTENT_RANGE, range)
            .body(data);
        let response = self.authorized(builder).await?.send().await.map_err(network)?;
        Self::chunk_ack(response).await
    }

    async fn query_offset(&self, session: &UploadSession, total: u64) -> Result<ChunkAck, TransferError> {
        self.send_chunk(session, 0, Vec::new(), total).await
    }

    async fn reauthenticate(&self) -> Result<(), TransferError> {
        *self.access_token.write().await = None;
        self.refresh().await.map(|_| ())
    }

    async fn share_publicly(&self, object: &RemoteObject) -> Result<(), TransferError> {
        let url = format!("{}/{}/permissions", FILES_ENDPOINT, object.id);
        let builder = self
            .http
            .post(url)
            .json(&serde_json::json!({ "type": "anyone", "role": "reader" }));
        let response = self.authorized(builder).await?.send().await.map_err(network)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_from(response).await)
        }
    }

    fn view_url(&self, object: &RemoteObject) -> String {
        format!("https://drive.google.com/file/d/{}/view", object.id)
    }

    fn download_url(&self, object: &RemoteObject) -> String {
        format!("https://drive.google.com/uc?id={}&export=download", object.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_committed_from_range() {
        assert_eq!(committed_from_range(Some("bytes=0-1048575")), 1_048_576);
        assert_eq!(committed_from_range(Some("garbage")), 0);
        assert_eq!(committed_from_range(None), 0);
    }

    #[test]
    fn test_token_file_parsing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("token.json");
        std::fs::write(
            &path,
            r#"{"token":"ya29.x","refresh_token":"1//r","client_id":"id","client_secret":"s","scopes":["https://www.googleapis.com/auth/drive.file"]}"#,
        )
        .unwrap();

        let creds = AuthorizedUser::load(&path).unwrap();
        assert_eq!(creds.token.as_deref(), Some("ya29.x"));
        assert_eq!(creds.token_uri, DEFAULT_TOKEN_URI);
    }

    #[test]
    fn test_bad_token_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("token.json");
        std::fs::write(&path, "{}").unwrap();

        assert!(matches!(
            AuthorizedUser::load(&path),
            Err(CredentialsError::Parse { .. })
        ));
        assert!(matches!(
            AuthorizedUser::load(&tmp.path().join("missing.json")),
            Err(CredentialsError::Io { .. })
        ));
    }

    #[test]
    fn test_links() {
        let client = DriveClient::new(AuthorizedUser {
            token: None,
            refresh_token: "r".into(),
            client_id: "c".into(),
            client_secret: "s".into(),
            token_uri: default_token_uri(),
        })
        .unwrap();
        let object = RemoteObject {
            id: "abc".into(),
            name: "ep.mp4".into(),
        };
        assert_eq!(client.view_url(&object), "https://drive.google.com/file/d/abc/view");
        assert_eq!(
            client.download_url(&object),
            "https://drive.google.com/uc?id=abc&export=download"
        );
    }
}
