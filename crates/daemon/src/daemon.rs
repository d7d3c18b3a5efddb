//! Daemon startup and wiring for media-relay
//!
//! Loads configuration, locates tools, builds the orchestrator and its
//! drivers, and runs the status server and metrics updater in the background.

use crate::artifact::{find_upload_source, locate_media};
use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::encode::{EncodeSettings, TranscodeParams};
use crate::fetch::{FetchParams, FetchSettings};
use crate::orchestrator::{JobRequest, JobTicket, Orchestrator, OrchestratorSettings, ProgressSink, SubmitError};
use crate::startup::{run_startup_checks, ToolPaths};
use crate::status::{collect_system_metrics, SystemMetrics};
use crate::status_server::{parse_listen_addr, run_status_server, ServerError, SharedSystem};
use crate::transfer::{DriveClient, TransferClient, TransferEngine, TransferParams, TransferSettings};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

const METRICS_REFRESH: Duration = Duration::from_secs(2);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Status server error: {0}")]
    Server(#[from] ServerError),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    /// A named input could not be located
    #[error("{role} not found: {name}")]
    InputNotFound { role: &'static str, name: String },
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Derived concurrency plan
    pub concurrency_plan: ConcurrencyPlan,
    /// Tools found at startup
    pub tools: ToolPaths,
    orchestrator: Orchestrator,
    system: SharedSystem,
}

impl Daemon {
    /// Load config from file, apply environment overrides, locate tools
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Ok(Self::with_config(config))
    }

    /// Initialize with an existing configuration, probing for tools
    pub fn with_config(config: Config) -> Self {
        let tools = run_startup_checks(&config);
        Self::with_tools(config, tools)
    }

    /// Initialize without probing; configured paths or bare tool names are used as-is
    pub fn new_without_checks(config: Config) -> Self {
        let tools = ToolPaths::assumed(&config);
        Self::with_tools(config, tools)
    }

    fn with_tools(config: Config, tools: ToolPaths) -> Self {
        let concurrency_plan = derive_plan(&config);
        let transfer_client = connect_transfer_client(&config);

        let settings = OrchestratorSettings {
            fetch: tools
                .aria2c
                .clone()
                .map(|aria2c| FetchSettings::from_config(&config, aria2c)),
            transcode: tools.ffmpeg.clone().zip(tools.ffprobe.clone()).map(|(ffmpeg, ffprobe)| {
                EncodeSettings::from_config(&config, ffmpeg, ffprobe, concurrency_plan.transcode_threads)
            }),
            transfer: TransferEngine::new(transfer_client, TransferSettings::from_config(&config.transfer)),
        };
        info!(
            fetch = ?concurrency_plan.fetch_limit,
            transcode = ?concurrency_plan.transcode_limit,
            transfer = ?concurrency_plan.transfer_limit,
            threads = concurrency_plan.transcode_threads,
            "concurrency plan"
        );

        Self {
            orchestrator: Orchestrator::new(&concurrency_plan, settings),
            config,
            concurrency_plan,
            tools,
            system: Arc::new(RwLock::new(SystemMetrics::default())),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn fetch_request(&self, source: &str, name: Option<String>) -> JobRequest {
        JobRequest::Fetch(FetchParams::new(source, name))
    }

    /// Resolve transcode inputs by path or by name across the search dirs
    pub fn transcode_request(
        &self,
        episode: &str,
        intro: Option<&str>,
        subtitle: Option<&str>,
        name: Option<String>,
    ) -> Result<JobRequest, DaemonError> {
        let dirs = &self.config.transcode.search_dirs;
        let find = |role: &'static str, name: &str| {
            locate_media(name, dirs).ok_or_else(|| DaemonError::InputNotFound {
                role,
                name: name.to_string(),
            })
        };

        let mut params = TranscodeParams::new(find("episode", episode)?);
        params.intro = intro.map(|i| find("intro", i)).transpose()?;
        params.subtitle = subtitle.map(|s| find_file(s, dirs, "subtitle")).transpose()?;
        params.output_name = name;
        Ok(JobRequest::Transcode(params))
    }

    /// Resolve an upload source by path or by name in the source dir
    pub fn upload_request(&self, name: &str) -> Result<JobRequest, DaemonError> {
        let source = find_upload_source(&self.config.transfer.source_dir, name).ok_or_else(|| {
            DaemonError::InputNotFound {
                role: "upload source",
                name: name.to_string(),
            }
        })?;
        Ok(JobRequest::Transfer(TransferParams::new(source)))
    }

    pub fn submit(&self, request: JobRequest, sink: ProgressSink) -> Result<JobTicket, DaemonError> {
        Ok(self.orchestrator.submit(request, sink)?)
    }

    /// Start the status HTTP server if enabled
    pub fn start_status_server(&self) -> Result<Option<tokio::task::JoinHandle<()>>, DaemonError> {
        if !self.config.status.enabled {
            return Ok(None);
        }
        let addr = parse_listen_addr(&self.config.status.listen_addr)?;
        let orchestrator = self.orchestrator.clone();
        let system = self.system.clone();
        Ok(Some(tokio::spawn(async move {
            if let Err(e) = run_status_server(addr, orchestrator, system).await {
                error!(error = %e, "status server stopped");
            }
        })))
    }

    /// Periodically refresh host metrics for the status server
    pub fn start_metrics_updater(&self) -> tokio::task::JoinHandle<()> {
        let system = self.system.clone();
        tokio::spawn(async move {
            loop {
                let metrics = tokio::task::spawn_blocking(collect_system_metrics)
                    .await
                    .unwrap_or_default();
                *system.write().await = metrics;
                tokio::time::sleep(METRICS_REFRESH).await;
            }
        })
    }

    /// Stop every live job and wait for the registry to drain
    pub async fn shutdown(&self) {
        let stopped = self.orchestrator.stop_all();
        if stopped == 0 {
            return;
        }
        let grace = Duration::from_secs(self.config.process.grace_period_secs) + Duration::from_secs(5);
        let drained = tokio::time::timeout(grace, async {
            while !self.orchestrator.registry().is_empty() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(remaining = self.orchestrator.registry().len(), "jobs still registered after shutdown grace");
        }
    }
}

/// An exact path, or `name` inside one of `dirs`
fn find_file(name: &str, dirs: &[PathBuf], role: &'static str) -> Result<PathBuf, DaemonError> {
    let direct = PathBuf::from(name);
    if direct.is_file() {
        return Ok(direct);
    }
    dirs.iter()
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| DaemonError::InputNotFound {
            role,
            name: name.to_string(),
        })
}

fn connect_transfer_client(config: &Config) -> Option<Arc<dyn TransferClient>> {
    let Some(token_file) = config.transfer.token_file.as_deref() else {
        info!("no token file configured, uploads disabled");
        return None;
    };
    match DriveClient::from_token_file(token_file) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            warn!(error = %e, "drive client unavailable, uploads disabled");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobClass;
    use crate::orchestrator::silent_sink;
    use tempfile::TempDir;

    fn create_test_config(tmp: &Path) -> Config {
        let mut config = Config::default();
        config.limits.transcode = 2;
        config.transcode.threads = 0;
        config.transcode.search_dirs = vec![tmp.join("downloads"), tmp.join("videos")];
        config.transfer.source_dir = tmp.join("encode");
        config.status.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_daemon_initialization_without_checks() {
        let tmp = TempDir::new().unwrap();
        let config = create_test_config(tmp.path());
        let daemon = Daemon::new_without_checks(config.clone());

        assert_eq!(daemon.config, config);
        assert_eq!(daemon.concurrency_plan.transcode_limit, Some(2));
        assert!(daemon.orchestrator().settings().fetch.is_some());
        assert!(daemon.orchestrator().settings().transcode.is_some());
        assert!(!daemon.orchestrator().settings().transfer.is_available());
        assert!(daemon.start_status_server().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_tools_disable_their_class() {
        let tmp = TempDir::new().unwrap();
        let daemon = Daemon::with_tools(create_test_config(tmp.path()), ToolPaths::default());

        let err = daemon
            .submit(daemon.fetch_request("http://host/a", None), silent_sink())
            .unwrap_err();
        assert!(matches!(err, DaemonError::Submit(SubmitError::Unavailable(JobClass::Fetch))));
    }

    #[test]
    fn test_transcode_inputs_are_located_by_name() {
        let tmp = TempDir::new().unwrap();
        let config = create_test_config(tmp.path());
        std::fs::create_dir_all(tmp.path().join("videos")).unwrap();
        std::fs::write(tmp.path().join("videos/ep01.mkv"), b"x").unwrap();
        std::fs::write(tmp.path().join("videos/intro.mp4"), b"x").unwrap();
        std::fs::write(tmp.path().join("videos/ep01.ass"), b"[Script Info]").unwrap();
        let daemon = Daemon::new_without_checks(config);

        let request = daemon
            .transcode_request("ep01", Some("intro.mp4"), Some("ep01.ass"), Some("Episode 1".into()))
            .unwrap();
        let JobRequest::Transcode(params) = request else {
            panic!("expected transcode request");
        };
        assert_eq!(params.episode, tmp.path().join("videos/ep01.mkv"));
        assert_eq!(params.intro, Some(tmp.path().join("videos/intro.mp4")));
        assert_eq!(params.subtitle, Some(tmp.path().join("videos/ep01.ass")));

        let err = daemon.transcode_request("missing", None, None, None).unwrap_err();
        assert!(matches!(err, DaemonError::InputNotFound { role: "episode", .. }));
    }

    #[test]
    fn test_upload_source_lookup() {
        let tmp = TempDir::new().unwrap();
        let config = create_test_config(tmp.path());
        std::fs::create_dir_all(tmp.path().join("encode")).unwrap();
        std::fs::write(tmp.path().join("encode/Show 01.mp4"), b"x").unwrap();
        let daemon = Daemon::new_without_checks(config);

        let JobRequest::Transfer(params) = daemon.upload_request("Show 01").unwrap() else {
            panic!("expected transfer request");
        };
        assert_eq!(params.source, tmp.path().join("encode/Show 01.mp4"));
        assert!(daemon.upload_request("nothing").is_err());
    }

    #[tokio::test]
    async fn test_shutdown_without_jobs_returns_immediately() {
        let tmp = TempDir::new().unwrap();
        let daemon = Daemon::new_without_checks(create_test_config(tmp.path()));
        tokio::time::timeout(Duration::from_secs(1), daemon.shutdown())
            .await
            .unwrap();
    }
}
