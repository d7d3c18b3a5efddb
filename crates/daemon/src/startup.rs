//! Startup checks module for media-relay
//!
//! Locates the external tools each job class needs:
//! - `aria2c` for fetches
//! - `ffmpeg` and `ffprobe` for transcodes
//!
//! A missing tool disables its job class instead of aborting startup.

use crate::process::which;
use media_relay_config::Config;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{info, warn};

const ARIA2C_CANDIDATES: &[&str] = &["aria2c", "/usr/bin/aria2c", "/usr/local/bin/aria2c", "/opt/homebrew/bin/aria2c"];
const FFMPEG_CANDIDATES: &[&str] = &["ffmpeg", "/usr/bin/ffmpeg", "/usr/local/bin/ffmpeg", "/opt/homebrew/bin/ffmpeg"];

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },
}

/// Resolved tool locations; `None` marks a missing tool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolPaths {
    pub aria2c: Option<PathBuf>,
    pub ffmpeg: Option<PathBuf>,
    pub ffprobe: Option<PathBuf>,
}

impl ToolPaths {
    /// Configured paths or bare names, without probing anything
    pub fn assumed(cfg: &Config) -> Self {
        let ffmpeg = cfg
            .transcode
            .ffmpeg_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("ffmpeg"));
        Self {
            aria2c: Some(
                cfg.fetch
                    .aria2c_path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("aria2c")),
            ),
            ffprobe: Some(
                cfg.transcode
                    .ffprobe_path
                    .clone()
                    .unwrap_or_else(|| sibling_ffprobe(&ffmpeg)),
            ),
            ffmpeg: Some(ffmpeg),
        }
    }

    pub fn fetch_available(&self) -> bool {
        self.aria2c.is_some()
    }

    pub fn transcode_available(&self) -> bool {
        self.ffmpeg.is_some() && self.ffprobe.is_some()
    }
}

/// `ffprobe` next to `ffmpeg`, or the bare name
pub fn sibling_ffprobe(ffmpeg: &Path) -> PathBuf {
    match ffmpeg.file_name().and_then(|n| n.to_str()) {
        Some(name) if name.contains("ffmpeg") => ffmpeg.with_file_name(name.replace("ffmpeg", "ffprobe")),
        _ => PathBuf::from("ffprobe"),
    }
}

/// Run `<tool> <version_arg>` and return the first line of its output
pub fn probe_tool(tool: &Path, version_arg: &str) -> Result<String, StartupError> {
    let unavailable = |reason: String| StartupError::ToolUnavailable {
        tool: tool.display().to_string(),
        reason,
    };
    let output = Command::new(tool)
        .arg(version_arg)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| unavailable(format!("{} {} failed: {}", tool.display(), version_arg, e)))?;

    if !output.status.success() {
        return Err(unavailable(format!(
            "{} {} exited with {}",
            tool.display(),
            version_arg,
            output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
}

/// First candidate that answers `version_arg`; an explicit path is the only candidate
pub fn find_tool(configured: Option<&Path>, fallbacks: &[&str], version_arg: &str) -> Result<PathBuf, StartupError> {
    let search: Vec<PathBuf> = match configured {
        Some(path) => vec![path.to_path_buf()],
        None => fallbacks.iter().map(PathBuf::from).collect(),
    };

    let mut last_error = None;
    for candidate in &search {
        let Some(resolved) = which(candidate) else {
            continue;
        };
        match probe_tool(&resolved, version_arg) {
            Ok(version) => {
                info!(tool = %resolved.display(), %version, "tool found");
                return Ok(resolved);
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error.unwrap_or_else(|| StartupError::ToolUnavailable {
        tool: search
            .first()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        reason: "not found in PATH".to_string(),
    }))
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 7.1 ..."
/// - N-prefixed: "ffmpeg version n7.1-... ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');
    version_str.split(['.', '-']).next()?.parse().ok()
}

/// Locate every tool, logging which job classes end up disabled
pub fn run_startup_checks(cfg: &Config) -> ToolPaths {
    let aria2c = find_tool(cfg.fetch.aria2c_path.as_deref(), ARIA2C_CANDIDATES, "--version")
        .map_err(|e| warn!(error = %e, "aria2c missing, fetch jobs disabled"))
        .ok();

    let ffmpeg = find_tool(cfg.transcode.ffmpeg_path.as_deref(), FFMPEG_CANDIDATES, "-version")
        .map_err(|e| warn!(error = %e, "ffmpeg missing, transcode jobs disabled"))
        .ok();
    if let Some(major) = ffmpeg
        .as_deref()
        .and_then(|path| probe_tool(path, "-version").ok())
        .and_then(|line| parse_ffmpeg_version(&line))
    {
        info!(major, "ffmpeg version");
    }

    let ffprobe = ffmpeg.as_ref().and_then(|ffmpeg| {
        let sibling = sibling_ffprobe(ffmpeg);
        let configured = cfg.transcode.ffprobe_path.as_deref().or(Some(sibling.as_path()));
        find_tool(configured, &["ffprobe"], "-version")
            .or_else(|_| find_tool(None, &["ffprobe"], "-version"))
            .map_err(|e| warn!(error = %e, "ffprobe missing, transcode jobs disabled"))
            .ok()
    });

    ToolPaths {
        aria2c,
        ffmpeg,
        ffprobe,
    }
}
