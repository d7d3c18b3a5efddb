//! Progress extraction from tool output
//!
//! Each job class has its own line format: aria2c summary lines for fetches,
//! ffmpeg `time=` status lines for transcodes, and byte counters for uploads.
//! All of them are normalised into [`Progress`].

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

/// Normalised progress sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// 0..=100
    pub percent: u8,
    /// Tool-specific rate text, e.g. `1.5MiB/s`, `1.97x`, `3.2 MB/s`
    pub rate: String,
    pub eta_secs: Option<u64>,
}

impl Progress {
    pub fn new(percent: u8, rate: impl Into<String>, eta_secs: Option<u64>) -> Self {
        Self {
            percent: percent.min(100),
            rate: rate.into(),
            eta_secs,
        }
    }

    pub fn complete(rate: impl Into<String>) -> Self {
        Self::new(100, rate, Some(0))
    }

    pub fn eta_text(&self) -> String {
        format_eta(self.eta_secs)
    }
}

/// Forwards only samples whose percentage moved forward
#[derive(Debug, Default)]
pub struct ProgressTracker {
    last_percent: Option<u8>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_percent(&self) -> Option<u8> {
        self.last_percent
    }

    pub fn advance(&mut self, sample: Progress) -> Option<Progress> {
        match self.last_percent {
            Some(last) if sample.percent <= last => None,
            _ => {
                self.last_percent = Some(sample.percent);
                Some(sample)
            }
        }
    }

    /// Elapsed-time sample at the last known percentage
    pub fn heartbeat(&self, elapsed: Duration) -> Progress {
        Progress::new(
            self.last_percent.unwrap_or(0),
            format!("elapsed {}", crate::job::format_elapsed(elapsed)),
            None,
        )
    }
}

/// Something recognised in an aria2c output line
#[derive(Debug, Clone, PartialEq)]
pub enum FetchLine {
    Progress(Progress),
    Completed(PathBuf),
}

fn aria2_summary_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[#[0-9a-fA-F]+\s[^\]]*?\((\d{1,3})%\)").expect("aria2c summary pattern")
    })
}

fn aria2_rate_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"DL:([0-9.]+[KMGT]?i?B)").expect("aria2c rate pattern"))
}

fn aria2_eta_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"ETA:((?:\d+h)?(?:\d+m)?(?:\d+s)?)").expect("aria2c eta pattern"))
}

fn aria2_complete_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Download complete:\s*(.+?)\s*$").expect("aria2c completion pattern"))
}

/// Parse one aria2c output line
///
/// ```text
/// [#2089b0 400.0KiB/33.2MiB(1%) CN:1 DL:115.7KiB ETA:4m51s]
/// 05/01 12:00:00 [NOTICE] Download complete: /srv/downloads/episode.mkv
/// ```
pub fn parse_fetch_line(line: &str) -> Option<FetchLine> {
    if let Some(caps) = aria2_complete_re().captures(line) {
        let path = caps[1].trim();
        if !path.is_empty() && !path.starts_with("[MEMORY]") {
            return Some(FetchLine::Completed(PathBuf::from(path)));
        }
    }

    let caps = aria2_summary_re().captures(line)?;
    let percent: u8 = caps[1].parse::<u16>().ok()?.min(100) as u8;
    let rate = aria2_rate_re()
        .captures(line)
        .map(|c| format!("{}/s", &c[1]))
        .unwrap_or_default();
    let eta = aria2_eta_re()
        .captures(line)
        .and_then(|c| parse_compact_duration(&c[1]));
    Some(FetchLine::Progress(Progress::new(percent, rate, eta)))
}

fn aria2_done_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[#[0-9a-fA-F]+\s+([0-9.]+)([KMGT]?)i?B/").expect("aria2c done pattern"))
}

/// Bytes already downloaded according to an aria2c summary line
///
/// `[#2089b0 400.0KiB/33.2MiB(1%) ...]` -> 409600
pub fn parse_fetch_done_bytes(line: &str) -> Option<u64> {
    let caps = aria2_done_re().captures(line)?;
    let value: f64 = caps[1].parse().ok()?;
    let scale = match &caps[2] {
        "K" => 1024f64,
        "M" => 1024f64.powi(2),
        "G" => 1024f64.powi(3),
        "T" => 1024f64.powi(4),
        _ => 1.0,
    };
    Some((value * scale) as u64)
}

/// `1h2m3s` -> 3723
pub fn parse_compact_duration(text: &str) -> Option<u64> {
    if text.is_empty() {
        return None;
    }
    let mut total = 0u64;
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let value: u64 = digits.parse().ok()?;
        digits.clear();
        total += match ch {
            'h' => value * 3600,
            'm' => value * 60,
            's' => value,
            _ => return None,
        };
    }
    if !digits.is_empty() {
        return None;
    }
    Some(total)
}

/// Position and speed from one ffmpeg status line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TranscodeSample {
    pub position_secs: f64,
    pub speed: Option<f64>,
}

fn ffmpeg_time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"time=\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("ffmpeg time pattern")
    })
}

fn ffmpeg_speed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"speed=\s*([0-9]+(?:\.[0-9]+)?)x").expect("ffmpeg speed pattern"))
}

fn ffmpeg_duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("ffmpeg duration pattern")
    })
}

fn clock_secs(h: &str, m: &str, s: &str) -> Option<f64> {
    let h: f64 = h.parse().ok()?;
    let m: f64 = m.parse().ok()?;
    let s: f64 = s.parse().ok()?;
    Some(h * 3600.0 + m * 60.0 + s)
}

/// `frame= 240 fps=48 ... time=00:00:10.00 bitrate=838.9kbits/s speed=1.97x`
pub fn parse_transcode_line(line: &str) -> Option<TranscodeSample> {
    let caps = ffmpeg_time_re().captures(line)?;
    let position_secs = clock_secs(&caps[1], &caps[2], &caps[3])?;
    let speed = ffmpeg_speed_re()
        .captures(line)
        .and_then(|c| c[1].parse::<f64>().ok());
    Some(TranscodeSample {
        position_secs,
        speed,
    })
}

/// `  Duration: 00:23:40.04, start: 0.000000, bitrate: 2500 kb/s`
pub fn parse_duration_header(line: &str) -> Option<f64> {
    let caps = ffmpeg_duration_re().captures(line)?;
    clock_secs(&caps[1], &caps[2], &caps[3])
}

/// Percent is capped at 99 until the driver confirms a valid output.
pub fn transcode_progress(sample: &TranscodeSample, expected_secs: Option<f64>) -> Progress {
    let rate = sample
        .speed
        .map(|s| format!("{:.2}x", s))
        .unwrap_or_default();

    let Some(expected) = expected_secs.filter(|d| *d > 0.0) else {
        return Progress::new(0, rate, None);
    };

    let percent = ((sample.position_secs / expected) * 100.0).clamp(0.0, 99.0) as u8;
    let eta = sample.speed.filter(|s| *s > 0.0).map(|speed| {
        let remaining = (expected - sample.position_secs).max(0.0);
        (remaining / speed).round() as u64
    });
    Progress::new(percent, rate, eta)
}

/// Progress for an upload of `total` bytes with `sent` bytes committed
pub fn transfer_progress(sent: u64, total: u64, elapsed: Duration) -> Progress {
    if total == 0 {
        return Progress::complete("");
    }
    let sent = sent.min(total);
    let percent = ((sent as u128 * 100) / total as u128) as u8;
    let secs = elapsed.as_secs_f64();
    let bytes_per_sec = if secs > 0.0 { sent as f64 / secs } else { 0.0 };
    let eta = (bytes_per_sec > 0.0).then(|| ((total - sent) as f64 / bytes_per_sec).round() as u64);
    Progress::new(percent, format_rate(bytes_per_sec), eta)
}

/// `3355443.2` -> `3.2 MB/s`
pub fn format_rate(bytes_per_sec: f64) -> String {
    format!("{:.1} MB/s", bytes_per_sec / (1024.0 * 1024.0))
}

pub fn format_eta(eta_secs: Option<u64>) -> String {
    match eta_secs {
        None => "--".to_string(),
        Some(s) if s >= 3600 => format!("{}h{:02}m", s / 3600, (s % 3600) / 60),
        Some(s) if s >= 60 => format!("{}m{:02}s", s / 60, s % 60),
        Some(s) => format!("{}s", s),
    }
}
