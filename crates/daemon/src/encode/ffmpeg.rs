//! ffmpeg encoder module for media-relay
//!
//! Builds and supervises the single-pass H.264 encode: optional intro
//! concatenated in front of the episode, optional ASS/SSA subtitles burned
//! into the episode, everything normalised to 1080p25 with 48 kHz audio.

use crate::job::JobError;
use crate::orchestrator::JobContext;
use crate::process::{CommandSpec, OutputLine, OutputObserver, RunningProcess, WaitLimits, WaitOutcome};
use crate::progress::{parse_duration_header, parse_transcode_line, transcode_progress, Progress};
use media_relay_config::Config;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Outputs at or below this size are treated as a failed encode
pub const MIN_OUTPUT_BYTES: u64 = 10 * 1024;

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-input normalisation: 25 fps, letterboxed into 1920x1080, square pixels
const VIDEO_NORMALISE: &str = "fps=25,scale=1920:1080:force_original_aspect_ratio=decrease,\
pad=1920:1080:(ow-iw)/2:(oh-ih)/2,setsar=1";

/// Error type for input validation before an encode starts
#[derive(Debug, Error)]
pub enum EncodeError {
    /// An input file does not exist
    #[error("{role} file not found: {}", .path.display())]
    MissingInput { role: &'static str, path: PathBuf },

    /// Subtitle file is empty or not ASS/SSA
    #[error("invalid subtitle file {}: {reason}", .path.display())]
    InvalidSubtitle { path: PathBuf, reason: String },

    /// IO error reading an input
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<EncodeError> for JobError {
    fn from(err: EncodeError) -> Self {
        JobError::InvalidInput(err.to_string())
    }
}

/// Parameters for one encode
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeParams {
    pub episode: PathBuf,
    pub intro: Option<PathBuf>,
    pub subtitle: Option<PathBuf>,
    /// Output file name without extension; defaults to the episode's stem
    pub output_name: Option<String>,
}

impl TranscodeParams {
    pub fn new(episode: impl Into<PathBuf>) -> Self {
        Self {
            episode: episode.into(),
            intro: None,
            subtitle: None,
            output_name: None,
        }
    }

    pub fn label(&self) -> String {
        self.output_name.clone().unwrap_or_else(|| self.output_stem())
    }

    fn output_stem(&self) -> String {
        self.episode
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "output".to_string())
    }

    /// `<output_name or episode stem>.mp4`
    pub fn output_file_name(&self) -> String {
        let stem = self
            .output_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.output_stem());
        format!("{}.mp4", stem)
    }
}

/// Encoder settings shared by every transcode
#[derive(Debug, Clone)]
pub struct EncodeSettings {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub output_dir: PathBuf,
    pub preset: String,
    pub crf: u8,
    /// 0 lets ffmpeg decide
    pub threads: u32,
    pub limits: WaitLimits,
    pub tail_bytes: usize,
}

impl EncodeSettings {
    pub fn from_config(cfg: &Config, ffmpeg: PathBuf, ffprobe: PathBuf, threads: u32) -> Self {
        Self {
            ffmpeg,
            ffprobe,
            output_dir: cfg.transcode.output_dir.clone(),
            preset: cfg.transcode.preset.clone(),
            crf: cfg.transcode.crf,
            threads,
            limits: WaitLimits {
                poll_interval: Duration::from_millis(cfg.transcode.poll_interval_ms.max(10)),
                total_timeout: crate::fetch::non_zero_secs(cfg.transcode.total_timeout_secs),
                idle_timeout: crate::fetch::non_zero_secs(cfg.transcode.idle_timeout_secs),
                grace_period: Duration::from_secs(cfg.process.grace_period_secs),
            },
            tail_bytes: cfg.process.output_tail_bytes,
        }
    }
}

/// Result of a finished encode
#[derive(Debug, Clone)]
pub struct TranscodeOutput {
    pub output_path: PathBuf,
    pub size_bytes: u64,
    pub media_duration_secs: Option<f64>,
    pub elapsed: Duration,
}

/// Check that `path` looks like ASS/SSA and return it escaped for the `ass` filter
pub fn validate_subtitle(path: &Path) -> Result<String, EncodeError> {
    let raw = std::fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => EncodeError::MissingInput {
            role: "subtitle",
            path: path.to_path_buf(),
        },
        _ => EncodeError::Io(e),
    })?;
    let content = String::from_utf8_lossy(&raw);
    let content = content.trim_start_matches('\u{feff}').trim();

    if content.is_empty() {
        return Err(EncodeError::InvalidSubtitle {
            path: path.to_path_buf(),
            reason: "file is empty".to_string(),
        });
    }
    let has_section = ["[Script Info]", "[V4 Styles]", "[V4+ Styles]"]
        .iter()
        .any(|section| content.contains(section));
    if !has_section {
        return Err(EncodeError::InvalidSubtitle {
            path: path.to_path_buf(),
            reason: "not an ASS/SSA subtitle".to_string(),
        });
    }

    debug!(path = %path.display(), chars = content.len(), "subtitle validated");
    Ok(escape_filter_path(path))
}

/// Escape a path for use inside a quoted filtergraph argument
pub fn escape_filter_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "/")
        .replace(':', "\\:")
        .replace('\'', "\\'")
}

/// Filter graph producing `[v]` and `[a]`
pub fn build_filter_graph(has_intro: bool, subtitle: Option<&str>) -> String {
    let burn = subtitle
        .map(|s| format!(",ass='{}'", s))
        .unwrap_or_default();

    if has_intro {
        format!(
            "[0:v]{norm}[intro_v];\
             [1:v]{norm}{burn}[episode_v];\
             [0:a]aresample=48000[intro_a];\
             [1:a]aresample=48000[episode_a];\
             [intro_v][intro_a][episode_v][episode_a]concat=n=2:v=1:a=1[v][a]",
            norm = VIDEO_NORMALISE,
            burn = burn
        )
    } else {
        format!(
            "[0:v]{norm}{burn}[v];[0:a]aresample=48000[a]",
            norm = VIDEO_NORMALISE,
            burn = burn
        )
    }
}

/// Build the ffmpeg invocation
pub fn build_ffmpeg_command(
    settings: &EncodeSettings,
    params: &TranscodeParams,
    output_path: &Path,
    subtitle_filter_path: Option<&str>,
) -> CommandSpec {
    let mut spec = CommandSpec::new(&settings.ffmpeg).args(["-hide_banner", "-nostdin", "-y"]);
    if let Some(intro) = &params.intro {
        spec = spec.arg("-i").arg(intro);
    }
    spec = spec
        .arg("-i")
        .arg(&params.episode)
        .arg("-filter_complex")
        .arg(build_filter_graph(params.intro.is_some(), subtitle_filter_path))
        .args(["-map", "[v]", "-map", "[a]"])
        .args(["-c:v", "libx264"])
        .arg("-preset")
        .arg(&settings.preset)
        .arg("-crf")
        .arg(settings.crf.to_string());
    if settings.threads > 0 {
        spec = spec.arg("-threads").arg(settings.threads.to_string());
    }
    spec.args(["-c:a", "aac", "-b:a", "128k", "-r", "25", "-movflags", "+faststart"])
        .arg(output_path)
}

/// Parse the single number `ffprobe -show_entries format=duration` prints
pub fn parse_probe_duration(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .find_map(|line| line.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
}

/// Media duration in seconds, or `None` when it cannot be determined
pub async fn probe_duration(ffprobe: &Path, path: &Path) -> Option<f64> {
    let mut cmd = tokio::process::Command::new(ffprobe);
    cmd.args([
        "-v",
        "error",
        "-show_entries",
        "format=duration",
        "-of",
        "default=noprint_wrappers=1:nokey=1",
    ])
    .arg(path)
    .stdin(Stdio::null())
    .kill_on_drop(true);

    let output = match tokio::time::timeout(PROBE_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            debug!(path = %path.display(), error = %e, "ffprobe unavailable");
            return None;
        }
        Err(_) => {
            warn!(path = %path.display(), "ffprobe timed out");
            return None;
        }
    };

    parse_probe_duration(&String::from_utf8_lossy(&output.stdout)).or_else(|| {
        // Some builds print the container header even with -v error
        String::from_utf8_lossy(&output.stderr)
            .lines()
            .find_map(parse_duration_header)
    })
}

struct TranscodeObserver<'a> {
    ctx: &'a mut JobContext,
    expected_secs: Option<f64>,
    header_secs: f64,
    /// Furthest output position seen
    position_secs: Option<f64>,
}

impl OutputObserver for TranscodeObserver<'_> {
    fn on_line(&mut self, line: &OutputLine) -> bool {
        trace!(job_id = %self.ctx.id(), line = %line.text, "ffmpeg");
        if let Some(sample) = parse_transcode_line(&line.text) {
            let expected = self
                .expected_secs
                .or((self.header_secs > 0.0).then_some(self.header_secs));
            self.ctx.report(transcode_progress(&sample, expected));
            let advanced = self.position_secs.map_or(true, |pos| sample.position_secs > pos);
            if advanced {
                self.position_secs = Some(sample.position_secs);
            }
            return advanced;
        }
        if self.expected_secs.is_none() {
            // Each input prints its own Duration header before encoding starts
            if let Some(secs) = parse_duration_header(&line.text) {
                self.header_secs += secs;
            }
        }
        false
    }
}

fn require_input(role: &'static str, path: &Path) -> Result<(), EncodeError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(EncodeError::MissingInput {
            role,
            path: path.to_path_buf(),
        })
    }
}

/// Run one encode to completion
pub async fn run_transcode(
    settings: &EncodeSettings,
    params: &TranscodeParams,
    ctx: &mut JobContext,
) -> Result<TranscodeOutput, JobError> {
    require_input("episode", &params.episode)?;
    if let Some(intro) = &params.intro {
        require_input("intro", intro)?;
    }
    let subtitle = params
        .subtitle
        .as_deref()
        .map(validate_subtitle)
        .transpose()?;

    tokio::fs::create_dir_all(&settings.output_dir)
        .await
        .map_err(|e| JobError::InvalidInput(format!(
            "cannot create {}: {}",
            settings.output_dir.display(),
            e
        )))?;
    let output_path = settings.output_dir.join(params.output_file_name());

    let mut cancel = ctx.cancel_signal();
    let probes = async {
        let episode_secs = probe_duration(&settings.ffprobe, &params.episode).await;
        let intro_secs = match &params.intro {
            Some(intro) => probe_duration(&settings.ffprobe, intro).await,
            None => Some(0.0),
        };
        (episode_secs, intro_secs)
    };
    // dropping the probe future kills ffprobe
    let (episode_secs, intro_secs) = tokio::select! {
        durations = probes => durations,
        _ = cancel.cancelled() => return Err(JobError::Cancelled { forced: false }),
    };
    let expected_secs = episode_secs.zip(intro_secs).map(|(e, i)| e + i);
    debug!(job_id = %ctx.id(), ?expected_secs, "probed durations");

    let spec = build_ffmpeg_command(settings, params, &output_path, subtitle.as_deref());
    let started = Instant::now();
    let mut process = RunningProcess::start(&spec, settings.tail_bytes)?;
    ctx.mark_running(process.pid());
    ctx.report(Progress::new(0, "", None));
    info!(job_id = %ctx.id(), pid = ?process.pid(), output = %output_path.display(), "encode started");

    let mut observer = TranscodeObserver {
        ctx: &mut *ctx,
        expected_secs,
        header_secs: 0.0,
        position_secs: None,
    };
    let outcome = process
        .wait(&settings.limits, &mut cancel, &mut observer)
        .await?;
    let media_duration_secs = expected_secs.or((observer.header_secs > 0.0).then_some(observer.header_secs));

    let exit = match outcome {
        WaitOutcome::Exited(exit) => exit,
        WaitOutcome::Cancelled(stop) => return Err(JobError::Cancelled { forced: stop.forced }),
    };
    if !exit.success() {
        return Err(JobError::RuntimeFailure {
            reason: format!("ffmpeg failed with {}", exit.describe()),
            tail: process.tail(),
        });
    }

    let size_bytes = tokio::fs::metadata(&output_path)
        .await
        .map(|m| m.len())
        .unwrap_or(0);
    if size_bytes <= MIN_OUTPUT_BYTES {
        return Err(JobError::RuntimeFailure {
            reason: format!(
                "output {} is missing or too small ({} bytes)",
                output_path.display(),
                size_bytes
            ),
            tail: process.tail(),
        });
    }

    ctx.report(Progress::complete(""));
    Ok(TranscodeOutput {
        output_path,
        size_bytes,
        media_duration_secs,
        elapsed: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobClass;
    use crate::orchestrator::test_support::{fake_tool, test_context};
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn settings(ffmpeg: PathBuf, ffprobe: PathBuf, out: &Path) -> EncodeSettings {
        let mut cfg = Config::default();
        cfg.transcode.output_dir = out.to_path_buf();
        cfg.transcode.poll_interval_ms = 50;
        cfg.process.grace_period_secs = 1;
        EncodeSettings::from_config(&cfg, ffmpeg, ffprobe, 4)
    }

    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    #[test]
    fn test_filter_graph_with_intro_burns_into_episode() {
        let graph = build_filter_graph(true, Some("/subs/ep1.ass"));
        assert!(graph.contains("[1:v]fps=25,scale=1920:1080"));
        assert!(graph.contains("setsar=1,ass='/subs/ep1.ass'[episode_v]"));
        assert!(graph.contains("concat=n=2:v=1:a=1[v][a]"));
        assert!(!graph.contains("[intro_v];[1:v]fps=25,ass"));
    }

    #[test]
    fn test_filter_graph_without_intro() {
        let graph = build_filter_graph(false, None);
        assert!(graph.starts_with("[0:v]fps=25"));
        assert!(graph.ends_with("[0:a]aresample=48000[a]"));
        assert!(!graph.contains("concat"));
        assert!(!graph.contains("ass="));
    }

    #[test]
    fn test_escape_filter_path() {
        assert_eq!(
            escape_filter_path(Path::new(r"C:\subs\ep 1.ass")),
            r"C\:/subs/ep 1.ass"
        );
    }

    #[test]
    fn test_subtitle_validation() {
        let tmp = TempDir::new().unwrap();
        let good = tmp.path().join("good.ass");
        std::fs::write(&good, "\u{feff}[Script Info]\nTitle: x\n\n[V4+ Styles]\n").unwrap();
        let srt = tmp.path().join("bad.srt");
        std::fs::write(&srt, "1\n00:00:01,000 --> 00:00:02,000\nhi\n").unwrap();
        let empty = tmp.path().join("empty.ass");
        std::fs::write(&empty, "  \n").unwrap();

        assert!(validate_subtitle(&good).is_ok());
        assert!(matches!(
            validate_subtitle(&srt),
            Err(EncodeError::InvalidSubtitle { .. })
        ));
        assert!(matches!(
            validate_subtitle(&empty),
            Err(EncodeError::InvalidSubtitle { .. })
        ));
        assert!(matches!(
            validate_subtitle(&tmp.path().join("missing.ass")),
            Err(EncodeError::MissingInput { .. })
        ));
    }

    #[test]
    fn test_duration_output_parsing() {
        assert_eq!(parse_probe_duration("1420.040000\n"), Some(1420.04));
        assert_eq!(parse_probe_duration("N/A\n"), None);
        assert_eq!(parse_probe_duration(""), None);
    }

    #[test]
    fn test_output_name_defaults_to_episode_stem() {
        let mut params = TranscodeParams::new("/dl/Show.S01E02.mkv");
        assert_eq!(params.output_file_name(), "Show.S01E02.mp4");
        params.output_name = Some("ep2".to_string());
        assert_eq!(params.output_file_name(), "ep2.mp4");
    }

    // Property: every built command carries the encoder settings, both maps,
    // and ends with the output path.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ffmpeg_command_completeness(
            crf in 0u8..52,
            threads in 0u32..64,
            with_intro in any::<bool>(),
            name in "[a-zA-Z0-9_]{1,20}",
        ) {
            let mut s = settings(PathBuf::from("ffmpeg"), PathBuf::from("ffprobe"), Path::new("/out"));
            s.crf = crf;
            s.threads = threads;
            let mut params = TranscodeParams::new(format!("/in/{}.mkv", name));
            if with_intro {
                params.intro = Some(PathBuf::from("/in/intro.mp4"));
            }
            let output = PathBuf::from(format!("/out/{}.mp4", name));

            let args = build_ffmpeg_command(&s, &params, &output, None).args_lossy();

            prop_assert!(has_flag_with_value(&args, "-c:v", "libx264"));
            prop_assert!(has_flag_with_value(&args, "-crf", &crf.to_string()));
            prop_assert!(has_flag_with_value(&args, "-map", "[v]"));
            prop_assert!(has_flag_with_value(&args, "-map", "[a]"));
            prop_assert!(has_flag_with_value(&args, "-movflags", "+faststart"));
            prop_assert_eq!(has_flag_with_value(&args, "-threads", &threads.to_string()), threads > 0);
            prop_assert_eq!(args.iter().filter(|a| *a == "-i").count(), if with_intro { 2 } else { 1 });
            prop_assert_eq!(args.last().cloned(), Some(output.display().to_string()));
        }
    }

    #[tokio::test]
    async fn test_transcode_reports_progress_and_validates_output() {
        let tmp = TempDir::new().unwrap();
        let episode = tmp.path().join("ep.mkv");
        std::fs::write(&episode, b"video").unwrap();
        let ffprobe = fake_tool(tmp.path(), "ffprobe", "echo 100.0\n");
        let ffmpeg = fake_tool(
            tmp.path(),
            "ffmpeg",
            r#"for last in "$@"; do :; done
echo "frame=  250 fps=50 q=28.0 size=  1024kB time=00:00:25.00 bitrate=335.5kbits/s speed=2.00x" >&2
echo "frame=  750 fps=50 q=28.0 size=  3072kB time=00:01:15.00 bitrate=335.5kbits/s speed=2.00x" >&2
head -c 20000 /dev/zero > "$last"
"#,
        );
        let out_dir = tmp.path().join("encode");
        let (_registry, _reg, mut ctx, events) = test_context(JobClass::Transcode);

        let out = run_transcode(&settings(ffmpeg, ffprobe, &out_dir), &TranscodeParams::new(&episode), &mut ctx)
            .await
            .unwrap();

        assert_eq!(out.output_path, out_dir.join("ep.mp4"));
        assert_eq!(out.size_bytes, 20000);
        assert_eq!(out.media_duration_secs, Some(100.0));
        let percents: Vec<u8> = events.lock().unwrap().iter().map(|e| e.0).collect();
        assert_eq!(percents, vec![0, 25, 75, 100]);
    }

    #[tokio::test]
    async fn test_tiny_output_is_runtime_failure() {
        let tmp = TempDir::new().unwrap();
        let episode = tmp.path().join("ep.mkv");
        std::fs::write(&episode, b"video").unwrap();
        let ffmpeg = fake_tool(
            tmp.path(),
            "ffmpeg",
            "for last in \"$@\"; do :; done\nhead -c 100 /dev/zero > \"$last\"\n",
        );
        let (_registry, _reg, mut ctx, _events) = test_context(JobClass::Transcode);

        let err = run_transcode(
            &settings(ffmpeg, tmp.path().join("no-ffprobe"), &tmp.path().join("encode")),
            &TranscodeParams::new(&episode),
            &mut ctx,
        )
        .await
        .unwrap_err();

        assert_eq!(err.code(), "runtime_failure");
        assert!(err.to_string().contains("too small"));
    }

    #[tokio::test]
    async fn test_stop_during_duration_lookup_cancels_promptly() {
        let tmp = TempDir::new().unwrap();
        let episode = tmp.path().join("ep.mkv");
        std::fs::write(&episode, b"video").unwrap();
        let ffprobe = fake_tool(tmp.path(), "ffprobe", "sleep 20\necho 100.0\n");
        let ffmpeg = fake_tool(tmp.path(), "ffmpeg", "exit 0\n");
        let (registry, reg, mut ctx, _events) = test_context(JobClass::Transcode);
        let id = reg.id().clone();

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            registry.request_stop(&id);
            registry
        });

        let started = Instant::now();
        let err = run_transcode(
            &settings(ffmpeg, ffprobe, &tmp.path().join("encode")),
            &TranscodeParams::new(&episode),
            &mut ctx,
        )
        .await
        .unwrap_err();
        let _registry = stopper.await.unwrap();

        assert!(matches!(err, JobError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_episode_is_invalid_input() {
        let tmp = TempDir::new().unwrap();
        let (_registry, _reg, mut ctx, _events) = test_context(JobClass::Transcode);

        let err = run_transcode(
            &settings(PathBuf::from("ffmpeg"), PathBuf::from("ffprobe"), tmp.path()),
            &TranscodeParams::new(tmp.path().join("nope.mkv")),
            &mut ctx,
        )
        .await
        .unwrap_err();

        assert_eq!(err.code(), "invalid_input");
    }
}
