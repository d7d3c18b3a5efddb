//! Encoding modules for media-relay

pub mod ffmpeg;

pub use ffmpeg::{
    build_ffmpeg_command, build_filter_graph, probe_duration, run_transcode, validate_subtitle,
    EncodeError, EncodeSettings, TranscodeOutput, TranscodeParams,
};
