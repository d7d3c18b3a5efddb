//! CLI entry point for media-relay
//!
//! Runs one fetch, transcode or upload job with live progress. Ctrl-C stops
//! the job gracefully; a second Ctrl-C exits immediately.

use clap::{Parser, Subcommand};
use media_relay::{init_logging, Config, Daemon, JobPhase, JobRequest, ProgressSink};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// media-relay - fetch, transcode and upload media with bounded concurrency
#[derive(Parser, Debug)]
#[command(name = "media-relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file; defaults apply when it does not exist
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip tool discovery and use configured paths or bare tool names
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a magnet link, torrent or URL with aria2c
    Fetch {
        /// Magnet link, torrent URL or plain URL
        source: String,
        /// Rename the downloaded file (extension is kept)
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Encode an episode with an optional intro and burned-in subtitle
    Transcode {
        /// Episode file, by path or by name in the search dirs
        episode: String,
        #[arg(long)]
        intro: Option<String>,
        /// ASS/SSA subtitle file
        #[arg(long)]
        subtitle: Option<String>,
        /// Output name without extension
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Upload a file from the encode directory
    Upload {
        /// File name, with or without extension, or a path
        name: String,
    },
}

fn load_config(path: &PathBuf) -> Result<Config, media_relay::DaemonError> {
    if path.exists() {
        return Ok(Config::load(path)?);
    }
    let mut config = Config::default();
    config.apply_env_overrides();
    Ok(config)
}

fn progress_printer() -> ProgressSink {
    Arc::new(|percent: u8, rate: &str, eta: &str| {
        if rate.is_empty() {
            println!("{:>3}%  eta {}", percent, eta);
        } else {
            println!("{:>3}%  {}  eta {}", percent, rate, eta);
        }
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.logging.filter);

    let daemon = if args.skip_checks {
        tracing::warn!("skipping tool discovery (--skip-checks)");
        Daemon::new_without_checks(config)
    } else {
        Daemon::with_config(config)
    };

    let request: Result<JobRequest, _> = match &args.command {
        Command::Fetch { source, name } => Ok(daemon.fetch_request(source, name.clone())),
        Command::Transcode {
            episode,
            intro,
            subtitle,
            name,
        } => daemon.transcode_request(episode, intro.as_deref(), subtitle.as_deref(), name.clone()),
        Command::Upload { name } => daemon.upload_request(name),
    };
    let request = match request {
        Ok(request) => request,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = daemon.start_status_server() {
        eprintln!("Status server not started: {}", e);
    }
    let _updater = daemon.start_metrics_updater();

    let ticket = match daemon.submit(request, progress_printer()) {
        Ok(ticket) => ticket,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    println!("[{}] {} job started", ticket.id(), ticket.class());

    let id = ticket.id().clone();
    let orchestrator = daemon.orchestrator().clone();
    let wait = ticket.wait();
    tokio::pin!(wait);

    let report = tokio::select! {
        report = &mut wait => report,
        _ = tokio::signal::ctrl_c() => {
            println!("[{}] stopping...", id);
            orchestrator.stop(&id);
            tokio::select! {
                report = &mut wait => report,
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("[{}] interrupted", id);
                    return ExitCode::FAILURE;
                }
            }
        }
    };

    println!("{}", report.message());
    if report.phase() == JobPhase::Succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
