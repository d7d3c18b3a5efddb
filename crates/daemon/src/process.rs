//! External process supervision
//!
//! Launches a tool with piped output, streams its output line by line to
//! an observer, enforces total and idle budgets, and stops it gracefully
//! (terminate, grace period, kill) on request.

use crate::registry::CancelSignal;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Which budget ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Wall-clock budget since start
    Total,
    /// No output for too long
    Idle,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Total => f.write_str("total"),
            TimeoutKind::Idle => f.write_str("idle"),
        }
    }
}

/// Error type for process supervision
#[derive(Debug, Error)]
pub enum DriverError {
    /// The executable could not be started
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// A budget ran out; the process has been stopped
    #[error("{program} timed out ({kind}) after {}s", .elapsed.as_secs())]
    Timeout {
        program: String,
        kind: TimeoutKind,
        elapsed: Duration,
    },

    #[error("failed to supervise process: {0}")]
    Io(#[from] io::Error),
}

/// Program, arguments and working directory of one tool invocation
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    /// Shell-like rendering for logs
    pub fn display(&self) -> String {
        let mut out = self.program.display().to_string();
        for arg in &self.args {
            out.push(' ');
            out.push_str(&arg.to_string_lossy());
        }
        out
    }

    /// Argument values as strings, for assertions and logging
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Receives the process output while it runs
pub trait OutputObserver {
    /// Returns true when the line shows forward progress; only those lines
    /// reset the idle budget.
    fn on_line(&mut self, line: &OutputLine) -> bool;

    /// Called every poll interval with the time since start
    fn on_tick(&mut self, _elapsed: Duration) {}
}

/// Budgets and cadence for one supervised run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaitLimits {
    pub poll_interval: Duration,
    pub total_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub grace_period: Duration,
}

impl Default for WaitLimits {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            total_timeout: None,
            idle_timeout: None,
            grace_period: Duration::from_secs(10),
        }
    }
}

/// What the poll loop should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickVerdict {
    Continue,
    Cancel,
    Timeout(TimeoutKind),
}

/// Start and last-activity timestamps for one run
#[derive(Debug, Clone, Copy)]
pub struct PollClock {
    started: Instant,
    last_activity: Instant,
}

impl PollClock {
    pub fn new(now: Instant) -> Self {
        Self {
            started: now,
            last_activity: now,
        }
    }

    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Cancellation wins over the total budget, which wins over idle.
    pub fn verdict(&self, now: Instant, limits: &WaitLimits, cancel_requested: bool) -> TickVerdict {
        if cancel_requested {
            return TickVerdict::Cancel;
        }
        if let Some(total) = limits.total_timeout {
            if self.elapsed(now) >= total {
                return TickVerdict::Timeout(TimeoutKind::Total);
            }
        }
        if let Some(idle) = limits.idle_timeout {
            if self.idle(now) >= idle {
                return TickVerdict::Timeout(TimeoutKind::Idle);
            }
        }
        TickVerdict::Continue
    }
}

/// Bounded buffer of the most recent output
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: VecDeque<String>,
    bytes: usize,
    limit: usize,
}

impl OutputTail {
    pub fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            limit,
        }
    }

    pub fn push(&mut self, line: &str) {
        if self.limit == 0 {
            return;
        }
        let line = if line.len() > self.limit {
            let mut start = line.len() - self.limit;
            while !line.is_char_boundary(start) {
                start += 1;
            }
            &line[start..]
        } else {
            line
        };
        self.bytes += line.len() + 1;
        self.lines.push_back(line.to_string());
        while self.bytes > self.limit + 1 {
            match self.lines.pop_front() {
                Some(old) => self.bytes -= old.len() + 1,
                None => break,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn as_string(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExitReport {
    pub status: ExitStatus,
    pub elapsed: Duration,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn describe(&self) -> String {
        match self.status.code() {
            Some(code) => format!("exit code {}", code),
            None => "termination by signal".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StopReport {
    pub status: Option<ExitStatus>,
    /// The process ignored the terminate request and was killed
    pub forced: bool,
}

#[derive(Debug)]
pub enum WaitOutcome {
    Exited(ExitReport),
    Cancelled(StopReport),
}

const LINE_CHANNEL_CAPACITY: usize = 1024;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A launched tool under supervision
#[derive(Debug)]
pub struct RunningProcess {
    child: Child,
    program: String,
    pid: Option<u32>,
    lines: mpsc::Receiver<OutputLine>,
    streams_open: bool,
    tail: OutputTail,
}

impl RunningProcess {
    /// Launch the tool with piped output and no stdin
    pub fn start(spec: &CommandSpec, tail_limit: usize) -> Result<Self, DriverError> {
        let program = spec.program_name();
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // own process group, so a stop reaches helpers the tool spawned
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        debug!(command = %spec.display(), "spawning");
        let mut child = cmd.spawn().map_err(|source| DriverError::Spawn {
            program: program.clone(),
            source,
        })?;

        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, OutputStream::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, OutputStream::Stderr, tx);
        }

        Ok(Self {
            pid: child.id(),
            child,
            program,
            lines: rx,
            streams_open: true,
            tail: OutputTail::new(tail_limit),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Most recent output, for failure diagnostics
    pub fn tail(&self) -> String {
        self.tail.as_string()
    }

    /// Supervise until exit, cancellation or timeout
    pub async fn wait<O: OutputObserver + ?Sized>(
        &mut self,
        limits: &WaitLimits,
        cancel: &mut CancelSignal,
        observer: &mut O,
    ) -> Result<WaitOutcome, DriverError> {
        let mut clock = PollClock::new(Instant::now());
        let mut ticker = tokio::time::interval(limits.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let now = Instant::now();
            match clock.verdict(now, limits, cancel.is_cancelled()) {
                TickVerdict::Continue => {}
                TickVerdict::Cancel => {
                    debug!(program = %self.program, pid = ?self.pid, "stop requested");
                    let stop = self.request_stop(limits.grace_period).await?;
                    self.drain(observer).await;
                    return Ok(WaitOutcome::Cancelled(stop));
                }
                TickVerdict::Timeout(kind) => {
                    let elapsed = clock.elapsed(now);
                    warn!(program = %self.program, %kind, elapsed_secs = elapsed.as_secs(), "timed out, stopping");
                    self.request_stop(limits.grace_period).await?;
                    self.drain(observer).await;
                    return Err(DriverError::Timeout {
                        program: self.program.clone(),
                        kind,
                        elapsed,
                    });
                }
            }

            tokio::select! {
                status = self.child.wait() => {
                    let status = status?;
                    let elapsed = clock.elapsed(Instant::now());
                    self.drain(observer).await;
                    return Ok(WaitOutcome::Exited(ExitReport { status, elapsed }));
                }
                line = self.lines.recv(), if self.streams_open => {
                    match line {
                        Some(line) => {
                            self.tail.push(&line.text);
                            if observer.on_line(&line) {
                                clock.record_activity(Instant::now());
                            }
                        }
                        None => self.streams_open = false,
                    }
                }
                _ = ticker.tick() => {
                    observer.on_tick(clock.elapsed(Instant::now()));
                }
                _ = cancel.cancelled() => {}
            }
        }
    }

    /// Terminate the process group, wait up to `grace`, then kill it
    pub async fn request_stop(&mut self, grace: Duration) -> Result<StopReport, DriverError> {
        if let Some(status) = self.child.try_wait()? {
            // the tool is gone; make sure nothing it left behind outlives it
            signal_group(self.pid, GroupSignal::Kill)?;
            return Ok(StopReport {
                status: Some(status),
                forced: false,
            });
        }

        signal_group(self.pid, GroupSignal::Terminate)?;
        #[cfg(not(unix))]
        self.child.start_kill()?;
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                signal_group(self.pid, GroupSignal::Kill)?;
                Ok(StopReport {
                    status: Some(status),
                    forced: false,
                })
            }
            Err(_) => {
                warn!(program = %self.program, pid = ?self.pid, grace_secs = grace.as_secs(), "did not exit after terminate, killing");
                signal_group(self.pid, GroupSignal::Kill)?;
                self.child.kill().await?;
                Ok(StopReport {
                    status: self.child.try_wait()?,
                    forced: true,
                })
            }
        }
    }

    async fn drain<O: OutputObserver + ?Sized>(&mut self, observer: &mut O) {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.streams_open {
            match tokio::time::timeout_at(deadline, self.lines.recv()).await {
                Ok(Some(line)) => {
                    self.tail.push(&line.text);
                    observer.on_line(&line);
                }
                Ok(None) => self.streams_open = false,
                Err(_) => break,
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

/// Signal every process in the group led by `pid`
#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: GroupSignal) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return Ok(());
    };
    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pid), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: GroupSignal) -> io::Result<()> {
    Ok(())
}

fn spawn_reader<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(256);
        loop {
            match read_segment(&mut reader, &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf).trim_end().to_string();
                    if text.is_empty() {
                        continue;
                    }
                    if tx.send(OutputLine { stream, text }).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Read up to the next `\n` or `\r`; progress-bar tools rewrite one line
/// with carriage returns.
async fn read_segment<R: AsyncBufRead + Unpin>(reader: &mut R, out: &mut Vec<u8>) -> io::Result<usize> {
    out.clear();
    let mut total = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(total);
        }
        if let Some(pos) = available.iter().position(|b| *b == b'\n' || *b == b'\r') {
            out.extend_from_slice(&available[..pos]);
            reader.consume(pos + 1);
            return Ok(total + pos + 1);
        }
        let len = available.len();
        out.extend_from_slice(available);
        reader.consume(len);
        total += len;
    }
}

/// Resolve a bare program name against PATH
pub fn which(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
