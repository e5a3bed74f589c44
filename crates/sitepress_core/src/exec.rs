#[cfg(windows)]
use std::env;
use std::io::{self, Read};
#[cfg(windows)]
use std::path::Path;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

use crate::args::{join_tokens, quote_token, tokenize, unquote_token};
use crate::deferred::Deferred;

pub const DEFAULT_TOOL: &str = "m365";
/// Pause before the single retry of a retryable invocation.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);
pub const REDACTED: &str = "***";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpawnMode {
    /// Run to completion and inspect the captured streams.
    #[default]
    Buffered,
    /// React to stream events as they arrive; first terminal event wins.
    Streaming,
}

/// One external-tool call. Built once, then only read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    args: Vec<String>,
    retry: bool,
    mode: SpawnMode,
    mask: Vec<String>,
}

impl Invocation {
    pub fn new(args: Vec<String>) -> Self {
        Self {
            args,
            retry: false,
            mode: SpawnMode::Buffered,
            mask: Vec::new(),
        }
    }

    pub fn parse(command_line: &str) -> Self {
        Self::new(tokenize(command_line))
    }

    pub fn retryable(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.mode = SpawnMode::Streaming;
        self
    }

    pub fn masking<I, S>(mut self, secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mask.extend(
            secrets
                .into_iter()
                .map(Into::into)
                .filter(|secret: &String| !secret.is_empty()),
        );
        self
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn is_retryable(&self) -> bool {
        self.retry
    }

    pub fn mode(&self) -> SpawnMode {
        self.mode
    }

    pub fn mask(&self) -> &[String] {
        &self.mask
    }

    /// Command line as it may appear in logs and errors.
    pub fn display(&self, program: &str) -> String {
        mask_text(&format!("{program} {}", join_tokens(&self.args)), &self.mask)
    }
}

/// Raw standard output of a successful call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    text: String,
}

impl ExecOutput {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Decode the payload as JSON; `None` when the tool printed nothing.
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<Option<T>> {
        if self.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(self.text.trim()).map(Some)
    }
}

/// Failure of a call. Message and cause are already masked.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ExecError {
    message: String,
    cause: Option<String>,
}

impl ExecError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    fn masked(self, secrets: &[String]) -> Self {
        Self {
            message: mask_text(&self.message, secrets),
            cause: self.cause.map(|cause| mask_text(&cause, secrets)),
        }
    }
}

/// Replace every secret with [`REDACTED`], including the shell-escaped form a
/// secret takes once the tokenizer has re-quoted it.
pub fn mask_text(text: &str, secrets: &[String]) -> String {
    let mut out = text.to_string();
    for secret in secrets.iter().filter(|secret| !secret.is_empty()) {
        let quoted = quote_token(secret);
        let escaped = &quoted[1..quoted.len() - 1];
        if escaped != secret {
            out = out.replace(escaped, REDACTED);
        }
        out = out.replace(secret.as_str(), REDACTED);
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Stdout(String),
    Stderr(String),
    StdoutClosed,
}

/// Process seam between the engine and the operating system.
pub trait ProcessRunner {
    /// Run to completion and capture both streams.
    fn capture(&self, program: &str, args: &[String]) -> io::Result<CapturedOutput>;

    /// Spawn and forward stream events until the process goes away. Returns
    /// as soon as the process is running.
    fn stream(
        &self,
        program: &str,
        args: &[String],
        events: Sender<StreamEvent>,
    ) -> io::Result<()>;
}

/// Runs the real binary. Both modes spawn it directly with the token quoting
/// undone, so no shell ever sees the arguments.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn capture(&self, program: &str, args: &[String]) -> io::Result<CapturedOutput> {
        let output = direct_command(program, args).stdin(Stdio::null()).output()?;
        Ok(CapturedOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }

    fn stream(
        &self,
        program: &str,
        args: &[String],
        events: Sender<StreamEvent>,
    ) -> io::Result<()> {
        let mut child = direct_command(program, args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("missing stdout pipe"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("missing stderr pipe"))?;

        let stdout_events = events.clone();
        thread::spawn(move || {
            forward_chunks(stdout, &stdout_events, StreamEvent::Stdout);
            let _ = stdout_events.send(StreamEvent::StdoutClosed);
        });
        thread::spawn(move || forward_chunks(stderr, &events, StreamEvent::Stderr));
        thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(())
    }
}

fn direct_command(program: &str, args: &[String]) -> Command {
    let mut command = Command::new(program_path(program));
    command.args(args.iter().map(|arg| unquote_token(arg)));
    command
}

// npm installs the tool as a `.cmd` shim, which `Command` does not find on
// its own.
#[cfg(windows)]
fn program_path(program: &str) -> PathBuf {
    let path = Path::new(program);
    if path.extension().is_some() || path.components().count() > 1 {
        return path.to_path_buf();
    }
    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).collect::<Vec<_>>())
        .unwrap_or_default()
        .into_iter()
        .flat_map(|dir| ["exe", "cmd", "bat"].map(|ext| dir.join(program).with_extension(ext)))
        .find(|candidate| candidate.is_file())
        .unwrap_or_else(|| path.to_path_buf())
}

#[cfg(not(windows))]
fn program_path(program: &str) -> PathBuf {
    PathBuf::from(program)
}

// Keeps draining after the receiver hangs up so the child never blocks on a
// full pipe.
fn forward_chunks<S: Read>(
    mut source: S,
    events: &Sender<StreamEvent>,
    wrap: fn(String) -> StreamEvent,
) {
    let mut buffer = [0u8; 4096];
    loop {
        match source.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => {
                let chunk = String::from_utf8_lossy(&buffer[..read]).into_owned();
                let _ = events.send(wrap(chunk));
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

/// Pending until the first terminal outcome is recorded; later outcomes are
/// refused.
#[derive(Debug)]
pub enum CompletionGuard<T> {
    Pending,
    Settled(T),
}

impl<T> Default for CompletionGuard<T> {
    fn default() -> Self {
        Self::Pending
    }
}

impl<T> CompletionGuard<T> {
    pub fn settle(&mut self, outcome: T) -> bool {
        match self {
            Self::Pending => {
                *self = Self::Settled(outcome);
                true
            }
            Self::Settled(_) => false,
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Settled(_))
    }

    pub fn into_outcome(self) -> Option<T> {
        match self {
            Self::Pending => None,
            Self::Settled(outcome) => Some(outcome),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecStats {
    pub invocations: usize,
    pub retries: usize,
    pub failures: usize,
}

pub struct ExecutionEngine<R = SystemRunner> {
    runner: R,
    program: String,
    dry_run: bool,
    retry_delay: Duration,
    echo_stream: bool,
    invocations: AtomicUsize,
    retries: AtomicUsize,
    failures: AtomicUsize,
}

impl ExecutionEngine<SystemRunner> {
    pub fn system(program: impl Into<String>) -> Self {
        Self::new(SystemRunner, program)
    }
}

impl<R: ProcessRunner> ExecutionEngine<R> {
    pub fn new(runner: R, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
            dry_run: false,
            retry_delay: RETRY_DELAY,
            echo_stream: true,
            invocations: AtomicUsize::new(0),
            retries: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_stream_echo(mut self, echo: bool) -> Self {
        self.echo_stream = echo;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn stats(&self) -> ExecStats {
        ExecStats {
            invocations: self.invocations.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    pub fn execute(&self, invocation: &Invocation) -> Result<ExecOutput, ExecError> {
        let deferred = Deferred::new();
        self.attempt(invocation, &deferred, true);
        deferred.wait()
    }

    fn attempt(
        &self,
        invocation: &Invocation,
        deferred: &Deferred<ExecOutput, ExecError>,
        first_run: bool,
    ) {
        match self.run_once(invocation) {
            Ok(output) => {
                deferred.resolve(output);
            }
            Err(error) if invocation.is_retryable() && first_run => {
                self.retries.fetch_add(1, Ordering::Relaxed);
                warn!(
                    command = %invocation.display(&self.program),
                    error = %error,
                    delay_ms = self.retry_delay.as_millis() as u64,
                    "command failed, retrying once"
                );
                if !self.retry_delay.is_zero() {
                    thread::sleep(self.retry_delay);
                }
                self.attempt(invocation, deferred, false);
            }
            Err(error) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                deferred.reject(error);
            }
        }
    }

    fn run_once(&self, invocation: &Invocation) -> Result<ExecOutput, ExecError> {
        let command = invocation.display(&self.program);
        let started = Instant::now();
        debug!(phase = "start", command = %command, "exec");

        if self.dry_run {
            debug!(command = %command, "dry-run, skipping execution");
            return Ok(ExecOutput::default());
        }

        self.invocations.fetch_add(1, Ordering::Relaxed);
        let result = match invocation.mode() {
            SpawnMode::Buffered => self.run_buffered(invocation, &command),
            SpawnMode::Streaming => self.run_streaming(invocation, &command),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => debug!(phase = "success", command = %command, duration_ms, "exec"),
            Err(error) => {
                debug!(phase = "error", command = %command, duration_ms, error = %error, "exec")
            }
        }
        result
    }

    fn run_buffered(
        &self,
        invocation: &Invocation,
        command: &str,
    ) -> Result<ExecOutput, ExecError> {
        let captured = self
            .runner
            .capture(&self.program, invocation.args())
            .map_err(|error| launch_error(&self.program, error).masked(invocation.mask()))?;

        // The tool reports some recoverable errors on stderr with exit code 0.
        if !captured.stderr.is_empty() {
            return Err(ExecError::new(mask_text(&captured.stderr, invocation.mask())));
        }
        if !captured.success() {
            let status = captured
                .exit_code
                .map(|code| code.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(ExecError::new(format!("{command} exited with status {status}")));
        }
        Ok(ExecOutput::new(captured.stdout))
    }

    fn run_streaming(
        &self,
        invocation: &Invocation,
        command: &str,
    ) -> Result<ExecOutput, ExecError> {
        let (sender, receiver) = mpsc::channel();
        self.runner
            .stream(&self.program, invocation.args(), sender)
            .map_err(|error| launch_error(&self.program, error).masked(invocation.mask()))?;

        let mut guard = CompletionGuard::default();
        let mut collected = String::new();
        while !guard.is_settled() {
            let Ok(event) = receiver.recv() else {
                break;
            };
            match event {
                StreamEvent::Stdout(chunk) => {
                    if self.echo_stream {
                        eprint!("{}", mask_text(&chunk, invocation.mask()));
                    }
                    collected.push_str(&chunk);
                }
                StreamEvent::Stderr(chunk) => {
                    guard.settle(Err(ExecError::new(mask_text(&chunk, invocation.mask()))));
                }
                StreamEvent::StdoutClosed => {
                    guard.settle(Ok(ExecOutput::new(std::mem::take(&mut collected))));
                }
            }
        }

        guard.into_outcome().unwrap_or_else(|| {
            Err(ExecError::new(format!(
                "{command} ended without reporting completion"
            )))
        })
    }
}

fn launch_error(program: &str, error: io::Error) -> ExecError {
    ExecError::new(format!("failed to launch {program}: {error}")).with_cause(error.to_string())
}
