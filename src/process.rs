// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! External process invocation.
//!
//! Every piece of version control work in deploygit is done by shelling out to
//! the Git binary. This module provides the one place where that happens. An
//! [`Invocation`] describes the command to run, and [`Invocation::run`] spawns
//! it, streams each line of output to a [`LogSink`] as it arrives, and hands
//! back a [`CommandOutput`] containing the exit code along with everything
//! that was captured.
//!
//! # Cancellation
//!
//! Only one child process is considered to be "current" at any given moment.
//! The caller owns a [`CancelHandle`] that is passed into each invocation.
//! Cancelling the handle kills whatever child is running under it, together
//! with every process that child spawned, e.g., the `ssh` that Git runs for a
//! fetch. No attempt is made to roll back whatever state the killed processes
//! leave behind.

use futures::try_join;
use std::{
    ffi::{OsStr, OsString},
    io,
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, Command},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Line oriented output sink.
///
/// Receives each line of output produced by external commands, along with
/// any progress messages that workflows want the operator to see.
pub trait LogSink: Send + Sync {
    /// Emit one line of output.
    fn line(&self, line: &str);
}

impl<F> LogSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn line(&self, line: &str) {
        self(line)
    }
}

/// Forward all lines to [`tracing`] at the info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn line(&self, line: &str) {
        info!("{line}");
    }
}

/// Discard all lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LogSink for NullSink {
    fn line(&self, _line: &str) {}
}

/// Handle used to cancel the currently running child process.
///
/// Cheap to clone. All clones observe the same cancellation state. Once
/// cancelled, the handle stays cancelled, so any later invocation that uses
/// it fails immediately.
#[derive(Debug, Default, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Construct new cancellation handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request termination of the current child process.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Captured result of one external command.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code of command, or -1 if terminated by a signal.
    pub code: i32,

    /// Everything written to stdout.
    pub stdout: String,

    /// Everything written to stderr.
    pub stderr: String,
}

impl CommandOutput {
    /// Command exited with code zero.
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Description of an external command to run.
#[derive(Debug, Clone)]
pub struct Invocation {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
    stdin: Option<String>,
}

impl Invocation {
    /// Construct new invocation of target program.
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            stdin: None,
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append listing of arguments.
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Override environment variable for this invocation only.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Override listing of environment variables for this invocation only.
    pub fn envs(
        mut self,
        vars: impl IntoIterator<Item = (impl Into<OsString>, impl Into<OsString>)>,
    ) -> Self {
        self.envs
            .extend(vars.into_iter().map(|(key, value)| (key.into(), value.into())));
        self
    }

    /// Run command inside target directory.
    pub fn current_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(path.into());
        self
    }

    /// Pipe text into standard input of command.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Program name.
    pub fn program(&self) -> &OsStr {
        &self.program
    }

    /// Render invocation as a single line for log output.
    pub fn display(&self) -> String {
        let mut line = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    /// Spawn command and wait for it to finish.
    ///
    /// Output lines are streamed to `sink` as they arrive. Lines from stderr
    /// are prefixed with "stderr: ". A non-zero exit code is _not_ an error
    /// here, callers decide what a failure means for them.
    ///
    /// # Errors
    ///
    /// - Return [`ProcessError::Cancelled`] if `cancel` fires before the
    ///   command finishes, or was already cancelled.
    /// - Return [`ProcessError::Spawn`] if command cannot be started.
    /// - Return [`ProcessError::Io`] if output cannot be collected.
    #[instrument(skip(self, sink, cancel), fields(cmd = %self.display()), level = "debug")]
    pub async fn run(self, sink: &dyn LogSink, cancel: &CancelHandle) -> Result<CommandOutput> {
        let cmd_display = self.display();
        if cancel.is_cancelled() {
            return Err(ProcessError::Cancelled { command: cmd_display });
        }

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(key, value)| (key, value)))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        // INVARIANT: Child leads its own process group, so cancellation can
        //   take down everything it spawned along with it.
        #[cfg(unix)]
        command.process_group(0);

        debug!("spawn {cmd_display}");
        let mut child = command.spawn().map_err(|err| ProcessError::Spawn {
            source: err,
            command: cmd_display.clone(),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| missing_pipe(&cmd_display, "stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe(&cmd_display, "stderr"))?;
        let stdin = child.stdin.take();
        let input = self.stdin;

        let feed = async move {
            if let (Some(mut pipe), Some(input)) = (stdin, input) {
                let written = match pipe.write_all(input.as_bytes()).await {
                    Ok(()) => pipe.shutdown().await,
                    Err(err) => Err(err),
                };

                // INVARIANT: Child may exit without reading all of its input.
                match written {
                    Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                        debug!("child closed stdin early");
                    }
                    other => other?,
                }
            }
            Ok::<_, io::Error>(())
        };
        let drain_out = drain(stdout, sink, "");
        let drain_err = drain(stderr, sink, "stderr: ");

        let outcome = tokio::select! {
            result = async {
                let ((), stdout, stderr) = try_join!(feed, drain_out, drain_err)?;
                let status = child.wait().await?;
                Ok::<_, io::Error>((status, stdout, stderr))
            } => Some(result),
            _ = cancel.cancelled() => None,
        };

        match outcome {
            Some(result) => {
                let (status, stdout, stderr) = result.map_err(|err| ProcessError::Io {
                    source: err,
                    command: cmd_display.clone(),
                })?;

                Ok(CommandOutput {
                    code: status.code().unwrap_or(-1),
                    stdout,
                    stderr,
                })
            }
            None => {
                warn!("cancelling {cmd_display}");
                sink.line(&format!("cancelled: {cmd_display}"));
                kill_tree(&mut child, &cmd_display);
                let _ = child.wait().await;
                Err(ProcessError::Cancelled { command: cmd_display })
            }
        }
    }
}

async fn drain(
    pipe: impl AsyncRead + Unpin,
    sink: &dyn LogSink,
    prefix: &str,
) -> io::Result<String> {
    let mut reader = BufReader::new(pipe);
    let mut buffer = Vec::new();
    let mut captured = String::new();
    loop {
        buffer.clear();
        if reader.read_until(b'\n', &mut buffer).await? == 0 {
            break;
        }

        // INVARIANT: Output is not guaranteed to be valid UTF-8.
        let text = String::from_utf8_lossy(&buffer);
        let line = text.strip_suffix('\n').unwrap_or(&text);
        let line = line.strip_suffix('\r').unwrap_or(line);
        sink.line(&format!("{prefix}{line}"));
        captured.push_str(line);
        captured.push('\n');
    }

    Ok(captured)
}

// Kill child along with everything it spawned, falling back to the child
// alone if the whole tree cannot be reached.
fn kill_tree(child: &mut Child, cmd_display: &str) {
    if let Some(pid) = child.id() {
        match kill_process_group(pid) {
            Ok(()) => return,
            Err(err) => warn!("failed to kill process tree of {cmd_display}: {err}"),
        }
    }

    if let Err(err) = child.start_kill() {
        warn!("failed to kill {cmd_display}: {err}");
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pid).map_err(io::Error::other)?;

    // SAFETY: kill(2) takes no pointers. A negative pid addresses the
    //   process group the child was made leader of at spawn time.
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(windows)]
fn kill_process_group(pid: u32) -> io::Result<()> {
    let status = std::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!("taskkill exited with {status}")))
    }
}

#[cfg(not(any(unix, windows)))]
fn kill_process_group(_pid: u32) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

fn missing_pipe(command: &str, name: &str) -> ProcessError {
    ProcessError::Io {
        source: io::Error::other(format!("{name} pipe was not captured")),
        command: command.into(),
    }
}

/// Run Git with arguments inside target directory.
///
/// Thin convenience wrapper used by the ledger and the tests.
pub async fn git(
    dir: impl AsRef<Path>,
    args: impl IntoIterator<Item = impl Into<OsString>>,
    sink: &dyn LogSink,
    cancel: &CancelHandle,
) -> Result<CommandOutput> {
    Invocation::new("git")
        .args(args)
        .current_dir(dir.as_ref())
        .run(sink, cancel)
        .await
}

/// Process invocation error types.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Command could not be started at all.
    #[error("failed to start {command:?}")]
    Spawn {
        #[source]
        source: io::Error,
        command: String,
    },

    /// Output of command could not be collected.
    #[error("failed to collect output of {command:?}")]
    Io {
        #[source]
        source: io::Error,
        command: String,
    },

    /// Command was cancelled through its cancel handle.
    #[error("command {command:?} was cancelled")]
    Cancelled { command: String },
}

/// Friendly result alias :3
pub type Result<T, E = ProcessError> = std::result::Result<T, E>;
