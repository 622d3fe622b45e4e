//! The supervised OS process.
//!
//! [`ManagedProcess`] spawns the game server in its own process group,
//! forwards its output into `tracing`, and publishes its exit status.
//! Signals always target the whole group.

use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::error::{SupervisorError, SupervisorResult};

const STDOUT_BUFFER: usize = 1024;

/// Lifecycle of the supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Idle => "idle",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Stopped => "stopped",
            ProcessState::Failed => "failed",
        }
    }

    /// `stopped` and `failed` are final.
    pub fn is_final(&self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Failed)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Replace `$VAR` and `${VAR}` with values from `lookup`; unset variables
/// expand to the empty string. A `$` not followed by a name is kept.
pub fn expand_env<F>(arg: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let is_start = |c: char| c == '_' || c.is_ascii_alphabetic();
    let is_name = |c: char| c == '_' || c.is_ascii_alphanumeric();

    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(idx) = rest.find('$') {
        out.push_str(&rest[..idx]);
        let after = &rest[idx + 1..];
        if let Some(braced) = after.strip_prefix('{')
            && let Some(close) = braced.find('}')
            && braced[..close].starts_with(is_start)
            && braced[..close].chars().all(is_name)
        {
            out.push_str(&lookup(&braced[..close]).unwrap_or_default());
            rest = &braced[close + 1..];
        } else if after.starts_with(is_start) {
            let len = after.find(|c: char| !is_name(c)).unwrap_or(after.len());
            out.push_str(&lookup(&after[..len]).unwrap_or_default());
            rest = &after[len..];
        } else {
            out.push('$');
            rest = after;
        }
    }
    out.push_str(rest);
    out
}

/// A running child process and its process group.
pub struct ManagedProcess {
    pid: u32,
    exit: watch::Receiver<Option<ExitInfo>>,
    stdout: broadcast::Sender<String>,
    first_stdout: Mutex<Option<broadcast::Receiver<String>>>,
}

impl ManagedProcess {
    /// Spawn `argv` as the leader of a new process group.
    ///
    /// Arguments are expanded with [`expand_env`] against the supervisor's
    /// environment before the exec.
    pub fn spawn(argv: &[String], workdir: Option<&Path>) -> SupervisorResult<Self> {
        let expanded: Vec<String> = argv
            .iter()
            .map(|arg| expand_env(arg, |key| std::env::var(key).ok()))
            .collect();
        let Some((program, args)) = expanded.split_first() else {
            return Err(SupervisorError::Spawn {
                program: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(dir) = workdir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| SupervisorError::Spawn {
            program: program.clone(),
            source: std::io::Error::other("child exited before its pid was read"),
        })?;

        let (stdout_tx, first_rx) = broadcast::channel(STDOUT_BUFFER);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, "stdout", Some(stdout_tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, "stderr", None));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let info = match child.wait().await {
                Ok(status) => ExitInfo::from_status(status),
                Err(e) => {
                    warn!(pid, error = %e, "failed to wait for process");
                    ExitInfo {
                        code: None,
                        signal: None,
                    }
                }
            };
            debug!(pid, exit = %info, "process exited");
            let _ = exit_tx.send(Some(info));
        });

        info!(pid, program = %program, "process spawned");
        Ok(Self {
            pid,
            exit: exit_rx,
            stdout: stdout_tx,
            first_stdout: Mutex::new(Some(first_rx)),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Stdout lines. The first caller also sees lines emitted before it
    /// subscribed.
    pub fn stdout_lines(&self) -> broadcast::Receiver<String> {
        let mut first = self
            .first_stdout
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        first.take().unwrap_or_else(|| self.stdout.subscribe())
    }

    /// Exit status, if the process has exited.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    /// Wait until the process has exited.
    pub async fn wait(&self) -> ExitInfo {
        let mut exit = self.exit.clone();
        loop {
            if let Some(info) = *exit.borrow_and_update() {
                return info;
            }
            if exit.changed().await.is_err() {
                return (*exit.borrow()).unwrap_or(ExitInfo {
                    code: None,
                    signal: None,
                });
            }
        }
    }

    /// Send SIGTERM to the process group.
    pub fn terminate(&self) -> SupervisorResult<()> {
        self.signal(Signal::SIGTERM)
    }

    /// Send SIGKILL to the process group.
    pub fn kill(&self) -> SupervisorResult<()> {
        self.signal(Signal::SIGKILL)
    }

    fn signal(&self, signal: Signal) -> SupervisorResult<()> {
        if self.exit_info().is_some() {
            return Ok(());
        }
        let pgid = i32::try_from(self.pid).unwrap_or(i32::MAX);
        debug!(pgid, ?signal, "signalling process group");
        match killpg(Pid::from_raw(pgid), signal) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(source) => Err(SupervisorError::Signal { pgid, source }),
        }
    }
}

async fn forward_lines<R>(reader: R, stream: &'static str, tx: Option<broadcast::Sender<String>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if stream == "stderr" {
                    warn!(stream, "{line}");
                } else {
                    info!(stream, "{line}");
                }
                if let Some(tx) = &tx {
                    let _ = tx.send(line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(stream, error = %e, "output stream closed");
                break;
            }
        }
    }
}
