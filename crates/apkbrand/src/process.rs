//! Child-process execution for the external Android tools.
//!
//! Every invocation is killable from outside: the spawned process is handed to
//! a [`ProcessTracker`] before the runner starts waiting on it, so a cancel can
//! always find and terminate it. Each run is bounded by a timeout and only the
//! tail of its output is kept.

use crate::error::{BuildError, ToolExit, ToolFailure};
use crate::utils::tail_buf::{TAIL_LINES, TailBuf};
use std::ffi::{OsStr, OsString};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, debug_span, warn};

/// How long to wait for the output readers once the process itself is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

/// Where live process handles are registered while a tool runs.
pub trait ProcessTracker: Send + Sync {
    /// Fails when the owning build is no longer in flight; the runner then
    /// kills the process it just spawned.
    fn track(&self, handle: ProcessHandle) -> Result<(), BuildError>;

    fn untrack(&self, process_id: u64);
}

/// Tracker for invocations that belong to no build (preflight, tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct Untracked;

impl ProcessTracker for Untracked {
    fn track(&self, _handle: ProcessHandle) -> Result<(), BuildError> {
        Ok(())
    }

    fn untrack(&self, _process_id: u64) {}
}

/// A cloneable handle that can forcibly terminate one running tool.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    id: u64,
    tool: String,
    pid: Option<u32>,
    killed: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ProcessHandle {
    fn new(tool: &str, pid: Option<u32>) -> Self {
        Self {
            id: NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed),
            tool: tool.to_string(),
            pid,
            killed: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Sends SIGKILL to the tool's whole process group and wakes the runner.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!(tool = %self.tool, pid = ?self.pid, "killing process");
        if let Some(pid) = self.pid {
            kill_group(pid);
        }
        self.notify.notify_one();
    }

    async fn wait_killed(&self) {
        if self.is_killed() {
            return;
        }
        self.notify.notified().await;
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!(pid, %err, "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

/// A fully described external tool invocation.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    label: String,
    program: PathBuf,
    args: Vec<OsString>,
    workdir: Option<PathBuf>,
    timeout: Duration,
    secrets: Vec<String>,
}

impl ToolCommand {
    pub fn new(label: impl Into<String>, program: impl AsRef<Path>) -> Self {
        Self {
            label: label.into(),
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            workdir: None,
            timeout: Duration::from_secs(60),
            secrets: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.workdir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Masks `secret` wherever it appears in logs and diagnostics.
    pub fn redact(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if !secret.is_empty() {
            self.secrets.push(secret);
        }
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The command line as it is safe to show.
    pub fn display(&self) -> String {
        let mut rendered = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(&arg.to_string_lossy());
        }

        self.secrets
            .iter()
            .fold(rendered, |acc, secret| acc.replace(secret.as_str(), "***"))
    }

    fn failure(&self, exit: ToolExit, stdout: String, stderr: String) -> BuildError {
        BuildError::tool(ToolFailure {
            tool: self.label.clone(),
            command: self.display(),
            exit,
            stdout_tail: stdout,
            stderr_tail: stderr,
        })
    }
}

/// What a successful invocation left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub stdout_tail: String,
    pub stderr_tail: String,
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    Killed,
    TimedOut,
}

/// Runs `cmd` to completion, registering it with `tracker` while it is alive.
pub async fn run(cmd: &ToolCommand, tracker: &dyn ProcessTracker) -> Result<ToolOutput, BuildError> {
    let span = debug_span!("tool", tool = %cmd.label);
    run_inner(cmd, tracker).instrument(span).await
}

async fn run_inner(cmd: &ToolCommand, tracker: &dyn ProcessTracker) -> Result<ToolOutput, BuildError> {
    debug!("→ {}", cmd.display());

    let mut command = Command::new(&cmd.program);
    command
        .args(&cmd.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &cmd.workdir {
        command.current_dir(dir);
    }
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(|err| {
        cmd.failure(
            ToolExit::SpawnFailed(err.to_string()),
            String::new(),
            String::new(),
        )
    })?;

    let mut stdout_reader = spawn_tail_reader(child.stdout.take());
    let mut stderr_reader = spawn_tail_reader(child.stderr.take());

    let handle = ProcessHandle::new(&cmd.label, child.id());
    if let Err(err) = tracker.track(handle.clone()) {
        terminate(&mut child, &handle).await;
        stdout_reader.abort();
        stderr_reader.abort();
        return Err(err);
    }

    let waited = tokio::select! {
        status = child.wait() => Waited::Exited(status),
        _ = handle.wait_killed() => Waited::Killed,
        _ = tokio::time::sleep(cmd.timeout) => Waited::TimedOut,
    };

    if !matches!(waited, Waited::Exited(_)) {
        terminate(&mut child, &handle).await;
    }
    tracker.untrack(handle.id());

    let stdout_tail = drain(&mut stdout_reader).await;
    let stderr_tail = drain(&mut stderr_reader).await;

    match waited {
        Waited::Exited(Ok(status)) if status.success() => {
            debug!(tool = %cmd.label, "exited cleanly");
            Ok(ToolOutput {
                exit_code: status.code().unwrap_or_default(),
                stdout_tail,
                stderr_tail,
            })
        }
        Waited::Exited(Ok(status)) => {
            let exit = if handle.is_killed() {
                ToolExit::Killed
            } else {
                ToolExit::Status(status.code())
            };
            Err(cmd.failure(exit, stdout_tail, stderr_tail))
        }
        Waited::Exited(Err(err)) => Err(BuildError::io(
            format!("waiting for {}", cmd.label),
            err,
        )),
        Waited::Killed => Err(cmd.failure(ToolExit::Killed, stdout_tail, stderr_tail)),
        Waited::TimedOut => {
            warn!(tool = %cmd.label, timeout = ?cmd.timeout, "tool timed out, killed");
            Err(cmd.failure(ToolExit::TimedOut(cmd.timeout), stdout_tail, stderr_tail))
        }
    }
}

async fn terminate(child: &mut Child, handle: &ProcessHandle) {
    if let Some(pid) = handle.pid() {
        kill_group(pid);
    }
    if let Err(err) = child.start_kill() {
        debug!(%err, "start_kill failed");
    }
    if let Err(err) = child.wait().await {
        debug!(%err, "reaping killed child failed");
    }
}

fn spawn_tail_reader<R>(stream: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut tail = TailBuf::new(TAIL_LINES);
        let Some(mut stream) = stream else {
            return String::new();
        };

        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let _ = tail.write_all(&chunk[..n]);
                }
            }
        }

        tail.contents()
    })
}

/// Grandchildren can hold a pipe open after the tool itself is gone.
async fn drain(reader: &mut JoinHandle<String>) -> String {
    match tokio::time::timeout(DRAIN_GRACE, &mut *reader).await {
        Ok(Ok(tail)) => tail,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            reader.abort();
            String::new()
        }
    }
}
