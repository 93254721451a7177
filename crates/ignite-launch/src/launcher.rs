//! Starting the distributed runtime and keeping hold of it.

use crate::error::{JobResult, LaunchError};
use crate::events::{EventSink, JobEvent};
use crate::invocation::RuntimeInvocation;
use crate::job::{LaunchId, TrainingJobConfig};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const DEFAULT_RUNTIME: &str = "deepspeed";
pub const DEFAULT_TAIL_LINES: usize = 20;
/// How long a stopped runtime gets to shut its workers down before it is killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(10);
const TERMINATE_POLL: Duration = Duration::from_millis(100);
const READER_DRAIN: Duration = Duration::from_millis(500);

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobExit {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    /// Last lines the runtime wrote to stderr.
    pub diagnostics: Vec<String>,
}

impl JobExit {
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A started process as seen by a [`JobHandle`].
pub trait RunningProcess: Send {
    fn id(&self) -> u32;

    fn try_wait(&mut self) -> io::Result<Option<JobExit>>;

    fn wait(&mut self) -> io::Result<JobExit>;

    /// Ask the process to stop so it can take its own children down with it.
    fn interrupt(&mut self) -> io::Result<()> {
        self.kill()
    }

    fn kill(&mut self) -> io::Result<()>;
}

pub trait ProcessLauncher {
    /// Program name used when rendering the command line.
    fn program(&self) -> &str;

    fn spawn(&self, invocation: &RuntimeInvocation) -> JobResult<Box<dyn RunningProcess>>;
}

/// A running training job.
pub struct JobHandle {
    launch_id: LaunchId,
    started_at: DateTime<Utc>,
    command: String,
    process: Box<dyn RunningProcess>,
    exit: Option<JobExit>,
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("launch_id", &self.launch_id)
            .field("pid", &self.process.id())
            .field("started_at", &self.started_at)
            .field("exit", &self.exit)
            .finish_non_exhaustive()
    }
}

impl JobHandle {
    #[must_use]
    pub fn new(launch_id: LaunchId, command: String, process: Box<dyn RunningProcess>) -> Self {
        Self { launch_id, started_at: Utc::now(), command, process, exit: None }
    }

    #[must_use]
    pub fn launch_id(&self) -> &LaunchId {
        &self.launch_id
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.process.id()
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Wall-clock time since the runtime was started.
    #[must_use]
    pub fn elapsed(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// `Ok(None)` while the job is still running.
    pub fn try_wait(&mut self) -> JobResult<Option<JobExit>> {
        if self.exit.is_none() {
            let pid = self.pid();
            if let Some(exit) = self.process.try_wait().map_err(|source| LaunchError::Wait { pid, source })? {
                self.record(exit);
            }
        }
        Ok(self.exit.clone())
    }

    /// Block until the job exits.
    pub fn wait(&mut self) -> JobResult<JobExit> {
        if let Some(exit) = &self.exit {
            return Ok(exit.clone());
        }
        let pid = self.pid();
        let exit = self.process.wait().map_err(|source| LaunchError::Wait { pid, source })?;
        self.record(exit.clone());
        Ok(exit)
    }

    /// Stop the runtime and reap it, allowing [`TERMINATE_GRACE`] for a clean shutdown.
    pub fn terminate(&mut self) -> JobResult<JobExit> {
        self.terminate_within(TERMINATE_GRACE)
    }

    /// Send the runtime a stop request, then kill it if it is still running after `grace`.
    /// A job that already exited is left alone.
    pub fn terminate_within(&mut self, grace: Duration) -> JobResult<JobExit> {
        if let Some(exit) = self.try_wait()? {
            return Ok(exit);
        }
        let pid = self.pid();
        info!(pid, launch_id = %self.launch_id, "stopping training runtime");
        self.process.interrupt().map_err(|source| LaunchError::Wait { pid, source })?;

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Some(exit) = self.try_wait()? {
                return Ok(exit);
            }
            std::thread::sleep(TERMINATE_POLL);
        }

        warn!(pid, grace_secs = grace.as_secs(), "training runtime did not stop in time, killing it");
        self.process.kill().map_err(|source| LaunchError::Wait { pid, source })?;
        self.wait()
    }

    fn record(&mut self, exit: JobExit) {
        if !exit.success() {
            warn!(launch_id = %self.launch_id, code = ?exit.code, "training runtime exited unsuccessfully");
        }
        self.exit = Some(exit);
    }
}

/// Start the runtime for a validated job.
///
/// No retry: a spawn failure is returned as is and a non-zero exit is only
/// visible through the handle.
pub fn launch(
    launcher: &dyn ProcessLauncher,
    config: &TrainingJobConfig,
    events: &dyn EventSink,
) -> JobResult<JobHandle> {
    let launch_id = LaunchId::new();
    events.on_event(JobEvent::PortSelected { launch_id: launch_id.clone(), port: config.hardware().master_port });
    events.on_event(JobEvent::OutputReady {
        launch_id: launch_id.clone(),
        path: config.paths().output_dir.path().to_path_buf(),
    });

    let invocation = RuntimeInvocation::from_config(config);
    let command = invocation.command_line(launcher.program());
    let process = launcher.spawn(&invocation)?;
    let handle = JobHandle::new(launch_id.clone(), command.clone(), process);

    info!(pid = handle.pid(), %launch_id, world_size = config.hardware().world_size(), "training runtime started");
    events.on_event(JobEvent::Spawned { launch_id, pid: handle.pid(), command });
    Ok(handle)
}

/// Spawns the DeepSpeed launcher (or any program that takes the same arguments).
#[derive(Debug, Clone)]
pub struct DeepSpeedLauncher {
    program: String,
    tail_lines: usize,
}

impl Default for DeepSpeedLauncher {
    fn default() -> Self {
        Self::new(DEFAULT_RUNTIME)
    }
}

impl DeepSpeedLauncher {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), tail_lines: DEFAULT_TAIL_LINES }
    }

    #[must_use]
    pub fn with_tail_lines(mut self, lines: usize) -> Self {
        self.tail_lines = lines;
        self
    }
}

impl ProcessLauncher for DeepSpeedLauncher {
    fn program(&self) -> &str {
        &self.program
    }

    fn spawn(&self, invocation: &RuntimeInvocation) -> JobResult<Box<dyn RunningProcess>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(invocation.args());
        cmd.envs(&invocation.env);
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                LaunchError::NotFound { program: self.program.clone() }
            } else {
                LaunchError::Spawn { program: self.program.clone(), source }
            }
        })?;

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(self.tail_lines)));
        let reader = child.stderr.take().map(|stderr| {
            let tail = Arc::clone(&tail);
            let limit = self.tail_lines;
            std::thread::spawn(move || relay_stderr(stderr, &tail, limit))
        });

        Ok(Box::new(ChildProcess { child, tail, reader, stopped: false }))
    }
}

/// Echo the child's stderr and keep the last `limit` lines.
fn relay_stderr(stderr: impl Read, tail: &Mutex<VecDeque<String>>, limit: usize) {
    for chunk in BufReader::new(stderr).split(b'\n') {
        let Ok(bytes) = chunk else { break };
        let line = String::from_utf8_lossy(&bytes).trim_end_matches('\r').to_string();
        eprintln!("{line}");
        if limit == 0 {
            continue;
        }
        let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
        if tail.len() == limit {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

struct ChildProcess {
    child: Child,
    tail: Arc<Mutex<VecDeque<String>>>,
    reader: Option<JoinHandle<()>>,
    stopped: bool,
}

impl ChildProcess {
    fn finish(&mut self, code: Option<i32>) -> JobExit {
        if let Some(reader) = self.reader.take() {
            // Workers of a stopped launcher may still hold the pipe open, so
            // the reader only gets a short window to drain.
            let deadline = Instant::now() + READER_DRAIN;
            while self.stopped && !reader.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if !self.stopped || reader.is_finished() {
                let _ = reader.join();
            }
        }
        let diagnostics = self.tail.lock().unwrap_or_else(PoisonError::into_inner).iter().cloned().collect();
        JobExit { code, diagnostics }
    }
}

impl RunningProcess for ChildProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<JobExit>> {
        Ok(self.child.try_wait()?.map(|status| self.finish(status.code())))
    }

    fn wait(&mut self) -> io::Result<JobExit> {
        let status = self.child.wait()?;
        Ok(self.finish(status.code()))
    }

    /// SIGTERM, which the DeepSpeed runner forwards to every rank.
    #[cfg(unix)]
    fn interrupt(&mut self) -> io::Result<()> {
        self.stopped = true;
        let status = Command::new("kill").arg("-TERM").arg(self.child.id().to_string()).status()?;
        if !status.success() {
            // Already gone; the next poll reaps it.
            warn!(pid = self.child.id(), "kill -TERM reported failure");
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.stopped = true;
        self.child.kill()
    }
}

/// Records invocations instead of starting anything.
#[derive(Debug)]
pub struct RecordingLauncher {
    exit_code: Option<i32>,
    diagnostics: Vec<String>,
    missing: bool,
    invocations: Mutex<Vec<RuntimeInvocation>>,
}

impl Default for RecordingLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingLauncher {
    /// Jobs exit immediately with code 0.
    #[must_use]
    pub fn new() -> Self {
        Self { exit_code: Some(0), diagnostics: Vec::new(), missing: false, invocations: Mutex::new(Vec::new()) }
    }

    #[must_use]
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    #[must_use]
    pub fn with_diagnostics(mut self, lines: Vec<String>) -> Self {
        self.diagnostics = lines;
        self
    }

    /// Jobs keep running until terminated.
    #[must_use]
    pub fn running(mut self) -> Self {
        self.exit_code = None;
        self
    }

    /// Every spawn fails as if the runtime were not installed.
    #[must_use]
    pub fn missing_runtime(mut self) -> Self {
        self.missing = true;
        self
    }

    #[must_use]
    pub fn invocations(&self) -> Vec<RuntimeInvocation> {
        self.invocations.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl ProcessLauncher for RecordingLauncher {
    fn program(&self) -> &str {
        DEFAULT_RUNTIME
    }

    fn spawn(&self, invocation: &RuntimeInvocation) -> JobResult<Box<dyn RunningProcess>> {
        if self.missing {
            return Err(LaunchError::NotFound { program: DEFAULT_RUNTIME.to_string() }.into());
        }
        let mut invocations = self.invocations.lock().unwrap_or_else(PoisonError::into_inner);
        invocations.push(invocation.clone());
        let pid = 4000 + u32::try_from(invocations.len()).unwrap_or(u32::MAX - 4000);
        Ok(Box::new(ScriptedProcess {
            pid,
            exit_code: self.exit_code,
            diagnostics: self.diagnostics.clone(),
            killed: false,
        }))
    }
}

struct ScriptedProcess {
    pid: u32,
    exit_code: Option<i32>,
    diagnostics: Vec<String>,
    killed: bool,
}

impl RunningProcess for ScriptedProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn try_wait(&mut self) -> io::Result<Option<JobExit>> {
        let code = if self.killed { None } else { self.exit_code };
        let done = self.killed || self.exit_code.is_some();
        Ok(done.then(|| JobExit { code, diagnostics: self.diagnostics.clone() }))
    }

    fn wait(&mut self) -> io::Result<JobExit> {
        self.try_wait()?
            .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "scripted process runs until terminated"))
    }

    fn kill(&mut self) -> io::Result<()> {
        self.killed = true;
        Ok(())
    }
}
