//! Child process management.
//!
//! Every collector, worker and storage process is the extractor binary
//! itself, started with the hidden `child` subcommand. The task is written as
//! one JSON line to the child's stdin. Children that expose an RPC endpoint
//! answer with one JSON handshake line on stdout.
//!
//! Hard termination is the only platform-specific operation and is reached
//! through [`force_terminate`].

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::constants::PROCESS_POLL_INTERVAL_MS;
use crate::error::{EngineError, Result};

/// Liveness of a process as seen by its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Running,
    /// Exit code, `None` when the process was ended by a signal
    Exited(Option<i32>),
}

impl ProcessExit {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessExit::Running)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProcessExit::Exited(Some(0)))
    }

    pub fn describe(&self) -> String {
        match self {
            ProcessExit::Running => "running".to_string(),
            ProcessExit::Exited(Some(code)) => format!("exit code {}", code),
            ProcessExit::Exited(None) => "terminated by signal".to_string(),
        }
    }

    /// Error reported for a worker that ended this way
    pub fn worker_error(&self, name: &str, pid: u32) -> EngineError {
        EngineError::WorkerExit {
            name: name.to_string(),
            pid,
            status: self.describe(),
        }
    }
}

/// A process the orchestrator and the foreman can observe and terminate
pub trait ManagedProcess: Send + Sync {
    fn pid(&self) -> u32;

    fn name(&self) -> &str;

    /// Non-blocking liveness check
    fn poll(&self) -> ProcessExit;

    /// Waits for the process to exit, at most `timeout` when given
    fn join(&self, timeout: Option<Duration>) -> ProcessExit {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let state = self.poll();
            if !state.is_running() {
                return state;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return state;
                }
            }
            thread::sleep(Duration::from_millis(PROCESS_POLL_INTERVAL_MS));
        }
    }

    /// Forcibly ends the process if it is still running
    fn terminate(&self) -> Result<()>;

    fn is_alive(&self) -> bool {
        self.poll().is_running()
    }
}

/// Handshake a child prints on stdout once its RPC endpoint is up
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Handshake {
    pub pid: u32,
    pub status_port: Option<u16>,
}

impl Handshake {
    /// Writes the handshake line to stdout
    pub fn announce(&self) -> Result<()> {
        let stdout = std::io::stdout();
        let mut stdout = stdout.lock();
        serde_json::to_writer(&mut stdout, self)?;
        stdout.write_all(b"\n")?;
        stdout.flush()?;
        Ok(())
    }
}

/// Operating system child process started by a [`ProcessLauncher`]
pub struct ChildProcess {
    name: String,
    pid: u32,
    child: Mutex<Child>,
    exit: Mutex<Option<ExitStatus>>,
    // Kept open so the child never writes to a closed pipe
    _stdout: Mutex<Option<BufReader<ChildStdout>>>,
}

impl ChildProcess {
    fn new(name: &str, child: Child, stdout: Option<BufReader<ChildStdout>>) -> Self {
        ChildProcess {
            name: name.to_string(),
            pid: child.id(),
            child: Mutex::new(child),
            exit: Mutex::new(None),
            _stdout: Mutex::new(stdout),
        }
    }

    fn record_exit(&self, status: ExitStatus) -> ProcessExit {
        let mut exit = self.exit.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *exit = Some(status);
        ProcessExit::Exited(status.code())
    }

    fn recorded_exit(&self) -> Option<ProcessExit> {
        let exit = self.exit.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        exit.map(|status| ProcessExit::Exited(status.code()))
    }
}

impl ManagedProcess for ChildProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&self) -> ProcessExit {
        if let Some(exit) = self.recorded_exit() {
            return exit;
        }
        let mut child = self.child.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match child.try_wait() {
            Ok(Some(status)) => {
                drop(child);
                self.record_exit(status)
            }
            Ok(None) => ProcessExit::Running,
            Err(e) => {
                warn!("Unable to query process {} [{}]: {}", self.name, self.pid, e);
                ProcessExit::Running
            }
        }
    }

    fn terminate(&self) -> Result<()> {
        if !self.poll().is_running() {
            return Ok(());
        }
        debug!("Terminating process {} [{}]", self.name, self.pid);
        force_terminate(self.pid)?;

        let mut child = self.child.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let status = child.wait()?;
        drop(child);
        self.record_exit(status);
        Ok(())
    }
}

/// Starts child processes running the extractor binary
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    executable: PathBuf,
}

impl ProcessLauncher {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        ProcessLauncher { executable: executable.into() }
    }

    /// Launcher re-executing the currently running binary
    pub fn current_executable() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Spawns `<executable> child` and hands it `task` on stdin.
    ///
    /// With `expect_handshake` the call blocks until the child printed its
    /// [`Handshake`] line or exited.
    pub fn spawn<T: Serialize>(
        &self,
        name: &str,
        task: &T,
        verbose: bool,
        expect_handshake: bool,
    ) -> Result<(ChildProcess, Option<Handshake>)> {
        let mut command = Command::new(&self.executable);
        if verbose {
            command.arg("--verbose");
        }
        command
            .arg("child")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = command
            .spawn()
            .map_err(|e| EngineError::process(name, format!("unable to spawn: {}", e)))?;

        let mut line = serde_json::to_vec(task)?;
        line.push(b'\n');
        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(&line).and_then(|_| stdin.flush()),
            None => Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "no stdin")),
        };
        let mut stdout = child.stdout.take().map(BufReader::new);

        if let Err(e) = written {
            let _ = child.kill();
            let _ = child.wait();
            return Err(EngineError::process(name, format!("unable to send task: {}", e)));
        }

        let handshake = if expect_handshake {
            match read_handshake(stdout.as_mut()) {
                Ok(handshake) => Some(handshake),
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(EngineError::process(name, e));
                }
            }
        } else {
            None
        };

        let process = ChildProcess::new(name, child, stdout);
        debug!("Started process {} [{}]", name, process.pid());
        Ok((process, handshake))
    }
}

fn read_handshake(stdout: Option<&mut BufReader<ChildStdout>>) -> std::result::Result<Handshake, String> {
    let stdout = stdout.ok_or("no stdout")?;
    let mut line = String::new();
    let read = stdout.read_line(&mut line).map_err(|e| e.to_string())?;
    if read == 0 {
        return Err("exited before handshake".to_string());
    }
    serde_json::from_str(line.trim()).map_err(|e| format!("malformed handshake: {}", e))
}

/// Kills a process by pid using the most direct mechanism of the platform
pub fn force_terminate(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        unix::force_terminate(pid)
    }
    #[cfg(windows)]
    {
        windows::force_terminate(pid)
    }
    #[cfg(not(any(unix, windows)))]
    {
        Err(EngineError::process(pid.to_string(), "forced termination not supported"))
    }
}

/// Last resort of the abort path: kills the whole process group, including the caller
pub fn terminate_process_group() -> Result<()> {
    #[cfg(unix)]
    {
        unix::terminate_process_group()
    }
    #[cfg(windows)]
    {
        windows::terminate_current_process()
    }
    #[cfg(not(any(unix, windows)))]
    {
        std::process::exit(crate::constants::EXIT_ABORTED)
    }
}

/// Whether a process with this pid still exists
pub fn process_exists(pid: u32) -> bool {
    #[cfg(unix)]
    {
        unix::process_exists(pid)
    }
    #[cfg(not(unix))]
    {
        use sysinfo::{Pid, PidExt, SystemExt};
        let mut system = sysinfo::System::new();
        let pid = Pid::from_u32(pid);
        system.refresh_process(pid)
    }
}
