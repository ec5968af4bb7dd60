use std::io;

use log::debug;

use crate::error::{EngineError, Result};

/// Sends SIGKILL to the process; a process that is already gone is not an error
pub fn force_terminate(pid: u32) -> Result<()> {
    let pid = to_pid(pid)?;
    // SAFETY: kill has no memory safety requirements
    if unsafe { libc::kill(pid, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    let error = io::Error::last_os_error();
    if error.raw_os_error() == Some(libc::ESRCH) {
        debug!("Process {} already exited", pid);
        return Ok(());
    }
    Err(EngineError::process(pid.to_string(), format!("unable to kill: {}", error)))
}

/// Sends SIGKILL to every process in the caller's process group
pub fn terminate_process_group() -> Result<()> {
    // SAFETY: kill has no memory safety requirements
    if unsafe { libc::kill(0, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    Err(EngineError::process(
        "process group",
        format!("unable to kill: {}", io::Error::last_os_error()),
    ))
}

pub fn process_exists(pid: u32) -> bool {
    let Ok(pid) = to_pid(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks for existence
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn to_pid(pid: u32) -> Result<libc::pid_t> {
    match libc::pid_t::try_from(pid) {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(EngineError::process(pid.to_string(), "invalid pid")),
    }
}
