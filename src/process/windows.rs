use std::io;

use winapi::shared::minwindef::FALSE;
use winapi::um::handleapi::CloseHandle;
use winapi::um::processthreadsapi::{GetCurrentProcess, OpenProcess, TerminateProcess};
use winapi::um::winnt::PROCESS_TERMINATE;

use crate::constants::EXIT_ABORTED;
use crate::error::{EngineError, Result};

/// Opens the process for termination and terminates it
pub fn force_terminate(pid: u32) -> Result<()> {
    // SAFETY: the handle is checked for null and closed on every path
    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, FALSE, pid);
        if handle.is_null() {
            return Err(EngineError::process(
                pid.to_string(),
                format!("unable to open process: {}", io::Error::last_os_error()),
            ));
        }
        let terminated = TerminateProcess(handle, u32::MAX);
        let error = io::Error::last_os_error();
        CloseHandle(handle);
        if terminated == FALSE {
            return Err(EngineError::process(pid.to_string(), format!("unable to terminate: {}", error)));
        }
    }
    Ok(())
}

/// Windows has no process group kill; terminate the current process
pub fn terminate_current_process() -> Result<()> {
    // SAFETY: the pseudo handle of the current process needs no closing
    unsafe {
        TerminateProcess(GetCurrentProcess(), EXIT_ABORTED as u32);
    }
    Ok(())
}
