use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use log::warn;

use crate::process::force_terminate;

/// What the interrupt handler has to do after an interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    /// No child process is running, exit right away
    ExitNow,
    /// The orchestrator runs the abort protocol
    Abort,
    /// Repeated interrupt: kill the remaining children and exit
    Escalate,
}

/// Interrupt state shared between the signal handler and the orchestrator.
///
/// The registry holds the pid of every live child so a repeated interrupt
/// can kill them without waiting on the orchestrator.
#[derive(Debug, Default)]
pub struct AbortSignal {
    interrupts: AtomicU32,
    cleaning_up: AtomicBool,
    children: Mutex<BTreeMap<u32, String>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an interrupt
    pub fn interrupt(&self) -> InterruptAction {
        let count = self.interrupts.fetch_add(1, Ordering::SeqCst) + 1;
        if count > 1 || self.is_cleaning_up() {
            warn!("Interrupted again, terminating all child processes");
            InterruptAction::Escalate
        } else if self.child_count() == 0 {
            InterruptAction::ExitNow
        } else {
            warn!("Interrupted, aborting the extraction");
            InterruptAction::Abort
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.interrupts.load(Ordering::SeqCst) > 0
    }

    /// Marks the start of the abort protocol, false if it already started
    pub fn begin_cleanup(&self) -> bool {
        !self.cleaning_up.swap(true, Ordering::SeqCst)
    }

    pub fn is_cleaning_up(&self) -> bool {
        self.cleaning_up.load(Ordering::SeqCst)
    }

    pub fn register_child(&self, pid: u32, name: &str) {
        self.registry().insert(pid, name.to_string());
    }

    pub fn unregister_child(&self, pid: u32) {
        self.registry().remove(&pid);
    }

    pub fn child_count(&self) -> usize {
        self.registry().len()
    }

    pub fn children(&self) -> Vec<(u32, String)> {
        self.registry().iter().map(|(pid, name)| (*pid, name.clone())).collect()
    }

    /// Force-kills every registered child, returns how many were killed
    pub fn kill_children(&self) -> usize {
        let children = std::mem::take(&mut *self.registry());
        let mut killed = 0;
        for (pid, name) in children {
            match force_terminate(pid) {
                Ok(()) => killed += 1,
                Err(e) => warn!("Unable to terminate {} (PID: {}): {}", name, pid, e),
            }
        }
        killed
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, BTreeMap<u32, String>> {
        self.children.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_without_children_exits() {
        let signal = AbortSignal::new();
        assert!(!signal.is_aborted());
        assert_eq!(signal.interrupt(), InterruptAction::ExitNow);
        assert!(signal.is_aborted());
    }

    #[test]
    fn test_second_interrupt_escalates() {
        let signal = AbortSignal::new();
        signal.register_child(4_000_000, "Worker_0");
        assert_eq!(signal.interrupt(), InterruptAction::Abort);
        assert_eq!(signal.interrupt(), InterruptAction::Escalate);
    }

    #[test]
    fn test_interrupt_during_cleanup_escalates() {
        let signal = AbortSignal::new();
        signal.register_child(4_000_001, "StorageProcess");
        assert!(signal.begin_cleanup());
        assert!(!signal.begin_cleanup());
        assert_eq!(signal.interrupt(), InterruptAction::Escalate);
    }

    #[test]
    fn test_registry() {
        let signal = AbortSignal::new();
        signal.register_child(10, "CollectorProcess");
        signal.register_child(11, "Worker_0");
        signal.unregister_child(10);
        assert_eq!(signal.children(), vec![(11, "Worker_0".to_string())]);
    }
}
