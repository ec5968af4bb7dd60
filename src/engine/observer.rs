use std::fmt;
use std::sync::Mutex;

use log::debug;

/// Phases of one extraction run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    Preprocess,
    CollectExtract,
    DrainWorkers,
    DrainStorage,
    Done,
    Abort,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Init => "init",
            RunPhase::Preprocess => "preprocess",
            RunPhase::CollectExtract => "collect+extract",
            RunPhase::DrainWorkers => "drain workers",
            RunPhase::DrainStorage => "drain storage",
            RunPhase::Done => "done",
            RunPhase::Abort => "abort",
        };
        write!(f, "{}", name)
    }
}

/// Terminal state a worker was reconciled in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    PhaseChanged(RunPhase),
    WorkerStarted { name: String, pid: u32 },
    WorkerReconciled { name: String, pid: u32, outcome: WorkerOutcome },
    CollectorExited,
    /// End-of-input was signalled on the storage and error queues
    StorageEndOfInput,
    StorageJoined,
}

/// Receives the milestones of a run as they happen
pub trait RunObserver: Send + Sync {
    fn on_event(&self, event: &RunEvent);
}

/// Observer recording every event in order
#[derive(Debug, Default)]
pub struct RunJournal {
    events: Mutex<Vec<RunEvent>>,
}

impl RunJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Index of the first event matching `predicate`
    pub fn position<P: Fn(&RunEvent) -> bool>(&self, predicate: P) -> Option<usize> {
        self.events().iter().position(predicate)
    }

    pub fn phases(&self) -> Vec<RunPhase> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                RunEvent::PhaseChanged(phase) => Some(phase),
                _ => None,
            })
            .collect()
    }

    pub fn reconciled(&self) -> Vec<(String, WorkerOutcome)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                RunEvent::WorkerReconciled { name, outcome, .. } => Some((name, outcome)),
                _ => None,
            })
            .collect()
    }
}

impl RunObserver for RunJournal {
    fn on_event(&self, event: &RunEvent) {
        debug!("Run event: {:?}", event);
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_journal_keeps_order() {
        let journal = RunJournal::new();
        journal.on_event(&RunEvent::PhaseChanged(RunPhase::Init));
        journal.on_event(&RunEvent::CollectorExited);
        journal.on_event(&RunEvent::WorkerReconciled {
            name: "Worker_0".to_string(),
            pid: 7,
            outcome: WorkerOutcome::Completed,
        });
        journal.on_event(&RunEvent::StorageEndOfInput);

        assert_eq!(journal.phases(), vec![RunPhase::Init]);
        assert_eq!(journal.position(|event| *event == RunEvent::CollectorExited), Some(1));
        assert_eq!(journal.reconciled(), vec![("Worker_0".to_string(), WorkerOutcome::Completed)]);
        assert_eq!(journal.position(|event| *event == RunEvent::StorageJoined), None);
    }
}
