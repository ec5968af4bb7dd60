//! Integration tests for worker failures during a multi-process run.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;

use timeline_extractor::engine::{ExtractionFrontend, RunEvent, RunJournal, RunObserver, WorkerOutcome};
use timeline_extractor::process::force_terminate;
use timeline_extractor::storage::read_storage_file;

use common::{large_source_tree, launcher, multi_process_config};

/// Kills the first worker as soon as it is started
struct WorkerKiller {
    journal: RunJournal,
    killed: AtomicBool,
}

impl RunObserver for WorkerKiller {
    fn on_event(&self, event: &RunEvent) {
        if let RunEvent::WorkerStarted { pid, .. } = event {
            if !self.killed.swap(true, Ordering::SeqCst) {
                force_terminate(*pid).expect("worker killed");
            }
        }
        self.journal.on_event(event);
    }
}

/// Test that a crashed worker is reconciled as terminated and the run still finishes
#[test]
fn test_killed_worker_is_terminated_and_run_completes() -> Result<()> {
    let source = large_source_tree(60)?;
    let output_dir = TempDir::new()?;
    let output = output_dir.path().join("timeline.jsonl");

    let observer = Arc::new(WorkerKiller {
        journal: RunJournal::new(),
        killed: AtomicBool::new(false),
    });
    let mut frontend = ExtractionFrontend::new(multi_process_config(source.path(), &output, 2))
        .with_launcher(launcher())
        .with_observer(observer.clone());

    let summary = frontend.process_source()?;

    let reconciled = observer.journal.reconciled();
    assert_eq!(reconciled.len(), 2);
    assert!(reconciled.contains(&("Worker_0".to_string(), WorkerOutcome::Terminated)));
    assert!(reconciled.contains(&("Worker_1".to_string(), WorkerOutcome::Completed)));
    assert_eq!(summary.workers_terminated, 1);
    assert_eq!(summary.workers_completed, 1);

    // The surviving worker drained the collection queue
    let contents = read_storage_file(&output)?;
    assert!(contents.is_complete());
    assert!(!contents.events.is_empty());

    let events = observer.journal.events();
    let end_of_input = events
        .iter()
        .position(|event| *event == RunEvent::StorageEndOfInput)
        .expect("storage end-of-input recorded");
    let last_reconciled = events
        .iter()
        .rposition(|event| matches!(event, RunEvent::WorkerReconciled { .. }))
        .expect("workers reconciled");
    assert!(last_reconciled < end_of_input);
    Ok(())
}

/// Test that a run without a foreman still reconciles a crashed worker
#[test]
fn test_killed_worker_without_foreman() -> Result<()> {
    let source = large_source_tree(30)?;
    let output_dir = TempDir::new()?;
    let output = output_dir.path().join("timeline.jsonl");
    let mut config = multi_process_config(source.path(), &output, 2);
    config.run_foreman = false;

    let observer = Arc::new(WorkerKiller {
        journal: RunJournal::new(),
        killed: AtomicBool::new(false),
    });
    let mut frontend = ExtractionFrontend::new(config)
        .with_launcher(launcher())
        .with_observer(observer.clone());

    let summary = frontend.process_source()?;

    assert_eq!(summary.workers_terminated, 1);
    assert_eq!(summary.workers_completed, 1);
    assert!(read_storage_file(&output)?.is_complete());
    Ok(())
}
