use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::storage::StorageCounts;

/// Outcome of one extraction run.
///
/// Returned by the orchestrator and written next to the storage file as a
/// JSON report, so the run can be traced back to the host, the collection
/// id stored in the collection information record and the worker pool that
/// produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub collection_id: String,
    pub hostname: String,
    pub source: String,
    pub output_file: String,
    /// "single process mode" or "multi process mode"
    pub runtime: String,
    pub workers: usize,
    pub items_collected: u64,
    pub events: u64,
    pub errors: u64,
    pub workers_completed: usize,
    pub workers_terminated: usize,
    pub start_time: String,
    pub end_time: String,
    pub duration_seconds: f64,
}

impl RunSummary {
    pub fn new(collection_id: &str, hostname: &str, source: &str, output_file: &str) -> Self {
        RunSummary {
            collection_id: collection_id.to_string(),
            hostname: hostname.to_string(),
            source: source.to_string(),
            output_file: output_file.to_string(),
            runtime: String::new(),
            workers: 0,
            items_collected: 0,
            events: 0,
            errors: 0,
            workers_completed: 0,
            workers_terminated: 0,
            start_time: String::new(),
            end_time: String::new(),
            duration_seconds: 0.0,
        }
    }

    pub fn record_storage(&mut self, counts: StorageCounts) {
        self.events = counts.events;
        self.errors = counts.errors;
    }
}

/// New collection id
pub fn new_collection_id() -> String {
    Uuid::new_v4().to_string()
}

/// Hostname of the machine running the extraction
pub fn local_hostname() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Create a JSON report of the run.
///
/// # Example Output
///
/// ```json
/// {
///   "collection_id": "550e8400-e29b-41d4-a716-446655440000",
///   "hostname": "workstation-01",
///   "extractor_version": "0.1.0",
///   "run": { "events": 1042, "errors": 3, ... }
/// }
/// ```
pub fn create_run_report(summary: &RunSummary) -> Result<String> {
    let report = json!({
        "collection_id": summary.collection_id,
        "hostname": summary.hostname,
        "os": std::env::consts::OS,
        "extractor_version": env!("CARGO_PKG_VERSION"),
        "run": summary,
    });
    serde_json::to_string_pretty(&report).context("Failed to serialize run report to JSON")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_create_run_report() {
        let mut summary = RunSummary::new("id-1", "host", "/case/disk.raw", "/case/timeline.jsonl");
        summary.record_storage(StorageCounts { events: 12, errors: 1 });
        summary.runtime = "multi process mode".to_string();

        let report = create_run_report(&summary).unwrap();
        let parsed: Value = serde_json::from_str(&report).unwrap();
        assert_eq!(parsed["collection_id"], "id-1");
        assert_eq!(parsed["run"]["events"], 12);
        assert_eq!(parsed["run"]["runtime"], "multi process mode");
        assert_eq!(parsed["extractor_version"], env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_collection_ids_are_unique() {
        assert_ne!(new_collection_id(), new_collection_id());
        assert!(Uuid::parse_str(&new_collection_id()).is_ok());
    }

    #[test]
    fn test_local_hostname_is_not_empty() {
        assert!(!local_hostname().is_empty());
    }
}
