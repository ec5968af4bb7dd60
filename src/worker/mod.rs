//! Extraction worker: drains the collection queue through the parsers.
//!
//! A worker pops work items until it observes the end-of-input sentinel,
//! runs the enabled parsers on each item and pushes the resulting events
//! and errors onto the storage and error queues. Its [`WorkerStatus`] is
//! served over RPC so the foreman can tell progress from a hang.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sysinfo::{Pid, PidExt, ProcessExt, System, SystemExt};

use crate::constants::{DEFAULT_MAX_HASH_SIZE_MB, QUEUE_POP_TIMEOUT_MS};
use crate::error::Result;
use crate::filter::EventFilter;
use crate::models::{ExtractionError, WorkItemDescriptor, WorkerStatus};
use crate::parsers::{FileEntry, ParserMediator, ParserOptions, ParserRegistry};
use crate::queue::{ExtractionQueues, QueueMessage};
use crate::rpc::{RpcProxyServer, SIGNAL_END_OF_PROCESSING, WORKER_STATUS};

/// Construction parameters of one worker, serializable for child processes
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerOptions {
    pub identifier: String,
    /// Parser filter string, empty enables every parser
    pub parser_filter: String,
    pub filter_expression: Option<String>,
    pub mount_path: Option<std::path::PathBuf>,
    pub max_hash_size_mb: u64,
    pub show_memory: bool,
    pub debug: bool,
    pub single_process: bool,
}

impl WorkerOptions {
    pub fn new(identifier: impl Into<String>) -> Self {
        WorkerOptions {
            identifier: identifier.into(),
            parser_filter: String::new(),
            filter_expression: None,
            mount_path: None,
            max_hash_size_mb: DEFAULT_MAX_HASH_SIZE_MB,
            show_memory: false,
            debug: false,
            single_process: false,
        }
    }
}

pub struct ExtractionWorker {
    identifier: String,
    queues: ExtractionQueues,
    registry: ParserRegistry,
    parser_options: ParserOptions,
    filter: Option<EventFilter>,
    status: Arc<Mutex<WorkerStatus>>,
    end_of_processing: Arc<AtomicBool>,
    show_memory: bool,
    debug: bool,
}

impl ExtractionWorker {
    pub fn new(options: WorkerOptions, queues: ExtractionQueues) -> Result<Self> {
        let registry = ParserRegistry::from_filter(&options.parser_filter)?;
        let filter = options.filter_expression.as_deref().map(EventFilter::parse).transpose()?;
        let status = WorkerStatus {
            identifier: options.identifier.clone(),
            pid: std::process::id(),
            activity: "idle".to_string(),
            ..WorkerStatus::default()
        };

        Ok(ExtractionWorker {
            identifier: options.identifier,
            queues,
            registry,
            parser_options: ParserOptions {
                mount_path: options.mount_path,
                max_hash_size_mb: options.max_hash_size_mb,
            },
            filter,
            status: Arc::new(Mutex::new(status)),
            end_of_processing: Arc::new(AtomicBool::new(false)),
            show_memory: options.show_memory,
            debug: options.debug,
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Snapshot of the status the RPC endpoint serves
    pub fn status(&self) -> WorkerStatus {
        snapshot(&self.status, self.show_memory)
    }

    /// Flag raised by `signal_end_of_processing`
    pub fn end_of_processing_handle(&self) -> Arc<AtomicBool> {
        self.end_of_processing.clone()
    }

    /// Registers `status` and `signal_end_of_processing` on the worker proxy
    pub fn register_rpc_functions(&self, server: &RpcProxyServer) -> Result<()> {
        let status = self.status.clone();
        let show_memory = self.show_memory;
        server.register_function(WORKER_STATUS, move |_| {
            serde_json::to_value(snapshot(&status, show_memory)).map_err(|e| e.to_string())
        })?;

        let end_of_processing = self.end_of_processing.clone();
        let identifier = self.identifier.clone();
        server.register_function(SIGNAL_END_OF_PROCESSING, move |_| {
            debug!("{} received end of processing", identifier);
            end_of_processing.store(true, Ordering::SeqCst);
            Ok(Value::Bool(true))
        })?;
        Ok(())
    }

    /// Processes items until the collection queue ends
    pub fn run(&self) -> Result<WorkerStatus> {
        info!("{} (PID: {}) started", self.identifier, std::process::id());
        let timeout = Duration::from_millis(QUEUE_POP_TIMEOUT_MS);

        loop {
            let message = match self.queues.collection.pop_item(timeout) {
                Ok(message) => message,
                Err(e) if self.end_of_processing.load(Ordering::SeqCst) => {
                    debug!("{} stopping after end of processing: {}", self.identifier, e);
                    break;
                }
                Err(e) => return Err(e),
            };

            match message {
                Some(QueueMessage::Item(descriptor)) => self.process_item_guarded(&descriptor)?,
                Some(QueueMessage::EndOfInput) => break,
                None if self.end_of_processing.load(Ordering::SeqCst) => break,
                None => continue,
            }
        }

        self.update_status(|status| {
            status.activity = "completed".to_string();
            status.last_item = None;
        });
        let status = self.status();
        info!(
            "{} completed: {} items, {} events, {} errors",
            self.identifier, status.items_processed, status.events_produced, status.errors_produced
        );
        Ok(status)
    }

    /// In debug mode a panicking parser leaves a post-mortem record in the log
    fn process_item_guarded(&self, descriptor: &WorkItemDescriptor) -> Result<()> {
        if !self.debug {
            return self.process_item(descriptor);
        }
        match panic::catch_unwind(AssertUnwindSafe(|| self.process_item(descriptor))) {
            Ok(result) => result,
            Err(payload) => {
                error!(
                    "{} failed on {}\nitem: {:#?}\nstatus: {:#?}",
                    self.identifier,
                    descriptor.display_name,
                    descriptor,
                    self.status()
                );
                panic::resume_unwind(payload)
            }
        }
    }

    fn process_item(&self, descriptor: &WorkItemDescriptor) -> Result<()> {
        self.update_status(|status| {
            status.activity = "processing".to_string();
            status.last_item = Some(descriptor.display_name.clone());
        });

        let (events, errors) = match FileEntry::from_descriptor(descriptor) {
            Ok(entry) => {
                let mut mediator = ParserMediator::new(&self.registry, &self.parser_options, self.filter.as_ref());
                mediator.parse_file_entry(&entry);
                mediator.take_results()
            }
            Err(e) => {
                warn!("Unable to open {}: {}", descriptor.display_name, e);
                let error = ExtractionError {
                    parser_chain: String::new(),
                    name: "file_entry".to_string(),
                    description: format!("unable to open file entry: {}", e),
                    path_spec: Some(descriptor.path_spec.clone()),
                    display_name: Some(descriptor.display_name.clone()),
                };
                (Vec::new(), vec![error])
            }
        };

        let event_count = events.len() as u64;
        let error_count = errors.len() as u64;
        for event in events {
            self.queues.storage.push_item(event)?;
        }
        for error in errors {
            self.queues.errors.push_item(error)?;
        }

        self.update_status(|status| {
            status.items_processed += 1;
            status.events_produced += event_count;
            status.errors_produced += error_count;
            status.activity = "idle".to_string();
        });
        Ok(())
    }

    fn update_status<F: FnOnce(&mut WorkerStatus)>(&self, update: F) {
        let mut status = self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        update(&mut status);
    }
}

fn snapshot(status: &Mutex<WorkerStatus>, show_memory: bool) -> WorkerStatus {
    let mut snapshot = status.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone();
    if show_memory {
        snapshot.memory_bytes = current_memory_bytes();
    }
    snapshot
}

/// Resident memory of the current process
pub fn current_memory_bytes() -> Option<u64> {
    let pid = Pid::from_u32(std::process::id());
    let mut system = System::new();
    if !system.refresh_process(pid) {
        return None;
    }
    system.process(pid).map(|process| process.memory())
}

/// Status reply used when a worker answers with something unexpected
pub fn parse_status(value: Value) -> Option<WorkerStatus> {
    serde_json::from_value(value).ok()
}

/// Arguments sent with `signal_end_of_processing`
pub fn end_of_processing_args() -> Value {
    json!({ "reason": "collection completed" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PathSpec;
    use crate::queue::{ItemQueue, WorkQueue};
    use crate::rpc::RpcProxyClient;
    use crate::test_utils::create_test_file_structure;

    fn queue_items(queues: &crate::queue::InMemoryQueues, paths: &[std::path::PathBuf]) {
        for path in paths {
            queues
                .collection
                .push_item(WorkItemDescriptor {
                    path_spec: PathSpec::os(path.to_string_lossy()),
                    display_name: path.to_string_lossy().to_string(),
                    vss_store: None,
                    is_directory: false,
                })
                .unwrap();
        }
        queues.collection.signal_end_of_input().unwrap();
    }

    fn drain<T: Send>(queue: &WorkQueue<T>) -> Vec<T> {
        queue.signal_end_of_input().unwrap();
        let mut items = Vec::new();
        while let Some(QueueMessage::Item(item)) = queue.pop_item(Duration::from_millis(50)).unwrap() {
            items.push(item);
        }
        items
    }

    #[test]
    fn test_worker_drains_until_end_of_input() {
        let temp_dir = create_test_file_structure().unwrap();
        let (handles, queues) = ExtractionQueues::in_memory();
        queue_items(
            &queues,
            &[
                temp_dir.path().join("dir2/timeline.body"),
                temp_dir.path().join("missing.txt"),
            ],
        );

        let mut options = WorkerOptions::new("Worker_0");
        options.parser_filter = "bodyfile".to_string();
        let worker = ExtractionWorker::new(options, handles).unwrap();
        let status = worker.run().unwrap();

        assert_eq!(status.items_processed, 2);
        assert_eq!(status.events_produced, 7);
        assert_eq!(status.errors_produced, 2);
        assert_eq!(status.activity, "completed");
        assert_eq!(drain(&queues.storage).len(), 7);
        let errors = drain(&queues.errors);
        assert!(errors.iter().any(|error| error.name == "file_entry"));
    }

    #[test]
    fn test_status_and_end_of_processing_over_rpc() {
        let (handles, _queues) = ExtractionQueues::in_memory();
        let mut options = WorkerOptions::new("Worker_3");
        options.show_memory = true;
        let worker = ExtractionWorker::new(options, handles).unwrap();

        let server = Arc::new(RpcProxyServer::open().unwrap());
        worker.register_rpc_functions(&server).unwrap();
        let thread = server.spawn("worker_rpc").unwrap();

        let client = RpcProxyClient::new(server.listening_port());
        let status = parse_status(client.call(WORKER_STATUS, Value::Null).unwrap()).unwrap();
        assert_eq!(status.identifier, "Worker_3");
        assert_eq!(status.activity, "idle");

        client.call(SIGNAL_END_OF_PROCESSING, end_of_processing_args()).unwrap();
        assert!(worker.end_of_processing_handle().load(Ordering::SeqCst));
        // Nothing queued and processing ended: the worker returns
        assert_eq!(worker.run().unwrap().items_processed, 0);

        server.close();
        thread.join().unwrap();
    }

    #[test]
    fn test_invalid_filter_is_rejected() {
        let (handles, _queues) = ExtractionQueues::in_memory();
        let mut options = WorkerOptions::new("Worker_1");
        options.filter_expression = Some("parser ~~ zip".to_string());
        assert!(ExtractionWorker::new(options, handles).is_err());
    }
}
