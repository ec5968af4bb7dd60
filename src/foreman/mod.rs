//! Foreman: health monitor of the extraction workers.
//!
//! Every monitored worker moves from `Monitored` to either `Completed` or
//! `Terminated`. Status checks poll the worker's RPC endpoint and classify
//! processes that exited. A worker that exits with a non-zero code, stops
//! making progress or stops answering is forcibly terminated.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use serde_json::Value;

use crate::config::MonitoringConfig;
use crate::models::WorkerStatus;
use crate::process::{ManagedProcess, ProcessExit};
use crate::rpc::{RpcProxyClient, SIGNAL_END_OF_PROCESSING, WORKER_STATUS};
use crate::worker::{end_of_processing_args, parse_status};

/// Monitoring handle of a worker
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerLabel {
    pub name: String,
    pub pid: u32,
}

impl fmt::Display for WorkerLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (PID: {})", self.name, self.pid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Monitored,
    Completed,
    Terminated,
}

struct MonitoredWorker {
    process: Arc<dyn ManagedProcess>,
    client: Option<RpcProxyClient>,
    state: MonitorState,
    last_status: Option<WorkerStatus>,
    last_progress: Instant,
    missed_heartbeats: u32,
}

pub struct Foreman {
    config: MonitoringConfig,
    show_memory: bool,
    workers: BTreeMap<WorkerLabel, MonitoredWorker>,
    end_of_processing: bool,
}

impl Foreman {
    pub fn new(config: MonitoringConfig, show_memory: bool) -> Self {
        Foreman {
            config,
            show_memory,
            workers: BTreeMap::new(),
            end_of_processing: false,
        }
    }

    /// Starts monitoring a worker, polled over `status_port` when given
    pub fn monitor_worker(&mut self, process: Arc<dyn ManagedProcess>, status_port: Option<u16>) -> WorkerLabel {
        let label = WorkerLabel {
            name: process.name().to_string(),
            pid: process.pid(),
        };
        let client = status_port.map(|port| RpcProxyClient::with_timeout(port, self.config.status_timeout()));
        debug!("Monitoring {}", label);

        self.workers.insert(
            label.clone(),
            MonitoredWorker {
                process,
                client,
                state: MonitorState::Monitored,
                last_status: None,
                last_progress: Instant::now(),
                missed_heartbeats: 0,
            },
        );
        label
    }

    /// Label of a monitored worker, `None` for one the foreman never registered
    pub fn get_label(&self, name: &str, pid: u32) -> Option<WorkerLabel> {
        let label = WorkerLabel { name: name.to_string(), pid };
        match self.workers.get(&label) {
            Some(worker) if worker.state == MonitorState::Monitored => Some(label),
            _ => None,
        }
    }

    pub fn state(&self, label: &WorkerLabel) -> Option<MonitorState> {
        self.workers.get(label).map(|worker| worker.state)
    }

    pub fn last_status(&self, label: &WorkerLabel) -> Option<&WorkerStatus> {
        self.workers.get(label).and_then(|worker| worker.last_status.as_ref())
    }

    pub fn monitored_labels(&self) -> Vec<WorkerLabel> {
        self.workers
            .iter()
            .filter(|(_, worker)| worker.state == MonitorState::Monitored)
            .map(|(label, _)| label.clone())
            .collect()
    }

    pub fn is_end_of_processing(&self) -> bool {
        self.end_of_processing
    }

    /// Polls one worker, or every monitored worker when `label` is `None`
    pub fn check_status(&mut self, label: Option<&WorkerLabel>) {
        let labels = match label {
            Some(label) => vec![label.clone()],
            None => self.monitored_labels(),
        };
        for label in labels {
            self.check_worker_status(&label);
        }
    }

    fn check_worker_status(&mut self, label: &WorkerLabel) {
        let hang_timeout = self.config.hang_timeout();
        let max_missed = self.config.max_missed_heartbeats;
        let show_memory = self.show_memory;

        let Some(worker) = self.workers.get_mut(label) else {
            return;
        };
        if worker.state != MonitorState::Monitored {
            return;
        }

        match worker.process.poll() {
            ProcessExit::Running => {}
            ProcessExit::Exited(Some(0)) => {
                debug!("{} completed", label);
                worker.state = MonitorState::Completed;
                return;
            }
            exit => {
                warn!("{}", exit.worker_error(&label.name, label.pid));
                self.terminate_process(label);
                return;
            }
        }

        let Some(client) = worker.client.as_ref() else {
            return;
        };
        match client.call(WORKER_STATUS, Value::Null).map(parse_status) {
            Ok(Some(status)) => {
                worker.missed_heartbeats = 0;
                let progressed = worker
                    .last_status
                    .as_ref()
                    .map(|previous| {
                        previous.items_processed != status.items_processed
                            || previous.last_item != status.last_item
                            || previous.activity != status.activity
                    })
                    .unwrap_or(true);
                if progressed {
                    worker.last_progress = Instant::now();
                }
                if show_memory {
                    if let Some(memory) = status.memory_bytes {
                        info!("{}: {} items, memory {:.1} MiB", label, status.items_processed, memory as f64 / 1048576.0);
                    }
                }

                let stalled = status.is_processing() && worker.last_progress.elapsed() > hang_timeout;
                let item = status.last_item.clone().unwrap_or_default();
                worker.last_status = Some(status);
                if stalled {
                    warn!("{} made no progress on {} for {:?}, terminating", label, item, hang_timeout);
                    self.terminate_process(label);
                }
            }
            Ok(None) | Err(_) => {
                worker.missed_heartbeats += 1;
                debug!("{} missed heartbeat {}/{}", label, worker.missed_heartbeats, max_missed);
                if worker.missed_heartbeats >= max_missed {
                    warn!("{} is not responding, terminating", label);
                    self.terminate_process(label);
                }
            }
        }
    }

    /// Tells every monitored worker over RPC that no further items will arrive
    pub fn signal_end_of_processing(&mut self) {
        self.end_of_processing = true;
        for (label, worker) in &self.workers {
            if worker.state != MonitorState::Monitored {
                continue;
            }
            if let Some(client) = &worker.client {
                if let Err(e) = client.call(SIGNAL_END_OF_PROCESSING, end_of_processing_args()) {
                    debug!("Unable to signal end of processing to {}: {}", label, e);
                }
            }
        }
    }

    /// Forcibly terminates a worker and records it as terminated
    pub fn terminate_process(&mut self, label: &WorkerLabel) {
        let Some(worker) = self.workers.get_mut(label) else {
            return;
        };
        if let Err(e) = worker.process.terminate() {
            warn!("Unable to terminate {}: {}", label, e);
        }
        worker.state = MonitorState::Terminated;
    }

    /// Forgets a reconciled worker, returns the state it ended in
    pub fn stop_monitoring_worker(&mut self, label: &WorkerLabel) -> Option<MonitorState> {
        let worker = self.workers.remove(label)?;
        debug!("Stopped monitoring {}", label);
        Some(worker.state)
    }
}
