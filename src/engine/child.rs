//! Entry points of the collector, worker and storage processes.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::collector::{Collector, CollectorOptions, PathFilter};
use crate::models::CollectionInformation;
use crate::process::Handshake;
use crate::queue::ExtractionQueues;
use crate::resolver::ResolvedSource;
use crate::rpc::{RpcProxyClient, RpcProxyServer};
use crate::storage::{StorageFileWriter, StorageSink};
use crate::worker::{ExtractionWorker, WorkerOptions};

/// Task handed to a child process on stdin
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ChildTask {
    Collector {
        source: ResolvedSource,
        broker_port: u16,
        /// Engine proxy notified once collection ended
        engine_port: Option<u16>,
        include_directory_stat: bool,
        file_filter: Option<PathBuf>,
        mount_path: Option<PathBuf>,
    },
    Worker {
        options: WorkerOptions,
        broker_port: u16,
    },
    Storage {
        output: PathBuf,
        buffer_size: usize,
        information: CollectionInformation,
        broker_port: u16,
    },
}

impl ChildTask {
    /// Name the process is started under
    pub fn role(&self) -> &'static str {
        match self {
            ChildTask::Collector { .. } => "collector",
            ChildTask::Worker { .. } => "worker",
            ChildTask::Storage { .. } => "storage",
        }
    }
}

/// Reads one task line from `input` and runs it to completion
pub fn run_child_process<R: BufRead>(mut input: R) -> Result<()> {
    let mut line = String::new();
    input.read_line(&mut line).context("Failed to read child task")?;
    if line.trim().is_empty() {
        return Err(anyhow!("No child task received on stdin"));
    }
    let task: ChildTask = serde_json::from_str(line.trim()).context("Failed to parse child task")?;
    debug!("Starting {} process (PID: {})", task.role(), std::process::id());

    match task {
        ChildTask::Collector {
            source,
            broker_port,
            engine_port,
            include_directory_stat,
            file_filter,
            mount_path,
        } => {
            let path_filter = file_filter
                .as_deref()
                .map(PathFilter::from_file)
                .transpose()
                .context("Failed to load collection filter")?;
            let options = CollectorOptions {
                include_directory_stat,
                path_filter,
                mount_path,
            };
            let queues = ExtractionQueues::remote(broker_port);
            let mut collector = Collector::new(source, queues.collection, options);
            if let Some(port) = engine_port {
                collector = collector.with_completion_notifier(RpcProxyClient::new(port));
            }
            collector.collect().context("Collection failed")?;
        }
        ChildTask::Worker { options, broker_port } => run_worker(options, broker_port)?,
        ChildTask::Storage {
            output,
            buffer_size,
            information,
            broker_port,
        } => {
            let queues = ExtractionQueues::remote(broker_port);
            let mut writer = StorageFileWriter::new(&output, buffer_size, information, queues.storage, queues.errors);
            writer.write_event_objects().context("Storage failed")?;
        }
    }
    Ok(())
}

fn run_worker(options: WorkerOptions, broker_port: u16) -> Result<()> {
    let identifier = options.identifier.clone();
    let worker = ExtractionWorker::new(options, ExtractionQueues::remote(broker_port))
        .with_context(|| format!("Failed to create {}", identifier))?;

    // Monitoring is optional: without a status proxy the worker still runs
    let proxy = match RpcProxyServer::open() {
        Ok(server) => {
            let server = Arc::new(server);
            worker.register_rpc_functions(&server)?;
            let thread = server.spawn(&format!("{}_status", identifier))?;
            Some((server, thread))
        }
        Err(e) => {
            warn!("Unable to setup a RPC server for {}: {}", identifier, e);
            None
        }
    };

    Handshake {
        pid: std::process::id(),
        status_port: proxy.as_ref().map(|(server, _)| server.listening_port()),
    }
    .announce()
    .context("Failed to announce worker")?;

    let result = worker.run();

    if let Some((server, thread)) = proxy {
        server.close();
        let _ = thread.join();
    }
    let status = result.with_context(|| format!("{} failed", identifier))?;
    info!("{} done after {} items", identifier, status.items_processed);
    Ok(())
}
