//! Orchestrator of one extraction run.
//!
//! [`ExtractionFrontend::process_source`] resolves the source, records the
//! collection information and then runs the pipeline either inside the
//! current process or as independent processes:
//!
//! ```text
//! INIT -> PREPROCESS -> COLLECT+EXTRACT -> DRAIN_WORKERS -> DRAIN_STORAGE -> DONE
//!                            \______________ ABORT ______________/
//! ```
//!
//! In multi-process mode the orchestrator hosts the queues behind a
//! [`QueueBroker`], starts the storage process, the collector process and
//! the worker pool, and reconciles every worker before the storage queue
//! receives its end-of-input signal. An interrupt stops the collector,
//! ends the storage queues and terminates the remaining children.

mod abort;
mod child;
mod observer;

pub use abort::{AbortSignal, InterruptAction};
pub use child::{run_child_process, ChildTask};
pub use observer::{RunEvent, RunJournal, RunObserver, RunPhase, WorkerOutcome};

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::Value;

use crate::collector::{Collector, CollectorOptions, PathFilter};
use crate::config::{read_filter_lines, resolve_worker_count, ExtractionConfig};
use crate::constants::PROCESS_POLL_INTERVAL_MS;
use crate::error::{EngineError, Result};
use crate::foreman::{Foreman, MonitorState, WorkerLabel};
use crate::models::{CollectionInformation, CollectionInformationBuilder, SourceType};
use crate::parsers::ParserRegistry;
use crate::process::{terminate_process_group, ChildProcess, Handshake, ManagedProcess, ProcessExit, ProcessLauncher};
use crate::queue::{ExtractionQueues, InMemoryQueues, ItemQueue, QueueBroker};
use crate::resolver::{ConsolePrompt, OsSourceScanner, PathResolver, ResolvedSource, ResolverOptions, SourceScanner, UserPrompt};
use crate::rpc::{RpcProxyServer, SIGNAL_END_OF_COLLECTION};
use crate::storage::{StorageCounts, StorageFileWriter, StorageSink};
use crate::utils::summary::{local_hostname, new_collection_id, RunSummary};
use crate::worker::{ExtractionWorker, WorkerOptions};

const COLLECTOR_PROCESS: &str = "CollectorProcess";
const STORAGE_PROCESS: &str = "StorageProcess";

/// Orchestrator-side record of a started worker
struct WorkerState {
    process: Arc<ChildProcess>,
}

/// What a finished pipeline reports back
#[derive(Debug, Default)]
struct RunCounts {
    items_collected: u64,
    storage: StorageCounts,
    completed: usize,
    terminated: usize,
}

/// Everything a multi-process run owns, torn down together on abort
struct MultiProcessRun {
    queues: InMemoryQueues,
    broker: QueueBroker,
    foreman: Option<Arc<Mutex<Foreman>>>,
    proxy: Option<(Arc<RpcProxyServer>, JoinHandle<()>)>,
    storage: Option<Arc<ChildProcess>>,
    collector: Option<Arc<ChildProcess>>,
    workers: BTreeMap<String, WorkerState>,
    counts: RunCounts,
}

pub struct ExtractionFrontend {
    config: ExtractionConfig,
    launcher: Option<ProcessLauncher>,
    scanner: Option<Box<dyn SourceScanner>>,
    prompt: Option<Box<dyn UserPrompt>>,
    observer: Option<Arc<dyn RunObserver>>,
    abort: Arc<AbortSignal>,
    verbose: bool,
}

impl ExtractionFrontend {
    pub fn new(config: ExtractionConfig) -> Self {
        ExtractionFrontend {
            config,
            launcher: None,
            scanner: None,
            prompt: None,
            observer: None,
            abort: Arc::new(AbortSignal::new()),
            verbose: false,
        }
    }

    /// Binary started for child processes, defaults to the running executable
    pub fn with_launcher(mut self, launcher: ProcessLauncher) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_scanner(mut self, scanner: Box<dyn SourceScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    /// Prompt used when the source is ambiguous, defaults to the terminal
    pub fn with_prompt(mut self, prompt: Box<dyn UserPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Passes `--verbose` on to child processes
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Handle for the interrupt handler
    pub fn abort_signal(&self) -> Arc<AbortSignal> {
        self.abort.clone()
    }

    /// Runs one extraction from source resolution to the finished storage file
    pub fn process_source(&mut self) -> Result<RunSummary> {
        let start_time = Utc::now();
        let started = Instant::now();
        self.phase(RunPhase::Init);

        let source = self.scan_source()?;
        self.print_options(&source);

        self.phase(RunPhase::Preprocess);
        let registry = ParserRegistry::from_filter(&self.config.parsers)?;
        let mut single_process = self.config.single_process;
        let mut workers = if single_process {
            1
        } else {
            resolve_worker_count(self.config.workers, num_cpus::get())
        };
        // A single file needs a single worker
        if source.source_type == SourceType::File && !(single_process && self.config.debug) {
            workers = 1;
            single_process = false;
        }

        let collection_id = new_collection_id();
        let hostname = local_hostname();
        let information =
            self.collection_information(&source, &registry, workers, single_process, &collection_id, &hostname)?;
        self.log_collection_method(&source);

        let mut summary = RunSummary::new(
            &collection_id,
            &hostname,
            &source.source_path.to_string_lossy(),
            &self.config.output.to_string_lossy(),
        );
        summary.start_time = start_time.to_rfc3339();
        summary.workers = workers;

        let counts = if single_process {
            summary.runtime = "single process mode".to_string();
            self.process_source_single_process(&source, &registry, information)?
        } else {
            summary.runtime = "multi process mode".to_string();
            self.process_source_multi_process(&source, &registry, information, workers)?
        };

        summary.items_collected = counts.items_collected;
        summary.record_storage(counts.storage);
        summary.workers_completed = counts.completed;
        summary.workers_terminated = counts.terminated;
        summary.end_time = Utc::now().to_rfc3339();
        summary.duration_seconds = started.elapsed().as_secs_f64();

        self.phase(RunPhase::Done);
        info!(
            "Processing completed: {} events, {} errors from {} items",
            summary.events, summary.errors, summary.items_collected
        );
        Ok(summary)
    }

    fn scan_source(&mut self) -> Result<ResolvedSource> {
        let scanner = self
            .scanner
            .take()
            .unwrap_or_else(|| Box::new(OsSourceScanner::new()));
        let resolver = PathResolver::new(scanner);
        let options = ResolverOptions::from_config(&self.config);

        let mut console;
        let prompt: &mut dyn UserPrompt = match self.prompt.as_mut() {
            Some(prompt) => prompt.as_mut(),
            None => {
                console = ConsolePrompt::new();
                &mut console
            }
        };
        let context = resolver.scan_source(&self.config.source, &options, prompt)?;
        context.resolved()
    }

    fn print_options(&self, source: &ResolvedSource) {
        info!("Source path\t\t\t: {}", source.source_path.display());
        info!(
            "Is storage media image or device\t: {}",
            source.source_type.is_storage_media()
        );
        if let Some(offset) = source.partition_offset {
            info!("Partition offset\t\t: {} (0x{:08x})", offset, offset);
        }
        if let Some(stores) = source.vss_stores.as_ref().filter(|stores| !stores.is_empty()) {
            info!("VSS stores\t\t\t: {}", stores);
        }
        if let Some(file_filter) = &self.config.file_filter {
            info!("Filter file\t\t\t: {}", file_filter.display());
        }
    }

    fn log_collection_method(&self, source: &ResolvedSource) {
        let filtered = self.config.file_filter.is_some();
        match (source.source_type, filtered) {
            (SourceType::StorageMediaDevice | SourceType::StorageMediaImage, true) => {
                debug!("Starting a collection on image with filter.")
            }
            (SourceType::StorageMediaDevice | SourceType::StorageMediaImage, false) => {
                debug!("Starting a collection on image.")
            }
            (SourceType::Directory, true) => debug!("Starting a collection on directory with filter."),
            (SourceType::Directory, false) => debug!("Starting a collection on directory."),
            (SourceType::File, _) => debug!("Starting a collection on a single file."),
        }
    }

    fn collection_information(
        &self,
        source: &ResolvedSource,
        registry: &ParserRegistry,
        workers: usize,
        single_process: bool,
        collection_id: &str,
        hostname: &str,
    ) -> Result<CollectionInformation> {
        let config = &self.config;
        let mut information = CollectionInformationBuilder::new();

        information.insert("version", env!("CARGO_PKG_VERSION"));
        information.insert("collection_id", collection_id);
        information.insert("hostname", hostname);
        information.insert("configured_zone", config.timezone.as_str());
        information.insert("file_processed", source.source_path.to_string_lossy().to_string());
        information.insert("output_file", config.output.to_string_lossy().to_string());
        information.insert("buffer_size", config.buffer_size as u64);
        let parser_selection = if config.parsers.is_empty() {
            "(no list set)"
        } else {
            config.parsers.as_str()
        };
        information.insert("parser_selection", parser_selection);
        information.insert("parsers", Value::from(registry.names()));
        information.insert("preferred_encoding", config.preferred_encoding.as_str());
        information.insert("time_of_run", Utc::now().timestamp_micros());
        information.insert(
            "preprocess",
            source.source_type == SourceType::Directory || source.source_type.is_storage_media(),
        );
        information.insert("recursive", source.source_type == SourceType::Directory);
        information.insert("debug", config.debug);
        information.insert(
            "vss_parsing",
            source.vss_stores.as_ref().map(|stores| !stores.is_empty()).unwrap_or(false),
        );

        if let Some(filter) = &config.filter {
            information.insert("filter", filter.as_str());
        }
        if let Some(file_filter) = config.file_filter.as_deref() {
            information.insert("file_filter", read_filter_lines(file_filter)?.join(", "));
        }

        if source.source_type.is_storage_media() {
            information.insert("method", "imaged processed");
            information.insert("image_offset", source.partition_offset.unwrap_or(0));
        } else {
            information.insert("method", "OS collection");
        }

        if single_process {
            information.insert("runtime", "single process mode");
        } else {
            information.insert("runtime", "multi process mode");
            information.insert("workers", workers as u64);
        }
        Ok(information.freeze())
    }

    fn collector_options(&self, registry: &ParserRegistry) -> Result<CollectorOptions> {
        let path_filter = self
            .config
            .file_filter
            .as_deref()
            .map(PathFilter::from_file)
            .transpose()?;
        Ok(CollectorOptions {
            include_directory_stat: registry.is_enabled("filestat"),
            path_filter,
            mount_path: self.config.mount_path.clone(),
        })
    }

    fn worker_options(&self, number: usize, single_process: bool) -> WorkerOptions {
        WorkerOptions {
            identifier: format!("Worker_{}", number),
            parser_filter: self.config.parsers.clone(),
            filter_expression: self.config.filter.clone(),
            mount_path: self.config.mount_path.clone(),
            max_hash_size_mb: self.config.tuning.max_hash_size_mb,
            show_memory: self.config.show_memory,
            debug: self.config.debug,
            single_process,
        }
    }

    fn process_source_single_process(
        &self,
        source: &ResolvedSource,
        registry: &ParserRegistry,
        information: CollectionInformation,
    ) -> Result<RunCounts> {
        self.phase(RunPhase::CollectExtract);
        let (handles, _queues) = ExtractionQueues::in_memory();

        let collector = Collector::new(source.clone(), handles.collection.clone(), self.collector_options(registry)?);
        let items_collected = collector.collect()?;
        self.notify(RunEvent::CollectorExited);
        if self.abort.is_aborted() {
            return Err(EngineError::Aborted);
        }

        let options = self.worker_options(0, true);
        let name = options.identifier.clone();
        let pid = std::process::id();
        let worker = ExtractionWorker::new(options, handles.clone())?;
        self.notify(RunEvent::WorkerStarted { name: name.clone(), pid });
        worker.run()?;

        self.phase(RunPhase::DrainWorkers);
        self.notify(RunEvent::WorkerReconciled {
            name,
            pid,
            outcome: WorkerOutcome::Completed,
        });

        self.phase(RunPhase::DrainStorage);
        handles.storage.signal_end_of_input()?;
        handles.errors.signal_end_of_input()?;
        self.notify(RunEvent::StorageEndOfInput);

        let mut writer = StorageFileWriter::new(
            &self.config.output,
            self.config.buffer_size,
            information,
            handles.storage,
            handles.errors,
        );
        let storage = writer.write_event_objects()?;
        self.notify(RunEvent::StorageJoined);

        Ok(RunCounts {
            items_collected,
            storage,
            completed: 1,
            terminated: 0,
        })
    }

    fn process_source_multi_process(
        &self,
        source: &ResolvedSource,
        registry: &ParserRegistry,
        information: CollectionInformation,
        workers: usize,
    ) -> Result<RunCounts> {
        let launcher = match &self.launcher {
            Some(launcher) => launcher.clone(),
            None => ProcessLauncher::current_executable()?,
        };
        // Fails early, before any process is started
        self.collector_options(registry)?;

        let queues = InMemoryQueues::bounded(self.config.tuning.queue_capacity);
        let broker = QueueBroker::start(queues.clone())?;
        let foreman = self.config.run_foreman.then(|| {
            Arc::new(Mutex::new(Foreman::new(
                self.config.tuning.monitoring.clone(),
                self.config.show_memory,
            )))
        });

        let mut run = MultiProcessRun {
            queues,
            broker,
            foreman,
            proxy: None,
            storage: None,
            collector: None,
            workers: BTreeMap::new(),
            counts: RunCounts::default(),
        };
        self.start_engine_proxy(&mut run);

        match self.run_pipeline(&mut run, &launcher, source, registry, information, workers) {
            Ok(()) => Ok(run.counts),
            Err(EngineError::Aborted) => Err(EngineError::Aborted),
            Err(e) => {
                error!("Extraction failed: {}", e);
                self.terminate_run(&mut run);
                Err(e)
            }
        }
    }

    /// Engine proxy receiving `signal_end_of_collection`; without it the run has no foreman
    fn start_engine_proxy(&self, run: &mut MultiProcessRun) {
        let Some(foreman) = run.foreman.clone() else {
            return;
        };
        let started = RpcProxyServer::open().and_then(|server| {
            let server = Arc::new(server);
            server.register_function(SIGNAL_END_OF_COLLECTION, move |_| {
                lock(&foreman).signal_end_of_processing();
                Ok(Value::Bool(true))
            })?;
            let thread = server.spawn("rpc_proxy")?;
            Ok((server, thread))
        });

        match started {
            Ok(proxy) => {
                debug!("Engine RPC proxy listening on port {}", proxy.0.listening_port());
                run.proxy = Some(proxy);
            }
            Err(e) => {
                warn!("Unable to setup a RPC server for the engine with error: {}", e);
                warn!("Continuing without a foreman");
                run.foreman = None;
            }
        }
    }

    fn run_pipeline(
        &self,
        run: &mut MultiProcessRun,
        launcher: &ProcessLauncher,
        source: &ResolvedSource,
        registry: &ParserRegistry,
        information: CollectionInformation,
        workers: usize,
    ) -> Result<()> {
        let monitoring = self.config.tuning.monitoring.clone();
        let broker_port = run.broker.port();
        self.phase(RunPhase::CollectExtract);

        let storage_task = ChildTask::Storage {
            output: self.config.output.clone(),
            buffer_size: self.config.buffer_size,
            information,
            broker_port,
        };
        run.storage = Some(self.spawn_child(launcher, STORAGE_PROCESS, &storage_task, false)?.0);

        let collector_task = ChildTask::Collector {
            source: source.clone(),
            broker_port,
            engine_port: run.proxy.as_ref().map(|(server, _)| server.listening_port()),
            include_directory_stat: registry.is_enabled("filestat"),
            file_filter: self.config.file_filter.clone(),
            mount_path: self.config.mount_path.clone(),
        };
        let collector = self.spawn_child(launcher, COLLECTOR_PROCESS, &collector_task, false)?.0;
        run.collector = Some(collector.clone());

        for number in 0..workers {
            if self.abort.is_aborted() {
                return Err(self.clean_up_after_abort(run));
            }
            let options = self.worker_options(number, false);
            let name = options.identifier.clone();
            let task = ChildTask::Worker { options, broker_port };
            match self.spawn_child(launcher, &name, &task, true) {
                Ok((process, handshake)) => {
                    let status_port = handshake.and_then(|handshake| handshake.status_port);
                    if let Some(foreman) = &run.foreman {
                        lock(foreman).monitor_worker(process.clone(), status_port);
                    }
                    info!("Started {} (PID: {})", name, process.pid());
                    self.notify(RunEvent::WorkerStarted {
                        name: name.clone(),
                        pid: process.pid(),
                    });
                    run.workers.insert(name, WorkerState { process });
                }
                Err(e) => warn!("Unable to start {}: {}", name, e),
            }
        }
        if run.workers.is_empty() {
            return Err(EngineError::process("worker pool", "no extraction worker could be started"));
        }

        // Steady state: watch the workers while the collector runs
        loop {
            let Some(exit) = self.join_polling(collector.as_ref(), Some(monitoring.collector_join_interval())) else {
                return Err(self.clean_up_after_abort(run));
            };
            if !exit.is_running() {
                if !exit.is_success() {
                    warn!("Collector process exited with {}", exit.describe());
                }
                break;
            }
            if let Some(foreman) = &run.foreman {
                lock(foreman).check_status(None);
            }
        }
        self.abort.unregister_child(collector.pid());
        // The sentinel is idempotent and also covers a collector that died early
        run.queues.collection.signal_end_of_input()?;
        self.notify(RunEvent::CollectorExited);

        if let Some(foreman) = &run.foreman {
            lock(foreman).signal_end_of_processing();
        }
        if let Some((server, thread)) = run.proxy.take() {
            server.close();
            let _ = thread.join();
        }

        self.drain_workers(run, monitoring.worker_join_interval())?;
        self.drain_storage(run)
    }

    fn drain_workers(&self, run: &mut MultiProcessRun, join_interval: Duration) -> Result<()> {
        self.phase(RunPhase::DrainWorkers);

        while !run.workers.is_empty() {
            if self.abort.is_aborted() {
                return Err(self.clean_up_after_abort(run));
            }
            let names: Vec<String> = run.workers.keys().cloned().collect();
            for name in names {
                let Some(process) = run.workers.get(&name).map(|worker| worker.process.clone()) else {
                    continue;
                };
                let pid = process.pid();
                let label = run.foreman.as_ref().and_then(|foreman| lock(foreman).get_label(&name, pid));

                let outcome = match label {
                    None => {
                        let Some(exit) = self.join_polling(process.as_ref(), None) else {
                            return Err(self.clean_up_after_abort(run));
                        };
                        self.reconcile_unmonitored(run, &name, pid, exit)
                    }
                    Some(label) => {
                        let Some(foreman) = run.foreman.clone() else {
                            continue;
                        };
                        if process.is_alive() {
                            lock(&foreman).check_status(Some(&label));
                            if self.join_polling(process.as_ref(), Some(join_interval)).is_none() {
                                return Err(self.clean_up_after_abort(run));
                            }
                            continue;
                        }

                        let exit = process.poll();
                        let mut foreman = lock(&foreman);
                        if exit.is_success() {
                            foreman.stop_monitoring_worker(&label);
                            WorkerOutcome::Completed
                        } else {
                            warn!("{}", exit.worker_error(&name, pid));
                            if let Err(e) = process.terminate() {
                                warn!("Unable to terminate {}: {}", name, e);
                            }
                            foreman.terminate_process(&label);
                            foreman.stop_monitoring_worker(&label);
                            WorkerOutcome::Terminated
                        }
                    }
                };

                run.workers.remove(&name);
                self.abort.unregister_child(pid);
                match outcome {
                    WorkerOutcome::Completed => run.counts.completed += 1,
                    WorkerOutcome::Terminated => run.counts.terminated += 1,
                }
                self.notify(RunEvent::WorkerReconciled { name, pid, outcome });
            }
        }
        Ok(())
    }

    /// Outcome of a worker without a live monitor, possibly classified by the foreman before
    fn reconcile_unmonitored(&self, run: &MultiProcessRun, name: &str, pid: u32, exit: ProcessExit) -> WorkerOutcome {
        let state = run.foreman.as_ref().and_then(|foreman| {
            lock(foreman).stop_monitoring_worker(&WorkerLabel {
                name: name.to_string(),
                pid,
            })
        });
        match state {
            Some(MonitorState::Terminated) => WorkerOutcome::Terminated,
            Some(_) => WorkerOutcome::Completed,
            None if exit.is_success() => WorkerOutcome::Completed,
            None => {
                warn!("{}", exit.worker_error(&name, pid));
                WorkerOutcome::Terminated
            }
        }
    }

    fn drain_storage(&self, run: &mut MultiProcessRun) -> Result<()> {
        self.phase(RunPhase::DrainStorage);
        run.queues.storage.signal_end_of_input()?;
        run.queues.errors.signal_end_of_input()?;
        self.notify(RunEvent::StorageEndOfInput);

        if let Some(storage) = run.storage.clone() {
            let Some(exit) = self.join_polling(storage.as_ref(), None) else {
                return Err(self.clean_up_after_abort(run));
            };
            self.abort.unregister_child(storage.pid());
            self.notify(RunEvent::StorageJoined);
            if !exit.is_success() {
                run.broker.shutdown();
                return Err(EngineError::process(STORAGE_PROCESS, exit.describe()));
            }
        }
        run.broker.shutdown();

        run.counts.items_collected = run.queues.collection.pushed_count();
        run.counts.storage = StorageCounts {
            events: run.queues.storage.popped_count(),
            errors: run.queues.errors.popped_count(),
        };
        Ok(())
    }

    /// Stops the run after an interrupt
    fn clean_up_after_abort(&self, run: &mut MultiProcessRun) -> EngineError {
        if !self.abort.begin_cleanup() {
            return EngineError::Aborted;
        }
        self.phase(RunPhase::Abort);

        let storage_joined = self.terminate_run(run);
        if !storage_joined && self.config.tuning.hard_exit_on_abort {
            error!("Storage process did not finish, terminating the process group");
            if let Err(e) = terminate_process_group() {
                error!("Unable to terminate the process group: {}", e);
            }
        }
        EngineError::Aborted
    }

    /// Ends every queue and kills the children; true when storage finished by itself
    fn terminate_run(&self, run: &mut MultiProcessRun) -> bool {
        warn!("Stopping collector.");
        let _ = run.queues.collection.signal_end_of_input();

        warn!("Stopping storage.");
        let _ = run.queues.storage.signal_end_of_input();
        let _ = run.queues.errors.signal_end_of_input();
        self.notify(RunEvent::StorageEndOfInput);

        if let Some(collector) = &run.collector {
            if collector.is_alive() {
                warn!("Terminating the collection process.");
                if let Err(e) = collector.terminate() {
                    warn!("Unable to terminate the collection process: {}", e);
                }
            }
            self.abort.unregister_child(collector.pid());
        }

        for (name, worker) in std::mem::take(&mut run.workers) {
            let pid = worker.process.pid();
            if worker.process.is_alive() {
                warn!("Terminating {} (PID: {}).", name, pid);
            }
            if let Err(e) = worker.process.terminate() {
                warn!("Unable to terminate {}: {}", name, e);
            }
            if let Some(foreman) = &run.foreman {
                let mut foreman = lock(foreman);
                let label = WorkerLabel { name: name.clone(), pid };
                foreman.terminate_process(&label);
                foreman.stop_monitoring_worker(&label);
            }
            self.abort.unregister_child(pid);
            run.counts.terminated += 1;
            self.notify(RunEvent::WorkerReconciled {
                name,
                pid,
                outcome: WorkerOutcome::Terminated,
            });
        }

        if let Some((server, thread)) = run.proxy.take() {
            server.close();
            let _ = thread.join();
        }

        let mut storage_joined = true;
        if let Some(storage) = &run.storage {
            let exit = storage.join(Some(self.config.tuning.monitoring.abort_storage_join_timeout()));
            if exit.is_running() {
                warn!("Storage process did not finish, terminating it.");
                storage_joined = false;
                if let Err(e) = storage.terminate() {
                    warn!("Unable to terminate the storage process: {}", e);
                }
            }
            self.abort.unregister_child(storage.pid());
            self.notify(RunEvent::StorageJoined);
        }
        run.broker.shutdown();
        storage_joined
    }

    fn spawn_child(
        &self,
        launcher: &ProcessLauncher,
        name: &str,
        task: &ChildTask,
        expect_handshake: bool,
    ) -> Result<(Arc<ChildProcess>, Option<Handshake>)> {
        let (process, handshake) = launcher.spawn(name, task, self.verbose, expect_handshake)?;
        self.abort.register_child(process.pid(), name);
        debug!("Started {} (PID: {})", name, process.pid());
        Ok((Arc::new(process), handshake))
    }

    /// Join in short slices; `None` when an interrupt arrived first
    fn join_polling(&self, process: &dyn ManagedProcess, timeout: Option<Duration>) -> Option<ProcessExit> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let slice = Duration::from_millis(PROCESS_POLL_INTERVAL_MS * 4);
        loop {
            let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
            let exit = process.join(Some(remaining.map(|left| left.min(slice)).unwrap_or(slice)));
            if !exit.is_running() {
                return Some(exit);
            }
            if self.abort.is_aborted() {
                return None;
            }
            if remaining.map(|left| left.is_zero()).unwrap_or(false) {
                return Some(exit);
            }
        }
    }

    fn phase(&self, phase: RunPhase) {
        debug!("Entering phase {}", phase);
        self.notify(RunEvent::PhaseChanged(phase));
    }

    fn notify(&self, event: RunEvent) {
        if let Some(observer) = &self.observer {
            observer.on_event(&event);
        }
    }
}

fn lock(foreman: &Mutex<Foreman>) -> MutexGuard<'_, Foreman> {
    foreman.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ReaderPrompt;
    use crate::storage::read_storage_file;
    use crate::test_utils::{create_test_file_structure, FakeSourceScanner};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn single_process_config(source: &std::path::Path, output: &std::path::Path) -> ExtractionConfig {
        ExtractionConfig {
            source: source.to_path_buf(),
            output: output.to_path_buf(),
            single_process: true,
            ..ExtractionConfig::default()
        }
    }

    #[test]
    fn test_single_process_directory_run() {
        let temp_dir = create_test_file_structure().unwrap();
        let output_dir = TempDir::new().unwrap();
        let output = output_dir.path().join("timeline.jsonl");
        let journal = Arc::new(RunJournal::new());

        let mut frontend = ExtractionFrontend::new(single_process_config(temp_dir.path(), &output))
            .with_observer(journal.clone());
        let summary = frontend.process_source().unwrap();

        assert_eq!(summary.runtime, "single process mode");
        assert_eq!(summary.items_collected, 8);
        assert!(summary.events > 0);
        assert_eq!(
            journal.phases(),
            vec![
                RunPhase::Init,
                RunPhase::Preprocess,
                RunPhase::CollectExtract,
                RunPhase::DrainWorkers,
                RunPhase::DrainStorage,
                RunPhase::Done,
            ]
        );

        let contents = read_storage_file(&output).unwrap();
        assert!(contents.is_complete());
        assert_eq!(contents.events.len() as u64, summary.events);
        let information = &contents.sessions[0];
        assert_eq!(information.get_str("method"), Some("OS collection"));
        assert_eq!(information.get_str("runtime"), Some("single process mode"));
        assert_eq!(information.get("recursive"), Some(&Value::Bool(true)));
        assert_eq!(information.get("workers"), None);
    }

    #[test]
    fn test_storage_end_of_input_follows_reconciliation() {
        let temp_dir = create_test_file_structure().unwrap();
        let output_dir = TempDir::new().unwrap();
        let output = output_dir.path().join("timeline.jsonl");
        let journal = Arc::new(RunJournal::new());

        let mut frontend = ExtractionFrontend::new(single_process_config(temp_dir.path(), &output))
            .with_observer(journal.clone());
        frontend.process_source().unwrap();

        let end_of_input = journal.position(|event| *event == RunEvent::StorageEndOfInput).unwrap();
        let collector = journal.position(|event| *event == RunEvent::CollectorExited).unwrap();
        let reconciled = journal
            .position(|event| matches!(event, RunEvent::WorkerReconciled { .. }))
            .unwrap();
        assert!(collector < end_of_input);
        assert!(reconciled < end_of_input);
    }

    #[test]
    fn test_scan_failure_aborts_before_extraction() {
        let output_dir = TempDir::new().unwrap();
        let output = output_dir.path().join("timeline.jsonl");
        let mut config = single_process_config(output_dir.path(), &output);
        config.source = output_dir.path().join("missing.raw");
        let journal = Arc::new(RunJournal::new());

        let mut frontend = ExtractionFrontend::new(config).with_observer(journal.clone());
        assert!(matches!(frontend.process_source(), Err(EngineError::SourceScan(_))));
        assert_eq!(journal.phases(), vec![RunPhase::Init]);
        assert!(!output.exists());
    }

    #[test]
    fn test_partition_prompt_is_used_for_ambiguous_source() {
        let output_dir = TempDir::new().unwrap();
        let output = output_dir.path().join("timeline.jsonl");
        let image = output_dir.path().join("disk.raw");
        std::fs::write(&image, vec![0u8; 4096]).unwrap();

        let mut frontend = ExtractionFrontend::new(single_process_config(&image, &output))
            .with_scanner(Box::new(FakeSourceScanner::partitioned(2)))
            .with_prompt(Box::new(ReaderPrompt::new(Cursor::new(b"p2\n".to_vec()), Vec::new())));
        let source = frontend.scan_source().unwrap();

        assert_eq!(source.source_type, SourceType::StorageMediaImage);
        assert_eq!(source.partition_offset, Some(FakeSourceScanner::partition_offset(2)));
    }

    #[test]
    fn test_collection_information_for_storage_media() {
        let output_dir = TempDir::new().unwrap();
        let output = output_dir.path().join("timeline.jsonl");
        let mut config = single_process_config(output_dir.path(), &output);
        config.single_process = false;
        config.filter = Some("parser == filestat".to_string());
        let frontend = ExtractionFrontend::new(config);

        let mut source = ResolvedSource::from_os_path(&output_dir.path().join("disk.raw"), SourceType::StorageMediaImage);
        source.partition_offset = Some(32_256);
        source.vss_stores = Some(crate::config::StoreSelection::parse("1..2").unwrap());
        let registry = ParserRegistry::all();

        let information = frontend
            .collection_information(&source, &registry, 4, false, "id", "host")
            .unwrap();
        assert_eq!(information.get_str("method"), Some("imaged processed"));
        assert_eq!(information.get("image_offset"), Some(&Value::from(32_256u64)));
        assert_eq!(information.get("workers"), Some(&Value::from(4u64)));
        assert_eq!(information.get("vss_parsing"), Some(&Value::Bool(true)));
        assert_eq!(information.get_str("filter"), Some("parser == filestat"));
        assert_eq!(information.get_str("parser_selection"), Some("(no list set)"));
        assert_eq!(information.get_str("collection_id"), Some("id"));
    }
}
