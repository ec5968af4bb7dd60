//! Collector: walks the resolved source and queues one work item per entry.
//!
//! Directories are walked recursively (optionally restricted by a
//! [`PathFilter`]), a single file yields one item and a storage media
//! source yields one item per volume and selected shadow copy store unless
//! its file system is mounted, in which case the mount point is walked.
//! Whatever happens, the collection queue receives its end-of-input signal
//! exactly once.

mod filter;

pub use filter::PathFilter;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::json;
use walkdir::WalkDir;

use crate::error::{EngineError, Result};
use crate::models::{PathSpec, SourceType, TypeIndicator, WorkItemDescriptor};
use crate::queue::ItemQueue;
use crate::resolver::ResolvedSource;
use crate::rpc::{RpcProxyClient, SIGNAL_END_OF_COLLECTION};

/// What the collector emits besides regular files
#[derive(Debug, Clone, Default)]
pub struct CollectorOptions {
    /// Emit directory entries, needed when file system metadata is parsed
    pub include_directory_stat: bool,
    pub path_filter: Option<PathFilter>,
    /// Mount point of the file system of a storage media source
    pub mount_path: Option<PathBuf>,
}

pub struct Collector {
    source: ResolvedSource,
    queue: Arc<dyn ItemQueue<WorkItemDescriptor>>,
    options: CollectorOptions,
    notifier: Option<RpcProxyClient>,
    abort: Arc<AtomicBool>,
    end_signalled: AtomicBool,
    collected: AtomicU64,
}

impl Collector {
    pub fn new(source: ResolvedSource, queue: Arc<dyn ItemQueue<WorkItemDescriptor>>, options: CollectorOptions) -> Self {
        Collector {
            source,
            queue,
            options,
            notifier: None,
            abort: Arc::new(AtomicBool::new(false)),
            end_signalled: AtomicBool::new(false),
            collected: AtomicU64::new(0),
        }
    }

    /// Calls `signal_end_of_collection` on the engine once collection ended
    pub fn with_completion_notifier(mut self, client: RpcProxyClient) -> Self {
        self.notifier = Some(client);
        self
    }

    /// Flag that stops the walk at the next entry
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    pub fn collected_count(&self) -> u64 {
        self.collected.load(Ordering::SeqCst)
    }

    /// Walks the source, then signals the end of collection
    pub fn collect(&self) -> Result<u64> {
        info!("Collection started from {}", self.source.source_path.display());
        let result = self.collect_source();
        self.signal_end_of_collection()?;

        match result {
            Ok(()) => {}
            // The queue was ended from outside: the run is aborting
            Err(EngineError::QueueClosed(name)) => warn!("Collection stopped, queue {} was closed", name),
            Err(e) => return Err(e),
        }

        let collected = self.collected_count();
        info!("Collection completed: {} items queued", collected);
        Ok(collected)
    }

    /// Ends the collection queue; only the first call has an effect
    pub fn signal_end_of_collection(&self) -> Result<bool> {
        if self.end_signalled.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.queue.signal_end_of_input()?;

        if let Some(client) = &self.notifier {
            let details = json!({ "items": self.collected_count() });
            if let Err(e) = client.call(SIGNAL_END_OF_COLLECTION, details) {
                warn!("Unable to notify the engine of the end of collection: {}", e);
            }
        }
        Ok(true)
    }

    fn collect_source(&self) -> Result<()> {
        match self.source.source_type {
            SourceType::Directory => self.collect_directory(&self.source.source_path),
            SourceType::File => {
                let path = &self.source.source_path;
                self.push(WorkItemDescriptor {
                    path_spec: PathSpec::os(path.to_string_lossy()),
                    display_name: path.to_string_lossy().to_string(),
                    vss_store: None,
                    is_directory: false,
                })
            }
            SourceType::StorageMediaDevice | SourceType::StorageMediaImage => self.collect_storage_media(),
        }
    }

    fn collect_directory(&self, root: &Path) -> Result<()> {
        let path_filter = self.options.path_filter.as_ref();
        let walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                !entry.file_type().is_dir()
                    || path_filter
                        .map(|filter| {
                            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
                            filter.may_contain(relative) || filter.matches(relative)
                        })
                        .unwrap_or(true)
            });

        for entry in walker {
            if self.abort.load(Ordering::SeqCst) {
                info!("Collection aborted");
                break;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Unable to read directory entry: {}", e);
                    continue;
                }
            };

            let is_directory = entry.file_type().is_dir();
            if is_directory && !self.options.include_directory_stat {
                continue;
            }
            if let Some(filter) = path_filter {
                let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
                if !filter.matches(relative) {
                    continue;
                }
            }

            self.push(WorkItemDescriptor {
                path_spec: PathSpec::os(entry.path().to_string_lossy()),
                display_name: entry.path().to_string_lossy().to_string(),
                vss_store: None,
                is_directory,
            })?;
        }
        Ok(())
    }

    fn collect_storage_media(&self) -> Result<()> {
        if let Some(mount_path) = self.options.mount_path.as_ref().filter(|path| path.is_dir()) {
            info!("Collecting from file system mounted at {}", mount_path.display());
            return self.collect_directory(mount_path);
        }

        let source_name = self.source.source_path.to_string_lossy().to_string();
        let volume_spec = self.source.path_spec.clone();
        let offset = volume_spec.effective_start_offset().or(self.source.partition_offset).unwrap_or(0);
        self.push(WorkItemDescriptor {
            display_name: format!("{}:offset:0x{:08x}", source_name, offset),
            path_spec: volume_spec.clone(),
            vss_store: None,
            is_directory: false,
        })?;

        let stores = self.source.vss_stores.clone().unwrap_or_default();
        for store in stores.stores() {
            if self.abort.load(Ordering::SeqCst) {
                break;
            }
            let parent = volume_spec.parent.as_deref().cloned().unwrap_or_else(|| volume_spec.clone());
            let location = format!("/vss{}", store);
            debug!("Queueing shadow copy store {}", store);
            self.push(WorkItemDescriptor {
                path_spec: PathSpec::nested(TypeIndicator::ShadowCopyStore, Some(&location), parent)
                    .with_store_index(store - 1),
                display_name: format!("{}:vss{}", source_name, store),
                vss_store: Some(*store),
                is_directory: false,
            })?;
        }
        Ok(())
    }

    fn push(&self, descriptor: WorkItemDescriptor) -> Result<()> {
        debug!("Collected {}", descriptor.display_name);
        self.queue.push_item(descriptor)?;
        self.collected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueueMessage, WorkQueue};
    use crate::test_utils::create_test_file_structure;
    use std::time::Duration;

    fn drain(queue: &WorkQueue<WorkItemDescriptor>) -> Vec<WorkItemDescriptor> {
        let mut items = Vec::new();
        loop {
            match queue.pop_item(Duration::from_millis(100)).unwrap() {
                Some(QueueMessage::Item(item)) => items.push(item),
                Some(QueueMessage::EndOfInput) => return items,
                None => panic!("collection queue was not ended"),
            }
        }
    }

    fn collector_for(source: ResolvedSource, options: CollectorOptions) -> (Collector, Arc<WorkQueue<WorkItemDescriptor>>) {
        let queue = Arc::new(WorkQueue::unbounded("collection"));
        (Collector::new(source, queue.clone(), options), queue)
    }

    #[test]
    fn test_directory_without_directory_entries() {
        let temp_dir = create_test_file_structure().unwrap();
        let source = ResolvedSource::from_os_path(temp_dir.path(), SourceType::Directory);
        let (collector, queue) = collector_for(source, CollectorOptions::default());

        assert_eq!(collector.collect().unwrap(), 5);
        let items = drain(&queue);
        assert_eq!(items.len(), 5);
        assert!(items.iter().all(|item| !item.is_directory));
    }

    #[test]
    fn test_directory_entries_with_filestat() {
        let temp_dir = create_test_file_structure().unwrap();
        let source = ResolvedSource::from_os_path(temp_dir.path(), SourceType::Directory);
        let options = CollectorOptions { include_directory_stat: true, ..CollectorOptions::default() };
        let (collector, queue) = collector_for(source, options);

        collector.collect().unwrap();
        let items = drain(&queue);
        assert_eq!(items.iter().filter(|item| item.is_directory).count(), 3);
    }

    #[test]
    fn test_path_filter_restricts_walk() {
        let temp_dir = create_test_file_structure().unwrap();
        let source = ResolvedSource::from_os_path(temp_dir.path(), SourceType::Directory);
        let options = CollectorOptions {
            path_filter: Some(PathFilter::from_lines(&["/dir1/.+\\.txt".to_string()]).unwrap()),
            ..CollectorOptions::default()
        };
        let (collector, queue) = collector_for(source, options);

        collector.collect().unwrap();
        let items = drain(&queue);
        assert_eq!(items.len(), 1);
        assert!(items[0].display_name.ends_with("file3.txt"));
    }

    #[test]
    fn test_single_file_source() {
        let temp_dir = create_test_file_structure().unwrap();
        let source = ResolvedSource::from_os_path(&temp_dir.path().join("file1.txt"), SourceType::File);
        let (collector, queue) = collector_for(source, CollectorOptions::default());

        assert_eq!(collector.collect().unwrap(), 1);
        assert_eq!(drain(&queue).len(), 1);
    }

    #[test]
    fn test_end_of_collection_is_signalled_once() {
        let temp_dir = create_test_file_structure().unwrap();
        let source = ResolvedSource::from_os_path(temp_dir.path(), SourceType::Directory);
        let (collector, queue) = collector_for(source, CollectorOptions::default());

        collector.abort_handle().store(true, Ordering::SeqCst);
        assert_eq!(collector.collect().unwrap(), 0);
        assert!(queue.is_ended());
        assert!(!collector.signal_end_of_collection().unwrap());
    }

    #[test]
    fn test_closed_queue_stops_collection() {
        let temp_dir = create_test_file_structure().unwrap();
        let source = ResolvedSource::from_os_path(temp_dir.path(), SourceType::Directory);
        let (collector, queue) = collector_for(source, CollectorOptions::default());

        queue.signal_end_of_input().unwrap();
        assert_eq!(collector.collect().unwrap(), 0);
    }

    #[test]
    fn test_storage_media_volume_and_stores() {
        let image = PathSpec::os("/case/disk.raw");
        let partition = PathSpec::nested(TypeIndicator::Partition, Some("/p1"), image).with_start_offset(1_048_576);
        let source = ResolvedSource {
            source_path: PathBuf::from("/case/disk.raw"),
            source_type: SourceType::StorageMediaImage,
            path_spec: PathSpec::nested(TypeIndicator::FileSystem, Some("/"), partition),
            partition_offset: Some(1_048_576),
            vss_stores: Some(crate::config::StoreSelection::parse("1,3").unwrap()),
        };
        let (collector, queue) = collector_for(source, CollectorOptions::default());

        collector.collect().unwrap();
        let items = drain(&queue);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].display_name, "/case/disk.raw:offset:0x00100000");
        assert_eq!(items[2].vss_store, Some(3));
        assert_eq!(items[2].path_spec.store_index, Some(2));
    }
}
