//! Storage sink: drains the storage and error queues into a storage file.
//!
//! The storage file holds JSON lines. Each run appends a
//! `collection_information` record, the `event` and `error` records in
//! arrival order and one `end_of_stream` record carrying the counts. The
//! end-of-stream record is only written once both queues delivered their
//! end-of-input sentinel.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::models::{CollectionInformation, ExtractedEvent, ExtractionError};
use crate::queue::{ItemQueue, QueueMessage};

/// Pop timeout per queue once neither queue delivered anything
const STORAGE_POLL_TIMEOUT: Duration = Duration::from_millis(20);

/// One line of the storage file
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum StorageRecord {
    CollectionInformation { information: CollectionInformation },
    Event { event: ExtractedEvent },
    Error { error: ExtractionError },
    EndOfStream { events: u64, errors: u64 },
}

/// Counts written by one storage session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageCounts {
    pub events: u64,
    pub errors: u64,
}

/// Consumer of the storage queue
pub trait StorageSink: Send {
    /// Blocks until the queues are drained, returns what was written
    fn write_event_objects(&mut self) -> Result<StorageCounts>;
}

pub struct StorageFileWriter {
    path: PathBuf,
    buffer_size: usize,
    information: CollectionInformation,
    events: Arc<dyn ItemQueue<ExtractedEvent>>,
    errors: Arc<dyn ItemQueue<ExtractionError>>,
}

impl StorageFileWriter {
    pub fn new(
        path: impl Into<PathBuf>,
        buffer_size: usize,
        information: CollectionInformation,
        events: Arc<dyn ItemQueue<ExtractedEvent>>,
        errors: Arc<dyn ItemQueue<ExtractionError>>,
    ) -> Self {
        StorageFileWriter {
            path: path.into(),
            buffer_size,
            information,
            events,
            errors,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<BufWriter<File>> {
        if self.path.exists() {
            info!("Appending to storage file {}", self.path.display());
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        Ok(BufWriter::with_capacity(self.buffer_size.max(1), file))
    }
}

impl StorageSink for StorageFileWriter {
    fn write_event_objects(&mut self) -> Result<StorageCounts> {
        let start = Instant::now();
        let mut writer = self.open()?;
        write_record(
            &mut writer,
            &StorageRecord::CollectionInformation {
                information: self.information.clone(),
            },
        )?;

        let mut counts = StorageCounts::default();
        let mut events_ended = false;
        let mut errors_ended = false;
        let mut idle = false;

        // Each queue is polled once per pass; only an idle pass waits
        while !(events_ended && errors_ended) {
            let wait = if idle { STORAGE_POLL_TIMEOUT } else { Duration::ZERO };
            let mut progressed = false;

            if !events_ended {
                match self.events.pop_item(wait)? {
                    Some(QueueMessage::Item(event)) => {
                        write_record(&mut writer, &StorageRecord::Event { event })?;
                        counts.events += 1;
                        progressed = true;
                    }
                    Some(QueueMessage::EndOfInput) => {
                        debug!("Storage queue ended after {} events", counts.events);
                        events_ended = true;
                        progressed = true;
                    }
                    None => {}
                }
            }
            if !errors_ended {
                match self.errors.pop_item(wait)? {
                    Some(QueueMessage::Item(error)) => {
                        write_record(&mut writer, &StorageRecord::Error { error })?;
                        counts.errors += 1;
                        progressed = true;
                    }
                    Some(QueueMessage::EndOfInput) => {
                        debug!("Error queue ended after {} errors", counts.errors);
                        errors_ended = true;
                        progressed = true;
                    }
                    None => {}
                }
            }
            idle = !progressed;
        }

        write_record(
            &mut writer,
            &StorageRecord::EndOfStream {
                events: counts.events,
                errors: counts.errors,
            },
        )?;
        writer.flush()?;

        info!(
            "Wrote {} events and {} errors to {} in {:.2?}",
            counts.events,
            counts.errors,
            self.path.display(),
            start.elapsed()
        );
        Ok(counts)
    }
}

fn write_record<W: Write>(writer: &mut W, record: &StorageRecord) -> Result<()> {
    serde_json::to_writer(&mut *writer, record)?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Contents of a storage file, one session per run appended to it
#[derive(Debug, Clone, Default)]
pub struct StorageContents {
    pub sessions: Vec<CollectionInformation>,
    pub events: Vec<ExtractedEvent>,
    pub errors: Vec<ExtractionError>,
    /// Counts of every `end_of_stream` record, in file order
    pub end_of_stream: Vec<StorageCounts>,
}

impl StorageContents {
    /// Whether every session was closed by an end-of-stream record
    pub fn is_complete(&self) -> bool {
        !self.sessions.is_empty() && self.sessions.len() == self.end_of_stream.len()
    }
}

pub fn read_storage_file(path: &Path) -> Result<StorageContents> {
    let reader = BufReader::new(File::open(path)?);
    let mut contents = StorageContents::default();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: StorageRecord = serde_json::from_str(&line).map_err(|e| {
            EngineError::configuration(format!("{} line {}: {}", path.display(), index + 1, e))
        })?;
        match record {
            StorageRecord::CollectionInformation { information } => contents.sessions.push(information),
            StorageRecord::Event { event } => contents.events.push(event),
            StorageRecord::Error { error } => contents.errors.push(error),
            StorageRecord::EndOfStream { events, errors } => {
                contents.end_of_stream.push(StorageCounts { events, errors })
            }
        }
    }
    Ok(contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CollectionInformationBuilder;
    use crate::queue::WorkQueue;
    use crate::test_utils::generators::{test_error, test_event};
    use std::thread;
    use tempfile::TempDir;

    fn information() -> CollectionInformation {
        let mut builder = CollectionInformationBuilder::new();
        builder.insert("version", "test");
        builder.freeze()
    }

    fn writer_for(
        path: &Path,
    ) -> (StorageFileWriter, Arc<WorkQueue<ExtractedEvent>>, Arc<WorkQueue<ExtractionError>>) {
        let events = Arc::new(WorkQueue::unbounded("storage"));
        let errors = Arc::new(WorkQueue::unbounded("errors"));
        let writer = StorageFileWriter::new(path, 4096, information(), events.clone(), errors.clone());
        (writer, events, errors)
    }

    #[test]
    fn test_end_of_stream_written_after_both_sentinels() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("timeline.jsonl");
        let (mut writer, events, errors) = writer_for(&path);

        let producer = thread::spawn(move || {
            for index in 0..25 {
                events.push_item(test_event(index, "/file")).unwrap();
            }
            errors.push_item(test_error("/broken")).unwrap();
            events.signal_end_of_input().unwrap();
            thread::sleep(Duration::from_millis(100));
            errors.push_item(test_error("/late")).unwrap();
            errors.signal_end_of_input().unwrap();
        });

        let counts = writer.write_event_objects().unwrap();
        producer.join().unwrap();
        assert_eq!(counts, StorageCounts { events: 25, errors: 2 });

        let contents = read_storage_file(&path).unwrap();
        assert!(contents.is_complete());
        assert_eq!(contents.events.len(), 25);
        assert_eq!(contents.errors.len(), 2);
        assert_eq!(contents.sessions[0].get_str("version"), Some("test"));

        let last_line = std::fs::read_to_string(&path).unwrap().lines().last().unwrap().to_string();
        assert!(last_line.contains("\"record\":\"end_of_stream\""));
    }

    #[test]
    fn test_errors_drained_while_events_keep_arriving() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("timeline.jsonl");
        let events: Arc<WorkQueue<ExtractedEvent>> = Arc::new(WorkQueue::unbounded("storage"));
        let errors: Arc<WorkQueue<ExtractionError>> = Arc::new(WorkQueue::bounded("errors", 2));
        let mut writer = StorageFileWriter::new(&path, 4096, information(), events.clone(), errors.clone());

        for index in 0..200 {
            events.push_item(test_event(index, "/flood")).unwrap();
        }
        errors.push_item(test_error("/broken0")).unwrap();
        errors.push_item(test_error("/broken1")).unwrap();
        let error_producer = {
            let errors = errors.clone();
            thread::spawn(move || {
                for index in 2..10 {
                    errors.push_item(test_error(&format!("/broken{}", index))).unwrap();
                }
                errors.signal_end_of_input().unwrap();
            })
        };
        let sink = thread::spawn(move || writer.write_event_objects().unwrap());

        error_producer.join().unwrap();
        events.signal_end_of_input().unwrap();

        let counts = sink.join().unwrap();
        assert_eq!(counts, StorageCounts { events: 200, errors: 10 });

        let lines = std::fs::read_to_string(&path).unwrap();
        // Collection information, then one event and one error per pass
        let first_error = lines.lines().position(|line| line.contains("\"record\":\"error\"")).unwrap();
        assert_eq!(first_error, 2);
    }

    #[test]
    fn test_appends_sessions() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("timeline.jsonl");

        for _ in 0..2 {
            let (mut writer, events, errors) = writer_for(&path);
            events.push_item(test_event(1, "/a")).unwrap();
            events.signal_end_of_input().unwrap();
            errors.signal_end_of_input().unwrap();
            writer.write_event_objects().unwrap();
        }

        let contents = read_storage_file(&path).unwrap();
        assert_eq!(contents.sessions.len(), 2);
        assert_eq!(contents.end_of_stream, vec![StorageCounts { events: 1, errors: 0 }; 2]);
    }

    #[test]
    fn test_unterminated_file_is_incomplete() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("partial.jsonl");
        let record = StorageRecord::CollectionInformation { information: information() };
        std::fs::write(&path, format!("{}\n", serde_json::to_string(&record).unwrap())).unwrap();

        let contents = read_storage_file(&path).unwrap();
        assert!(!contents.is_complete());
    }
}
