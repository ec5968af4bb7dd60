//! Work queues connecting the collector, the workers and the storage sink.
//!
//! Three unidirectional queues exist per run: collection (collector to
//! workers), storage (workers to the storage sink) and errors (workers to
//! the storage sink). A queue is ended with an explicit end-of-input signal.
//! After the signal pushes are rejected and every consumer observes
//! [`QueueMessage::EndOfInput`] once the remaining items are drained.
//!
//! [`WorkQueue`] is the in-process implementation. In multi-process mode
//! the orchestrator hosts the queues behind a [`QueueBroker`] and child
//! processes reach them through [`RemoteQueue`].

mod broker;

pub use broker::{QueueBroker, RemoteQueue, COLLECTION_QUEUE, ERROR_QUEUE, STORAGE_QUEUE};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::models::{ExtractedEvent, ExtractionError, WorkItemDescriptor};

/// Slice of a blocking push or pop between end-of-input checks
const QUEUE_WAIT_SLICE: Duration = Duration::from_millis(50);

/// Element delivered by a queue
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum QueueMessage<T> {
    Item(T),
    /// Sentinel: no further items will be sent
    EndOfInput,
}

/// Multi-producer, multi-consumer queue interface shared by all processes
pub trait ItemQueue<T>: Send + Sync {
    /// Pushes an item, failing if end-of-input was already signalled
    fn push_item(&self, item: T) -> Result<()>;

    /// Pops the next message, or `None` when nothing arrived within `timeout`
    fn pop_item(&self, timeout: Duration) -> Result<Option<QueueMessage<T>>>;

    /// Records the end-of-input sentinel; repeated calls have no effect
    fn signal_end_of_input(&self) -> Result<()>;
}

/// In-process queue backed by a crossbeam channel
pub struct WorkQueue<T> {
    name: String,
    sender: Sender<T>,
    receiver: Receiver<T>,
    end_of_input: AtomicBool,
    pushed: AtomicU64,
    popped: AtomicU64,
}

impl<T: Send> WorkQueue<T> {
    /// Queue holding at most `capacity` items; producers block when full
    pub fn bounded(name: &str, capacity: usize) -> Self {
        let (sender, receiver) = channel::bounded(capacity.max(1));
        Self::from_channel(name, sender, receiver)
    }

    /// Queue without capacity limit, used in single-process mode
    pub fn unbounded(name: &str) -> Self {
        let (sender, receiver) = channel::unbounded();
        Self::from_channel(name, sender, receiver)
    }

    fn from_channel(name: &str, sender: Sender<T>, receiver: Receiver<T>) -> Self {
        WorkQueue {
            name: name.to_string(),
            sender,
            receiver,
            end_of_input: AtomicBool::new(false),
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ended(&self) -> bool {
        self.end_of_input.load(Ordering::SeqCst)
    }

    /// Items currently queued
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Total number of items accepted so far
    pub fn pushed_count(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Total number of items handed to consumers so far
    pub fn popped_count(&self) -> u64 {
        self.popped.load(Ordering::Relaxed)
    }

    fn closed(&self) -> EngineError {
        EngineError::QueueClosed(self.name.clone())
    }

    fn delivered(&self, item: T) -> Option<QueueMessage<T>> {
        self.popped.fetch_add(1, Ordering::Relaxed);
        Some(QueueMessage::Item(item))
    }
}

impl<T: Send> WorkQueue<T> {
    /// Pushes unless the queue stays full for `timeout`, handing the item back then
    pub fn push_within(&self, item: T, timeout: Duration) -> Result<Option<T>> {
        let deadline = Instant::now() + timeout;
        let mut item = item;
        loop {
            if self.is_ended() {
                return Err(self.closed());
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Some(item));
            }
            match self.sender.send_timeout(item, QUEUE_WAIT_SLICE.min(deadline - now)) {
                Ok(()) => {
                    self.pushed.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
                Err(SendTimeoutError::Timeout(returned)) => item = returned,
                Err(SendTimeoutError::Disconnected(_)) => return Err(self.closed()),
            }
        }
    }
}

impl<T: Send> ItemQueue<T> for WorkQueue<T> {
    fn push_item(&self, item: T) -> Result<()> {
        let mut item = item;
        loop {
            match self.push_within(item, QUEUE_WAIT_SLICE)? {
                None => return Ok(()),
                Some(returned) => item = returned,
            }
        }
    }

    fn pop_item(&self, timeout: Duration) -> Result<Option<QueueMessage<T>>> {
        if let Ok(item) = self.receiver.try_recv() {
            return Ok(self.delivered(item));
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.is_ended() && self.receiver.is_empty() {
                return Ok(Some(QueueMessage::EndOfInput));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let slice = QUEUE_WAIT_SLICE.min(deadline - now);
            match self.receiver.recv_timeout(slice) {
                Ok(item) => return Ok(self.delivered(item)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(Some(QueueMessage::EndOfInput)),
            }
        }
    }

    fn signal_end_of_input(&self) -> Result<()> {
        if !self.end_of_input.swap(true, Ordering::SeqCst) {
            debug!(
                "End of input signalled on queue {} after {} items",
                self.name,
                self.pushed_count()
            );
        }
        Ok(())
    }
}

/// The three queues of one run, shared by reference with every component
#[derive(Clone)]
pub struct ExtractionQueues {
    pub collection: Arc<dyn ItemQueue<WorkItemDescriptor>>,
    pub storage: Arc<dyn ItemQueue<ExtractedEvent>>,
    pub errors: Arc<dyn ItemQueue<ExtractionError>>,
}

impl ExtractionQueues {
    /// Unbounded in-process queues for single-process mode
    pub fn in_memory() -> (Self, InMemoryQueues) {
        let queues = InMemoryQueues {
            collection: Arc::new(WorkQueue::unbounded(COLLECTION_QUEUE)),
            storage: Arc::new(WorkQueue::unbounded(STORAGE_QUEUE)),
            errors: Arc::new(WorkQueue::unbounded(ERROR_QUEUE)),
        };
        (queues.handles(), queues)
    }

    /// Queues hosted by a broker in another process
    pub fn remote(port: u16) -> Self {
        ExtractionQueues {
            collection: Arc::new(RemoteQueue::new(COLLECTION_QUEUE, port)),
            storage: Arc::new(RemoteQueue::new(STORAGE_QUEUE, port)),
            errors: Arc::new(RemoteQueue::new(ERROR_QUEUE, port)),
        }
    }
}

/// Concrete in-process queues, kept to inspect counters
#[derive(Clone)]
pub struct InMemoryQueues {
    pub collection: Arc<WorkQueue<WorkItemDescriptor>>,
    pub storage: Arc<WorkQueue<ExtractedEvent>>,
    pub errors: Arc<WorkQueue<ExtractionError>>,
}

impl InMemoryQueues {
    pub fn bounded(capacity: usize) -> Self {
        InMemoryQueues {
            collection: Arc::new(WorkQueue::bounded(COLLECTION_QUEUE, capacity)),
            storage: Arc::new(WorkQueue::bounded(STORAGE_QUEUE, capacity)),
            errors: Arc::new(WorkQueue::bounded(ERROR_QUEUE, capacity)),
        }
    }

    pub fn handles(&self) -> ExtractionQueues {
        ExtractionQueues {
            collection: self.collection.clone(),
            storage: self.storage.clone(),
            errors: self.errors.clone(),
        }
    }
}
