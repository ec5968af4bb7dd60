use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{InMemoryQueues, ItemQueue, QueueMessage, WorkQueue};
use crate::constants::REMOTE_PUSH_WAIT_MS;
use crate::error::{EngineError, Result};
use crate::rpc::{RpcProxyClient, RpcProxyServer};

pub const COLLECTION_QUEUE: &str = "collection";
pub const STORAGE_QUEUE: &str = "storage";
pub const ERROR_QUEUE: &str = "errors";

/// Wire form of a remote pop
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "kind", content = "item", rename_all = "snake_case")]
enum PopReply<T> {
    Item(T),
    Empty,
    EndOfInput,
}

/// Wire form of a remote push; a full queue asks the caller to resend
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
enum PushReply {
    Accepted,
    Full,
}

#[derive(Serialize, Deserialize, Debug)]
struct PopRequest {
    timeout_ms: u64,
}

/// Hosts the run's queues in the orchestrator and serves them over RPC.
///
/// Each queue exposes `<name>.push`, `<name>.pop` and `<name>.end`.
pub struct QueueBroker {
    queues: InMemoryQueues,
    server: Arc<RpcProxyServer>,
    thread: Option<JoinHandle<()>>,
}

impl QueueBroker {
    /// Binds the broker proxy and starts serving the given queues
    pub fn start(queues: InMemoryQueues) -> Result<Self> {
        let server = Arc::new(RpcProxyServer::open()?);
        register_queue(&server, COLLECTION_QUEUE, queues.collection.clone())?;
        register_queue(&server, STORAGE_QUEUE, queues.storage.clone())?;
        register_queue(&server, ERROR_QUEUE, queues.errors.clone())?;
        let thread = server.spawn("queue_broker")?;

        info!("Queue broker listening on port {}", server.listening_port());
        Ok(QueueBroker {
            queues,
            server,
            thread: Some(thread),
        })
    }

    pub fn port(&self) -> u16 {
        self.server.listening_port()
    }

    pub fn queues(&self) -> &InMemoryQueues {
        &self.queues
    }

    /// Stops serving; pending remote calls fail
    pub fn shutdown(&mut self) {
        self.server.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for QueueBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn register_queue<T>(server: &RpcProxyServer, name: &str, queue: Arc<WorkQueue<T>>) -> Result<()>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    let push_queue = queue.clone();
    server.register_function(&format!("{}.push", name), move |args| {
        let item: T = serde_json::from_value(args).map_err(|e| e.to_string())?;
        let reply = match push_queue
            .push_within(item, Duration::from_millis(REMOTE_PUSH_WAIT_MS))
            .map_err(|e| e.to_string())?
        {
            None => PushReply::Accepted,
            Some(_) => PushReply::Full,
        };
        serde_json::to_value(reply).map_err(|e| e.to_string())
    })?;

    let pop_queue = queue.clone();
    server.register_function(&format!("{}.pop", name), move |args| {
        let request: PopRequest = serde_json::from_value(args).map_err(|e| e.to_string())?;
        let reply = match pop_queue
            .pop_item(Duration::from_millis(request.timeout_ms))
            .map_err(|e| e.to_string())?
        {
            Some(QueueMessage::Item(item)) => PopReply::Item(item),
            Some(QueueMessage::EndOfInput) => PopReply::EndOfInput,
            None => PopReply::Empty,
        };
        serde_json::to_value(reply).map_err(|e| e.to_string())
    })?;

    server.register_function(&format!("{}.end", name), move |_| {
        queue.signal_end_of_input().map_err(|e| e.to_string())?;
        Ok(Value::Null)
    })
}

/// Queue hosted by a [`QueueBroker`] in another process
pub struct RemoteQueue<T> {
    name: String,
    client: RpcProxyClient,
    _item: PhantomData<fn() -> T>,
}

impl<T> RemoteQueue<T> {
    pub fn new(name: &str, port: u16) -> Self {
        RemoteQueue {
            name: name.to_string(),
            client: RpcProxyClient::new(port),
            _item: PhantomData,
        }
    }

    fn function(&self, operation: &str) -> String {
        format!("{}.{}", self.name, operation)
    }
}

impl<T> ItemQueue<T> for RemoteQueue<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    fn push_item(&self, item: T) -> Result<()> {
        let function = self.function("push");
        let item = serde_json::to_value(item)?;
        loop {
            match self.client.call(&function, item.clone()) {
                Ok(reply) => match serde_json::from_value::<PushReply>(reply)? {
                    PushReply::Accepted => return Ok(()),
                    PushReply::Full => debug!("Queue {} is full, resending", self.name),
                },
                Err(EngineError::Rpc { reason, .. }) if reason.contains("is closed") => {
                    return Err(EngineError::QueueClosed(self.name.clone()))
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn pop_item(&self, timeout: Duration) -> Result<Option<QueueMessage<T>>> {
        let args = json!({ "timeout_ms": timeout.as_millis() as u64 });
        let value = self.client.call(&self.function("pop"), args)?;
        Ok(match serde_json::from_value::<PopReply<T>>(value)? {
            PopReply::Item(item) => Some(QueueMessage::Item(item)),
            PopReply::EndOfInput => Some(QueueMessage::EndOfInput),
            PopReply::Empty => None,
        })
    }

    fn signal_end_of_input(&self) -> Result<()> {
        self.client.call(&self.function("end"), Value::Null)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PathSpec, WorkItemDescriptor};
    use std::thread;

    fn descriptor(name: &str) -> WorkItemDescriptor {
        WorkItemDescriptor {
            path_spec: PathSpec::os(format!("/case/{}", name)),
            display_name: format!("OS:/case/{}", name),
            vss_store: None,
            is_directory: false,
        }
    }

    #[test]
    fn test_remote_queue_round_trip() {
        let broker = QueueBroker::start(InMemoryQueues::bounded(16)).unwrap();
        let remote: RemoteQueue<WorkItemDescriptor> = RemoteQueue::new(COLLECTION_QUEUE, broker.port());

        remote.push_item(descriptor("a.txt")).unwrap();
        remote.push_item(descriptor("b.txt")).unwrap();
        remote.signal_end_of_input().unwrap();

        let timeout = Duration::from_millis(200);
        assert_eq!(remote.pop_item(timeout).unwrap(), Some(QueueMessage::Item(descriptor("a.txt"))));
        assert_eq!(remote.pop_item(timeout).unwrap(), Some(QueueMessage::Item(descriptor("b.txt"))));
        assert_eq!(remote.pop_item(timeout).unwrap(), Some(QueueMessage::EndOfInput));
        assert_eq!(broker.queues().collection.pushed_count(), 2);
    }

    #[test]
    fn test_remote_push_after_end_is_queue_closed() {
        let broker = QueueBroker::start(InMemoryQueues::bounded(4)).unwrap();
        broker.queues().storage.signal_end_of_input().unwrap();

        let remote: RemoteQueue<crate::models::ExtractedEvent> = RemoteQueue::new(STORAGE_QUEUE, broker.port());
        let event = crate::models::ExtractedEvent {
            timestamp: 0,
            timestamp_desc: "Modification Time".into(),
            data_type: "fs:stat".into(),
            parser_chain: "filestat".into(),
            parser_name: "filestat".into(),
            display_name: "OS:/x".into(),
            vss_store: None,
            attributes: Default::default(),
        };
        assert!(matches!(remote.push_item(event), Err(EngineError::QueueClosed(_))));
    }

    #[test]
    fn test_remote_push_to_full_queue_waits_for_space() {
        let broker = QueueBroker::start(InMemoryQueues::bounded(1)).unwrap();
        let remote: RemoteQueue<WorkItemDescriptor> = RemoteQueue::new(COLLECTION_QUEUE, broker.port());
        remote.push_item(descriptor("first.txt")).unwrap();

        // Frees the slot only after the broker gave up waiting once
        let local = broker.queues().collection.clone();
        let consumer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(REMOTE_PUSH_WAIT_MS + 300));
            local.pop_item(Duration::from_secs(1))
        });

        remote.push_item(descriptor("second.txt")).unwrap();
        let first = consumer.join().unwrap().unwrap();
        assert_eq!(first, Some(QueueMessage::Item(descriptor("first.txt"))));

        let queue = &broker.queues().collection;
        assert_eq!(queue.pushed_count(), 2);
        assert_eq!(
            queue.pop_item(Duration::from_millis(200)).unwrap(),
            Some(QueueMessage::Item(descriptor("second.txt")))
        );
    }

    #[test]
    fn test_remote_pop_empty_then_item_from_local_producer() {
        let broker = QueueBroker::start(InMemoryQueues::bounded(4)).unwrap();
        let remote: RemoteQueue<WorkItemDescriptor> = RemoteQueue::new(COLLECTION_QUEUE, broker.port());
        assert_eq!(remote.pop_item(Duration::from_millis(50)).unwrap(), None);

        let local = broker.queues().collection.clone();
        let producer = thread::spawn(move || local.push_item(descriptor("late.txt")));
        let message = remote.pop_item(Duration::from_secs(2)).unwrap();
        producer.join().unwrap().unwrap();
        assert_eq!(message, Some(QueueMessage::Item(descriptor("late.txt"))));
    }
}
