//! Lightweight request/response channel between processes.
//!
//! A server binds an ephemeral loopback port, the port number is handed to
//! the other side out-of-band (a constructor argument, a task description
//! or a handshake line) and clients invoke registered functions by name.
//!
//! ## Wire format
//!
//! One JSON document per line in each direction:
//!
//! ```text
//! -> {"function":"status","args":null}
//! <- {"value":{"identifier":"Worker_0", ...}}
//! <- {"fault":"Unknown function: stauts"}
//! ```

mod client;
mod server;

pub use client::RpcProxyClient;
pub use server::{RpcHandler, RpcProxyServer};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operation name plus arguments
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub function: String,
    #[serde(default)]
    pub args: Value,
}

/// Return value or fault of one call
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RpcResponse {
    Value(Value),
    Fault(String),
}

/// Operation exposed by the orchestrator to the collector
pub const SIGNAL_END_OF_COLLECTION: &str = "signal_end_of_collection";

/// Operation exposed by every worker to the foreman
pub const WORKER_STATUS: &str = "status";

/// Operation exposed by every worker to the foreman
pub const SIGNAL_END_OF_PROCESSING: &str = "signal_end_of_processing";
