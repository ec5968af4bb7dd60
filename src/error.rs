//! Error taxonomy of the extraction engine.
//!
//! Configuration and source-resolution errors abort a run before any
//! process is spawned. Worker exits and proxy start failures are logged and
//! contained by the orchestrator. Per-item parser failures are not errors at
//! this level at all, they travel through the error queue as
//! [`crate::models::ExtractionError`] records.

use thiserror::Error;

/// Errors raised by the extraction engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Bad or missing options, reported before any process starts
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The source could not be resolved to a single readable node
    #[error("Source scan failed: {0}")]
    SourceScan(String),

    /// The RPC proxy could not bind or start serving
    #[error("RPC proxy failed to start: {0}")]
    ProxyStart(String),

    /// A remote call failed or returned a fault
    #[error("RPC call {function} failed: {reason}")]
    Rpc { function: String, reason: String },

    /// A push was attempted after the queue received its end-of-input signal
    #[error("Queue {0} is closed")]
    QueueClosed(String),

    /// A worker process exited with a non-zero or missing exit code
    #[error("Worker {name} [{pid}] exited with status {status}")]
    WorkerExit { name: String, pid: u32, status: String },

    /// A child process could not be spawned or did not complete its handshake
    #[error("Process {name} failed: {reason}")]
    Process { name: String, reason: String },

    /// The run was interrupted and the abort protocol ran
    #[error("Extraction aborted")]
    Aborted,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl EngineError {
    /// Shorthand for a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        EngineError::Configuration(message.into())
    }

    /// Shorthand for a source scan error
    pub fn source_scan(message: impl Into<String>) -> Self {
        EngineError::SourceScan(message.into())
    }

    /// Shorthand for a failed remote call
    pub fn rpc(function: impl Into<String>, reason: impl ToString) -> Self {
        EngineError::Rpc {
            function: function.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for a child process failure
    pub fn process(name: impl Into<String>, reason: impl ToString) -> Self {
        EngineError::Process {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error must abort the run before extraction starts
    pub fn is_fatal_before_extraction(&self) -> bool {
        matches!(self, EngineError::Configuration(_) | EngineError::SourceScan(_))
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
