//! Global constants for the timeline extractor.
//!
//! This module centralizes the worker pool bounds, monitoring intervals
//! and queue sizes so the orchestrator, foreman and child processes agree
//! on them.

// Worker pool sizing
/// Minimum number of extraction workers in multi-process mode
pub const MINIMUM_WORKERS: usize = 2;

/// Maximum number of extraction workers in multi-process mode
pub const MAXIMUM_WORKERS: usize = 15;

/// Processes reserved for the collector, the storage sink and the orchestrator
pub const RESERVED_PROCESSES: usize = 3;

// Monitoring intervals (milliseconds)
/// Join interval while the collector is alive, between foreman status checks
pub const DEFAULT_COLLECTOR_JOIN_INTERVAL_MS: u64 = 10_000;

/// Join interval per monitored worker while draining the pool
pub const DEFAULT_WORKER_JOIN_INTERVAL_MS: u64 = 5_000;

/// Timeout of a single status RPC call
pub const DEFAULT_STATUS_TIMEOUT_MS: u64 = 2_000;

/// A processing worker without progress for this long is considered hung
pub const DEFAULT_HANG_TIMEOUT_MS: u64 = 300_000;

/// Interval at which workers refresh their published status
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;

/// Consecutive failed status polls before a worker is considered unresponsive
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 6;

/// Granularity of polling joins so interrupts are noticed promptly
pub const PROCESS_POLL_INTERVAL_MS: u64 = 50;

/// Timeout of a single queue pop before the consumer re-checks its state
pub const QUEUE_POP_TIMEOUT_MS: u64 = 500;

/// Interval of the RPC accept and read loops between shutdown checks
pub const RPC_POLL_INTERVAL_MS: u64 = 100;

/// Default timeout of an RPC client call
pub const DEFAULT_RPC_CALL_TIMEOUT_MS: u64 = 30_000;

/// How long the abort path waits for the storage process to finish
pub const ABORT_STORAGE_JOIN_TIMEOUT_MS: u64 = 10_000;

// Queues
/// Capacity of each bounded queue in multi-process mode
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_000;

/// How long the broker waits on a full queue before asking the caller to retry.
/// Stays well below the RPC call timeout.
pub const REMOTE_PUSH_WAIT_MS: u64 = 1_000;

// Source scanning
/// Length of the prefix of a shadow copy store identifier, e.g. "vss"
pub const VSS_IDENTIFIER_PREFIX_LENGTH: usize = 3;

/// Default bytes per sector used to convert sector offsets
pub const DEFAULT_BYTES_PER_SECTOR: u64 = 512;

/// Largest span accepted for a single `A..B` selection range
pub const MAX_SELECTION_RANGE: u32 = 10_000;

/// Prefix of raw Windows device paths, which are not checked for existence
pub const RAW_DEVICE_PREFIX: &str = r"\\.\";

// Parsing and storage
/// Maximum depth of nested parser invocations
pub const MAX_PARSER_NESTING_DEPTH: usize = 8;

/// Number of header bytes handed to parsers for signature matching
pub const PARSER_HEADER_SIZE: usize = 4096;

/// Default storage serialization buffer size (8MB)
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Maximum zip member size that is extracted for nested parsing (64MB)
pub const MAX_ZIP_MEMBER_SIZE: u64 = 64 * 1024 * 1024;

/// Maximum file size hashed by the filestat parser (100MB)
pub const DEFAULT_MAX_HASH_SIZE_MB: u64 = 100;

// Process exit codes
/// Exit code used when a run is aborted by an interrupt
pub const EXIT_ABORTED: i32 = 130;

/// Exit code used for configuration and source resolution failures
pub const EXIT_CONFIGURATION_ERROR: i32 = 1;

/// Difference between the FILETIME epoch (1601) and the Unix epoch in 100ns intervals
pub const FILETIME_UNIX_EPOCH_DELTA: u64 = 116_444_736_000_000_000;
