//! # timeline_extractor
//!
//! A multi-process forensic timeline extraction engine written in Rust.
//!
//! ## Overview
//!
//! timeline_extractor resolves a source (a directory, a single file, a
//! storage media image or a raw device) to exactly one readable location,
//! enumerates everything inside it and runs a set of parsers over every
//! item. The resulting events and extraction errors are serialized into a
//! single storage file.
//!
//! ## Features
//!
//! - **Source resolution**: partition and Volume Shadow Snapshot selection,
//!   interactive when the command line does not decide
//! - **Multi-process extraction**: a collector process, a pool of worker
//!   processes and a storage process connected by queues
//! - **Process monitoring**: a foreman polling worker status over RPC and
//!   killing hanging or crashed workers
//! - **Abort protocol**: an interrupt drains the queues, terminates the
//!   children and leaves a well-formed storage file
//! - **Single-process mode**: the same pipeline inside one process, for
//!   debugging
//!
//! ## Usage
//!
//! ```no_run
//! use timeline_extractor::config::ExtractionConfig;
//! use timeline_extractor::engine::ExtractionFrontend;
//! use std::path::PathBuf;
//!
//! # fn main() -> timeline_extractor::error::Result<()> {
//! let config = ExtractionConfig {
//!     source: PathBuf::from("/cases/disk.raw"),
//!     output: PathBuf::from("/cases/disk.jsonl"),
//!     partition_number: Some(2),
//!     ..ExtractionConfig::default()
//! };
//! config.validate()?;
//!
//! let mut frontend = ExtractionFrontend::new(config);
//! let summary = frontend.process_source()?;
//! println!("{} events from {} items", summary.events, summary.items_collected);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`cli`]: Command-line interface definitions and argument parsing
//! - [`config`]: Extraction options, tuning file and store selections
//! - [`resolver`]: Source scanning with partition and VSS selection
//! - [`queue`]: Work queues and the broker serving them to child processes
//! - [`rpc`]: Line-delimited JSON RPC between the processes
//! - [`collector`]: Enumeration of the resolved source
//! - [`parsers`]: Parser plugins run over every item
//! - [`worker`]: Extraction worker loop
//! - [`storage`]: Storage file writer
//! - [`foreman`]: Worker monitoring
//! - [`process`]: Child process management
//! - [`engine`]: Orchestration and the abort protocol
//!
//! ## Safety
//!
//! `unsafe` code is limited to the platform calls terminating processes
//! and process groups in [`process`].

/// Command-line interface definitions and argument parsing
pub mod cli;

/// Extraction configuration, tuning file and selections
pub mod config;

/// Application constants and tuning defaults
pub mod constants;

/// Error types shared by every component
pub mod error;

/// Core data models passed between the processes
pub mod models;

/// Source scanning and volume selection
pub mod resolver;

/// Work queues and their broker
pub mod queue;

/// Remote procedure calls between the orchestrator and its children
pub mod rpc;

/// Source enumeration
pub mod collector;

/// Parser plugins
pub mod parsers;

/// Event filter expressions
pub mod filter;

/// Extraction worker
pub mod worker;

/// Storage file writer and reader
pub mod storage;

/// Worker monitoring
pub mod foreman;

/// Child process launch and termination
pub mod process;

/// Run orchestration
pub mod engine;

/// Utility functions for hashing, timestamps and the run summary
pub mod utils;

/// Test utilities and helpers
#[cfg(test)]
pub mod test_utils;
