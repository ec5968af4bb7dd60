//! Utility functions shared by the parsers and the orchestrator.
//!
//! ## Components
//!
//! - **Hashing**: SHA-256 calculation for file integrity
//! - **Timestamps**: conversions between Unix, FILETIME and ISO-8601 times
//! - **Summary**: run report written next to the storage file
//!
//! ### Generating File Hashes
//!
//! ```no_run
//! use timeline_extractor::utils::hash::calculate_sha256;
//! use std::path::Path;
//!
//! # fn example() -> std::io::Result<()> {
//! let file_path = Path::new("/evidence/suspicious.exe");
//!
//! match calculate_sha256(file_path, 100)? {
//!     Some(hash) => println!("SHA-256: {}", hash),
//!     None => println!("File exceeds size limit"),
//! }
//! # Ok(())
//! # }
//! ```

/// Run summary generation and reporting
pub mod summary;

/// Cryptographic hash calculation utilities
pub mod hash;

/// Timestamp conversions
pub mod timestamps;
