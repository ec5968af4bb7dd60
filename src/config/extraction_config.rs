use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::cli::Args;
use crate::config::selection::StoreSelection;
use crate::config::tuning::{load_or_create_tuning, TuningConfig};
use crate::constants::{
    DEFAULT_BUFFER_SIZE, DEFAULT_BYTES_PER_SECTOR, MAXIMUM_WORKERS, MINIMUM_WORKERS,
    RAW_DEVICE_PREFIX, RESERVED_PROCESSES,
};
use crate::error::{EngineError, Result};
use crate::filter::EventFilter;
use crate::parsers::ParserRegistry;

/// Complete configuration of one extraction run.
///
/// Every option has its default declared once in [`Default`] and the whole
/// structure is checked by [`validate`](Self::validate) before anything is
/// spawned. The configuration is serializable so child processes receive
/// exactly what the orchestrator validated.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ExtractionConfig {
    pub source: PathBuf,
    pub output: PathBuf,
    pub partition_number: Option<u32>,
    /// Partition offset in sectors
    pub image_offset: Option<u64>,
    pub bytes_per_sector: u64,
    pub image_offset_bytes: Option<u64>,
    pub process_vss: bool,
    pub vss_stores: Option<StoreSelection>,
    /// Requested worker count, 0 derives it from the CPU count
    pub workers: usize,
    pub single_process: bool,
    pub debug: bool,
    pub filter: Option<String>,
    pub file_filter: Option<PathBuf>,
    pub timezone: String,
    pub parsers: String,
    pub buffer_size: usize,
    pub mount_path: Option<PathBuf>,
    pub run_foreman: bool,
    pub show_memory: bool,
    pub preferred_encoding: String,
    pub tuning: TuningConfig,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        ExtractionConfig {
            source: PathBuf::new(),
            output: PathBuf::from("timeline.jsonl"),
            partition_number: None,
            image_offset: None,
            bytes_per_sector: DEFAULT_BYTES_PER_SECTOR,
            image_offset_bytes: None,
            process_vss: true,
            vss_stores: None,
            workers: 0,
            single_process: false,
            debug: false,
            filter: None,
            file_filter: None,
            timezone: "UTC".to_string(),
            parsers: String::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            mount_path: None,
            run_foreman: true,
            show_memory: false,
            preferred_encoding: "utf-8".to_string(),
            tuning: TuningConfig::default(),
        }
    }
}

impl ExtractionConfig {
    /// Builds and validates the configuration from command-line arguments
    pub fn from_args(args: &Args) -> Result<Self> {
        let source = args
            .source
            .as_ref()
            .ok_or_else(|| EngineError::configuration("Missing source path."))?;

        let vss_stores = match (&args.vss_stores, args.no_vss) {
            (Some(expression), false) => Some(StoreSelection::parse(expression)?),
            _ => None,
        };

        let config = ExtractionConfig {
            source: absolute_path(source)?,
            output: args.output.clone(),
            partition_number: args.partition_number,
            image_offset: args.image_offset,
            bytes_per_sector: args.bytes_per_sector,
            image_offset_bytes: args.image_offset_bytes,
            process_vss: !args.no_vss,
            vss_stores,
            workers: args.workers,
            single_process: args.single_process,
            debug: args.debug,
            filter: args.filter.clone(),
            file_filter: args.file_filter.clone(),
            timezone: args.timezone.clone(),
            parsers: args.parsers.clone(),
            buffer_size: parse_buffer_size(&args.buffer_size)?,
            mount_path: args.mount_path.clone(),
            run_foreman: !args.no_foreman,
            show_memory: args.show_memory,
            tuning: load_or_create_tuning(args.config.as_deref())?,
            ..ExtractionConfig::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks every option that can be checked without touching the source
    pub fn validate(&self) -> Result<()> {
        if self.source.as_os_str().is_empty() {
            return Err(EngineError::configuration("Missing source path."));
        }
        if self.bytes_per_sector == 0 {
            return Err(EngineError::configuration("Bytes per sector must be greater than zero."));
        }
        if self.buffer_size == 0 {
            return Err(EngineError::configuration("Buffer size must be greater than zero."));
        }
        if let Some(expression) = &self.filter {
            EventFilter::parse(expression)?;
        }
        if let Some(file_filter) = &self.file_filter {
            if !file_filter.is_file() {
                return Err(EngineError::configuration(format!(
                    "No such collection filter file: {}.",
                    file_filter.display()
                )));
            }
        }
        validate_timezone(&self.timezone)?;
        ParserRegistry::from_filter(&self.parsers)?;
        self.tuning.validate()?;
        check_storage_file(&self.output)
    }

    /// Preferred partition byte offset, `--offset-bytes` taking precedence
    pub fn partition_offset(&self) -> Option<u64> {
        if self.image_offset_bytes.is_some() {
            return self.image_offset_bytes;
        }
        match self.image_offset {
            Some(sectors) if sectors > 0 => sectors.checked_mul(self.bytes_per_sector),
            _ => None,
        }
    }
}

/// Effective pool size for a requested worker count.
///
/// A request below 1 derives the count from the CPUs, reserving room for
/// the collector, the storage sink and the orchestrator.
pub fn resolve_worker_count(requested: usize, cpu_count: usize) -> usize {
    if requested >= 1 {
        return requested;
    }
    cpu_count
        .saturating_sub(RESERVED_PROCESSES)
        .clamp(MINIMUM_WORKERS, MAXIMUM_WORKERS)
}

/// Parses a buffer size given in bytes or in MiB with an `m` suffix
pub fn parse_buffer_size(value: &str) -> Result<usize> {
    let value = value.trim();
    let invalid = || EngineError::configuration(format!("Invalid buffer size: {}.", value));

    if !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()) {
        return value.parse::<usize>().map_err(|_| invalid());
    }

    let lowered = value.to_lowercase();
    match lowered.strip_suffix('m') {
        Some(size) if !size.is_empty() && size.chars().all(|c| c.is_ascii_digit()) => size
            .parse::<usize>()
            .ok()
            .and_then(|size| size.checked_mul(1024 * 1024))
            .ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

/// Accepts "UTC" or a fixed offset such as "+02:00" or "-0530"
pub fn validate_timezone(timezone: &str) -> Result<()> {
    if timezone.eq_ignore_ascii_case("utc") {
        return Ok(());
    }

    let invalid = || EngineError::configuration(format!("Unsupported timezone: {}.", timezone));
    let rest = timezone
        .strip_prefix('+')
        .or_else(|| timezone.strip_prefix('-'))
        .ok_or_else(invalid)?;
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let hours: u32 = digits[..2].parse().map_err(|_| invalid())?;
    let minutes: u32 = digits[2..].parse().map_err(|_| invalid())?;
    if hours > 14 || minutes >= 60 {
        return Err(invalid());
    }
    Ok(())
}

/// Checks that the storage file can be created or appended to
pub fn check_storage_file(storage_file_path: &Path) -> Result<()> {
    if storage_file_path.exists() {
        if !storage_file_path.is_file() {
            return Err(EngineError::configuration(format!(
                "Storage file: {} already exists and is not a file.",
                storage_file_path.display()
            )));
        }
        warn!("Appending to an already existing storage file.");
    }

    let dirname = match storage_file_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !is_writable_directory(&dirname) {
        return Err(EngineError::configuration(format!(
            "Unable to write to storage file: {}",
            storage_file_path.display()
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn is_writable_directory(path: &Path) -> bool {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    if !path.is_dir() {
        return false;
    }
    match CString::new(path.as_os_str().as_bytes()) {
        // SAFETY: access only reads the NUL-terminated path
        Ok(c_path) => unsafe { libc::access(c_path.as_ptr(), libc::W_OK) == 0 },
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_writable_directory(path: &Path) -> bool {
    fs::metadata(path)
        .map(|metadata| metadata.is_dir() && !metadata.permissions().readonly())
        .unwrap_or(false)
}

fn absolute_path(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() || path.to_string_lossy().starts_with(RAW_DEVICE_PREFIX) {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

/// Reads a path filter file, skipping blank lines and comments
pub fn read_filter_lines(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}
