use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command-line arguments for the timeline extractor.
///
/// The user-facing options select the source, how it is disambiguated
/// (partition, offset, shadow copies), how extraction is parallelized and
/// where the storage file is written. The hidden `child` subcommand is
/// used by the orchestrator to start collector, worker and storage
/// processes from the same binary.
#[derive(Parser, Debug)]
#[clap(name = "timeline-extractor", about = "Multi-process forensic timeline extractor")]
pub struct Args {
    /// Source to process: a storage media image, device, directory or file
    pub source: Option<PathBuf>,

    /// Storage file the extracted events are written to
    #[clap(short, long, default_value = "timeline.jsonl")]
    pub output: PathBuf,

    /// Partition number to process, the first partition is 1
    #[clap(long = "partition")]
    pub partition_number: Option<u32>,

    /// Offset of the partition to process, in sectors
    #[clap(long = "offset")]
    pub image_offset: Option<u64>,

    /// Bytes per sector used to convert --offset
    #[clap(long = "sector-size", default_value = "512")]
    pub bytes_per_sector: u64,

    /// Offset of the partition to process, in bytes (takes precedence over --offset)
    #[clap(long = "offset-bytes")]
    pub image_offset_bytes: Option<u64>,

    /// Shadow copy stores to process, e.g. "1,3..5"
    #[clap(long = "vss-stores")]
    pub vss_stores: Option<String>,

    /// Do not process volume shadow copies
    #[clap(long = "no-vss")]
    pub no_vss: bool,

    /// Number of extraction workers (0 determines the number from the CPU count)
    #[clap(long, default_value = "0")]
    pub workers: usize,

    /// Run collection, extraction and storage in a single process
    #[clap(long = "single-process")]
    pub single_process: bool,

    /// Enable debug mode: failing parsers drop into a post-mortem report
    #[clap(short, long)]
    pub debug: bool,

    /// Event filter expression, e.g. "parser == filestat and timestamp > 2020-01-01"
    #[clap(short, long)]
    pub filter: Option<String>,

    /// File with path filters restricting what is collected
    #[clap(long = "file-filter")]
    pub file_filter: Option<PathBuf>,

    /// Timezone of the source: UTC or a fixed offset such as +02:00
    #[clap(short = 'z', long, default_value = "UTC")]
    pub timezone: String,

    /// Parsers to enable, comma-separated; prefix a name with '-' to exclude it
    #[clap(long, default_value = "")]
    pub parsers: String,

    /// Storage serialization buffer size in bytes, or MiB with an 'm' suffix
    #[clap(long = "buffer-size", default_value = "8m")]
    pub buffer_size: String,

    /// Mount point of the source, stripped from displayed paths
    #[clap(long = "mount-path")]
    pub mount_path: Option<PathBuf>,

    /// Disable the foreman that monitors worker health
    #[clap(long = "no-foreman")]
    pub no_foreman: bool,

    /// Report worker memory usage in status updates
    #[clap(long = "show-memory")]
    pub show_memory: bool,

    /// Path to a YAML tuning file with monitoring intervals and queue sizes
    #[clap(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Verbose logging
    #[clap(short, long)]
    pub verbose: bool,

    /// Subcommands
    #[clap(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run as a child process of an extraction run; the task is read from stdin
    #[clap(hide = true)]
    Child,
}
