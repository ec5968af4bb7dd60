// Re-export all items from the submodules
mod extraction_config;
mod selection;
mod tuning;

// Re-export the run configuration
pub use extraction_config::{
    ExtractionConfig,
    check_storage_file,
    parse_buffer_size,
    read_filter_lines,
    resolve_worker_count,
    validate_timezone,
};

// Re-export the selection expression parser
pub use selection::StoreSelection;

// Re-export tuning
pub use tuning::{
    MonitoringConfig,
    TuningConfig,
    load_or_create_tuning,
};
