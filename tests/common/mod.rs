//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;

use timeline_extractor::config::{ExtractionConfig, TuningConfig};
use timeline_extractor::engine::{ExtractionFrontend, RunJournal};
use timeline_extractor::process::ProcessLauncher;

/// Bodyfile with two valid lines and one malformed line
pub const BODYFILE: &[u8] = b"0|/etc/passwd|1234|-rw-r--r--|0|0|845|1600000000|1600000100|1600000200|0\n\
0|/etc/shadow|1235|-rw-------|0|42|512|1600001000|1600001000|1600001000|1600001000\n\
not a bodyfile line\n";

/// Source tree with five files in three directories
pub fn source_tree() -> Result<TempDir> {
    let temp_dir = TempDir::new()?;
    let base_path = temp_dir.path();

    fs::create_dir_all(base_path.join("dir1/subdir1"))?;
    fs::create_dir_all(base_path.join("dir2"))?;

    fs::write(base_path.join("file1.txt"), b"Test content 1")?;
    fs::write(base_path.join("file2.log"), b"Test log content")?;
    fs::write(base_path.join("dir1/file3.txt"), b"Test content 3")?;
    fs::write(base_path.join("dir1/subdir1/file4.txt"), b"Test content 4")?;
    fs::write(base_path.join("dir2/timeline.body"), BODYFILE)?;

    Ok(temp_dir)
}

/// Source tree with `files` small files spread over a few directories
pub fn large_source_tree(files: usize) -> Result<TempDir> {
    let temp_dir = TempDir::new()?;
    for index in 0..files {
        let directory = temp_dir.path().join(format!("dir{}", index % 7));
        fs::create_dir_all(&directory)?;
        fs::write(directory.join(format!("file{}.txt", index)), format!("content {}", index))?;
    }
    Ok(temp_dir)
}

/// MBR image with `(first_lba, sectors)` NTFS partitions
pub fn write_mbr_image(path: &Path, partitions: &[(u32, u32)]) -> Result<()> {
    let end = partitions
        .iter()
        .map(|(lba, sectors)| (*lba as usize + *sectors as usize) * 512)
        .max()
        .unwrap_or(512)
        .max(2048);
    let mut image = vec![0u8; end];
    image[510] = 0x55;
    image[511] = 0xaa;

    for (index, (lba, sectors)) in partitions.iter().enumerate() {
        let entry = 446 + index * 16;
        image[entry + 4] = 0x07;
        image[entry + 8..entry + 12].copy_from_slice(&lba.to_le_bytes());
        image[entry + 12..entry + 16].copy_from_slice(&sectors.to_le_bytes());

        let start = *lba as usize * 512;
        image[start + 3..start + 11].copy_from_slice(b"NTFS    ");
        image[start + 510] = 0x55;
        image[start + 511] = 0xaa;
    }
    fs::write(path, image)?;
    Ok(())
}

/// Multi-process configuration with short monitoring intervals
pub fn multi_process_config(source: &Path, output: &Path, workers: usize) -> ExtractionConfig {
    let mut tuning = TuningConfig::default();
    tuning.monitoring.collector_join_interval_ms = 200;
    tuning.monitoring.worker_join_interval_ms = 200;
    tuning.monitoring.heartbeat_interval_ms = 100;
    tuning.monitoring.abort_storage_join_timeout_ms = 10_000;
    tuning.hard_exit_on_abort = false;

    ExtractionConfig {
        source: source.to_path_buf(),
        output: output.to_path_buf(),
        workers,
        tuning,
        ..ExtractionConfig::default()
    }
}

/// Launcher starting children from the binary under test
pub fn launcher() -> ProcessLauncher {
    ProcessLauncher::new(env!("CARGO_BIN_EXE_timeline_extractor"))
}

/// Frontend wired to the binary under test and a fresh journal
pub fn frontend(config: ExtractionConfig) -> (ExtractionFrontend, Arc<RunJournal>) {
    let journal = Arc::new(RunJournal::new());
    let frontend = ExtractionFrontend::new(config)
        .with_launcher(launcher())
        .with_observer(journal.clone());
    (frontend, journal)
}
