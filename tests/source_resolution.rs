//! Integration tests resolving raw images to a single volume.

mod common;

use std::io::Cursor;

use anyhow::Result;
use tempfile::TempDir;

use timeline_extractor::config::ExtractionConfig;
use timeline_extractor::engine::ExtractionFrontend;
use timeline_extractor::error::EngineError;
use timeline_extractor::models::SourceType;
use timeline_extractor::resolver::{OsSourceScanner, PathResolver, ReaderPrompt, ResolverOptions};
use timeline_extractor::storage::read_storage_file;

use common::write_mbr_image;

fn resolve(path: &std::path::Path, options: &ResolverOptions, input: &str) -> (Result<u64, EngineError>, String) {
    let resolver = PathResolver::new(Box::new(OsSourceScanner::new()));
    let mut prompt = ReaderPrompt::new(Cursor::new(input.to_string()), Vec::new());
    let result = resolver
        .scan_source(path, options, &mut prompt)
        .and_then(|context| context.resolved())
        .map(|source| source.partition_offset.unwrap_or(0));
    (result, String::from_utf8_lossy(prompt.writer()).to_string())
}

/// Test that two partitions are offered for selection
#[test]
fn test_prompt_selects_partition() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let image = temp_dir.path().join("disk.raw");
    write_mbr_image(&image, &[(1, 8), (9, 8)])?;

    let (result, output) = resolve(&image, &ResolverOptions::default(), "p2\n");
    assert_eq!(result?, 9 * 512);
    assert!(output.contains("The following partitions were found"));
    assert!(output.contains("p1"));
    Ok(())
}

/// Test that a partition number on the command line avoids the prompt
#[test]
fn test_partition_number_selects_without_prompt() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let image = temp_dir.path().join("disk.raw");
    write_mbr_image(&image, &[(1, 8), (9, 8)])?;

    let options = ResolverOptions {
        partition_number: Some(1),
        ..ResolverOptions::default()
    };
    let (result, output) = resolve(&image, &options, "");
    assert_eq!(result?, 512);
    assert!(output.is_empty());
    Ok(())
}

/// Test that the prompt running out of answers aborts the scan
#[test]
fn test_unanswered_prompt_aborts() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let image = temp_dir.path().join("disk.raw");
    write_mbr_image(&image, &[(1, 8), (9, 8)])?;

    let (result, _) = resolve(&image, &ResolverOptions::default(), "");
    assert!(matches!(result, Err(EngineError::SourceScan(_))));
    Ok(())
}

/// Test an image run records the partition offset in the collection information
#[test]
fn test_image_run_records_partition() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let image = temp_dir.path().join("disk.raw");
    write_mbr_image(&image, &[(1, 8), (9, 8)])?;
    let output = temp_dir.path().join("timeline.jsonl");

    let config = ExtractionConfig {
        source: image,
        output: output.clone(),
        partition_number: Some(2),
        single_process: true,
        ..ExtractionConfig::default()
    };
    let mut frontend = ExtractionFrontend::new(config);
    let summary = frontend.process_source()?;
    assert_eq!(summary.items_collected, 1);

    let contents = read_storage_file(&output)?;
    let information = &contents.sessions[0];
    assert_eq!(information.get_str("method"), Some("imaged processed"));
    assert_eq!(information.get("image_offset"), Some(&serde_json::Value::from(9u64 * 512)));
    assert!(contents.is_complete());
    Ok(())
}

/// Test that a plain directory resolves without selection
#[test]
fn test_directory_needs_no_selection() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let resolver = PathResolver::new(Box::new(OsSourceScanner::new()));
    let mut prompt = ReaderPrompt::new(Cursor::new(String::new()), Vec::new());
    let source = resolver
        .scan_source(temp_dir.path(), &ResolverOptions::default(), &mut prompt)?
        .resolved()?;

    assert_eq!(source.source_type, SourceType::Directory);
    assert_eq!(source.partition_offset, None);
    Ok(())
}
