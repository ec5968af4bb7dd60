//! Test utilities for timeline_extractor
//!
//! Temporary source trees, crafted raw images, a scripted source scanner
//! and generators for common records.

#![cfg(test)]

use anyhow::Result;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use tempfile::{NamedTempFile, TempDir};

use crate::constants::FILETIME_UNIX_EPOCH_DELTA;
use crate::error::EngineError;
use crate::models::{PathSpec, SourceType, TypeIndicator};
use crate::resolver::{ScanContext, ScanNode, SourceScanner, Volume, VolumeSystem};

/// Creates a temporary directory that is automatically cleaned up
pub fn create_temp_dir() -> Result<TempDir> {
    Ok(TempDir::new()?)
}

/// Creates a temporary file with the given content
pub fn create_temp_file(content: &[u8]) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(content)?;
    file.flush()?;
    Ok(file)
}

/// Creates a small source tree with text files, logs and one bodyfile
pub fn create_test_file_structure() -> Result<TempDir> {
    let temp_dir = create_temp_dir()?;
    let base_path = temp_dir.path();

    fs::create_dir_all(base_path.join("dir1/subdir1"))?;
    fs::create_dir_all(base_path.join("dir2"))?;

    fs::write(base_path.join("file1.txt"), b"Test content 1")?;
    fs::write(base_path.join("file2.log"), b"Test log content")?;
    fs::write(base_path.join("dir1/file3.txt"), b"Test content 3")?;
    fs::write(base_path.join("dir1/subdir1/file4.txt"), b"Test content 4")?;
    fs::write(base_path.join("dir2/timeline.body"), generators::TEST_BODYFILE)?;

    Ok(temp_dir)
}

/// File systems the raw image builders can fake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawFileSystem {
    Ntfs,
    Fat32,
    Ext,
    BitLocker,
    Unformatted,
}

impl RawFileSystem {
    fn partition_type(&self) -> u8 {
        match self {
            RawFileSystem::Ntfs | RawFileSystem::BitLocker => 0x07,
            RawFileSystem::Fat32 => 0x0c,
            RawFileSystem::Ext | RawFileSystem::Unformatted => 0x83,
        }
    }
}

/// First 2 KiB of a volume carrying the file system signature
pub fn file_system_boot_sector(file_system: RawFileSystem) -> Vec<u8> {
    let mut sector = vec![0u8; 2048];
    match file_system {
        RawFileSystem::Ntfs => sector[3..11].copy_from_slice(b"NTFS    "),
        RawFileSystem::Fat32 => sector[82..90].copy_from_slice(b"FAT32   "),
        RawFileSystem::Ext => sector[1080..1082].copy_from_slice(&[0x53, 0xef]),
        RawFileSystem::BitLocker => sector[3..11].copy_from_slice(b"-FVE-FS-"),
        RawFileSystem::Unformatted => {}
    }
    if file_system != RawFileSystem::Ext && file_system != RawFileSystem::Unformatted {
        sector[510] = 0x55;
        sector[511] = 0xaa;
    }
    sector
}

/// MBR image with `(first_lba, sectors, file_system)` primary partitions
pub fn build_mbr_image(partitions: &[(u32, u32, RawFileSystem)]) -> Vec<u8> {
    let end = partitions
        .iter()
        .map(|(lba, sectors, _)| (*lba as usize + *sectors as usize) * 512)
        .max()
        .unwrap_or(512)
        .max(2048);
    let mut image = vec![0u8; end];
    image[510] = 0x55;
    image[511] = 0xaa;

    for (index, (lba, sectors, file_system)) in partitions.iter().enumerate() {
        let entry = 446 + index * 16;
        image[entry + 4] = file_system.partition_type();
        image[entry + 8..entry + 12].copy_from_slice(&lba.to_le_bytes());
        image[entry + 12..entry + 16].copy_from_slice(&sectors.to_le_bytes());

        let start = *lba as usize * 512;
        let length = (*sectors as usize * 512).min(2048);
        let boot_sector = file_system_boot_sector(*file_system);
        image[start..start + length].copy_from_slice(&boot_sector[..length]);
    }
    image
}

/// Scripted scanner producing a fixed node tree.
///
/// The first scan sets the root node; scanning a partition replaces it with
/// the node registered for its location, if any.
pub struct FakeSourceScanner {
    source_type: SourceType,
    root: ScanNode,
    volume_systems: HashMap<String, VolumeSystem>,
    partition_contents: HashMap<String, ScanNode>,
}

impl FakeSourceScanner {
    const PARTITION_SIZE: u64 = 1_048_576;

    /// Offset of the 1-based partition of [`partitioned`](Self::partitioned)
    pub fn partition_offset(number: u64) -> u64 {
        number * Self::PARTITION_SIZE
    }

    fn image_spec() -> PathSpec {
        PathSpec::os("/fake/image.raw")
    }

    /// Storage media image with `count` partitions each holding a file system
    pub fn partitioned(count: u64) -> Self {
        let image = Self::image_spec();
        let mut volumes = Vec::new();
        let mut sub_nodes = Vec::new();
        let mut partition_contents = HashMap::new();

        for number in 1..=count {
            let identifier = format!("p{}", number);
            let location = format!("/{}", identifier);
            let offset = Self::partition_offset(number);
            let partition = PathSpec::nested(TypeIndicator::Partition, Some(&location), image.clone())
                .with_start_offset(offset);

            volumes.push(Volume::new(identifier, offset, Self::PARTITION_SIZE));
            partition_contents.insert(
                location,
                ScanNode::new(PathSpec::nested(TypeIndicator::FileSystem, Some("/"), partition.clone())),
            );
            sub_nodes.push(ScanNode::new(partition));
        }

        let table = PathSpec::nested(TypeIndicator::PartitionTable, Some("/"), image);
        let mut volume_systems = HashMap::new();
        volume_systems.insert("/".to_string(), VolumeSystem::new(volumes));

        FakeSourceScanner {
            source_type: SourceType::StorageMediaImage,
            root: ScanNode::new(table).with_sub_nodes(sub_nodes),
            volume_systems,
            partition_contents,
        }
    }

    /// Partitions are left unresolved when scanned
    pub fn without_file_systems(mut self) -> Self {
        self.partition_contents.clear();
        self
    }

    /// Image whose current volume has `stores` shadow copies
    pub fn with_vss(stores: u32) -> Self {
        let image = Self::image_spec();
        let container = PathSpec::nested(TypeIndicator::ShadowCopyContainer, Some("/vss"), image);
        let mut sub_nodes = vec![ScanNode::new(PathSpec::nested(
            TypeIndicator::FileSystem,
            Some("/"),
            container.clone(),
        ))];
        let mut volumes = Vec::new();
        for number in 1..=stores {
            let identifier = format!("vss{}", number);
            sub_nodes.push(ScanNode::new(
                PathSpec::nested(TypeIndicator::ShadowCopyStore, Some(&format!("/{}", identifier)), container.clone())
                    .with_store_index(number - 1),
            ));
            volumes.push(
                Volume::new(identifier, 0, 0)
                    .with_attribute("identifier", format!("store-{}", number))
                    .with_attribute(
                        "creation_time",
                        FILETIME_UNIX_EPOCH_DELTA + 1_600_000_000 * 10_000_000,
                    ),
            );
        }

        let mut volume_systems = HashMap::new();
        volume_systems.insert("/vss".to_string(), VolumeSystem::new(volumes));

        FakeSourceScanner {
            source_type: SourceType::StorageMediaImage,
            root: ScanNode::new(container).with_sub_nodes(sub_nodes),
            volume_systems,
            partition_contents: HashMap::new(),
        }
    }

    /// Image holding a BitLocker volume
    pub fn encrypted() -> Self {
        Self::single_node(TypeIndicator::EncryptedVolume)
    }

    /// Image holding a volume system nothing can process
    pub fn unknown_container() -> Self {
        Self::single_node(TypeIndicator::Other("LVM".to_string()))
    }

    fn single_node(type_indicator: TypeIndicator) -> Self {
        FakeSourceScanner {
            source_type: SourceType::StorageMediaImage,
            root: ScanNode::new(PathSpec::nested(type_indicator, Some("/"), Self::image_spec())),
            volume_systems: HashMap::new(),
            partition_contents: HashMap::new(),
        }
    }
}

impl SourceScanner for FakeSourceScanner {
    fn scan(&self, context: &mut ScanContext) -> crate::error::Result<()> {
        match context.last_scan_node.clone() {
            None => {
                context.source_type = Some(self.source_type);
                context.last_scan_node = Some(self.root.clone());
            }
            Some(node) if *node.type_indicator() == TypeIndicator::Partition => {
                let location = node.path_spec.location.clone().unwrap_or_default();
                if let Some(contents) = self.partition_contents.get(&location) {
                    context.last_scan_node = Some(contents.clone());
                }
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn open_volume_system(&self, path_spec: &PathSpec) -> crate::error::Result<VolumeSystem> {
        let location = path_spec.location.clone().unwrap_or_default();
        self.volume_systems
            .get(&location)
            .cloned()
            .ok_or_else(|| EngineError::source_scan(format!("No volume system at {}", location)))
    }
}

/// Test data generators for common types
pub mod generators {
    use std::collections::BTreeMap;

    use crate::models::{ExtractedEvent, ExtractionError};

    /// Bodyfile with two valid lines and one malformed line
    pub const TEST_BODYFILE: &[u8] = b"0|/etc/passwd|1234|-rw-r--r--|0|0|845|1600000000|1600000100|1600000200|0\n\
0|/etc/shadow|1235|-rw-------|0|42|512|1600001000|1600001000|1600001000|1600001000\n\
not a bodyfile line\n";

    /// Generate a test event
    pub fn test_event(timestamp: i64, display_name: &str) -> ExtractedEvent {
        let mut attributes = BTreeMap::new();
        attributes.insert("size".to_string(), serde_json::Value::from(845));
        ExtractedEvent {
            timestamp,
            timestamp_desc: "Content Modification Time".to_string(),
            data_type: "fs:stat".to_string(),
            parser_chain: "filestat".to_string(),
            parser_name: "filestat".to_string(),
            display_name: display_name.to_string(),
            vss_store: None,
            attributes,
        }
    }

    /// Generate a test extraction error
    pub fn test_error(display_name: &str) -> ExtractionError {
        ExtractionError {
            parser_chain: "bodyfile".to_string(),
            name: "bodyfile".to_string(),
            description: "unable to parse line 3".to_string(),
            path_spec: None,
            display_name: Some(display_name.to_string()),
        }
    }
}
