use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use log::debug;

use super::{ScanContext, ScanNode, SourceScanner, Volume, VolumeSystem};
use crate::constants::{DEFAULT_BYTES_PER_SECTOR, RAW_DEVICE_PREFIX};
use crate::error::{EngineError, Result};
use crate::models::{PathSpec, SourceType, TypeIndicator};

/// Bytes read from the start of a volume to look for signatures
const PROBE_SIZE: usize = 2048;

const MBR_SIGNATURE_OFFSET: usize = 510;
const MBR_ENTRIES_OFFSET: usize = 446;
const MBR_ENTRY_SIZE: usize = 16;

/// Extended partition types only point at further partition tables
const EXTENDED_PARTITION_TYPES: [u8; 3] = [0x05, 0x0f, 0x85];

/// Scanner for operating system paths and raw (dd style) images.
///
/// Recognizes MBR partition tables, a handful of file system boot sector
/// signatures and BitLocker volumes. Anything else on a regular file is
/// treated as a single file.
#[derive(Debug, Default, Clone)]
pub struct OsSourceScanner;

impl OsSourceScanner {
    pub fn new() -> Self {
        OsSourceScanner
    }

    fn scan_source_path(&self, context: &mut ScanContext) -> Result<()> {
        let source_path = context.source_path.clone();
        let os_spec = PathSpec::os(source_path.to_string_lossy());

        if source_path.to_string_lossy().starts_with(RAW_DEVICE_PREFIX) {
            context.source_type = Some(SourceType::StorageMediaDevice);
            context.last_scan_node = Some(self.sniff_volume(&source_path, os_spec, 0)?);
            return Ok(());
        }

        let metadata = fs::metadata(&source_path)?;
        if metadata.is_dir() {
            context.source_type = Some(SourceType::Directory);
            context.last_scan_node = Some(ScanNode::new(os_spec));
            return Ok(());
        }

        let node = self.sniff_volume(&source_path, os_spec, 0)?;
        context.source_type = Some(if *node.type_indicator() != TypeIndicator::Os {
            SourceType::StorageMediaImage
        } else if is_device(&metadata) {
            SourceType::StorageMediaDevice
        } else {
            SourceType::File
        });
        context.last_scan_node = Some(node);
        Ok(())
    }

    /// Node describing what starts at `offset` of the image
    fn sniff_volume(&self, image: &Path, parent: PathSpec, offset: u64) -> Result<ScanNode> {
        let header = read_at(image, offset, PROBE_SIZE)?;

        if let Some(type_indicator) = detect_file_system(&header) {
            debug!("Found {} at offset 0x{:08x}", type_indicator, offset);
            return Ok(ScanNode::new(PathSpec::nested(type_indicator, Some("/"), parent)));
        }

        if offset == 0 {
            if let Some(volumes) = parse_mbr(&header) {
                let table_spec = PathSpec::nested(TypeIndicator::PartitionTable, Some("/"), parent.clone());
                let sub_nodes = volumes
                    .iter()
                    .filter_map(|volume| {
                        let extent = volume.first_extent()?;
                        let location = format!("/{}", volume.identifier);
                        Some(ScanNode::new(
                            PathSpec::nested(TypeIndicator::Partition, Some(&location), parent.clone())
                                .with_start_offset(extent.offset),
                        ))
                    })
                    .collect();
                return Ok(ScanNode::new(table_spec).with_sub_nodes(sub_nodes));
            }
        }

        Ok(ScanNode::new(parent))
    }
}

impl SourceScanner for OsSourceScanner {
    fn scan(&self, context: &mut ScanContext) -> Result<()> {
        let Some(node) = context.last_scan_node.clone() else {
            return self.scan_source_path(context);
        };

        if *node.type_indicator() != TypeIndicator::Partition {
            return Ok(());
        }

        let image = node
            .path_spec
            .os_path()
            .ok_or_else(|| EngineError::source_scan("Partition without an image path."))?;
        let offset = node.path_spec.start_offset.unwrap_or(0);
        let sniffed = self.sniff_volume(&image, node.path_spec.clone(), offset)?;
        if matches!(
            sniffed.type_indicator(),
            TypeIndicator::FileSystem | TypeIndicator::EncryptedVolume
        ) {
            context.last_scan_node = Some(sniffed);
        }
        Ok(())
    }

    fn open_volume_system(&self, path_spec: &PathSpec) -> Result<VolumeSystem> {
        if path_spec.type_indicator != TypeIndicator::PartitionTable {
            return Err(EngineError::source_scan(format!(
                "Unsupported volume system: {}",
                path_spec.type_indicator
            )));
        }
        let image = path_spec
            .os_path()
            .ok_or_else(|| EngineError::source_scan("Volume system without an image path."))?;
        let header = read_at(&image, path_spec.effective_start_offset().unwrap_or(0), PROBE_SIZE)?;
        Ok(VolumeSystem::new(parse_mbr(&header).unwrap_or_default()))
    }
}

/// Reads up to `size` bytes at `offset`, fewer at the end of the image
fn read_at(path: &Path, offset: u64, size: usize) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buffer = Vec::with_capacity(size);
    file.take(size as u64).read_to_end(&mut buffer)?;
    Ok(buffer)
}

fn signature_at(header: &[u8], offset: usize, signature: &[u8]) -> bool {
    header.get(offset..offset + signature.len()) == Some(signature)
}

/// Boot sector and superblock signatures of supported volumes
pub(crate) fn detect_file_system(header: &[u8]) -> Option<TypeIndicator> {
    if signature_at(header, 3, b"-FVE-FS-") {
        return Some(TypeIndicator::EncryptedVolume);
    }
    if signature_at(header, 3, b"NTFS    ")
        || signature_at(header, 82, b"FAT32   ")
        || signature_at(header, 54, b"FAT1")
        || signature_at(header, 1080, &[0x53, 0xef])
    {
        return Some(TypeIndicator::FileSystem);
    }
    None
}

/// Primary partitions of an MBR, `None` without the boot signature
pub(crate) fn parse_mbr(header: &[u8]) -> Option<Vec<Volume>> {
    if !signature_at(header, MBR_SIGNATURE_OFFSET, &[0x55, 0xaa]) {
        return None;
    }

    let sector_size = DEFAULT_BYTES_PER_SECTOR;
    let mut volumes = Vec::new();
    for index in 0..4 {
        let entry = &header[MBR_ENTRIES_OFFSET + index * MBR_ENTRY_SIZE..][..MBR_ENTRY_SIZE];
        let partition_type = entry[4];
        if partition_type == 0 || EXTENDED_PARTITION_TYPES.contains(&partition_type) {
            continue;
        }
        let first_lba = u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]]) as u64;
        let sectors = u32::from_le_bytes([entry[12], entry[13], entry[14], entry[15]]) as u64;
        let identifier = format!("p{}", volumes.len() + 1);
        volumes.push(
            Volume::new(identifier, first_lba * sector_size, sectors * sector_size)
                .with_attribute("partition_type", partition_type),
        );
    }
    Some(volumes)
}

#[cfg(unix)]
fn is_device(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    metadata.file_type().is_block_device() || metadata.file_type().is_char_device()
}

#[cfg(not(unix))]
fn is_device(_metadata: &fs::Metadata) -> bool {
    false
}
