use std::path::Path;

use log::{debug, info, warn};

use super::prompt::UserPrompt;
use super::{ScanContext, ScanNode, SourceScanner, VolumeSystem};
use crate::config::{ExtractionConfig, StoreSelection};
use crate::constants::{RAW_DEVICE_PREFIX, VSS_IDENTIFIER_PREFIX_LENGTH};
use crate::error::{EngineError, Result};
use crate::models::{SourceType, TypeIndicator};
use crate::utils::timestamps::filetime_to_iso8601;

/// User preferences used to disambiguate a source
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolverOptions {
    /// 1-based partition number
    pub partition_number: Option<u32>,
    /// Partition start in bytes
    pub partition_offset: Option<u64>,
    pub process_vss: bool,
    pub vss_stores: Option<StoreSelection>,
}

impl ResolverOptions {
    pub fn from_config(config: &ExtractionConfig) -> Self {
        ResolverOptions {
            partition_number: config.partition_number,
            partition_offset: config.partition_offset(),
            process_vss: config.process_vss,
            vss_stores: config.vss_stores.clone(),
        }
    }
}

/// Resolves a source path to exactly one scan node
pub struct PathResolver {
    scanner: Box<dyn SourceScanner>,
}

impl PathResolver {
    pub fn new(scanner: Box<dyn SourceScanner>) -> Self {
        PathResolver { scanner }
    }

    /// Scans the source until a directory, a file or a supported file system is reached
    pub fn scan_source(
        &self,
        source_path: &Path,
        options: &ResolverOptions,
        prompt: &mut dyn UserPrompt,
    ) -> Result<ScanContext> {
        let source_display = source_path.display().to_string();
        if !source_display.starts_with(RAW_DEVICE_PREFIX) && !source_path.exists() {
            return Err(EngineError::source_scan(format!(
                "No such device, file or directory: {}.",
                source_display
            )));
        }

        let mut context = ScanContext::new(source_path);
        loop {
            self.scanner.scan(&mut context)?;

            if context.is_directory_or_file() {
                break;
            }

            let node = context.last_scan_node.as_ref().ok_or_else(|| {
                EngineError::source_scan(format!(
                    "No supported file system found in source: {}.",
                    source_display
                ))
            })?;
            debug!("Scanned node: {}", node.path_spec.comparable());

            match node.type_indicator() {
                TypeIndicator::FileSystem => break,
                TypeIndicator::EncryptedVolume => {
                    return Err(EngineError::source_scan(
                        "BitLocker encrypted volume not yet supported.",
                    ));
                }
                TypeIndicator::PartitionTable => {
                    let Some(volume_node) = self.select_partition(&context, options, prompt)? else {
                        break;
                    };
                    context.partition_offset = Some(volume_node.path_spec.start_offset.unwrap_or(0));
                    context.last_scan_node = Some(volume_node);
                }
                TypeIndicator::Partition => {
                    return Err(EngineError::source_scan(format!(
                        "No supported file system found in source: {}.",
                        source_display
                    )));
                }
                TypeIndicator::ShadowCopyContainer => {
                    if options.process_vss {
                        context.vss_stores = self.select_vss_stores(&context, options, prompt)?;
                    }
                    let current_volume = node.sub_node_by_location("/").cloned().ok_or_else(|| {
                        EngineError::source_scan(
                            "Unable to retrieve the current volume of the shadow copy container.",
                        )
                    })?;
                    context.last_scan_node = Some(current_volume);
                    break;
                }
                _ => {
                    return Err(EngineError::source_scan(format!(
                        "Unsupported volume system found in source: {}.",
                        source_display
                    )));
                }
            }
        }

        if let Some(source_type) = context.source_type {
            if source_type.is_storage_media() {
                let is_file_system = context
                    .last_scan_node
                    .as_ref()
                    .map(|node| *node.type_indicator() == TypeIndicator::FileSystem)
                    .unwrap_or(false);
                if !is_file_system {
                    warn!("Unsupported file system falling back to single file mode.");
                    context.source_type = Some(SourceType::File);
                } else if context.partition_offset.is_none() {
                    context.partition_offset = Some(0);
                }
            }
        }

        Ok(context)
    }

    fn open_volume_system(&self, context: &ScanContext) -> Result<(ScanNode, VolumeSystem)> {
        let node = context.require_last_scan_node()?.clone();
        let volume_system = self.scanner.open_volume_system(&node.path_spec)?;
        Ok((node, volume_system))
    }

    /// Picks one partition: by number, by offset, the only one, or by asking
    fn select_partition(
        &self,
        context: &ScanContext,
        options: &ResolverOptions,
        prompt: &mut dyn UserPrompt,
    ) -> Result<Option<ScanNode>> {
        let (node, volume_system) = self.open_volume_system(context)?;
        let identifiers = volume_system.identifiers();
        if identifiers.is_empty() {
            info!("No supported partitions found.");
            return Ok(None);
        }

        if let Some(partition_number) = options.partition_number.filter(|number| *number > 0) {
            // Partition numbers start at 1, volume indexes at 0
            match volume_system.volume_by_index(partition_number as usize - 1) {
                Some(volume) => return volume_sub_node(&node, &volume.identifier).map(Some),
                None => warn!("No such partition: {}.", partition_number),
            }
        }

        if let Some(partition_offset) = options.partition_offset {
            let matching = volume_system.volumes.iter().find(|volume| {
                volume.first_extent().map(|extent| extent.offset) == Some(partition_offset)
            });
            match matching {
                Some(volume) => return volume_sub_node(&node, &volume.identifier).map(Some),
                None => warn!(
                    "No such partition with offset: {0} (0x{0:08x}).",
                    partition_offset
                ),
            }
        }

        let identifier = if identifiers.len() == 1 {
            identifiers[0].clone()
        } else {
            prompt_partition_identifier(&volume_system, &identifiers, prompt)?
        };
        volume_sub_node(&node, &identifier).map(Some)
    }

    /// Determines the set of shadow copy stores to process
    fn select_vss_stores(
        &self,
        context: &ScanContext,
        options: &ResolverOptions,
        prompt: &mut dyn UserPrompt,
    ) -> Result<Option<StoreSelection>> {
        let (_, volume_system) = self.open_volume_system(context)?;
        let identifiers = volume_system.identifiers();
        if identifiers.is_empty() {
            return Ok(None);
        }

        let valid_stores = normalize_store_identifiers(&identifiers);

        if let Some(preferred) = options.vss_stores.as_ref().filter(|stores| !stores.is_empty()) {
            if preferred.is_subset_of(&valid_stores) {
                return Ok(Some(preferred.clone()));
            }
            warn!(
                "Requested VSS stores {} are not all available (found: {}), asking for a selection.",
                preferred,
                StoreSelection::from_stores(valid_stores.iter().copied())
            );
        }

        if valid_stores.len() == 1 {
            return Ok(Some(StoreSelection::from_stores(valid_stores.iter().copied())));
        }

        prompt_vss_stores(&volume_system, &valid_stores, prompt).map(Some)
    }
}

fn volume_sub_node(node: &ScanNode, identifier: &str) -> Result<ScanNode> {
    let location = format!("/{}", identifier);
    node.sub_node_by_location(&location).cloned().ok_or_else(|| {
        EngineError::source_scan(format!(
            "Unable to retrieve volume scan node by location: {}",
            location
        ))
    })
}

/// Store numbers of identifiers like `vss1`; malformed identifiers are skipped
fn normalize_store_identifiers(identifiers: &[String]) -> Vec<u32> {
    identifiers
        .iter()
        .filter_map(|identifier| identifier.get(VSS_IDENTIFIER_PREFIX_LENGTH..))
        .filter(|number| !number.is_empty() && number.chars().all(|c| c.is_ascii_digit()))
        .filter_map(|number| number.parse::<u32>().ok())
        .collect()
}

fn prompt_partition_identifier(
    volume_system: &VolumeSystem,
    identifiers: &[String],
    prompt: &mut dyn UserPrompt,
) -> Result<String> {
    let mut listing = String::from(
        "The following partitions were found:\nIdentifier\tOffset (in bytes)\tSize (in bytes)\n",
    );
    for volume in &volume_system.volumes {
        let (offset, size) = volume
            .first_extent()
            .map(|extent| (extent.offset, extent.size))
            .unwrap_or((0, 0));
        listing.push_str(&format!(
            "{0}\t\t{1} (0x{1:08x})\t{2}\n",
            volume.identifier, offset, size
        ));
    }
    listing.push('\n');
    prompt.write(&listing);

    loop {
        prompt.write(
            "Please specify the identifier of the partition that should be processed:\n\
             Note that you can abort with Ctrl^C.\n",
        );
        let answer = prompt
            .read_line()
            .ok_or_else(|| EngineError::source_scan("File system scan aborted."))?;
        let answer = answer.trim();
        if identifiers.iter().any(|identifier| identifier == answer) {
            return Ok(answer.to_string());
        }
        prompt.write("\nUnsupported partition identifier, please try again or abort with Ctrl^C.\n\n");
    }
}

fn prompt_vss_stores(
    volume_system: &VolumeSystem,
    valid_stores: &[u32],
    prompt: &mut dyn UserPrompt,
) -> Result<StoreSelection> {
    let mut listing = String::from(
        "The following Volume Shadow Snapshots (VSS) were found:\n\
         Identifier\tVSS store identifier\tCreation Time\n",
    );
    for volume in &volume_system.volumes {
        let store_identifier = volume
            .attribute("identifier")
            .and_then(|value| value.as_str())
            .unwrap_or("N/A");
        let creation_time = volume
            .attribute("creation_time")
            .and_then(|value| value.as_u64())
            .map(filetime_to_iso8601)
            .unwrap_or_else(|| "N/A".to_string());
        listing.push_str(&format!(
            "{}\t\t{}\t{}\n",
            volume.identifier, store_identifier, creation_time
        ));
    }
    listing.push('\n');
    prompt.write(&listing);

    loop {
        prompt.write(
            "Please specify the identifier(s) of the VSS that should be processed:\n\
             Note that a range of stores can be defined as: 3..5. Multiple stores can\n\
             be defined as: 1,3,5 (a list of comma separated values). Ranges and lists can\n\
             also be combined as: 1,3..5. The first store is 1. If no stores are specified\n\
             none will be processed. You can abort with Ctrl^C.\n",
        );
        let answer = prompt
            .read_line()
            .ok_or_else(|| EngineError::source_scan("File system scan aborted."))?;
        let answer = answer.trim();
        if answer.is_empty() {
            return Ok(StoreSelection::default());
        }

        match StoreSelection::parse(answer) {
            Ok(selection) if selection.is_subset_of(valid_stores) => return Ok(selection),
            Ok(_) | Err(_) => prompt.write(
                "\nUnsupported VSS identifier(s), please try again or abort with Ctrl^C.\n\n",
            ),
        }
    }
}
