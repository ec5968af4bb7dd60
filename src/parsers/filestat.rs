use std::collections::BTreeMap;

use log::debug;
use serde_json::Value;

use super::{EventData, FileEntry, ParseError, ParserMediator, ParserPlugin};
use crate::utils::hash::sha256_reader;

/// File system metadata events for every entry with a stat
pub struct FilestatParser;

impl ParserPlugin for FilestatParser {
    fn name(&self) -> &'static str {
        "filestat"
    }

    fn description(&self) -> &'static str {
        "Timestamps from file system metadata"
    }

    fn supports(&self, entry: &FileEntry, _header: &[u8]) -> bool {
        entry.stat().is_some()
    }

    fn parse(&self, mediator: &mut ParserMediator<'_>, entry: &FileEntry) -> Result<(), ParseError> {
        let Some(stat) = entry.stat().cloned() else {
            return Ok(());
        };

        let mut attributes = BTreeMap::new();
        attributes.insert("size".to_string(), Value::from(stat.size));
        attributes.insert(
            "file_entry_type".to_string(),
            Value::from(if stat.is_directory { "directory" } else { "file" }),
        );
        if let Some(inode) = stat.inode {
            attributes.insert("inode".to_string(), Value::from(inode));
        }
        if let Some(mode) = stat.mode {
            attributes.insert("mode".to_string(), Value::from(format!("{:o}", mode)));
        }
        if !stat.is_directory {
            match sha256_reader(entry.open()?, stat.size, mediator.options().max_hash_size_mb) {
                Ok(Some(hash)) => {
                    attributes.insert("sha256".to_string(), Value::from(hash));
                }
                Ok(None) => debug!("Skipping hash of {}, larger than the hash limit", entry.display_name()),
                Err(e) => debug!("Unable to hash {}: {}", entry.display_name(), e),
            }
        }

        let timestamps = [
            (stat.modified, "Content Modification Time"),
            (stat.accessed, "Last Access Time"),
            (stat.changed, "Metadata Modification Time"),
            (stat.created, "Creation Time"),
        ];
        for (timestamp, timestamp_desc) in timestamps {
            if let Some(timestamp) = timestamp {
                mediator.produce_event(
                    entry,
                    EventData {
                        timestamp,
                        timestamp_desc,
                        data_type: "fs:stat",
                        attributes: attributes.clone(),
                    },
                );
            }
        }
        Ok(())
    }
}
