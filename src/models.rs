use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of source handed to the extractor
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    File,
    Directory,
    StorageMediaDevice,
    StorageMediaImage,
}

impl SourceType {
    pub fn is_storage_media(&self) -> bool {
        matches!(self, SourceType::StorageMediaDevice | SourceType::StorageMediaImage)
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceType::File => "single file",
            SourceType::Directory => "directory",
            SourceType::StorageMediaDevice => "storage media device",
            SourceType::StorageMediaImage => "storage media image",
        };
        write!(f, "{}", name)
    }
}

/// Layer a path specification addresses
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TypeIndicator {
    /// Plain operating system path
    Os,
    /// Partition table of a storage media image
    PartitionTable,
    /// One partition inside a partition table
    Partition,
    /// Volume shadow copy container
    ShadowCopyContainer,
    /// One shadow copy store
    ShadowCopyStore,
    /// Supported file system
    FileSystem,
    /// Full-disk encrypted volume
    EncryptedVolume,
    /// Anything the scanner recognized but cannot process
    Other(String),
}

impl fmt::Display for TypeIndicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeIndicator::Os => write!(f, "OS"),
            TypeIndicator::PartitionTable => write!(f, "PARTITION_TABLE"),
            TypeIndicator::Partition => write!(f, "PARTITION"),
            TypeIndicator::ShadowCopyContainer => write!(f, "VSHADOW"),
            TypeIndicator::ShadowCopyStore => write!(f, "VSHADOW_STORE"),
            TypeIndicator::FileSystem => write!(f, "FILE_SYSTEM"),
            TypeIndicator::EncryptedVolume => write!(f, "ENCRYPTED_VOLUME"),
            TypeIndicator::Other(name) => write!(f, "{}", name),
        }
    }
}

/// Serializable locator of one layer of a (possibly nested) source.
///
/// Path specifications only carry identifiers (paths, offsets, store
/// indexes) so every process can re-open the source on its own.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PathSpec {
    pub type_indicator: TypeIndicator,
    pub location: Option<String>,
    pub start_offset: Option<u64>,
    pub store_index: Option<u32>,
    pub parent: Option<Box<PathSpec>>,
}

impl PathSpec {
    /// Path specification of an operating system path
    pub fn os(location: impl Into<String>) -> Self {
        PathSpec {
            type_indicator: TypeIndicator::Os,
            location: Some(location.into()),
            start_offset: None,
            store_index: None,
            parent: None,
        }
    }

    /// Path specification of a layer nested inside `parent`
    pub fn nested(type_indicator: TypeIndicator, location: Option<&str>, parent: PathSpec) -> Self {
        PathSpec {
            type_indicator,
            location: location.map(str::to_string),
            start_offset: None,
            store_index: None,
            parent: Some(Box::new(parent)),
        }
    }

    pub fn with_start_offset(mut self, offset: u64) -> Self {
        self.start_offset = Some(offset);
        self
    }

    pub fn with_store_index(mut self, index: u32) -> Self {
        self.store_index = Some(index);
        self
    }

    /// Walks up the parent chain to the operating system path of the source
    pub fn os_path(&self) -> Option<PathBuf> {
        let mut current = self;
        loop {
            if current.type_indicator == TypeIndicator::Os {
                return current.location.as_ref().map(PathBuf::from);
            }
            current = current.parent.as_deref()?;
        }
    }

    /// First start offset found walking up the parent chain
    pub fn effective_start_offset(&self) -> Option<u64> {
        let mut current = Some(self);
        while let Some(spec) = current {
            if spec.start_offset.is_some() {
                return spec.start_offset;
            }
            current = spec.parent.as_deref();
        }
        None
    }

    /// Human readable form used for display names and error records
    pub fn comparable(&self) -> String {
        let mut layers = Vec::new();
        let mut current = Some(self);
        while let Some(spec) = current {
            let mut layer = format!("type: {}", spec.type_indicator);
            if let Some(location) = &spec.location {
                layer.push_str(&format!(", location: {}", location));
            }
            if let Some(offset) = spec.start_offset {
                layer.push_str(&format!(", start offset: 0x{:08x}", offset));
            }
            if let Some(store) = spec.store_index {
                layer.push_str(&format!(", store index: {}", store));
            }
            layers.push(layer);
            current = spec.parent.as_deref();
        }
        layers.reverse();
        layers.join(" / ")
    }
}

/// One unit of extraction work produced by the collector
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkItemDescriptor {
    pub path_spec: PathSpec,
    pub display_name: String,
    /// 1-based shadow copy store the item was found in, if any
    pub vss_store: Option<u32>,
    pub is_directory: bool,
}

/// Timestamped event produced by a parser
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExtractedEvent {
    /// Microseconds since the Unix epoch (UTC)
    pub timestamp: i64,
    pub timestamp_desc: String,
    pub data_type: String,
    pub parser_chain: String,
    pub parser_name: String,
    pub display_name: String,
    pub vss_store: Option<u32>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl ExtractedEvent {
    /// Nesting depth of the parser invocations that produced this event
    pub fn nesting_depth(&self) -> usize {
        parser_chain_depth(&self.parser_chain)
    }
}

/// Per-item parser failure, recorded and never escalated
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExtractionError {
    pub parser_chain: String,
    /// Name of the parser or plugin that failed
    pub name: String,
    pub description: String,
    pub path_spec: Option<PathSpec>,
    pub display_name: Option<String>,
}

/// Number of `/`-delimited segments of a parser chain
pub fn parser_chain_depth(chain: &str) -> usize {
    if chain.is_empty() {
        0
    } else {
        chain.split('/').count()
    }
}

/// Status a worker publishes over its RPC endpoint
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct WorkerStatus {
    pub identifier: String,
    pub pid: u32,
    pub items_processed: u64,
    pub events_produced: u64,
    pub errors_produced: u64,
    pub memory_bytes: Option<u64>,
    /// "idle", "processing" or "completed"
    pub activity: String,
    pub last_item: Option<String>,
}

impl WorkerStatus {
    pub fn is_processing(&self) -> bool {
        self.activity == "processing"
    }
}

/// Incrementally built run metadata.
///
/// Keys can be added but never replaced or removed. [`freeze`](Self::freeze)
/// turns the builder into the immutable record attached to the output.
#[derive(Debug, Clone, Default)]
pub struct CollectionInformationBuilder {
    values: BTreeMap<String, Value>,
}

impl CollectionInformationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key, returns false and keeps the first value if it already exists
    pub fn insert<V: Into<Value>>(&mut self, key: &str, value: V) -> bool {
        if self.values.contains_key(key) {
            log::debug!("Collection information key {} already set", key);
            return false;
        }
        self.values.insert(key.to_string(), value.into());
        true
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn freeze(self) -> CollectionInformation {
        CollectionInformation { values: self.values }
    }
}

/// Frozen run metadata persisted once at the head of the storage file
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(transparent)]
pub struct CollectionInformation {
    values: BTreeMap<String, Value>,
}

impl CollectionInformation {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_spec_os_path_through_parents() {
        let image = PathSpec::os("/evidence/disk.raw");
        let partition = PathSpec::nested(TypeIndicator::Partition, Some("/p2"), image)
            .with_start_offset(1_048_576);
        let fs = PathSpec::nested(TypeIndicator::FileSystem, Some("/"), partition);

        assert_eq!(fs.os_path(), Some(PathBuf::from("/evidence/disk.raw")));
        assert_eq!(fs.effective_start_offset(), Some(1_048_576));
        assert!(fs.comparable().starts_with("type: OS, location: /evidence/disk.raw"));
        assert!(fs.comparable().ends_with("type: FILE_SYSTEM, location: /"));
    }

    #[test]
    fn test_parser_chain_depth() {
        assert_eq!(parser_chain_depth(""), 0);
        assert_eq!(parser_chain_depth("filestat"), 1);
        assert_eq!(parser_chain_depth("zip/bodyfile"), 2);
    }

    #[test]
    fn test_collection_information_is_append_only() {
        let mut builder = CollectionInformationBuilder::new();
        assert!(builder.insert("workers", 4));
        assert!(!builder.insert("workers", 8));
        builder.insert("runtime", "multi process mode");

        let info = builder.freeze();
        assert_eq!(info.get("workers"), Some(&Value::from(4)));
        assert_eq!(info.get_str("runtime"), Some("multi process mode"));
        assert_eq!(info.len(), 2);
    }

    #[test]
    fn test_collection_information_serializes_as_map() {
        let mut builder = CollectionInformationBuilder::new();
        builder.insert("debug", false);
        let json = serde_json::to_string(&builder.freeze()).unwrap();
        assert_eq!(json, r#"{"debug":false}"#);
    }

    #[test]
    fn test_source_type_storage_media() {
        assert!(SourceType::StorageMediaImage.is_storage_media());
        assert!(SourceType::StorageMediaDevice.is_storage_media());
        assert!(!SourceType::Directory.is_storage_media());
        assert_eq!(SourceType::File.to_string(), "single file");
    }
}
