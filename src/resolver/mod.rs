//! Source resolution: from a source path to exactly one readable node.
//!
//! A [`SourceScanner`] advances a [`ScanContext`] one container layer at a
//! time (partition table, partition, shadow copy container, file system).
//! The [`PathResolver`] drives the scanner, disambiguates partitions and
//! shadow copy stores from user preferences or interactive prompts, and
//! leaves the context holding the single node extraction reads from.

mod path_resolver;
mod prompt;
mod raw;

pub use path_resolver::{PathResolver, ResolverOptions};
pub use prompt::{ConsolePrompt, ReaderPrompt, UserPrompt};
pub use raw::OsSourceScanner;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::StoreSelection;
use crate::error::{EngineError, Result};
use crate::models::{PathSpec, SourceType, TypeIndicator};

/// One resolved layer of a nested container source
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanNode {
    pub path_spec: PathSpec,
    #[serde(default)]
    pub sub_nodes: Vec<ScanNode>,
}

impl ScanNode {
    pub fn new(path_spec: PathSpec) -> Self {
        ScanNode { path_spec, sub_nodes: Vec::new() }
    }

    pub fn with_sub_nodes(mut self, sub_nodes: Vec<ScanNode>) -> Self {
        self.sub_nodes = sub_nodes;
        self
    }

    pub fn type_indicator(&self) -> &TypeIndicator {
        &self.path_spec.type_indicator
    }

    /// Sub-node addressed by a root-relative location such as `/p1`
    pub fn sub_node_by_location(&self, location: &str) -> Option<&ScanNode> {
        self.sub_nodes
            .iter()
            .find(|node| node.path_spec.location.as_deref() == Some(location))
    }
}

/// Byte range a volume occupies
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeExtent {
    pub offset: u64,
    pub size: u64,
}

/// One partition or shadow copy store of a volume system
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Volume {
    pub identifier: String,
    pub extents: Vec<VolumeExtent>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl Volume {
    pub fn new(identifier: impl Into<String>, offset: u64, size: u64) -> Self {
        Volume {
            identifier: identifier.into(),
            extents: vec![VolumeExtent { offset, size }],
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn first_extent(&self) -> Option<&VolumeExtent> {
        self.extents.first()
    }
}

/// Ordered volumes of a partition table or shadow copy container
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct VolumeSystem {
    pub volumes: Vec<Volume>,
}

impl VolumeSystem {
    pub fn new(volumes: Vec<Volume>) -> Self {
        VolumeSystem { volumes }
    }

    pub fn identifiers(&self) -> Vec<String> {
        self.volumes.iter().map(|volume| volume.identifier.clone()).collect()
    }

    pub fn volume_by_identifier(&self, identifier: &str) -> Option<&Volume> {
        self.volumes.iter().find(|volume| volume.identifier == identifier)
    }

    /// 0-based index lookup
    pub fn volume_by_index(&self, index: usize) -> Option<&Volume> {
        self.volumes.get(index)
    }
}

/// Container format detection, one layer per [`scan`](Self::scan) call
pub trait SourceScanner: Send + Sync {
    /// Advances the context by one layer; a terminal node is left unchanged
    fn scan(&self, context: &mut ScanContext) -> Result<()>;

    /// Opens the volume system a partition table or shadow copy node describes
    fn open_volume_system(&self, path_spec: &PathSpec) -> Result<VolumeSystem>;
}

/// Mutable resolution state, owned by the resolver while scanning
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanContext {
    pub source_path: PathBuf,
    pub source_type: Option<SourceType>,
    pub last_scan_node: Option<ScanNode>,
    pub partition_offset: Option<u64>,
    pub vss_stores: Option<StoreSelection>,
}

impl ScanContext {
    pub fn new(source_path: &Path) -> Self {
        ScanContext {
            source_path: source_path.to_path_buf(),
            source_type: None,
            last_scan_node: None,
            partition_offset: None,
            vss_stores: None,
        }
    }

    pub fn is_directory_or_file(&self) -> bool {
        matches!(self.source_type, Some(SourceType::Directory) | Some(SourceType::File))
    }

    /// Current node, failing when the context is structurally invalid
    pub fn require_last_scan_node(&self) -> Result<&ScanNode> {
        self.last_scan_node
            .as_ref()
            .ok_or_else(|| EngineError::source_scan("Invalid scan context."))
    }

    /// Serializable identifiers of the resolved source
    pub fn resolved(&self) -> Result<ResolvedSource> {
        let source_type = self
            .source_type
            .ok_or_else(|| EngineError::source_scan("Source has not been scanned."))?;
        let path_spec = match (source_type, &self.last_scan_node) {
            (SourceType::Directory | SourceType::File, _) | (_, None) => {
                PathSpec::os(self.source_path.to_string_lossy())
            }
            (_, Some(node)) => node.path_spec.clone(),
        };
        Ok(ResolvedSource {
            source_path: self.source_path.clone(),
            source_type,
            path_spec,
            partition_offset: self.partition_offset,
            vss_stores: self.vss_stores.clone(),
        })
    }
}

/// What every child process needs to re-open the source
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResolvedSource {
    pub source_path: PathBuf,
    pub source_type: SourceType,
    pub path_spec: PathSpec,
    pub partition_offset: Option<u64>,
    pub vss_stores: Option<StoreSelection>,
}

impl ResolvedSource {
    /// Resolved source for a plain directory or file, used by tests and tools
    pub fn from_os_path(source_path: &Path, source_type: SourceType) -> Self {
        ResolvedSource {
            source_path: source_path.to_path_buf(),
            source_type,
            path_spec: PathSpec::os(source_path.to_string_lossy()),
            partition_offset: None,
            vss_stores: None,
        }
    }
}
