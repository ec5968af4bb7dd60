//! Parser plugins and the mediator they report through.
//!
//! Every enabled [`ParserPlugin`] whose signature check accepts an entry is
//! run against it. Parsers never touch the queues: they hand events and
//! errors to the [`ParserMediator`], which stamps them with the parser
//! chain, applies the event filter and buffers them for the worker.
//! Parsers that find embedded content (archive members) hand it back to the
//! mediator, which extends the chain by one segment per nesting level.

mod archive;
mod bodyfile;
mod file_entry;
mod filestat;

pub use archive::ZipParser;
pub use bodyfile::BodyfileParser;
pub use file_entry::{FileEntry, FileStat, OffsetReader, ReadSeek};
pub use filestat::FilestatParser;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use log::debug;
use serde_json::Value;
use thiserror::Error;

use crate::constants::{DEFAULT_MAX_HASH_SIZE_MB, MAX_PARSER_NESTING_DEPTH, PARSER_HEADER_SIZE};
use crate::error::{EngineError, Result};
use crate::filter::EventFilter;
use crate::models::{ExtractedEvent, ExtractionError};

/// Failure of one parser on one entry
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{0}")]
    Format(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// A named parser plugin
pub trait ParserPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Signature or name check deciding whether the parser runs on the entry
    fn supports(&self, entry: &FileEntry, header: &[u8]) -> bool;

    fn parse(&self, mediator: &mut ParserMediator<'_>, entry: &FileEntry) -> std::result::Result<(), ParseError>;
}

fn available_parsers() -> Vec<Arc<dyn ParserPlugin>> {
    vec![
        Arc::new(FilestatParser),
        Arc::new(BodyfileParser),
        Arc::new(ZipParser),
    ]
}

/// Enabled parsers, in dispatch order
#[derive(Clone)]
pub struct ParserRegistry {
    parsers: Vec<Arc<dyn ParserPlugin>>,
}

impl ParserRegistry {
    /// Every built-in parser
    pub fn all() -> Self {
        ParserRegistry { parsers: available_parsers() }
    }

    /// Names of the built-in parsers
    pub fn available_names() -> Vec<&'static str> {
        available_parsers().iter().map(|parser| parser.name()).collect()
    }

    /// Parses a filter such as `filestat,zip` or `-zip`.
    ///
    /// Names are comma separated; a leading `-` excludes a parser. Without
    /// any included name every parser not excluded is enabled. Unknown
    /// names are configuration errors.
    pub fn from_filter(filter: &str) -> Result<Self> {
        let available = Self::available_names();
        let mut includes = Vec::new();
        let mut excludes = Vec::new();

        for token in filter.split(',').map(str::trim).filter(|token| !token.is_empty()) {
            let (name, excluded) = match token.strip_prefix('-') {
                Some(name) => (name.trim(), true),
                None => (token, false),
            };
            let name = name.to_lowercase();
            if !available.contains(&name.as_str()) {
                return Err(EngineError::configuration(format!(
                    "Unknown parser: {}. Available parsers: {}.",
                    name,
                    available.join(", ")
                )));
            }
            if excluded {
                excludes.push(name);
            } else {
                includes.push(name);
            }
        }

        let parsers: Vec<Arc<dyn ParserPlugin>> = available_parsers()
            .into_iter()
            .filter(|parser| includes.is_empty() || includes.iter().any(|name| name == parser.name()))
            .filter(|parser| !excludes.iter().any(|name| name == parser.name()))
            .collect();

        if parsers.is_empty() {
            return Err(EngineError::configuration(format!(
                "Parser filter {} enables no parsers.",
                filter
            )));
        }
        Ok(ParserRegistry { parsers })
    }

    pub fn parsers(&self) -> &[Arc<dyn ParserPlugin>] {
        &self.parsers
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.parsers.iter().map(|parser| parser.name()).collect()
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.parsers.iter().any(|parser| parser.name() == name)
    }
}

impl std::fmt::Debug for ParserRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParserRegistry").field("parsers", &self.names()).finish()
    }
}

/// Settings parsers read through the mediator
#[derive(Debug, Clone, PartialEq)]
pub struct ParserOptions {
    /// Mount point whose prefix is stripped from display names
    pub mount_path: Option<PathBuf>,
    pub max_hash_size_mb: u64,
}

impl Default for ParserOptions {
    fn default() -> Self {
        ParserOptions { mount_path: None, max_hash_size_mb: DEFAULT_MAX_HASH_SIZE_MB }
    }
}

/// Event fields a parser supplies
#[derive(Debug, Clone, PartialEq)]
pub struct EventData {
    pub timestamp: i64,
    pub timestamp_desc: &'static str,
    pub data_type: &'static str,
    pub attributes: BTreeMap<String, Value>,
}

/// Context object passed to parsers for one entry at a time
pub struct ParserMediator<'a> {
    registry: &'a ParserRegistry,
    options: &'a ParserOptions,
    filter: Option<&'a EventFilter>,
    chain: Vec<&'static str>,
    events: Vec<ExtractedEvent>,
    errors: Vec<ExtractionError>,
    filtered_events: u64,
}

impl<'a> ParserMediator<'a> {
    pub fn new(registry: &'a ParserRegistry, options: &'a ParserOptions, filter: Option<&'a EventFilter>) -> Self {
        ParserMediator {
            registry,
            options,
            filter,
            chain: Vec::new(),
            events: Vec::new(),
            errors: Vec::new(),
            filtered_events: 0,
        }
    }

    pub fn options(&self) -> &ParserOptions {
        self.options
    }

    pub fn filter(&self) -> Option<&EventFilter> {
        self.filter
    }

    /// Chain of the parser invocations currently running
    pub fn parser_chain(&self) -> String {
        self.chain.join("/")
    }

    pub fn nesting_depth(&self) -> usize {
        self.chain.len()
    }

    /// Runs every enabled parser that supports the entry
    pub fn parse_file_entry(&mut self, entry: &FileEntry) {
        if self.chain.len() >= MAX_PARSER_NESTING_DEPTH {
            self.produce_error(
                entry,
                format!("maximum parser nesting depth of {} reached", MAX_PARSER_NESTING_DEPTH),
            );
            return;
        }

        let header = if entry.is_directory() {
            Vec::new()
        } else {
            match entry.read_header(PARSER_HEADER_SIZE) {
                Ok(header) => header,
                Err(error) => {
                    self.produce_error(entry, format!("unable to open file entry: {}", error));
                    return;
                }
            }
        };

        let registry = self.registry;
        for parser in registry.parsers() {
            if !parser.supports(entry, &header) {
                continue;
            }
            debug!("Parsing {} with {}", entry.display_name(), parser.name());
            self.chain.push(parser.name());
            if let Err(error) = parser.parse(self, entry) {
                self.produce_error(entry, error.to_string());
            }
            self.chain.pop();
        }
    }

    /// Records an event unless the filter rejects it
    pub fn produce_event(&mut self, entry: &FileEntry, data: EventData) {
        let event = ExtractedEvent {
            timestamp: data.timestamp,
            timestamp_desc: data.timestamp_desc.to_string(),
            data_type: data.data_type.to_string(),
            parser_chain: self.parser_chain(),
            parser_name: self.chain.last().copied().unwrap_or_default().to_string(),
            display_name: self.display_name(entry),
            vss_store: entry.vss_store(),
            attributes: data.attributes,
        };

        if let Some(filter) = self.filter {
            if !filter.matches(&event) {
                self.filtered_events += 1;
                return;
            }
        }
        self.events.push(event);
    }

    pub fn produce_error(&mut self, entry: &FileEntry, description: impl Into<String>) {
        self.errors.push(ExtractionError {
            parser_chain: self.parser_chain(),
            name: self.chain.last().copied().unwrap_or("file_entry").to_string(),
            description: description.into(),
            path_spec: Some(entry.path_spec().clone()),
            display_name: Some(self.display_name(entry)),
        });
    }

    /// Display name with the mount point prefix removed from OS paths
    pub fn display_name(&self, entry: &FileEntry) -> String {
        if let (Some(mount_path), Some(os_path)) = (&self.options.mount_path, entry.os_path()) {
            if let Ok(relative) = os_path.strip_prefix(mount_path) {
                return format!("/{}", relative.to_string_lossy());
            }
        }
        entry.display_name().to_string()
    }

    pub fn filtered_events(&self) -> u64 {
        self.filtered_events
    }

    /// Buffered events and errors of the entries parsed so far
    pub fn take_results(&mut self) -> (Vec<ExtractedEvent>, Vec<ExtractionError>) {
        (std::mem::take(&mut self.events), std::mem::take(&mut self.errors))
    }
}
