use std::path::{Component, Path};

use regex::{Regex, RegexBuilder};

use crate::config::read_filter_lines;
use crate::error::{EngineError, Result};

/// Path filter read from a collection filter file.
///
/// Each line is a `/`-separated path whose segments are case-insensitive
/// regular expressions matched against whole path components, relative to
/// the source root:
///
/// ```text
/// /Windows/System32/config/(SAM|SOFTWARE|SYSTEM)
/// /Users/.+/NTUSER.DAT
/// ```
#[derive(Debug, Clone)]
pub struct PathFilter {
    filters: Vec<Vec<Regex>>,
}

impl PathFilter {
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_lines(&read_filter_lines(path)?)
    }

    pub fn from_lines(lines: &[String]) -> Result<Self> {
        let mut filters = Vec::new();
        for line in lines {
            let segments = line
                .split('/')
                .filter(|segment| !segment.is_empty())
                .map(|segment| {
                    RegexBuilder::new(&format!("^(?:{})$", segment))
                        .case_insensitive(true)
                        .build()
                        .map_err(|e| {
                            EngineError::configuration(format!("Invalid filter line {}: {}", line, e))
                        })
                })
                .collect::<Result<Vec<_>>>()?;
            if !segments.is_empty() {
                filters.push(segments);
            }
        }
        Ok(PathFilter { filters })
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Whether a path relative to the source root matches a filter line
    pub fn matches(&self, relative: &Path) -> bool {
        let components = components(relative);
        self.filters.iter().any(|filter| {
            filter.len() == components.len()
                && filter.iter().zip(&components).all(|(regex, component)| regex.is_match(component))
        })
    }

    /// Whether a directory may hold paths matching a filter line
    pub fn may_contain(&self, relative_directory: &Path) -> bool {
        let components = components(relative_directory);
        self.filters.iter().any(|filter| {
            filter.len() > components.len()
                && filter.iter().zip(&components).all(|(regex, component)| regex.is_match(component))
        })
    }
}

fn components(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(name) => Some(name.to_string_lossy().to_string()),
            _ => None,
        })
        .collect()
}
