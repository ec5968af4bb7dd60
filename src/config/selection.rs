use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::MAX_SELECTION_RANGE;
use crate::error::{EngineError, Result};

/// Normalized set of 1-based store (or partition) numbers.
///
/// Parsed from expressions such as `1,3..5`. The numbers are always sorted
/// ascending and deduplicated.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct StoreSelection(Vec<u32>);

impl StoreSelection {
    /// Builds a selection from arbitrary numbers, normalizing them
    pub fn from_stores(stores: impl IntoIterator<Item = u32>) -> Self {
        let mut stores: Vec<u32> = stores.into_iter().collect();
        stores.sort_unstable();
        stores.dedup();
        StoreSelection(stores)
    }

    /// Parses a comma-separated list of numbers and inclusive `A..B` ranges.
    ///
    /// A range whose first number is greater than its last contributes
    /// nothing. Any token that is not a positive number or a well formed
    /// range fails the whole expression.
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Ok(StoreSelection::default());
        }

        let mut stores = Vec::new();
        for token in expression.split(',') {
            let token = token.trim();
            if let Some((first, last)) = token.split_once("..") {
                let first = parse_store_number(first, token)?;
                let last = parse_store_number(last, token)?;
                if first > last {
                    continue;
                }
                if last - first >= MAX_SELECTION_RANGE {
                    return Err(EngineError::configuration(format!(
                        "Store range too large: {}.",
                        token
                    )));
                }
                stores.extend(first..=last);
            } else {
                stores.push(parse_store_number(token, token)?);
            }
        }

        Ok(StoreSelection::from_stores(stores))
    }

    /// Renders the selection in its most compact expression form
    pub fn render(&self) -> String {
        let mut parts = Vec::new();
        let mut iter = self.0.iter().copied().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while let Some(&next) = iter.peek() {
                if next == end + 1 {
                    end = next;
                    iter.next();
                } else {
                    break;
                }
            }
            if start == end {
                parts.push(start.to_string());
            } else {
                parts.push(format!("{}..{}", start, end));
            }
        }
        parts.join(",")
    }

    pub fn stores(&self) -> &[u32] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, store: u32) -> bool {
        self.0.binary_search(&store).is_ok()
    }

    /// True when every selected store is among `valid`
    pub fn is_subset_of(&self, valid: &[u32]) -> bool {
        self.0.iter().all(|store| valid.contains(store))
    }
}

fn parse_store_number(value: &str, token: &str) -> Result<u32> {
    let value = value.trim();
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_digit()) {
        return Err(EngineError::configuration(format!(
            "Invalid VSS store range: {}.",
            token
        )));
    }
    match value.parse::<u32>() {
        Ok(0) => Err(EngineError::configuration(format!(
            "Invalid VSS store range: {}. The first store is 1.",
            token
        ))),
        Ok(number) => Ok(number),
        Err(_) => Err(EngineError::configuration(format!(
            "Invalid VSS store range: {}.",
            token
        ))),
    }
}

impl FromStr for StoreSelection {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        StoreSelection::parse(s)
    }
}

impl fmt::Display for StoreSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}
