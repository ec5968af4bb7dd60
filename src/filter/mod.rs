//! Event filter expressions evaluated by workers before an event is queued.
//!
//! An expression is one or more clauses joined by `and`:
//!
//! ```text
//! data_type == 'fs:stat' and timestamp >= '2020-01-01' and display_name regexp '\.log$'
//! ```
//!
//! Fields are the event columns (`timestamp`, `timestamp_desc`, `data_type`,
//! `parser`, `parser_chain`, `display_name`, `vss_store`) or any attribute
//! name. Operators: `==`, `!=`, `>`, `>=`, `<`, `<=`, `contains`, `regexp`.

use std::cmp::Ordering;

use regex::Regex;
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::models::ExtractedEvent;
use crate::utils::timestamps::parse_timestamp_micros;

#[derive(Debug, Clone)]
enum Operator {
    Equals,
    NotEquals,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
    Contains,
    Regexp(Regex),
}

#[derive(Debug, Clone)]
struct Clause {
    field: String,
    operator: Operator,
    value: String,
}

/// Compiled filter expression
#[derive(Debug, Clone)]
pub struct EventFilter {
    expression: String,
    clauses: Vec<Clause>,
}

impl EventFilter {
    pub fn parse(expression: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            EngineError::configuration(format!("Invalid filter expression: {} ({}).", expression, reason))
        };

        let clause_pattern = Regex::new(
            r#"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*(==|!=|>=|<=|>|<|\bcontains\b|\bregexp\b)\s*(?:"([^"]*)"|'([^']*)'|(\S+))\s*$"#,
        )
        .map_err(|e| invalid(&e.to_string()))?;

        let mut clauses = Vec::new();
        for text in split_clauses(expression) {
            let captures = clause_pattern
                .captures(&text)
                .ok_or_else(|| invalid(&format!("unsupported clause: {}", text.trim())))?;
            let field = captures[1].to_string();
            let value = captures
                .get(3)
                .or_else(|| captures.get(4))
                .or_else(|| captures.get(5))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            let operator = match &captures[2] {
                "==" => Operator::Equals,
                "!=" => Operator::NotEquals,
                ">" => Operator::Greater,
                ">=" => Operator::GreaterOrEqual,
                "<" => Operator::Less,
                "<=" => Operator::LessOrEqual,
                "contains" => Operator::Contains,
                _ => Operator::Regexp(Regex::new(&value).map_err(|e| invalid(&e.to_string()))?),
            };
            if field == "timestamp"
                && !matches!(operator, Operator::Contains | Operator::Regexp(_))
                && parse_timestamp_micros(&value).is_none()
            {
                return Err(invalid(&format!("unsupported timestamp: {}", value)));
            }
            clauses.push(Clause { field, operator, value });
        }

        if clauses.is_empty() {
            return Err(invalid("empty expression"));
        }
        Ok(EventFilter { expression: expression.to_string(), clauses })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Whether every clause holds for the event
    pub fn matches(&self, event: &ExtractedEvent) -> bool {
        self.clauses.iter().all(|clause| clause.matches(event))
    }
}

impl Clause {
    fn matches(&self, event: &ExtractedEvent) -> bool {
        if self.field == "timestamp" {
            return self.matches_timestamp(event.timestamp);
        }
        let Some(actual) = field_value(event, &self.field) else {
            return false;
        };

        match &self.operator {
            Operator::Equals => actual == self.value,
            Operator::NotEquals => actual != self.value,
            Operator::Contains => actual.contains(&self.value),
            Operator::Regexp(regex) => regex.is_match(&actual),
            ordering => {
                let order = match (actual.parse::<f64>(), self.value.parse::<f64>()) {
                    (Ok(left), Ok(right)) => left.partial_cmp(&right),
                    _ => Some(actual.as_str().cmp(self.value.as_str())),
                };
                order.map(|order| ordering_holds(ordering, order)).unwrap_or(false)
            }
        }
    }

    fn matches_timestamp(&self, timestamp: i64) -> bool {
        match &self.operator {
            Operator::Contains => timestamp.to_string().contains(&self.value),
            Operator::Regexp(regex) => regex.is_match(&timestamp.to_string()),
            operator => match parse_timestamp_micros(&self.value) {
                Some(expected) => ordering_holds(operator, timestamp.cmp(&expected)),
                None => false,
            },
        }
    }
}

fn ordering_holds(operator: &Operator, order: Ordering) -> bool {
    match operator {
        Operator::Equals => order == Ordering::Equal,
        Operator::NotEquals => order != Ordering::Equal,
        Operator::Greater => order == Ordering::Greater,
        Operator::GreaterOrEqual => order != Ordering::Less,
        Operator::Less => order == Ordering::Less,
        Operator::LessOrEqual => order != Ordering::Greater,
        Operator::Contains | Operator::Regexp(_) => false,
    }
}

fn field_value(event: &ExtractedEvent, field: &str) -> Option<String> {
    match field {
        "timestamp_desc" => Some(event.timestamp_desc.clone()),
        "data_type" => Some(event.data_type.clone()),
        "parser" => Some(event.parser_name.clone()),
        "parser_chain" => Some(event.parser_chain.clone()),
        "display_name" => Some(event.display_name.clone()),
        "vss_store" => event.vss_store.map(|store| store.to_string()),
        attribute => event.attributes.get(attribute).map(|value| match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }),
    }
}

/// Splits on the `and` keyword outside of quoted values
fn split_clauses(expression: &str) -> Vec<String> {
    let mut clauses = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    let words: Vec<&str> = expression.split(' ').collect();
    for word in words {
        if quote.is_none() && word.eq_ignore_ascii_case("and") {
            clauses.push(std::mem::take(&mut current));
            continue;
        }
        for c in word.chars() {
            match quote {
                Some(open) if c == open => quote = None,
                None if c == '\'' || c == '"' => quote = Some(c),
                _ => {}
            }
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    clauses.push(current);
    clauses.into_iter().filter(|clause| !clause.trim().is_empty()).collect()
}
