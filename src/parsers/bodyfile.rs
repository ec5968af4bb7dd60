use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};

use serde_json::Value;

use super::{EventData, FileEntry, ParseError, ParserMediator, ParserPlugin};

const BODYFILE_EXTENSIONS: [&str; 3] = [".body", ".bodyfile", ".mactime"];

/// Fields of a bodyfile 3.x line: MD5|name|inode|mode|UID|GID|size|atime|mtime|ctime|crtime
const FIELD_COUNT: usize = 11;

/// Sleuthkit bodyfile (mactime) timelines
pub struct BodyfileParser;

#[derive(Debug, PartialEq)]
struct BodyfileLine {
    md5: String,
    name: String,
    inode: String,
    mode: String,
    uid: u64,
    gid: u64,
    size: u64,
    /// atime, mtime, ctime, crtime in microseconds; 0 means unset
    times: [i64; 4],
}

impl ParserPlugin for BodyfileParser {
    fn name(&self) -> &'static str {
        "bodyfile"
    }

    fn description(&self) -> &'static str {
        "Sleuthkit bodyfile timelines"
    }

    fn supports(&self, entry: &FileEntry, header: &[u8]) -> bool {
        if entry.is_directory() {
            return false;
        }
        let name = entry.name().to_lowercase();
        if BODYFILE_EXTENSIONS.iter().any(|extension| name.ends_with(extension)) {
            return true;
        }
        looks_like_bodyfile(header)
    }

    fn parse(&self, mediator: &mut ParserMediator<'_>, entry: &FileEntry) -> Result<(), ParseError> {
        let reader = BufReader::new(entry.open()?);
        for (index, line) in reader.lines().enumerate() {
            let line_number = index + 1;
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    mediator.produce_error(entry, format!("unable to read line {}: {}", line_number, e));
                    break;
                }
            };
            let trimmed = line.trim_end_matches('\r');
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some(parsed) = parse_line(trimmed) else {
                mediator.produce_error(entry, format!("unable to parse line {}", line_number));
                continue;
            };
            produce_line_events(mediator, entry, parsed);
        }
        Ok(())
    }
}

fn produce_line_events(mediator: &mut ParserMediator<'_>, entry: &FileEntry, line: BodyfileLine) {
    let mut attributes = BTreeMap::new();
    attributes.insert("filename".to_string(), Value::from(line.name));
    attributes.insert("inode".to_string(), Value::from(line.inode));
    attributes.insert("mode".to_string(), Value::from(line.mode));
    attributes.insert("uid".to_string(), Value::from(line.uid));
    attributes.insert("gid".to_string(), Value::from(line.gid));
    attributes.insert("size".to_string(), Value::from(line.size));
    if line.md5 != "0" {
        attributes.insert("md5".to_string(), Value::from(line.md5));
    }

    let descriptions = [
        "Last Access Time",
        "Content Modification Time",
        "Metadata Modification Time",
        "Creation Time",
    ];
    for (timestamp, timestamp_desc) in line.times.into_iter().zip(descriptions) {
        if timestamp == 0 {
            continue;
        }
        mediator.produce_event(
            entry,
            EventData {
                timestamp,
                timestamp_desc,
                data_type: "fs:bodyfile",
                attributes: attributes.clone(),
            },
        );
    }
}

/// Whether the first line of the header parses as a bodyfile line
fn looks_like_bodyfile(header: &[u8]) -> bool {
    let text = String::from_utf8_lossy(header);
    text.lines()
        .map(|line| line.trim_end_matches('\r'))
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| parse_line(line).is_some())
        .unwrap_or(false)
}

/// Splits a line whose name field may itself contain `|`
fn parse_line(line: &str) -> Option<BodyfileLine> {
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() < FIELD_COUNT {
        return None;
    }
    let tail = &fields[fields.len() - 9..];
    let name = fields[1..fields.len() - 9].join("|");

    Some(BodyfileLine {
        md5: fields[0].to_string(),
        name,
        inode: tail[0].to_string(),
        mode: tail[1].to_string(),
        uid: tail[2].trim().parse().ok()?,
        gid: tail[3].trim().parse().ok()?,
        size: tail[4].trim().parse().ok()?,
        times: [
            parse_time(tail[5])?,
            parse_time(tail[6])?,
            parse_time(tail[7])?,
            parse_time(tail[8])?,
        ],
    })
}

/// Seconds, optionally fractional, to microseconds
fn parse_time(value: &str) -> Option<i64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<i64>() {
        return seconds.checked_mul(1_000_000);
    }
    let seconds = value.parse::<f64>().ok()?;
    if seconds.is_finite() {
        Some((seconds * 1_000_000.0).round() as i64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        let line = parse_line("0|/etc/passwd|1234|-rw-r--r--|0|0|845|1600000000|1600000100|1600000200|0").unwrap();
        assert_eq!(line.name, "/etc/passwd");
        assert_eq!(line.size, 845);
        assert_eq!(line.times, [1_600_000_000_000_000, 1_600_000_100_000_000, 1_600_000_200_000_000, 0]);
    }

    #[test]
    fn test_name_with_separator_and_fractional_time() {
        let line = parse_line("d41d8cd9|/tmp/a|b|7|r/rrw-r--r--|1000|1000|0|1.5|0|0|0").unwrap();
        assert_eq!(line.name, "/tmp/a|b");
        assert_eq!(line.md5, "d41d8cd9");
        assert_eq!(line.times[0], 1_500_000);
    }

    #[test]
    fn test_malformed_lines() {
        assert!(parse_line("not a bodyfile line").is_none());
        assert!(parse_line("0|/x|1|m|uid|0|0|0|0|0|0").is_none());
    }

    #[test]
    fn test_signature_check() {
        assert!(looks_like_bodyfile(b"# comment\n0|/x|1|m|0|0|0|0|0|0|0\n"));
        assert!(!looks_like_bodyfile(b"hello world\n"));
        assert!(!looks_like_bodyfile(b""));
    }
}
