use std::io::Read;

use chrono::NaiveDate;
use log::debug;
use zip::ZipArchive;

use super::{FileEntry, ParseError, ParserMediator, ParserPlugin};
use crate::constants::MAX_ZIP_MEMBER_SIZE;

const ZIP_SIGNATURE: &[u8] = b"PK\x03\x04";

/// Hands every ZIP member back to the mediator as a nested entry
pub struct ZipParser;

impl ParserPlugin for ZipParser {
    fn name(&self) -> &'static str {
        "zip"
    }

    fn description(&self) -> &'static str {
        "Members of ZIP archives"
    }

    fn supports(&self, entry: &FileEntry, header: &[u8]) -> bool {
        !entry.is_directory() && header.starts_with(ZIP_SIGNATURE)
    }

    fn parse(&self, mediator: &mut ParserMediator<'_>, entry: &FileEntry) -> Result<(), ParseError> {
        let mut archive = ZipArchive::new(entry.open()?)?;

        for index in 0..archive.len() {
            let member = match archive.by_index(index) {
                Ok(member) => member,
                Err(e) => {
                    mediator.produce_error(entry, format!("unable to open archive member {}: {}", index, e));
                    continue;
                }
            };
            if member.is_dir() {
                continue;
            }

            let name = member.name().to_string();
            if member.size() > MAX_ZIP_MEMBER_SIZE {
                mediator.produce_error(
                    entry,
                    format!("archive member {} exceeds {} bytes", name, MAX_ZIP_MEMBER_SIZE),
                );
                continue;
            }

            let modified = zip_time_to_micros(member.last_modified());
            let mut data = Vec::with_capacity(member.size() as usize);
            if let Err(e) = member.take(MAX_ZIP_MEMBER_SIZE).read_to_end(&mut data) {
                mediator.produce_error(entry, format!("unable to read archive member {}: {}", name, e));
                continue;
            }

            debug!("Parsing archive member {} of {}", name, entry.display_name());
            let nested = FileEntry::from_memory(entry, &name, data, modified);
            mediator.parse_file_entry(&nested);
        }
        Ok(())
    }
}

/// MS-DOS date and time of a member, taken as UTC
fn zip_time_to_micros(time: zip::DateTime) -> Option<i64> {
    NaiveDate::from_ymd_opt(time.year() as i32, time.month() as u32, time.day() as u32)?
        .and_hms_opt(time.hour() as u32, time.minute() as u32, time.second() as u32)
        .map(|datetime| datetime.and_utc().timestamp_micros())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PathSpec, WorkItemDescriptor};
    use crate::parsers::{ParserOptions, ParserRegistry};
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_members_get_filestat_events_with_chain() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("archive.zip");
        let mut writer = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
        let options = zip::write::FileOptions::default()
            .last_modified_time(zip::DateTime::from_date_and_time(2020, 9, 13, 12, 26, 40).unwrap());
        writer.add_directory("docs/", options).unwrap();
        writer.start_file("docs/notes.txt", options).unwrap();
        writer.write_all(b"notes").unwrap();
        writer.finish().unwrap();

        let entry = FileEntry::from_descriptor(&WorkItemDescriptor {
            path_spec: PathSpec::os(path.to_string_lossy()),
            display_name: "/archive.zip".to_string(),
            vss_store: None,
            is_directory: false,
        })
        .unwrap();

        let registry = ParserRegistry::from_filter("zip,filestat").unwrap();
        let parser_options = ParserOptions::default();
        let mut mediator = ParserMediator::new(&registry, &parser_options, None);
        mediator.parse_file_entry(&entry);
        let (events, errors) = mediator.take_results();

        assert!(errors.is_empty());
        let member_events: Vec<_> = events.iter().filter(|event| event.parser_chain == "zip/filestat").collect();
        assert_eq!(member_events.len(), 1);
        assert_eq!(member_events[0].timestamp, 1_600_000_000_000_000);
        assert_eq!(member_events[0].display_name, "/archive.zip:/docs/notes.txt");
    }

    #[test]
    fn test_corrupt_archive_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.zip");
        std::fs::write(&path, b"PK\x03\x04 definitely not a zip").unwrap();
        let entry = FileEntry::from_descriptor(&WorkItemDescriptor {
            path_spec: PathSpec::os(path.to_string_lossy()),
            display_name: "/broken.zip".to_string(),
            vss_store: None,
            is_directory: false,
        })
        .unwrap();

        let registry = ParserRegistry::from_filter("zip").unwrap();
        let options = ParserOptions::default();
        let mut mediator = ParserMediator::new(&registry, &options, None);
        mediator.parse_file_entry(&entry);
        let (_, errors) = mediator.take_results();

        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].parser_chain, "zip");
        assert!(errors[0].description.starts_with("zip error"));
    }
}
