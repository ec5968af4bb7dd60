use std::fs::{self, File};
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::models::{PathSpec, TypeIndicator, WorkItemDescriptor};
use crate::utils::timestamps::system_time_to_micros;

/// Readable and seekable stream handed to parsers
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// File system metadata of an entry, timestamps in microseconds
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileStat {
    pub size: u64,
    pub is_directory: bool,
    pub modified: Option<i64>,
    pub accessed: Option<i64>,
    /// Metadata (inode) change time
    pub changed: Option<i64>,
    pub created: Option<i64>,
    pub inode: Option<u64>,
    pub mode: Option<u32>,
}

impl FileStat {
    pub fn from_metadata(metadata: &fs::Metadata) -> Self {
        let mut stat = FileStat {
            size: metadata.len(),
            is_directory: metadata.is_dir(),
            modified: metadata.modified().ok().and_then(system_time_to_micros),
            accessed: metadata.accessed().ok().and_then(system_time_to_micros),
            created: metadata.created().ok().and_then(system_time_to_micros),
            ..FileStat::default()
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            stat.changed = Some(metadata.ctime() * 1_000_000 + metadata.ctime_nsec() / 1_000);
            stat.inode = Some(metadata.ino());
            stat.mode = Some(metadata.mode());
        }

        stat
    }
}

#[derive(Debug, Clone)]
struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

#[derive(Debug, Clone)]
enum EntrySource {
    Os(PathBuf),
    /// Region of a storage media image starting at `offset`
    Volume { image: PathBuf, offset: u64 },
    Memory(SharedBytes),
    Unreadable(String),
}

/// One item a worker extracts events from.
///
/// Entries are re-opened from their path specification in the worker
/// process; nested entries (archive members) live in memory.
#[derive(Debug, Clone)]
pub struct FileEntry {
    path_spec: PathSpec,
    display_name: String,
    vss_store: Option<u32>,
    name: String,
    stat: Option<FileStat>,
    source: EntrySource,
}

impl FileEntry {
    /// Re-opens the item a collector described
    pub fn from_descriptor(descriptor: &WorkItemDescriptor) -> io::Result<Self> {
        let path_spec = descriptor.path_spec.clone();
        let (name, stat, source) = match &path_spec.type_indicator {
            TypeIndicator::Os => {
                let path = path_spec
                    .location
                    .as_ref()
                    .map(PathBuf::from)
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "OS path specification without location"))?;
                let metadata = fs::symlink_metadata(&path)?;
                let name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_else(|| path.to_string_lossy().to_string());
                (name, Some(FileStat::from_metadata(&metadata)), EntrySource::Os(path))
            }
            TypeIndicator::FileSystem | TypeIndicator::Partition => {
                let image = path_spec.os_path().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "volume path specification without image")
                })?;
                let offset = path_spec.effective_start_offset().unwrap_or(0);
                (
                    descriptor.display_name.clone(),
                    None,
                    EntrySource::Volume { image, offset },
                )
            }
            other => (
                descriptor.display_name.clone(),
                None,
                EntrySource::Unreadable(format!("no reader for {} path specifications", other)),
            ),
        };

        Ok(FileEntry {
            path_spec,
            display_name: descriptor.display_name.clone(),
            vss_store: descriptor.vss_store,
            name,
            stat,
            source,
        })
    }

    /// Entry nested inside `parent`, such as an archive member
    pub fn from_memory(parent: &FileEntry, member: &str, data: Vec<u8>, modified: Option<i64>) -> Self {
        let location = format!("/{}", member.trim_start_matches('/'));
        let name = Path::new(member)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| member.to_string());
        let stat = FileStat {
            size: data.len() as u64,
            modified,
            ..FileStat::default()
        };

        FileEntry {
            path_spec: PathSpec::nested(
                TypeIndicator::Other("ZIP".to_string()),
                Some(&location),
                parent.path_spec.clone(),
            ),
            display_name: format!("{}:{}", parent.display_name, location),
            vss_store: parent.vss_store,
            name,
            stat: Some(stat),
            source: EntrySource::Memory(SharedBytes(Arc::new(data))),
        }
    }

    pub fn path_spec(&self) -> &PathSpec {
        &self.path_spec
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn vss_store(&self) -> Option<u32> {
        self.vss_store
    }

    /// File name used for name-based parser selection
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stat(&self) -> Option<&FileStat> {
        self.stat.as_ref()
    }

    pub fn is_directory(&self) -> bool {
        self.stat.as_ref().map(|stat| stat.is_directory).unwrap_or(false)
    }

    /// OS path of entries read straight from the host file system
    pub fn os_path(&self) -> Option<&Path> {
        match &self.source {
            EntrySource::Os(path) => Some(path),
            _ => None,
        }
    }

    pub fn open(&self) -> io::Result<Box<dyn ReadSeek>> {
        match &self.source {
            EntrySource::Os(path) => Ok(Box::new(File::open(path)?)),
            EntrySource::Volume { image, offset } => {
                Ok(Box::new(OffsetReader::new(File::open(image)?, *offset)?))
            }
            EntrySource::Memory(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
            EntrySource::Unreadable(reason) => {
                Err(io::Error::new(io::ErrorKind::Unsupported, reason.clone()))
            }
        }
    }

    /// Up to `size` bytes from the start of the entry
    pub fn read_header(&self, size: usize) -> io::Result<Vec<u8>> {
        let mut header = Vec::with_capacity(size);
        self.open()?.take(size as u64).read_to_end(&mut header)?;
        Ok(header)
    }
}

/// Presents the part of a stream after `offset` as a stream of its own
pub struct OffsetReader<R> {
    inner: R,
    offset: u64,
}

impl<R: Seek> OffsetReader<R> {
    pub fn new(mut inner: R, offset: u64) -> io::Result<Self> {
        inner.seek(SeekFrom::Start(offset))?;
        Ok(OffsetReader { inner, offset })
    }
}

impl<R: Read> Read for OffsetReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: Seek> Seek for OffsetReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let absolute = match pos {
            SeekFrom::Start(position) => self.inner.seek(SeekFrom::Start(self.offset + position))?,
            other => self.inner.seek(other)?,
        };
        if absolute < self.offset {
            self.inner.seek(SeekFrom::Start(self.offset))?;
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before start of volume"));
        }
        Ok(absolute - self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn descriptor(path_spec: PathSpec, display_name: &str) -> WorkItemDescriptor {
        WorkItemDescriptor {
            path_spec,
            display_name: display_name.to_string(),
            vss_store: None,
            is_directory: false,
        }
    }

    #[test]
    fn test_os_entry_has_stat() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("file1.txt");
        fs::write(&path, b"Test content 1").unwrap();

        let entry = FileEntry::from_descriptor(&descriptor(PathSpec::os(path.to_string_lossy()), "file1.txt")).unwrap();
        assert_eq!(entry.name(), "file1.txt");
        assert_eq!(entry.stat().unwrap().size, 14);
        assert!(entry.stat().unwrap().modified.is_some());
        assert_eq!(entry.read_header(4).unwrap(), b"Test");
    }

    #[test]
    fn test_volume_entry_reads_from_offset() {
        let temp_dir = TempDir::new().unwrap();
        let image = temp_dir.path().join("disk.raw");
        let mut data = vec![0u8; 1024];
        data[512..516].copy_from_slice(b"VOL1");
        fs::write(&image, &data).unwrap();

        let partition = PathSpec::nested(TypeIndicator::Partition, Some("/p1"), PathSpec::os(image.to_string_lossy()))
            .with_start_offset(512);
        let spec = PathSpec::nested(TypeIndicator::FileSystem, Some("/"), partition);
        let entry = FileEntry::from_descriptor(&descriptor(spec, "disk.raw:p1")).unwrap();

        assert_eq!(entry.read_header(4).unwrap(), b"VOL1");
        let mut reader = entry.open().unwrap();
        assert_eq!(reader.seek(SeekFrom::Start(2)).unwrap(), 2);
        assert!(reader.seek(SeekFrom::Current(-10)).is_err());
    }

    #[test]
    fn test_unreadable_entry_fails_to_open() {
        let store = PathSpec::nested(TypeIndicator::ShadowCopyStore, Some("/vss1"), PathSpec::os("/case/disk.raw"));
        let entry = FileEntry::from_descriptor(&descriptor(store, "disk.raw:vss1")).unwrap();
        assert_eq!(entry.open().err().map(|e| e.kind()), Some(io::ErrorKind::Unsupported));
    }

    #[test]
    fn test_memory_entry_display_name() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("logs.zip");
        fs::write(&path, b"PK").unwrap();
        let parent = FileEntry::from_descriptor(&descriptor(PathSpec::os(path.to_string_lossy()), "/logs.zip")).unwrap();

        let member = FileEntry::from_memory(&parent, "var/log/auth.body", b"data".to_vec(), Some(5));
        assert_eq!(member.display_name(), "/logs.zip:/var/log/auth.body");
        assert_eq!(member.name(), "auth.body");
        assert_eq!(member.read_header(16).unwrap(), b"data");
        assert!(member.os_path().is_none());
    }
}
