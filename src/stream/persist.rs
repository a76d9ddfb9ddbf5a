//! Append-only typed log backends.
//!
//! A persister stores a dense, 1-based-indexed sequence of entries with
//! strictly increasing epoch-microsecond timestamps. Iteration positions are
//! 0-based: the entry at position `p` carries index `p + 1`.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Index and timestamp of a published entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IdxTs {
    pub index: u64,
    pub us: u64,
}

/// One entry of a stream: 1-based index, epoch microseconds, payload.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Entry<E> {
    pub index: u64,
    pub us: u64,
    pub entry: E,
}

impl<E> Entry<E> {
    pub fn idx_ts(&self) -> IdxTs {
        IdxTs {
            index: self.index,
            us: self.us,
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("non-monotonic timestamp {us}us, last published at {last_us}us")]
    NonMonotonicTimestamp { us: u64, last_us: u64 },
    #[error("corrupt log {path} at line {line}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("log i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("log entry encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// When the file-backed log syncs appended entries to disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// fsync after every publish; `publish` returning means durable.
    #[default]
    Always,
    /// Flush to the OS only. Survives process crashes, not host crashes.
    Flush,
}

/// Append-only log of typed entries.
pub trait Persister<E>: Send + Sync {
    /// Appends an entry. Fails with `NonMonotonicTimestamp` when `us` does
    /// not strictly exceed the last published timestamp.
    fn publish(&mut self, entry: E, us: u64) -> Result<IdxTs, PersistError>;

    fn size(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn last_published(&self) -> Option<IdxTs>;

    /// Lazily iterates positions `[begin, end)`, both 0-based and clamped to
    /// the current size. Restartable: a pure function of persisted state.
    fn iterate(
        &self,
        begin: u64,
        end: u64,
    ) -> Box<dyn Iterator<Item = Result<Entry<E>, PersistError>> + Send + '_>;

    fn iterate_all(&self) -> Box<dyn Iterator<Item = Result<Entry<E>, PersistError>> + Send + '_> {
        self.iterate(0, self.size())
    }
}

/// In-memory log. Entries live in a `Vec`; iteration clones.
pub struct MemoryPersister<E> {
    entries: Vec<Entry<E>>,
}

impl<E> MemoryPersister<E> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<E> Default for MemoryPersister<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + Sync> Persister<E> for MemoryPersister<E> {
    fn publish(&mut self, entry: E, us: u64) -> Result<IdxTs, PersistError> {
        if let Some(last) = self.entries.last()
            && us <= last.us
        {
            return Err(PersistError::NonMonotonicTimestamp {
                us,
                last_us: last.us,
            });
        }
        let index = self.entries.len() as u64 + 1;
        self.entries.push(Entry {
            index,
            us,
            entry,
        });
        Ok(IdxTs { index, us })
    }

    fn size(&self) -> u64 {
        self.entries.len() as u64
    }

    fn last_published(&self) -> Option<IdxTs> {
        self.entries.last().map(Entry::idx_ts)
    }

    fn iterate(
        &self,
        begin: u64,
        end: u64,
    ) -> Box<dyn Iterator<Item = Result<Entry<E>, PersistError>> + Send + '_> {
        let size = self.entries.len() as u64;
        let begin = begin.min(size) as usize;
        let end = end.min(size) as usize;
        let range = if begin < end { begin..end } else { 0..0 };
        Box::new(self.entries[range].iter().cloned().map(Ok))
    }
}

/// Byte offset and timestamp of one persisted line.
#[derive(Clone, Copy, Debug)]
struct LineMeta {
    offset: u64,
    us: u64,
}

/// File-backed log: one self-describing JSON line per entry.
///
/// On open the file is scanned to rebuild the offset index and to validate
/// dense indices and strictly increasing timestamps. A partial or unparsable
/// last line is truncated away; damage anywhere earlier is an error.
#[derive(Debug)]
pub struct FilePersister<E> {
    path: PathBuf,
    writer: BufWriter<File>,
    lines: Vec<LineMeta>,
    sync_mode: SyncMode,
    _entry: PhantomData<fn() -> E>,
}

impl<E: Serialize + DeserializeOwned + Send + Sync> FilePersister<E> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        Self::open_with_sync_mode(path, SyncMode::default())
    }

    pub fn open_with_sync_mode(
        path: impl AsRef<Path>,
        sync_mode: SyncMode,
    ) -> Result<Self, PersistError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let lines = Self::scan(&path, &file)?;
        let mut writer = BufWriter::new(file);
        writer.seek(SeekFrom::End(0))?;
        Ok(Self {
            path,
            writer,
            lines,
            sync_mode,
            _entry: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rebuilds the line index, truncating a corrupt tail in place.
    fn scan(path: &Path, file: &File) -> Result<Vec<LineMeta>, PersistError> {
        let mut reader = BufReader::new(file.try_clone()?);
        reader.seek(SeekFrom::Start(0))?;

        let mut lines = Vec::new();
        let mut offset = 0u64;
        let mut buf = String::new();
        loop {
            buf.clear();
            let read = reader.read_line(&mut buf)?;
            if read == 0 {
                break;
            }
            let complete = buf.ends_with('\n');
            let parsed = if complete {
                serde_json::from_str::<Entry<E>>(buf.trim_end())
            } else {
                // Partial tail from an interrupted write.
                Err(<serde_json::Error as serde::de::Error>::custom("partial line"))
            };
            match parsed {
                Ok(entry) => {
                    let line_no = lines.len() + 1;
                    if entry.index != line_no as u64 {
                        return Err(PersistError::Corrupt {
                            path: path.to_path_buf(),
                            line: line_no,
                            reason: format!(
                                "expected index {line_no}, found {}",
                                entry.index
                            ),
                        });
                    }
                    if let Some(prev) = lines.last().map(|m: &LineMeta| m.us)
                        && entry.us <= prev
                    {
                        return Err(PersistError::Corrupt {
                            path: path.to_path_buf(),
                            line: line_no,
                            reason: format!(
                                "timestamp {}us not after previous {prev}us",
                                entry.us
                            ),
                        });
                    }
                    lines.push(LineMeta {
                        offset,
                        us: entry.us,
                    });
                    offset += read as u64;
                }
                Err(err) => {
                    // Only the very last line of the file may be damaged.
                    let mut rest = String::new();
                    reader.read_to_string(&mut rest)?;
                    if !rest.is_empty() {
                        return Err(PersistError::Corrupt {
                            path: path.to_path_buf(),
                            line: lines.len() + 1,
                            reason: err.to_string(),
                        });
                    }
                    tracing::warn!(
                        path = %path.display(),
                        line = lines.len() + 1,
                        "truncating corrupt log tail"
                    );
                    file.set_len(offset)?;
                    break;
                }
            }
        }
        Ok(lines)
    }
}

impl<E: Serialize + DeserializeOwned + Send + Sync> Persister<E> for FilePersister<E> {
    fn publish(&mut self, entry: E, us: u64) -> Result<IdxTs, PersistError> {
        if let Some(last) = self.lines.last()
            && us <= last.us
        {
            return Err(PersistError::NonMonotonicTimestamp {
                us,
                last_us: last.us,
            });
        }
        let index = self.lines.len() as u64 + 1;
        let record = Entry {
            index,
            us,
            entry,
        };
        let offset = self.writer.stream_position()?;
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        if self.sync_mode == SyncMode::Always {
            self.writer.get_ref().sync_data()?;
        }
        self.lines.push(LineMeta { offset, us });
        Ok(IdxTs { index, us })
    }

    fn size(&self) -> u64 {
        self.lines.len() as u64
    }

    fn last_published(&self) -> Option<IdxTs> {
        self.lines.last().map(|meta| IdxTs {
            index: self.lines.len() as u64,
            us: meta.us,
        })
    }

    fn iterate(
        &self,
        begin: u64,
        end: u64,
    ) -> Box<dyn Iterator<Item = Result<Entry<E>, PersistError>> + Send + '_> {
        let size = self.lines.len() as u64;
        let begin = begin.min(size);
        let end = end.min(size);
        if begin >= end {
            return Box::new(std::iter::empty());
        }
        let path = self.path.clone();
        let offset = self.lines[begin as usize].offset;
        let iter = match FileIter::new(path, offset, end - begin) {
            Ok(iter) => iter,
            Err(err) => return Box::new(std::iter::once(Err(err))),
        };
        Box::new(iter)
    }
}

/// Lazy reader over a closed range of lines, on a dedicated read handle.
struct FileIter<E> {
    reader: BufReader<File>,
    remaining: u64,
    path: PathBuf,
    line: usize,
    _entry: PhantomData<fn() -> E>,
}

impl<E: DeserializeOwned> FileIter<E> {
    fn new(path: PathBuf, offset: u64, count: u64) -> Result<Self, PersistError> {
        let file = File::open(&path)?;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(offset))?;
        Ok(Self {
            reader,
            remaining: count,
            path,
            line: 0,
            _entry: PhantomData,
        })
    }
}

impl<E: DeserializeOwned> Iterator for FileIter<E> {
    type Item = Result<Entry<E>, PersistError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.line += 1;
        let mut buf = String::new();
        match self.reader.read_line(&mut buf) {
            Ok(0) => Some(Err(PersistError::Corrupt {
                path: self.path.clone(),
                line: self.line,
                reason: "log shorter than its index".to_string(),
            })),
            Ok(_) => Some(
                serde_json::from_str::<Entry<E>>(buf.trim_end()).map_err(PersistError::from),
            ),
            Err(err) => Some(Err(PersistError::Io(err))),
        }
    }
}

/// The two persistence backends a stream can run on.
pub enum StreamPersister<E> {
    Memory(MemoryPersister<E>),
    File(FilePersister<E>),
}

impl<E: Clone + Serialize + DeserializeOwned + Send + Sync> Persister<E> for StreamPersister<E> {
    fn publish(&mut self, entry: E, us: u64) -> Result<IdxTs, PersistError> {
        match self {
            Self::Memory(p) => p.publish(entry, us),
            Self::File(p) => p.publish(entry, us),
        }
    }

    fn size(&self) -> u64 {
        match self {
            Self::Memory(p) => p.size(),
            Self::File(p) => p.size(),
        }
    }

    fn last_published(&self) -> Option<IdxTs> {
        match self {
            Self::Memory(p) => p.last_published(),
            Self::File(p) => p.last_published(),
        }
    }

    fn iterate(
        &self,
        begin: u64,
        end: u64,
    ) -> Box<dyn Iterator<Item = Result<Entry<E>, PersistError>> + Send + '_> {
        match self {
            Self::Memory(p) => p.iterate(begin, end),
            Self::File(p) => p.iterate(begin, end),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect<E: Clone + Send + Sync + 'static>(
        persister: &dyn Persister<E>,
        begin: u64,
        end: u64,
    ) -> Vec<Entry<E>> {
        persister
            .iterate(begin, end)
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn memory_publish_assigns_dense_indices() {
        let mut p = MemoryPersister::<String>::new();
        let a = p.publish("a".to_string(), 10).unwrap();
        let b = p.publish("b".to_string(), 20).unwrap();
        assert_eq!(a, IdxTs { index: 1, us: 10 });
        assert_eq!(b, IdxTs { index: 2, us: 20 });
        assert_eq!(p.size(), 2);
        assert_eq!(p.last_published(), Some(IdxTs { index: 2, us: 20 }));
    }

    #[test]
    fn memory_rejects_non_monotonic_timestamp() {
        let mut p = MemoryPersister::<String>::new();
        p.publish("x".to_string(), 500).unwrap();
        let err = p.publish("y".to_string(), 400).unwrap_err();
        assert!(matches!(
            err,
            PersistError::NonMonotonicTimestamp { us: 400, last_us: 500 }
        ));
        assert_eq!(p.size(), 1);
    }

    #[test]
    fn memory_iterate_is_half_open_and_clamped() {
        let mut p = MemoryPersister::<u32>::new();
        for i in 1..=5u32 {
            p.publish(i, i as u64 * 100).unwrap();
        }
        let mid = collect(&p, 1, 3);
        assert_eq!(mid.len(), 2);
        assert_eq!(mid[0].index, 2);
        assert_eq!(mid[1].index, 3);
        assert!(collect(&p, 4, 2).is_empty());
        assert_eq!(collect(&p, 0, 100).len(), 5);
    }

    #[test]
    fn file_round_trips_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.json");
        {
            let mut p = FilePersister::<String>::open(&path).unwrap();
            p.publish("one".to_string(), 10).unwrap();
            p.publish("two".to_string(), 20).unwrap();
            p.publish("three".to_string(), 30).unwrap();
        }
        let p = FilePersister::<String>::open(&path).unwrap();
        assert_eq!(p.size(), 3);
        assert_eq!(p.last_published(), Some(IdxTs { index: 3, us: 30 }));
        let entries = collect(&p, 0, 3);
        assert_eq!(
            entries,
            vec![
                Entry { index: 1, us: 10, entry: "one".to_string() },
                Entry { index: 2, us: 20, entry: "two".to_string() },
                Entry { index: 3, us: 30, entry: "three".to_string() },
            ]
        );
    }

    #[test]
    fn file_truncates_partial_tail_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.json");
        {
            let mut p = FilePersister::<String>::open(&path).unwrap();
            p.publish("ok".to_string(), 10).unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"{\"index\":2,\"us\":20,\"entry\":\"tru").unwrap();
        }
        let mut p = FilePersister::<String>::open(&path).unwrap();
        assert_eq!(p.size(), 1);
        // The log accepts appends again after truncation.
        p.publish("next".to_string(), 30).unwrap();
        assert_eq!(p.last_published(), Some(IdxTs { index: 2, us: 30 }));
    }

    #[test]
    fn file_rejects_corruption_before_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.json");
        std::fs::write(&path, b"garbage\n{\"index\":1,\"us\":10,\"entry\":\"x\"}\n").unwrap();
        let err = FilePersister::<String>::open(&path).unwrap_err();
        assert!(matches!(err, PersistError::Corrupt { line: 1, .. }));
    }

    #[test]
    fn file_rejects_non_monotonic_timestamps_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.json");
        std::fs::write(
            &path,
            b"{\"index\":1,\"us\":20,\"entry\":\"a\"}\n{\"index\":2,\"us\":20,\"entry\":\"b\"}\n",
        )
        .unwrap();
        let err = FilePersister::<String>::open(&path).unwrap_err();
        assert!(matches!(err, PersistError::Corrupt { line: 2, .. }));
    }

    #[test]
    fn file_iterate_reads_lazily_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.json");
        let mut p = FilePersister::<u32>::open(&path).unwrap();
        for i in 1..=10u32 {
            p.publish(i, i as u64).unwrap();
        }
        let window = collect(&p, 5, 8);
        assert_eq!(
            window.iter().map(|e| e.entry).collect::<Vec<_>>(),
            vec![6, 7, 8]
        );
    }
}
