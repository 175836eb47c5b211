//! # raft-storage
//!
//! why: durable persistence for term, vote and log so a restarted node never contradicts itself
//! relations: written by raft-runtime's node actor before any reply; entry type from raft-core
//! what: Storage trait, FileStorage (json meta + json-lines log), InMemoryStorage for tests

use raft_core::LogEntry;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// trait for durable storage of raft state
///
/// every write must be durable when it returns ok; the runtime acknowledges
/// votes and appends only after that.
pub trait Storage {
    /// persist the current term and voted_for
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<u64>) -> io::Result<()>;

    /// load the persisted term and voted_for
    fn load_term_and_vote(&self) -> io::Result<(u64, Option<u64>)>;

    /// append entries to the log; the first must directly follow the last stored index
    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()>;

    /// load all log entries (for crash recovery)
    fn load_log(&self) -> io::Result<Vec<LogEntry>>;

    /// drop every entry at or after `from_index` (conflict resolution)
    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()>;

    /// clear all persisted state (for testing)
    fn clear(&mut self) -> io::Result<()>;
}

impl<S: Storage + ?Sized> Storage for Box<S> {
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<u64>) -> io::Result<()> {
        (**self).save_term_and_vote(term, voted_for)
    }

    fn load_term_and_vote(&self) -> io::Result<(u64, Option<u64>)> {
        (**self).load_term_and_vote()
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        (**self).append_entries(entries)
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        (**self).load_log()
    }

    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()> {
        (**self).truncate_log_from(from_index)
    }

    fn clear(&mut self) -> io::Result<()> {
        (**self).clear()
    }
}

/// Reasons a stored log cannot be trusted. Surfaced as `io::ErrorKind::InvalidData`.
#[derive(Debug, Error)]
pub enum LogCorruption {
    #[error("log line {line} is not a valid entry: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("log index gap: expected {expected}, found {found}")]
    Gap { expected: u64, found: u64 },
}

impl From<LogCorruption> for io::Error {
    fn from(err: LogCorruption) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

/// the first entry of a batch must follow `last_index`, and the batch itself must be contiguous
fn check_contiguous(last_index: u64, entries: &[LogEntry]) -> io::Result<()> {
    for (offset, entry) in entries.iter().enumerate() {
        let expected = last_index + 1 + offset as u64;
        if entry.index != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("non-contiguous append: expected index {expected}, got {}", entry.index),
            ));
        }
    }
    Ok(())
}

// -- file storage implementation --

/// file-based storage implementation using std::fs
///
/// stores raft state in a directory with:
/// - meta.json: term and voted_for, replaced atomically
/// - log.jsonl: one json entry per line, append-only except for truncation
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
    /// highest index in log.jsonl
    last_index: u64,
}

impl FileStorage {
    /// open (or create) the storage directory, repairing a torn log tail
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let mut storage = Self { dir, last_index: 0 };

        let (entries, torn) = storage.read_log()?;
        if torn {
            // a crash mid-append left a partial line; it was never acknowledged
            storage.rewrite_log(&entries)?;
        }
        storage.last_index = entries.last().map_or(0, |e| e.index);
        Ok(storage)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// get the path to the metadata file
    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    /// get the path to the log file
    fn log_path(&self) -> PathBuf {
        self.dir.join("log.jsonl")
    }

    /// parse log.jsonl; the flag reports a dropped partial last line
    fn read_log(&self) -> io::Result<(Vec<LogEntry>, bool)> {
        let path = self.log_path();
        if !path.exists() {
            return Ok((Vec::new(), false));
        }
        let mut contents = String::new();
        File::open(&path)?.read_to_string(&mut contents)?;
        Ok(parse_log(&contents)?)
    }

    /// replace log.jsonl wholesale: write temp file, fsync, rename
    fn rewrite_log(&self, entries: &[LogEntry]) -> io::Result<()> {
        let mut buf = Vec::new();
        for entry in entries {
            encode_line(entry, &mut buf)?;
        }
        write_atomic(&self.dir.join("log.tmp"), &self.log_path(), &buf)
    }
}

/// metadata structure for term and vote
#[derive(Serialize, Deserialize, Default)]
struct MetaData {
    term: u64,
    voted_for: Option<u64>,
}

fn encode_line(entry: &LogEntry, buf: &mut Vec<u8>) -> io::Result<()> {
    serde_json::to_writer(&mut *buf, entry).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    buf.push(b'\n');
    Ok(())
}

fn parse_log(contents: &str) -> Result<(Vec<LogEntry>, bool), LogCorruption> {
    let mut lines: Vec<&str> = contents.split_terminator('\n').collect();
    let mut torn = false;
    if !contents.is_empty() && !contents.ends_with('\n') {
        lines.pop();
        torn = true;
    }

    let mut entries: Vec<LogEntry> = Vec::with_capacity(lines.len());
    let last_line = lines.len();
    for (n, line) in lines.into_iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: LogEntry = match serde_json::from_str(line) {
            Ok(entry) => entry,
            Err(_) if n + 1 == last_line => {
                torn = true;
                break;
            }
            Err(source) => return Err(LogCorruption::Malformed { line: n + 1, source }),
        };
        let expected = entries.last().map_or(1, |e| e.index + 1);
        if entry.index != expected {
            return Err(LogCorruption::Gap {
                expected,
                found: entry.index,
            });
        }
        entries.push(entry);
    }
    Ok((entries, torn))
}

/// atomic write: write to temp file, fsync, rename, fsync the directory
fn write_atomic(temp_path: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(temp_path, path)?;
    match path.parent() {
        Some(dir) => sync_dir(dir),
        None => Ok(()),
    }
}

/// make created, renamed or removed directory entries durable
#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

// directories cannot be opened as files here; entries are durable with the file data
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

impl Storage for FileStorage {
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<u64>) -> io::Result<()> {
        let meta = MetaData { term, voted_for };
        let json = serde_json::to_vec_pretty(&meta).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_atomic(&self.dir.join("meta.tmp"), &self.meta_path(), &json)
    }

    fn load_term_and_vote(&self) -> io::Result<(u64, Option<u64>)> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok((0, None)); // default for new nodes
        }

        let mut contents = String::new();
        File::open(&path)?.read_to_string(&mut contents)?;

        let meta: MetaData =
            serde_json::from_str(&contents).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        Ok((meta.term, meta.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        let Some(last) = entries.last() else {
            return Ok(());
        };
        check_contiguous(self.last_index, entries)?;

        let mut buf = Vec::new();
        for entry in entries {
            encode_line(entry, &mut buf)?;
        }
        let path = self.log_path();
        let created = !path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&buf)?;
        file.sync_data()?;
        if created {
            sync_dir(&self.dir)?;
        }

        self.last_index = last.index;
        Ok(())
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        Ok(self.read_log()?.0)
    }

    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()> {
        if from_index > self.last_index {
            return Ok(());
        }
        let mut log = self.load_log()?;
        log.retain(|e| e.index < from_index);
        self.rewrite_log(&log)?;
        self.last_index = log.last().map_or(0, |e| e.index);
        Ok(())
    }

    fn clear(&mut self) -> io::Result<()> {
        for path in [self.meta_path(), self.log_path()] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        sync_dir(&self.dir)?;
        self.last_index = 0;
        Ok(())
    }
}

// -- in-memory storage implementation --

#[derive(Default)]
struct MemState {
    term: u64,
    voted_for: Option<u64>,
    log: Vec<LogEntry>,
}

/// in-memory storage for testing
///
/// clones share state, so a test can keep one clone, hand the other to a
/// node, and later "restart" the node on the same contents. writes can be
/// made to fail on demand.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    state: Arc<Mutex<MemState>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// make every subsequent write return an error (or stop doing so)
    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn state(&self) -> io::Result<MutexGuard<'_, MemState>> {
        self.state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "storage lock poisoned"))
    }

    fn writable(&self) -> io::Result<MutexGuard<'_, MemState>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        self.state()
    }
}

impl Storage for InMemoryStorage {
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<u64>) -> io::Result<()> {
        let mut state = self.writable()?;
        state.term = term;
        state.voted_for = voted_for;
        Ok(())
    }

    fn load_term_and_vote(&self) -> io::Result<(u64, Option<u64>)> {
        let state = self.state()?;
        Ok((state.term, state.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        let mut state = self.writable()?;
        let last_index = state.log.last().map_or(0, |e| e.index);
        check_contiguous(last_index, entries)?;
        state.log.extend(entries.iter().cloned());
        Ok(())
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        Ok(self.state()?.log.clone())
    }

    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()> {
        self.writable()?.log.retain(|e| e.index < from_index);
        Ok(())
    }

    fn clear(&mut self) -> io::Result<()> {
        *self.writable()? = MemState::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_contiguous_lines() {
        let (entries, torn) = parse_log("{\"term\":1,\"index\":1,\"command\":[]}\n{\"term\":1,\"index\":2,\"command\":[7]}\n").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].command, vec![7]);
        assert!(!torn);
    }

    #[test]
    fn parse_drops_partial_last_line() {
        let (entries, torn) = parse_log("{\"term\":1,\"index\":1,\"command\":[]}\n{\"term\":1,\"ind").unwrap();
        assert_eq!(entries.len(), 1);
        assert!(torn);
    }

    #[test]
    fn parse_rejects_garbage_before_the_tail() {
        let err = parse_log("garbage\n{\"term\":1,\"index\":1,\"command\":[]}\n").unwrap_err();
        assert!(matches!(err, LogCorruption::Malformed { line: 1, .. }));
    }

    #[test]
    fn parse_rejects_index_gap() {
        let err = parse_log("{\"term\":1,\"index\":1,\"command\":[]}\n{\"term\":1,\"index\":3,\"command\":[]}\n").unwrap_err();
        assert!(matches!(err, LogCorruption::Gap { expected: 2, found: 3 }));
    }

    #[test]
    fn corruption_maps_to_invalid_data() {
        let err: io::Error = LogCorruption::Gap { expected: 1, found: 2 }.into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn atomic_write_replaces_target_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("meta.json");
        let temp = dir.path().join("meta.tmp");

        write_atomic(&temp, &target, b"one").unwrap();
        write_atomic(&temp, &target, b"two").unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"two");
        assert!(!temp.exists());
    }

    #[cfg(unix)]
    #[test]
    fn directory_sync_fails_once_the_directory_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        assert!(sync_dir(&path).is_ok());

        dir.close().unwrap();

        assert_eq!(sync_dir(&path).unwrap_err().kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn first_append_creates_the_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        assert!(!storage.log_path().exists());

        storage.append_entries(&[LogEntry::new(1, 1, vec![1])]).unwrap();

        assert!(storage.log_path().exists());
        assert_eq!(FileStorage::new(dir.path()).unwrap().load_log().unwrap().len(), 1);
    }

    #[test]
    fn in_memory_clones_share_state() {
        let storage = InMemoryStorage::new();
        let mut handle = storage.clone();
        handle.save_term_and_vote(3, Some(2)).unwrap();
        assert_eq!(storage.load_term_and_vote().unwrap(), (3, Some(2)));
    }
}
