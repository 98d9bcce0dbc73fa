//! Durable state of a replica: current term and vote, the log, and the latest
//! snapshot.
//!
//! Every mutating call must be durable when it returns. The replica performs
//! the write first and only then updates memory or replies, so a failed write
//! is never observable by peers.
use crate::message::{Entry, ReplicaID};
use crate::snapshot::Snapshot;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

pub trait Storage: Send {
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<ReplicaID>) -> io::Result<()>;

    fn load_term_and_vote(&self) -> io::Result<(u64, Option<ReplicaID>)>;

    fn append_entries(&mut self, entries: &[Entry]) -> io::Result<()>;

    fn load_log(&self) -> io::Result<Vec<Entry>>;

    /// Drop entries with index >= `from_index`.
    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()>;

    /// Drop entries with index < `index`.
    fn compact_log_below(&mut self, index: u64) -> io::Result<()>;

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> io::Result<()>;

    fn load_snapshot(&self) -> io::Result<Option<Snapshot>>;
}

// -- file storage --

/// Stores state as JSON documents in a directory:
/// - meta.json: term and voted_for
/// - log.json: retained log entries
/// - snapshot.json: latest snapshot
///
/// Each write goes to a temp file that is synced and renamed over the target.
pub struct FileStorage {
    dir: PathBuf,
}

#[derive(Serialize, Deserialize, Default)]
struct MetaData {
    term: u64,
    voted_for: Option<ReplicaID>,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<FileStorage> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FileStorage { dir })
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log.json")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join("snapshot.json")
    }

    fn write_atomic<T: Serialize>(&self, target: &Path, value: &T) -> io::Result<()> {
        let json = serde_json::to_vec(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let temp_path = target.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&temp_path, target)?;

        Ok(())
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> io::Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }

        let mut contents = String::new();
        File::open(path)?.read_to_string(&mut contents)?;
        let value = serde_json::from_str(&contents).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        Ok(Some(value))
    }

    fn rewrite_log<F>(&mut self, keep: F) -> io::Result<()>
    where
        F: Fn(&Entry) -> bool,
    {
        let mut log = self.load_log()?;
        log.retain(|e| keep(e));
        self.write_atomic(&self.log_path(), &log)
    }
}

impl Storage for FileStorage {
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<ReplicaID>) -> io::Result<()> {
        self.write_atomic(&self.meta_path(), &MetaData { term, voted_for })
    }

    fn load_term_and_vote(&self) -> io::Result<(u64, Option<ReplicaID>)> {
        let meta: MetaData = self.read_json(&self.meta_path())?.unwrap_or_default();
        Ok((meta.term, meta.voted_for))
    }

    fn append_entries(&mut self, entries: &[Entry]) -> io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        // Whole-file rewrite keeps the temp+rename atomicity simple.
        let mut log = self.load_log()?;
        log.extend(entries.iter().cloned());
        self.write_atomic(&self.log_path(), &log)
    }

    fn load_log(&self) -> io::Result<Vec<Entry>> {
        Ok(self.read_json(&self.log_path())?.unwrap_or_default())
    }

    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()> {
        self.rewrite_log(|e| e.index < from_index)
    }

    fn compact_log_below(&mut self, index: u64) -> io::Result<()> {
        self.rewrite_log(|e| e.index >= index)
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> io::Result<()> {
        self.write_atomic(&self.snapshot_path(), snapshot)
    }

    fn load_snapshot(&self) -> io::Result<Option<Snapshot>> {
        self.read_json(&self.snapshot_path())
    }
}

// -- in-memory storage --

/// Keeps everything in memory. Nothing survives the process, which makes it
/// the storage of choice for simulations.
#[derive(Default, Clone)]
pub struct MemoryStorage {
    term: u64,
    voted_for: Option<ReplicaID>,
    log: Vec<Entry>,
    snapshot: Option<Snapshot>,
}

impl MemoryStorage {
    pub fn new() -> MemoryStorage {
        MemoryStorage::default()
    }
}

impl Storage for MemoryStorage {
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<ReplicaID>) -> io::Result<()> {
        self.term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    fn load_term_and_vote(&self) -> io::Result<(u64, Option<ReplicaID>)> {
        Ok((self.term, self.voted_for))
    }

    fn append_entries(&mut self, entries: &[Entry]) -> io::Result<()> {
        self.log.extend(entries.iter().cloned());
        Ok(())
    }

    fn load_log(&self) -> io::Result<Vec<Entry>> {
        Ok(self.log.clone())
    }

    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()> {
        self.log.retain(|e| e.index < from_index);
        Ok(())
    }

    fn compact_log_below(&mut self, index: u64) -> io::Result<()> {
        self.log.retain(|e| e.index >= index);
        Ok(())
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> io::Result<()> {
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn load_snapshot(&self) -> io::Result<Option<Snapshot>> {
        Ok(self.snapshot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotManager;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn entries(range: std::ops::RangeInclusive<u64>, term: u64) -> Vec<Entry> {
        range.map(|i| Entry::command(i, term, vec![i as u8])).collect()
    }

    #[test]
    fn memory_storage_truncates_and_compacts() {
        let mut storage = MemoryStorage::new();
        storage.append_entries(&entries(1..=5, 1)).unwrap();

        storage.truncate_log_from(5).unwrap();
        storage.compact_log_below(2).unwrap();

        let indices: Vec<u64> = storage.load_log().unwrap().iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![2, 3, 4]);
    }

    #[test]
    fn file_storage_persists_term_and_vote() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        assert_eq!(storage.load_term_and_vote().unwrap(), (0, None));
        storage.save_term_and_vote(7, Some(3)).unwrap();
        assert_eq!(storage.load_term_and_vote().unwrap(), (7, Some(3)));
    }

    #[test]
    fn file_storage_survives_restart() {
        let dir = tempdir().unwrap();
        let snapshot = SnapshotManager::new(4, None).create_snapshot(2, 1, Bytes::from_static(b"abc"), vec![]);

        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.save_term_and_vote(10, Some(1)).unwrap();
            storage.append_entries(&entries(1..=4, 10)).unwrap();
            storage.save_snapshot(&snapshot).unwrap();
            storage.compact_log_below(3).unwrap();
            storage.truncate_log_from(4).unwrap();
        }

        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(storage.load_term_and_vote().unwrap(), (10, Some(1)));
        assert_eq!(storage.load_log().unwrap(), entries(3..=3, 10));
        assert_eq!(storage.load_snapshot().unwrap(), Some(snapshot));
    }
}
