use crate::error::{Error, Result};
use crate::message::{Entry, ReplicaID};
use crate::storage::Storage;
use tracing::debug;

// LogStore is the replica's view of the replicated log. Entries below the
// compaction offset live only in the snapshot; `offset` and `offset_term`
// describe the last entry the snapshot covers. Every mutation goes to storage
// before memory is touched.
pub struct LogStore {
    storage: Box<dyn Storage>,
    entries: Vec<Entry>,
    offset: u64,
    offset_term: u64,
    commit_index: u64,
}

impl LogStore {
    // Load the log from storage. `snapshot` is the (index, term) of the
    // snapshot the storage holds, if any.
    pub fn open(storage: Box<dyn Storage>, snapshot: Option<(u64, u64)>) -> Result<LogStore> {
        let (offset, offset_term) = snapshot.unwrap_or((0, 0));
        let mut entries = storage.load_log()?;
        entries.retain(|e| e.index > offset);

        let mut expected = offset + 1;
        for entry in &entries {
            if entry.index != expected {
                return Err(Error::NonContiguous {
                    index: entry.index,
                    expected,
                });
            }
            expected += 1;
        }

        Ok(LogStore {
            storage,
            entries,
            offset,
            offset_term,
            commit_index: offset,
        })
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    pub(crate) fn save_term_and_vote(&mut self, term: u64, voted_for: Option<ReplicaID>) -> Result<()> {
        Ok(self.storage.save_term_and_vote(term, voted_for)?)
    }

    pub(crate) fn save_snapshot(&mut self, snapshot: &crate::snapshot::Snapshot) -> Result<()> {
        Ok(self.storage.save_snapshot(snapshot)?)
    }

    /// Index of the first entry still held in the log.
    pub fn first_index(&self) -> u64 {
        self.offset + 1
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn last_index(&self) -> u64 {
        self.offset + self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map_or(self.offset_term, |e| e.term)
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // Term of the entry at `index`. None if the entry was compacted away or
    // does not exist yet. The last compacted index still resolves.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.offset {
            return Some(self.offset_term);
        }
        self.entry(index).map(|e| e.term)
    }

    pub fn entry(&self, index: u64) -> Option<&Entry> {
        if index <= self.offset {
            return None;
        }
        self.entries.get((index - self.offset - 1) as usize)
    }

    /// Entries from `index` through the tip. Empty when `index` is past the
    /// tip; clamped to the first retained entry when it is compacted.
    pub fn entries_from(&self, index: u64) -> &[Entry] {
        let start = index.max(self.first_index()) - self.first_index();
        self.entries.get(start as usize..).unwrap_or(&[])
    }

    // Lowest index in the contiguous run of `term` entries ending at `index`.
    pub fn first_index_of_term(&self, term: u64, index: u64) -> u64 {
        let mut first = index;
        while first > self.first_index() && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }

    pub fn append(&mut self, entries: Vec<Entry>) -> Result<u64> {
        if entries.is_empty() {
            return Ok(self.last_index());
        }

        let mut expected = self.last_index() + 1;
        for entry in &entries {
            if entry.index != expected {
                return Err(Error::NonContiguous {
                    index: entry.index,
                    expected,
                });
            }
            expected += 1;
        }

        self.storage.append_entries(&entries)?;
        self.entries.extend(entries);
        Ok(self.last_index())
    }

    /// Discard entries with index >= `index`. Committed entries are never
    /// discarded; reaching this with such an index means the log has
    /// diverged on committed state and the node must not continue.
    pub fn truncate_from(&mut self, index: u64) -> Result<()> {
        assert!(
            index > self.commit_index,
            "truncating committed entry {} (commit index {})",
            index,
            self.commit_index
        );
        if index > self.last_index() {
            return Ok(());
        }

        self.storage.truncate_log_from(index)?;
        self.entries.truncate((index - self.first_index()) as usize);
        debug!(index, "truncated log");
        Ok(())
    }

    /// Discard entries with index < `index`, all of which must be committed
    /// and covered by a snapshot.
    pub fn compact_below(&mut self, index: u64) -> Result<()> {
        if index <= self.first_index() {
            return Ok(());
        }
        if index - 1 > self.commit_index {
            return Err(Error::CompactionBeyondCommit {
                index,
                commit_index: self.commit_index,
            });
        }

        let term = self.term_at(index - 1).unwrap_or(self.offset_term);
        self.storage.compact_log_below(index)?;
        self.entries.drain(..(index - self.first_index()) as usize);
        self.offset = index - 1;
        self.offset_term = term;
        debug!(offset = self.offset, "compacted log");
        Ok(())
    }

    /// Merge entries received from the leader whose predecessor is already
    /// known to match. Entries we already hold are skipped, the first
    /// conflicting entry truncates our tail, the rest is appended. Returns the
    /// new last index.
    pub fn merge(&mut self, entries: Vec<Entry>) -> Result<u64> {
        for (i, entry) in entries.iter().enumerate() {
            if entry.index <= self.offset {
                continue;
            }

            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.truncate_from(entry.index)?;
                    return self.append(entries[i..].to_vec());
                }
                None => return self.append(entries[i..].to_vec()),
            }
        }

        Ok(self.last_index())
    }

    /// Reset the log so that it starts right after a snapshot at
    /// (`index`, `term`). A matching suffix is kept; anything else goes.
    pub fn install_snapshot(&mut self, index: u64, term: u64) -> Result<()> {
        if self.term_at(index) == Some(term) && index <= self.last_index() {
            self.commit_index = self.commit_index.max(index);
            return self.compact_below(index + 1);
        }

        self.storage.truncate_log_from(self.first_index())?;
        self.entries.clear();
        self.offset = index;
        self.offset_term = term;
        self.commit_index = self.commit_index.max(index);
        Ok(())
    }

    pub(crate) fn commit_to(&mut self, index: u64) {
        let index = index.min(self.last_index());
        if index > self.commit_index {
            self.commit_index = index;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn open() -> LogStore {
        LogStore::open(Box::new(MemoryStorage::new()), None).unwrap()
    }

    fn entries(range: std::ops::RangeInclusive<u64>, term: u64) -> Vec<Entry> {
        range.map(|i| Entry::command(i, term, vec![i as u8])).collect()
    }

    #[test]
    fn empty_log_has_sentinel() {
        let log = open();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(1), None);
        assert!(log.entries_from(1).is_empty());
    }

    #[test]
    fn append_rejects_gaps() {
        let mut log = open();
        assert_eq!(log.append(entries(1..=3, 1)).unwrap(), 3);

        let err = log.append(entries(5..=5, 1)).unwrap_err();
        assert!(matches!(err, Error::NonContiguous { index: 5, expected: 4 }));
        assert_eq!(log.last_index(), 3);
    }

    #[test]
    fn merge_overwrites_conflicting_tail() {
        let mut log = open();
        log.append(entries(1..=2, 1)).unwrap();
        log.append(entries(3..=5, 2)).unwrap();

        let mut incoming = entries(2..=2, 1);
        incoming.extend(entries(3..=4, 3));
        assert_eq!(log.merge(incoming).unwrap(), 4);
        assert_eq!(log.term_at(3), Some(3));
        assert_eq!(log.term_at(5), None);
    }

    #[test]
    fn merge_is_idempotent() {
        let mut log = open();
        log.append(entries(1..=4, 1)).unwrap();
        assert_eq!(log.merge(entries(2..=3, 1)).unwrap(), 4);
        assert_eq!(log.len(), 4);
    }

    #[test]
    #[should_panic(expected = "truncating committed entry")]
    fn truncating_committed_entries_panics() {
        let mut log = open();
        log.append(entries(1..=3, 1)).unwrap();
        log.commit_to(2);
        let _ = log.truncate_from(2);
    }

    #[test]
    fn compaction_keeps_offset_term() {
        let mut log = open();
        log.append(entries(1..=3, 1)).unwrap();
        log.append(entries(4..=6, 2)).unwrap();
        log.commit_to(5);

        log.compact_below(5).unwrap();
        assert_eq!(log.first_index(), 5);
        assert_eq!(log.term_at(4), Some(2));
        assert_eq!(log.term_at(3), None);
        assert_eq!(log.entries_from(2).first().map(|e| e.index), Some(5));

        let err = log.compact_below(7).unwrap_err();
        assert!(matches!(err, Error::CompactionBeyondCommit { .. }));
    }

    #[test]
    fn first_index_of_term_walks_back() {
        let mut log = open();
        log.append(entries(1..=2, 1)).unwrap();
        log.append(entries(3..=6, 3)).unwrap();
        assert_eq!(log.first_index_of_term(3, 6), 3);
        assert_eq!(log.first_index_of_term(1, 2), 1);
    }

    #[test]
    fn snapshot_install_keeps_matching_suffix() {
        let mut log = open();
        log.append(entries(1..=6, 1)).unwrap();
        log.install_snapshot(4, 1).unwrap();
        assert_eq!(log.first_index(), 5);
        assert_eq!(log.last_index(), 6);
        assert_eq!(log.commit_index(), 4);

        log.install_snapshot(10, 2).unwrap();
        assert!(log.is_empty());
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.commit_index(), 10);
    }

    #[test]
    fn reopen_drops_entries_covered_by_snapshot() {
        let mut storage = MemoryStorage::new();
        storage.append_entries(&entries(1..=5, 1)).unwrap();

        let log = LogStore::open(Box::new(storage), Some((3, 1))).unwrap();
        assert_eq!(log.first_index(), 4);
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.commit_index(), 3);
    }
}
