//! Engine-backed replicated log storage.
//!
//! Entries for one replica group live under 21-byte big-endian keys
//! `node_id:u64 | group_id:u32 | sep:u8 | index:u64`, so ascending key order
//! is ascending index order within the group. The store keeps the snapshot
//! and hard state in memory (the consensus layer flushes them out-of-band)
//! and is the durable source of truth for entries only.
//!
//! A cold store is seeded with a dummy entry `{index: 0, term: 0}`. After a
//! snapshot install the entry at the snapshot index is retained as an anchor
//! so `term(snapshot.index)` stays answerable without the snapshot metadata.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use strata_engine::{KvEngine, ScanBounds, WriteBatch};
use tracing::warn;

use crate::storage::{Result, Storage, StorageError};
use crate::types::{ConfState, Entry, HardState, Snapshot};

const SEP_LIVE: u8 = b':';
const SEP_STOP: u8 = SEP_LIVE + 1;
/// Append batches larger than this commit incrementally to bound memory.
const MAX_WRITE_BATCH: usize = 1000;

struct Inner {
    hard_state: HardState,
    snapshot: Snapshot,
    /// 0 means "unknown, recompute by seek".
    first_index: u64,
    /// Reusable batch buffer; append, compact, and snapshot install are
    /// mutually exclusive through the surrounding lock.
    wb: WriteBatch,
}

/// Replicated log store for one `(node, group)` on a dedicated engine.
///
/// The lock protects `snapshot`, `hard_state`, the first-index cache, and
/// the write-batch slot; the last-index cache is an atomic because appends
/// run on the application thread while the consensus thread reads.
pub struct RaftLogStore {
    engine: Arc<dyn KvEngine>,
    node_id: u64,
    group_id: u32,
    inner: Mutex<Inner>,
    /// 0 means "unknown, recompute by seek".
    last_index: AtomicU64,
}

impl RaftLogStore {
    pub fn open(engine: Arc<dyn KvEngine>, node_id: u64, group_id: u32) -> Result<Self> {
        let store = Self {
            engine,
            node_id,
            group_id,
            inner: Mutex::new(Inner {
                hard_state: HardState::default(),
                snapshot: Snapshot::default(),
                first_index: 0,
                wb: WriteBatch::new(),
            }),
            last_index: AtomicU64::new(0),
        };

        match store.first_index() {
            Ok(_) => {}
            Err(StorageError::NotFound) => {
                // Cold start: seed the log with the dummy entry at term zero.
                store.reset(&[Entry::anchor(0, 0)])?;
            }
            Err(err) => return Err(err),
        }
        Ok(store)
    }

    fn entry_key(&self, index: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(21);
        key.extend_from_slice(&self.node_id.to_be_bytes());
        key.extend_from_slice(&self.group_id.to_be_bytes());
        key.push(SEP_LIVE);
        key.extend_from_slice(&index.to_be_bytes());
        key
    }

    fn entry_prefix_start(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(13);
        key.extend_from_slice(&self.node_id.to_be_bytes());
        key.extend_from_slice(&self.group_id.to_be_bytes());
        key.push(SEP_LIVE);
        key
    }

    /// Strict upper bound for every live key of this group.
    fn entry_prefix_end(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(13);
        key.extend_from_slice(&self.node_id.to_be_bytes());
        key.extend_from_slice(&self.group_id.to_be_bytes());
        key.push(SEP_STOP);
        key
    }

    fn parse_index(key: &[u8]) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&key[13..21]);
        u64::from_be_bytes(buf)
    }

    /// Seek the first live entry at or after `seek_to` (or at or before it
    /// when `reverse`). Returns the found index and, when `want_entry`, the
    /// decoded record.
    fn seek_entry(&self, seek_to: u64, reverse: bool, want_entry: bool) -> Result<(u64, Option<Entry>)> {
        let (start, end) = if reverse {
            (self.entry_prefix_start(), self.entry_key(seek_to))
        } else {
            (self.entry_key(seek_to), self.entry_prefix_end())
        };

        let mut found: Option<(Vec<u8>, Vec<u8>)> = None;
        self.engine
            .scan(&start, &end, ScanBounds::Closed, reverse, &mut |k, v| {
                found = Some((k.to_vec(), if want_entry { v.to_vec() } else { Vec::new() }));
                false
            })?;

        let Some((key, value)) = found else {
            return Err(StorageError::NotFound);
        };
        let index = Self::parse_index(&key);
        if !want_entry {
            return Ok((index, None));
        }
        let entry =
            Entry::unmarshal(&value).map_err(|err| StorageError::Codec(err.to_string()))?;
        Ok((index, Some(entry)))
    }

    fn cached_first_index(&self) -> Option<u64> {
        let guard = self.inner.lock().expect("log store lock");
        if !guard.snapshot.is_empty() {
            return Some(guard.snapshot.meta.index + 1);
        }
        if guard.first_index > 0 {
            return Some(guard.first_index);
        }
        None
    }

    fn set_cached_first_index(&self, index: u64) {
        self.inner.lock().expect("log store lock").first_index = index;
    }

    pub fn set_hard_state(&self, hs: HardState) {
        self.inner.lock().expect("log store lock").hard_state = hs;
    }

    pub fn hard_state(&self) -> HardState {
        self.inner.lock().expect("log store lock").hard_state
    }

    /// Append new entries, replacing any conflicting suffix.
    ///
    /// Entries already below the first live index are dropped; if the batch
    /// ends before the previous last index, the orphaned tail past it is
    /// range-deleted (leader overwrite). Batches beyond the watermark commit
    /// incrementally; a crash mid-append leaves a clean prefix which the
    /// consensus layer re-proposes.
    pub fn append(&self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let first = self.first_index()?;
        let entry_first = entries[0].index;
        let entry_last = entries[entries.len() - 1].index;
        if entry_last < first {
            // The whole batch was already compacted away.
            return Ok(());
        }
        let entries = if first > entry_first {
            &entries[(first - entry_first) as usize..]
        } else {
            entries
        };
        let prev_last = self.last_index()?;

        let mut guard = self.inner.lock().expect("log store lock");
        let mut wb = std::mem::take(&mut guard.wb);
        wb.clear();
        let res = self.write_entries(&mut wb, entries, prev_last);
        wb.clear();
        guard.wb = wb;
        let new_last = res?;
        self.last_index.store(new_last, Ordering::SeqCst);
        Ok(())
    }

    fn write_entries(&self, wb: &mut WriteBatch, entries: &[Entry], prev_last: u64) -> Result<u64> {
        let total = entries.len();
        for (i, entry) in entries.iter().enumerate() {
            wb.put(self.entry_key(entry.index), entry.marshal());
            if (i + 1) % MAX_WRITE_BATCH == 0 && i + MAX_WRITE_BATCH < total {
                self.engine.apply(wb)?;
                wb.clear();
            }
        }
        let new_last = entries[total - 1].index;
        if new_last < prev_last {
            wb.delete_range(self.entry_key(new_last + 1), self.entry_prefix_end());
        }
        self.engine.apply(wb)?;
        Ok(new_last)
    }

    /// Install a snapshot: record it, invalidate both index caches, and
    /// overwrite the retained anchor entry at the snapshot index. Entries
    /// below the snapshot are left for a subsequent `compact`.
    pub fn apply_snapshot(&self, snap: Snapshot) -> Result<()> {
        let mut guard = self.inner.lock().expect("log store lock");
        if guard.snapshot.meta.index >= snap.meta.index {
            return Err(StorageError::SnapOutOfDate);
        }
        let anchor = Entry::anchor(snap.meta.index, snap.meta.term);
        guard.snapshot = snap;
        guard.first_index = 0;
        self.last_index.store(0, Ordering::SeqCst);

        let mut wb = std::mem::take(&mut guard.wb);
        wb.clear();
        wb.put(self.entry_key(anchor.index), anchor.marshal());
        let res = self.engine.apply(&wb);
        wb.clear();
        guard.wb = wb;
        res?;
        Ok(())
    }

    /// Record a snapshot at `index` from the live log, for later retrieval
    /// via `snapshot()`. `conf_state` carries any membership change applied
    /// since the previous snapshot.
    pub fn create_snapshot(
        &self,
        index: u64,
        conf_state: Option<&ConfState>,
        data: Vec<u8>,
    ) -> Result<Snapshot> {
        let first = self.first_index()?;
        if index < first {
            return Err(StorageError::SnapOutOfDate);
        }

        let (found, entry) = self.seek_entry(index, false, true)?;
        if found != index {
            return Err(StorageError::NotFound);
        }
        let entry = entry.expect("seek_entry with want_entry returns a record");

        let mut guard = self.inner.lock().expect("log store lock");
        guard.snapshot.meta.index = index;
        guard.snapshot.meta.term = entry.term;
        if let Some(cs) = conf_state {
            guard.snapshot.meta.conf_state = cs.clone();
        }
        guard.snapshot.data = data;
        guard.first_index = 0;
        self.last_index.store(0, Ordering::SeqCst);
        Ok(guard.snapshot.clone())
    }

    /// Discard all entries below `compact_index`. Compacting at most up to
    /// the applied index is the caller's responsibility; an index past the
    /// last entry is accepted with a warning.
    pub fn compact(&self, compact_index: u64) -> Result<()> {
        // The compaction bound is the physically lowest live entry, not the
        // snapshot-derived logical first, so the entries a fresh snapshot
        // just covered can still be reclaimed.
        let (lowest, _) = self.seek_entry(0, false, false)?;
        if compact_index <= lowest {
            return Err(StorageError::Compacted);
        }
        let last = self.last_index()?;
        if compact_index > last {
            warn!(
                compact_index,
                last_index = last,
                "compact index is out of bound"
            );
        }

        let mut guard = self.inner.lock().expect("log store lock");
        guard.first_index = 0;
        let mut wb = std::mem::take(&mut guard.wb);
        wb.clear();
        wb.delete_range(self.entry_key(0), self.entry_key(compact_index));
        let res = self.engine.apply(&wb);
        wb.clear();
        guard.wb = wb;
        res?;
        Ok(())
    }

    /// Count of all live entries, anchor included.
    pub fn num_entries(&self) -> Result<usize> {
        let mut count = 0usize;
        self.engine.scan(
            &self.entry_key(0),
            &self.entry_prefix_end(),
            ScanBounds::RightOpen,
            false,
            &mut |_, _| {
                count += 1;
                true
            },
        )?;
        Ok(count)
    }

    pub fn close(&self) {
        self.engine.close();
    }

    /// Wipe and re-seed the log. Used at cold start.
    fn reset(&self, entries: &[Entry]) -> Result<()> {
        let mut guard = self.inner.lock().expect("log store lock");
        guard.first_index = 0;
        self.last_index.store(0, Ordering::SeqCst);

        let mut wb = std::mem::take(&mut guard.wb);
        wb.clear();
        wb.delete_range(self.entry_key(0), self.entry_prefix_end());
        for entry in entries {
            wb.put(self.entry_key(entry.index), entry.marshal());
        }
        let res = self.engine.apply(&wb);
        wb.clear();
        guard.wb = wb;
        res?;
        Ok(())
    }
}

impl Storage for RaftLogStore {
    fn initial_state(&self) -> Result<(HardState, ConfState)> {
        let guard = self.inner.lock().expect("log store lock");
        Ok((guard.hard_state, guard.snapshot.meta.conf_state.clone()))
    }

    fn entries(&self, lo: u64, hi: u64, max_bytes: u64) -> Result<Vec<Entry>> {
        let first = self.first_index()?;
        if lo < first {
            return Err(StorageError::Compacted);
        }
        let last = self.last_index()?;
        if hi > last + 1 {
            return Err(StorageError::Unavailable);
        }
        if hi <= lo {
            return Ok(Vec::new());
        }

        if hi - lo == 1 {
            // Single-entry window: direct point get.
            let raw = self
                .engine
                .get(&self.entry_key(lo))?
                .ok_or(StorageError::Unavailable)?;
            let entry =
                Entry::unmarshal(&raw).map_err(|err| StorageError::Codec(err.to_string()))?;
            return Ok(vec![entry]);
        }

        let mut out = Vec::new();
        let mut size = 0u64;
        let mut decode_err: Option<String> = None;
        self.engine.scan(
            &self.entry_key(lo),
            &self.entry_key(hi),
            ScanBounds::RightOpen,
            false,
            &mut |_, value| match Entry::unmarshal(value) {
                Ok(entry) => {
                    size += entry.encoded_len() as u64;
                    if size > max_bytes && !out.is_empty() {
                        return false;
                    }
                    out.push(entry);
                    true
                }
                Err(err) => {
                    decode_err = Some(err.to_string());
                    false
                }
            },
        )?;
        if let Some(err) = decode_err {
            return Err(StorageError::Codec(err));
        }
        Ok(out)
    }

    fn term(&self, idx: u64) -> Result<u64> {
        let first = self.first_index()?;
        if idx < first - 1 {
            return Err(StorageError::Compacted);
        }

        let (found, entry) = match self.seek_entry(idx, false, true) {
            Ok(res) => res,
            Err(StorageError::NotFound) => return Err(StorageError::Unavailable),
            Err(err) => return Err(err),
        };
        if idx < found {
            return Err(StorageError::Compacted);
        }
        Ok(entry.expect("seek_entry with want_entry returns a record").term)
    }

    fn first_index(&self) -> Result<u64> {
        if let Some(index) = self.cached_first_index() {
            return Ok(index);
        }
        // The lowest live key is the retained anchor (or the cold-start
        // dummy); the first usable index is one past it.
        let (index, _) = self.seek_entry(0, false, false)?;
        self.set_cached_first_index(index + 1);
        Ok(index + 1)
    }

    fn last_index(&self) -> Result<u64> {
        let cached = self.last_index.load(Ordering::SeqCst);
        if cached > 0 {
            return Ok(cached);
        }
        let (index, _) = self.seek_entry(u64::MAX, true, false)?;
        self.last_index.store(index, Ordering::SeqCst);
        Ok(index)
    }

    fn snapshot(&self) -> Result<Snapshot> {
        Ok(self.inner.lock().expect("log store lock").snapshot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SnapshotMeta;
    use strata_engine::{EngineConfig, RocksEngine};

    fn open_store() -> (tempfile::TempDir, RaftLogStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = RocksEngine::open(
            EngineConfig::new(dir.path().join("raftlog")).disable_wal(true),
        )
        .expect("open engine");
        let store = RaftLogStore::open(Arc::new(engine), 7, 3).expect("open store");
        (dir, store)
    }

    fn entry(index: u64, term: u64) -> Entry {
        Entry::normal(index, term, format!("cmd-{index}-{term}").into_bytes())
    }

    fn append_range(store: &RaftLogStore, lo: u64, hi: u64, term: u64) {
        let entries: Vec<Entry> = (lo..hi).map(|i| entry(i, term)).collect();
        store.append(&entries).unwrap();
    }

    #[test]
    fn cold_start_seeds_dummy_entry() {
        let (_dir, store) = open_store();
        assert_eq!(store.first_index().unwrap(), 1);
        assert_eq!(store.last_index().unwrap(), 0);
        assert_eq!(store.term(0).unwrap(), 0);
        assert_eq!(store.num_entries().unwrap(), 1);
    }

    #[test]
    fn append_and_read_back() {
        let (_dir, store) = open_store();
        append_range(&store, 1, 6, 1);

        assert_eq!(store.first_index().unwrap(), 1);
        assert_eq!(store.last_index().unwrap(), 5);

        let got = store.entries(1, 6, u64::MAX).unwrap();
        assert_eq!(got.len(), 5);
        assert_eq!(got[0], entry(1, 1));
        assert_eq!(got[4], entry(5, 1));

        // Single-entry window takes the point-get path.
        let one = store.entries(3, 4, u64::MAX).unwrap();
        assert_eq!(one, vec![entry(3, 1)]);
    }

    #[test]
    fn leader_overwrite_replaces_conflicting_suffix() {
        let (_dir, store) = open_store();
        store
            .append(&[entry(3, 1), entry(4, 1), entry(5, 1)])
            .unwrap();
        store.append(&[entry(4, 2), entry(5, 2)]).unwrap();

        let got = store.entries(3, 6, u64::MAX).unwrap();
        assert_eq!(got, vec![entry(3, 1), entry(4, 2), entry(5, 2)]);
        assert_eq!(store.term(4).unwrap(), 2);
    }

    #[test]
    fn shorter_overwrite_deletes_orphaned_tail() {
        let (_dir, store) = open_store();
        append_range(&store, 1, 8, 1);
        store.append(&[entry(3, 2)]).unwrap();

        assert_eq!(store.last_index().unwrap(), 3);
        assert!(matches!(
            store.entries(4, 5, u64::MAX),
            Err(StorageError::Unavailable)
        ));
        // Entries 4..8 are physically gone, not just masked.
        assert_eq!(store.num_entries().unwrap(), 4);
    }

    #[test]
    fn out_of_range_reads_are_rejected() {
        let (_dir, store) = open_store();
        append_range(&store, 1, 4, 1);
        store.compact(2).unwrap();

        assert!(matches!(
            store.entries(1, 3, u64::MAX),
            Err(StorageError::Compacted)
        ));
        assert!(matches!(
            store.entries(3, 9, u64::MAX),
            Err(StorageError::Unavailable)
        ));
    }

    #[test]
    fn max_bytes_still_returns_at_least_one_entry() {
        let (_dir, store) = open_store();
        append_range(&store, 1, 5, 1);

        let got = store.entries(1, 5, 1).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].index, 1);

        let all = store.entries(1, 5, u64::MAX).unwrap();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn append_below_first_is_dropped() {
        let (_dir, store) = open_store();
        append_range(&store, 1, 6, 1);
        store.compact(3).unwrap();
        assert_eq!(store.first_index().unwrap(), 4);

        // Wholly compacted batch is a no-op.
        store.append(&[entry(1, 1), entry(2, 1)]).unwrap();
        assert_eq!(store.last_index().unwrap(), 5);

        // Straddling batch keeps only the live suffix.
        store
            .append(&[entry(2, 2), entry(3, 2), entry(4, 2)])
            .unwrap();
        let got = store.entries(4, 5, u64::MAX).unwrap();
        assert_eq!(got, vec![entry(4, 2)]);
        assert_eq!(store.last_index().unwrap(), 4);
        // The compaction boundary still answers term lookups as the anchor.
        assert_eq!(store.term(3).unwrap(), 1);
    }

    #[test]
    fn compact_moves_first_index() {
        let (_dir, store) = open_store();
        append_range(&store, 1, 10, 1);
        store.compact(5).unwrap();

        // The entry at the boundary is retained as the anchor; the first
        // usable index is one past it.
        assert_eq!(store.first_index().unwrap(), 6);
        assert!(matches!(store.compact(4), Err(StorageError::Compacted)));
        assert_eq!(store.term(5).unwrap(), 1);
        assert!(matches!(store.term(3), Err(StorageError::Compacted)));
    }

    #[test]
    fn snapshot_then_compact_scenario() {
        let (_dir, store) = open_store();
        append_range(&store, 1, 11, 3);

        let snap = Snapshot {
            meta: SnapshotMeta {
                index: 10,
                term: 3,
                conf_state: ConfState {
                    voters: vec![7],
                    learners: Vec::new(),
                },
            },
            data: b"checkpoint-ref".to_vec(),
        };
        store.apply_snapshot(snap.clone()).unwrap();
        store.compact(10).unwrap();

        assert_eq!(store.first_index().unwrap(), 11);
        assert_eq!(store.term(10).unwrap(), 3);
        assert!(matches!(
            store.entries(5, 11, u64::MAX),
            Err(StorageError::Compacted)
        ));
        assert_eq!(store.snapshot().unwrap(), snap);
        // Only the anchor at the snapshot index remains on disk.
        assert_eq!(store.num_entries().unwrap(), 1);

        // Re-installing an older snapshot is rejected.
        assert!(matches!(
            store.apply_snapshot(snap),
            Err(StorageError::SnapOutOfDate)
        ));
    }

    #[test]
    fn create_snapshot_requires_live_entry() {
        let (_dir, store) = open_store();
        append_range(&store, 1, 6, 2);

        let snap = store
            .create_snapshot(4, Some(&ConfState { voters: vec![7], learners: vec![] }), b"ref".to_vec())
            .unwrap();
        assert_eq!(snap.meta.index, 4);
        assert_eq!(snap.meta.term, 2);
        assert_eq!(store.first_index().unwrap(), 5);

        assert!(matches!(
            store.create_snapshot(3, None, Vec::new()),
            Err(StorageError::SnapOutOfDate)
        ));
        assert!(matches!(
            store.create_snapshot(9, None, Vec::new()),
            Err(StorageError::NotFound)
        ));
    }

    #[test]
    fn indices_stay_monotone_across_mutations() {
        let (_dir, store) = open_store();
        let mut prev_first = store.first_index().unwrap();

        append_range(&store, 1, 20, 1);
        assert!(store.first_index().unwrap() >= prev_first);
        prev_first = store.first_index().unwrap();

        store.compact(7).unwrap();
        let first = store.first_index().unwrap();
        let last = store.last_index().unwrap();
        assert!(first >= prev_first);
        assert!(first <= last + 1);
        prev_first = first;

        store.create_snapshot(15, None, Vec::new()).unwrap();
        let first = store.first_index().unwrap();
        assert_eq!(first, 16);
        assert!(first >= prev_first);
        assert!(first <= store.last_index().unwrap() + 1);
    }

    #[test]
    fn hard_state_round_trips() {
        let (_dir, store) = open_store();
        let hs = HardState {
            term: 4,
            vote: 7,
            commit: 12,
        };
        store.set_hard_state(hs);
        let (got, _) = store.initial_state().unwrap();
        assert_eq!(got, hs);
    }

    #[test]
    fn large_append_commits_incrementally() {
        let (_dir, store) = open_store();
        let entries: Vec<Entry> = (1..=2500).map(|i| entry(i, 1)).collect();
        store.append(&entries).unwrap();

        assert_eq!(store.last_index().unwrap(), 2500);
        assert_eq!(store.entries(2400, 2501, u64::MAX).unwrap().len(), 101);
    }
}
