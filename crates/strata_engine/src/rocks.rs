//! rocksdb-backed implementation of the engine facade.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use rocksdb::checkpoint::Checkpoint;
use rocksdb::merge_operator::MergeOperands;
use rocksdb::{Direction, IteratorMode, Options, WriteOptions, DB};
use tracing::info;

use crate::{EngineError, KvEngine, ScanBounds, WriteBatch, WriteOp, U64_ADD_MERGER};

/// Construction options for a `RocksEngine`.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    /// Disable the rocksdb write-ahead log. The raft log engine runs this
    /// way: its durability contract is flush + snapshot recovery, and a lost
    /// tail is re-synced from consensus peers.
    pub disable_wal: bool,
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            disable_wal: false,
        }
    }

    pub fn disable_wal(mut self, disable: bool) -> Self {
        self.disable_wal = disable;
        self
    }
}

fn u64_add_merge(
    _key: &[u8],
    existing: Option<&[u8]>,
    operands: &MergeOperands,
) -> Option<Vec<u8>> {
    let mut total = decode_le_u64(existing);
    for op in operands.iter() {
        total = total.wrapping_add(decode_le_u64(Some(op)));
    }
    Some(total.to_le_bytes().to_vec())
}

fn decode_le_u64(value: Option<&[u8]>) -> u64 {
    match value {
        Some(v) if v.len() == 8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(v);
            u64::from_le_bytes(buf)
        }
        _ => 0,
    }
}

/// Engine facade over a rocksdb instance.
///
/// The handle is closed by dropping the database under a write lock; readers
/// fence on the lock and observe `Closed` afterwards.
pub struct RocksEngine {
    db: RwLock<Option<DB>>,
    data_dir: PathBuf,
    disable_wal: bool,
}

impl RocksEngine {
    pub fn open(cfg: EngineConfig) -> Result<Self, EngineError> {
        std::fs::create_dir_all(&cfg.data_dir)
            .map_err(|err| EngineError::Io(err.to_string()))?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_merge_operator_associative(U64_ADD_MERGER, u64_add_merge);
        let db = DB::open(&opts, &cfg.data_dir)?;
        info!(dir = %cfg.data_dir.display(), "engine opened");

        Ok(Self {
            db: RwLock::new(Some(db)),
            data_dir: cfg.data_dir,
            disable_wal: cfg.disable_wal,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn write_options(&self) -> WriteOptions {
        let mut wo = WriteOptions::default();
        wo.disable_wal(self.disable_wal);
        wo
    }
}

impl KvEngine for RocksEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let guard = self.db.read().expect("engine lock");
        let db = guard.as_ref().ok_or(EngineError::Closed)?;
        Ok(db.get(key)?)
    }

    fn multi_get(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>, EngineError> {
        let guard = self.db.read().expect("engine lock");
        let db = guard.as_ref().ok_or(EngineError::Closed)?;
        let mut out = Vec::with_capacity(keys.len());
        for res in db.multi_get(keys) {
            out.push(res?);
        }
        Ok(out)
    }

    fn exists(&self, key: &[u8]) -> Result<bool, EngineError> {
        Ok(self.get(key)?.is_some())
    }

    fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        bounds: ScanBounds,
        reverse: bool,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), EngineError> {
        let guard = self.db.read().expect("engine lock");
        let db = guard.as_ref().ok_or(EngineError::Closed)?;

        let mode = if reverse {
            IteratorMode::From(end, Direction::Reverse)
        } else {
            IteratorMode::From(start, Direction::Forward)
        };

        for item in db.iterator(mode) {
            let (key, value) = item?;
            if reverse {
                // The seek may land exactly on `end`; honor its inclusion mode.
                if key.as_ref() > end {
                    continue;
                }
                if key.as_ref() == end && bounds != ScanBounds::Closed {
                    continue;
                }
                if key.as_ref() < start || (key.as_ref() == start && bounds == ScanBounds::BothOpen)
                {
                    break;
                }
            } else {
                if key.as_ref() == start && bounds == ScanBounds::BothOpen {
                    continue;
                }
                if key.as_ref() > end || (key.as_ref() == end && bounds != ScanBounds::Closed) {
                    break;
                }
            }
            if !visit(&key, &value) {
                break;
            }
        }
        Ok(())
    }

    fn apply(&self, batch: &WriteBatch) -> Result<(), EngineError> {
        let guard = self.db.read().expect("engine lock");
        let db = guard.as_ref().ok_or(EngineError::Closed)?;

        let mut wb = rocksdb::WriteBatch::default();
        for op in batch.ops() {
            match op {
                WriteOp::Put { key, value } => wb.put(key, value),
                WriteOp::Delete { key } => wb.delete(key),
                WriteOp::DeleteRange { start, end } => wb.delete_range(start, end),
                WriteOp::Merge { key, value } => wb.merge(key, value),
            }
        }
        db.write_opt(wb, &self.write_options())?;
        Ok(())
    }

    fn checkpoint(&self, dir: &Path) -> Result<(), EngineError> {
        let guard = self.db.read().expect("engine lock");
        let db = guard.as_ref().ok_or(EngineError::Closed)?;
        let ck = Checkpoint::new(db)?;
        ck.create_checkpoint(dir)?;
        Ok(())
    }

    fn estimate_size(&self) -> Result<u64, EngineError> {
        let guard = self.db.read().expect("engine lock");
        let db = guard.as_ref().ok_or(EngineError::Closed)?;
        Ok(db
            .property_int_value("rocksdb.estimate-live-data-size")?
            .unwrap_or(0))
    }

    fn estimate_num_keys(&self) -> Result<u64, EngineError> {
        let guard = self.db.read().expect("engine lock");
        let db = guard.as_ref().ok_or(EngineError::Closed)?;
        Ok(db
            .property_int_value("rocksdb.estimate-num-keys")?
            .unwrap_or(0))
    }

    fn compact(&self, start: &[u8], end: &[u8]) -> Result<(), EngineError> {
        let guard = self.db.read().expect("engine lock");
        let db = guard.as_ref().ok_or(EngineError::Closed)?;
        db.compact_range(Some(start), Some(end));
        Ok(())
    }

    fn close(&self) {
        let mut guard = self.db.write().expect("engine lock");
        if guard.take().is_some() {
            info!(dir = %self.data_dir.display(), "engine closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.db.read().expect("engine lock").is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksEngine) {
        let dir = tempfile::tempdir().expect("tempdir");
        let eng = RocksEngine::open(EngineConfig::new(dir.path().join("db"))).expect("open");
        (dir, eng)
    }

    #[test]
    fn batch_commits_atomically() {
        let (_dir, eng) = open_temp();
        let mut batch = WriteBatch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.put(b"b".to_vec(), b"2".to_vec());
        batch.delete(b"a".to_vec());
        eng.apply(&batch).unwrap();

        assert_eq!(eng.get(b"a").unwrap(), None);
        assert_eq!(eng.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn delete_range_removes_half_open_interval() {
        let (_dir, eng) = open_temp();
        let mut batch = WriteBatch::new();
        for k in [b"k1", b"k2", b"k3", b"k4"] {
            batch.put(k.to_vec(), b"v".to_vec());
        }
        eng.apply(&batch).unwrap();

        let mut batch = WriteBatch::new();
        batch.delete_range(b"k2".to_vec(), b"k4".to_vec());
        eng.apply(&batch).unwrap();

        assert!(eng.exists(b"k1").unwrap());
        assert!(!eng.exists(b"k2").unwrap());
        assert!(!eng.exists(b"k3").unwrap());
        assert!(eng.exists(b"k4").unwrap());
    }

    #[test]
    fn scan_honors_bounds_and_direction() {
        let (_dir, eng) = open_temp();
        let mut batch = WriteBatch::new();
        for k in [b"a", b"b", b"c", b"d"] {
            batch.put(k.to_vec(), k.to_vec());
        }
        eng.apply(&batch).unwrap();

        let collect = |bounds, reverse| {
            let mut keys = Vec::new();
            eng.scan(b"a", b"c", bounds, reverse, &mut |k, _| {
                keys.push(k.to_vec());
                true
            })
            .unwrap();
            keys
        };

        assert_eq!(collect(ScanBounds::Closed, false), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(collect(ScanBounds::RightOpen, false), vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(collect(ScanBounds::BothOpen, false), vec![b"b".to_vec()]);
        assert_eq!(collect(ScanBounds::Closed, true), vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
        assert_eq!(collect(ScanBounds::RightOpen, true), vec![b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn scan_stops_when_visitor_returns_false() {
        let (_dir, eng) = open_temp();
        let mut batch = WriteBatch::new();
        for k in [b"a", b"b", b"c"] {
            batch.put(k.to_vec(), k.to_vec());
        }
        eng.apply(&batch).unwrap();

        let mut seen = 0;
        eng.scan(b"a", b"c", ScanBounds::Closed, false, &mut |_, _| {
            seen += 1;
            false
        })
        .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn merge_accumulates_u64() {
        let (_dir, eng) = open_temp();
        let mut batch = WriteBatch::new();
        batch.merge_u64_add(b"cnt".to_vec(), 3);
        batch.merge_u64_add(b"cnt".to_vec(), 4);
        eng.apply(&batch).unwrap();

        let raw = eng.get(b"cnt").unwrap().expect("counter present");
        assert_eq!(u64::from_le_bytes(raw.try_into().unwrap()), 7);

        // A wrapping -1 expressed as two's complement decrements the counter.
        let mut batch = WriteBatch::new();
        batch.merge_u64_add(b"cnt".to_vec(), u64::MAX);
        eng.apply(&batch).unwrap();
        let raw = eng.get(b"cnt").unwrap().expect("counter present");
        assert_eq!(u64::from_le_bytes(raw.try_into().unwrap()), 6);
    }

    #[test]
    fn checkpoint_clones_visible_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let eng = RocksEngine::open(EngineConfig::new(dir.path().join("db"))).expect("open");
        let mut batch = WriteBatch::new();
        batch.put(b"k".to_vec(), b"v".to_vec());
        eng.apply(&batch).unwrap();

        let ck_dir = dir.path().join("ck");
        eng.checkpoint(&ck_dir).unwrap();
        eng.close();

        let restored = RocksEngine::open(EngineConfig::new(&ck_dir)).expect("open checkpoint");
        assert_eq!(restored.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn close_fences_reads() {
        let (_dir, eng) = open_temp();
        eng.close();
        assert!(eng.is_closed());
        assert!(matches!(eng.get(b"k"), Err(EngineError::Closed)));
        // Idempotent.
        eng.close();
    }
}
