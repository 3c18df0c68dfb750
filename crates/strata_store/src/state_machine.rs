//! Deterministic command applier for one shard.
//!
//! A committed log entry carries a request envelope `u64 ts | frame`, where
//! the frame is a length-prefixed array of byte strings: element 0 is the
//! operator name, element 1 the namespaced key. The applier strips and
//! verifies the namespace, dispatches the operator against the data store,
//! and commits all of the entry's mutations in one engine batch together
//! with the persisted applied-index marker, so each entry executes at most
//! once and results are reproducible on replay.
//!
//! Apply is serial per shard and must stay deterministic: the entry
//! timestamp is the only time input, and nothing here consults the clock or
//! any randomness.

use strata_engine::WriteBatch;

use crate::errors::{Result, StoreError};
use crate::store::KvStore;

const APPLIED_INDEX_KEY: &[u8] = b"m:applied_index";

/// Result of applying one command, translated to a wire reply by the
/// front-end.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Ok,
    Int(i64),
    Bytes(Vec<u8>),
    Null,
}

/// Parsed SET modifier flags.
#[derive(Clone, Copy, Debug, Default)]
pub struct SetFlags {
    pub ex_secs: i64,
    pub create_only: bool,
    pub update_only: bool,
}

/// Parse `EX seconds`, `NX`, `XX` in any order. NX and XX are mutually
/// exclusive; a non-positive EX is rejected.
pub fn parse_set_flags(opts: &[Vec<u8>]) -> Result<SetFlags> {
    let mut flags = SetFlags::default();
    let mut seen_cond = false;
    let mut i = 0;
    while i < opts.len() {
        let op = opts[i].to_ascii_uppercase();
        match op.as_slice() {
            b"NX" => {
                if seen_cond {
                    return Err(StoreError::InvalidArgs);
                }
                flags.create_only = true;
                seen_cond = true;
            }
            b"XX" => {
                if seen_cond {
                    return Err(StoreError::InvalidArgs);
                }
                flags.update_only = true;
                seen_cond = true;
            }
            b"EX" => {
                if i + 1 >= opts.len() {
                    return Err(StoreError::InvalidArgs);
                }
                flags.ex_secs = parse_i64(&opts[i + 1]).map_err(|_| StoreError::InvalidArgs)?;
                if flags.ex_secs <= 0 {
                    return Err(StoreError::InvalidTtl);
                }
                i += 1;
            }
            _ => return Err(StoreError::InvalidArgs),
        }
        i += 1;
    }
    Ok(flags)
}

/// Parse the two-argument `EX seconds` form used by SETIFEQ.
pub fn parse_ex_secs(ex: &[u8], secs: &[u8]) -> Result<i64> {
    if !ex.eq_ignore_ascii_case(b"EX") {
        return Err(StoreError::InvalidArgs);
    }
    let n = parse_i64(secs).map_err(|_| StoreError::InvalidArgs)?;
    if n <= 0 {
        return Err(StoreError::InvalidTtl);
    }
    Ok(n)
}

pub fn parse_i64(raw: &[u8]) -> std::result::Result<i64, ()> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(())
}

/// Strip the `<namespace>:` prefix from a wire key.
pub fn cut_namespace(namespace: &str, raw: &[u8]) -> Result<Vec<u8>> {
    let pos = raw
        .iter()
        .position(|b| *b == b':')
        .ok_or(StoreError::InvalidKey)?;
    if &raw[..pos] != namespace.as_bytes() {
        return Err(StoreError::WrongNamespace);
    }
    Ok(raw[pos + 1..].to_vec())
}

/// Encode a command frame: `u32 count`, then `u32 len | bytes` per element.
pub fn encode_command(argv: &[Vec<u8>]) -> Vec<u8> {
    let mut size = 4;
    for arg in argv {
        size += 4 + arg.len();
    }
    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&(argv.len() as u32).to_be_bytes());
    for arg in argv {
        out.extend_from_slice(&(arg.len() as u32).to_be_bytes());
        out.extend_from_slice(arg);
    }
    out
}

pub fn decode_command(data: &[u8]) -> anyhow::Result<Vec<Vec<u8>>> {
    let mut offset = 0usize;
    let count = read_u32_at(data, &mut offset)? as usize;
    let mut argv = Vec::with_capacity(count);
    for _ in 0..count {
        let len = read_u32_at(data, &mut offset)? as usize;
        anyhow::ensure!(offset + len <= data.len(), "short command element");
        argv.push(data[offset..offset + len].to_vec());
        offset += len;
    }
    Ok(argv)
}

/// Wrap a command frame with the consensus-level deterministic timestamp.
pub fn encode_request(ts: u64, frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + frame.len());
    out.extend_from_slice(&ts.to_be_bytes());
    out.extend_from_slice(frame);
    out
}

pub fn decode_request(data: &[u8]) -> anyhow::Result<(u64, &[u8])> {
    anyhow::ensure!(data.len() >= 8, "short request envelope");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[..8]);
    Ok((u64::from_be_bytes(buf), &data[8..]))
}

fn read_u32_at(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

/// Command applier bound 1-to-1 to a shard's data store.
pub struct StateMachine {
    store: KvStore,
    namespace: String,
    applied_index: u64,
}

impl StateMachine {
    pub fn open(store: KvStore, namespace: String) -> Result<Self> {
        let applied_index = match store.engine().get(APPLIED_INDEX_KEY)? {
            Some(raw) if raw.len() == 8 => u64::from_be_bytes(raw.try_into().unwrap()),
            _ => 0,
        };
        Ok(Self {
            store,
            namespace,
            applied_index,
        })
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    /// Apply one committed entry. Entries at or below the applied index are
    /// skipped. Operator failures are per-entry results: the mutation batch
    /// is discarded but the applied marker still advances, so replay stays
    /// at-most-once.
    pub fn apply(&mut self, index: u64, ts: u64, frame: &[u8]) -> Result<Value> {
        if index <= self.applied_index {
            return Ok(Value::Null);
        }

        let mut wb = WriteBatch::new();
        let result = if frame.is_empty() {
            Ok(Value::Null)
        } else {
            self.execute(&mut wb, ts, frame)
        };
        if result.is_err() {
            wb.clear();
        }
        wb.put(APPLIED_INDEX_KEY.to_vec(), index.to_be_bytes().to_vec());
        self.store.engine().apply(&wb)?;
        self.applied_index = index;
        result
    }

    fn cut(&self, raw: &[u8]) -> Result<Vec<u8>> {
        cut_namespace(&self.namespace, raw)
    }

    fn execute(&self, wb: &mut WriteBatch, ts: u64, frame: &[u8]) -> Result<Value> {
        let argv = decode_command(frame).map_err(|_| StoreError::InvalidArgs)?;
        if argv.len() < 2 {
            return Err(StoreError::InvalidArgs);
        }
        let name = argv[0].to_ascii_uppercase();
        let argc = argv.len();

        match name.as_slice() {
            b"SET" => {
                if argc < 3 {
                    return Err(StoreError::InvalidArgs);
                }
                let key = self.cut(&argv[1])?;
                let flags = parse_set_flags(&argv[3..])?;
                let v = self.store.set(
                    wb,
                    ts,
                    &key,
                    &argv[2],
                    flags.ex_secs,
                    flags.create_only,
                    flags.update_only,
                )?;
                Ok(Value::Int(v))
            }
            b"SETNX" => {
                if argc != 3 {
                    return Err(StoreError::InvalidArgs);
                }
                let key = self.cut(&argv[1])?;
                Ok(Value::Int(self.store.set_nx(wb, ts, &key, &argv[2])?))
            }
            b"SETIFEQ" => {
                if argc != 4 && argc != 6 {
                    return Err(StoreError::InvalidArgs);
                }
                let ex_secs = if argc == 6 {
                    parse_ex_secs(&argv[4], &argv[5])?
                } else {
                    0
                };
                let key = self.cut(&argv[1])?;
                let v = self
                    .store
                    .set_if_eq(wb, ts, &key, &argv[2], &argv[3], ex_secs)?;
                Ok(Value::Int(v))
            }
            b"DELIFEQ" => {
                if argc != 3 {
                    return Err(StoreError::InvalidArgs);
                }
                let key = self.cut(&argv[1])?;
                Ok(Value::Int(self.store.del_if_eq(wb, ts, &key, &argv[2])?))
            }
            b"GETSET" => {
                if argc != 3 {
                    return Err(StoreError::InvalidArgs);
                }
                let key = self.cut(&argv[1])?;
                match self.store.get_set(wb, ts, &key, &argv[2])? {
                    Some(prior) => Ok(Value::Bytes(prior)),
                    None => Ok(Value::Null),
                }
            }
            b"MSET" => {
                if argc < 3 || (argc - 1) % 2 != 0 {
                    return Err(StoreError::InvalidArgs);
                }
                let mut pairs = Vec::with_capacity((argc - 1) / 2);
                for chunk in argv[1..].chunks(2) {
                    pairs.push((self.cut(&chunk[0])?, chunk[1].clone()));
                }
                self.store.mset(wb, ts, &pairs)?;
                Ok(Value::Ok)
            }
            b"INCR" => {
                if argc != 2 {
                    return Err(StoreError::InvalidArgs);
                }
                let key = self.cut(&argv[1])?;
                Ok(Value::Int(self.store.incr_by(wb, ts, &key, 1)?))
            }
            b"INCRBY" => {
                if argc != 3 {
                    return Err(StoreError::InvalidArgs);
                }
                let delta = parse_i64(&argv[2]).map_err(|_| StoreError::NotInteger)?;
                let key = self.cut(&argv[1])?;
                Ok(Value::Int(self.store.incr_by(wb, ts, &key, delta)?))
            }
            b"APPEND" => {
                if argc != 3 {
                    return Err(StoreError::InvalidArgs);
                }
                let key = self.cut(&argv[1])?;
                Ok(Value::Int(self.store.append(wb, ts, &key, &argv[2])?))
            }
            b"DEL" => {
                let mut keys = Vec::with_capacity(argc - 1);
                for raw in &argv[1..] {
                    keys.push(self.cut(raw)?);
                }
                Ok(Value::Int(self.store.del(wb, ts, &keys)?))
            }
            b"SETRANGE" => {
                if argc != 4 {
                    return Err(StoreError::InvalidArgs);
                }
                let offset = parse_i64(&argv[2]).map_err(|_| StoreError::InvalidArgs)?;
                let key = self.cut(&argv[1])?;
                Ok(Value::Int(self.store.set_range(wb, ts, &key, offset, &argv[3])?))
            }
            b"SETBIT" => {
                if argc != 4 {
                    return Err(StoreError::InvalidArgs);
                }
                let offset = parse_i64(&argv[2]).map_err(|_| StoreError::InvalidArgs)?;
                let bit = parse_i64(&argv[3]).map_err(|_| StoreError::InvalidArgs)?;
                let key = self.cut(&argv[1])?;
                Ok(Value::Int(self.store.set_bit(wb, ts, &key, offset, bit)?))
            }
            b"BITCLEAR" => {
                if argc != 2 {
                    return Err(StoreError::InvalidArgs);
                }
                let key = self.cut(&argv[1])?;
                Ok(Value::Int(self.store.bit_clear(wb, ts, &key)?))
            }
            b"PFADD" => {
                if argc < 3 {
                    return Err(StoreError::InvalidArgs);
                }
                let key = self.cut(&argv[1])?;
                Ok(Value::Int(self.store.pf_add(wb, ts, &key, &argv[2..])?))
            }
            b"PFCOUNT" => {
                // Restricted to a single key: merging sketches across shards
                // is rejected at propose time.
                if argc != 2 {
                    return Err(StoreError::InvalidArgs);
                }
                let key = self.cut(&argv[1])?;
                Ok(Value::Int(self.store.pf_count(ts, &key)?))
            }
            _ => Err(StoreError::InvalidArgs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use strata_engine::{EngineConfig, KvEngine, RocksEngine, ScanBounds};

    fn open_sm(dir: &std::path::Path) -> StateMachine {
        let engine = RocksEngine::open(EngineConfig::new(dir)).expect("open engine");
        let store = KvStore::new(Arc::new(engine));
        StateMachine::open(store, "default".to_string()).expect("open sm")
    }

    fn cmd(parts: &[&[u8]]) -> Vec<u8> {
        encode_command(&parts.iter().map(|p| p.to_vec()).collect::<Vec<_>>())
    }

    fn engine_contents(engine: &Arc<dyn KvEngine>) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        engine
            .scan(&[0u8], &[0xFFu8; 64], ScanBounds::Closed, false, &mut |k, v| {
                out.push((k.to_vec(), v.to_vec()));
                true
            })
            .unwrap();
        out
    }

    #[test]
    fn set_then_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = open_sm(dir.path());

        let res = sm.apply(1, 10, &cmd(&[b"SET", b"default:foo", b"bar"])).unwrap();
        assert_eq!(res, Value::Int(1));
        assert_eq!(sm.applied_index(), 1);
        assert_eq!(sm.store().get(b"foo").unwrap(), Some(b"bar".to_vec()));
    }

    #[test]
    fn replayed_entries_execute_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = open_sm(dir.path());

        assert_eq!(
            sm.apply(1, 10, &cmd(&[b"INCR", b"default:n"])).unwrap(),
            Value::Int(1)
        );
        // Replaying the same index is a no-op.
        assert_eq!(
            sm.apply(1, 10, &cmd(&[b"INCR", b"default:n"])).unwrap(),
            Value::Null
        );
        assert_eq!(
            sm.apply(2, 11, &cmd(&[b"INCR", b"default:n"])).unwrap(),
            Value::Int(2)
        );
        assert_eq!(sm.store().get(b"n").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn applied_index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut sm = open_sm(dir.path());
            sm.apply(1, 10, &cmd(&[b"SET", b"default:k", b"v"])).unwrap();
            sm.apply(2, 11, &cmd(&[b"INCR", b"default:n"])).unwrap();
            sm.store().engine().close();
        }
        let sm = open_sm(dir.path());
        assert_eq!(sm.applied_index(), 2);
    }

    #[test]
    fn setnx_contention_resolves_in_commit_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = open_sm(dir.path());

        let e1 = sm.apply(1, 10, &cmd(&[b"SETNX", b"default:k", b"v1"])).unwrap();
        let e2 = sm.apply(2, 11, &cmd(&[b"SETNX", b"default:k", b"v2"])).unwrap();
        assert_eq!(e1, Value::Int(1));
        assert_eq!(e2, Value::Int(0));
        assert_eq!(sm.store().get(b"k").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn incr_overflow_is_reported_and_leaves_value_intact() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = open_sm(dir.path());

        sm.apply(
            1,
            10,
            &cmd(&[b"SET", b"default:n", i64::MAX.to_string().as_bytes()]),
        )
        .unwrap();
        let err = sm.apply(2, 11, &cmd(&[b"INCR", b"default:n"])).unwrap_err();
        assert!(matches!(err, StoreError::Overflow));
        // The failed entry still advanced the applied index.
        assert_eq!(sm.applied_index(), 2);
        assert_eq!(
            sm.store().get(b"n").unwrap(),
            Some(i64::MAX.to_string().into_bytes())
        );
    }

    #[test]
    fn foreign_namespace_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = open_sm(dir.path());

        let err = sm.apply(1, 10, &cmd(&[b"SET", b"other:k", b"v"])).unwrap_err();
        assert!(matches!(err, StoreError::WrongNamespace));
        let err = sm.apply(2, 11, &cmd(&[b"SET", b"nocolon", b"v"])).unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey));
        assert_eq!(sm.applied_index(), 2);
    }

    #[test]
    fn set_flag_combinations_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = open_sm(dir.path());

        let err = sm
            .apply(1, 10, &cmd(&[b"SET", b"default:k", b"v", b"NX", b"XX"]))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgs));
        let err = sm
            .apply(2, 10, &cmd(&[b"SET", b"default:k", b"v", b"EX", b"0"]))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTtl));
        // Flags may appear in either order.
        let res = sm
            .apply(3, 10, &cmd(&[b"SET", b"default:k", b"v", b"NX", b"EX", b"30"]))
            .unwrap();
        assert_eq!(res, Value::Int(1));
        let res = sm
            .apply(4, 11, &cmd(&[b"SET", b"default:k", b"w", b"EX", b"30", b"XX"]))
            .unwrap();
        assert_eq!(res, Value::Int(1));
    }

    #[test]
    fn mset_is_atomic_within_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = open_sm(dir.path());

        let res = sm
            .apply(
                1,
                10,
                &cmd(&[b"MSET", b"default:a", b"1", b"default:b", b"2"]),
            )
            .unwrap();
        assert_eq!(res, Value::Ok);
        assert_eq!(sm.store().get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(sm.store().get(b"b").unwrap(), Some(b"2".to_vec()));

        // A bad key anywhere fails the whole entry; nothing is written.
        let err = sm
            .apply(
                2,
                11,
                &cmd(&[b"MSET", b"default:c", b"3", b"other:d", b"4"]),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::WrongNamespace));
        assert_eq!(sm.store().get(b"c").unwrap(), None);
    }

    #[test]
    fn identical_streams_produce_identical_engines() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let mut a = open_sm(dir_a.path());
        let mut b = open_sm(dir_b.path());

        let stream: Vec<(u64, u64, Vec<u8>)> = vec![
            (1, 100, cmd(&[b"SET", b"default:k", b"v", b"EX", b"60"])),
            (2, 200, cmd(&[b"INCR", b"default:n"])),
            (3, 300, cmd(&[b"INCRBY", b"default:n", b"41"])),
            (4, 400, cmd(&[b"MSET", b"default:a", b"1", b"default:b", b"2"])),
            (5, 500, cmd(&[b"SETBIT", b"default:bits", b"9", b"1"])),
            (6, 600, cmd(&[b"PFADD", b"default:h", b"x", b"y", b"z"])),
            (7, 700, cmd(&[b"APPEND", b"default:k", b"-more"])),
            (8, 800, cmd(&[b"DEL", b"default:a"])),
            (9, 900, cmd(&[b"SETRANGE", b"default:k", b"2", b"zz"])),
        ];

        for (index, ts, frame) in &stream {
            let ra = a.apply(*index, *ts, frame);
            let rb = b.apply(*index, *ts, frame);
            match (ra, rb) {
                (Ok(va), Ok(vb)) => assert_eq!(va, vb),
                (Err(_), Err(_)) => {}
                other => panic!("appliers diverged: {other:?}"),
            }
        }

        assert_eq!(
            engine_contents(a.store().engine()),
            engine_contents(b.store().engine())
        );
    }
}
