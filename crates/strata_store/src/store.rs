//! Typed data-store operations over the shard's data engine.
//!
//! Every value is stored as an 8-byte big-endian `expire_at` (nanoseconds,
//! 0 = no expiry) followed by the payload. The applier decides liveness
//! against the entry's deterministic timestamp so all replicas agree; the
//! local read path decides against the wall clock (lazy expiry).
//!
//! Mutating operations append to a caller-provided batch and never commit
//! themselves: the state machine commits all mutations of one log entry in
//! a single atomic engine write.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use strata_engine::{KvEngine, WriteBatch};

use crate::errors::{Result, StoreError};
use crate::hll::Hll;

/// Highest addressable bit offset (4MB bitmaps).
pub const MAX_BIT_OFFSET: i64 = 4 * 1024 * 1024 * 8;

const VALUE_HEADER: usize = 8;
const DATA_PREFIX: &[u8] = b"k:";
/// Live-key counter maintained through the engine's u64-add merger.
const KV_COUNT_KEY: &[u8] = b"m:kv_count";

pub fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .min(u128::from(u64::MAX)) as u64
}

fn data_key(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(DATA_PREFIX.len() + key.len());
    out.extend_from_slice(DATA_PREFIX);
    out.extend_from_slice(key);
    out
}

fn encode_value(expire_at: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(VALUE_HEADER + payload.len());
    out.extend_from_slice(&expire_at.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn decode_value(raw: &[u8]) -> (u64, &[u8]) {
    if raw.len() < VALUE_HEADER {
        return (0, raw);
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&raw[..VALUE_HEADER]);
    (u64::from_be_bytes(buf), &raw[VALUE_HEADER..])
}

fn alive(expire_at: u64, now_ns: u64) -> bool {
    expire_at == 0 || expire_at > now_ns
}

fn expire_from_secs(ts: u64, ex_secs: i64) -> u64 {
    if ex_secs > 0 {
        ts.saturating_add(ex_secs as u64 * 1_000_000_000)
    } else {
        0
    }
}

/// Per-shard KV operations bound to one data engine.
#[derive(Clone)]
pub struct KvStore {
    engine: Arc<dyn KvEngine>,
}

impl KvStore {
    pub fn new(engine: Arc<dyn KvEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<dyn KvEngine> {
        &self.engine
    }

    /// Physical record for `key`, expired or not.
    fn load(&self, key: &[u8]) -> Result<Option<(u64, Vec<u8>)>> {
        match self.engine.get(&data_key(key))? {
            None => Ok(None),
            Some(raw) => {
                let (expire_at, payload) = decode_value(&raw);
                Ok(Some((expire_at, payload.to_vec())))
            }
        }
    }

    /// Payload for `key` if it is live at `now_ns`.
    fn load_alive(&self, key: &[u8], now_ns: u64) -> Result<Option<(u64, Vec<u8>)>> {
        Ok(self
            .load(key)?
            .filter(|(expire_at, _)| alive(*expire_at, now_ns)))
    }

    fn put(&self, wb: &mut WriteBatch, key: &[u8], expire_at: u64, payload: &[u8], existed: bool) {
        wb.put(data_key(key), encode_value(expire_at, payload));
        if !existed {
            wb.merge_u64_add(KV_COUNT_KEY.to_vec(), 1);
        }
    }

    fn remove(&self, wb: &mut WriteBatch, key: &[u8]) {
        wb.delete(data_key(key));
        wb.merge_u64_add(KV_COUNT_KEY.to_vec(), u64::MAX);
    }

    // ---- local read path (wall-clock expiry) ----

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .load_alive(key, unix_nanos())?
            .map(|(_, payload)| payload))
    }

    pub fn mget(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        let now = unix_nanos();
        let data_keys: Vec<Vec<u8>> = keys.iter().map(|k| data_key(k)).collect();
        let raw = self.engine.multi_get(&data_keys)?;
        Ok(raw
            .into_iter()
            .map(|item| {
                item.and_then(|raw| {
                    let (expire_at, payload) = decode_value(&raw);
                    alive(expire_at, now).then(|| payload.to_vec())
                })
            })
            .collect())
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.load_alive(key, unix_nanos())?.is_some())
    }

    pub fn str_len(&self, key: &[u8]) -> Result<i64> {
        Ok(self
            .load_alive(key, unix_nanos())?
            .map(|(_, payload)| payload.len() as i64)
            .unwrap_or(0))
    }

    pub fn get_bit(&self, key: &[u8], offset: i64) -> Result<i64> {
        if offset < 0 || offset > MAX_BIT_OFFSET {
            return Err(StoreError::BitOverflow);
        }
        let payload = match self.load_alive(key, unix_nanos())? {
            Some((_, payload)) => payload,
            None => return Ok(0),
        };
        let byte = (offset / 8) as usize;
        if byte >= payload.len() {
            return Ok(0);
        }
        Ok(((payload[byte] >> (7 - (offset % 8) as u8)) & 1) as i64)
    }

    /// Live-key estimate from the merge-maintained counter.
    pub fn key_count(&self) -> Result<u64> {
        match self.engine.get(KV_COUNT_KEY)? {
            Some(raw) if raw.len() == 8 => Ok(u64::from_le_bytes(raw.try_into().unwrap())),
            _ => Ok(0),
        }
    }

    // ---- applier write path (ts-deterministic) ----

    pub fn set(
        &self,
        wb: &mut WriteBatch,
        ts: u64,
        key: &[u8],
        value: &[u8],
        ex_secs: i64,
        create_only: bool,
        update_only: bool,
    ) -> Result<i64> {
        let existing = self.load(key)?;
        let live = existing
            .as_ref()
            .map(|(expire_at, _)| alive(*expire_at, ts))
            .unwrap_or(false);
        if create_only && live {
            return Ok(0);
        }
        if update_only && !live {
            return Ok(0);
        }
        self.put(
            wb,
            key,
            expire_from_secs(ts, ex_secs),
            value,
            existing.is_some(),
        );
        Ok(1)
    }

    pub fn set_nx(&self, wb: &mut WriteBatch, ts: u64, key: &[u8], value: &[u8]) -> Result<i64> {
        self.set(wb, ts, key, value, 0, true, false)
    }

    pub fn set_if_eq(
        &self,
        wb: &mut WriteBatch,
        ts: u64,
        key: &[u8],
        old: &[u8],
        new: &[u8],
        ex_secs: i64,
    ) -> Result<i64> {
        let existing = self.load(key)?;
        let current = existing
            .as_ref()
            .filter(|(expire_at, _)| alive(*expire_at, ts))
            .map(|(_, payload)| payload.as_slice())
            .unwrap_or(&[]);
        if current != old {
            return Ok(0);
        }
        self.put(
            wb,
            key,
            expire_from_secs(ts, ex_secs),
            new,
            existing.is_some(),
        );
        Ok(1)
    }

    pub fn del_if_eq(&self, wb: &mut WriteBatch, ts: u64, key: &[u8], old: &[u8]) -> Result<i64> {
        let existing = self.load(key)?;
        let current = existing
            .as_ref()
            .filter(|(expire_at, _)| alive(*expire_at, ts))
            .map(|(_, payload)| payload.as_slice())
            .unwrap_or(&[]);
        if current != old {
            return Ok(0);
        }
        if existing.is_some() {
            self.remove(wb, key);
        }
        Ok(1)
    }

    pub fn get_set(
        &self,
        wb: &mut WriteBatch,
        ts: u64,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let existing = self.load(key)?;
        let prior = existing
            .as_ref()
            .filter(|(expire_at, _)| alive(*expire_at, ts))
            .map(|(_, payload)| payload.clone());
        self.put(wb, key, 0, value, existing.is_some());
        Ok(prior)
    }

    pub fn mset(&self, wb: &mut WriteBatch, _ts: u64, pairs: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        for (key, value) in pairs {
            let existed = self.load(key)?.is_some();
            self.put(wb, key, 0, value, existed);
        }
        Ok(())
    }

    pub fn incr_by(&self, wb: &mut WriteBatch, ts: u64, key: &[u8], delta: i64) -> Result<i64> {
        let existing = self.load(key)?;
        let live = existing
            .as_ref()
            .filter(|(expire_at, _)| alive(*expire_at, ts));
        let current = match live {
            None => 0i64,
            Some((_, payload)) if payload.is_empty() => 0,
            Some((_, payload)) => std::str::from_utf8(payload)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or(StoreError::NotInteger)?,
        };
        let next = current.checked_add(delta).ok_or(StoreError::Overflow)?;
        let expire_at = live.map(|(expire_at, _)| *expire_at).unwrap_or(0);
        self.put(
            wb,
            key,
            expire_at,
            next.to_string().as_bytes(),
            existing.is_some(),
        );
        Ok(next)
    }

    pub fn append(&self, wb: &mut WriteBatch, ts: u64, key: &[u8], value: &[u8]) -> Result<i64> {
        let existing = self.load(key)?;
        let live = existing
            .as_ref()
            .filter(|(expire_at, _)| alive(*expire_at, ts));
        let (expire_at, mut payload) = match live {
            Some((expire_at, payload)) => (*expire_at, payload.clone()),
            None => (0, Vec::new()),
        };
        payload.extend_from_slice(value);
        let len = payload.len() as i64;
        self.put(wb, key, expire_at, &payload, existing.is_some());
        Ok(len)
    }

    pub fn del(&self, wb: &mut WriteBatch, ts: u64, keys: &[Vec<u8>]) -> Result<i64> {
        let mut removed = 0i64;
        for key in keys {
            let existing = self.load(key)?;
            let Some((expire_at, _)) = existing else {
                continue;
            };
            if alive(expire_at, ts) {
                removed += 1;
            }
            self.remove(wb, key);
        }
        Ok(removed)
    }

    pub fn set_range(
        &self,
        wb: &mut WriteBatch,
        ts: u64,
        key: &[u8],
        offset: i64,
        value: &[u8],
    ) -> Result<i64> {
        if offset < 0 {
            return Err(StoreError::InvalidArgs);
        }
        let existing = self.load(key)?;
        let live = existing
            .as_ref()
            .filter(|(expire_at, _)| alive(*expire_at, ts));
        let (expire_at, mut payload) = match live {
            Some((expire_at, payload)) => (*expire_at, payload.clone()),
            None => (0, Vec::new()),
        };
        let end = offset as usize + value.len();
        if payload.len() < end {
            payload.resize(end, 0);
        }
        payload[offset as usize..end].copy_from_slice(value);
        let len = payload.len() as i64;
        self.put(wb, key, expire_at, &payload, existing.is_some());
        Ok(len)
    }

    pub fn set_bit(
        &self,
        wb: &mut WriteBatch,
        ts: u64,
        key: &[u8],
        offset: i64,
        bit: i64,
    ) -> Result<i64> {
        if offset < 0 || offset > MAX_BIT_OFFSET {
            return Err(StoreError::BitOverflow);
        }
        if bit & !1 != 0 {
            return Err(StoreError::InvalidArgs);
        }
        let existing = self.load(key)?;
        let live = existing
            .as_ref()
            .filter(|(expire_at, _)| alive(*expire_at, ts));
        let (expire_at, mut payload) = match live {
            Some((expire_at, payload)) => (*expire_at, payload.clone()),
            None => (0, Vec::new()),
        };
        let byte = (offset / 8) as usize;
        if payload.len() <= byte {
            payload.resize(byte + 1, 0);
        }
        let shift = 7 - (offset % 8) as u8;
        let prior = ((payload[byte] >> shift) & 1) as i64;
        if bit == 1 {
            payload[byte] |= 1 << shift;
        } else {
            payload[byte] &= !(1 << shift);
        }
        self.put(wb, key, expire_at, &payload, existing.is_some());
        Ok(prior)
    }

    pub fn bit_clear(&self, wb: &mut WriteBatch, ts: u64, key: &[u8]) -> Result<i64> {
        let existing = self.load(key)?;
        let Some((expire_at, _)) = existing else {
            return Ok(0);
        };
        let was_live = alive(expire_at, ts);
        self.remove(wb, key);
        Ok(was_live as i64)
    }

    pub fn pf_add(
        &self,
        wb: &mut WriteBatch,
        ts: u64,
        key: &[u8],
        members: &[Vec<u8>],
    ) -> Result<i64> {
        let existing = self.load(key)?;
        let live = existing
            .as_ref()
            .filter(|(expire_at, _)| alive(*expire_at, ts));
        let (expire_at, mut hll, fresh) = match live {
            Some((expire_at, payload)) => (
                *expire_at,
                Hll::decode(payload).map_err(|err| StoreError::Other(err.to_string()))?,
                false,
            ),
            None => (0, Hll::new(), true),
        };
        let mut changed = false;
        for member in members {
            if hll.add(member) {
                changed = true;
            }
        }
        if changed || fresh {
            self.put(wb, key, expire_at, &hll.encode(), existing.is_some());
        }
        Ok(changed as i64)
    }

    pub fn pf_count(&self, ts: u64, key: &[u8]) -> Result<i64> {
        let live = self.load_alive(key, ts)?;
        let Some((_, payload)) = live else {
            return Ok(0);
        };
        let hll = Hll::decode(&payload).map_err(|err| StoreError::Other(err.to_string()))?;
        Ok(hll.count() as i64)
    }
}
