//! Log entry, snapshot, and consensus-state types plus their on-disk codec.
//!
//! The entry record layout is a shared contract with the consensus layer:
//! a crc32 of the payload followed by the big-endian length-prefixed fields.
//! Round-trip is lossless and every decode verifies the checksum.

use anyhow::Context;

/// Kind of a replicated log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryType {
    Normal,
    ConfChange,
}

impl EntryType {
    fn as_u32(self) -> u32 {
        match self {
            EntryType::Normal => 0,
            EntryType::ConfChange => 1,
        }
    }

    fn from_u32(raw: u32) -> anyhow::Result<Self> {
        match raw {
            0 => Ok(EntryType::Normal),
            1 => Ok(EntryType::ConfChange),
            other => anyhow::bail!("unknown entry type {other}"),
        }
    }
}

/// A single replicated log record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub index: u64,
    pub term: u64,
    pub entry_type: EntryType,
    pub data: Vec<u8>,
}

impl Entry {
    pub fn normal(index: u64, term: u64, data: Vec<u8>) -> Self {
        Self {
            index,
            term,
            entry_type: EntryType::Normal,
            data,
        }
    }

    /// Sentinel entry written at cold start and at snapshot anchors.
    pub fn anchor(index: u64, term: u64) -> Self {
        Self::normal(index, term, Vec::new())
    }

    /// Encoded size of the record, used for `max_bytes` accounting.
    pub fn encoded_len(&self) -> usize {
        4 + 8 + 8 + 4 + 4 + self.data.len()
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.encoded_len() - 4);
        payload.extend_from_slice(&self.index.to_be_bytes());
        payload.extend_from_slice(&self.term.to_be_bytes());
        payload.extend_from_slice(&self.entry_type.as_u32().to_be_bytes());
        payload.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        payload.extend_from_slice(&self.data);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let mut out = Vec::with_capacity(4 + payload.len());
        out.extend_from_slice(&crc.to_be_bytes());
        out.extend_from_slice(&payload);
        out
    }

    pub fn unmarshal(buf: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        let expected_crc = read_u32_at(buf, &mut offset).context("entry crc")?;
        let payload = &buf[offset..];
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(payload);
        anyhow::ensure!(hasher.finalize() == expected_crc, "entry checksum mismatch");

        let index = read_u64_at(buf, &mut offset)?;
        let term = read_u64_at(buf, &mut offset)?;
        let entry_type = EntryType::from_u32(read_u32_at(buf, &mut offset)?)?;
        let len = read_u32_at(buf, &mut offset)? as usize;
        anyhow::ensure!(offset + len <= buf.len(), "entry short data");
        let data = buf[offset..offset + len].to_vec();
        Ok(Self {
            index,
            term,
            entry_type,
            data,
        })
    }
}

/// Replica membership carried by snapshots.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfState {
    pub voters: Vec<u64>,
    pub learners: Vec<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub index: u64,
    pub term: u64,
    pub conf_state: ConfState,
}

/// A compacted log prefix plus an optional application state reference.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.meta.index == 0
    }
}

/// Last persisted consensus metadata. Held in memory here; the consensus
/// layer flushes it out-of-band, and the log store is the source of truth
/// for entries only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HardState {
    pub term: u64,
    pub vote: u64,
    pub commit: u64,
}

fn read_u32_at(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "entry short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64_at(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= data.len(), "entry short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}
