//! Per-shard node: the client-facing proposer bridge and the serial commit
//! pipeline that drives the replicated log and the state machine.
//!
//! Writes flow propose → log append → apply → waiter. The consensus protocol
//! itself lives outside this crate; the pipeline is the "propose and await
//! commit" surface it plugs into, assigning `(index, term)`, persisting the
//! entry through the log store, and applying it in commit order. Reads are
//! served locally. Leadership events from the lease gate proposing; an I/O
//! failure on log append aborts the shard.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use strata_engine::{EngineConfig, EngineError, KvEngine, RocksEngine};
use strata_raft::{ConfState, Entry, RaftLogStore, Storage, StorageError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::errors::{Result, StoreError};
use crate::master::MasterEvent;
use crate::state_machine::{
    cut_namespace, decode_request, encode_command, encode_request, parse_ex_secs, parse_i64,
    parse_set_flags, StateMachine, Value,
};
use crate::store::{unix_nanos, KvStore, MAX_BIT_OFFSET};

const PROPOSAL_QUEUE: usize = 1024;

/// Static configuration for one shard node.
#[derive(Clone, Debug)]
pub struct ShardConfig {
    pub node_id: u64,
    pub group_id: u32,
    pub data_dir: PathBuf,
    pub namespace: String,
    /// Applied entries between snapshot+compact cycles; 0 disables them.
    pub snap_count: u64,
    pub propose_timeout: Duration,
}

impl ShardConfig {
    pub fn new(
        node_id: u64,
        group_id: u32,
        data_dir: impl Into<PathBuf>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            node_id,
            group_id,
            data_dir: data_dir.into(),
            namespace: namespace.into(),
            snap_count: 10_000,
            propose_timeout: Duration::from_secs(5),
        }
    }
}

struct Proposal {
    argv: Vec<Vec<u8>>,
    ts: u64,
    reply: oneshot::Sender<Result<Value>>,
}

/// Point-in-time shard counters for the stats surface.
#[derive(Clone, Debug)]
pub struct ShardStats {
    pub first_index: u64,
    pub last_index: u64,
    pub num_entries: usize,
    pub applied_index: u64,
    pub term: u64,
    pub is_leader: bool,
    pub log_size: u64,
    pub data_size: u64,
    pub key_count: u64,
}

pub struct KvNode {
    config: ShardConfig,
    log_store: Arc<RaftLogStore>,
    log_engine: Arc<dyn KvEngine>,
    data_engine: Arc<dyn KvEngine>,
    store: KvStore,
    proposals: Mutex<Option<mpsc::Sender<Proposal>>>,
    pipeline: Mutex<Option<JoinHandle<()>>>,
    is_leader: AtomicBool,
    failed: Arc<AtomicBool>,
    term: Arc<AtomicU64>,
    applied: Arc<AtomicU64>,
    last_ts: AtomicU64,
    current_master: Mutex<String>,
}

impl KvNode {
    /// Open the shard's engines, recover the log and applier, replay any
    /// entries persisted past the applied marker, and start the commit
    /// pipeline. A node without an attached lease proposes unconditionally.
    pub fn open(config: ShardConfig) -> anyhow::Result<Arc<Self>> {
        let log_engine: Arc<dyn KvEngine> = Arc::new(RocksEngine::open(
            EngineConfig::new(config.data_dir.join("raftlog")).disable_wal(true),
        )?);
        let data_engine: Arc<dyn KvEngine> =
            Arc::new(RocksEngine::open(EngineConfig::new(config.data_dir.join("data")))?);

        let log_store = Arc::new(RaftLogStore::open(
            log_engine.clone(),
            config.node_id,
            config.group_id,
        )?);
        let store = KvStore::new(data_engine.clone());
        let mut sm = StateMachine::open(store.clone(), config.namespace.clone())?;

        let last = log_store.last_index()?;
        if last > sm.applied_index() {
            Self::replay(&log_store, &mut sm, last)?;
        }

        let mut hard_state = log_store.hard_state();
        hard_state.term = hard_state.term.max(1);
        log_store.set_hard_state(hard_state);

        let applied = Arc::new(AtomicU64::new(sm.applied_index()));
        let term = Arc::new(AtomicU64::new(hard_state.term));
        let failed = Arc::new(AtomicBool::new(false));

        let (tx, rx) = mpsc::channel(PROPOSAL_QUEUE);
        let pipeline = tokio::spawn(Self::run_pipeline(
            config.clone(),
            log_store.clone(),
            data_engine.clone(),
            sm,
            rx,
            last.max(sm_applied(&applied)),
            term.clone(),
            applied.clone(),
            failed.clone(),
        ));

        info!(
            node_id = config.node_id,
            group_id = config.group_id,
            namespace = %config.namespace,
            last_index = last,
            "shard node opened"
        );

        Ok(Arc::new(Self {
            config,
            log_store,
            log_engine,
            data_engine,
            store,
            proposals: Mutex::new(Some(tx)),
            pipeline: Mutex::new(Some(pipeline)),
            is_leader: AtomicBool::new(true),
            failed,
            term,
            applied,
            last_ts: AtomicU64::new(0),
            current_master: Mutex::new(String::new()),
        }))
    }

    /// Re-apply entries the log persisted past the applied marker (a crash
    /// between append and apply). The applier skips anything at or below the
    /// marker, so this is idempotent.
    fn replay(log_store: &RaftLogStore, sm: &mut StateMachine, last: u64) -> anyhow::Result<()> {
        let from = sm.applied_index() + 1;
        let entries = match log_store.entries(from, last + 1, u64::MAX) {
            Ok(entries) => entries,
            Err(StorageError::Compacted) => {
                warn!(from, last, "replay range already compacted; skipping");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        info!(from, last, count = entries.len(), "replaying log entries");
        for entry in entries {
            if entry.data.is_empty() {
                let _ = sm.apply(entry.index, 0, &[]);
                continue;
            }
            let (ts, frame) = decode_request(&entry.data)?;
            // Per-command failures were already reported to the original
            // proposer; replay only needs the state transition.
            if let Err(err) = sm.apply(entry.index, ts, frame) {
                if matches!(err, StoreError::Engine(_)) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_pipeline(
        config: ShardConfig,
        log_store: Arc<RaftLogStore>,
        data_engine: Arc<dyn KvEngine>,
        mut sm: StateMachine,
        mut rx: mpsc::Receiver<Proposal>,
        last_index: u64,
        term: Arc<AtomicU64>,
        applied: Arc<AtomicU64>,
        failed: Arc<AtomicBool>,
    ) {
        let mut next_index = last_index + 1;
        let mut last_snap = sm.applied_index();

        while let Some(proposal) = rx.recv().await {
            let index = next_index;
            let frame = encode_command(&proposal.argv);
            let entry = Entry::normal(
                index,
                term.load(Ordering::SeqCst),
                encode_request(proposal.ts, &frame),
            );

            if let Err(err) = log_store.append(std::slice::from_ref(&entry)) {
                error!(error = ?err, index, "log append failed; aborting shard");
                failed.store(true, Ordering::SeqCst);
                let _ = proposal.reply.send(Err(err.into()));
                break;
            }
            next_index += 1;

            let result = sm.apply(index, proposal.ts, &frame);
            let fatal = matches!(result, Err(StoreError::Engine(_)));
            applied.store(sm.applied_index(), Ordering::SeqCst);
            let _ = proposal.reply.send(result);
            if fatal {
                error!(index, "state machine apply hit an engine failure; aborting shard");
                failed.store(true, Ordering::SeqCst);
                break;
            }

            if config.snap_count > 0 && index - last_snap >= config.snap_count {
                Self::snapshot_and_compact(&config, &log_store, &data_engine, index);
                last_snap = index;
            }
        }
    }

    /// Checkpoint the data engine, record a snapshot at `index`, and compact
    /// the log below it. Failures here only cost log space, so they are
    /// logged and skipped.
    fn snapshot_and_compact(
        config: &ShardConfig,
        log_store: &RaftLogStore,
        data_engine: &Arc<dyn KvEngine>,
        index: u64,
    ) {
        let parent = config.data_dir.join("checkpoints");
        if let Err(err) = std::fs::create_dir_all(&parent) {
            warn!(error = ?err, "cannot create checkpoint dir; skipping snapshot");
            return;
        }
        let dir = parent.join(format!("ck-{index}"));
        if let Err(err) = data_engine.checkpoint(&dir) {
            warn!(error = ?err, index, "checkpoint failed; skipping snapshot");
            return;
        }
        let conf_state = ConfState {
            voters: vec![config.node_id],
            learners: Vec::new(),
        };
        let data = dir.to_string_lossy().into_owned().into_bytes();
        match log_store.create_snapshot(index, Some(&conf_state), data) {
            Ok(snap) => {
                info!(index, term = snap.meta.term, "created log snapshot");
                match log_store.compact(index) {
                    Ok(()) | Err(StorageError::Compacted) => {}
                    Err(err) => warn!(error = ?err, index, "log compaction failed"),
                }
            }
            Err(err) => warn!(error = ?err, index, "snapshot creation failed"),
        }
    }

    /// Monotone logical timestamp from the leader clock.
    fn next_ts(&self) -> u64 {
        let now = unix_nanos();
        let mut prev = self.last_ts.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match self
                .last_ts
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(observed) => prev = observed,
            }
        }
    }

    /// Wire leadership to lease events: proposing is enabled only while the
    /// lease is held, and each acquisition starts a new term.
    pub fn attach_master(self: &Arc<Self>, mut events: mpsc::Receiver<MasterEvent>) {
        self.is_leader.store(false, Ordering::SeqCst);
        let node = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    MasterEvent::Acquired { master, .. } => {
                        let term = node.term.fetch_add(1, Ordering::SeqCst) + 1;
                        let mut hard_state = node.log_store.hard_state();
                        hard_state.term = term;
                        node.log_store.set_hard_state(hard_state);
                        *node.current_master.lock().expect("master hint") = master;
                        node.is_leader.store(true, Ordering::SeqCst);
                        info!(term, "lease acquired; proposing enabled");
                    }
                    MasterEvent::Lost => {
                        node.is_leader.store(false, Ordering::SeqCst);
                        warn!("lease lost; proposing disabled");
                    }
                    MasterEvent::Changed { master, .. } => {
                        *node.current_master.lock().expect("master hint") = master;
                    }
                    MasterEvent::Error { reason } => {
                        warn!(%reason, "lease error event");
                    }
                }
            }
        });
    }

    /// Last observed lease holder, used as a redirect hint on NotLeader.
    pub fn current_master(&self) -> String {
        self.current_master.lock().expect("master hint").clone()
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Propose a write command and wait for its applied result.
    pub async fn propose(&self, argv: Vec<Vec<u8>>) -> Result<Value> {
        validate_command(&argv)?;
        self.check_namespace(&argv)?;
        if self.failed.load(Ordering::SeqCst) {
            return Err(StoreError::Engine(EngineError::Io(
                "shard aborted after log failure".into(),
            )));
        }
        if !self.is_leader() {
            return Err(StoreError::NotLeader);
        }
        if let Some(early) = self.precheck(&argv)? {
            return Ok(early);
        }

        let ts = self.next_ts();
        let (reply_tx, reply_rx) = oneshot::channel();
        let sender = self
            .proposals
            .lock()
            .expect("proposal sender")
            .clone()
            .ok_or(StoreError::Cancelled)?;
        sender
            .send(Proposal {
                argv,
                ts,
                reply: reply_tx,
            })
            .await
            .map_err(|_| StoreError::Cancelled)?;

        match tokio::time::timeout(self.config.propose_timeout, reply_rx).await {
            // Timing out does not guarantee non-application: the entry may
            // still commit after the deadline.
            Err(_) => Err(StoreError::Timeout),
            Ok(Err(_)) => Err(StoreError::Cancelled),
            Ok(Ok(result)) => result,
        }
    }

    /// Read-only short-circuit for SETNX/SETIFEQ/DELIFEQ. Advisory only: it
    /// races with leadership changes and can return a spurious negative; the
    /// applier re-checks authoritatively.
    fn precheck(&self, argv: &[Vec<u8>]) -> Result<Option<Value>> {
        let name = argv[0].to_ascii_uppercase();
        match name.as_slice() {
            b"SETNX" => {
                let key = self.cut(&argv[1])?;
                if self.store.exists(&key)? {
                    return Ok(Some(Value::Int(0)));
                }
            }
            b"SETIFEQ" | b"DELIFEQ" => {
                let key = self.cut(&argv[1])?;
                let current = self.store.get(&key)?.unwrap_or_default();
                if current != argv[2] {
                    return Ok(Some(Value::Int(0)));
                }
            }
            _ => {}
        }
        Ok(None)
    }

    fn cut(&self, raw: &[u8]) -> Result<Vec<u8>> {
        cut_namespace(&self.config.namespace, raw)
    }

    fn check_namespace(&self, argv: &[Vec<u8>]) -> Result<()> {
        let name = argv[0].to_ascii_uppercase();
        match name.as_slice() {
            b"MSET" => {
                for chunk in argv[1..].chunks(2) {
                    self.cut(&chunk[0])?;
                }
            }
            b"DEL" => {
                for raw in &argv[1..] {
                    self.cut(raw)?;
                }
            }
            _ => {
                self.cut(&argv[1])?;
            }
        }
        Ok(())
    }

    // ---- local read path ----

    pub fn get(&self, raw_key: &[u8]) -> Result<Option<Vec<u8>>> {
        let key = self.cut(raw_key)?;
        self.store.get(&key)
    }

    pub fn mget(&self, raw_keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut keys = Vec::with_capacity(raw_keys.len());
        for raw in raw_keys {
            keys.push(self.cut(raw)?);
        }
        self.store.mget(&keys)
    }

    /// Count how many of the given keys exist.
    pub fn exists(&self, raw_keys: &[Vec<u8>]) -> Result<i64> {
        let mut count = 0i64;
        for raw in raw_keys {
            let key = self.cut(raw)?;
            if self.store.exists(&key)? {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn str_len(&self, raw_key: &[u8]) -> Result<i64> {
        let key = self.cut(raw_key)?;
        self.store.str_len(&key)
    }

    pub fn get_bit(&self, raw_key: &[u8], offset: i64) -> Result<i64> {
        let key = self.cut(raw_key)?;
        self.store.get_bit(&key, offset)
    }

    pub fn stats(&self) -> Result<ShardStats> {
        Ok(ShardStats {
            first_index: self.log_store.first_index()?,
            last_index: self.log_store.last_index()?,
            num_entries: self.log_store.num_entries()?,
            applied_index: self.applied.load(Ordering::SeqCst),
            term: self.term.load(Ordering::SeqCst),
            is_leader: self.is_leader(),
            log_size: self.log_engine.estimate_size()?,
            data_size: self.data_engine.estimate_size()?,
            key_count: self.store.key_count()?,
        })
    }

    /// Stop the pipeline and close both engines. Pending proposals are
    /// cancelled.
    pub async fn shutdown(&self) {
        let sender = self.proposals.lock().expect("proposal sender").take();
        drop(sender);
        let handle = self.pipeline.lock().expect("pipeline handle").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.log_store.close();
        self.data_engine.close();
        info!(node_id = self.config.node_id, "shard node shut down");
    }
}

fn sm_applied(applied: &Arc<AtomicU64>) -> u64 {
    applied.load(Ordering::SeqCst)
}

/// Arity, flag, and argument-shape validation per operator. Runs before the
/// consensus round-trip; the applier re-validates.
fn validate_command(argv: &[Vec<u8>]) -> Result<()> {
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
            parse_set_flags(&argv[3..])?;
        }
        b"SETNX" | b"GETSET" | b"APPEND" | b"DELIFEQ" => {
            if argc != 3 {
                return Err(StoreError::InvalidArgs);
            }
        }
        b"SETIFEQ" => {
            if argc != 4 && argc != 6 {
                return Err(StoreError::InvalidArgs);
            }
            if argc == 6 {
                parse_ex_secs(&argv[4], &argv[5])?;
            }
        }
        b"MSET" => {
            if argc < 3 || (argc - 1) % 2 != 0 {
                return Err(StoreError::InvalidArgs);
            }
        }
        b"INCR" | b"BITCLEAR" => {
            if argc != 2 {
                return Err(StoreError::InvalidArgs);
            }
        }
        b"INCRBY" => {
            if argc != 3 {
                return Err(StoreError::InvalidArgs);
            }
            parse_i64(&argv[2]).map_err(|_| StoreError::NotInteger)?;
        }
        b"DEL" => {}
        b"SETRANGE" => {
            if argc != 4 {
                return Err(StoreError::InvalidArgs);
            }
            let offset = parse_i64(&argv[2]).map_err(|_| StoreError::InvalidArgs)?;
            if offset < 0 {
                return Err(StoreError::InvalidArgs);
            }
        }
        b"SETBIT" => {
            if argc != 4 {
                return Err(StoreError::InvalidArgs);
            }
            let offset = parse_i64(&argv[2]).map_err(|_| StoreError::InvalidArgs)?;
            if !(0..=MAX_BIT_OFFSET).contains(&offset) {
                return Err(StoreError::BitOverflow);
            }
            let bit = parse_i64(&argv[3]).map_err(|_| StoreError::InvalidArgs)?;
            if bit & !1 != 0 {
                return Err(StoreError::InvalidArgs);
            }
        }
        b"PFADD" => {
            if argc < 3 {
                return Err(StoreError::InvalidArgs);
            }
        }
        b"PFCOUNT" => {
            // Counting across keys would require merging sketches from
            // different shards; rejected here rather than at the applier.
            if argc != 2 {
                return Err(StoreError::InvalidArgs);
            }
        }
        _ => return Err(StoreError::InvalidArgs),
    }
    Ok(())
}
