//! Leader lease via a compare-and-swap lock on a coordination service.
//!
//! One lock key exists per (cluster, shard, role); its value is the holder's
//! node identity and its TTL bounds how long a dead holder can linger. The
//! acquire loop creates the key when absent, watches it otherwise, and emits
//! `Acquired` / `Lost` / `Changed` events in issuance order on a capacity-1
//! channel. While holding, a refresh loop re-CASes the TTL every 0.4·TTL
//! against the last observed `modified_index`; a CAS conflict means the lease
//! moved and is reported as `Lost`.
//!
//! Panics inside the acquire routine are caught, logged, surfaced as a
//! recoverable `Error` event, and the loop restarts.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Sleep before retrying a transient coordination-service read failure.
const RETRY_SLEEP: Duration = Duration::from_millis(200);
/// Sweep period for TTL expiry in the in-process service.
const MEM_SWEEP_PERIOD: Duration = Duration::from_millis(50);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MasterEvent {
    Acquired { master: String, modified_index: u64 },
    Lost,
    Changed { master: String, modified_index: u64 },
    Error { reason: String },
}

/// State of a lock key as stored by the coordination service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockRecord {
    pub value: String,
    pub ttl_secs: u64,
    pub modified_index: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    #[error("key not found")]
    NotFound,
    #[error("key already exists")]
    AlreadyExists,
    #[error("compare-and-swap mismatch")]
    CasFailed,
    #[error("watch cancelled")]
    Cancelled,
    #[error("coordination transient: {0}")]
    Transient(String),
}

/// Outcome of a watch: the new record, or `None` when the key was deleted
/// or expired. `cluster_index` is the service-wide index at response time.
#[derive(Clone, Debug)]
pub struct WatchResult {
    pub record: Option<LockRecord>,
    pub cluster_index: u64,
}

/// The coordination-service operations the lease protocol needs.
#[async_trait]
pub trait CoordClient: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<(LockRecord, u64), CoordError>;

    /// Create the key with a TTL; fails if it already exists.
    async fn create(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<(LockRecord, u64), CoordError>;

    /// Replace value/TTL if the current record still matches
    /// `(prev_value, prev_modified_index)`.
    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
        prev_value: &str,
        prev_modified_index: u64,
    ) -> Result<(LockRecord, u64), CoordError>;

    async fn delete(&self, key: &str) -> Result<(), CoordError>;

    /// Block until the key changes past `after_index`, the watch is
    /// cancelled, or the service fails.
    async fn watch(
        &self,
        key: &str,
        after_index: u64,
        cancel: CancellationToken,
    ) -> Result<WatchResult, CoordError>;
}

struct LockState {
    enabled: bool,
    master: String,
    modified_index: u64,
    holding: bool,
    cancel: CancellationToken,
    refresh_stop: Option<oneshot::Sender<()>>,
    stopped_rx: Option<oneshot::Receiver<()>>,
}

/// Master election handle for one lock key.
pub struct MasterLock {
    client: Arc<dyn CoordClient>,
    key: String,
    id: String,
    ttl_secs: u64,
    state: Mutex<LockState>,
    events_tx: mpsc::Sender<MasterEvent>,
}

impl MasterLock {
    pub fn new(
        client: Arc<dyn CoordClient>,
        key: impl Into<String>,
        id: impl Into<String>,
        ttl_secs: u64,
    ) -> (Arc<Self>, mpsc::Receiver<MasterEvent>) {
        let (events_tx, events_rx) = mpsc::channel(1);
        let lock = Arc::new(Self {
            client,
            key: key.into(),
            id: id.into(),
            ttl_secs: ttl_secs.max(1),
            state: Mutex::new(LockState {
                enabled: false,
                master: String::new(),
                modified_index: 0,
                holding: false,
                cancel: CancellationToken::new(),
                refresh_stop: None,
                stopped_rx: None,
            }),
            events_tx,
        });
        (lock, events_rx)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn master(&self) -> String {
        self.state.lock().expect("lock state").master.clone()
    }

    pub fn is_holding(&self) -> bool {
        self.state.lock().expect("lock state").holding
    }

    fn enabled(&self) -> bool {
        self.state.lock().expect("lock state").enabled
    }

    /// Start the acquire loop. Idempotent while running.
    pub fn start(self: &Arc<Self>) {
        let (stopped_tx, stopped_rx) = oneshot::channel();
        {
            let mut st = self.state.lock().expect("lock state");
            if st.enabled {
                return;
            }
            st.enabled = true;
            st.cancel = CancellationToken::new();
            st.stopped_rx = Some(stopped_rx);
        }
        info!(key = %self.key, id = %self.id, "start acquiring lease");

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match AssertUnwindSafe(this.clone().acquire()).catch_unwind().await {
                    Ok(()) => break,
                    Err(panic) => {
                        let reason = panic_message(panic);
                        error!(key = %this.key, reason = %reason, "acquire loop panicked; restarting");
                        let _ = this
                            .events_tx
                            .send(MasterEvent::Error { reason })
                            .await;
                        tokio::time::sleep(RETRY_SLEEP).await;
                    }
                }
            }
            let _ = stopped_tx.send(());
        });
    }

    /// Stop the acquire loop, deleting the key if we hold it. Idempotent;
    /// no events are emitted after this returns.
    pub async fn stop(&self) {
        let (cancel, stopped_rx) = {
            let mut st = self.state.lock().expect("lock state");
            if !st.enabled {
                return;
            }
            st.enabled = false;
            (st.cancel.clone(), st.stopped_rx.take())
        };
        info!(key = %self.key, "stop acquiring lease");
        cancel.cancel();
        if let Some(rx) = stopped_rx {
            let _ = rx.await;
        }
    }

    async fn acquire(self: Arc<Self>) {
        let cancel = self.state.lock().expect("lock state").cancel.clone();
        let mut rsp: Option<(LockRecord, u64)> = None;
        loop {
            if !self.enabled() {
                self.stop_acquire().await;
                return;
            }

            let (record, cluster_index) = match rsp.take() {
                Some(r) => r,
                None => match self.client.get(&self.key).await {
                    Ok(r) => r,
                    Err(CoordError::NotFound) => {
                        info!(key = %self.key, "trying to acquire lease");
                        match self.client.create(&self.key, &self.id, self.ttl_secs).await {
                            Ok(r) => r,
                            Err(err) => {
                                // Typically lost the create race; re-read.
                                warn!(key = %self.key, error = ?err, "lease create failed");
                                continue;
                            }
                        }
                    }
                    Err(err) => {
                        warn!(key = %self.key, error = ?err, "lease read failed");
                        tokio::time::sleep(RETRY_SLEEP).await;
                        continue;
                    }
                },
            };

            MasterLock::process_record(&self, &record).await;

            // Resume the watch from the larger of the record's own index and
            // the cluster index: after an error recovery the cluster index
            // can run ahead of the entry's modified index.
            let watch_from = record.modified_index.max(cluster_index);
            match self.client.watch(&self.key, watch_from, cancel.clone()).await {
                Ok(WatchResult {
                    record: Some(next),
                    cluster_index,
                }) => rsp = Some((next, cluster_index)),
                Ok(WatchResult { record: None, .. }) => {
                    self.handle_deleted().await;
                }
                Err(CoordError::Cancelled) => {
                    info!(key = %self.key, "lease watch stopped");
                }
                Err(err) => {
                    info!(key = %self.key, error = ?err, "lease watch failed");
                }
            }
        }
    }

    async fn process_record(this: &Arc<Self>, record: &LockRecord) {
        if record.value == this.id {
            let newly = {
                let mut st = this.state.lock().expect("lock state");
                let newly = !st.holding;
                st.holding = true;
                st.master = record.value.clone();
                st.modified_index = record.modified_index;
                newly
            };
            if newly {
                info!(key = %this.key, modified_index = record.modified_index, "acquired lease");
                let (stop_tx, stop_rx) = oneshot::channel();
                this.state.lock().expect("lock state").refresh_stop = Some(stop_tx);
                tokio::spawn(MasterLock::refresh_loop(this.clone(), stop_rx));
                let _ = this
                    .events_tx
                    .send(MasterEvent::Acquired {
                        master: record.value.clone(),
                        modified_index: record.modified_index,
                    })
                    .await;
            }
        } else {
            let (was_holding, changed) = {
                let mut st = this.state.lock().expect("lock state");
                let was_holding = st.holding;
                st.holding = false;
                let changed = st.master != record.value;
                st.master = record.value.clone();
                st.modified_index = record.modified_index;
                (was_holding, changed)
            };
            if was_holding {
                error!(key = %this.key, "lost lease");
                if let Some(tx) = this.state.lock().expect("lock state").refresh_stop.take() {
                    let _ = tx.send(());
                }
                let _ = this.events_tx.send(MasterEvent::Lost).await;
            }
            if changed {
                info!(key = %this.key, master = %record.value, "lease holder changed");
                let _ = this
                    .events_tx
                    .send(MasterEvent::Changed {
                        master: record.value.clone(),
                        modified_index: record.modified_index,
                    })
                    .await;
            }
        }
    }

    async fn handle_deleted(&self) {
        let was_holding = {
            let mut st = self.state.lock().expect("lock state");
            let was_holding = st.holding;
            st.holding = false;
            st.master.clear();
            was_holding
        };
        if was_holding {
            error!(key = %self.key, "lease key deleted while holding");
            if let Some(tx) = self.state.lock().expect("lock state").refresh_stop.take() {
                let _ = tx.send(());
            }
            let _ = self.events_tx.send(MasterEvent::Lost).await;
        }
    }

    async fn stop_acquire(&self) {
        let was_holding = {
            let mut st = self.state.lock().expect("lock state");
            let was_holding = st.holding;
            st.holding = false;
            st.master.clear();
            was_holding
        };
        if was_holding {
            info!(key = %self.key, "deleting held lease");
            if let Err(err) = self.client.delete(&self.key).await {
                error!(key = %self.key, error = ?err, "failed to delete held lease");
            }
            if let Some(tx) = self.state.lock().expect("lock state").refresh_stop.take() {
                let _ = tx.send(());
            }
        }
    }

    async fn refresh_loop(this: Arc<Self>, mut stop_rx: oneshot::Receiver<()>) {
        let period = Duration::from_millis(this.ttl_secs.saturating_mul(1000) * 4 / 10);
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    info!(key = %this.key, "refresh loop stopped");
                    return;
                }
                _ = tokio::time::sleep(period) => {
                    let prev = this.state.lock().expect("lock state").modified_index;
                    match this
                        .client
                        .compare_and_swap(&this.key, &this.id, this.ttl_secs, &this.id, prev)
                        .await
                    {
                        Ok((record, _)) => {
                            this.state.lock().expect("lock state").modified_index =
                                record.modified_index;
                        }
                        Err(CoordError::Transient(msg)) => {
                            warn!(key = %this.key, error = %msg, "lease refresh failed; will retry");
                        }
                        Err(err) => {
                            // The lease moved under us.
                            error!(key = %this.key, error = ?err, "lease refresh CAS rejected");
                            let was_holding = {
                                let mut st = this.state.lock().expect("lock state");
                                let was_holding = st.holding;
                                st.holding = false;
                                st.refresh_stop = None;
                                was_holding
                            };
                            if was_holding {
                                let _ = this.events_tx.send(MasterEvent::Lost).await;
                            }
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct MemRecord {
    value: String,
    ttl_secs: u64,
    modified_index: u64,
    expires_at: Instant,
}

struct MemState {
    index: u64,
    keys: HashMap<String, MemRecord>,
    /// Deletion index per key so watchers resumed after a delete see it.
    tombstones: HashMap<String, u64>,
}

struct MemInner {
    state: Mutex<MemState>,
    index_tx: watch::Sender<u64>,
}

/// In-process coordination service with TTL expiry, used by tests and
/// single-process deployments.
pub struct MemCoordService {
    inner: Arc<MemInner>,
}

impl MemCoordService {
    pub fn new() -> Self {
        let (index_tx, _) = watch::channel(0u64);
        let inner = Arc::new(MemInner {
            state: Mutex::new(MemState {
                index: 0,
                keys: HashMap::new(),
                tombstones: HashMap::new(),
            }),
            index_tx,
        });

        // Expiry sweeper; exits once the service itself is dropped.
        let weak: Weak<MemInner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(MEM_SWEEP_PERIOD).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let mut changed = false;
                {
                    let mut st = inner.state.lock().expect("coord state");
                    let now = Instant::now();
                    let expired: Vec<String> = st
                        .keys
                        .iter()
                        .filter(|(_, rec)| rec.expires_at <= now)
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in expired {
                        st.keys.remove(&key);
                        st.index += 1;
                        let index = st.index;
                        st.tombstones.insert(key, index);
                        changed = true;
                    }
                    if changed {
                        let _ = inner.index_tx.send(st.index);
                    }
                }
            }
        });

        Self { inner }
    }

    fn purge_expired(st: &mut MemState, key: &str) -> bool {
        let now = Instant::now();
        if st
            .keys
            .get(key)
            .map(|rec| rec.expires_at <= now)
            .unwrap_or(false)
        {
            st.keys.remove(key);
            st.index += 1;
            let index = st.index;
            st.tombstones.insert(key.to_string(), index);
            return true;
        }
        false
    }

    fn record_of(rec: &MemRecord) -> LockRecord {
        LockRecord {
            value: rec.value.clone(),
            ttl_secs: rec.ttl_secs,
            modified_index: rec.modified_index,
        }
    }
}

impl Default for MemCoordService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordClient for MemCoordService {
    async fn get(&self, key: &str) -> Result<(LockRecord, u64), CoordError> {
        let mut st = self.inner.state.lock().expect("coord state");
        let changed = Self::purge_expired(&mut st, key);
        if changed {
            let _ = self.inner.index_tx.send(st.index);
        }
        match st.keys.get(key) {
            Some(rec) => Ok((Self::record_of(rec), st.index)),
            None => Err(CoordError::NotFound),
        }
    }

    async fn create(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<(LockRecord, u64), CoordError> {
        let mut st = self.inner.state.lock().expect("coord state");
        Self::purge_expired(&mut st, key);
        if st.keys.contains_key(key) {
            return Err(CoordError::AlreadyExists);
        }
        st.index += 1;
        let rec = MemRecord {
            value: value.to_string(),
            ttl_secs,
            modified_index: st.index,
            expires_at: Instant::now() + Duration::from_secs(ttl_secs),
        };
        let out = Self::record_of(&rec);
        st.keys.insert(key.to_string(), rec);
        st.tombstones.remove(key);
        let _ = self.inner.index_tx.send(st.index);
        Ok((out, st.index))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
        prev_value: &str,
        prev_modified_index: u64,
    ) -> Result<(LockRecord, u64), CoordError> {
        let mut st = self.inner.state.lock().expect("coord state");
        Self::purge_expired(&mut st, key);
        st.index += 1;
        let index = st.index;
        let rec = st.keys.get_mut(key).ok_or(CoordError::NotFound)?;
        if rec.value != prev_value || rec.modified_index != prev_modified_index {
            return Err(CoordError::CasFailed);
        }
        rec.value = value.to_string();
        rec.ttl_secs = ttl_secs;
        rec.modified_index = index;
        rec.expires_at = Instant::now() + Duration::from_secs(ttl_secs);
        let out = Self::record_of(rec);
        let _ = self.inner.index_tx.send(index);
        Ok((out, index))
    }

    async fn delete(&self, key: &str) -> Result<(), CoordError> {
        let mut st = self.inner.state.lock().expect("coord state");
        if st.keys.remove(key).is_some() {
            st.index += 1;
            let index = st.index;
            st.tombstones.insert(key.to_string(), index);
            let _ = self.inner.index_tx.send(index);
        }
        Ok(())
    }

    async fn watch(
        &self,
        key: &str,
        after_index: u64,
        cancel: CancellationToken,
    ) -> Result<WatchResult, CoordError> {
        let mut index_rx = self.inner.index_tx.subscribe();
        loop {
            {
                let mut st = self.inner.state.lock().expect("coord state");
                let changed = Self::purge_expired(&mut st, key);
                if changed {
                    let _ = self.inner.index_tx.send(st.index);
                }
                if let Some(rec) = st.keys.get(key) {
                    if rec.modified_index > after_index {
                        return Ok(WatchResult {
                            record: Some(Self::record_of(rec)),
                            cluster_index: st.index,
                        });
                    }
                } else if let Some(deleted_at) = st.tombstones.get(key) {
                    if *deleted_at > after_index {
                        return Ok(WatchResult {
                            record: None,
                            cluster_index: st.index,
                        });
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(CoordError::Cancelled),
                res = index_rx.changed() => {
                    if res.is_err() {
                        return Err(CoordError::Transient("coordination service gone".into()));
                    }
                }
            }
        }
    }
}
