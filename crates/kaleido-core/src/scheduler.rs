//! Query scheduler.
//!
//! Composes the cache, the priority queue, and the consolidator behind a
//! mailbox task. Guarantees that callers observe results in request
//! issuance order regardless of backend completion order:
//!
//! 1. Columnar requests are buffered for the remainder of the current
//!    scheduling turn so same-turn requests can be consolidated; exec and
//!    JSON requests dispatch immediately.
//! 2. At the turn boundary the buffer is partitioned into consolidation
//!    groups and queued by priority (FIFO within a rank).
//! 3. Every dispatch is checked against the cache by canonical query text;
//!    a hit resolves without contacting the backend.
//! 4. Dispatch is not serialized — up to `max_concurrent` requests may be
//!    in flight — but delivery is: a result reaches its caller only once
//!    every earlier-submitted request has been delivered.
//!
//! A scheduling turn is one drain of the mailbox plus a single
//! `yield_now`, so requests submitted in one synchronous burst share a
//! turn without any timer-imposed latency.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use fxhash::{FxHashMap, FxHashSet};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::cache::{CacheConfig, QueryCache};
use crate::connector::{Connector, ConnectorError, QueryKind, QueryRequest, QueryResponse};
use crate::consolidate::{self, Candidate, DemuxPlan};
use crate::queue::{Priority, PriorityQueue};
use crate::sql::canonical_key;
use crate::{Error, Result};

/// Configuration for the [`QueryScheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Result cache settings.
    pub cache: CacheConfig,
    /// Whether same-turn columnar requests are consolidated.
    pub consolidate: bool,
    /// Maximum queued dispatches concurrently in flight at the backend.
    /// Exec and JSON requests bypass this limit.
    pub max_concurrent: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            consolidate: true,
            max_concurrent: 8,
        }
    }
}

/// Identity of a submitted request, usable for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

/// A single-assignment future for one submitted request.
///
/// Pending until the backend has answered *and* every earlier-submitted
/// request has been delivered. Dropping the handle discards the eventual
/// result without affecting the dispatch.
#[derive(Debug)]
pub struct QueryResult {
    id: RequestId,
    rx: oneshot::Receiver<Result<QueryResponse>>,
}

impl QueryResult {
    /// The request identity, for [`QueryScheduler::cancel`].
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl Future for QueryResult {
    type Output = Result<QueryResponse>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|recv| recv.unwrap_or(Err(Error::Cancelled)))
    }
}

struct RecorderInner {
    log: Mutex<Vec<String>>,
    active: AtomicBool,
}

/// Handle observing every SQL string the scheduler dispatches.
///
/// Cache hits and coalesced in-flight shares are not dispatches and do not
/// appear in the log.
pub struct QueryRecorder {
    inner: Arc<RecorderInner>,
}

impl QueryRecorder {
    /// Copies the dispatched SQL log.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.inner.log.lock().clone()
    }

    /// Takes and clears the dispatched SQL log.
    #[must_use]
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.inner.log.lock())
    }

    /// Stops recording.
    pub fn stop(&self) {
        self.inner.active.store(false, Ordering::Relaxed);
    }
}

impl Drop for QueryRecorder {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Msg {
    Submit(Submission),
    Cancel(Vec<RequestId>),
    Complete {
        dispatch: u64,
        outcome: std::result::Result<QueryResponse, ConnectorError>,
    },
    ExportCache(oneshot::Sender<Result<String>>),
    ImportCache(String, oneshot::Sender<Result<()>>),
    ClearCache,
    Shutdown,
}

struct Submission {
    id: RequestId,
    req: QueryRequest,
    priority: Priority,
    tx: oneshot::Sender<Result<QueryResponse>>,
}

/// The query scheduler handle. Cheap to clone; all clones feed one
/// mailbox task.
///
/// Requires a running tokio runtime at construction time.
#[derive(Clone)]
pub struct QueryScheduler {
    tx: mpsc::UnboundedSender<Msg>,
    next_id: Arc<AtomicU64>,
    recorders: Arc<Mutex<Vec<Arc<RecorderInner>>>>,
}

impl QueryScheduler {
    /// Creates a scheduler over the given connector and spawns its task.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, config: SchedulerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let recorders = Arc::new(Mutex::new(Vec::new()));
        let task = SchedulerTask::new(connector, config, tx.clone(), Arc::clone(&recorders));
        tokio::spawn(task.run(rx));
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(0)),
            recorders,
        }
    }

    /// Submits a request at the given priority.
    ///
    /// Always returns a handle; if the scheduler has shut down the handle
    /// resolves to [`Error::SchedulerShutdown`].
    pub fn request(&self, req: QueryRequest, priority: Priority) -> QueryResult {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (result_tx, result_rx) = oneshot::channel();
        let msg = Msg::Submit(Submission {
            id,
            req,
            priority,
            tx: result_tx,
        });
        if let Err(mpsc::error::SendError(msg)) = self.tx.send(msg) {
            if let Msg::Submit(submission) = msg {
                let _ = submission.tx.send(Err(Error::SchedulerShutdown));
            }
        }
        QueryResult { id, rx: result_rx }
    }

    /// Cancels queued-but-undispatched requests by identity.
    ///
    /// Already-dispatched requests are unaffected; their results are
    /// delivered (or discarded by the caller) as usual.
    pub fn cancel(&self, ids: &[RequestId]) {
        if !ids.is_empty() {
            let _ = self.tx.send(Msg::Cancel(ids.to_vec()));
        }
    }

    /// Starts recording dispatched SQL.
    #[must_use]
    pub fn record(&self) -> QueryRecorder {
        let inner = Arc::new(RecorderInner {
            log: Mutex::new(Vec::new()),
            active: AtomicBool::new(true),
        });
        self.recorders.lock().push(Arc::clone(&inner));
        QueryRecorder { inner }
    }

    /// Serializes the result cache to a blob the embedding application
    /// can persist (cache contents are otherwise not durable).
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchedulerShutdown`] if the scheduler is gone, or
    /// [`Error::CacheSerde`] if a result cannot be encoded.
    pub async fn export_cache(&self) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Msg::ExportCache(tx))
            .map_err(|_| Error::SchedulerShutdown)?;
        rx.await.map_err(|_| Error::SchedulerShutdown)?
    }

    /// Restores cache entries from a blob produced by
    /// [`QueryScheduler::export_cache`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchedulerShutdown`] if the scheduler is gone, or
    /// [`Error::CacheSerde`] if the blob is malformed.
    pub async fn import_cache(&self, blob: impl Into<String>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Msg::ImportCache(blob.into(), tx))
            .map_err(|_| Error::SchedulerShutdown)?;
        rx.await.map_err(|_| Error::SchedulerShutdown)?
    }

    /// Drops every cached result.
    pub fn clear_cache(&self) {
        let _ = self.tx.send(Msg::ClearCache);
    }

    /// Shuts the scheduler down. Pending requests resolve to
    /// [`Error::SchedulerShutdown`].
    pub fn shutdown(&self) {
        let _ = self.tx.send(Msg::Shutdown);
    }
}

struct Constituent {
    id: RequestId,
    seq: u64,
    cache_key: Option<String>,
    demux: Option<DemuxPlan>,
}

struct Unit {
    sql: String,
    kind: QueryKind,
    constituents: Vec<Constituent>,
}

struct Dispatch {
    constituents: Vec<Constituent>,
    counted: bool,
    share_key: Option<String>,
}

struct Buffered {
    id: RequestId,
    seq: u64,
    req: QueryRequest,
    priority: Priority,
}

struct SchedulerTask {
    connector: Arc<dyn Connector>,
    config: SchedulerConfig,
    cache: QueryCache,
    queue: PriorityQueue<Unit>,
    turn: Vec<Buffered>,
    next_seq: u64,
    next_deliver: u64,
    senders: FxHashMap<u64, oneshot::Sender<Result<QueryResponse>>>,
    ready: BTreeMap<u64, Result<QueryResponse>>,
    dispatches: FxHashMap<u64, Dispatch>,
    inflight_keys: FxHashMap<String, u64>,
    counted_inflight: usize,
    next_dispatch: u64,
    complete_tx: mpsc::UnboundedSender<Msg>,
    recorders: Arc<Mutex<Vec<Arc<RecorderInner>>>>,
}

impl SchedulerTask {
    fn new(
        connector: Arc<dyn Connector>,
        config: SchedulerConfig,
        complete_tx: mpsc::UnboundedSender<Msg>,
        recorders: Arc<Mutex<Vec<Arc<RecorderInner>>>>,
    ) -> Self {
        let cache = QueryCache::new(config.cache.clone());
        Self {
            connector,
            config,
            cache,
            queue: PriorityQueue::new(),
            turn: Vec::new(),
            next_seq: 0,
            next_deliver: 0,
            senders: FxHashMap::default(),
            ready: BTreeMap::default(),
            dispatches: FxHashMap::default(),
            inflight_keys: FxHashMap::default(),
            counted_inflight: 0,
            next_dispatch: 0,
            complete_tx,
            recorders,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Msg>) {
        loop {
            let Some(msg) = rx.recv().await else { break };
            let mut shutdown = self.handle(msg);
            while let Ok(msg) = rx.try_recv() {
                shutdown |= self.handle(msg);
            }
            // Admit submissions made in the same tick before closing the
            // consolidation turn.
            tokio::task::yield_now().await;
            while let Ok(msg) = rx.try_recv() {
                shutdown |= self.handle(msg);
            }
            self.flush_turn();
            self.pump();
            self.deliver();
            if shutdown {
                break;
            }
        }
        for (_, tx) in self.senders.drain() {
            let _ = tx.send(Err(Error::SchedulerShutdown));
        }
    }

    fn handle(&mut self, msg: Msg) -> bool {
        match msg {
            Msg::Submit(submission) => self.submit(submission),
            Msg::Cancel(ids) => self.cancel(&ids),
            Msg::Complete { dispatch, outcome } => self.complete(dispatch, outcome),
            Msg::ExportCache(tx) => {
                let _ = tx.send(self.cache.export());
            }
            Msg::ImportCache(blob, tx) => {
                let _ = tx.send(self.cache.import(&blob));
            }
            Msg::ClearCache => self.cache.clear(),
            Msg::Shutdown => return true,
        }
        false
    }

    fn submit(&mut self, submission: Submission) {
        let Submission {
            id,
            req,
            priority,
            tx,
        } = submission;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.senders.insert(seq, tx);

        if req.kind == QueryKind::Columnar && self.config.consolidate {
            self.turn.push(Buffered {
                id,
                seq,
                req,
                priority,
            });
            return;
        }

        let cache_key = self.cache_key(&req);
        if let Some(hit) = self.probe(cache_key.as_deref()) {
            self.ready.insert(seq, Ok(hit));
            return;
        }

        let unit = Unit {
            sql: req.sql,
            kind: req.kind,
            constituents: vec![Constituent {
                id,
                seq,
                cache_key,
                demux: None,
            }],
        };
        if req.kind == QueryKind::Columnar {
            self.queue.push(priority, unit);
        } else {
            // Exec/JSON bypass consolidation and the concurrency cap.
            self.dispatch(unit, false);
        }
    }

    fn cache_key(&self, req: &QueryRequest) -> Option<String> {
        (req.cache && self.cache.enabled()).then(|| canonical_key(req.kind, &req.sql))
    }

    fn probe(&mut self, key: Option<&str>) -> Option<QueryResponse> {
        self.cache.get(key?)
    }

    /// Closes the current consolidation turn: partitions the buffer into
    /// compatibility groups and queues one dispatch unit per group.
    fn flush_turn(&mut self) {
        if self.turn.is_empty() {
            return;
        }
        let mut groups: Vec<(Option<String>, Vec<(Buffered, Option<Candidate>)>)> = Vec::new();
        for buffered in std::mem::take(&mut self.turn) {
            let key = self.cache_key(&buffered.req);
            if let Some(hit) = self.probe(key.as_deref()) {
                self.ready.insert(buffered.seq, Ok(hit));
                continue;
            }
            let cand = consolidate::candidate(&buffered.req.sql);
            let group_key = cand.as_ref().map(|c| c.key.clone());
            match groups
                .iter_mut()
                .find(|(key, _)| key.is_some() && *key == group_key)
            {
                Some((_, members)) => members.push((buffered, cand)),
                None => groups.push((group_key, vec![(buffered, cand)])),
            }
        }

        for (_, members) in groups {
            let seqs: Vec<u64> = members.iter().map(|(b, _)| b.seq).collect();
            match self.build_unit(members) {
                Ok(Some((priority, unit))) => self.queue.push(priority, unit),
                Ok(None) => {}
                Err(err) => {
                    // Never leave a sequence number unresolved: the
                    // delivery order would stall behind it.
                    tracing::warn!(error = %err, "query consolidation failed");
                    let message = err.to_string();
                    for seq in seqs {
                        self.ready
                            .insert(seq, Err(Error::ResultShape(message.clone())));
                    }
                }
            }
        }
    }

    /// Builds one dispatch unit for a compatibility group. Groups whose
    /// members all share one SQL text dispatch it once with no demux;
    /// groups with two or more distinct texts dispatch a merged query.
    fn build_unit(
        &self,
        members: Vec<(Buffered, Option<Candidate>)>,
    ) -> Result<Option<(Priority, Unit)>> {
        let Some((first, _)) = members.first() else {
            return Ok(None);
        };
        let priority = members
            .iter()
            .map(|(b, _)| b.priority)
            .min()
            .unwrap_or_default();
        let kind = first.req.kind;

        let distinct: FxHashSet<&str> = members
            .iter()
            .map(|(b, _)| b.req.sql.trim())
            .collect();
        if distinct.len() <= 1 {
            let sql = first.req.sql.clone();
            let constituents = members
                .into_iter()
                .map(|(b, _)| Constituent {
                    id: b.id,
                    seq: b.seq,
                    cache_key: self.cache_key(&b.req),
                    demux: None,
                })
                .collect();
            return Ok(Some((
                priority,
                Unit {
                    sql,
                    kind,
                    constituents,
                },
            )));
        }

        let candidates: Vec<&Candidate> = members
            .iter()
            .filter_map(|(_, cand)| cand.as_ref())
            .collect();
        debug_assert_eq!(candidates.len(), members.len());
        let (sql, plans) = consolidate::merge(&candidates)?;
        tracing::debug!(constituents = members.len(), "consolidated query group");
        let constituents = members
            .iter()
            .zip(plans)
            .map(|((b, _), plan)| Constituent {
                id: b.id,
                seq: b.seq,
                cache_key: self.cache_key(&b.req),
                demux: Some(plan),
            })
            .collect();
        Ok(Some((
            priority,
            Unit {
                sql,
                kind,
                constituents,
            },
        )))
    }

    /// Starts queued dispatches while capacity allows.
    fn pump(&mut self) {
        while self.counted_inflight < self.config.max_concurrent {
            let Some(unit) = self.queue.pop() else { break };

            // A completion may have populated the cache since the unit was
            // queued; single-query units can still be served from it.
            if !unit.constituents.is_empty() && unit.constituents.iter().all(|c| c.demux.is_none())
            {
                if let Some(hit) = self.probe(unit.constituents[0].cache_key.as_deref()) {
                    for constituent in unit.constituents {
                        self.ready.insert(constituent.seq, Ok(hit.clone()));
                    }
                    continue;
                }
            }

            // Share an identical dispatch already in flight.
            let share_key = canonical_key(unit.kind, &unit.sql);
            if let Some(&dispatch_id) = self.inflight_keys.get(&share_key) {
                if let Some(dispatch) = self.dispatches.get_mut(&dispatch_id) {
                    dispatch.constituents.extend(unit.constituents);
                    continue;
                }
            }

            self.dispatch(unit, true);
        }
    }

    fn dispatch(&mut self, unit: Unit, counted: bool) {
        let dispatch_id = self.next_dispatch;
        self.next_dispatch += 1;
        if counted {
            self.counted_inflight += 1;
        }

        {
            let mut recorders = self.recorders.lock();
            recorders.retain(|r| r.active.load(Ordering::Relaxed));
            for recorder in recorders.iter() {
                recorder.log.lock().push(unit.sql.clone());
            }
        }

        let share_key = (unit.kind == QueryKind::Columnar).then(|| {
            let key = canonical_key(unit.kind, &unit.sql);
            self.inflight_keys.insert(key.clone(), dispatch_id);
            key
        });
        self.dispatches.insert(
            dispatch_id,
            Dispatch {
                constituents: unit.constituents,
                counted,
                share_key,
            },
        );

        let connector = Arc::clone(&self.connector);
        let complete_tx = self.complete_tx.clone();
        let request = QueryRequest {
            kind: unit.kind,
            sql: unit.sql,
            cache: false,
        };
        tokio::spawn(async move {
            let outcome = connector.query(request).await;
            let _ = complete_tx.send(Msg::Complete {
                dispatch: dispatch_id,
                outcome,
            });
        });
    }

    fn complete(
        &mut self,
        dispatch_id: u64,
        outcome: std::result::Result<QueryResponse, ConnectorError>,
    ) {
        let Some(dispatch) = self.dispatches.remove(&dispatch_id) else {
            return;
        };
        if dispatch.counted {
            self.counted_inflight -= 1;
        }
        if let Some(key) = &dispatch.share_key {
            self.inflight_keys.remove(key);
        }

        match outcome {
            Ok(response) => {
                for constituent in dispatch.constituents {
                    let result = match &constituent.demux {
                        None => Ok(response.clone()),
                        Some(plan) => response
                            .table()
                            .ok_or_else(|| {
                                Error::ResultShape(
                                    "consolidated dispatch returned a non-columnar result"
                                        .to_string(),
                                )
                            })
                            .and_then(|batch| consolidate::demux(batch, plan))
                            .map(QueryResponse::Table),
                    };
                    if let (Ok(value), Some(key)) = (&result, &constituent.cache_key) {
                        self.cache.put(key.clone(), value.clone());
                    }
                    self.ready.insert(constituent.seq, result);
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "backend query failed");
                for constituent in dispatch.constituents {
                    self.ready
                        .insert(constituent.seq, Err(Error::Connector(err.clone())));
                }
            }
        }
    }

    fn cancel(&mut self, ids: &[RequestId]) {
        let targets: FxHashSet<RequestId> = ids.iter().copied().collect();
        let mut removed: Vec<u64> = Vec::new();

        self.turn.retain(|buffered| {
            if targets.contains(&buffered.id) {
                removed.push(buffered.seq);
                false
            } else {
                true
            }
        });
        self.queue.retain_mut(|unit| {
            unit.constituents.retain(|constituent| {
                if targets.contains(&constituent.id) {
                    removed.push(constituent.seq);
                    false
                } else {
                    true
                }
            });
            !unit.constituents.is_empty()
        });

        for seq in removed {
            self.ready.insert(seq, Err(Error::Cancelled));
        }
    }

    /// Delivers ready results strictly in issuance order.
    fn deliver(&mut self) {
        while let Some(result) = self.ready.remove(&self.next_deliver) {
            if let Some(tx) = self.senders.remove(&self.next_deliver) {
                let _ = tx.send(result);
            }
            self.next_deliver += 1;
        }
    }
}
