//! The coordinator façade.
//!
//! Owns the client registry and wires clients, selections, the scheduler,
//! and the pre-aggregator together. Per client the update protocol is:
//!
//! 1. `connect_client`: column metadata (`fields` → one statistics query
//!    each → `field_info`), then the initial data query.
//! 2. On every `value` event of the client's selection: plan through the
//!    pre-aggregator (accelerated / direct / skip), submit, and deliver
//!    through `query_pending` / `query_result` / `query_error`.
//! 3. On `activate` hints: warm the materialized view only.
//!
//! Each client listens on its selection through a `watch` receiver, so a
//! client still processing one update simply observes the latest selection
//! state next — intermediate updates coalesce away and a slow client never
//! builds a backlog. One client's failure is delivered to that client
//! alone; the coordinator itself never unwinds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::client::{Client, ClientId, FieldInfo, FieldRequest};
use crate::connector::{Connector, QueryRequest, QueryResponse};
use crate::mv::{Plan, PreAggConfig, PreAggregator};
use crate::queue::Priority;
use crate::scheduler::{QueryResult, QueryScheduler, SchedulerConfig};
use crate::selection::Selection;
use crate::{Error, Result};

/// Configuration for a [`Coordinator`].
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    /// Scheduler settings (cache, consolidation, concurrency).
    pub scheduler: SchedulerConfig,
    /// Pre-aggregation settings (enable flag, view namespace).
    pub preagg: PreAggConfig,
}

struct ClientEntry {
    client: Arc<dyn Client>,
    selection: Option<Selection>,
    shutdown: watch::Sender<bool>,
}

struct Inner {
    scheduler: QueryScheduler,
    preagg: PreAggregator,
    clients: Mutex<FxHashMap<ClientId, ClientEntry>>,
    next_client: AtomicU64,
}

/// The top-level façade coordinating clients against one backend.
///
/// Cheap to clone; all clones share one scheduler, cache, and view
/// registry. Requires a running tokio runtime at construction time.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Creates a coordinator with default configuration.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_config(connector, CoordinatorConfig::default())
    }

    /// Creates a coordinator with the given configuration.
    #[must_use]
    pub fn with_config(connector: Arc<dyn Connector>, config: CoordinatorConfig) -> Self {
        let scheduler = QueryScheduler::new(connector, config.scheduler);
        let preagg = PreAggregator::new(scheduler.clone(), config.preagg);
        Self {
            inner: Arc::new(Inner {
                scheduler,
                preagg,
                clients: Mutex::new(FxHashMap::default()),
                next_client: AtomicU64::new(0),
            }),
        }
    }

    /// The underlying scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &QueryScheduler {
        &self.inner.scheduler
    }

    /// The pre-aggregator (administrative surface: `set_enabled`,
    /// `drop_materialized_views`, `drop_schema`).
    #[must_use]
    pub fn preaggregator(&self) -> &PreAggregator {
        &self.inner.preagg
    }

    /// Submits a raw request through the scheduler.
    pub fn request(&self, req: QueryRequest, priority: Priority) -> QueryResult {
        self.inner.scheduler.request(req, priority)
    }

    /// Submits a request at normal priority and awaits its result.
    ///
    /// # Errors
    ///
    /// Propagates scheduler and backend errors.
    pub async fn query(&self, req: QueryRequest) -> Result<QueryResponse> {
        self.inner.scheduler.request(req, Priority::Normal).await
    }

    /// Executes an effect-only statement.
    ///
    /// # Errors
    ///
    /// Propagates scheduler and backend errors.
    pub async fn exec(&self, sql: impl Into<String>) -> Result<()> {
        self.inner
            .scheduler
            .request(QueryRequest::exec(sql), Priority::Normal)
            .await?;
        Ok(())
    }

    /// Connects a client: delivers its field metadata, issues its initial
    /// query, and subscribes it to its selection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientAlreadyConnected`] if this exact client is
    /// already registered (programmer error, checked immediately).
    pub async fn connect_client(&self, client: Arc<dyn Client>) -> Result<ClientId> {
        {
            let clients = self.inner.clients.lock();
            for (existing, entry) in clients.iter() {
                if Arc::ptr_eq(&entry.client, &client) {
                    return Err(Error::ClientAlreadyConnected(*existing));
                }
            }
        }
        let id = ClientId(self.inner.next_client.fetch_add(1, Ordering::Relaxed));

        let requests = client.fields();
        if !requests.is_empty() {
            let infos = self.field_infos(requests).await?;
            client.field_info(&infos);
        }

        let selection = client.filter_by();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.inner.clients.lock().insert(
            id,
            ClientEntry {
                client: Arc::clone(&client),
                selection: selection.clone(),
                shutdown: shutdown_tx,
            },
        );

        Self::update(&self.inner, id).await;

        if let Some(selection) = selection {
            self.spawn_listener(id, client, selection, shutdown_rx);
        }
        Ok(id)
    }

    /// Disconnects a client and forgets its acceleration state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientNotFound`] for an unknown id.
    pub fn disconnect_client(&self, id: ClientId) -> Result<()> {
        let entry = self
            .inner
            .clients
            .lock()
            .remove(&id)
            .ok_or(Error::ClientNotFound(id))?;
        entry.shutdown.send_replace(true);
        self.inner.preagg.forget_client(id);
        Ok(())
    }

    /// Re-runs the update protocol for one client now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientNotFound`] for an unknown id; query failures
    /// are delivered through the client's `query_error` instead.
    pub async fn update_client(&self, id: ClientId) -> Result<()> {
        if !self.inner.clients.lock().contains_key(&id) {
            return Err(Error::ClientNotFound(id));
        }
        Self::update(&self.inner, id).await;
        Ok(())
    }

    /// Disconnects every client and shuts the scheduler down.
    pub fn shutdown(&self) {
        let ids: Vec<ClientId> = self.inner.clients.lock().keys().copied().collect();
        for id in ids {
            let _ = self.disconnect_client(id);
        }
        self.inner.scheduler.shutdown();
    }

    fn spawn_listener(
        &self,
        id: ClientId,
        client: Arc<dyn Client>,
        selection: Selection,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let inner = Arc::downgrade(&self.inner);
        let mut value_rx = selection.subscribe();
        let mut activate_rx = selection.subscribe_activation();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = value_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let Some(inner) = inner.upgrade() else { break };
                        Coordinator::update(&inner, id).await;
                    }
                    changed = activate_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let Some(inner) = inner.upgrade() else { break };
                        inner.preagg.prepare(id, client.as_ref(), &selection);
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
    }

    async fn update(inner: &Arc<Inner>, id: ClientId) {
        let (client, selection) = {
            let clients = inner.clients.lock();
            let Some(entry) = clients.get(&id) else { return };
            (Arc::clone(&entry.client), entry.selection.clone())
        };
        match Self::client_request(inner, id, client.as_ref(), selection.as_ref()).await {
            Ok(Some(result)) => client.query_result(&result),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(client = %id, error = %err, "client query failed");
                client.query_error(&err);
            }
        }
    }

    async fn client_request(
        inner: &Arc<Inner>,
        id: ClientId,
        client: &dyn Client,
        selection: Option<&Selection>,
    ) -> Result<Option<QueryResponse>> {
        let sql = match selection {
            None => client.query(&[]).map(|query| query.to_string()),
            Some(selection) => match inner.preagg.plan(id, client, selection) {
                Plan::Skip => return Ok(None),
                Plan::Accelerated(mut accelerated) => {
                    client.query_pending();
                    accelerated.ready().await;
                    let result = inner
                        .scheduler
                        .request(QueryRequest::columnar(accelerated.sql), Priority::Normal)
                        .await?;
                    return Ok(Some(result));
                }
                Plan::Direct => {
                    let Some(filter) = selection.predicate(Some(id)) else {
                        return Ok(None);
                    };
                    client.query(&filter).map(|query| query.to_string())
                }
            },
        };
        let Some(sql) = sql else { return Ok(None) };
        client.query_pending();
        let result = inner
            .scheduler
            .request(QueryRequest::columnar(sql), Priority::Normal)
            .await?;
        Ok(Some(result))
    }

    async fn field_infos(&self, requests: Vec<FieldRequest>) -> Result<Vec<FieldInfo>> {
        let mut infos = Vec::with_capacity(requests.len());
        for request in requests {
            let mut stats = serde_json::Map::new();
            if !request.stats.is_empty() {
                let exprs: Vec<String> = request
                    .stats
                    .iter()
                    .map(|stat| format!("{} AS {}", stat.expression(&request.column), stat.name()))
                    .collect();
                let sql = format!("SELECT {} FROM {}", exprs.join(", "), request.table);
                let response = self
                    .inner
                    .scheduler
                    .request(QueryRequest::json(sql).with_cache(true), Priority::High)
                    .await?;
                if let Some(serde_json::Value::Object(row)) =
                    response.rows().and_then(<[_]>::first)
                {
                    stats = row.clone();
                }
            }
            infos.push(FieldInfo {
                table: request.table,
                column: request.column,
                stats,
            });
        }
        Ok(infos)
    }
}
