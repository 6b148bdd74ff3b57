//! Aggregate root: wires configuration, clock, outbox(es),
//! delta extractor, applier, transport and engine into one handle. This is
//! the crate's intended public entry point.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task;

use crate::action::{ActionEvent, ActionProcessor};
use crate::applier::{Applier, LwwResolver};
use crate::config::{OutboxBackendKind, SyncConfig, SyncStrategyKind};
use crate::delta::DeltaExtractor;
use crate::engine::{EngineSnapshot, PullFirstStrategy, PushFirstStrategy, SyncEngine, SyncEvent, SyncStrategy};
use crate::error::SyncResult;
use crate::hlc::Hlc;
use crate::message::{Action, RowDelta};
use crate::online::OnlineManager;
use crate::outbox::{MemoryOutboxBackend, Outbox, SqliteOutboxBackend};
use crate::scheduler::{Scheduler, process_actions_fn};
use crate::schema::{SchemaStore, TableSchema};
use crate::transport::TransportCapabilities;

pub struct LakesyncClient {
    config: SyncConfig,
    extractor: DeltaExtractor,
    engine: Arc<SyncEngine>,
    action_processor: Arc<ActionProcessor>,
    online: Arc<OnlineManager>,
    scheduler: Arc<Scheduler>,
    conn: Arc<AsyncMutex<Connection>>,
}

impl LakesyncClient {
    /// Wire a client from a fully-built `TransportCapabilities` (transports
    /// are supplied by the host at construction, never chosen by runtime
    /// capability reflection) and the rusqlite connection the host's local
    /// tables live on.
    pub async fn new(
        config: SyncConfig,
        conn: Arc<AsyncMutex<Connection>>,
        transport: TransportCapabilities,
    ) -> SyncResult<Arc<Self>> {
        {
            let init_conn = Arc::clone(&conn);
            task::spawn_blocking(move || -> SyncResult<()> {
                let guard = init_conn.blocking_lock();
                SchemaStore::init_schema_sync(&guard)?;
                Applier::init_schema_sync(&guard)?;
                Ok(())
            })
            .await??;
        }

        let clock = Arc::new(Hlc::new());
        let delta_outbox = Self::make_row_outbox(&config, &conn).await?;
        let action_outbox = Self::make_action_outbox(&config, &conn).await?;

        let extractor = DeltaExtractor::new(
            Arc::clone(&conn),
            Arc::clone(&clock),
            config.client_id.clone(),
            Arc::clone(&delta_outbox),
        );
        let applier = Arc::new(Applier::new(
            Arc::clone(&conn),
            Arc::clone(&delta_outbox),
            Arc::new(LwwResolver),
        ));

        let broadcast_cap = transport.broadcast.clone();
        let actions_cap = transport.actions.clone();
        let strategy: Arc<dyn SyncStrategy> = match config.strategy {
            SyncStrategyKind::PullFirst => Arc::new(PullFirstStrategy),
            SyncStrategyKind::PushFirst => Arc::new(PushFirstStrategy),
        };

        let engine = Arc::new(SyncEngine::new(
            config.client_id.clone(),
            Arc::clone(&clock),
            Arc::clone(&delta_outbox),
            applier,
            transport,
            config.sync_mode,
            config.max_retries,
            strategy,
        ));

        let action_processor = Arc::new(ActionProcessor::new(
            config.client_id.clone(),
            Arc::clone(&clock),
            action_outbox,
            actions_cap,
            config.max_action_retries,
        ));

        // Forward action completions onto the engine's own event bus too, so
        // a single `on_event` subscriber observes `action_complete` the way
        // the sync engine is specified to emit it, alongside push/pull events.
        let forwarding_engine = Arc::clone(&engine);
        action_processor.on_event(move |event| {
            if let ActionEvent::Complete { action_id, outcome } = event {
                forwarding_engine.emit_action_complete(action_id, outcome);
            }
        });

        let online = Arc::new(OnlineManager::new(true));
        let scheduler = Scheduler::new(
            Arc::clone(&engine),
            Some(Arc::clone(&action_processor)),
            Arc::clone(&online),
            config.auto_sync_interval_ms,
            config.realtime_heartbeat_ms,
        );

        if let Some(broadcast) = broadcast_cap {
            let broadcast_engine = Arc::clone(&engine);
            broadcast.on_broadcast(Box::new(move |resp| {
                let engine = Arc::clone(&broadcast_engine);
                tokio::spawn(async move {
                    let _ = engine.handle_broadcast(resp.deltas, resp.server_hlc).await;
                });
            }));
            broadcast.connect().await?;
        }

        Ok(Arc::new(Self {
            config,
            extractor,
            engine,
            action_processor,
            online,
            scheduler,
            conn,
        }))
    }

    async fn make_row_outbox(config: &SyncConfig, conn: &Arc<AsyncMutex<Connection>>) -> SyncResult<Arc<Outbox<RowDelta>>> {
        match config.backend {
            OutboxBackendKind::Memory => Ok(Arc::new(Outbox::new(Box::new(MemoryOutboxBackend::new())))),
            OutboxBackendKind::Persistent => {
                let init_conn = Arc::clone(conn);
                task::spawn_blocking(move || -> SyncResult<()> {
                    let guard = init_conn.blocking_lock();
                    SqliteOutboxBackend::<RowDelta>::init_schema_sync(&guard, "delta_outbox")
                })
                .await??;
                let backend = SqliteOutboxBackend::<RowDelta>::new(Arc::clone(conn), "delta_outbox")?;
                Ok(Arc::new(Outbox::new(Box::new(backend))))
            }
        }
    }

    async fn make_action_outbox(config: &SyncConfig, conn: &Arc<AsyncMutex<Connection>>) -> SyncResult<Arc<Outbox<Action>>> {
        match config.backend {
            OutboxBackendKind::Memory => Ok(Arc::new(Outbox::new(Box::new(MemoryOutboxBackend::new())))),
            OutboxBackendKind::Persistent => {
                let init_conn = Arc::clone(conn);
                task::spawn_blocking(move || -> SyncResult<()> {
                    let guard = init_conn.blocking_lock();
                    SqliteOutboxBackend::<Action>::init_schema_sync(&guard, "action_outbox")
                })
                .await??;
                let backend = SqliteOutboxBackend::<Action>::new(Arc::clone(conn), "action_outbox")?;
                Ok(Arc::new(Outbox::new(Box::new(backend))))
            }
        }
    }

    /// Register (or additively migrate) a table's schema.
    pub async fn register_table(&self, schema: TableSchema, version: i64) -> SyncResult<()> {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || -> SyncResult<()> {
            let guard = conn.blocking_lock();
            match SchemaStore::get_sync(&guard, &schema.table)? {
                Some(_) => SchemaStore::synchronise_sync(&guard, &schema.table, &schema, version),
                None => SchemaStore::register_sync(&guard, &schema, version),
            }
        })
        .await?
    }

    pub async fn insert(&self, table: &str, row_id: &str, data: HashMap<String, serde_json::Value>) -> SyncResult<()> {
        self.extractor.insert(table, row_id, data).await
    }

    pub async fn update(&self, table: &str, row_id: &str, patch: HashMap<String, serde_json::Value>) -> SyncResult<()> {
        self.extractor.update(table, row_id, patch).await
    }

    pub async fn delete(&self, table: &str, row_id: &str) -> SyncResult<()> {
        self.extractor.delete(table, row_id).await
    }

    /// Enqueue one action onto the durable action channel.
    pub async fn enqueue_action(
        &self,
        connector: impl Into<String>,
        action_type: impl Into<String>,
        params: HashMap<String, serde_json::Value>,
        idempotency_key: Option<String>,
    ) -> SyncResult<String> {
        self.action_processor
            .enqueue(connector, action_type, params, idempotency_key)
            .await
    }

    /// Run one sync cycle immediately, outside the scheduler's own tick.
    pub async fn sync_once(&self) -> SyncResult<()> {
        self.engine
            .sync_once(process_actions_fn(Some(Arc::clone(&self.action_processor))))
            .await
    }

    /// Start the background scheduler. Idempotent.
    pub async fn start(&self) {
        self.scheduler.start().await;
    }

    /// Stop the background scheduler. Idempotent.
    pub async fn stop(&self) {
        self.scheduler.stop().await;
    }

    /// Request an out-of-band sync cycle (e.g. the host app resumed to the
    /// foreground).
    pub fn force_sync(&self) {
        self.scheduler.force_sync();
    }

    /// Update network-reachability presence; a transition to online
    /// triggers an immediate cycle.
    pub fn set_online(&self, online: bool) -> bool {
        self.online.set_online(online)
    }

    pub async fn snapshot(&self) -> EngineSnapshot {
        self.engine.snapshot().await
    }

    pub fn on_event(&self, listener: impl Fn(SyncEvent) + Send + Sync + 'static) {
        self.engine.on_event(listener);
    }

    pub fn on_action_event(&self, listener: impl Fn(ActionEvent) + Send + Sync + 'static) {
        self.action_processor.on_event(listener);
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}
