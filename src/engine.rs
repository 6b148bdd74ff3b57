//! Sync engine: orchestrates push/pull/checkpoint/action
//! cycles, owns the monotonic `last_synced_hlc`/`last_sync_time`/`syncing`
//! state, and emits the engine event stream. The push/pull steps are driven
//! by caller-supplied closures rather than an owned transport, with the full
//! ordering, a re-entrancy guard, and an event bus layered on top.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::applier::Applier;
use crate::config::SyncMode;
use crate::error::SyncResult;
use crate::hlc::{Hlc, HlcTimestamp};
use crate::message::{ActionOutcome, RowDelta, SyncPull, SyncPush};
use crate::outbox::Outbox;
use crate::transport::TransportCapabilities;

/// A boxed, one-shot async action-processing step, run as part of a sync
/// cycle. Kept as a closure parameter rather than an owned field so the
/// engine stays decoupled from the action processor.
pub type ProcessActionsFn = Box<dyn FnOnce() -> BoxFuture<'static, SyncResult<()>> + Send>;

async fn noop_actions() -> SyncResult<()> {
    Ok(())
}

pub fn no_actions() -> ProcessActionsFn {
    Box::new(|| Box::pin(noop_actions()))
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    SyncStart,
    SyncComplete,
    RemoteDeltasApplied(usize),
    DeadLettered(usize),
    ActionComplete { action_id: String, result: ActionOutcome },
}

#[derive(Debug, Clone, Copy)]
pub struct PushOutcome {
    pub dead_lettered: usize,
    pub pushed: usize,
}

/// Read-only snapshot of engine state.
#[derive(Debug, Clone, Copy)]
pub struct EngineSnapshot {
    pub last_synced_hlc: HlcTimestamp,
    pub last_sync_time: Option<i64>,
    pub syncing: bool,
}

/// Pluggable ordering of the push/pull/checkpoint steps within one cycle.
#[async_trait]
pub trait SyncStrategy: Send + Sync {
    async fn run(&self, engine: &SyncEngine, process_actions: ProcessActionsFn) -> SyncResult<()>;
}

/// Default ordering: checkpoint (if first sync) → pull → push → actions.
pub struct PullFirstStrategy;

#[async_trait]
impl SyncStrategy for PullFirstStrategy {
    async fn run(&self, engine: &SyncEngine, process_actions: ProcessActionsFn) -> SyncResult<()> {
        if engine.mode != SyncMode::PushOnly {
            engine.initial_sync().await?;
            engine.pull(None).await?;
        }
        if engine.mode != SyncMode::PullOnly {
            engine.push().await?;
        }
        process_actions().await
    }
}

/// Offline-first ordering: push local work before pulling remote changes.
pub struct PushFirstStrategy;

#[async_trait]
impl SyncStrategy for PushFirstStrategy {
    async fn run(&self, engine: &SyncEngine, process_actions: ProcessActionsFn) -> SyncResult<()> {
        if engine.mode != SyncMode::PullOnly {
            engine.push().await?;
        }
        if engine.mode != SyncMode::PushOnly {
            engine.initial_sync().await?;
            engine.pull(None).await?;
        }
        process_actions().await
    }
}

/// The push/pull/checkpoint state machine and its conflict-resolving
/// applier.
pub struct SyncEngine {
    client_id: String,
    clock: Arc<Hlc>,
    outbox: Arc<Outbox<RowDelta>>,
    applier: Arc<Applier>,
    transport: TransportCapabilities,
    mode: SyncMode,
    max_retries: u32,
    strategy: Arc<dyn SyncStrategy>,
    last_synced_hlc: AsyncMutex<HlcTimestamp>,
    last_sync_time: AsyncMutex<Option<i64>>,
    syncing: AtomicBool,
    listeners: std::sync::Mutex<Vec<Arc<dyn Fn(SyncEvent) + Send + Sync>>>,
}

const PUSH_BATCH: i64 = 100;
const PULL_MAX_DELTAS: i64 = 1000;

impl SyncEngine {
    pub fn new(
        client_id: String,
        clock: Arc<Hlc>,
        outbox: Arc<Outbox<RowDelta>>,
        applier: Arc<Applier>,
        transport: TransportCapabilities,
        mode: SyncMode,
        max_retries: u32,
        strategy: Arc<dyn SyncStrategy>,
    ) -> Self {
        Self {
            client_id,
            clock,
            outbox,
            applier,
            transport,
            mode,
            max_retries,
            strategy,
            last_synced_hlc: AsyncMutex::new(HlcTimestamp::ZERO),
            last_sync_time: AsyncMutex::new(None),
            syncing: AtomicBool::new(false),
            listeners: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn on_event(&self, listener: impl Fn(SyncEvent) + Send + Sync + 'static) {
        self.listeners.lock().expect("listeners mutex poisoned").push(Arc::new(listener));
    }

    /// Dispatch an event to every listener inside a guarded frame: a
    /// panicking listener is swallowed so it cannot break the engine.
    fn emit(&self, event: SyncEvent) {
        let listeners = self.listeners.lock().expect("listeners mutex poisoned").clone();
        for listener in listeners {
            let event = event.clone();
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!("sync event listener panicked; ignoring");
            }
        }
    }

    pub async fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            last_synced_hlc: *self.last_synced_hlc.lock().await,
            last_sync_time: *self.last_sync_time.lock().await,
            syncing: self.syncing.load(Ordering::SeqCst),
        }
    }

    async fn touch_last_sync_time(&self) {
        let mut guard = self.last_sync_time.lock().await;
        *guard = Some(crate::outbox::now_ms());
    }

    /// Peek up to 100 entries, dead-letter any that exhausted
    /// `max_retries`, push the rest, ack on success / nack on failure.
    pub async fn push(&self) -> SyncResult<PushOutcome> {
        let entries = self.outbox.peek(PUSH_BATCH).await?;
        let (dead, live): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .partition(|e| e.retry_count >= self.max_retries);

        if !dead.is_empty() {
            let ids: Vec<String> = dead.iter().map(|e| e.id.clone()).collect();
            self.outbox.ack(&ids).await?;
            self.emit(SyncEvent::DeadLettered(dead.len()));
        }

        if live.is_empty() {
            return Ok(PushOutcome {
                dead_lettered: dead.len(),
                pushed: 0,
            });
        }

        let ids: Vec<String> = live.iter().map(|e| e.id.clone()).collect();
        self.outbox.mark_sending(&ids).await?;

        let req = SyncPush {
            client_id: self.client_id.clone(),
            deltas: live.iter().map(|e| e.item.clone()).collect(),
            last_seen_hlc: self.clock.now(),
        };

        match self.transport.transport.push(req).await {
            Ok(resp) => {
                self.outbox.ack(&ids).await?;
                let mut guard = self.last_synced_hlc.lock().await;
                *guard = resp.server_hlc;
                drop(guard);
                self.touch_last_sync_time().await;
                Ok(PushOutcome {
                    dead_lettered: dead.len(),
                    pushed: ids.len(),
                })
            }
            Err(e) => {
                self.outbox.nack(&ids).await?;
                Err(e)
            }
        }
    }

    /// Pull since `last_synced_hlc`; transport errors or an empty
    /// response return 0 rather than propagating, since a failed pull is
    /// simply retried on the next cycle.
    pub async fn pull(&self, source: Option<String>) -> SyncResult<usize> {
        let since = *self.last_synced_hlc.lock().await;
        let req = SyncPull {
            client_id: self.client_id.clone(),
            since_hlc: since,
            max_deltas: PULL_MAX_DELTAS,
            source,
        };

        let response = match self.transport.transport.pull(req).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "pull failed, will retry next cycle");
                return Ok(0);
            }
        };

        if response.deltas.is_empty() {
            return Ok(0);
        }

        let applied = self.applier.apply(response.deltas).await?;
        self.emit(SyncEvent::RemoteDeltasApplied(applied));
        let mut guard = self.last_synced_hlc.lock().await;
        *guard = response.server_hlc;
        drop(guard);
        self.touch_last_sync_time().await;
        Ok(applied)
    }

    /// Checkpoint bootstrap, only when never synced. A null/error/
    /// empty checkpoint result falls through to an incremental pull on the
    /// same tick.
    async fn initial_sync(&self) -> SyncResult<()> {
        let last = *self.last_synced_hlc.lock().await;
        if !last.is_zero() {
            return Ok(());
        }
        let Some(checkpoint) = &self.transport.checkpoint else {
            return Ok(());
        };

        match checkpoint.checkpoint().await {
            Ok(Some(resp)) if !resp.deltas.is_empty() || !resp.snapshot_hlc.is_zero() => {
                let applied = self.applier.apply(resp.deltas).await?;
                self.emit(SyncEvent::RemoteDeltasApplied(applied));
                let mut guard = self.last_synced_hlc.lock().await;
                *guard = resp.snapshot_hlc;
                drop(guard);
                self.touch_last_sync_time().await;
                info!(applied, "initial checkpoint sync complete");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "checkpoint failed, falling back to incremental pull");
            }
        }
        Ok(())
    }

    /// Apply a server-pushed broadcast batch and advance the
    /// cursor to at least `server_hlc`.
    pub async fn handle_broadcast(&self, deltas: Vec<RowDelta>, server_hlc: HlcTimestamp) -> SyncResult<usize> {
        let applied = self.applier.apply(deltas).await?;
        self.emit(SyncEvent::RemoteDeltasApplied(applied));
        let mut guard = self.last_synced_hlc.lock().await;
        *guard = (*guard).max(server_hlc);
        Ok(applied)
    }

    pub fn emit_action_complete(&self, action_id: String, result: ActionOutcome) {
        self.emit(SyncEvent::ActionComplete { action_id, result });
    }

    /// Run one cycle under the re-entrancy guard. Concurrent calls
    /// collapse to one effective cycle: a call arriving while one is
    /// already in flight returns immediately without error.
    pub async fn sync_once(&self, process_actions: ProcessActionsFn) -> SyncResult<()> {
        if self.syncing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.emit(SyncEvent::SyncStart);
        let result = self.strategy.run(self, process_actions).await;
        self.syncing.store(false, Ordering::SeqCst);
        self.emit(SyncEvent::SyncComplete);
        result
    }

    pub fn is_realtime_transport(&self) -> bool {
        self.transport.is_realtime()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::LwwResolver;
    use crate::message::{ColumnDelta, RowOp, SyncPushResponse, SyncResponse};
    use crate::outbox::MemoryOutboxBackend;
    use crate::transport::SyncTransport;
    use rusqlite::Connection;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex;

    struct StubTransport {
        push_calls: AtomicUsize,
        fail_push: bool,
        pull_response: Mutex<Option<SyncResponse>>,
    }

    #[async_trait]
    impl SyncTransport for StubTransport {
        async fn push(&self, _req: SyncPush) -> SyncResult<SyncPushResponse> {
            self.push_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_push {
                return Err(crate::error::SyncError::Transport("boom".into()));
            }
            Ok(SyncPushResponse {
                server_hlc: HlcTimestamp(99),
                accepted: 1,
            })
        }

        async fn pull(&self, _req: SyncPull) -> SyncResult<SyncResponse> {
            let mut guard = self.pull_response.lock().await;
            Ok(guard.take().unwrap_or_default())
        }
    }

    fn sample_delta() -> RowDelta {
        RowDelta {
            op: RowOp::Insert,
            table: "todos".into(),
            row_id: "r1".into(),
            columns: vec![ColumnDelta {
                column_name: "title".into(),
                value: serde_json::json!("x"),
            }],
            hlc: HlcTimestamp(1),
            client_id: "A".into(),
            delta_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    fn make_engine(transport: StubTransport, max_retries: u32) -> (SyncEngine, Arc<Outbox<RowDelta>>) {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE todos (_row_id TEXT PRIMARY KEY, title TEXT);")
            .unwrap();
        let conn = Arc::new(AsyncMutex::new(conn));
        let outbox = Arc::new(Outbox::new(Box::new(MemoryOutboxBackend::new())));
        let applier = Arc::new(Applier::new(conn, Arc::clone(&outbox), Arc::new(LwwResolver)));
        let caps = TransportCapabilities::new(Arc::new(transport));
        let engine = SyncEngine::new(
            "client-a".into(),
            Arc::new(Hlc::new()),
            Arc::clone(&outbox),
            applier,
            caps,
            SyncMode::Full,
            max_retries,
            Arc::new(PullFirstStrategy),
        );
        (engine, outbox)
    }

    #[tokio::test]
    async fn push_success_acks_and_advances_cursor() {
        let (engine, outbox) = make_engine(
            StubTransport {
                push_calls: AtomicUsize::new(0),
                fail_push: false,
                pull_response: Mutex::new(None),
            },
            10,
        );
        outbox.push(sample_delta()).await.unwrap();
        let outcome = engine.push().await.unwrap();
        assert_eq!(outcome.pushed, 1);
        assert_eq!(outbox.depth().await.unwrap(), 0);
        assert_eq!(engine.snapshot().await.last_synced_hlc, HlcTimestamp(99));
    }

    #[tokio::test]
    async fn push_failure_nacks_and_leaves_cursor_unchanged() {
        let (engine, outbox) = make_engine(
            StubTransport {
                push_calls: AtomicUsize::new(0),
                fail_push: true,
                pull_response: Mutex::new(None),
            },
            10,
        );
        outbox.push(sample_delta()).await.unwrap();
        let before = engine.snapshot().await.last_synced_hlc;
        let err = engine.push().await.unwrap_err();
        assert!(matches!(err, crate::error::SyncError::Transport(_)));
        assert_eq!(engine.snapshot().await.last_synced_hlc, before);
        // nack'd entry is pending again but invisible until its backoff elapses
        assert_eq!(outbox.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dead_letters_entries_past_max_retries() {
        // max_retries=0: a freshly pushed entry (retry_count=0) already
        // meets the dead-letter threshold, so this exercises the partition
        // without waiting out the outbox's own backoff timer.
        let (engine, outbox) = make_engine(
            StubTransport {
                push_calls: AtomicUsize::new(0),
                fail_push: false,
                pull_response: Mutex::new(None),
            },
            0,
        );
        outbox.push(sample_delta()).await.unwrap();

        let dead_letter_count = Arc::new(std::sync::Mutex::new(0usize));
        let sink = Arc::clone(&dead_letter_count);
        engine.on_event(move |e| {
            if let SyncEvent::DeadLettered(n) = e {
                *sink.lock().unwrap() += n;
            }
        });

        let outcome = engine.push().await.unwrap();
        assert_eq!(outcome.dead_lettered, 1);
        assert_eq!(outcome.pushed, 0);
        assert_eq!(outbox.depth().await.unwrap(), 0);
        assert_eq!(*dead_letter_count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn sync_once_reentrancy_guard_collapses_concurrent_calls() {
        let (engine, _outbox) = make_engine(
            StubTransport {
                push_calls: AtomicUsize::new(0),
                fail_push: false,
                pull_response: Mutex::new(None),
            },
            10,
        );
        let engine = Arc::new(engine);
        let a = Arc::clone(&engine);
        let b = Arc::clone(&engine);
        let (r1, r2) = tokio::join!(
            a.sync_once(no_actions()),
            b.sync_once(no_actions())
        );
        assert!(r1.is_ok());
        assert!(r2.is_ok());
    }
}
