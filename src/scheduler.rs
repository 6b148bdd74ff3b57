//! Background sync scheduler: drives `SyncEngine::sync_once` on
//! a timer, widening the period to the real-time heartbeat once a broadcast
//! transport is connected, and exposes a manual "sync now" trigger used for
//! foreground app-resume events. Wired to [`OnlineManager`] so a transition
//! to online fires an immediate cycle instead of waiting for the next tick.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::action::ActionProcessor;
use crate::engine::{ProcessActionsFn, SyncEngine};
use crate::online::OnlineManager;

/// Injectable sleep source so the scheduler's loop is driven by a virtual
/// clock in tests instead of real wall time.
pub trait Ticker: Send + Sync {
    fn sleep(&self, dur: Duration) -> BoxFuture<'static, ()>;
}

pub struct SystemTicker;

impl Ticker for SystemTicker {
    fn sleep(&self, dur: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(dur))
    }
}

pub(crate) fn process_actions_fn(action_processor: Option<Arc<ActionProcessor>>) -> ProcessActionsFn {
    Box::new(move || {
        Box::pin(async move {
            if let Some(ap) = action_processor {
                ap.process().await?;
            }
            Ok(())
        })
    })
}

pub struct Scheduler {
    engine: Arc<SyncEngine>,
    action_processor: Option<Arc<ActionProcessor>>,
    online: Arc<OnlineManager>,
    ticker: Arc<dyn Ticker>,
    interval_ms: u64,
    realtime_heartbeat_ms: u64,
    handle: AsyncMutex<Option<JoinHandle<()>>>,
    trigger_tx: mpsc::UnboundedSender<()>,
    trigger_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<()>>>,
}

impl Scheduler {
    pub fn new(
        engine: Arc<SyncEngine>,
        action_processor: Option<Arc<ActionProcessor>>,
        online: Arc<OnlineManager>,
        interval_ms: u64,
        realtime_heartbeat_ms: u64,
    ) -> Arc<Self> {
        Self::with_ticker(
            engine,
            action_processor,
            online,
            interval_ms,
            realtime_heartbeat_ms,
            Arc::new(SystemTicker),
        )
    }

    pub fn with_ticker(
        engine: Arc<SyncEngine>,
        action_processor: Option<Arc<ActionProcessor>>,
        online: Arc<OnlineManager>,
        interval_ms: u64,
        realtime_heartbeat_ms: u64,
        ticker: Arc<dyn Ticker>,
    ) -> Arc<Self> {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            engine,
            action_processor,
            online,
            ticker,
            interval_ms,
            realtime_heartbeat_ms,
            handle: AsyncMutex::new(None),
            trigger_tx,
            trigger_rx: AsyncMutex::new(Some(trigger_rx)),
        });

        let for_listener = Arc::downgrade(&scheduler);
        scheduler.online.on_change(move |online| {
            if online {
                if let Some(scheduler) = for_listener.upgrade() {
                    scheduler.force_sync();
                }
            }
        });

        scheduler
    }

    /// Request an out-of-band cycle (e.g. app resumed to the foreground).
    /// A no-op if the scheduler isn't running or the channel is saturated:
    /// it is unbounded, so this only fails if the background task exited.
    pub fn force_sync(&self) {
        let _ = self.trigger_tx.send(());
    }

    fn effective_interval(&self) -> Duration {
        if self.engine.is_realtime_transport() {
            Duration::from_millis(self.realtime_heartbeat_ms)
        } else {
            Duration::from_millis(self.interval_ms)
        }
    }

    /// Idempotent: a second call while already running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.handle.lock().await;
        if guard.is_some() {
            return;
        }
        let Some(mut trigger_rx) = self.trigger_rx.lock().await.take() else {
            return;
        };

        let scheduler = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                let dur = scheduler.effective_interval();
                tokio::select! {
                    _ = scheduler.ticker.sleep(dur) => {}
                    maybe = trigger_rx.recv() => {
                        if maybe.is_none() {
                            return;
                        }
                    }
                }
                if !scheduler.online.is_online() {
                    debug!("skipping sync tick while offline");
                    continue;
                }
                let actions = process_actions_fn(scheduler.action_processor.clone());
                if let Err(e) = scheduler.engine.sync_once(actions).await {
                    warn!(error = %e, "scheduled sync cycle failed");
                }
            }
        });
        *guard = Some(task);
    }

    /// Idempotent: stopping an already-stopped scheduler is a no-op.
    pub async fn stop(&self) {
        let mut guard = self.handle.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }
    }

    pub async fn is_running(&self) -> bool {
        self.handle.lock().await.is_some()
    }
}
