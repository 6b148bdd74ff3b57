//! Imperative action channel: a durable queue of
//! side-effecting commands dispatched through a connector, batched and
//! retried the same way as the delta outbox but kept as a separate queue so
//! action backpressure never blocks row sync. Content-addressed action ids
//! are computed with `sha2` rather than stored client-side state.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::SyncResult;
use crate::hlc::Hlc;
use crate::message::{Action, ActionErrorResult, ActionOutcome, ActionPush};
use crate::outbox::Outbox;
use crate::transport::ActionCapable;

const ACTION_BATCH: i64 = 100;

#[derive(Debug, Clone)]
pub enum ActionEvent {
    Complete { action_id: String, outcome: ActionOutcome },
    DeadLettered(usize),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessOutcome {
    pub dead_lettered: usize,
    pub completed: usize,
    pub requeued: usize,
}

/// Durable FIFO of outbound actions, batched and dispatched through an
/// optional [`ActionCapable`] transport.
pub struct ActionProcessor {
    client_id: String,
    clock: Arc<Hlc>,
    queue: Arc<Outbox<Action>>,
    transport: Option<Arc<dyn ActionCapable>>,
    max_retries: u32,
    listeners: std::sync::Mutex<Vec<Arc<dyn Fn(ActionEvent) + Send + Sync>>>,
}

impl ActionProcessor {
    pub fn new(
        client_id: impl Into<String>,
        clock: Arc<Hlc>,
        queue: Arc<Outbox<Action>>,
        transport: Option<Arc<dyn ActionCapable>>,
        max_retries: u32,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            clock,
            queue,
            transport,
            max_retries,
            listeners: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn on_event(&self, listener: impl Fn(ActionEvent) + Send + Sync + 'static) {
        self.listeners.lock().expect("listeners mutex poisoned").push(Arc::new(listener));
    }

    fn emit(&self, event: ActionEvent) {
        let listeners = self.listeners.lock().expect("listeners mutex poisoned").clone();
        for listener in listeners {
            let event = event.clone();
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!("action event listener panicked; ignoring");
            }
        }
    }

    /// Enqueue one action, computing its content-addressed id from
    /// `(client_id, hlc, connector, action_type, params)` so a caller that
    /// retries the same logical call before it was queued produces the same
    /// id rather than a duplicate entry.
    pub async fn enqueue(
        &self,
        connector: impl Into<String>,
        action_type: impl Into<String>,
        params: HashMap<String, serde_json::Value>,
        idempotency_key: Option<String>,
    ) -> SyncResult<String> {
        let connector = connector.into();
        let action_type = action_type.into();
        let hlc = self.clock.now();
        let action_id = content_address(&self.client_id, hlc, &connector, &action_type, &params);

        let action = Action {
            action_id: action_id.clone(),
            client_id: self.client_id.clone(),
            hlc,
            connector,
            action_type,
            params,
            idempotency_key,
        };
        self.queue.push(action).await?;
        Ok(action_id)
    }

    /// Drain up to 100 pending actions and dispatch them as one batch.
    /// A no-op, successful pass when the transport lacks
    /// [`ActionCapable`]: capability absence is a silent no-op, not an error.
    pub async fn process(&self) -> SyncResult<ProcessOutcome> {
        let Some(transport) = &self.transport else {
            return Ok(ProcessOutcome::default());
        };

        let entries = self.queue.peek(ACTION_BATCH).await?;
        let (dead, live): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .partition(|e| e.retry_count >= self.max_retries);

        if !dead.is_empty() {
            let ids: Vec<String> = dead.iter().map(|e| e.id.clone()).collect();
            self.queue.ack(&ids).await?;
            for entry in &dead {
                self.emit(ActionEvent::Complete {
                    action_id: entry.item.action_id.clone(),
                    outcome: ActionOutcome::Err(ActionErrorResult {
                        action_id: entry.item.action_id.clone(),
                        code: "DEAD_LETTERED".into(),
                        message: "action exhausted its retry budget".into(),
                        retryable: false,
                    }),
                });
            }
            self.emit(ActionEvent::DeadLettered(dead.len()));
        }

        if live.is_empty() {
            return Ok(ProcessOutcome {
                dead_lettered: dead.len(),
                completed: 0,
                requeued: 0,
            });
        }

        let ids: Vec<String> = live.iter().map(|e| e.id.clone()).collect();
        self.queue.mark_sending(&ids).await?;

        let req = ActionPush {
            client_id: self.client_id.clone(),
            actions: live.iter().map(|e| e.item.clone()).collect(),
        };

        let response = match transport.execute_action(req).await {
            Ok(r) => r,
            Err(e) => {
                self.queue.nack(&ids).await?;
                return Err(e);
            }
        };

        let mut by_id: HashMap<String, &String> = HashMap::new();
        for (entry_id, action_id) in ids.iter().zip(live.iter().map(|e| e.item.action_id.clone())) {
            by_id.insert(action_id, entry_id);
        }

        let mut acked = Vec::new();
        let mut requeued = Vec::new();
        for outcome in response.results {
            let action_id = outcome.action_id().to_string();
            let Some(entry_id) = by_id.get(&action_id) else {
                continue;
            };
            match &outcome {
                ActionOutcome::Ok(_) => acked.push((*entry_id).clone()),
                ActionOutcome::Err(ActionErrorResult { retryable, .. }) => {
                    if *retryable {
                        requeued.push((*entry_id).clone());
                    } else {
                        acked.push((*entry_id).clone());
                    }
                }
            }
            self.emit(ActionEvent::Complete { action_id, outcome });
        }

        // entries the gateway never acknowledged (e.g. it accepted fewer
        // than sent): treat as a transient failure and retry.
        let accounted: std::collections::HashSet<&String> = acked.iter().chain(requeued.iter()).collect();
        for id in &ids {
            if !accounted.contains(id) {
                requeued.push(id.clone());
            }
        }

        if !acked.is_empty() {
            self.queue.ack(&acked).await?;
        }
        if !requeued.is_empty() {
            self.queue.nack(&requeued).await?;
        }

        Ok(ProcessOutcome {
            dead_lettered: dead.len(),
            completed: acked.len(),
            requeued: requeued.len(),
        })
    }
}

/// Canonicalise `params` via its sorted-key `BTreeMap` projection so two
/// calls with the same logical content hash identically regardless of the
/// caller's `HashMap` iteration order.
fn content_address(
    client_id: &str,
    hlc: crate::hlc::HlcTimestamp,
    connector: &str,
    action_type: &str,
    params: &HashMap<String, serde_json::Value>,
) -> String {
    let canonical: BTreeMap<&String, &serde_json::Value> = params.iter().collect();
    let canonical_json = serde_json::to_string(&canonical).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(client_id.as_bytes());
    hasher.update(b":");
    hasher.update(hlc.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(connector.as_bytes());
    hasher.update(b":");
    hasher.update(action_type.as_bytes());
    hasher.update(b":");
    hasher.update(canonical_json.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ActionResult;
    use crate::outbox::MemoryOutboxBackend;
    use async_trait::async_trait;
    use crate::transport::{ConnectorDescriptor, DescribeActionsResponse};

    struct StubActions {
        responses: std::sync::Mutex<Vec<ActionOutcome>>,
    }

    #[async_trait]
    impl ActionCapable for StubActions {
        async fn execute_action(&self, req: ActionPush) -> SyncResult<crate::message::ActionResponse> {
            let mut pending = self.responses.lock().unwrap();
            let results: Vec<ActionOutcome> = req
                .actions
                .iter()
                .filter_map(|a| {
                    let idx = pending.iter().position(|o| o.action_id() == a.action_id)?;
                    Some(pending.remove(idx))
                })
                .collect();
            Ok(crate::message::ActionResponse {
                results,
                server_hlc: crate::hlc::HlcTimestamp(1),
            })
        }

        async fn describe_actions(&self) -> SyncResult<DescribeActionsResponse> {
            Ok(DescribeActionsResponse::default())
        }

        async fn list_connector_types(&self) -> SyncResult<Vec<ConnectorDescriptor>> {
            Ok(vec![])
        }
    }

    fn processor_with(transport: Option<Arc<dyn ActionCapable>>, max_retries: u32) -> (ActionProcessor, Arc<Outbox<Action>>) {
        let queue = Arc::new(Outbox::new(Box::new(MemoryOutboxBackend::new())));
        let processor = ActionProcessor::new("client-a", Arc::new(Hlc::new()), Arc::clone(&queue), transport, max_retries);
        (processor, queue)
    }

    #[tokio::test]
    async fn enqueue_same_params_twice_yields_same_action_id() {
        let (processor, _queue) = processor_with(None, 5);
        let mut params = HashMap::new();
        params.insert("amount".to_string(), serde_json::json!(10));
        let clock = Arc::new(Hlc::new());
        let hlc = clock.now();
        let id1 = content_address("client-a", hlc, "stripe", "charge", &params);
        let id2 = content_address("client-a", hlc, "stripe", "charge", &params);
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn process_without_transport_is_noop() {
        let (processor, queue) = processor_with(None, 5);
        queue
            .push(Action {
                action_id: "a1".into(),
                client_id: "client-a".into(),
                hlc: crate::hlc::HlcTimestamp(1),
                connector: "stripe".into(),
                action_type: "charge".into(),
                params: HashMap::new(),
                idempotency_key: None,
            })
            .await
            .unwrap();
        let outcome = processor.process().await.unwrap();
        assert_eq!(outcome.completed, 0);
        assert_eq!(queue.depth().await.unwrap(), 1, "queue untouched when capability absent");
    }

    #[tokio::test]
    async fn successful_action_is_acked_and_emits_complete() {
        let action_id = {
            let clock = Hlc::new();
            content_address("client-a", clock.now(), "stripe", "charge", &HashMap::new())
        };
        let stub = Arc::new(StubActions {
            responses: std::sync::Mutex::new(vec![ActionOutcome::Ok(ActionResult {
                action_id: action_id.clone(),
                data: serde_json::json!({}),
                server_hlc: crate::hlc::HlcTimestamp(2),
            })]),
        }) as Arc<dyn ActionCapable>;
        let (processor, queue) = processor_with(Some(stub), 5);
        queue
            .push(Action {
                action_id: action_id.clone(),
                client_id: "client-a".into(),
                hlc: crate::hlc::HlcTimestamp(1),
                connector: "stripe".into(),
                action_type: "charge".into(),
                params: HashMap::new(),
                idempotency_key: None,
            })
            .await
            .unwrap();

        let completions = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&completions);
        processor.on_event(move |e| {
            if let ActionEvent::Complete { action_id, .. } = e {
                sink.lock().unwrap().push(action_id);
            }
        });

        let outcome = processor.process().await.unwrap();
        assert_eq!(outcome.completed, 1);
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert_eq!(completions.lock().unwrap().as_slice(), &[action_id]);
    }

    #[tokio::test]
    async fn retryable_error_is_requeued_not_acked() {
        let action_id = "a-retry".to_string();
        let stub = Arc::new(StubActions {
            responses: std::sync::Mutex::new(vec![ActionOutcome::Err(ActionErrorResult {
                action_id: action_id.clone(),
                code: "RATE_LIMITED".into(),
                message: "slow down".into(),
                retryable: true,
            })]),
        }) as Arc<dyn ActionCapable>;
        let (processor, queue) = processor_with(Some(stub), 5);
        queue
            .push(Action {
                action_id: action_id.clone(),
                client_id: "client-a".into(),
                hlc: crate::hlc::HlcTimestamp(1),
                connector: "stripe".into(),
                action_type: "charge".into(),
                params: HashMap::new(),
                idempotency_key: None,
            })
            .await
            .unwrap();

        let outcome = processor.process().await.unwrap();
        assert_eq!(outcome.requeued, 1);
        assert_eq!(queue.depth().await.unwrap(), 1, "requeued entry stays in queue, invisible until backoff elapses");
    }

    #[tokio::test]
    async fn dead_lettered_action_emits_synthetic_error_and_is_acked() {
        // an empty responses list means the stub never matches any action
        // id, so every live entry this test pushes is exercised purely
        // through the dead-letter partition (retry_count=0 >= max_retries=0).
        let stub = Arc::new(StubActions {
            responses: std::sync::Mutex::new(Vec::new()),
        }) as Arc<dyn ActionCapable>;
        let (processor, queue) = processor_with(Some(stub), 0);

        let completions = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&completions);
        processor.on_event(move |e| {
            if let ActionEvent::Complete { action_id, outcome } = e {
                sink.lock().unwrap().push((action_id, outcome));
            }
        });

        queue
            .push(Action {
                action_id: "a-dead".into(),
                client_id: "client-a".into(),
                hlc: crate::hlc::HlcTimestamp(1),
                connector: "stripe".into(),
                action_type: "charge".into(),
                params: HashMap::new(),
                idempotency_key: None,
            })
            .await
            .unwrap();

        let outcome = processor.process().await.unwrap();
        assert_eq!(outcome.dead_lettered, 1);
        assert_eq!(queue.depth().await.unwrap(), 0);

        let recorded = completions.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        let (action_id, result) = &recorded[0];
        assert_eq!(action_id, "a-dead");
        match result {
            ActionOutcome::Err(ActionErrorResult { code, retryable, .. }) => {
                assert_eq!(code, "DEAD_LETTERED");
                assert!(!retryable);
            }
            ActionOutcome::Ok(_) => panic!("expected a synthetic dead-letter error"),
        }
    }
}
