//! Capability-gated transport abstraction: every transport implements
//! [`SyncTransport`] (push/pull); the optional capabilities (checkpoint,
//! real-time broadcast, the action channel, connector introspection) are
//! separate traits rather than mostly-absent methods on one monolithic base
//! type, so the engine can feature-test for them once at wiring time.

pub mod http;
pub mod persistent;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;
use crate::message::{ActionPush, ActionResponse, CheckpointResponse, SyncPull, SyncPush, SyncResponse};

pub use http::HttpTransport;
pub use persistent::PersistentTransport;

/// A single descriptor for one invocable action on a connector (part of
/// `describe_actions`'s response shape).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionDescriptor {
    pub action_type: String,
    pub params_schema: serde_json::Value,
}

/// One connector the gateway exposes (part of `list_connector_types`'s
/// response shape).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectorDescriptor {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DescribeActionsResponse {
    #[serde(default)]
    pub connectors: std::collections::HashMap<String, Vec<ActionDescriptor>>,
}

/// Required of every transport: one push/pull round trip each.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn push(&self, req: SyncPush) -> SyncResult<crate::message::SyncPushResponse>;
    async fn pull(&self, req: SyncPull) -> SyncResult<SyncResponse>;
}

/// Optional: server-pre-filtered snapshot bootstrap.
#[async_trait]
pub trait CheckpointCapable: Send + Sync {
    async fn checkpoint(&self) -> SyncResult<Option<CheckpointResponse>>;
}

/// Optional: persistent-connection real-time push. `connect`/`disconnect`
/// manage the underlying connection; `on_broadcast` registers the callback
/// invoked for server-initiated delta batches.
#[async_trait]
pub trait BroadcastCapable: Send + Sync {
    async fn connect(&self) -> SyncResult<()>;
    async fn disconnect(&self) -> SyncResult<()>;
    fn on_broadcast(&self, callback: Box<dyn Fn(SyncResponse) + Send + Sync>);
    /// Whether the underlying connection is currently established; used by
    /// the scheduler to choose the heartbeat interval.
    fn is_realtime(&self) -> bool {
        true
    }
}

/// Optional: the imperative action channel.
#[async_trait]
pub trait ActionCapable: Send + Sync {
    async fn execute_action(&self, req: ActionPush) -> SyncResult<ActionResponse>;
    async fn describe_actions(&self) -> SyncResult<DescribeActionsResponse>;
    async fn list_connector_types(&self) -> SyncResult<Vec<ConnectorDescriptor>>;
}

/// Computed once at wiring time: which optional capabilities the concrete
/// transport object implements. Rust has no runtime trait reflection, so
/// this is the concrete encoding of "capability probing" for a statically
/// typed host; the caller supplies each optional slot explicitly when
/// constructing the client.
pub struct TransportCapabilities {
    pub transport: std::sync::Arc<dyn SyncTransport>,
    pub checkpoint: Option<std::sync::Arc<dyn CheckpointCapable>>,
    pub broadcast: Option<std::sync::Arc<dyn BroadcastCapable>>,
    pub actions: Option<std::sync::Arc<dyn ActionCapable>>,
}

impl TransportCapabilities {
    pub fn new(transport: std::sync::Arc<dyn SyncTransport>) -> Self {
        Self {
            transport,
            checkpoint: None,
            broadcast: None,
            actions: None,
        }
    }

    pub fn with_checkpoint(mut self, cap: std::sync::Arc<dyn CheckpointCapable>) -> Self {
        self.checkpoint = Some(cap);
        self
    }

    pub fn with_broadcast(mut self, cap: std::sync::Arc<dyn BroadcastCapable>) -> Self {
        self.broadcast = Some(cap);
        self
    }

    pub fn with_actions(mut self, cap: std::sync::Arc<dyn ActionCapable>) -> Self {
        self.actions = Some(cap);
        self
    }

    pub fn is_realtime(&self) -> bool {
        self.broadcast.as_ref().map(|b| b.is_realtime()).unwrap_or(false)
    }
}

/// Caller-supplied bearer credential source. May be backed by
/// a synchronous cache or an async refresh call; either way the transport
/// invokes it before every request and, on a 401, at most once more to
/// refresh.
#[async_trait]
pub trait AuthTokenProvider: Send + Sync {
    async fn token(&self) -> SyncResult<String>;
    /// Force a refresh of the cached credential. Default delegates to
    /// [`AuthTokenProvider::token`], which is correct for providers that do
    /// not cache.
    async fn refresh(&self) -> SyncResult<String> {
        self.token().await
    }
}
