//! Offline-first, bidirectional row-level sync engine: a hybrid logical
//! clock, a durable outbox with retry/backoff/dead-lettering, a
//! conflict-resolving applier under last-writer-wins, and a capability-gated
//! transport abstraction (HTTP request/response plus a persistent
//! websocket), orchestrated by [`SyncEngine`] and driven by [`Scheduler`].
//!
//! [`LakesyncClient`] is the intended entry point; it wires every component
//! from a [`SyncConfig`] and a caller-supplied [`TransportCapabilities`].

pub mod action;
pub mod applier;
pub mod client;
pub mod codec;
pub mod config;
pub mod delta;
pub mod engine;
pub mod error;
pub mod hlc;
pub mod message;
pub mod online;
pub mod outbox;
pub mod scheduler;
pub mod schema;
pub mod transport;

pub use action::{ActionEvent, ActionProcessor, ProcessOutcome};
pub use applier::{Applier, LwwResolver, Resolver, Winner};
pub use client::LakesyncClient;
pub use config::{OutboxBackendKind, SyncConfig, SyncMode, SyncStrategyKind};
pub use delta::DeltaExtractor;
pub use engine::{EngineSnapshot, PullFirstStrategy, PushFirstStrategy, PushOutcome, SyncEngine, SyncEvent, SyncStrategy};
pub use error::{SyncError, SyncResult};
pub use hlc::{Hlc, HlcTimestamp};
pub use message::{
    Action, ActionErrorResult, ActionOutcome, ActionPush, ActionResponse, ActionResult,
    CheckpointResponse, ColumnDelta, RowDelta, RowOp, SyncPull, SyncPush, SyncPushResponse,
    SyncResponse,
};
pub use online::OnlineManager;
pub use outbox::{Outbox, OutboxBackend, OutboxEntry};
pub use scheduler::{Scheduler, Ticker};
pub use schema::{ColumnType, SchemaStore, TableColumn, TableSchema};
pub use transport::{
    ActionCapable, ActionDescriptor, AuthTokenProvider, BroadcastCapable, CheckpointCapable,
    ConnectorDescriptor, DescribeActionsResponse, HttpTransport, PersistentTransport,
    SyncTransport, TransportCapabilities,
};
