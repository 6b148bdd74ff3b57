//! Client configuration: a single serde-deserialisable struct the host
//! constructs once at wiring time.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SyncMode {
    Full,
    PushOnly,
    PullOnly,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStrategyKind {
    PullFirst,
    PushFirst,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutboxBackendKind {
    Memory,
    Persistent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_auto_sync_interval_ms")]
    pub auto_sync_interval_ms: u64,
    #[serde(default = "default_realtime_heartbeat_ms")]
    pub realtime_heartbeat_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_action_retries")]
    pub max_action_retries: u32,
    #[serde(default = "default_sync_mode")]
    pub sync_mode: SyncMode,
    #[serde(default = "default_strategy")]
    pub strategy: SyncStrategyKind,
    #[serde(default = "default_backend")]
    pub backend: OutboxBackendKind,
    /// Gateway HTTP/websocket base, e.g. `https://gateway.example.com`.
    pub base_url: String,
    pub gateway_id: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_client_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_auto_sync_interval_ms() -> u64 {
    10_000
}

fn default_realtime_heartbeat_ms() -> u64 {
    60_000
}

fn default_max_retries() -> u32 {
    10
}

fn default_max_action_retries() -> u32 {
    5
}

fn default_sync_mode() -> SyncMode {
    SyncMode::Full
}

fn default_strategy() -> SyncStrategyKind {
    SyncStrategyKind::PullFirst
}

fn default_backend() -> OutboxBackendKind {
    OutboxBackendKind::Memory
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl SyncConfig {
    pub fn new(base_url: impl Into<String>, gateway_id: impl Into<String>) -> Self {
        Self {
            client_id: default_client_id(),
            auto_sync_interval_ms: default_auto_sync_interval_ms(),
            realtime_heartbeat_ms: default_realtime_heartbeat_ms(),
            max_retries: default_max_retries(),
            max_action_retries: default_max_action_retries(),
            sync_mode: default_sync_mode(),
            strategy: default_strategy(),
            backend: default_backend(),
            base_url: base_url.into(),
            gateway_id: gateway_id.into(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let cfg = SyncConfig::new("https://gw.example.com", "gw1");
        assert_eq!(cfg.auto_sync_interval_ms, 10_000);
        assert_eq!(cfg.realtime_heartbeat_ms, 60_000);
        assert_eq!(cfg.max_retries, 10);
        assert_eq!(cfg.max_action_retries, 5);
        assert_eq!(cfg.sync_mode, SyncMode::Full);
        assert_eq!(cfg.strategy, SyncStrategyKind::PullFirst);
    }

    #[test]
    fn deserialises_from_partial_json_with_defaults() {
        let json = r#"{"base_url":"https://gw","gateway_id":"g1","max_retries":3}"#;
        let cfg: SyncConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.auto_sync_interval_ms, 10_000);
    }
}
