//! Wire message shapes exchanged between the client and the gateway.
//! Column values travel as a JSON-compatible value union; HLC fields travel
//! as a base-10 string in JSON payloads so they survive platforms whose
//! JSON numbers are lossy 53-bit floats.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::hlc::HlcTimestamp;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RowOp {
    Insert,
    Update,
    Delete,
}

/// A single changed column, value preserving JSON-compatible typing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnDelta {
    pub column_name: String,
    pub value: serde_json::Value,
}

/// A column-level row mutation, the unit of replication between client and
/// gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RowDelta {
    pub op: RowOp,
    pub table: String,
    pub row_id: String,
    pub columns: Vec<ColumnDelta>,
    pub hlc: HlcTimestamp,
    pub client_id: String,
    pub delta_id: String,
}

impl RowDelta {
    pub fn key(&self) -> (String, String) {
        (self.table.clone(), self.row_id.clone())
    }
}

/// An imperative, side-effecting command dispatched through the action
/// channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub action_id: String,
    pub client_id: String,
    pub hlc: HlcTimestamp,
    pub connector: String,
    pub action_type: String,
    pub params: HashMap<String, serde_json::Value>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionResult {
    pub action_id: String,
    pub data: serde_json::Value,
    pub server_hlc: HlcTimestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionErrorResult {
    pub action_id: String,
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ActionOutcome {
    Ok(ActionResult),
    Err(ActionErrorResult),
}

impl ActionOutcome {
    pub fn action_id(&self) -> &str {
        match self {
            ActionOutcome::Ok(r) => &r.action_id,
            ActionOutcome::Err(r) => &r.action_id,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncPush {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub deltas: Vec<RowDelta>,
    #[serde(default)]
    pub last_seen_hlc: HlcTimestamp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncPushResponse {
    #[serde(default)]
    pub server_hlc: HlcTimestamp,
    #[serde(default)]
    pub accepted: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncPull {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub since_hlc: HlcTimestamp,
    #[serde(default)]
    pub max_deltas: i64,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncResponse {
    #[serde(default)]
    pub deltas: Vec<RowDelta>,
    #[serde(default)]
    pub server_hlc: HlcTimestamp,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CheckpointResponse {
    #[serde(default)]
    pub deltas: Vec<RowDelta>,
    #[serde(default)]
    pub snapshot_hlc: HlcTimestamp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ActionPush {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ActionResponse {
    #[serde(default)]
    pub results: Vec<ActionOutcome>,
    #[serde(default)]
    pub server_hlc: HlcTimestamp,
}

/// Frame tags used to prefix messages on a persistent connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameTag {
    Push = 0x01,
    Pull = 0x02,
    Broadcast = 0x03,
    ActionPush = 0x04,
    ActionResponse = 0x05,
}

impl FrameTag {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(FrameTag::Push),
            0x02 => Some(FrameTag::Pull),
            0x03 => Some(FrameTag::Broadcast),
            0x04 => Some(FrameTag::ActionPush),
            0x05 => Some(FrameTag::ActionResponse),
            _ => None,
        }
    }
}
