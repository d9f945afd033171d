//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Messages are JSON text frames. Forwarded store writes may also be sent
//! as binary frames (bincode), since transforms are written every frame.

use serde::{Serialize, Deserialize};

use crate::game::events::{EndReason, GameEvent};
use crate::game::intent::Intent;
use crate::game::state::{ClientId, NetworkId, RoundPhase};
use crate::game::store::{StateDelta, WriteRequest};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join the session.
    Join(JoinRequest),

    /// Ask the server to do something.
    Intent(Intent),

    /// Forward a write to an owner-writable key.
    WriteRequest(WriteRequest),

    /// Request a full snapshot (after reconnect or a digest mismatch).
    SyncRequest,

    /// Ping for latency measurement.
    Ping {
        /// Client timestamp, echoed back.
        timestamp: u64,
    },

    /// Leave the session.
    Leave,
}

/// Join request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Display name.
    pub name: String,
    /// Auth token, required only when the server has auth configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Join accepted.
    Welcome(WelcomeInfo),

    /// Full replicated state.
    Snapshot(SyncFrame),

    /// Replicated changes since the previous sync.
    Sync(SyncFrame),

    /// Game notification.
    Event(GameEvent),

    /// Session is over; clients go back to the menu.
    ReturnToMenu {
        /// Why the session ended.
        reason: EndReason,
    },

    /// Pong response.
    Pong {
        /// Echoed client timestamp.
        timestamp: u64,
        /// Server time in milliseconds.
        server_time: u64,
    },

    /// Error response.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown {
        /// Reason.
        reason: String,
    },
}

/// Sent once after a successful join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WelcomeInfo {
    /// Session identifier.
    pub session_id: String,
    /// Connection id assigned by the server.
    pub client: ClientId,
    /// The player entity this client owns.
    pub entity: NetworkId,
    /// Current server tick.
    pub tick: u64,
    /// Simulation rate in Hz.
    pub tick_rate: u32,
    /// Current phase.
    pub phase: RoundPhase,
    /// Session creation time (RFC 3339).
    pub created_at: String,
    /// Server version string.
    pub server_version: String,
}

/// A batch of replicated state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFrame {
    /// Server tick the batch was taken at.
    pub tick: u64,
    /// Deltas in sequence order.
    pub deltas: Vec<StateDelta>,
    /// Hex digest of the full store, for convergence checks.
    #[serde(default)]
    pub digest: Option<String>,
}

/// Error details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ServerError {
    /// Error with a code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Token rejected.
    AuthFailed,
    /// Message before join.
    NotJoined,
    /// Already joined.
    AlreadyJoined,
    /// Malformed message.
    InvalidInput,
    /// Entity not owned by the sender.
    NotOwner,
    /// Key cannot be written by clients.
    NotWritable,
    /// Session is full or over.
    SessionClosed,
    /// Server at connection limit.
    ServerOverloaded,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Encode a forwarded write as a binary frame.
///
/// Tagged enums are not supported by bincode, so binary frames carry a bare
/// `WriteRequest` rather than a `ClientMessage`.
pub fn write_to_bytes(request: &WriteRequest) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(request)
}

/// Decode a binary write frame.
pub fn write_from_bytes(data: &[u8]) -> Result<WriteRequest, bincode::Error> {
    bincode::deserialize(data)
}
