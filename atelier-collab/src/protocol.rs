//! Wire protocol for the collaboration service.
//!
//! Every inbound frame decodes to one [`ClientEvent`]; every outbound frame
//! encodes one [`ServerMessage`]. The coordinator never sees a socket — it
//! consumes events and returns [`Outgoing`] routing decisions, which the
//! transport layer turns into unicast or room broadcast sends.
//!
//! Frames are bincode-encoded over the serde derives, the same wire stack
//! used for every other message in this codebase.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::resolver::ConflictResolution;
use crate::session::{HistoryEntry, LockState, SessionId};

/// Cursor location within a file, with an optional selection end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    /// 1-indexed
    pub line: u32,
    /// 1-indexed
    pub column: u32,
    pub selection_end: Option<(u32, u32)>,
}

impl CursorPosition {
    pub fn new(line: u32, column: u32) -> Self {
        Self {
            line,
            column,
            selection_end: None,
        }
    }

    pub fn with_selection(mut self, line: u32, column: u32) -> Self {
        self.selection_end = Some((line, column));
        self
    }
}

/// Everything a client can send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientEvent {
    /// Join (or lazily create) the session for a `(container, path)` pair.
    Join {
        container_id: String,
        file_path: String,
        user_id: String,
    },
    Leave {
        session_id: SessionId,
        user_id: String,
    },
    /// Optimistic content update against an expected version.
    Update {
        session_id: SessionId,
        content: String,
        version: u64,
        user_id: String,
    },
    /// Acquire (`lock = true`) or release an advisory lock.
    Lock {
        session_id: SessionId,
        file_path: String,
        user_id: String,
        lock: bool,
    },
    Cursor {
        session_id: SessionId,
        user_id: String,
        position: CursorPosition,
    },
    /// A user's explicit answer to a previously reported conflict.
    ResolveConflict {
        session_id: SessionId,
        resolved_content: String,
        strategy: String,
        user_id: String,
    },
    History {
        session_id: SessionId,
        limit: usize,
    },
    Ping,
}

/// Everything the server can send back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Join reply: the full current session state.
    SessionSnapshot {
        session_id: SessionId,
        content: String,
        version: u64,
        users: Vec<String>,
        locks: HashMap<String, LockState>,
    },
    UserJoined {
        user_id: String,
        user_count: usize,
    },
    UserLeft {
        user_id: String,
        user_count: usize,
    },
    /// A clean update was applied.
    FileUpdated {
        content: String,
        version: u64,
        user_id: String,
    },
    /// A stale update was merged automatically; everyone converges on this.
    AutoConflictResolved {
        content: String,
        version: u64,
        resolution: ConflictResolution,
    },
    /// Sender-only: the update needs a manual decision.
    ConflictDetected {
        resolution: ConflictResolution,
        current_version: u64,
    },
    FileLockChanged {
        file_path: String,
        locked: bool,
        user_id: String,
    },
    LockFailed {
        file_path: String,
        locked_by: Option<String>,
    },
    CursorMoved {
        user_id: String,
        position: CursorPosition,
    },
    /// A manual resolution was applied; everyone converges on this.
    ConflictResolved {
        content: String,
        version: u64,
        user_id: String,
        strategy: String,
    },
    FileHistory {
        session_id: SessionId,
        history: Vec<HistoryEntry>,
        total_versions: u64,
    },
    Error {
        message: String,
    },
    Pong,
}

/// Routing decision attached to each outbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    /// Point-to-point reply to the connection that sent the event.
    ToSender(ServerMessage),
    /// Fan-out to the session room, optionally excluding the sender.
    ToRoom {
        session_id: SessionId,
        message: ServerMessage,
        include_sender: bool,
    },
}

/// Codec errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl ClientEvent {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (event, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(event)
    }
}

impl ServerMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}
