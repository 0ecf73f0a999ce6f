//! Binary protocol for scene synchronization.
//!
//! Wire format (bincode-encoded, one WebSocket binary frame per message):
//! ```text
//! ┌──────────┬──────────────────────────────┐
//! │ msg_type │ payload                      │
//! │ 1 byte   │ variable (bincode `Update`)  │
//! └──────────┴──────────────────────────────┘
//! ```
//!
//! `Ping`/`Pong` carry an empty payload and never touch scene state.

use serde::{Deserialize, Serialize};

use covis_core::model::Update;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Scene update (snapshot entry, delta, delete or disconnect notice)
    Update = 1,
    /// Liveness check
    Ping = 2,
    /// Liveness reply
    Pong = 3,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Wrap a scene update.
    pub fn update(update: &Update) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(update, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::Update,
            payload,
        })
    }

    pub fn ping() -> Self {
        Self {
            msg_type: MessageType::Ping,
            payload: Vec::new(),
        }
    }

    pub fn pong() -> Self {
        Self {
            msg_type: MessageType::Pong,
            payload: Vec::new(),
        }
    }

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

    /// Parse the update payload.
    pub fn to_update(&self) -> Result<Update, ProtocolError> {
        if self.msg_type != MessageType::Update {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (update, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(update)
    }
}

/// Encode an update straight to frame bytes.
pub fn encode_update(update: &Update) -> Result<Vec<u8>, ProtocolError> {
    SyncMessage::update(update)?.encode()
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
