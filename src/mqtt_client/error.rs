// SPDX-License-Identifier: MPL-2.0

//! Error types for outgoing publish delivery
//!
//! The variants are grouped by how far an error reaches: a single result sink,
//! the connection, or the whole client (internal invariant violations).

use std::fmt;
use std::io;

use crate::mqtt_serde::reason_code;

/// Comprehensive error type for MQTT client operations
#[derive(Debug, Clone, serde::Serialize)]
pub enum MqttClientError {
    // ==================== Connection Errors (escalated) ====================
    /// Connection lost unexpectedly
    ConnectionLost { reason: String },

    /// Network I/O error reported by a [`Channel`](super::channel::Channel) implementation
    NetworkError {
        #[serde(skip)]
        kind: io::ErrorKind,
        message: String,
    },

    /// Internal channel closed unexpectedly
    ChannelClosed { channel: String },

    // ==================== Session Errors ====================
    /// Not connected to broker, or the session ended before the publish completed
    NotConnected,

    // ==================== Operation Errors (per publish) ====================
    /// PUBACK or PUBREC carried an error reason code
    PublishFailed {
        packet_id: Option<u16>,
        reason_code: u8,
        reason_string: Option<String>,
    },

    /// The publish could not be turned into a packet (local, connection unaffected)
    PacketEncoding { message: String },

    /// The publish itself is not valid
    InvalidPublish { reason: String },

    // ==================== Resource Errors ====================
    /// Buffer is full, cannot accept more data
    BufferFull {
        buffer_type: String,
        capacity: usize,
    },

    // ==================== Internal Errors (Unrecoverable) ====================
    /// Internal client error (should not happen)
    InternalError { message: String },
}

impl MqttClientError {
    /// Returns true if the error means the transport itself failed.
    ///
    /// Such errors are escalated to the connection and never resolved onto a
    /// single publish's result sink.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost { .. } | Self::NetworkError { .. } | Self::ChannelClosed { .. }
        )
    }

    /// Returns true if the error is recoverable (retry/reconnect possible)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost { .. }
                | Self::NetworkError { .. }
                | Self::NotConnected
                | Self::BufferFull { .. }
        )
    }

    /// Returns true if the error is fatal (client should stop)
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InternalError { .. })
    }

    /// Error for a PUBACK/PUBREC that carries an error reason code.
    pub fn publish_failed(packet_id: u16, code: u8, reason_string: Option<&str>) -> Self {
        Self::PublishFailed {
            packet_id: Some(packet_id),
            reason_code: code,
            reason_string: reason_string.map(str::to_string),
        }
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Self::ConnectionLost { reason } => {
                format!("Connection to broker lost: {}", reason)
            }
            Self::NetworkError { kind, message } => {
                format!("Network error ({:?}): {}", kind, message)
            }
            Self::ChannelClosed { channel } => {
                format!("Internal channel '{}' closed unexpectedly", channel)
            }
            Self::NotConnected => "Not connected to broker.".to_string(),
            Self::PublishFailed {
                packet_id,
                reason_code: code,
                reason_string,
            } => {
                let id_str = packet_id
                    .map(|id| format!(" (packet ID: {})", id))
                    .unwrap_or_default();
                let reason_str = reason_string
                    .as_ref()
                    .map(|s| format!(": {}", s))
                    .unwrap_or_else(|| format!(" ({})", reason_code::describe(*code)));
                format!("Publish failed{} - code: 0x{:02X}{}", id_str, code, reason_str)
            }
            Self::PacketEncoding { message } => {
                format!("Failed to encode packet: {}", message)
            }
            Self::InvalidPublish { reason } => {
                format!("Invalid publish: {}", reason)
            }
            Self::BufferFull {
                buffer_type,
                capacity,
            } => {
                format!(
                    "{} buffer full (capacity: {}). Try again later.",
                    buffer_type, capacity
                )
            }
            Self::InternalError { message } => {
                format!("Internal error: {}", message)
            }
        }
    }

    /// Convert from io::Error with context
    pub fn from_io_error(error: io::Error, context: &str) -> Self {
        Self::NetworkError {
            kind: error.kind(),
            message: format!("{}: {}", context, error),
        }
    }
}

impl fmt::Display for MqttClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for MqttClientError {}

impl From<io::Error> for MqttClientError {
    fn from(error: io::Error) -> Self {
        Self::NetworkError {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Result type alias for MQTT client operations
pub type MqttClientResult<T> = Result<T, MqttClientError>;
