//! Unified error types for the inbox core
//!
//! This module defines error types that:
//! - Are serializable for presentation code
//! - Carry enough context to pick a recovery flow
//! - Classify themselves for the retry and reconnect policies

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type shared by every component of the inbox core
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum InboxError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Inbox not found for recipient: {0}")]
    InboxNotFound(String),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Send already in flight: {0}")]
    AlreadyInFlight(String),

    #[error("Stream reconnect attempts exhausted after {attempts} tries")]
    StreamExhausted { attempts: u32 },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Upload error: {0}")]
    Upload(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Inbox is shut down")]
    Shutdown,

    #[error("{0}")]
    Other(String),
}

/// Recovery class of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retried with backoff, never terminal until retries run out
    Transient,
    /// Peer or conversation cannot be addressed; needs a recipient flow
    PermanentAddressing,
    /// Content was rejected; retrying cannot help
    PermanentContent,
    /// Stream reconnects exhausted; needs a caller-triggered restart
    StreamFatal,
    /// Local failure unrelated to the transport
    Local,
}

/// Substrings that mark an opaque backend message as a transport hiccup
const TRANSIENT_MARKERS: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "connection",
    "unavailable",
    "reset by peer",
];

impl InboxError {
    /// Classify this error for the retry policy
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Network(_) | Self::Timeout(_) | Self::ConnectionRefused(_) => {
                ErrorClass::Transient
            }
            Self::InboxNotFound(_) | Self::ConversationNotFound(_) => {
                ErrorClass::PermanentAddressing
            }
            Self::InvalidInput(_) | Self::PayloadTooLarge { .. } | Self::MessageNotFound(_) => {
                ErrorClass::PermanentContent
            }
            Self::StreamExhausted { .. } => ErrorClass::StreamFatal,
            Self::Backend(msg) | Self::Upload(msg) | Self::Other(msg) => classify_message(msg),
            Self::Config(_)
            | Self::AlreadyInFlight(_)
            | Self::Parse(_)
            | Self::Io(_)
            | Self::Shutdown => ErrorClass::Local,
        }
    }

    /// Whether the send queue should retry after this error
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Whether this is the "peer has no reachable inbox" condition
    pub fn is_inbox_not_found(&self) -> bool {
        matches!(self, Self::InboxNotFound(_))
    }
}

/// Classify an opaque backend error message by its wording
pub fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorClass::Transient
    } else if lower.contains("inbox not found") || lower.contains("no inbox") {
        ErrorClass::PermanentAddressing
    } else {
        ErrorClass::PermanentContent
    }
}

impl From<std::io::Error> for InboxError {
    fn from(err: std::io::Error) -> Self {
        InboxError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for InboxError {
    fn from(err: toml::de::Error) -> Self {
        InboxError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for InboxError {
    fn from(err: serde_json::Error) -> Self {
        InboxError::Parse(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for InboxError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        InboxError::Timeout(err.to_string())
    }
}

impl From<String> for InboxError {
    fn from(err: String) -> Self {
        InboxError::Other(err)
    }
}

impl From<&str> for InboxError {
    fn from(err: &str) -> Self {
        InboxError::Other(err.to_string())
    }
}

/// Result type alias using InboxError
pub type Result<T> = std::result::Result<T, InboxError>;
