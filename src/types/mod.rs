pub mod conversation;
pub mod error;
pub mod message;

pub use conversation::{
    compare_conversations, sort_conversations, Conversation, ConversationMetadata, LastMessage,
    MetadataPatch, Peer,
};
pub use error::{ErrorClass, InboxError, Result};
pub use message::{
    Attachment, ContentKind, DeliveryStatus, EditRecord, Message, MessageContent, MessageIdentity,
    QuoteReference, Reaction, StructuredPayload,
};

use chrono::Utc;

/// Current wall-clock time in nanoseconds since the Unix epoch
pub fn now_ns() -> i64 {
    let now = Utc::now();
    now.timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_millis().saturating_mul(1_000_000))
}

/// Nanoseconds to whole milliseconds, clamped non-negative
pub fn ns_to_ms_clamped(ns: i64) -> u64 {
    if ns <= 0 {
        0
    } else {
        (ns / 1_000_000) as u64
    }
}
