use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Delivery status of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    /// Check whether moving from `self` to `next` is a legal transition
    ///
    /// Optimistic messages only leave `Sending` for `Sent` or `Failed`;
    /// confirmed messages only move forward through `Delivered` and `Read`.
    pub fn can_transition_to(self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Sending, Sent)
                | (Sending, Failed)
                | (Sent, Delivered)
                | (Sent, Read)
                | (Delivered, Read)
        )
    }

    pub fn is_terminal_failure(self) -> bool {
        self == Self::Failed
    }
}

/// Uploaded file referenced by a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub file_name: String,
    pub mime_type: String,
    pub size: usize,
}

/// Reference to an earlier message that this one replies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteReference {
    pub message_id: String,
    pub excerpt: String,
}

/// Structured (non-text) message payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StructuredPayload {
    Location {
        latitude: f64,
        longitude: f64,
        label: Option<String>,
    },
    Contact {
        name: String,
        identity: String,
    },
    Poll {
        question: String,
        options: Vec<String>,
    },
    CalendarEvent {
        title: String,
        starts_at_ns: i64,
        ends_at_ns: Option<i64>,
    },
    Payment {
        amount: String,
        currency: String,
        reference: Option<String>,
    },
}

impl StructuredPayload {
    /// Text a user would expect search to find in this payload
    pub fn searchable_text(&self) -> String {
        match self {
            Self::Location { label, .. } => label.clone().unwrap_or_default(),
            Self::Contact { name, identity } => format!("{} {}", name, identity),
            Self::Poll { question, options } => format!("{} {}", question, options.join(" ")),
            Self::CalendarEvent { title, .. } => title.clone(),
            Self::Payment {
                amount, currency, ..
            } => format!("{} {}", amount, currency),
        }
    }
}

/// Declared content type, used for filtering and scoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Attachment,
    Location,
    Contact,
    Poll,
    CalendarEvent,
    Payment,
    Reply,
}

/// Message body: text and/or structured payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    pub text: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub payload: Option<StructuredPayload>,
    pub quote: Option<QuoteReference>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.as_deref().map_or(true, |t| t.trim().is_empty())
            && self.attachments.is_empty()
            && self.payload.is_none()
    }

    /// Declared type: structured payload first, then attachments, then replies
    pub fn kind(&self) -> ContentKind {
        match &self.payload {
            Some(StructuredPayload::Location { .. }) => ContentKind::Location,
            Some(StructuredPayload::Contact { .. }) => ContentKind::Contact,
            Some(StructuredPayload::Poll { .. }) => ContentKind::Poll,
            Some(StructuredPayload::CalendarEvent { .. }) => ContentKind::CalendarEvent,
            Some(StructuredPayload::Payment { .. }) => ContentKind::Payment,
            None if !self.attachments.is_empty() => ContentKind::Attachment,
            None if self.quote.is_some() => ContentKind::Reply,
            None => ContentKind::Text,
        }
    }

    /// All text that the search index matches against
    pub fn searchable_text(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(text) = &self.text {
            parts.push(text.clone());
        }
        for attachment in &self.attachments {
            parts.push(attachment.file_name.clone());
        }
        if let Some(payload) = &self.payload {
            parts.push(payload.searchable_text());
        }
        parts.join(" ")
    }

    /// Short preview for conversation list rows
    pub fn preview(&self) -> String {
        if let Some(text) = self.text.as_deref().filter(|t| !t.trim().is_empty()) {
            return text.chars().take(80).collect();
        }
        match self.kind() {
            ContentKind::Attachment => format!("[{} attachment(s)]", self.attachments.len()),
            ContentKind::Location => "[location]".to_string(),
            ContentKind::Contact => "[contact]".to_string(),
            ContentKind::Poll => "[poll]".to_string(),
            ContentKind::CalendarEvent => "[event]".to_string(),
            ContentKind::Payment => "[payment]".to_string(),
            ContentKind::Reply | ContentKind::Text => String::new(),
        }
    }

    /// Approximate encoded size used for payload limits
    pub fn text_len(&self) -> usize {
        self.text.as_deref().map_or(0, str::len)
    }
}

/// Aggregated reactions for one emoji
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub count: u32,
    pub participants: Vec<String>,
    pub reacted_by_me: bool,
}

/// Previous version of an edited message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRecord {
    pub previous_text: Option<String>,
    pub edited_at_ns: i64,
}

/// A chat message, optimistic or confirmed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Transport-assigned id once confirmed, the optimistic id before that.
    /// Empty when the transport did not provide one.
    pub id: String,
    /// Local id minted by the send queue; cleared after the grace period
    pub optimistic_id: Option<String>,
    pub conversation_id: String,
    pub sender: String,
    pub content: MessageContent,
    pub sent_at_ns: i64,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub reactions: BTreeMap<String, Reaction>,
    #[serde(default)]
    pub edits: Vec<EditRecord>,
}

impl Message {
    /// Build a confirmed message as the transport would deliver it
    pub fn confirmed(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        sender: impl Into<String>,
        content: MessageContent,
        sent_at_ns: i64,
    ) -> Self {
        Self {
            id: id.into(),
            optimistic_id: None,
            conversation_id: conversation_id.into(),
            sender: sender.into(),
            content,
            sent_at_ns,
            status: DeliveryStatus::Sent,
            reactions: BTreeMap::new(),
            edits: Vec::new(),
        }
    }

    /// Build a local optimistic message in `Sending` state
    pub fn optimistic(
        optimistic_id: impl Into<String>,
        conversation_id: impl Into<String>,
        sender: impl Into<String>,
        content: MessageContent,
        sent_at_ns: i64,
    ) -> Self {
        let optimistic_id = optimistic_id.into();
        Self {
            id: optimistic_id.clone(),
            optimistic_id: Some(optimistic_id),
            conversation_id: conversation_id.into(),
            sender: sender.into(),
            content,
            sent_at_ns,
            status: DeliveryStatus::Sending,
            reactions: BTreeMap::new(),
            edits: Vec::new(),
        }
    }

    /// Optimistic message the transport has not assigned an id to yet
    pub fn is_unconfirmed(&self) -> bool {
        self.optimistic_id.as_deref() == Some(self.id.as_str())
    }

    pub fn has_attachments(&self) -> bool {
        !self.content.attachments.is_empty()
    }

    pub fn has_reactions(&self) -> bool {
        self.reactions.values().any(|r| r.count > 0)
    }

    pub fn identity(&self) -> MessageIdentity {
        MessageIdentity::of(self)
    }
}

/// Identity used for deduplication
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageIdentity {
    Id(String),
    Timestamp {
        conversation_id: String,
        sent_at_ns: i64,
    },
}

impl MessageIdentity {
    /// Stable message id when present, else (conversation, sent timestamp)
    pub fn of(message: &Message) -> Self {
        if message.id.trim().is_empty() {
            Self::Timestamp {
                conversation_id: message.conversation_id.clone(),
                sent_at_ns: message.sent_at_ns,
            }
        } else {
            Self::Id(message.id.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use DeliveryStatus::*;
        assert!(Sending.can_transition_to(Sent));
        assert!(Sending.can_transition_to(Failed));
        assert!(Sent.can_transition_to(Read));
        assert!(!Sending.can_transition_to(Delivered));
        assert!(!Sent.can_transition_to(Sending));
        assert!(!Failed.can_transition_to(Sent));
        assert!(!Read.can_transition_to(Delivered));
    }

    #[test]
    fn test_identity_falls_back_to_timestamp() {
        let mut msg = Message::confirmed("", "conv-1", "alice", MessageContent::text("hi"), 42);
        assert_eq!(
            msg.identity(),
            MessageIdentity::Timestamp {
                conversation_id: "conv-1".to_string(),
                sent_at_ns: 42
            }
        );
        msg.id = "m-1".to_string();
        assert_eq!(msg.identity(), MessageIdentity::Id("m-1".to_string()));
    }

    #[test]
    fn test_content_kind_precedence() {
        let mut content = MessageContent::text("see attached");
        assert_eq!(content.kind(), ContentKind::Text);

        content.attachments.push(Attachment {
            url: "https://files/1".to_string(),
            thumbnail_url: None,
            file_name: "report.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            size: 10,
        });
        assert_eq!(content.kind(), ContentKind::Attachment);
        assert_eq!(content.searchable_text(), "see attached report.pdf");

        content.payload = Some(StructuredPayload::Poll {
            question: "Lunch?".to_string(),
            options: vec!["yes".to_string(), "no".to_string()],
        });
        assert_eq!(content.kind(), ContentKind::Poll);
    }

    #[test]
    fn test_optimistic_message_is_unconfirmed() {
        let mut msg = Message::optimistic("opt-1", "conv-1", "me", MessageContent::text("hi"), 1);
        assert!(msg.is_unconfirmed());
        msg.id = "server-1".to_string();
        assert!(!msg.is_unconfirmed());
    }

    #[test]
    fn test_empty_content() {
        assert!(MessageContent::default().is_empty());
        assert!(MessageContent::text("   ").is_empty());
        assert!(!MessageContent::text("hi").is_empty());
    }
}
