use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

use super::message::Message;

/// Who a conversation is with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Peer {
    Direct {
        identity: String,
    },
    Group {
        name: Option<String>,
        members: Vec<String>,
    },
}

impl Peer {
    /// Identity to address when this conversation becomes the active recipient
    pub fn recipient(&self) -> Option<&str> {
        match self {
            Self::Direct { identity } => Some(identity),
            Self::Group { .. } => None,
        }
    }

    pub fn is_direct_with(&self, identity: &str) -> bool {
        matches!(self, Self::Direct { identity: i } if i.eq_ignore_ascii_case(identity))
    }
}

/// Reference to the newest message of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    pub id: String,
    pub sender: String,
    pub preview: String,
    pub sent_at_ns: i64,
}

impl LastMessage {
    pub fn from_message(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            sender: message.sender.clone(),
            preview: message.content.preview(),
            sent_at_ns: message.sent_at_ns,
        }
    }
}

/// Locally owned conversation metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMetadata {
    pub pinned: bool,
    pub archived: bool,
    pub muted: bool,
    pub mute_until_ns: Option<i64>,
    pub tags: BTreeSet<String>,
    pub last_read_ns: Option<i64>,
}

/// Partial update for [`ConversationMetadata`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataPatch {
    pub pinned: Option<bool>,
    pub archived: Option<bool>,
    pub muted: Option<bool>,
    /// `Some(None)` clears the mute deadline
    pub mute_until_ns: Option<Option<i64>>,
    #[serde(default)]
    pub add_tags: Vec<String>,
    #[serde(default)]
    pub remove_tags: Vec<String>,
    pub last_read_ns: Option<i64>,
}

impl MetadataPatch {
    pub fn pin(pinned: bool) -> Self {
        Self {
            pinned: Some(pinned),
            ..Default::default()
        }
    }

    pub fn read_up_to(timestamp_ns: i64) -> Self {
        Self {
            last_read_ns: Some(timestamp_ns),
            ..Default::default()
        }
    }

    pub fn apply(&self, metadata: &mut ConversationMetadata) {
        if let Some(pinned) = self.pinned {
            metadata.pinned = pinned;
        }
        if let Some(archived) = self.archived {
            metadata.archived = archived;
        }
        if let Some(muted) = self.muted {
            metadata.muted = muted;
            if !muted {
                metadata.mute_until_ns = None;
            }
        }
        if let Some(until) = self.mute_until_ns {
            metadata.mute_until_ns = until;
        }
        for tag in &self.add_tags {
            let tag = tag.trim();
            if !tag.is_empty() {
                metadata.tags.insert(tag.to_string());
            }
        }
        for tag in &self.remove_tags {
            metadata.tags.remove(tag.trim());
        }
        if let Some(ts) = self.last_read_ns {
            // The read marker never moves backwards
            metadata.last_read_ns = Some(metadata.last_read_ns.map_or(ts, |cur| cur.max(ts)));
        }
    }
}

/// Conversation projection held by the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub peer: Peer,
    pub created_at_ns: i64,
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub metadata: ConversationMetadata,
    #[serde(default)]
    pub unread_count: u32,
}

impl Conversation {
    pub fn direct(id: impl Into<String>, peer: impl Into<String>, created_at_ns: i64) -> Self {
        Self {
            id: id.into(),
            peer: Peer::Direct {
                identity: peer.into(),
            },
            created_at_ns,
            last_message: None,
            metadata: ConversationMetadata::default(),
            unread_count: 0,
        }
    }

    pub fn group(
        id: impl Into<String>,
        name: Option<String>,
        members: Vec<String>,
        created_at_ns: i64,
    ) -> Self {
        Self {
            id: id.into(),
            peer: Peer::Group { name, members },
            created_at_ns,
            last_message: None,
            metadata: ConversationMetadata::default(),
            unread_count: 0,
        }
    }

    /// Timestamp used for recency ordering
    pub fn activity_ns(&self) -> i64 {
        self.last_message
            .as_ref()
            .map_or(self.created_at_ns, |m| m.sent_at_ns)
    }

    /// Muted, and either muted indefinitely or the deadline is still ahead
    pub fn is_muted(&self, now_ns: i64) -> bool {
        self.metadata.muted && self.metadata.mute_until_ns.map_or(true, |until| until > now_ns)
    }

    /// Record a newer message as the last message; older ones are ignored
    pub fn observe_message(&mut self, message: &Message) -> bool {
        let newer = self
            .last_message
            .as_ref()
            .map_or(true, |last| message.sent_at_ns >= last.sent_at_ns);
        if newer {
            self.last_message = Some(LastMessage::from_message(message));
        }
        newer
    }
}

/// Pinned first, then most recent activity, then id
pub fn compare_conversations(a: &Conversation, b: &Conversation) -> Ordering {
    b.metadata
        .pinned
        .cmp(&a.metadata.pinned)
        .then_with(|| b.activity_ns().cmp(&a.activity_ns()))
        .then_with(|| a.id.cmp(&b.id))
}

pub fn sort_conversations(conversations: &mut [Conversation]) {
    conversations.sort_by(compare_conversations);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::message::MessageContent;

    fn with_last(mut conv: Conversation, ts: i64) -> Conversation {
        conv.last_message = Some(LastMessage {
            id: format!("m-{}", ts),
            sender: "peer".to_string(),
            preview: String::new(),
            sent_at_ns: ts,
        });
        conv
    }

    #[test]
    fn test_pinned_sorts_before_recent() {
        let a = with_last(Conversation::direct("a", "alice", 0), 100);
        let mut b = with_last(Conversation::direct("b", "bob", 0), 10);
        b.metadata.pinned = true;

        let mut list = vec![a, b];
        sort_conversations(&mut list);
        let ids: Vec<&str> = list.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_sort_falls_back_to_creation_time_and_id() {
        let old = Conversation::direct("old", "x", 5);
        let new = Conversation::direct("new", "y", 50);
        let tie_a = Conversation::direct("tie-a", "z", 20);
        let tie_b = Conversation::direct("tie-b", "w", 20);

        let mut list = vec![old, tie_b, new, tie_a];
        sort_conversations(&mut list);
        let ids: Vec<&str> = list.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "tie-a", "tie-b", "old"]);
    }

    #[test]
    fn test_metadata_patch() {
        let mut meta = ConversationMetadata::default();
        MetadataPatch {
            pinned: Some(true),
            muted: Some(true),
            mute_until_ns: Some(Some(500)),
            add_tags: vec!["work".to_string(), " ".to_string()],
            last_read_ns: Some(20),
            ..Default::default()
        }
        .apply(&mut meta);
        assert!(meta.pinned);
        assert_eq!(meta.mute_until_ns, Some(500));
        assert_eq!(meta.tags.len(), 1);

        // Read marker does not regress, unmute clears the deadline
        MetadataPatch {
            muted: Some(false),
            remove_tags: vec!["work".to_string()],
            last_read_ns: Some(10),
            ..Default::default()
        }
        .apply(&mut meta);
        assert_eq!(meta.last_read_ns, Some(20));
        assert_eq!(meta.mute_until_ns, None);
        assert!(meta.tags.is_empty());
    }

    #[test]
    fn test_mute_expiry() {
        let mut conv = Conversation::direct("c", "p", 0);
        conv.metadata.muted = true;
        assert!(conv.is_muted(1_000));
        conv.metadata.mute_until_ns = Some(100);
        assert!(conv.is_muted(50));
        assert!(!conv.is_muted(150));
    }

    #[test]
    fn test_observe_message_keeps_newest() {
        let mut conv = Conversation::direct("c", "p", 0);
        let newer = Message::confirmed("m2", "c", "p", MessageContent::text("second"), 20);
        let older = Message::confirmed("m1", "c", "p", MessageContent::text("first"), 10);
        assert!(conv.observe_message(&newer));
        assert!(!conv.observe_message(&older));
        assert_eq!(conv.last_message.as_ref().map(|m| m.id.as_str()), Some("m2"));
    }
}
