//! Conversation list cache
//!
//! Serves the conversation list from memory for a short TTL and refetches
//! from the transport when stale or forced. Streamed conversations are merged
//! incrementally. Client-side metadata (pins, tags, read marker) only lives
//! here, so it survives refreshes of the transport listing.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::InboxBackend;
use crate::config::CacheConfig;
use crate::sync::store::MessageStore;
use crate::types::{
    sort_conversations, Conversation, InboxError, Message, MetadataPatch, Peer,
};

/// Result of merging a streamed conversation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: bool,
    pub auto_selected: bool,
}

/// The conversation the user is looking at and who they are talking to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub conversation_id: String,
    pub recipient: Option<String>,
}

#[derive(Default)]
struct CacheEntry {
    conversations: HashMap<String, Conversation>,
    /// Start of the TTL window; cleared by `invalidate`
    fetched_at: Option<Instant>,
    /// A listing was fetched successfully at least once
    listed: bool,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    selection: Option<Selection>,
}

/// Conversation list cache keyed by the local identity
pub struct ConversationCache {
    backend: Arc<dyn InboxBackend>,
    store: Arc<MessageStore>,
    config: CacheConfig,
    state: RwLock<CacheState>,
    /// Serializes fetches so concurrent stale reads share one request
    fetch_lock: tokio::sync::Mutex<()>,
}

impl ConversationCache {
    pub fn new(backend: Arc<dyn InboxBackend>, store: Arc<MessageStore>, config: CacheConfig) -> Self {
        Self {
            backend,
            store,
            config,
            state: RwLock::new(CacheState::default()),
            fetch_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn key(&self) -> &str {
        self.backend.identity()
    }

    /// Sorted snapshot if the entry was fetched within the TTL
    fn fresh_snapshot(&self) -> Option<Vec<Conversation>> {
        let state = self.state.read();
        let entry = state.entries.get(self.key())?;
        let fetched_at = entry.fetched_at?;
        if fetched_at.elapsed() < self.config.ttl() {
            Some(sorted(entry))
        } else {
            None
        }
    }

    /// List conversations, pinned first then most recent
    ///
    /// Served from memory while the last fetch is younger than the TTL unless
    /// `force` is set. A failed fetch falls back to whatever is cached.
    pub async fn list(&self, force: bool) -> Result<Vec<Conversation>, InboxError> {
        if !force {
            if let Some(cached) = self.fresh_snapshot() {
                return Ok(cached);
            }
        }

        let _guard = self.fetch_lock.lock().await;
        if !force {
            // Another caller may have refreshed while we waited
            if let Some(cached) = self.fresh_snapshot() {
                return Ok(cached);
            }
        }

        debug!("Fetching conversation list for {}", self.key());
        let fetched = tokio::time::timeout(
            self.config.fetch_timeout(),
            self.backend.list_conversations(),
        )
        .await
        .map_err(|_| {
            InboxError::Timeout(format!(
                "conversation list exceeded {}s",
                self.config.fetch_timeout_seconds
            ))
        })
        .and_then(|result| result);

        match fetched {
            Ok(conversations) => {
                info!("Fetched {} conversations", conversations.len());
                Ok(self.replace(conversations))
            }
            Err(e) => {
                let state = self.state.read();
                // Conversations merged from the stream alone are not a listing
                match state.entries.get(self.key()).filter(|entry| entry.listed) {
                    Some(entry) => {
                        warn!("Conversation fetch failed, serving cached list: {}", e);
                        Ok(sorted(entry))
                    }
                    None => Err(e),
                }
            }
        }
    }

    /// Replace the cached listing, keeping local metadata and unread state
    fn replace(&self, fetched: Vec<Conversation>) -> Vec<Conversation> {
        let mut state = self.state.write();
        let key = self.key().to_string();
        let previous = state.entries.remove(&key).unwrap_or_default();

        let mut conversations = HashMap::with_capacity(fetched.len());
        for mut conversation in fetched {
            match previous.conversations.get(&conversation.id) {
                Some(local) => {
                    conversation.metadata = local.metadata.clone();
                    conversation.unread_count = local.unread_count;
                    if local.activity_ns() > conversation.activity_ns() {
                        conversation.last_message = local.last_message.clone();
                    }
                }
                None => {
                    let local_unread = self
                        .store
                        .count_inbound_after(&conversation.id, conversation.metadata.last_read_ns);
                    conversation.unread_count = conversation.unread_count.max(local_unread);
                }
            }
            conversations.insert(conversation.id.clone(), conversation);
        }

        let entry = CacheEntry {
            conversations,
            fetched_at: Some(Instant::now()),
            listed: true,
        };
        let snapshot = sorted(&entry);
        state.entries.insert(key, entry);
        snapshot
    }

    /// Merge a conversation announced on the stream
    ///
    /// A conversation not yet known is inserted. When nothing is selected it
    /// becomes the selection and its peer the active recipient.
    pub fn merge_streamed(&self, conversation: Conversation) -> MergeOutcome {
        let mut state = self.state.write();
        let key = self.key().to_string();
        let entry = state.entries.entry(key).or_default();
        if entry.conversations.contains_key(&conversation.id) {
            return MergeOutcome::default();
        }

        let selection = Selection {
            conversation_id: conversation.id.clone(),
            recipient: conversation.peer.recipient().map(str::to_string),
        };
        debug!("Merged streamed conversation {}", conversation.id);
        entry
            .conversations
            .insert(conversation.id.clone(), conversation);

        let auto_selected = state.selection.is_none();
        if auto_selected {
            info!("Auto-selecting conversation {}", selection.conversation_id);
            state.selection = Some(selection);
        }
        MergeOutcome {
            inserted: true,
            auto_selected,
        }
    }

    /// Insert or replace a conversation created locally (e.g. a new DM)
    pub fn insert_local(&self, conversation: Conversation) {
        let mut state = self.state.write();
        let key = self.key().to_string();
        let entry = state.entries.entry(key).or_default();
        match entry.conversations.get_mut(&conversation.id) {
            Some(existing) => existing.peer = conversation.peer,
            None => {
                entry
                    .conversations
                    .insert(conversation.id.clone(), conversation);
            }
        }
    }

    pub fn get(&self, conversation_id: &str) -> Option<Conversation> {
        let state = self.state.read();
        state
            .entries
            .get(self.key())
            .and_then(|entry| entry.conversations.get(conversation_id).cloned())
    }

    pub fn contains(&self, conversation_id: &str) -> bool {
        self.get(conversation_id).is_some()
    }

    /// Cached direct conversation with `peer`, if any
    pub fn find_direct(&self, peer: &str) -> Option<Conversation> {
        let state = self.state.read();
        state.entries.get(self.key()).and_then(|entry| {
            entry
                .conversations
                .values()
                .find(|c| c.peer.is_direct_with(peer))
                .cloned()
        })
    }

    pub fn select(&self, conversation_id: &str) -> Result<Selection, InboxError> {
        let conversation = self
            .get(conversation_id)
            .ok_or_else(|| InboxError::ConversationNotFound(conversation_id.to_string()))?;
        let selection = Selection {
            conversation_id: conversation.id,
            recipient: conversation.peer.recipient().map(str::to_string),
        };
        self.state.write().selection = Some(selection.clone());
        Ok(selection)
    }

    pub fn clear_selection(&self) {
        self.state.write().selection = None;
    }

    pub fn selection(&self) -> Option<Selection> {
        self.state.read().selection.clone()
    }

    /// Apply a metadata patch and recompute the unread count in one step
    pub fn update_metadata(
        &self,
        conversation_id: &str,
        patch: &MetadataPatch,
    ) -> Result<Conversation, InboxError> {
        let mut state = self.state.write();
        let conversation = state
            .entries
            .get_mut(self.key())
            .and_then(|entry| entry.conversations.get_mut(conversation_id))
            .ok_or_else(|| InboxError::ConversationNotFound(conversation_id.to_string()))?;

        // Work on a copy so readers never observe a half-applied patch
        let mut metadata = conversation.metadata.clone();
        patch.apply(&mut metadata);
        let unread = self
            .store
            .count_inbound_after(conversation_id, metadata.last_read_ns);

        conversation.metadata = metadata;
        conversation.unread_count = unread;
        Ok(conversation.clone())
    }

    /// Mark everything up to the latest message as read
    pub fn mark_read(&self, conversation_id: &str) -> Result<Conversation, InboxError> {
        let marker = self
            .store
            .latest(conversation_id)
            .map(|m| m.sent_at_ns)
            .or_else(|| {
                self.get(conversation_id)
                    .and_then(|c| c.last_message.map(|m| m.sent_at_ns))
            })
            .unwrap_or(0);
        self.update_metadata(conversation_id, &MetadataPatch::read_up_to(marker))
    }

    /// Fold a stored message into its conversation's preview and unread count
    ///
    /// Returns false when the conversation is not cached.
    pub fn record_message(&self, message: &Message) -> bool {
        let mut state = self.state.write();
        let Some(conversation) = state
            .entries
            .get_mut(self.key())
            .and_then(|entry| entry.conversations.get_mut(&message.conversation_id))
        else {
            return false;
        };
        conversation.observe_message(message);
        conversation.unread_count = self
            .store
            .count_inbound_after(&conversation.id, conversation.metadata.last_read_ns);
        true
    }

    /// Recompute preview and unread count after messages were removed
    pub fn refresh_from_store(&self, conversation_id: &str) {
        let latest = self.store.latest(conversation_id);
        let mut state = self.state.write();
        if let Some(conversation) = state
            .entries
            .get_mut(self.key())
            .and_then(|entry| entry.conversations.get_mut(conversation_id))
        {
            conversation.last_message = latest.as_ref().map(crate::types::LastMessage::from_message);
            conversation.unread_count = self
                .store
                .count_inbound_after(conversation_id, conversation.metadata.last_read_ns);
        }
    }

    pub fn remove(&self, conversation_id: &str) -> Option<Conversation> {
        let mut state = self.state.write();
        let removed = state
            .entries
            .get_mut(self.key())
            .and_then(|entry| entry.conversations.remove(conversation_id));
        if state
            .selection
            .as_ref()
            .map_or(false, |s| s.conversation_id == conversation_id)
        {
            state.selection = None;
        }
        removed
    }

    /// Expire the TTL so the next `list` refetches
    pub fn invalidate(&self) {
        let mut state = self.state.write();
        if let Some(entry) = state.entries.get_mut(self.key()) {
            entry.fetched_at = None;
        }
    }

    /// Sorted snapshot without touching the network
    pub fn cached(&self) -> Vec<Conversation> {
        let state = self.state.read();
        state.entries.get(self.key()).map(sorted).unwrap_or_default()
    }

    /// Peer of a conversation, used to label a selection
    pub fn peer(&self, conversation_id: &str) -> Option<Peer> {
        self.get(conversation_id).map(|c| c.peer)
    }
}

fn sorted(entry: &CacheEntry) -> Vec<Conversation> {
    let mut conversations: Vec<Conversation> = entry.conversations.values().cloned().collect();
    sort_conversations(&mut conversations);
    conversations
}
