//! In-memory message store
//!
//! Messages are kept per conversation, ordered by (sent timestamp, id). All
//! writes go through this type; readers receive cloned snapshots. Optimistic
//! messages are reconciled with their confirmed counterparts here, so a
//! conversation never shows both.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

use crate::types::{
    DeliveryStatus, EditRecord, InboxError, Message, MessageContent, Reaction,
};

/// Outcome of merging a confirmed message
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// New message added to the timeline
    Inserted(Message),
    /// A local optimistic message was replaced by its confirmed copy
    Reconciled {
        optimistic_id: String,
        message: Message,
    },
    /// Known message whose status moved forward
    Updated(Message),
    /// Already present, nothing changed
    Duplicate,
    /// The message was deleted locally and stays deleted
    Tombstoned,
}

#[derive(Default)]
struct ConversationLog {
    messages: Vec<Message>,
    tombstones: HashSet<String>,
    tombstone_order: VecDeque<String>,
}

impl ConversationLog {
    fn insert_sorted(&mut self, message: Message) {
        let pos = self.messages.partition_point(|m| {
            (m.sent_at_ns, m.id.as_str()) <= (message.sent_at_ns, message.id.as_str())
        });
        self.messages.insert(pos, message);
    }

    fn position_by_id(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    fn position_by_optimistic(&self, optimistic_id: &str) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.optimistic_id.as_deref() == Some(optimistic_id))
    }

    /// In-flight optimistic message that `confirmed` is the transport copy of
    ///
    /// An exact timestamp match wins; otherwise the oldest in-flight message
    /// with identical content. Failed sends are never reconciled, so a late
    /// copy of one lands as its own entry and the failure stays visible.
    fn reconcile_candidate(&self, confirmed: &Message) -> Option<usize> {
        let in_flight = |m: &Message| {
            m.is_unconfirmed()
                && m.status == DeliveryStatus::Sending
                && m.sender == confirmed.sender
        };
        self.messages
            .iter()
            .position(|m| in_flight(m) && m.sent_at_ns == confirmed.sent_at_ns)
            .or_else(|| {
                self.messages
                    .iter()
                    .position(|m| in_flight(m) && m.content == confirmed.content)
            })
    }

    fn tombstone(&mut self, id: String, cap: usize) {
        if self.tombstones.insert(id.clone()) {
            self.tombstone_order.push_back(id);
        }
        while self.tombstone_order.len() > cap {
            if let Some(oldest) = self.tombstone_order.pop_front() {
                self.tombstones.remove(&oldest);
            }
        }
    }

    /// Drop the oldest confirmed messages beyond `cap`; unconfirmed ones stay
    fn evict(&mut self, cap: usize) -> usize {
        let mut evicted = 0;
        while self.messages.len() > cap {
            match self.messages.iter().position(|m| !m.is_unconfirmed()) {
                Some(pos) => {
                    self.messages.remove(pos);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }
}

/// Shared message-by-conversation store
pub struct MessageStore {
    self_identity: String,
    max_per_conversation: usize,
    logs: RwLock<HashMap<String, ConversationLog>>,
}

impl MessageStore {
    pub fn new(self_identity: impl Into<String>, max_per_conversation: usize) -> Self {
        Self {
            self_identity: self_identity.into(),
            max_per_conversation: max_per_conversation.max(1),
            logs: RwLock::new(HashMap::new()),
        }
    }

    pub fn self_identity(&self) -> &str {
        &self.self_identity
    }

    /// Add a locally created message in `Sending` state
    pub fn insert_optimistic(&self, message: Message) -> Result<(), InboxError> {
        let optimistic_id = message
            .optimistic_id
            .clone()
            .ok_or_else(|| InboxError::InvalidInput("optimistic message without id".into()))?;

        let mut logs = self.logs.write();
        if logs
            .values()
            .any(|log| log.position_by_optimistic(&optimistic_id).is_some())
        {
            return Err(InboxError::AlreadyInFlight(optimistic_id));
        }
        let log = logs.entry(message.conversation_id.clone()).or_default();
        log.insert_sorted(message);
        Ok(())
    }

    /// Merge a message that came from the transport
    pub fn upsert_confirmed(&self, mut message: Message) -> UpsertOutcome {
        if matches!(
            message.status,
            DeliveryStatus::Sending | DeliveryStatus::Failed
        ) {
            message.status = DeliveryStatus::Sent;
        }
        message.optimistic_id = None;

        let cap = self.max_per_conversation;
        let mut logs = self.logs.write();
        let log = logs.entry(message.conversation_id.clone()).or_default();

        if !message.id.is_empty() {
            if log.tombstones.contains(&message.id) {
                return UpsertOutcome::Tombstoned;
            }
            if let Some(pos) = log.position_by_id(&message.id) {
                let existing = &mut log.messages[pos];
                if existing.status.can_transition_to(message.status) {
                    existing.status = message.status;
                    return UpsertOutcome::Updated(existing.clone());
                }
                return UpsertOutcome::Duplicate;
            }
        } else if log
            .messages
            .iter()
            .any(|m| m.sent_at_ns == message.sent_at_ns && m.sender == message.sender)
        {
            return UpsertOutcome::Duplicate;
        }

        if message.sender == self.self_identity {
            if let Some(pos) = log.reconcile_candidate(&message) {
                let mut existing = log.messages.remove(pos);
                let optimistic_id = existing.optimistic_id.clone().unwrap_or_default();
                if !message.id.is_empty() {
                    existing.id = message.id.clone();
                }
                existing.sent_at_ns = message.sent_at_ns;
                existing.status = DeliveryStatus::Sent;
                log.insert_sorted(existing.clone());
                debug!(
                    "Reconciled optimistic message {} with confirmed {}",
                    optimistic_id, existing.id
                );
                return UpsertOutcome::Reconciled {
                    optimistic_id,
                    message: existing,
                };
            }
        }

        log.insert_sorted(message.clone());
        let evicted = log.evict(cap);
        if evicted > 0 {
            debug!(
                "Evicted {} old messages from conversation {}",
                evicted, message.conversation_id
            );
        }
        UpsertOutcome::Inserted(message)
    }

    /// Attach the transport id to an optimistic message and mark it sent
    pub fn confirm(&self, optimistic_id: &str, message_id: &str) -> Option<Message> {
        let mut logs = self.logs.write();
        for log in logs.values_mut() {
            if let Some(pos) = log.position_by_optimistic(optimistic_id) {
                let mut message = log.messages.remove(pos);
                if message.is_unconfirmed() {
                    if let Some(copy) = log.position_by_id(message_id) {
                        // The stream copy already landed on its own; keep that one
                        debug!(
                            "Optimistic message {} superseded by stream copy {}",
                            optimistic_id, message_id
                        );
                        let copy = &mut log.messages[copy];
                        copy.optimistic_id = Some(optimistic_id.to_string());
                        return Some(copy.clone());
                    }
                    message.id = message_id.to_string();
                }
                if message.status.can_transition_to(DeliveryStatus::Sent) {
                    message.status = DeliveryStatus::Sent;
                }
                log.insert_sorted(message.clone());
                return Some(message);
            }
        }
        None
    }

    /// Mark an optimistic message as failed
    pub fn mark_failed(&self, optimistic_id: &str) -> Option<Message> {
        let mut logs = self.logs.write();
        for log in logs.values_mut() {
            if let Some(pos) = log.position_by_optimistic(optimistic_id) {
                let message = &mut log.messages[pos];
                if message.status.can_transition_to(DeliveryStatus::Failed) {
                    message.status = DeliveryStatus::Failed;
                    return Some(message.clone());
                }
                return None;
            }
        }
        None
    }

    /// Forget the optimistic id of a settled message
    pub fn clear_optimistic(&self, optimistic_id: &str) -> bool {
        let mut logs = self.logs.write();
        for log in logs.values_mut() {
            if let Some(pos) = log.position_by_optimistic(optimistic_id) {
                let message = &mut log.messages[pos];
                if message.is_unconfirmed() {
                    return false;
                }
                message.optimistic_id = None;
                return true;
            }
        }
        false
    }

    /// Move an optimistic message to the conversation it was finally sent in
    pub fn reassign_conversation(&self, optimistic_id: &str, conversation_id: &str) -> bool {
        let mut logs = self.logs.write();
        let mut moved = None;
        let mut emptied = None;
        for (key, log) in logs.iter_mut() {
            if let Some(pos) = log.position_by_optimistic(optimistic_id) {
                if key == conversation_id {
                    return true;
                }
                let mut message = log.messages.remove(pos);
                message.conversation_id = conversation_id.to_string();
                if log.messages.is_empty() && log.tombstones.is_empty() {
                    emptied = Some(key.clone());
                }
                moved = Some(message);
                break;
            }
        }
        if let Some(key) = emptied {
            logs.remove(&key);
        }
        match moved {
            Some(message) => {
                logs.entry(conversation_id.to_string())
                    .or_default()
                    .insert_sorted(message);
                true
            }
            None => false,
        }
    }

    pub fn find_optimistic(&self, optimistic_id: &str) -> Option<Message> {
        let logs = self.logs.read();
        logs.values().find_map(|log| {
            log.position_by_optimistic(optimistic_id)
                .map(|pos| log.messages[pos].clone())
        })
    }

    pub fn get(&self, message_id: &str) -> Option<Message> {
        let logs = self.logs.read();
        logs.values()
            .find_map(|log| log.position_by_id(message_id).map(|pos| log.messages[pos].clone()))
    }

    /// Apply `f` to the message with `message_id` and return the result
    fn modify<F>(&self, message_id: &str, f: F) -> Result<Message, InboxError>
    where
        F: FnOnce(&mut Message) -> Result<(), InboxError>,
    {
        let mut logs = self.logs.write();
        for log in logs.values_mut() {
            if let Some(pos) = log.position_by_id(message_id) {
                let message = &mut log.messages[pos];
                f(message)?;
                return Ok(message.clone());
            }
        }
        Err(InboxError::MessageNotFound(message_id.to_string()))
    }

    /// Move a confirmed message's status forward (delivered, read)
    pub fn set_status(&self, message_id: &str, status: DeliveryStatus) -> Result<Message, InboxError> {
        self.modify(message_id, |message| {
            if message.status == status {
                return Ok(());
            }
            if !message.status.can_transition_to(status) {
                return Err(InboxError::InvalidInput(format!(
                    "illegal status transition {:?} -> {:?}",
                    message.status, status
                )));
            }
            message.status = status;
            Ok(())
        })
    }

    /// Replace the text of a message and record the previous version
    pub fn edit(&self, message_id: &str, text: &str, edited_at_ns: i64) -> Result<Message, InboxError> {
        let self_identity = self.self_identity.clone();
        self.modify(message_id, |message| {
            if message.sender != self_identity {
                return Err(InboxError::InvalidInput(
                    "only own messages can be edited".into(),
                ));
            }
            if message.status == DeliveryStatus::Failed {
                return Err(InboxError::InvalidInput("cannot edit a failed message".into()));
            }
            message.edits.push(EditRecord {
                previous_text: message.content.text.clone(),
                edited_at_ns,
            });
            message.content = MessageContent {
                text: Some(text.to_string()),
                ..message.content.clone()
            };
            Ok(())
        })
    }

    /// Add or remove `participant`'s reaction
    pub fn toggle_reaction(
        &self,
        message_id: &str,
        emoji: &str,
        participant: &str,
    ) -> Result<Message, InboxError> {
        let is_self = participant == self.self_identity;
        self.modify(message_id, |message| {
            let reaction = message
                .reactions
                .entry(emoji.to_string())
                .or_insert_with(Reaction::default);
            if let Some(pos) = reaction.participants.iter().position(|p| p == participant) {
                reaction.participants.remove(pos);
                reaction.count = reaction.count.saturating_sub(1);
                if is_self {
                    reaction.reacted_by_me = false;
                }
            } else {
                reaction.participants.push(participant.to_string());
                reaction.count += 1;
                if is_self {
                    reaction.reacted_by_me = true;
                }
            }
            if reaction.count == 0 {
                message.reactions.remove(emoji);
            }
            Ok(())
        })
    }

    /// Remove a message and tombstone its id; returns its conversation id
    pub fn delete(&self, message_id: &str) -> Result<String, InboxError> {
        let cap = self.max_per_conversation;
        let mut logs = self.logs.write();
        for (conversation_id, log) in logs.iter_mut() {
            if let Some(pos) = log.position_by_id(message_id) {
                log.messages.remove(pos);
                log.tombstone(message_id.to_string(), cap);
                return Ok(conversation_id.clone());
            }
        }
        Err(InboxError::MessageNotFound(message_id.to_string()))
    }

    pub fn delete_conversation(&self, conversation_id: &str) -> usize {
        let removed = self.logs.write().remove(conversation_id);
        removed.map_or(0, |log| log.messages.len())
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.logs
            .read()
            .get(conversation_id)
            .map(|log| log.messages.clone())
            .unwrap_or_default()
    }

    pub fn latest(&self, conversation_id: &str) -> Option<Message> {
        self.logs
            .read()
            .get(conversation_id)
            .and_then(|log| log.messages.last().cloned())
    }

    /// Every cached message, for the search index
    pub fn snapshot(&self) -> Vec<Message> {
        self.logs
            .read()
            .values()
            .flat_map(|log| log.messages.iter().cloned())
            .collect()
    }

    /// Messages from other senders newer than the read marker
    pub fn count_inbound_after(&self, conversation_id: &str, marker_ns: Option<i64>) -> u32 {
        let logs = self.logs.read();
        let Some(log) = logs.get(conversation_id) else {
            return 0;
        };
        let count = log
            .messages
            .iter()
            .filter(|m| m.sender != self.self_identity)
            .filter(|m| marker_ns.map_or(true, |marker| m.sent_at_ns > marker))
            .count();
        u32::try_from(count).unwrap_or_else(|_| {
            warn!("Unread count overflow in conversation {}", conversation_id);
            u32::MAX
        })
    }

    pub fn len(&self) -> usize {
        self.logs.read().values().map(|log| log.messages.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(id: &str, ts: i64, text: &str) -> Message {
        Message::confirmed(id, "c1", "alice", MessageContent::text(text), ts)
    }

    #[test]
    fn test_messages_ordered_by_timestamp() {
        let store = MessageStore::new("me", 100);
        store.upsert_confirmed(inbound("m3", 30, "c"));
        store.upsert_confirmed(inbound("m1", 10, "a"));
        store.upsert_confirmed(inbound("m2", 20, "b"));
        let ids: Vec<String> = store.messages("c1").into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn test_duplicate_ids_and_timestamps() {
        let store = MessageStore::new("me", 100);
        assert!(matches!(
            store.upsert_confirmed(inbound("m1", 10, "a")),
            UpsertOutcome::Inserted(_)
        ));
        assert_eq!(
            store.upsert_confirmed(inbound("m1", 10, "a")),
            UpsertOutcome::Duplicate
        );
        assert!(matches!(
            store.upsert_confirmed(inbound("", 50, "no id")),
            UpsertOutcome::Inserted(_)
        ));
        assert_eq!(
            store.upsert_confirmed(inbound("", 50, "no id")),
            UpsertOutcome::Duplicate
        );
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_status_moves_forward_on_redelivery() {
        let store = MessageStore::new("me", 100);
        store.upsert_confirmed(inbound("m1", 10, "a"));
        let mut read = inbound("m1", 10, "a");
        read.status = DeliveryStatus::Read;
        assert!(matches!(store.upsert_confirmed(read), UpsertOutcome::Updated(m) if m.status == DeliveryStatus::Read));
    }

    #[test]
    fn test_stream_copy_reconciles_optimistic() {
        let store = MessageStore::new("me", 100);
        let optimistic = Message::optimistic("opt-1", "c1", "me", MessageContent::text("hi"), 5);
        store.insert_optimistic(optimistic).unwrap();

        let confirmed = Message::confirmed("srv-1", "c1", "me", MessageContent::text("hi"), 7);
        match store.upsert_confirmed(confirmed) {
            UpsertOutcome::Reconciled {
                optimistic_id,
                message,
            } => {
                assert_eq!(optimistic_id, "opt-1");
                assert_eq!(message.id, "srv-1");
                assert_eq!(message.status, DeliveryStatus::Sent);
            }
            other => panic!("Expected Reconciled, got {:?}", other),
        }
        assert_eq!(store.messages("c1").len(), 1);

        // Late confirmation from the send call keeps the stream id
        let confirmed = store.confirm("opt-1", "srv-1").unwrap();
        assert_eq!(confirmed.id, "srv-1");
        assert_eq!(store.messages("c1").len(), 1);
    }

    #[test]
    fn test_stream_copy_never_revives_failed_send() {
        let store = MessageStore::new("me", 100);
        store
            .insert_optimistic(Message::optimistic("opt-1", "c1", "me", MessageContent::text("hi"), 5))
            .unwrap();
        store.mark_failed("opt-1").unwrap();

        let copy = Message::confirmed("srv-1", "c1", "me", MessageContent::text("hi"), 7);
        assert!(matches!(store.upsert_confirmed(copy), UpsertOutcome::Inserted(_)));
        assert_eq!(store.find_optimistic("opt-1").unwrap().status, DeliveryStatus::Failed);
        assert_eq!(store.get("srv-1").unwrap().status, DeliveryStatus::Sent);
        assert_eq!(store.messages("c1").len(), 2);
    }

    #[test]
    fn test_reconcile_prefers_timestamp_over_content() {
        let store = MessageStore::new("me", 100);
        for (id, ts) in [("opt-1", 5), ("opt-2", 8)] {
            store
                .insert_optimistic(Message::optimistic(id, "c1", "me", MessageContent::text("ok"), ts))
                .unwrap();
        }

        let exact = Message::confirmed("srv-2", "c1", "me", MessageContent::text("ok"), 8);
        assert!(matches!(
            store.upsert_confirmed(exact),
            UpsertOutcome::Reconciled { optimistic_id, .. } if optimistic_id == "opt-2"
        ));
        // Content alone picks the oldest send still in flight
        let later = Message::confirmed("srv-1", "c1", "me", MessageContent::text("ok"), 20);
        assert!(matches!(
            store.upsert_confirmed(later),
            UpsertOutcome::Reconciled { optimistic_id, .. } if optimistic_id == "opt-1"
        ));
        assert_eq!(store.messages("c1").len(), 2);
    }

    #[test]
    fn test_confirm_after_separate_stream_copy_keeps_one_entry() {
        let store = MessageStore::new("me", 100);
        store
            .insert_optimistic(Message::optimistic("opt-1", "c1", "me", MessageContent::text("a"), 5))
            .unwrap();
        // A copy the content match cannot pair with the send
        store.upsert_confirmed(Message::confirmed("srv-1", "c1", "me", MessageContent::text("A"), 6));

        let confirmed = store.confirm("opt-1", "srv-1").unwrap();
        assert_eq!(confirmed.id, "srv-1");
        assert_eq!(confirmed.status, DeliveryStatus::Sent);
        assert_eq!(store.messages("c1").len(), 1);
    }

    #[test]
    fn test_confirm_then_mark_failed_is_rejected() {
        let store = MessageStore::new("me", 100);
        store
            .insert_optimistic(Message::optimistic("opt-1", "c1", "me", MessageContent::text("x"), 1))
            .unwrap();
        let sent = store.confirm("opt-1", "srv-9").unwrap();
        assert_eq!(sent.status, DeliveryStatus::Sent);
        assert!(store.mark_failed("opt-1").is_none());
        assert!(store.clear_optimistic("opt-1"));
        assert!(store.get("srv-9").unwrap().optimistic_id.is_none());
    }

    #[test]
    fn test_duplicate_optimistic_id_rejected() {
        let store = MessageStore::new("me", 100);
        let msg = Message::optimistic("opt-1", "c1", "me", MessageContent::text("x"), 1);
        store.insert_optimistic(msg.clone()).unwrap();
        assert!(matches!(
            store.insert_optimistic(msg),
            Err(InboxError::AlreadyInFlight(_))
        ));
    }

    #[test]
    fn test_eviction_keeps_unconfirmed() {
        let store = MessageStore::new("me", 2);
        store
            .insert_optimistic(Message::optimistic("opt-1", "c1", "me", MessageContent::text("x"), 1))
            .unwrap();
        store.upsert_confirmed(inbound("m2", 2, "b"));
        store.upsert_confirmed(inbound("m3", 3, "c"));
        let ids: Vec<String> = store.messages("c1").into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["opt-1", "m3"]);
    }

    #[test]
    fn test_delete_tombstones() {
        let store = MessageStore::new("me", 100);
        store.upsert_confirmed(inbound("m1", 10, "a"));
        assert_eq!(store.delete("m1").unwrap(), "c1");
        assert_eq!(
            store.upsert_confirmed(inbound("m1", 10, "a")),
            UpsertOutcome::Tombstoned
        );
        assert!(store.messages("c1").is_empty());
        assert!(matches!(
            store.delete("m1"),
            Err(InboxError::MessageNotFound(_))
        ));
    }

    #[test]
    fn test_edit_and_reactions() {
        let store = MessageStore::new("me", 100);
        store.upsert_confirmed(Message::confirmed(
            "m1",
            "c1",
            "me",
            MessageContent::text("helo"),
            10,
        ));
        let edited = store.edit("m1", "hello", 20).unwrap();
        assert_eq!(edited.content.text.as_deref(), Some("hello"));
        assert_eq!(edited.edits[0].previous_text.as_deref(), Some("helo"));

        store.toggle_reaction("m1", "👍", "alice").unwrap();
        let msg = store.toggle_reaction("m1", "👍", "me").unwrap();
        let reaction = &msg.reactions["👍"];
        assert_eq!(reaction.count, 2);
        assert!(reaction.reacted_by_me);

        let msg = store.toggle_reaction("m1", "👍", "me").unwrap();
        assert!(!msg.reactions["👍"].reacted_by_me);
        let msg = store.toggle_reaction("m1", "👍", "alice").unwrap();
        assert!(!msg.has_reactions());

        store.upsert_confirmed(inbound("m2", 30, "theirs"));
        assert!(store.edit("m2", "mine now", 40).is_err());
    }

    #[test]
    fn test_unread_counts_inbound_after_marker() {
        let store = MessageStore::new("me", 100);
        store.upsert_confirmed(inbound("m1", 10, "a"));
        store.upsert_confirmed(inbound("m2", 20, "b"));
        store.upsert_confirmed(Message::confirmed("m3", "c1", "me", MessageContent::text("mine"), 30));
        assert_eq!(store.count_inbound_after("c1", None), 2);
        assert_eq!(store.count_inbound_after("c1", Some(10)), 1);
        assert_eq!(store.count_inbound_after("c1", Some(20)), 0);
        assert_eq!(store.count_inbound_after("missing", None), 0);
    }

    #[test]
    fn test_reassign_conversation() {
        let store = MessageStore::new("me", 100);
        store
            .insert_optimistic(Message::optimistic(
                "opt-1",
                "pending:bob",
                "me",
                MessageContent::text("hey"),
                1,
            ))
            .unwrap();
        assert!(store.reassign_conversation("opt-1", "dm-1"));
        assert!(store.messages("pending:bob").is_empty());
        assert_eq!(store.messages("dm-1")[0].conversation_id, "dm-1");
    }
}
