//! Optimistic send pipeline
//!
//! A send shows up locally right away as a `Sending` message, then goes to
//! the transport with a bounded timeout. Transient failures park the message
//! in a retry queue that a background ticker drains with exponential backoff;
//! anything else marks it `Failed` immediately.
//!
//! For a given optimistic id at most one delivery attempt runs at a time: an
//! entry is taken out of the pending set before its attempt starts and only
//! put back when that attempt fails transiently.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backend::InboxBackend;
use crate::config::SendConfig;
use crate::sync::conversation::ConversationCache;
use crate::sync::dedup::Deduplicator;
use crate::sync::events::{EventBus, InboxEvent};
use crate::sync::store::MessageStore;
use crate::types::{
    now_ns, DeliveryStatus, InboxError, Message, MessageContent, MessageIdentity,
};

/// Conversation id used until a direct conversation with the peer exists
const PROVISIONAL_PREFIX: &str = "pending:";

/// Outgoing message request
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub conversation_id: Option<String>,
    /// Peer to open a direct conversation with when no conversation is given
    pub recipient: Option<String>,
    pub content: MessageContent,
    /// Caller-chosen optimistic id; generated when absent
    pub optimistic_id: Option<String>,
}

impl SendRequest {
    pub fn to_conversation(conversation_id: impl Into<String>, content: MessageContent) -> Self {
        Self {
            conversation_id: Some(conversation_id.into()),
            recipient: None,
            content,
            optimistic_id: None,
        }
    }

    pub fn to_peer(recipient: impl Into<String>, content: MessageContent) -> Self {
        Self {
            conversation_id: None,
            recipient: Some(recipient.into()),
            content,
            optimistic_id: None,
        }
    }

    pub fn with_optimistic_id(mut self, optimistic_id: impl Into<String>) -> Self {
        self.optimistic_id = Some(optimistic_id.into());
        self
    }
}

/// Where a send ended up after its latest attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SendState {
    Sent { message_id: String },
    /// Waiting in the retry queue
    Queued { attempt: u32, retry_in_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOutcome {
    pub optimistic_id: String,
    pub conversation_id: String,
    pub state: SendState,
}

/// A send waiting for its next attempt
#[derive(Debug, Clone)]
pub struct RetryEntry {
    pub optimistic_id: String,
    pub conversation_id: String,
    pub recipient: Option<String>,
    pub content: MessageContent,
    /// Attempts already made beyond the first
    pub attempt: u32,
    pub next_attempt_at: Instant,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct QueueState {
    pending: HashMap<String, RetryEntry>,
    in_flight: HashSet<String>,
    /// Optimistic ids to forget once the grace period ends
    confirmations: VecDeque<(Instant, String)>,
}

pub struct SendQueue {
    backend: Arc<dyn InboxBackend>,
    store: Arc<MessageStore>,
    cache: Arc<ConversationCache>,
    dedup: Arc<Deduplicator>,
    events: Arc<EventBus>,
    config: SendConfig,
    state: Mutex<QueueState>,
}

impl SendQueue {
    pub fn new(
        backend: Arc<dyn InboxBackend>,
        store: Arc<MessageStore>,
        cache: Arc<ConversationCache>,
        dedup: Arc<Deduplicator>,
        events: Arc<EventBus>,
        config: SendConfig,
    ) -> Self {
        Self {
            backend,
            store,
            cache,
            dedup,
            events,
            config,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Reject content the transport would refuse anyway
    pub fn validate(&self, content: &MessageContent) -> Result<(), InboxError> {
        if content.is_empty() {
            return Err(InboxError::InvalidInput("message has no content".into()));
        }
        let size = content.text_len();
        if size > self.config.max_text_bytes {
            return Err(InboxError::PayloadTooLarge {
                size,
                limit: self.config.max_text_bytes,
            });
        }
        if content.attachments.len() > self.config.max_attachments {
            return Err(InboxError::InvalidInput(format!(
                "at most {} attachments per message",
                self.config.max_attachments
            )));
        }
        if let Some(attachment) = content
            .attachments
            .iter()
            .find(|a| a.size > self.config.max_attachment_bytes)
        {
            return Err(InboxError::PayloadTooLarge {
                size: attachment.size,
                limit: self.config.max_attachment_bytes,
            });
        }
        Ok(())
    }

    /// Send a message optimistically
    ///
    /// Returns `Sent` when the first attempt succeeded and `Queued` when it
    /// failed transiently and a retry is scheduled. Permanent failures mark
    /// the local message failed and return the error; `InboxNotFound` means
    /// the recipient has no reachable inbox.
    pub async fn send(&self, request: SendRequest) -> Result<SendOutcome, InboxError> {
        self.validate(&request.content)?;

        let conversation_id = match (&request.conversation_id, &request.recipient) {
            (Some(id), _) if !id.trim().is_empty() => id.trim().to_string(),
            (_, Some(peer)) if !peer.trim().is_empty() => {
                let peer = peer.trim();
                self.cache
                    .find_direct(peer)
                    .map(|c| c.id)
                    .unwrap_or_else(|| format!("{}{}", PROVISIONAL_PREFIX, peer))
            }
            _ => {
                return Err(InboxError::InvalidInput(
                    "a conversation or recipient is required".into(),
                ))
            }
        };

        let optimistic_id = request
            .optimistic_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        self.claim(&optimistic_id)?;

        let message = Message::optimistic(
            optimistic_id.clone(),
            conversation_id.clone(),
            self.store.self_identity(),
            request.content.clone(),
            now_ns(),
        );
        if let Err(e) = self.store.insert_optimistic(message.clone()) {
            self.release(&optimistic_id);
            return Err(e);
        }
        self.cache.record_message(&message);
        debug!("Queued optimistic message {} in {}", optimistic_id, conversation_id);
        self.events.emit(InboxEvent::MessageReceived {
            message,
            latency_ms: None,
        });
        self.emit_status(&optimistic_id, &conversation_id, None, DeliveryStatus::Sending, None);

        let entry = RetryEntry {
            optimistic_id,
            conversation_id,
            recipient: request.recipient.map(|r| r.trim().to_string()),
            content: request.content,
            attempt: 0,
            next_attempt_at: Instant::now(),
            last_error: None,
        };
        self.run_attempt(entry).await
    }

    /// Mark `optimistic_id` as in flight, failing if it already is or is queued
    fn claim(&self, optimistic_id: &str) -> Result<(), InboxError> {
        let mut state = self.state.lock();
        if state.pending.contains_key(optimistic_id) || !state.in_flight.insert(optimistic_id.to_string()) {
            return Err(InboxError::AlreadyInFlight(optimistic_id.to_string()));
        }
        Ok(())
    }

    fn release(&self, optimistic_id: &str) {
        self.state.lock().in_flight.remove(optimistic_id);
    }

    /// One delivery attempt for a claimed entry
    async fn run_attempt(&self, entry: RetryEntry) -> Result<SendOutcome, InboxError> {
        let mut guard = AttemptGuard {
            queue: self,
            entry: Some(entry.clone()),
        };
        let result = self.deliver(&entry).await;
        guard.entry = None;
        let outcome = match result {
            Ok((conversation_id, message_id)) => {
                Ok(self.on_success(&entry.optimistic_id, conversation_id, message_id))
            }
            Err(e) => self.on_failure(entry.clone(), e),
        };
        self.release(&entry.optimistic_id);
        outcome
    }

    async fn deliver(&self, entry: &RetryEntry) -> Result<(String, String), InboxError> {
        let conversation_id = self.resolve(entry).await?;
        let message_id = tokio::time::timeout(
            self.config.send_timeout(),
            self.backend.send(&conversation_id, &entry.content),
        )
        .await
        .map_err(|_| {
            InboxError::Timeout(format!(
                "send exceeded {}s",
                self.config.send_timeout_seconds
            ))
        })??;
        Ok((conversation_id, message_id))
    }

    /// Open the direct conversation for a provisional entry
    async fn resolve(&self, entry: &RetryEntry) -> Result<String, InboxError> {
        let peer = match (&entry.recipient, entry.conversation_id.strip_prefix(PROVISIONAL_PREFIX)) {
            (Some(peer), Some(_)) => peer,
            _ => return Ok(entry.conversation_id.clone()),
        };

        let conversation = tokio::time::timeout(
            self.config.send_timeout(),
            self.backend.new_direct_message(peer),
        )
        .await
        .map_err(|_| InboxError::Timeout(format!("opening conversation with {}", peer)))??;

        info!("Opened direct conversation {} with {}", conversation.id, peer);
        let conversation_id = conversation.id.clone();
        self.cache.insert_local(conversation);
        if self
            .store
            .reassign_conversation(&entry.optimistic_id, &conversation_id)
        {
            if let Some(message) = self.store.find_optimistic(&entry.optimistic_id) {
                self.cache.record_message(&message);
            }
        }
        self.events.emit(InboxEvent::ConversationListChanged {
            conversation_ids: vec![conversation_id.clone()],
        });
        Ok(conversation_id)
    }

    fn on_success(&self, optimistic_id: &str, conversation_id: String, message_id: String) -> SendOutcome {
        // The stream copy of this message must not show up as a second entry
        self.dedup.remember(MessageIdentity::Id(message_id.clone()));

        match self.store.confirm(optimistic_id, &message_id) {
            Some(message) => {
                self.cache.record_message(&message);
                self.events.emit(InboxEvent::MessageUpdated { message });
            }
            None => warn!("Confirmed send {} has no local message", optimistic_id),
        }

        let deadline = Instant::now() + self.config.confirmation_grace();
        self.state
            .lock()
            .confirmations
            .push_back((deadline, optimistic_id.to_string()));

        info!("Message {} sent as {}", optimistic_id, message_id);
        self.emit_status(
            optimistic_id,
            &conversation_id,
            Some(message_id.clone()),
            DeliveryStatus::Sent,
            None,
        );
        SendOutcome {
            optimistic_id: optimistic_id.to_string(),
            conversation_id,
            state: SendState::Sent { message_id },
        }
    }

    fn on_failure(&self, mut entry: RetryEntry, err: InboxError) -> Result<SendOutcome, InboxError> {
        if let Some(message) = self.store.find_optimistic(&entry.optimistic_id) {
            entry.conversation_id = message.conversation_id;
        }

        if err.is_transient() && entry.attempt < self.config.max_retries {
            let delay = self.config.retry_delay(entry.attempt);
            entry.attempt += 1;
            entry.next_attempt_at = Instant::now() + delay;
            entry.last_error = Some(err.to_string());
            warn!(
                "Send {} failed ({}), retry {} in {:?}",
                entry.optimistic_id, err, entry.attempt, delay
            );

            let outcome = SendOutcome {
                optimistic_id: entry.optimistic_id.clone(),
                conversation_id: entry.conversation_id.clone(),
                state: SendState::Queued {
                    attempt: entry.attempt,
                    retry_in_ms: delay.as_millis() as u64,
                },
            };
            self.emit_status(
                &entry.optimistic_id,
                &entry.conversation_id,
                None,
                DeliveryStatus::Sending,
                Some(err.to_string()),
            );
            self.state
                .lock()
                .pending
                .insert(entry.optimistic_id.clone(), entry);
            return Ok(outcome);
        }

        if err.is_inbox_not_found() {
            warn!("Recipient has no inbox, send {} failed: {}", entry.optimistic_id, err);
        } else {
            error!(
                "Send {} failed after {} retries: {}",
                entry.optimistic_id, entry.attempt, err
            );
        }
        self.fail(&entry.optimistic_id, &entry.conversation_id, &err.to_string());
        Err(err)
    }

    fn fail(&self, optimistic_id: &str, conversation_id: &str, reason: &str) {
        if let Some(message) = self.store.mark_failed(optimistic_id) {
            self.events.emit(InboxEvent::MessageUpdated { message });
        }
        self.emit_status(
            optimistic_id,
            conversation_id,
            None,
            DeliveryStatus::Failed,
            Some(reason.to_string()),
        );
    }

    fn emit_status(
        &self,
        optimistic_id: &str,
        conversation_id: &str,
        message_id: Option<String>,
        status: DeliveryStatus,
        error: Option<String>,
    ) {
        self.events.emit(InboxEvent::SendStatusChanged {
            optimistic_id: optimistic_id.to_string(),
            conversation_id: conversation_id.to_string(),
            message_id,
            status,
            error,
        });
    }

    /// Take an entry out of the pending set and mark it in flight
    fn take_pending(&self, optimistic_id: &str) -> Option<RetryEntry> {
        let mut state = self.state.lock();
        let entry = state.pending.remove(optimistic_id)?;
        state.in_flight.insert(optimistic_id.to_string());
        Some(entry)
    }

    /// Run a claimed retry unless the stream already settled it
    async fn retry(&self, entry: RetryEntry) -> Option<Result<SendOutcome, InboxError>> {
        match self.store.find_optimistic(&entry.optimistic_id) {
            None => {
                debug!("Dropping retry for vanished message {}", entry.optimistic_id);
                self.release(&entry.optimistic_id);
                None
            }
            Some(message) if !message.is_unconfirmed() => {
                // The confirmed copy arrived on the stream; do not send twice
                let outcome =
                    self.on_success(&entry.optimistic_id, message.conversation_id, message.id);
                self.release(&entry.optimistic_id);
                Some(Ok(outcome))
            }
            Some(_) => {
                debug!("Retrying send {} (attempt {})", entry.optimistic_id, entry.attempt);
                Some(self.run_attempt(entry).await)
            }
        }
    }

    /// Claim every pending entry whose backoff has elapsed
    fn take_due(&self) -> Vec<RetryEntry> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let ids: Vec<String> = state
            .pending
            .values()
            .filter(|e| e.next_attempt_at <= now)
            .map(|e| e.optimistic_id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| {
                let entry = state.pending.remove(id)?;
                state.in_flight.insert(id.clone());
                Some(entry)
            })
            .collect()
    }

    /// Retry a claimed entry and log how it ended
    async fn retry_logged(&self, entry: RetryEntry) {
        let optimistic_id = entry.optimistic_id.clone();
        match self.retry(entry).await {
            Some(Ok(SendOutcome {
                state: SendState::Queued { attempt, .. },
                ..
            })) => debug!("Send {} still queued after attempt {}", optimistic_id, attempt),
            Some(Ok(_)) | None => {}
            Some(Err(e)) => warn!("Retry of send {} ended with error: {}", optimistic_id, e),
        }
    }

    /// Attempt every pending entry whose backoff has elapsed, one at a time
    pub async fn process_due(&self) -> usize {
        let due = self.take_due();
        let count = due.len();
        for entry in due {
            self.retry_logged(entry).await;
        }
        count
    }

    /// Attempt a queued send right away, ignoring its backoff
    pub async fn retry_now(&self, optimistic_id: &str) -> Result<SendOutcome, InboxError> {
        let entry = match self.take_pending(optimistic_id) {
            Some(entry) => entry,
            None if self.state.lock().in_flight.contains(optimistic_id) => {
                return Err(InboxError::AlreadyInFlight(optimistic_id.to_string()))
            }
            None => {
                return Err(InboxError::MessageNotFound(format!(
                    "no queued send {}",
                    optimistic_id
                )))
            }
        };
        self.retry(entry)
            .await
            .unwrap_or_else(|| Err(InboxError::MessageNotFound(optimistic_id.to_string())))
    }

    /// Drop a queued send and mark its message failed
    pub fn cancel_retry(&self, optimistic_id: &str) -> bool {
        let entry = self.state.lock().pending.remove(optimistic_id);
        match entry {
            Some(entry) => {
                info!("Cancelled queued send {}", optimistic_id);
                self.fail(optimistic_id, &entry.conversation_id, "cancelled");
                true
            }
            None => false,
        }
    }

    /// Queued sends, soonest first
    pub fn pending_retries(&self) -> Vec<RetryEntry> {
        let mut entries: Vec<RetryEntry> = self.state.lock().pending.values().cloned().collect();
        entries.sort_by_key(|e| e.next_attempt_at);
        entries
    }

    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Forget optimistic ids whose grace period ended
    pub fn purge_confirmations(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = {
            let mut state = self.state.lock();
            let mut expired = Vec::new();
            while state
                .confirmations
                .front()
                .map_or(false, |(deadline, _)| *deadline <= now)
            {
                if let Some((_, id)) = state.confirmations.pop_front() {
                    expired.push(id);
                }
            }
            expired
        };
        expired
            .iter()
            .filter(|id| self.store.clear_optimistic(id))
            .count()
    }

    /// Drive retries and grace-period cleanup until `shutdown` flips
    ///
    /// Due entries run concurrently, one task per optimistic id. Attempts
    /// still running at shutdown are aborted and their entries requeued.
    pub async fn run_ticker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut attempts = JoinSet::new();
        debug!("Send queue ticker started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let due = self.take_due();
                    let attempted = due.len();
                    for entry in due {
                        let queue = Arc::clone(&self);
                        attempts.spawn(async move { queue.retry_logged(entry).await });
                    }
                    let purged = self.purge_confirmations();
                    if attempted > 0 || purged > 0 {
                        debug!("Ticker started {} retries, purged {} confirmations", attempted, purged);
                    }
                }
                Some(joined) = attempts.join_next(), if !attempts.is_empty() => {
                    if let Err(e) = joined {
                        error!("Retry task failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if !attempts.is_empty() {
            info!("Aborting {} retries in flight", attempts.len());
        }
        attempts.shutdown().await;
        debug!("Send queue ticker stopped");
    }
}

/// Returns a claimed entry to the retry set if its attempt is dropped midway
struct AttemptGuard<'a> {
    queue: &'a SendQueue,
    entry: Option<RetryEntry>,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            debug!("Attempt for {} cancelled, requeueing", entry.optimistic_id);
            let mut state = self.queue.state.lock();
            state.in_flight.remove(&entry.optimistic_id);
            state.pending.insert(entry.optimistic_id.clone(), entry);
        }
    }
}
