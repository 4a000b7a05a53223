//! Inbox coordinator
//!
//! Owns the message store, conversation cache, send queue and stream
//! ingestor for one identity. Ingested events are routed into the store and
//! cache by a single task so they are applied in arrival order; the public
//! methods are what presentation code calls.

use flume::Receiver;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{FileStorage, FileUpload, InboxBackend, ProgressCallback};
use crate::config::InboxConfig;
use crate::sync::conversation::{ConversationCache, Selection};
use crate::sync::dedup::Deduplicator;
use crate::sync::events::{EventBus, InboxEvent};
use crate::sync::search::{SearchFilters, SearchIndex, SearchPage};
use crate::sync::send_queue::{RetryEntry, SendOutcome, SendQueue, SendRequest};
use crate::sync::store::{MessageStore, UpsertOutcome};
use crate::sync::stream::{normalize, ConnectionState, IngestEvent, IngestStats, StreamIngestor};
use crate::types::{
    now_ns, Attachment, Conversation, InboxError, Message, MessageContent, MetadataPatch,
};

/// Applies ingested messages and conversations to the store and cache
struct Router {
    backend: Arc<dyn InboxBackend>,
    store: Arc<MessageStore>,
    cache: Arc<ConversationCache>,
    events: Arc<EventBus>,
    fetch_timeout: Duration,
}

impl Router {
    async fn run(self: Arc<Self>, rx: Receiver<IngestEvent>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                event = rx.recv_async() => match event {
                    Ok(event) => self.route(event).await,
                    Err(_) => {
                        debug!("Ingest channel closed");
                        break;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("Event router stopped");
    }

    async fn route(&self, event: IngestEvent) {
        match event {
            IngestEvent::Message(event) => {
                self.ensure_conversation(&event.message.conversation_id).await;
                self.apply_message(event.message, Some(event.latency_ms));
            }
            IngestEvent::Conversation(conversation) => self.merge_conversation(conversation),
        }
    }

    /// Fetch a conversation we have not seen before so its messages have a home
    async fn ensure_conversation(&self, conversation_id: &str) {
        if self.cache.contains(conversation_id) {
            return;
        }
        match tokio::time::timeout(self.fetch_timeout, self.backend.get_conversation(conversation_id)).await {
            Ok(Ok(Some(conversation))) => self.merge_conversation(conversation),
            Ok(Ok(None)) => warn!("Message for unknown conversation {}", conversation_id),
            Ok(Err(e)) => warn!("Failed to fetch conversation {}: {}", conversation_id, e),
            Err(_) => warn!("Timed out fetching conversation {}", conversation_id),
        }
    }

    fn merge_conversation(&self, conversation: Conversation) {
        let id = conversation.id.clone();
        let outcome = self.cache.merge_streamed(conversation);
        if outcome.inserted {
            // Messages that arrived first count toward the new entry
            self.cache.refresh_from_store(&id);
            if outcome.auto_selected {
                info!("Conversation {} auto-selected", id);
            }
            self.events.emit(InboxEvent::ConversationListChanged {
                conversation_ids: vec![id],
            });
        }
    }

    fn apply_message(&self, message: Message, latency_ms: Option<u64>) -> UpsertOutcome {
        let outcome = self.store.upsert_confirmed(message);
        match &outcome {
            UpsertOutcome::Inserted(message) => {
                self.cache.record_message(message);
                self.events.emit(InboxEvent::MessageReceived {
                    message: message.clone(),
                    latency_ms,
                });
            }
            UpsertOutcome::Reconciled {
                optimistic_id,
                message,
            } => {
                debug!("Stream confirmed optimistic message {}", optimistic_id);
                self.cache.record_message(message);
                self.events.emit(InboxEvent::MessageUpdated {
                    message: message.clone(),
                });
            }
            UpsertOutcome::Updated(message) => {
                self.events.emit(InboxEvent::MessageUpdated {
                    message: message.clone(),
                });
            }
            UpsertOutcome::Duplicate | UpsertOutcome::Tombstoned => {}
        }
        outcome
    }
}

/// Root of the inbox core for one identity
pub struct InboxCoordinator {
    backend: Arc<dyn InboxBackend>,
    storage: Option<Arc<dyn FileStorage>>,
    config: InboxConfig,
    store: Arc<MessageStore>,
    dedup: Arc<Deduplicator>,
    cache: Arc<ConversationCache>,
    events: Arc<EventBus>,
    router: Arc<Router>,
    ingestor: Arc<StreamIngestor>,
    ingest_rx: Mutex<Option<Receiver<IngestEvent>>>,
    send_queue: Arc<SendQueue>,
    search: SearchIndex,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl InboxCoordinator {
    pub fn new(backend: Arc<dyn InboxBackend>, config: InboxConfig) -> Result<Self, InboxError> {
        config.validate()?;

        let identity = backend.identity().to_string();
        let store = Arc::new(MessageStore::new(
            identity,
            config.store.max_messages_per_conversation,
        ));
        let dedup = Arc::new(Deduplicator::new(config.dedup.capacity));
        let events = Arc::new(EventBus::new());
        let cache = Arc::new(ConversationCache::new(
            backend.clone(),
            store.clone(),
            config.cache.clone(),
        ));
        let router = Arc::new(Router {
            backend: backend.clone(),
            store: store.clone(),
            cache: cache.clone(),
            events: events.clone(),
            fetch_timeout: config.cache.fetch_timeout(),
        });
        let (ingestor, ingest_rx) =
            StreamIngestor::new(backend.clone(), dedup.clone(), config.stream.clone());
        let send_queue = Arc::new(SendQueue::new(
            backend.clone(),
            store.clone(),
            cache.clone(),
            dedup.clone(),
            events.clone(),
            config.send.clone(),
        ));
        let search = SearchIndex::new(store.clone(), config.search.clone());
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            backend,
            storage: None,
            config,
            store,
            dedup,
            cache,
            events,
            router,
            ingestor: Arc::new(ingestor),
            ingest_rx: Mutex::new(Some(ingest_rx)),
            send_queue,
            search,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Attach the upload service used by [`Self::send_attachment`]
    pub fn with_storage(mut self, storage: Arc<dyn FileStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn identity(&self) -> &str {
        self.backend.identity()
    }

    pub fn config(&self) -> &InboxConfig {
        &self.config
    }

    pub fn subscribe(&self) -> Receiver<InboxEvent> {
        self.events.subscribe()
    }

    fn ensure_running(&self) -> Result<(), InboxError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(InboxError::Shutdown);
        }
        Ok(())
    }

    /// Spawn the stream, the event router and the retry ticker
    pub fn start(&self) -> Result<(), InboxError> {
        self.ensure_running()?;
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Inbox for {} already started", self.identity());
            return Ok(());
        }
        let ingest_rx = self
            .ingest_rx
            .lock()
            .take()
            .ok_or_else(|| InboxError::Other("ingest channel already taken".into()))?;

        info!("Starting inbox for {}", self.identity());
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(
            self.router.clone().run(ingest_rx, self.shutdown_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(
            self.send_queue.clone().run_ticker(self.shutdown_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(forward_connection_state(
            self.ingestor.watch_state(),
            self.events.clone(),
            self.shutdown_tx.subscribe(),
        )));
        drop(tasks);

        self.ingestor.start()
    }

    /// Restart the message stream, e.g. after reconnects were exhausted
    pub fn restart_stream(&self) -> Result<(), InboxError> {
        self.ensure_running()?;
        self.ingestor.restart()
    }

    /// Stop all background work; later calls are no-ops
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down inbox for {}", self.identity());
        self.shutdown_tx.send_replace(true);
        self.ingestor.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Inbox task ended abnormally: {}", e);
            }
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.ingestor.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.ingestor.watch_state()
    }

    pub fn stats(&self) -> IngestStats {
        self.ingestor.stats()
    }

    // Conversations

    pub async fn conversations(&self, force_refresh: bool) -> Result<Vec<Conversation>, InboxError> {
        self.cache.list(force_refresh).await
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.cache.get(conversation_id)
    }

    pub fn select_conversation(&self, conversation_id: &str) -> Result<Selection, InboxError> {
        self.cache.select(conversation_id)
    }

    pub fn selection(&self) -> Option<Selection> {
        self.cache.selection()
    }

    pub fn update_metadata(
        &self,
        conversation_id: &str,
        patch: &MetadataPatch,
    ) -> Result<Conversation, InboxError> {
        let conversation = self.cache.update_metadata(conversation_id, patch)?;
        self.events.emit(InboxEvent::ConversationListChanged {
            conversation_ids: vec![conversation.id.clone()],
        });
        Ok(conversation)
    }

    pub fn mark_read(&self, conversation_id: &str) -> Result<Conversation, InboxError> {
        let conversation = self.cache.mark_read(conversation_id)?;
        self.events.emit(InboxEvent::ConversationListChanged {
            conversation_ids: vec![conversation.id.clone()],
        });
        Ok(conversation)
    }

    /// Forget a conversation and its cached messages locally
    pub fn delete_conversation(&self, conversation_id: &str) -> Result<(), InboxError> {
        self.cache
            .remove(conversation_id)
            .ok_or_else(|| InboxError::ConversationNotFound(conversation_id.to_string()))?;
        let removed = self.store.delete_conversation(conversation_id);
        info!(
            "Deleted conversation {} ({} cached messages)",
            conversation_id, removed
        );
        self.events.emit(InboxEvent::ConversationListChanged {
            conversation_ids: vec![conversation_id.to_string()],
        });
        Ok(())
    }

    // Messages

    /// Pull a conversation's history and merge it like streamed messages
    pub async fn load_messages(&self, conversation_id: &str) -> Result<Vec<Message>, InboxError> {
        self.ensure_running()?;
        let history = tokio::time::timeout(
            self.config.cache.fetch_timeout(),
            self.backend.messages(conversation_id),
        )
        .await
        .map_err(|_| InboxError::Timeout(format!("loading messages of {}", conversation_id)))??;

        let mut merged = 0;
        for message in history.into_iter().filter_map(normalize) {
            // Keep a later stream delivery of the same message out
            self.dedup.remember(message.identity());
            if matches!(
                self.router.apply_message(message, None),
                UpsertOutcome::Inserted(_) | UpsertOutcome::Reconciled { .. }
            ) {
                merged += 1;
            }
        }
        debug!("Merged {} history messages into {}", merged, conversation_id);
        Ok(self.store.messages(conversation_id))
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.store.messages(conversation_id)
    }

    pub async fn send(&self, request: SendRequest) -> Result<SendOutcome, InboxError> {
        self.ensure_running()?;
        self.send_queue.send(request).await
    }

    pub async fn send_text(
        &self,
        conversation_id: &str,
        text: impl Into<String>,
    ) -> Result<SendOutcome, InboxError> {
        self.send(SendRequest::to_conversation(
            conversation_id,
            MessageContent::text(text),
        ))
        .await
    }

    /// Upload a file and send it as an attachment message
    pub async fn send_attachment(
        &self,
        conversation_id: &str,
        file: FileUpload,
        caption: Option<String>,
        progress: Option<ProgressCallback>,
    ) -> Result<SendOutcome, InboxError> {
        self.ensure_running()?;
        let storage = self
            .storage
            .as_ref()
            .ok_or_else(|| InboxError::Config("no file storage configured".into()))?;

        if file.bytes.is_empty() {
            return Err(InboxError::InvalidInput(format!("{} is empty", file.file_name)));
        }
        let limit = self.config.send.max_attachment_bytes;
        if file.bytes.len() > limit {
            return Err(InboxError::PayloadTooLarge {
                size: file.bytes.len(),
                limit,
            });
        }

        info!("Uploading {} ({} bytes)", file.file_name, file.bytes.len());
        let uploaded = tokio::time::timeout(
            self.config.send.upload_timeout(),
            storage.upload(&file, progress),
        )
        .await
        .map_err(|_| InboxError::Timeout(format!("uploading {}", file.file_name)))??;

        let content = MessageContent {
            text: caption.filter(|c| !c.trim().is_empty()),
            attachments: vec![Attachment {
                url: uploaded.url,
                thumbnail_url: uploaded.thumbnail_url,
                file_name: file.file_name,
                mime_type: file.mime_type,
                size: file.bytes.len(),
            }],
            ..Default::default()
        };
        self.send_queue
            .send(SendRequest::to_conversation(conversation_id, content))
            .await
    }

    pub async fn retry_now(&self, optimistic_id: &str) -> Result<SendOutcome, InboxError> {
        self.ensure_running()?;
        self.send_queue.retry_now(optimistic_id).await
    }

    pub fn cancel_retry(&self, optimistic_id: &str) -> bool {
        self.send_queue.cancel_retry(optimistic_id)
    }

    pub fn pending_retries(&self) -> Vec<RetryEntry> {
        self.send_queue.pending_retries()
    }

    /// Replace the text of one of our own messages
    pub fn edit_message(&self, message_id: &str, text: &str) -> Result<Message, InboxError> {
        let text = text.trim();
        let content = MessageContent::text(text);
        self.send_queue.validate(&content)?;

        let message = self.store.edit(message_id, text, now_ns())?;
        self.cache.refresh_from_store(&message.conversation_id);
        self.events.emit(InboxEvent::MessageUpdated {
            message: message.clone(),
        });
        Ok(message)
    }

    /// Add our reaction, or remove it if already present
    pub fn toggle_reaction(&self, message_id: &str, emoji: &str) -> Result<Message, InboxError> {
        let emoji = emoji.trim();
        if emoji.is_empty() {
            return Err(InboxError::InvalidInput("reaction is empty".into()));
        }
        let message = self
            .store
            .toggle_reaction(message_id, emoji, self.backend.identity())?;
        self.events.emit(InboxEvent::MessageUpdated {
            message: message.clone(),
        });
        Ok(message)
    }

    /// Remove a message locally; later deliveries of its id are ignored
    pub fn delete_message(&self, message_id: &str) -> Result<(), InboxError> {
        let conversation_id = self.store.delete(message_id)?;
        self.cache.refresh_from_store(&conversation_id);
        self.events.emit(InboxEvent::MessageDeleted {
            conversation_id,
            message_id: message_id.to_string(),
        });
        Ok(())
    }

    pub fn search(&self, filters: &SearchFilters) -> SearchPage {
        self.search.query(filters)
    }
}

/// Republish connection state changes as inbox events
async fn forward_connection_state(
    mut state_rx: watch::Receiver<ConnectionState>,
    events: Arc<EventBus>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = state_rx.borrow_and_update().clone();
                events.emit(InboxEvent::ConnectionChanged { state });
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::sync::send_queue::SendState;
    use crate::types::DeliveryStatus;

    fn coordinator() -> (Arc<MemoryBackend>, InboxCoordinator) {
        let backend = Arc::new(MemoryBackend::new("me"));
        backend.add_conversation(Conversation::direct("c1", "alice", 0));
        let inbox = InboxCoordinator::new(backend.clone(), InboxConfig::default())
            .unwrap()
            .with_storage(backend.clone());
        (backend, inbox)
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(30), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    async fn connected(inbox: &InboxCoordinator) {
        let mut rx = inbox.watch_connection();
        tokio::time::timeout(Duration::from_secs(30), rx.wait_for(|s| s.is_connected()))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_streamed_message_lands_in_store_and_cache() {
        let (backend, inbox) = coordinator();
        inbox.conversations(false).await.unwrap();
        inbox.start().unwrap();
        connected(&inbox).await;

        backend.push_message(Message::confirmed(
            "m1",
            "c1",
            "alice",
            MessageContent::text("hello"),
            now_ns(),
        ));
        wait_for(|| inbox.messages("c1").len() == 1).await;
        let conversation = inbox.conversation("c1").unwrap();
        assert_eq!(conversation.unread_count, 1);
        assert_eq!(conversation.last_message.unwrap().id, "m1");
        inbox.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_conversation_is_fetched() {
        let (backend, inbox) = coordinator();
        inbox.start().unwrap();
        connected(&inbox).await;

        backend.add_conversation(Conversation::direct("c2", "bob", 0));
        backend.push_message(Message::confirmed(
            "m1",
            "c2",
            "bob",
            MessageContent::text("new here"),
            now_ns(),
        ));
        wait_for(|| inbox.conversation("c2").is_some()).await;
        assert_eq!(inbox.conversation("c2").unwrap().unread_count, 1);
        // Nothing was selected, so the new conversation was auto-selected
        assert_eq!(inbox.selection().unwrap().conversation_id, "c2");
        inbox.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_then_stream_copy_is_deduplicated() {
        let (backend, inbox) = coordinator();
        inbox.conversations(false).await.unwrap();
        inbox.start().unwrap();
        connected(&inbox).await;

        let outcome = inbox.send_text("c1", "hi").await.unwrap();
        assert!(matches!(outcome.state, SendState::Sent { .. }));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let messages = inbox.messages("c1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, DeliveryStatus::Sent);
        assert_eq!(backend.sent_messages("c1").len(), 1);
        inbox.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_messages_merges_history_once() {
        let (backend, inbox) = coordinator();
        inbox.conversations(false).await.unwrap();
        backend.add_history(Message::confirmed("h1", "c1", "alice", MessageContent::text("old"), 1));
        backend.add_history(Message::confirmed("h2", "c1", "me", MessageContent::text("older reply"), 2));

        assert_eq!(inbox.load_messages("c1").await.unwrap().len(), 2);
        assert_eq!(inbox.load_messages("c1").await.unwrap().len(), 2);
        assert_eq!(inbox.conversation("c1").unwrap().unread_count, 1);
        assert_eq!(inbox.mark_read("c1").unwrap().unread_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_mutations() {
        let (backend, inbox) = coordinator();
        inbox.conversations(false).await.unwrap();
        backend.add_history(Message::confirmed("h1", "c1", "me", MessageContent::text("tpyo"), 1));
        inbox.load_messages("c1").await.unwrap();
        let events = inbox.subscribe();

        let edited = inbox.edit_message("h1", "typo").unwrap();
        assert_eq!(edited.content.text.as_deref(), Some("typo"));
        assert_eq!(edited.edits.len(), 1);

        let reacted = inbox.toggle_reaction("h1", "🎉").unwrap();
        assert!(reacted.reactions["🎉"].reacted_by_me);
        let cleared = inbox.toggle_reaction("h1", "🎉").unwrap();
        assert!(cleared.reactions.is_empty());

        inbox.delete_message("h1").unwrap();
        assert!(inbox.messages("c1").is_empty());
        assert!(matches!(
            inbox.delete_message("h1"),
            Err(InboxError::MessageNotFound(_))
        ));
        assert!(events
            .try_iter()
            .any(|e| matches!(e, InboxEvent::MessageDeleted { message_id, .. } if message_id == "h1")));

        // A re-delivery of a deleted message stays deleted
        inbox.load_messages("c1").await.unwrap();
        assert!(inbox.messages("c1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_attachment_uploads_first() {
        let (backend, inbox) = coordinator();
        inbox.conversations(false).await.unwrap();
        let file = FileUpload {
            file_name: "cat.png".to_string(),
            mime_type: "image/png".to_string(),
            bytes: vec![7u8; 1024],
        };
        inbox
            .send_attachment("c1", file, Some("look".into()), None)
            .await
            .unwrap();

        assert_eq!(backend.upload_calls(), 1);
        let sent = &inbox.messages("c1")[0];
        assert_eq!(sent.content.attachments.len(), 1);
        assert!(sent.content.attachments[0].thumbnail_url.is_some());

        backend.fail_next_uploads([InboxError::Upload("bucket full".into())]);
        let file = FileUpload {
            file_name: "dog.png".to_string(),
            mime_type: "image/png".to_string(),
            bytes: vec![1u8; 10],
        };
        assert!(matches!(
            inbox.send_attachment("c1", file, None, None).await,
            Err(InboxError::Upload(_))
        ));
        assert_eq!(inbox.messages("c1").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_events_and_idempotent_shutdown() {
        let (_backend, inbox) = coordinator();
        let events = inbox.subscribe();
        inbox.start().unwrap();
        connected(&inbox).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(events.try_iter().any(|e| matches!(
            e,
            InboxEvent::ConnectionChanged {
                state: ConnectionState::Connected
            }
        )));

        inbox.shutdown().await;
        inbox.shutdown().await;
        assert_eq!(inbox.connection_state(), ConnectionState::Shutdown);
        assert!(matches!(
            inbox.send_text("c1", "late").await,
            Err(InboxError::Shutdown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_conversation() {
        let (_backend, inbox) = coordinator();
        inbox.conversations(false).await.unwrap();
        inbox.send_text("c1", "bye").await.unwrap();
        inbox.delete_conversation("c1").unwrap();
        assert!(inbox.messages("c1").is_empty());
        assert!(inbox.conversation("c1").is_none());
        assert!(matches!(
            inbox.delete_conversation("c1"),
            Err(InboxError::ConversationNotFound(_))
        ));
    }
}
