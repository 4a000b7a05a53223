//! In-process loopback transport
//!
//! Behaves like a single relay that every participant shares: sends are
//! stored, assigned an id and echoed to live message subscriptions. Failures,
//! latency and unreachable peers can be scripted, which makes it the backend
//! of choice for tests and the demo binary.

use async_trait::async_trait;
use flume::Sender;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{
    FileStorage, FileUpload, InboxBackend, ProgressCallback, StreamHandle, StreamItem,
    Subscription, UploadedFile,
};
use crate::types::{now_ns, Conversation, InboxError, Message, MessageContent};

struct Listener<T> {
    tx: Sender<StreamItem<T>>,
    closed: Arc<AtomicBool>,
}

impl<T: Clone> Listener<T> {
    fn deliver(&self, item: StreamItem<T>) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.tx.send(item).is_ok()
    }
}

struct MemoryStreamHandle {
    closed: Arc<AtomicBool>,
    close_count: Arc<AtomicUsize>,
}

impl StreamHandle for MemoryStreamHandle {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_count.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Default)]
struct State {
    conversations: Vec<Conversation>,
    messages: HashMap<String, Vec<Message>>,
    unreachable: HashSet<String>,
    send_failures: VecDeque<InboxError>,
    list_failures: VecDeque<InboxError>,
    connect_failures: VecDeque<InboxError>,
    upload_failures: VecDeque<InboxError>,
    fail_all_connects: Option<InboxError>,
    send_delay: Option<Duration>,
    list_delay: Option<Duration>,
    echo_sends: bool,
    message_listeners: Vec<Listener<Message>>,
    conversation_listeners: Vec<Listener<Conversation>>,
}

/// Loopback implementation of [`InboxBackend`] and [`FileStorage`]
pub struct MemoryBackend {
    identity: String,
    state: Mutex<State>,
    next_id: AtomicUsize,
    list_calls: AtomicUsize,
    send_calls: AtomicUsize,
    connect_calls: AtomicUsize,
    upload_calls: AtomicUsize,
    stream_closes: Arc<AtomicUsize>,
}

impl MemoryBackend {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            state: Mutex::new(State {
                echo_sends: true,
                ..Default::default()
            }),
            next_id: AtomicUsize::new(1),
            list_calls: AtomicUsize::new(0),
            send_calls: AtomicUsize::new(0),
            connect_calls: AtomicUsize::new(0),
            upload_calls: AtomicUsize::new(0),
            stream_closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn mint_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Seed a conversation without announcing it on the conversation stream
    pub fn add_conversation(&self, conversation: Conversation) {
        let mut state = self.state.lock();
        state.conversations.retain(|c| c.id != conversation.id);
        state.conversations.push(conversation);
    }

    /// Create a conversation and announce it to conversation subscribers
    pub fn announce_conversation(&self, conversation: Conversation) {
        let mut state = self.state.lock();
        state.conversations.retain(|c| c.id != conversation.id);
        state.conversations.push(conversation.clone());
        state
            .conversation_listeners
            .retain(|l| l.deliver(Ok(conversation.clone())));
    }

    /// Store a message in history without streaming it
    pub fn add_history(&self, message: Message) {
        let mut state = self.state.lock();
        state
            .messages
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message);
    }

    /// Push a message to every live message subscription
    pub fn push_message(&self, message: Message) {
        let mut state = self.state.lock();
        state
            .message_listeners
            .retain(|l| l.deliver(Ok(message.clone())));
    }

    /// Push an error item to every live message subscription
    pub fn push_stream_error(&self, error: InboxError) {
        let mut state = self.state.lock();
        state
            .message_listeners
            .retain(|l| l.deliver(Err(error.clone())));
    }

    /// Drop every live subscription, as a relay disconnect would
    pub fn drop_streams(&self) {
        let mut state = self.state.lock();
        state.message_listeners.clear();
        state.conversation_listeners.clear();
    }

    pub fn mark_unreachable(&self, peer: impl Into<String>) {
        self.state.lock().unreachable.insert(peer.into().to_lowercase());
    }

    pub fn fail_next_sends(&self, errors: impl IntoIterator<Item = InboxError>) {
        self.state.lock().send_failures.extend(errors);
    }

    pub fn fail_next_lists(&self, errors: impl IntoIterator<Item = InboxError>) {
        self.state.lock().list_failures.extend(errors);
    }

    pub fn fail_next_connects(&self, errors: impl IntoIterator<Item = InboxError>) {
        self.state.lock().connect_failures.extend(errors);
    }

    pub fn fail_next_uploads(&self, errors: impl IntoIterator<Item = InboxError>) {
        self.state.lock().upload_failures.extend(errors);
    }

    /// Make every subscribe call fail until cleared with `None`
    pub fn set_connect_outage(&self, error: Option<InboxError>) {
        self.state.lock().fail_all_connects = error;
    }

    pub fn set_send_delay(&self, delay: Option<Duration>) {
        self.state.lock().send_delay = delay;
    }

    /// Make conversation listings take `delay` before answering
    pub fn set_list_delay(&self, delay: Option<Duration>) {
        self.state.lock().list_delay = delay;
    }

    /// Whether successful sends are echoed back on the message stream
    pub fn set_echo_sends(&self, echo: bool) {
        self.state.lock().echo_sends = echo;
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    pub fn stream_closes(&self) -> usize {
        self.stream_closes.load(Ordering::SeqCst)
    }

    pub fn live_message_streams(&self) -> usize {
        let state = self.state.lock();
        state
            .message_listeners
            .iter()
            .filter(|l| !l.closed.load(Ordering::SeqCst))
            .count()
    }

    /// Messages the relay accepted for a conversation
    pub fn sent_messages(&self, conversation_id: &str) -> Vec<Message> {
        self.state
            .lock()
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    fn handle(&self) -> (Arc<AtomicBool>, Box<dyn StreamHandle>) {
        let closed = Arc::new(AtomicBool::new(false));
        let handle = MemoryStreamHandle {
            closed: closed.clone(),
            close_count: self.stream_closes.clone(),
        };
        (closed, Box::new(handle))
    }

    fn check_connect(&self) -> Result<(), InboxError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if let Some(err) = state.connect_failures.pop_front() {
            return Err(err);
        }
        if let Some(err) = &state.fail_all_connects {
            return Err(err.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl InboxBackend for MemoryBackend {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, InboxError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.lock().list_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if let Some(err) = state.list_failures.pop_front() {
            return Err(err);
        }
        Ok(state.conversations.clone())
    }

    async fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, InboxError> {
        let state = self.state.lock();
        Ok(state
            .conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .cloned())
    }

    async fn new_direct_message(&self, peer: &str) -> Result<Conversation, InboxError> {
        let mut state = self.state.lock();
        if state.unreachable.contains(&peer.to_lowercase()) {
            return Err(InboxError::InboxNotFound(peer.to_string()));
        }
        if let Some(existing) = state
            .conversations
            .iter()
            .find(|c| c.peer.is_direct_with(peer))
        {
            return Ok(existing.clone());
        }
        let conversation = Conversation::direct(self.mint_id("dm"), peer, now_ns());
        state.conversations.push(conversation.clone());
        state
            .conversation_listeners
            .retain(|l| l.deliver(Ok(conversation.clone())));
        debug!("Created direct conversation {} with {}", conversation.id, peer);
        Ok(conversation)
    }

    async fn send(
        &self,
        conversation_id: &str,
        content: &MessageContent,
    ) -> Result<String, InboxError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.lock().send_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if let Some(err) = state.send_failures.pop_front() {
            return Err(err);
        }
        if !state.conversations.iter().any(|c| c.id == conversation_id) {
            return Err(InboxError::ConversationNotFound(conversation_id.to_string()));
        }

        let message = Message::confirmed(
            self.mint_id("msg"),
            conversation_id,
            self.identity.clone(),
            content.clone(),
            now_ns(),
        );
        let id = message.id.clone();
        state
            .messages
            .entry(conversation_id.to_string())
            .or_default()
            .push(message.clone());
        if state.echo_sends {
            state
                .message_listeners
                .retain(|l| l.deliver(Ok(message.clone())));
        }
        Ok(id)
    }

    async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, InboxError> {
        Ok(self.sent_messages(conversation_id))
    }

    async fn stream_all_messages(&self) -> Result<Subscription<Message>, InboxError> {
        self.check_connect()?;
        let (tx, rx) = flume::unbounded();
        let (closed, handle) = self.handle();
        self.state
            .lock()
            .message_listeners
            .push(Listener { tx, closed });
        Ok(Subscription::new(rx, handle))
    }

    async fn stream_conversations(&self) -> Result<Subscription<Conversation>, InboxError> {
        let (tx, rx) = flume::unbounded();
        let (closed, handle) = self.handle();
        self.state
            .lock()
            .conversation_listeners
            .push(Listener { tx, closed });
        Ok(Subscription::new(rx, handle))
    }
}

#[async_trait]
impl FileStorage for MemoryBackend {
    async fn upload(
        &self,
        file: &FileUpload,
        progress: Option<ProgressCallback>,
    ) -> Result<UploadedFile, InboxError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.state.lock().upload_failures.pop_front() {
            return Err(err);
        }

        let total = file.bytes.len() as u64;
        if let Some(progress) = &progress {
            let chunk = 64 * 1024;
            let mut sent = 0u64;
            while sent < total {
                sent = (sent + chunk).min(total);
                progress(sent, total);
            }
            if total == 0 {
                progress(0, 0);
            }
        }

        let id = self.mint_id("file");
        let url = format!("memory://files/{}/{}", id, file.file_name);
        let thumbnail_url = file
            .mime_type
            .starts_with("image/")
            .then(|| format!("{}?thumbnail", url));
        Ok(UploadedFile { url, thumbnail_url })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_echoes_to_stream() {
        let backend = MemoryBackend::new("me");
        backend.add_conversation(Conversation::direct("c1", "alice", 0));
        let sub = backend.stream_all_messages().await.unwrap();

        let id = backend
            .send("c1", &MessageContent::text("hello"))
            .await
            .unwrap();
        let echoed = sub.next().await.unwrap().unwrap();
        assert_eq!(echoed.id, id);
        assert_eq!(echoed.sender, "me");
    }

    #[tokio::test]
    async fn test_close_is_counted_once() {
        let backend = MemoryBackend::new("me");
        let mut sub = backend.stream_all_messages().await.unwrap();
        sub.close();
        sub.close();
        drop(sub);
        assert_eq!(backend.stream_closes(), 1);
        assert_eq!(backend.live_message_streams(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let backend = MemoryBackend::new("me");
        backend.mark_unreachable("0xDEAD");
        let err = backend.new_direct_message("0xdead").await.unwrap_err();
        assert!(err.is_inbox_not_found());

        let conv = backend.new_direct_message("bob").await.unwrap();
        let again = backend.new_direct_message("bob").await.unwrap();
        assert_eq!(conv.id, again.id);
    }

    #[tokio::test]
    async fn test_upload_reports_progress() {
        let backend = MemoryBackend::new("me");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let file = FileUpload {
            file_name: "cat.png".to_string(),
            mime_type: "image/png".to_string(),
            bytes: vec![0u8; 100 * 1024],
        };
        let uploaded = backend
            .upload(&file, Some(Arc::new(move |sent, total| sink.lock().push((sent, total)))))
            .await
            .unwrap();
        assert!(uploaded.thumbnail_url.is_some());
        let seen = seen.lock();
        assert_eq!(seen.last(), Some(&(102_400, 102_400)));
        assert_eq!(seen.len(), 2);
    }
}
