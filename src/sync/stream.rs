//! Message stream ingestion
//!
//! Maintains the long-lived message and conversation subscriptions, drops
//! duplicate deliveries and reconnects with exponential backoff when the
//! transport goes away. The ingestor never touches shared caches; it emits
//! [`IngestEvent`]s that the coordinator routes into the store.

use flume::{Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{InboxBackend, Subscription};
use crate::config::StreamConfig;
use crate::sync::dedup::Deduplicator;
use crate::types::{now_ns, ns_to_ms_clamped, Conversation, DeliveryStatus, InboxError, Message};

/// Connection state of the stream subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    /// Never started
    Idle,
    Connecting { attempt: u32 },
    Connected,
    /// Waiting out the backoff before the next attempt
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// Reconnects exhausted; a caller-initiated restart is required
    Disconnected { reason: String },
    Shutdown,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Degraded state that needs a restart to recover
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected { .. } | Self::Shutdown)
    }
}

/// A deduplicated message with arrival metadata
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub message: Message,
    pub received_at_ns: i64,
    pub latency_ms: u64,
}

/// Output of the ingestor
#[derive(Debug, Clone)]
pub enum IngestEvent {
    Message(StreamEvent),
    Conversation(Conversation),
}

/// Counters describing stream health
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub received: u64,
    pub duplicates: u64,
    pub skipped: u64,
    pub connections: u64,
    /// Connections made after the first one
    pub reconnects: u64,
    pub avg_latency_ms: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    duplicates: AtomicU64,
    skipped: AtomicU64,
    connections: AtomicU64,
    latency_total_ms: AtomicU64,
}

enum PumpExit {
    Lost(InboxError),
    /// Nobody consumes events anymore
    Orphaned,
}

/// Owner of the transport subscriptions
pub struct StreamIngestor {
    backend: Arc<dyn InboxBackend>,
    dedup: Arc<Deduplicator>,
    config: StreamConfig,
    events_tx: Sender<IngestEvent>,
    state_tx: watch::Sender<ConnectionState>,
    task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    counters: Counters,
}

impl StreamIngestor {
    /// Create a new ingestor and the receiver for its events
    pub fn new(
        backend: Arc<dyn InboxBackend>,
        dedup: Arc<Deduplicator>,
        config: StreamConfig,
    ) -> (Self, Receiver<IngestEvent>) {
        let (events_tx, events_rx) = flume::unbounded();
        let (state_tx, _) = watch::channel(ConnectionState::Idle);

        let ingestor = Self {
            backend,
            dedup,
            config,
            events_tx,
            state_tx,
            task: Mutex::new(None),
            stopped: AtomicBool::new(false),
            counters: Counters::default(),
        };

        (ingestor, events_rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Watch connection state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self) -> IngestStats {
        let received = self.counters.received.load(Ordering::Relaxed);
        let total_latency = self.counters.latency_total_ms.load(Ordering::Relaxed);
        let connections = self.counters.connections.load(Ordering::Relaxed);
        IngestStats {
            received,
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            connections,
            reconnects: connections.saturating_sub(1),
            avg_latency_ms: if received == 0 { 0 } else { total_latency / received },
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Start the subscription loop if it is not already running
    pub fn start(self: &Arc<Self>) -> Result<(), InboxError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(InboxError::Shutdown);
        }
        let mut task = self.task.lock();
        if task.as_ref().map_or(false, |h| !h.is_finished()) {
            warn!("Stream ingestor already running for {}", self.backend.identity());
            return Ok(());
        }
        *task = Some(self.spawn_loop());
        Ok(())
    }

    /// Cancel any running loop (and its pending backoff timer) and start over
    pub fn restart(self: &Arc<Self>) -> Result<(), InboxError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(InboxError::Shutdown);
        }
        let mut task = self.task.lock();
        if let Some(previous) = task.take() {
            previous.abort();
        }
        info!("Restarting stream ingestor for {}", self.backend.identity());
        *task = Some(self.spawn_loop());
        Ok(())
    }

    /// Stop the loop and close the subscriptions; later calls are no-ops
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down stream ingestor for {}", self.backend.identity());
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            // Subscriptions are closed when the aborted future is dropped
            let _ = handle.await;
        }
        self.set_state(ConnectionState::Shutdown);
    }

    fn spawn_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let ingestor = Arc::clone(self);
        tokio::spawn(async move { ingestor.run().await })
    }

    fn set_state(&self, state: ConnectionState) {
        debug!("Stream state -> {:?}", state);
        self.state_tx.send_replace(state);
    }

    async fn run(self: Arc<Self>) {
        // Consecutive failed connection attempts
        let mut failures: u32 = 0;
        // Backoff waits since the last successful connect
        let mut waits: u32 = 0;

        loop {
            self.set_state(ConnectionState::Connecting {
                attempt: failures + 1,
            });

            match self.connect().await {
                Ok((mut messages, mut conversations)) => {
                    failures = 0;
                    waits = 0;
                    self.counters.connections.fetch_add(1, Ordering::Relaxed);
                    self.set_state(ConnectionState::Connected);
                    info!("Message stream connected for {}", self.backend.identity());

                    let exit = self.pump(&messages, &conversations).await;
                    messages.close();
                    conversations.close();

                    match exit {
                        PumpExit::Lost(e) => {
                            warn!("Message stream lost for {}: {}", self.backend.identity(), e);
                        }
                        PumpExit::Orphaned => {
                            info!("No event consumers left, stopping stream");
                            self.set_state(ConnectionState::Shutdown);
                            return;
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        "Stream connect attempt {} failed for {}: {}",
                        failures,
                        self.backend.identity(),
                        e
                    );
                    if failures >= self.config.max_reconnect_attempts {
                        error!(
                            "Giving up on message stream after {} attempts",
                            failures
                        );
                        self.set_state(ConnectionState::Disconnected {
                            reason: InboxError::StreamExhausted { attempts: failures }.to_string(),
                        });
                        return;
                    }
                }
            }

            waits += 1;
            let delay = self.config.reconnect_delay(waits);
            self.set_state(ConnectionState::Reconnecting {
                attempt: waits,
                delay_ms: delay.as_millis() as u64,
            });
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect(
        &self,
    ) -> Result<(Subscription<Message>, Subscription<Conversation>), InboxError> {
        let backend = &self.backend;
        let subscribe = async {
            let messages = backend.stream_all_messages().await?;
            let conversations = backend.stream_conversations().await?;
            Ok::<_, InboxError>((messages, conversations))
        };
        tokio::time::timeout(self.config.connect_timeout(), subscribe)
            .await
            .map_err(|_| {
                InboxError::Timeout(format!(
                    "stream subscribe exceeded {}s",
                    self.config.connect_timeout_seconds
                ))
            })?
    }

    async fn pump(
        &self,
        messages: &Subscription<Message>,
        conversations: &Subscription<Conversation>,
    ) -> PumpExit {
        loop {
            tokio::select! {
                item = messages.next() => match item {
                    None => return PumpExit::Lost(InboxError::Network("message stream closed".into())),
                    Some(Ok(message)) => {
                        if !self.ingest(message) {
                            return PumpExit::Orphaned;
                        }
                    }
                    Some(Err(e)) if e.is_transient() => return PumpExit::Lost(e),
                    Some(Err(e)) => {
                        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                        warn!("Skipping bad stream item: {}", e);
                    }
                },
                item = conversations.next() => match item {
                    None => return PumpExit::Lost(InboxError::Network("conversation stream closed".into())),
                    Some(Ok(conversation)) => {
                        debug!("Conversation announced on stream: {}", conversation.id);
                        if self.events_tx.send(IngestEvent::Conversation(conversation)).is_err() {
                            return PumpExit::Orphaned;
                        }
                    }
                    Some(Err(e)) if e.is_transient() => return PumpExit::Lost(e),
                    Some(Err(e)) => {
                        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                        warn!("Skipping bad conversation item: {}", e);
                    }
                },
            }
        }
    }

    /// Deduplicate and emit one message; false when the consumer is gone
    fn ingest(&self, message: Message) -> bool {
        let received_at_ns = now_ns();
        let Some(message) = normalize(message) else {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            warn!("Skipping stream message without conversation id");
            return true;
        };

        if !self.dedup.check_and_remember(message.identity()) {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!("Duplicate stream message dropped: {:?}", message.identity());
            return true;
        }

        let latency_ms = ns_to_ms_clamped(received_at_ns.saturating_sub(message.sent_at_ns));
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        self.counters
            .latency_total_ms
            .fetch_add(latency_ms, Ordering::Relaxed);

        self.events_tx
            .send(IngestEvent::Message(StreamEvent {
                message,
                received_at_ns,
                latency_ms,
            }))
            .is_ok()
    }
}

/// Normalize a raw transport message into a confirmed one
pub(crate) fn normalize(mut message: Message) -> Option<Message> {
    message.conversation_id = message.conversation_id.trim().to_string();
    if message.conversation_id.is_empty() {
        return None;
    }
    message.id = message.id.trim().to_string();
    message.optimistic_id = None;
    if matches!(
        message.status,
        DeliveryStatus::Sending | DeliveryStatus::Failed
    ) {
        message.status = DeliveryStatus::Sent;
    }
    Some(message)
}
