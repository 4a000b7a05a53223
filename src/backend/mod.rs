//! Transport and file storage collaborators
//!
//! The inbox core treats the messaging transport and the upload service as
//! opaque capabilities. Everything network-bound goes through the two traits
//! in this module; [`memory::MemoryBackend`] is an in-process implementation
//! used by tests and the demo binary.

pub mod memory;

use async_trait::async_trait;
use flume::Receiver;
use std::sync::Arc;

use crate::types::{Conversation, InboxError, Message};

/// Item delivered by a transport subscription
///
/// `Err` items are either a single bad item (non-transient, skipped) or a
/// broken connection (transient, triggers a reconnect).
pub type StreamItem<T> = Result<T, InboxError>;

/// Closes a live transport subscription
pub trait StreamHandle: Send + Sync {
    fn close(&self);
}

/// A live subscription: an item channel plus the handle that tears it down
pub struct Subscription<T> {
    items: Receiver<StreamItem<T>>,
    handle: Option<Box<dyn StreamHandle>>,
}

impl<T> Subscription<T> {
    pub fn new(items: Receiver<StreamItem<T>>, handle: Box<dyn StreamHandle>) -> Self {
        Self {
            items,
            handle: Some(handle),
        }
    }

    /// Receive the next item; `None` once the transport closed the channel
    pub async fn next(&self) -> Option<StreamItem<T>> {
        self.items.recv_async().await.ok()
    }

    /// Close the underlying handle; later calls are no-ops
    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Messaging transport consumed by the inbox core
#[async_trait]
pub trait InboxBackend: Send + Sync {
    /// Identity of the local inbox (the "self" sender)
    fn identity(&self) -> &str;

    async fn list_conversations(&self) -> Result<Vec<Conversation>, InboxError>;

    async fn get_conversation(&self, conversation_id: &str)
        -> Result<Option<Conversation>, InboxError>;

    /// Open a direct conversation; fails with `InboxNotFound` when the peer
    /// has no reachable inbox
    async fn new_direct_message(&self, peer: &str) -> Result<Conversation, InboxError>;

    /// Send content and return the transport-assigned message id
    async fn send(
        &self,
        conversation_id: &str,
        content: &crate::types::MessageContent,
    ) -> Result<String, InboxError>;

    async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, InboxError>;

    async fn stream_all_messages(&self) -> Result<Subscription<Message>, InboxError>;

    async fn stream_conversations(&self) -> Result<Subscription<Conversation>, InboxError>;
}

/// File to hand to the upload service
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Location of an uploaded file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub url: String,
    pub thumbnail_url: Option<String>,
}

/// Upload progress callback: (bytes sent, total bytes)
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Upload service consumed by attachment sends
#[async_trait]
pub trait FileStorage: Send + Sync {
    async fn upload(
        &self,
        file: &FileUpload,
        progress: Option<ProgressCallback>,
    ) -> Result<UploadedFile, InboxError>;
}
