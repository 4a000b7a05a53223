//! inbox-sync - client-side synchronization core for a decentralized messaging inbox
//!
//! Keeps a local, eventually consistent view of conversations and messages in
//! sync with a remote message transport, with optimistic sends and an
//! in-memory search index.
//!
//! ## Module Organization
//!
//! - `backend/`: transport and file storage traits, in-memory loopback backend
//! - `sync/`: stream ingestion, caches, send queue, search and the coordinator
//! - `state/`: per-identity inbox registry
//! - `types/`: data structures and errors
//! - `config/`: configuration management

pub mod backend;
pub mod config;
pub mod state;
pub mod sync;
pub mod types;

pub use backend::{FileStorage, FileUpload, InboxBackend, UploadedFile};
pub use config::InboxConfig;
pub use state::InboxManager;
pub use sync::{InboxCoordinator, InboxEvent, SearchFilters, SendRequest};
pub use types::{Conversation, InboxError, Message, MessageContent, Result};

use tracing_subscriber::EnvFilter;

/// Initialize tracing for logging
///
/// Debug builds default to debug level for this crate; `RUST_LOG` overrides.
/// Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("inbox_sync=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
