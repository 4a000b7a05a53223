//! Inbox synchronization core
//!
//! - `dedup`: bounded seen-set for stream deliveries
//! - `store`: per-conversation message timelines and optimistic reconciliation
//! - `stream`: reconnecting subscription to the transport
//! - `conversation`: TTL cache of the conversation list
//! - `send_queue`: optimistic sends and the retry queue
//! - `search`: scoring and filtering over cached messages
//! - `events`: outward event fan-out
//! - `engine`: the coordinator wiring everything together

pub mod conversation;
pub mod dedup;
pub mod engine;
pub mod events;
pub mod search;
pub mod send_queue;
pub mod store;
pub mod stream;

pub use conversation::{ConversationCache, MergeOutcome, Selection};
pub use dedup::Deduplicator;
pub use engine::InboxCoordinator;
pub use events::{EventBus, InboxEvent};
pub use search::{search, DateRange, SearchFilters, SearchIndex, SearchPage, SearchResult, SortBy, SortOrder};
pub use send_queue::{RetryEntry, SendOutcome, SendQueue, SendRequest, SendState};
pub use store::{MessageStore, UpsertOutcome};
pub use stream::{ConnectionState, IngestEvent, IngestStats, StreamEvent, StreamIngestor};
