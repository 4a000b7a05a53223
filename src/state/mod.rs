//! Shared application state
//!
//! Thread-safe registries of long-lived inbox resources.

mod inbox_manager;

pub use inbox_manager::InboxManager;
