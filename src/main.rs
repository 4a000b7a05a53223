//! Loopback demo of the inbox core
//!
//! Runs a scripted session against the in-memory backend: an incoming message,
//! a few sends (including a retried one and one to a peer without an inbox)
//! and a search. Events are logged as JSON.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use inbox_sync::backend::memory::MemoryBackend;
use inbox_sync::config::load_config;
use inbox_sync::sync::SortBy;
use inbox_sync::types::now_ns;
use inbox_sync::{
    Conversation, InboxConfig, InboxError, InboxManager, Message, MessageContent, SearchFilters,
    SendRequest,
};

#[tokio::main]
async fn main() -> Result<(), InboxError> {
    inbox_sync::init_tracing();

    let config = load_config().unwrap_or_else(|e| {
        warn!("Ignoring unusable config: {}", e);
        InboxConfig::default()
    });

    let backend = Arc::new(MemoryBackend::new("0xme"));
    backend.add_conversation(Conversation::direct("dm-alice", "0xalice", now_ns()));
    backend.mark_unreachable("0xghost");

    let manager = InboxManager::new(config);
    let inbox = manager
        .get_or_create(backend.clone(), Some(backend.clone()))
        .await?;

    let events = inbox.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            match serde_json::to_string(&event) {
                Ok(json) => info!("event: {}", json),
                Err(e) => warn!("Unprintable event: {}", e),
            }
        }
    });

    let mut connection = inbox.watch_connection();
    if tokio::time::timeout(Duration::from_secs(5), connection.wait_for(|s| s.is_connected()))
        .await
        .is_err()
    {
        warn!("Stream did not connect in time");
    }

    let conversations = inbox.conversations(false).await?;
    info!("{} conversation(s) cached", conversations.len());

    backend.push_message(Message::confirmed(
        "remote-1",
        "dm-alice",
        "0xalice",
        MessageContent::text("hello from alice"),
        now_ns(),
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let outcome = inbox.send_text("dm-alice", "hello alice").await?;
    info!("send outcome: {:?}", outcome.state);

    backend.fail_next_sends([InboxError::Network("relay hiccup".into())]);
    let queued = inbox.send_text("dm-alice", "this one retries").await?;
    info!("send outcome: {:?}", queued.state);
    tokio::time::sleep(Duration::from_secs(3)).await;

    match inbox
        .send(SendRequest::to_peer("0xghost", MessageContent::text("anyone there?")))
        .await
    {
        Err(e) if e.is_inbox_not_found() => info!("Recipient needs an invite: {}", e),
        other => warn!("Unexpected result for unreachable peer: {:?}", other),
    }

    let page = inbox.search(&SearchFilters {
        sort_by: SortBy::Date,
        ..SearchFilters::text("hello")
    });
    for result in &page.results {
        info!(
            "match score={} from={} text={:?}",
            result.score,
            result.message.sender,
            result.message.content.text
        );
    }

    inbox.mark_read("dm-alice")?;
    info!("stream stats: {:?}", inbox.stats());

    manager.shutdown_all().await;
    drop(inbox);
    if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
        warn!("Event printer did not stop");
    }
    Ok(())
}
