use std::sync::Arc;
use std::time::Duration;

use inbox_sync::backend::memory::MemoryBackend;
use inbox_sync::sync::{ConnectionState, SendState};
use inbox_sync::types::{now_ns, DeliveryStatus, MetadataPatch};
use inbox_sync::{
    Conversation, InboxConfig, InboxCoordinator, InboxError, InboxEvent, Message, MessageContent,
    SearchFilters, SendRequest,
};

fn inbox_with(backend: &Arc<MemoryBackend>) -> InboxCoordinator {
    InboxCoordinator::new(backend.clone(), InboxConfig::default())
        .unwrap()
        .with_storage(backend.clone())
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(60), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

async fn wait_connected(inbox: &InboxCoordinator) {
    let mut rx = inbox.watch_connection();
    tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|s| s.is_connected()))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_optimistic_send_is_confirmed_and_stream_copy_dropped() {
    let backend = Arc::new(MemoryBackend::new("me"));
    backend.add_conversation(Conversation::direct("C", "alice", 0));
    let inbox = inbox_with(&backend);
    inbox.conversations(false).await.unwrap();
    let events = inbox.subscribe();
    inbox.start().unwrap();
    wait_connected(&inbox).await;

    // Slow relay so the optimistic state is observable
    backend.set_send_delay(Some(Duration::from_millis(500)));
    let sender = {
        let request = SendRequest::to_conversation("C", MessageContent::text("hi"))
            .with_optimistic_id("opt-hi");
        let inbox = &inbox;
        async move { inbox.send(request).await }
    };
    let (outcome, visible) = tokio::join!(sender, async {
        wait_until(|| !inbox.messages("C").is_empty()).await;
        inbox.messages("C")
    });

    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].status, DeliveryStatus::Sending);
    assert_eq!(visible[0].id, "opt-hi");

    let outcome = outcome.unwrap();
    let message_id = match outcome.state {
        SendState::Sent { message_id } => message_id,
        other => panic!("Expected Sent, got {:?}", other),
    };

    // Give the stream copy time to arrive and be dropped
    tokio::time::sleep(Duration::from_secs(1)).await;
    let messages = inbox.messages("C");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, message_id);
    assert_eq!(messages[0].status, DeliveryStatus::Sent);

    // A redelivery by (conversation, timestamp) identity is dropped as well
    let mut replay = messages[0].clone();
    replay.id = String::new();
    backend.push_message(replay);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(inbox.messages("C").len(), 1);

    let statuses: Vec<DeliveryStatus> = events
        .try_iter()
        .filter_map(|e| match e {
            InboxEvent::SendStatusChanged { status, .. } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![DeliveryStatus::Sending, DeliveryStatus::Sent]);
    inbox.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_deliveries_in_any_interleaving_appear_once() {
    let backend = Arc::new(MemoryBackend::new("me"));
    backend.add_conversation(Conversation::direct("C", "alice", 0));
    let inbox = inbox_with(&backend);
    inbox.conversations(false).await.unwrap();
    inbox.start().unwrap();
    wait_connected(&inbox).await;

    let base = now_ns();
    let logical: Vec<Message> = (0..5)
        .map(|n| {
            let id = if n % 2 == 0 { format!("m{}", n) } else { String::new() };
            Message::confirmed(id, "C", "alice", MessageContent::text(format!("#{}", n)), base + n)
        })
        .collect();

    // Each message three times, interleaved and reversed
    let mut deliveries = Vec::new();
    for round in 0..3 {
        let mut batch = logical.clone();
        if round % 2 == 1 {
            batch.reverse();
        }
        deliveries.extend(batch);
    }
    for message in deliveries {
        backend.push_message(message);
    }

    wait_until(|| inbox.stats().received + inbox.stats().duplicates == 15).await;
    let messages = inbox.messages("C");
    assert_eq!(messages.len(), 5);
    let texts: Vec<_> = messages
        .iter()
        .filter_map(|m| m.content.text.clone())
        .collect();
    assert_eq!(texts, vec!["#0", "#1", "#2", "#3", "#4"]);
    assert_eq!(inbox.conversation("C").unwrap().unread_count, 5);
    inbox.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_relay_outage_is_retried_then_fails() {
    let backend = Arc::new(MemoryBackend::new("me"));
    backend.add_conversation(Conversation::direct("C", "alice", 0));
    let inbox = inbox_with(&backend);
    inbox.conversations(false).await.unwrap();
    inbox.start().unwrap();
    wait_connected(&inbox).await;

    backend.fail_next_sends((0..4).map(|_| InboxError::ConnectionRefused("relay".into())));
    let outcome = inbox.send_text("C", "are you there").await.unwrap();
    assert!(matches!(outcome.state, SendState::Queued { attempt: 1, .. }));
    assert_eq!(inbox.pending_retries().len(), 1);

    // 1s + 2s + 4s of backoff plus ticker slack
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(inbox.pending_retries().is_empty());
    assert_eq!(backend.send_calls(), 4);
    assert_eq!(inbox.messages("C")[0].status, DeliveryStatus::Failed);
    inbox.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stream_exhaustion_needs_restart() {
    let backend = Arc::new(MemoryBackend::new("me"));
    let inbox = inbox_with(&backend);
    inbox.start().unwrap();
    wait_connected(&inbox).await;

    backend.set_connect_outage(Some(InboxError::Network("relay down".into())));
    backend.drop_streams();
    let mut state = inbox.watch_connection();
    tokio::time::timeout(
        Duration::from_secs(120),
        state.wait_for(|s| matches!(s, ConnectionState::Disconnected { .. })),
    )
    .await
    .unwrap()
    .unwrap();

    backend.set_connect_outage(None);
    inbox.restart_stream().unwrap();
    wait_connected(&inbox).await;

    backend.add_conversation(Conversation::direct("C", "alice", 0));
    backend.push_message(Message::confirmed("m1", "C", "alice", MessageContent::text("back"), now_ns()));
    wait_until(|| inbox.messages("C").len() == 1).await;
    inbox.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_pinned_conversations_and_search() {
    let backend = Arc::new(MemoryBackend::new("me"));
    backend.add_conversation(Conversation::direct("A", "alice", 0));
    backend.add_conversation(Conversation::direct("B", "bob", 0));
    let inbox = inbox_with(&backend);
    inbox.conversations(false).await.unwrap();

    backend.add_history(Message::confirmed("a1", "A", "alice", MessageContent::text("hello world"), 100));
    backend.add_history(Message::confirmed("b1", "B", "bob", MessageContent::text("hello bob"), 10));
    inbox.load_messages("A").await.unwrap();
    inbox.load_messages("B").await.unwrap();

    inbox.update_metadata("B", &MetadataPatch::pin(true)).unwrap();
    let order: Vec<String> = inbox
        .conversations(false)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(order, vec!["B", "A"]);

    let page = inbox.search(&SearchFilters::text("hello"));
    assert_eq!(page.total, 2);
    assert_eq!(page.results[0].message.id, "a1");

    let scoped = inbox.search(&SearchFilters {
        conversation_id: Some("B".into()),
        ..SearchFilters::text("hello")
    });
    assert_eq!(scoped.total, 1);
    assert_eq!(scoped.results[0].highlights, vec![0..5]);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_recipient_is_reported_distinctly() {
    let backend = Arc::new(MemoryBackend::new("me"));
    backend.mark_unreachable("0xnobody");
    let inbox = inbox_with(&backend);

    let err = inbox
        .send(SendRequest::to_peer("0xnobody", MessageContent::text("hi")))
        .await
        .unwrap_err();
    assert!(err.is_inbox_not_found());
    assert!(inbox.pending_retries().is_empty());
    assert_eq!(backend.send_calls(), 0);

    let ok = inbox
        .send(SendRequest::to_peer("0xfriend", MessageContent::text("hi")))
        .await
        .unwrap();
    assert!(inbox.conversation(&ok.conversation_id).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_with_slow_retry_in_flight_is_prompt() {
    let backend = Arc::new(MemoryBackend::new("me"));
    backend.add_conversation(Conversation::direct("C", "alice", 0));
    let inbox = inbox_with(&backend);
    inbox.conversations(false).await.unwrap();
    inbox.start().unwrap();
    wait_connected(&inbox).await;

    backend.fail_next_sends([InboxError::Network("relay".into())]);
    let outcome = inbox.send_text("C", "slow road").await.unwrap();
    assert!(matches!(outcome.state, SendState::Queued { .. }));
    backend.set_send_delay(Some(Duration::from_secs(14)));

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(backend.send_calls(), 2);

    let started = tokio::time::Instant::now();
    inbox.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(inbox.pending_retries().len(), 1);
    assert_eq!(inbox.messages("C")[0].status, DeliveryStatus::Sending);
}
