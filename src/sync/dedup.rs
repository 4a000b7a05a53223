//! Bounded stream deduplication
//!
//! Remembers the most recent message identities and forgets the oldest once
//! the cap is reached. A re-delivery older than the window will be processed
//! again; the message store reconciles those by id.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

use crate::types::MessageIdentity;

struct Window {
    seen: HashSet<MessageIdentity>,
    order: VecDeque<MessageIdentity>,
}

/// Seen-set of message identities with FIFO eviction
pub struct Deduplicator {
    capacity: usize,
    window: Mutex<Window>,
}

impl Deduplicator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            window: Mutex::new(Window {
                seen: HashSet::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
            }),
        }
    }

    pub fn seen(&self, identity: &MessageIdentity) -> bool {
        self.window.lock().seen.contains(identity)
    }

    pub fn remember(&self, identity: MessageIdentity) {
        let mut window = self.window.lock();
        Self::insert(&mut window, identity, self.capacity);
    }

    /// Remember `identity` unless it was already seen
    ///
    /// Returns true when the identity is new. The check and the insert happen
    /// under one lock, so two concurrent arrivals of the same identity cannot
    /// both be admitted.
    pub fn check_and_remember(&self, identity: MessageIdentity) -> bool {
        let mut window = self.window.lock();
        Self::insert(&mut window, identity, self.capacity)
    }

    pub fn len(&self) -> usize {
        self.window.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut window = self.window.lock();
        window.seen.clear();
        window.order.clear();
    }

    fn insert(window: &mut Window, identity: MessageIdentity, capacity: usize) -> bool {
        if window.seen.contains(&identity) {
            return false;
        }
        window.seen.insert(identity.clone());
        window.order.push_back(identity);
        while window.order.len() > capacity {
            if let Some(oldest) = window.order.pop_front() {
                window.seen.remove(&oldest);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn id(s: &str) -> MessageIdentity {
        MessageIdentity::Id(s.to_string())
    }

    #[test]
    fn test_check_and_remember() {
        let dedup = Deduplicator::new(10);
        assert!(dedup.check_and_remember(id("a")));
        assert!(!dedup.check_and_remember(id("a")));
        assert!(dedup.seen(&id("a")));
        assert!(!dedup.seen(&id("b")));
    }

    #[test]
    fn test_timestamp_identity() {
        let dedup = Deduplicator::new(10);
        let ts = MessageIdentity::Timestamp {
            conversation_id: "c".to_string(),
            sent_at_ns: 7,
        };
        dedup.remember(ts.clone());
        assert!(dedup.seen(&ts));
        assert!(!dedup.seen(&MessageIdentity::Timestamp {
            conversation_id: "other".to_string(),
            sent_at_ns: 7,
        }));
    }

    #[test]
    fn test_evicts_oldest_beyond_capacity() {
        let dedup = Deduplicator::new(3);
        for key in ["a", "b", "c", "d"] {
            dedup.remember(id(key));
        }
        assert_eq!(dedup.len(), 3);
        assert!(!dedup.seen(&id("a")));
        assert!(dedup.seen(&id("d")));

        // Re-remembering a known identity does not refresh or duplicate it
        dedup.remember(id("b"));
        assert_eq!(dedup.len(), 3);
    }

    #[test]
    fn test_concurrent_arrivals_admit_once() {
        let dedup = Arc::new(Deduplicator::new(1_000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dedup = dedup.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .filter(|n| dedup.check_and_remember(id(&format!("m-{}", n))))
                        .count()
                })
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
    }
}
