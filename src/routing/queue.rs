//! In-memory priority queue with expiration awareness.
//!
//! Four FIFO buckets, one per priority. Dispatch scans buckets in priority
//! order and skips (without removing) entries that have expired.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::protocol::{Envelope, Priority};

/// An envelope waiting in a bucket.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub envelope: Envelope,
    pub enqueued_at: DateTime<Utc>,
}

/// Queue statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub by_priority: BTreeMap<String, usize>,
    pub oldest_enqueued: Option<DateTime<Utc>>,
    pub newest_enqueued: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct MessageQueue {
    buckets: [VecDeque<QueueEntry>; 4],
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the bucket matching the envelope's priority.
    pub fn enqueue(&mut self, envelope: Envelope) {
        self.enqueue_at(envelope, Utc::now());
    }

    pub fn enqueue_at(&mut self, envelope: Envelope, enqueued_at: DateTime<Utc>) {
        self.buckets[envelope.priority.index()].push_back(QueueEntry {
            envelope,
            enqueued_at,
        });
    }

    /// Remove and return the next deliverable envelope.
    pub fn dequeue(&mut self) -> Option<Envelope> {
        self.dequeue_at(Utc::now())
    }

    /// Earliest unexpired entry of the highest non-exhausted bucket.
    /// Expired entries are left in place for [`MessageQueue::purge_expired`].
    pub fn dequeue_at(&mut self, now: DateTime<Utc>) -> Option<Envelope> {
        for bucket in self.buckets.iter_mut() {
            if let Some(index) = bucket.iter().position(|e| !e.envelope.is_expired_at(now)) {
                return bucket.remove(index).map(|e| e.envelope);
            }
        }
        None
    }

    pub fn peek(&self) -> Option<&Envelope> {
        self.peek_at(Utc::now())
    }

    pub fn peek_at(&self, now: DateTime<Utc>) -> Option<&Envelope> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.iter())
            .find(|e| !e.envelope.is_expired_at(now))
            .map(|e| &e.envelope)
    }

    /// Drop expired entries; returns how many were removed.
    pub fn purge_expired(&mut self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    pub fn purge_expired_at(&mut self, now: DateTime<Utc>) -> usize {
        self.drain_expired_at(now).len()
    }

    /// Remove and return expired envelopes, in bucket order.
    pub fn drain_expired_at(&mut self, now: DateTime<Utc>) -> Vec<Envelope> {
        let mut expired = Vec::new();
        for bucket in self.buckets.iter_mut() {
            let mut kept = VecDeque::with_capacity(bucket.len());
            for entry in bucket.drain(..) {
                if entry.envelope.is_expired_at(now) {
                    expired.push(entry.envelope);
                } else {
                    kept.push_back(entry);
                }
            }
            *bucket = kept;
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    pub fn len_by_priority(&self, priority: Priority) -> usize {
        self.buckets[priority.index()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(VecDeque::is_empty)
    }

    pub fn clear(&mut self) {
        for bucket in self.buckets.iter_mut() {
            bucket.clear();
        }
    }

    /// Envelopes of one bucket, in FIFO order, expired ones included.
    pub fn messages_by_priority(&self, priority: Priority) -> Vec<&Envelope> {
        self.buckets[priority.index()]
            .iter()
            .map(|e| &e.envelope)
            .collect()
    }

    pub fn find_by_id(&self, message_id: &str) -> Option<&Envelope> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.iter())
            .find(|e| e.envelope.message_id == message_id)
            .map(|e| &e.envelope)
    }

    /// Remove the first entry with this id.
    pub fn remove_by_id(&mut self, message_id: &str) -> Option<Envelope> {
        for bucket in self.buckets.iter_mut() {
            if let Some(index) = bucket
                .iter()
                .position(|e| e.envelope.message_id == message_id)
            {
                return bucket.remove(index).map(|e| e.envelope);
            }
        }
        None
    }

    pub fn stats(&self) -> QueueStats {
        let by_priority = Priority::ALL
            .iter()
            .map(|p| (p.to_string(), self.len_by_priority(*p)))
            .collect();
        let entries = || self.buckets.iter().flat_map(|bucket| bucket.iter());

        QueueStats {
            total: self.len(),
            by_priority,
            oldest_enqueued: entries().map(|e| e.enqueued_at).min(),
            newest_enqueued: entries().map(|e| e.enqueued_at).max(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AgentRef, AgentRole, EnvelopeBuilder, MessageBody, QueryKind, Tier};
    use chrono::Duration;
    use proptest::prelude::*;

    fn base() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-11-06T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn envelope(id: &str, priority: Priority, ttl_minutes: i64) -> Envelope {
        EnvelopeBuilder::from(AgentRef::new("a-specialist", AgentRole::Specialist, Tier::Sonnet))
            .to(AgentRef::new("a-coordinator", AgentRole::Coordinator, Tier::Opus))
            .message_id(id)
            .priority(priority)
            .timestamp(base())
            .ttl(Duration::minutes(ttl_minutes))
            .body(MessageBody::query(QueryKind::GetStatus, "status", priority))
            .build()
            .unwrap()
    }

    #[test]
    fn test_priority_then_fifo() {
        let mut queue = MessageQueue::new();
        queue.enqueue(envelope("low-1", Priority::Low, 60));
        queue.enqueue(envelope("normal-1", Priority::Normal, 60));
        queue.enqueue(envelope("high-1", Priority::High, 60));
        queue.enqueue(envelope("normal-2", Priority::Normal, 60));
        queue.enqueue(envelope("critical-1", Priority::Critical, 60));

        let now = base();
        assert_eq!(queue.peek_at(now).unwrap().message_id, "critical-1");
        let order: Vec<String> = std::iter::from_fn(|| queue.dequeue_at(now))
            .map(|e| e.message_id)
            .collect();
        assert_eq!(order, vec!["critical-1", "high-1", "normal-1", "normal-2", "low-1"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_expired_entries_are_skipped_not_returned() {
        let mut queue = MessageQueue::new();
        queue.enqueue(envelope("stale", Priority::Critical, 5));
        queue.enqueue(envelope("fresh", Priority::Low, 60));

        let now = base() + Duration::minutes(10);
        assert_eq!(queue.dequeue_at(now).unwrap().message_id, "fresh");
        assert_eq!(queue.dequeue_at(now), None);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.purge_expired_at(now), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_expiration_boundary_counts_as_expired() {
        let mut queue = MessageQueue::new();
        queue.enqueue(envelope("edge", Priority::Normal, 5));
        let at_expiry = base() + Duration::minutes(5);
        assert!(queue.peek_at(at_expiry).is_none());
        assert!(queue.peek_at(at_expiry - Duration::milliseconds(1)).is_some());
    }

    #[test]
    fn test_lookup_and_removal() {
        let mut queue = MessageQueue::new();
        queue.enqueue(envelope("a", Priority::High, 60));
        queue.enqueue(envelope("b", Priority::High, 60));
        assert!(queue.find_by_id("b").is_some());
        assert_eq!(queue.remove_by_id("b").unwrap().message_id, "b");
        assert!(queue.remove_by_id("b").is_none());
        assert_eq!(queue.messages_by_priority(Priority::High).len(), 1);
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_stats() {
        let mut queue = MessageQueue::new();
        assert_eq!(queue.stats().oldest_enqueued, None);

        queue.enqueue_at(envelope("a", Priority::High, 60), base());
        queue.enqueue_at(envelope("b", Priority::Low, 60), base() + Duration::seconds(30));
        let stats = queue.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_priority["high"], 1);
        assert_eq!(stats.by_priority["critical"], 0);
        assert_eq!(stats.oldest_enqueued, Some(base()));
        assert_eq!(stats.newest_enqueued, Some(base() + Duration::seconds(30)));
    }

    fn arb_priority() -> impl Strategy<Value = Priority> {
        prop_oneof![
            Just(Priority::Critical),
            Just(Priority::High),
            Just(Priority::Normal),
            Just(Priority::Low),
        ]
    }

    proptest! {
        #[test]
        fn prop_dequeue_order(items in prop::collection::vec((arb_priority(), 1i64..120), 0..40), probe in 0i64..150) {
            let mut queue = MessageQueue::new();
            let mut expected: Vec<(usize, usize, String)> = Vec::new();
            let now = base() + Duration::minutes(probe);

            for (seq, (priority, ttl)) in items.iter().enumerate() {
                let id = format!("m-{}", seq);
                if *ttl > probe {
                    expected.push((priority.index(), seq, id.clone()));
                }
                queue.enqueue(envelope(&id, *priority, *ttl));
            }
            expected.sort();

            let got: Vec<String> = std::iter::from_fn(|| queue.dequeue_at(now))
                .map(|e| e.message_id)
                .collect();
            let want: Vec<String> = expected.into_iter().map(|(_, _, id)| id).collect();
            prop_assert_eq!(got, want);
        }

        #[test]
        fn prop_purge_removes_exactly_expired(ttls in prop::collection::vec(1i64..120, 0..40), probe in 0i64..150) {
            let mut queue = MessageQueue::new();
            for (seq, ttl) in ttls.iter().enumerate() {
                queue.enqueue(envelope(&format!("m-{}", seq), Priority::Normal, *ttl));
            }
            let now = base() + Duration::minutes(probe);
            let expired = ttls.iter().filter(|ttl| **ttl <= probe).count();

            prop_assert_eq!(queue.purge_expired_at(now), expired);
            prop_assert_eq!(queue.len(), ttls.len() - expired);
            prop_assert_eq!(queue.purge_expired_at(now), 0);
        }
    }
}
