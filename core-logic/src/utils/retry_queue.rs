use crate::client::SubmissionRequest;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;
use tokio::time::Instant;

/// A request waiting for its next try.
#[derive(Debug, Clone)]
pub struct RetryQueueEntry {
    pub request: SubmissionRequest,
    pub retry_not_before: Instant,
    pub retries_remaining: u32,
    pub last_error_code: Option<u16>,
}

#[derive(Debug)]
struct Scheduled {
    entry: RetryQueueEntry,
    order: u64,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed: BinaryHeap is a max-heap and the earliest deadline must pop first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .entry
            .retry_not_before
            .cmp(&self.entry.retry_not_before)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// Shared priority queue of pending retries, ordered by `retry_not_before`
/// and then by insertion order.
#[derive(Debug, Default)]
pub struct RetryQueue {
    heap: Mutex<BinaryHeap<Scheduled>>,
    inserted: AtomicU64,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn heap(&self) -> std::sync::MutexGuard<'_, BinaryHeap<Scheduled>> {
        self.heap.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, entry: RetryQueueEntry) {
        let order = self.inserted.fetch_add(1, AtomicOrdering::SeqCst);
        self.heap().push(Scheduled { entry, order });
    }

    /// Earliest entry if it is due at `now`.
    pub fn pop_due(&self, now: Instant) -> Option<RetryQueueEntry> {
        let mut heap = self.heap();
        match heap.peek() {
            Some(top) if top.entry.retry_not_before <= now => heap.pop().map(|s| s.entry),
            _ => None,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap().peek().map(|s| s.entry.retry_not_before)
    }

    /// Removes every entry, earliest first.
    pub fn drain_all(&self) -> Vec<RetryQueueEntry> {
        let mut heap = self.heap();
        let mut entries = Vec::with_capacity(heap.len());
        while let Some(s) = heap.pop() {
            entries.push(s.entry);
        }
        entries
    }

    pub fn len(&self) -> usize {
        self.heap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::egress_pool::{EgressPoint, EgressScheme};
    use crate::utils::identity_pool::Identity;
    use std::time::Duration;

    fn entry(seq: u64, at: Instant) -> RetryQueueEntry {
        RetryQueueEntry {
            request: SubmissionRequest {
                target: "target".to_string(),
                reason: "reason".to_string(),
                identity: Identity::new(1, "a", chrono::Utc::now()),
                egress: EgressPoint::new(EgressScheme::Http, "10.0.0.1", 8080),
                attempt_seq: seq,
            },
            retry_not_before: at,
            retries_remaining: 2,
            last_error_code: Some(429),
        }
    }

    #[tokio::test]
    async fn test_pops_in_deadline_order() {
        let queue = RetryQueue::new();
        let now = Instant::now();
        queue.push(entry(1, now + Duration::from_secs(30)));
        queue.push(entry(2, now + Duration::from_secs(10)));
        queue.push(entry(3, now + Duration::from_secs(20)));

        let order: Vec<u64> = queue
            .drain_all()
            .into_iter()
            .map(|e| e.request.attempt_seq)
            .collect();
        assert_eq!(order, vec![2, 3, 1]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_equal_deadlines_keep_insertion_order() {
        let queue = RetryQueue::new();
        let at = Instant::now();
        for seq in 1..=4 {
            queue.push(entry(seq, at));
        }
        let order: Vec<u64> = std::iter::from_fn(|| queue.pop_due(at))
            .map(|e| e.request.attempt_seq)
            .collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_pop_due_respects_deadline() {
        let queue = RetryQueue::new();
        let now = Instant::now();
        queue.push(entry(1, now + Duration::from_secs(5)));

        assert!(queue.pop_due(now).is_none());
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(5)));
        assert!(queue.pop_due(now + Duration::from_secs(5)).is_some());
        assert!(queue.is_empty());
    }
}
