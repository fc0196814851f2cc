//! Deadline scheduling for pending calls.
//!
//! One min-heap keyed by expiry instant replaces per-call timers and keeps
//! the loop single-threaded. Entries are never removed early: a call that
//! completes before its deadline leaves a stale entry behind, which the
//! sweep skips lazily because the call is no longer active. A stale head
//! can cause one early wake; it is popped on that wake, so the loop never
//! spins on it.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;

use minstant::Instant;
use mio::Token;

/// Pending call deadlines, soonest first.
#[derive(Default)]
pub(crate) struct DeadlineQueue {
    heap: BinaryHeap<Reverse<Entry>>,
}

#[derive(PartialEq, Eq)]
struct Entry {
    at: Instant,
    token: Token,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at
            .cmp(&other.at)
            .then_with(|| self.token.0.cmp(&other.token.0))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl DeadlineQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Tracks a call's absolute expiry instant.
    pub(crate) fn insert(&mut self, token: Token, at: Instant) {
        self.heap.push(Reverse(Entry { at, token }));
    }

    /// The wait bound for the next poll: time until the soonest tracked
    /// deadline, zero if it has already passed, `None` if nothing is
    /// tracked (wait indefinitely, until I/O or a new registration).
    pub(crate) fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.heap
            .peek()
            .map(|Reverse(entry)| entry.at.duration_since(now))
    }

    /// Pops the next entry whose deadline has passed, if any. The caller
    /// checks whether the call is still active; completed calls leave
    /// stale entries that are simply discarded here.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<Token> {
        match self.heap.peek() {
            Some(Reverse(entry)) if entry.at <= now => {
                let Reverse(entry) = self.heap.pop().expect("peeked entry vanished");
                Some(entry.token)
            }
            _ => None,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_queue_has_no_timeout() {
        let queue = DeadlineQueue::new();
        assert!(queue.next_timeout(Instant::now()).is_none());
    }

    #[test]
    fn soonest_deadline_bounds_the_wait() {
        let mut queue = DeadlineQueue::new();
        let now = Instant::now();
        queue.insert(Token(1), now + Duration::from_millis(500));
        queue.insert(Token(2), now + Duration::from_millis(100));
        queue.insert(Token(3), now + Duration::from_millis(300));

        let timeout = queue.next_timeout(now).unwrap();
        assert!(timeout <= Duration::from_millis(100));
        assert!(timeout > Duration::from_millis(50));
    }

    #[test]
    fn passed_deadline_yields_zero_timeout() {
        let mut queue = DeadlineQueue::new();
        let now = Instant::now();
        queue.insert(Token(1), now);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(queue.next_timeout(Instant::now()), Some(Duration::ZERO));
    }

    #[test]
    fn expiry_pops_in_deadline_order() {
        let mut queue = DeadlineQueue::new();
        let now = Instant::now();
        queue.insert(Token(5), now + Duration::from_millis(2));
        queue.insert(Token(7), now + Duration::from_millis(1));
        queue.insert(Token(9), now + Duration::from_secs(60));

        let later = now + Duration::from_millis(10);
        assert_eq!(queue.pop_expired(later), Some(Token(7)));
        assert_eq!(queue.pop_expired(later), Some(Token(5)));
        // The far-future entry stays put.
        assert_eq!(queue.pop_expired(later), None);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn stale_entries_drain_on_expiry() {
        let mut queue = DeadlineQueue::new();
        let now = Instant::now();
        // Both entries expire; the sweep pops both and the caller decides
        // which tokens still map to active calls.
        queue.insert(Token(1), now + Duration::from_millis(1));
        queue.insert(Token(1), now + Duration::from_millis(1));

        let later = now + Duration::from_millis(5);
        assert!(queue.pop_expired(later).is_some());
        assert!(queue.pop_expired(later).is_some());
        assert!(queue.pop_expired(later).is_none());
        assert_eq!(queue.len(), 0);
    }
}
