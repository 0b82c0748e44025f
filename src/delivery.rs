//! Idempotent delivery bookkeeping and bounded exponential-backoff retries.
//!
//! [`DeliveryTracker`] records every inbound `uniqueId` the moment it is
//! decoded. A second sighting of the same id is a duplicate and is never
//! reprocessed. Messages whose handler hits an unmet precondition (for example
//! "no connection registered for this peer yet") are retried through a
//! [`RetryQueue`], which only stores `(due, uniqueId, attempt)` entries; the
//! tracker's state is consulted again when an entry comes due.
//!
//! Retry delay for attempt `n` (1-based) is `min(cap, base × coefficient^n)`,
//! which with the defaults gives 1500, 4500, 13500, 15000, 15000 ms.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::protocol::MessageId;

/// Default base delay.
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(500);

/// Default growth factor between attempts.
pub const DEFAULT_RETRY_COEFFICIENT: u32 = 3;

/// Default ceiling for a single delay.
pub const DEFAULT_RETRY_CAP: Duration = Duration::from_millis(15_000);

/// Default number of retries before a message fails terminally.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

// ── Policy ──────────────────────────────────────────────────────────

/// Backoff parameters for precondition retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub coefficient: u32,
    pub cap: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_RETRY_BASE,
            coefficient: DEFAULT_RETRY_COEFFICIENT,
            cap: DEFAULT_RETRY_CAP,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given 1-based retry attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.coefficient
            .checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

// ── Tracker ─────────────────────────────────────────────────────────

/// Processing state of a seen message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    /// Seen; the handler has not completed yet.
    Received,
    /// Terminal. Further sightings are ignored.
    Finished,
}

/// Per-`uniqueId` bookkeeping.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub unique_id: MessageId,
    pub created_at: Instant,
    pub retry_count: u32,
    pub state: MessageState,
}

/// Result of asking the tracker for another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again at `due`.
    Scheduled {
        attempt: u32,
        delay: Duration,
        due: Instant,
    },
    /// All retries used; the message is now finished and must be reported.
    Exhausted { retries: u32 },
    /// The message finished in the meantime; nothing to do.
    AlreadyFinished,
    /// The id was never received.
    Untracked,
}

/// Idempotency state for every message this peer has seen.
///
/// Entries are never collected; a lobby lives for minutes and sees a few
/// hundred messages at most.
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    entries: HashMap<MessageId, PendingMessage>,
    policy: RetryPolicy,
}

impl DeliveryTracker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            entries: HashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a first sighting.
    ///
    /// # Errors
    ///
    /// Returns the existing state when the id was already seen; the caller must
    /// drop the message.
    pub fn receive(&mut self, unique_id: &str, now: Instant) -> Result<(), MessageState> {
        if let Some(existing) = self.entries.get(unique_id) {
            return Err(existing.state);
        }
        self.entries.insert(
            unique_id.to_string(),
            PendingMessage {
                unique_id: unique_id.to_string(),
                created_at: now,
                retry_count: 0,
                state: MessageState::Received,
            },
        );
        Ok(())
    }

    /// Mark a message terminal. Unknown ids are recorded as finished so that a
    /// later copy is treated as a duplicate.
    pub fn finish(&mut self, unique_id: &str) {
        match self.entries.get_mut(unique_id) {
            Some(entry) => entry.state = MessageState::Finished,
            None => {
                self.entries.insert(
                    unique_id.to_string(),
                    PendingMessage {
                        unique_id: unique_id.to_string(),
                        created_at: Instant::now(),
                        retry_count: 0,
                        state: MessageState::Finished,
                    },
                );
            }
        }
    }

    pub fn state(&self, unique_id: &str) -> Option<MessageState> {
        self.entries.get(unique_id).map(|entry| entry.state)
    }

    pub fn is_finished(&self, unique_id: &str) -> bool {
        self.state(unique_id) == Some(MessageState::Finished)
    }

    pub fn get(&self, unique_id: &str) -> Option<&PendingMessage> {
        self.entries.get(unique_id)
    }

    /// Consume one retry for a received message.
    pub fn retry(&mut self, unique_id: &str, now: Instant) -> RetryDecision {
        let Some(entry) = self.entries.get_mut(unique_id) else {
            return RetryDecision::Untracked;
        };
        if entry.state == MessageState::Finished {
            return RetryDecision::AlreadyFinished;
        }
        if entry.retry_count >= self.policy.max_retries {
            entry.state = MessageState::Finished;
            return RetryDecision::Exhausted {
                retries: entry.retry_count,
            };
        }
        entry.retry_count += 1;
        let attempt = entry.retry_count;
        let delay = self.policy.delay_for_attempt(attempt);
        debug!(%unique_id, attempt, delay_ms = delay.as_millis() as u64, "retry scheduled");
        RetryDecision::Scheduled {
            attempt,
            delay,
            due: now + delay,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Scheduler ───────────────────────────────────────────────────────

/// One pending retry. Ordered by due time, then by insertion.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScheduledRetry {
    pub due: Instant,
    seq: u64,
    pub unique_id: MessageId,
    pub attempt: u32,
}

/// Min-heap of retries keyed by due time.
#[derive(Debug, Default)]
pub struct RetryQueue {
    heap: BinaryHeap<Reverse<ScheduledRetry>>,
    next_seq: u64,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, unique_id: MessageId, attempt: u32, due: Instant) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.heap.push(Reverse(ScheduledRetry {
            due,
            seq,
            unique_id,
            attempt,
        }));
    }

    /// Earliest due time, if any retry is pending.
    pub fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.due)
    }

    /// Remove and return every retry due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<ScheduledRetry> {
        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|Reverse(entry)| entry.due <= now) {
            if let Some(Reverse(entry)) = self.heap.pop() {
                due.push(entry);
            }
        }
        due
    }

    /// Drop every pending retry.
    pub fn clear(&mut self) {
        trace!(pending = self.heap.len(), "retry queue cleared");
        self.heap.clear();
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_delay_sequence() {
        let policy = RetryPolicy::default();
        let delays: Vec<u128> = (1..=5)
            .map(|attempt| policy.delay_for_attempt(attempt).as_millis())
            .collect();
        assert_eq!(delays, vec![1500, 4500, 13500, 15000, 15000]);
    }

    #[test]
    fn huge_attempt_saturates_at_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(200), DEFAULT_RETRY_CAP);
    }

    #[test]
    fn second_receive_is_rejected_with_current_state() {
        let mut tracker = DeliveryTracker::default();
        let now = Instant::now();
        tracker.receive("a", now).unwrap();
        assert_eq!(tracker.receive("a", now), Err(MessageState::Received));
        tracker.finish("a");
        assert_eq!(tracker.receive("a", now), Err(MessageState::Finished));
    }

    #[test]
    fn finishing_unknown_id_blocks_later_copies() {
        let mut tracker = DeliveryTracker::default();
        tracker.finish("spoofed");
        assert!(tracker.is_finished("spoofed"));
        assert!(tracker.receive("spoofed", Instant::now()).is_err());
    }

    #[test]
    fn retries_exhaust_after_max_and_finish() {
        let mut tracker = DeliveryTracker::default();
        let start = Instant::now();
        tracker.receive("m", start).unwrap();

        let mut now = start;
        let mut seen = Vec::new();
        loop {
            match tracker.retry("m", now) {
                RetryDecision::Scheduled { attempt, delay, due } => {
                    seen.push((attempt, delay.as_millis()));
                    now = due;
                }
                RetryDecision::Exhausted { retries } => {
                    assert_eq!(retries, 5);
                    break;
                }
                other => panic!("unexpected decision {other:?}"),
            }
        }
        assert_eq!(
            seen,
            vec![(1, 1500), (2, 4500), (3, 13500), (4, 15000), (5, 15000)]
        );
        assert!(tracker.is_finished("m"));
        assert_eq!(tracker.retry("m", now), RetryDecision::AlreadyFinished);
    }

    #[test]
    fn retry_of_unknown_id_is_untracked() {
        let mut tracker = DeliveryTracker::default();
        assert_eq!(
            tracker.retry("nope", Instant::now()),
            RetryDecision::Untracked
        );
    }

    #[test]
    fn queue_pops_in_due_order() {
        let mut queue = RetryQueue::new();
        let t0 = Instant::now();
        queue.push("late".into(), 1, t0 + Duration::from_millis(300));
        queue.push("early".into(), 1, t0 + Duration::from_millis(100));
        queue.push("mid".into(), 2, t0 + Duration::from_millis(200));

        assert_eq!(queue.next_due(), Some(t0 + Duration::from_millis(100)));
        assert!(queue.pop_due(t0).is_empty());

        let due = queue.pop_due(t0 + Duration::from_millis(250));
        let ids: Vec<&str> = due.iter().map(|r| r.unique_id.as_str()).collect();
        assert_eq!(ids, vec!["early", "mid"]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn clear_drops_every_entry() {
        let mut queue = RetryQueue::new();
        let t0 = Instant::now();
        queue.push("a".into(), 1, t0);
        queue.push("b".into(), 1, t0);
        queue.push("c".into(), 1, t0);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.next_due(), None);
    }
}
