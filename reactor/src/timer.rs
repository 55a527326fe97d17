//! The two timeout queues: *immediate* (fire on the next pass) and *timed*
//! (fire when the deadline elapses).
//!
//! Timed entries keep their absolute deadline as milliseconds relative to a
//! queue epoch; the epoch is rebased about once an hour so the stored
//! priorities stay small. Cancellation is an O(n) scan by id.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::Token;

const REBASE_AFTER: Duration = Duration::from_secs(3600);

/// Stable identity of a scheduled timeout, for cancellation and early fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutId(u64);

#[derive(Debug)]
struct Immediate {
    id: TimeoutId,
    token: Token,
}

#[derive(Debug)]
struct Timed {
    id: TimeoutId,
    token: Token,
    /// Absolute deadline, milliseconds since `epoch`.
    prio_ms: u64,
}

#[derive(Debug)]
pub(crate) struct Timers {
    next_id: u64,
    immediate: VecDeque<Immediate>,
    /// Ordered by `prio_ms`, earliest first.
    timed: VecDeque<Timed>,
    epoch: Instant,
}

impl Timers {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 0,
            immediate: VecDeque::new(),
            timed: VecDeque::new(),
            epoch: Instant::now(),
        }
    }

    fn next_id(&mut self) -> TimeoutId {
        self.next_id += 1;
        TimeoutId(self.next_id)
    }

    pub(crate) fn add_immediate(&mut self, token: Token) -> TimeoutId {
        let id = self.next_id();
        self.immediate.push_back(Immediate { id, token });
        id
    }

    pub(crate) fn cancel_immediate(&mut self, id: TimeoutId) {
        self.immediate.retain(|t| t.id != id);
    }

    pub(crate) fn pop_immediate(&mut self) -> Option<Token> {
        self.immediate.pop_front().map(|t| t.token)
    }

    pub(crate) fn add_timeout(&mut self, token: Token, delay: Duration, now: Instant) -> TimeoutId {
        let id = self.next_id();
        let prio_ms = self.to_ms(now) + delay.as_millis() as u64;
        let at = self.timed.partition_point(|t| t.prio_ms <= prio_ms);
        self.timed.insert(at, Timed { id, token, prio_ms });
        id
    }

    pub(crate) fn cancel_timeout(&mut self, id: TimeoutId) {
        self.timed.retain(|t| t.id != id);
    }

    pub(crate) fn remove_timeout(&mut self, id: TimeoutId) -> Option<Token> {
        let at = self.timed.iter().position(|t| t.id == id)?;
        self.timed.remove(at).map(|t| t.token)
    }

    pub(crate) fn pop_elapsed(&mut self, now: Instant) -> Option<Token> {
        let now_ms = self.to_ms(now);
        if self.timed.front()?.prio_ms > now_ms {
            return None;
        }
        self.timed.pop_front().map(|t| t.token)
    }

    /// Shift the epoch forward once it is more than an hour old, adjusting
    /// every pending priority. Keeps the stored values small no matter how
    /// long the process runs.
    pub(crate) fn rebase(&mut self, now: Instant) {
        if self.timed.is_empty() {
            return;
        }
        let elapsed = now.duration_since(self.epoch);
        if elapsed < REBASE_AFTER {
            return;
        }
        let delta_ms = elapsed.as_millis() as u64;
        for t in &mut self.timed {
            t.prio_ms = t.prio_ms.saturating_sub(delta_ms);
        }
        self.epoch = now;
    }

    /// Reduce the caller's poll timeout to the earliest pending deadline
    /// plus 5 ms. The slack rate-limits timer re-entry to roughly 200 Hz.
    pub(crate) fn clamp_poll_timeout(
        &self,
        caller: Option<Duration>,
        now: Instant,
    ) -> Option<Duration> {
        let Some(front) = self.timed.front() else {
            return caller;
        };
        let remaining = Duration::from_millis(front.prio_ms.saturating_sub(self.to_ms(now)));
        match caller {
            Some(c) if remaining >= c => Some(c),
            _ => Some(remaining + Duration::from_millis(5)),
        }
    }

    fn to_ms(&self, now: Instant) -> u64 {
        now.duration_since(self.epoch).as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timed_entries_fire_in_deadline_order() {
        let mut timers = Timers::new();
        let now = Instant::now();
        timers.add_timeout(Token(2), Duration::from_millis(20), now);
        timers.add_timeout(Token(1), Duration::from_millis(10), now);
        timers.add_timeout(Token(3), Duration::from_millis(30), now);

        let later = now + Duration::from_millis(25);
        assert_eq!(timers.pop_elapsed(later), Some(Token(1)));
        assert_eq!(timers.pop_elapsed(later), Some(Token(2)));
        assert_eq!(timers.pop_elapsed(later), None);
    }

    #[test]
    fn cancel_removes_exactly_one_entry() {
        let mut timers = Timers::new();
        let now = Instant::now();
        let keep = timers.add_timeout(Token(1), Duration::from_millis(10), now);
        let gone = timers.add_timeout(Token(2), Duration::from_millis(10), now);
        timers.cancel_timeout(gone);

        let later = now + Duration::from_millis(15);
        assert_eq!(timers.pop_elapsed(later), Some(Token(1)));
        assert_eq!(timers.pop_elapsed(later), None);
        let _ = keep;
    }

    #[test]
    fn rebase_preserves_remaining_delay() {
        let mut timers = Timers::new();
        let now = Instant::now();
        timers.add_timeout(Token(7), REBASE_AFTER + Duration::from_millis(500), now);

        let later = now + REBASE_AFTER + Duration::from_millis(100);
        timers.rebase(later);
        assert_eq!(timers.pop_elapsed(later), None);
        assert_eq!(
            timers.pop_elapsed(later + Duration::from_millis(400)),
            Some(Token(7))
        );
    }

    #[test]
    fn clamp_prefers_earliest_deadline() {
        let mut timers = Timers::new();
        let now = Instant::now();
        timers.add_timeout(Token(0), Duration::from_millis(50), now);

        let clamped = timers.clamp_poll_timeout(Some(Duration::from_secs(10)), now);
        assert_eq!(clamped, Some(Duration::from_millis(55)));

        let kept = timers.clamp_poll_timeout(Some(Duration::from_millis(20)), now);
        assert_eq!(kept, Some(Duration::from_millis(20)));
    }

    #[test]
    fn immediate_queue_is_fifo() {
        let mut timers = Timers::new();
        timers.add_immediate(Token(1));
        let second = timers.add_immediate(Token(2));
        timers.add_immediate(Token(3));
        timers.cancel_immediate(second);

        assert_eq!(timers.pop_immediate(), Some(Token(1)));
        assert_eq!(timers.pop_immediate(), Some(Token(3)));
        assert_eq!(timers.pop_immediate(), None);
    }
}
