//! Monotonic one-shot timer queue.
//!
//! Timers are keyed by an opaque user word. The queue is driven from a single
//! thread: the owner asks for the delay until the next fire, sleeps at most
//! that long, then pops the timers that became due.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    time::{Duration, Instant},
};

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct Deadline {
    at: Instant,
    word: u64,
}

/// One-shot timers over a monotonic clock.
#[derive(Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<Deadline>>,
    // word -> armed deadline; heap entries not present here are stale.
    armed: HashMap<u64, Instant>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a one-shot timer. Re-arming the same word replaces the previous
    /// deadline.
    pub fn schedule(&mut self, word: u64, delay: Duration) {
        let at = Instant::now() + delay;
        self.armed.insert(word, at);
        self.heap.push(Reverse(Deadline { at, word }));
    }

    /// Disarm a timer. Returns `false` when the word is unknown, which
    /// includes the case where the timer already fired.
    pub fn disarm(&mut self, word: u64) -> bool {
        self.armed.remove(&word).is_some()
    }

    /// Delay until the earliest armed timer fires, `None` when the queue is
    /// empty.
    pub fn next_delay(&mut self, now: Instant) -> Option<Duration> {
        loop {
            let head = self.heap.peek()?;
            match self.armed.get(&head.0.word) {
                Some(at) if *at == head.0.at => {
                    return Some(head.0.at.saturating_duration_since(now));
                }
                _ => {
                    self.heap.pop();
                }
            }
        }
    }

    /// Pop the user word of one timer that is due at `now`, removing it from
    /// the queue.
    pub fn pop_due(&mut self, now: Instant) -> Option<u64> {
        loop {
            let head = self.heap.peek()?;
            if head.0.at > now {
                return None;
            }
            let Reverse(Deadline { at, word }) = self.heap.pop()?;
            match self.armed.get(&word) {
                Some(armed_at) if *armed_at == at => {
                    self.armed.remove(&word);
                    return Some(word);
                }
                _ => {}
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut q = TimerQueue::new();
        q.schedule(1, Duration::from_millis(20));
        q.schedule(2, Duration::from_millis(10));
        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(q.pop_due(later), Some(2));
        assert_eq!(q.pop_due(later), Some(1));
        assert_eq!(q.pop_due(later), None);
        assert!(q.is_empty());
    }

    #[test]
    fn disarm_prevents_fire() {
        let mut q = TimerQueue::new();
        q.schedule(1, Duration::from_millis(1));
        assert!(q.disarm(1));
        assert_eq!(q.pop_due(Instant::now() + Duration::from_secs(1)), None);
    }

    #[test]
    fn disarm_after_fire_reports_not_found() {
        let mut q = TimerQueue::new();
        q.schedule(1, Duration::from_millis(1));
        assert_eq!(q.pop_due(Instant::now() + Duration::from_secs(1)), Some(1));
        assert!(!q.disarm(1));
    }

    #[test]
    fn rearm_replaces_deadline() {
        let mut q = TimerQueue::new();
        q.schedule(1, Duration::from_millis(1));
        q.schedule(1, Duration::from_secs(60));
        assert_eq!(q.pop_due(Instant::now() + Duration::from_secs(1)), None);
        let delay = q.next_delay(Instant::now()).unwrap();
        assert!(delay > Duration::from_secs(30));
    }

    #[test]
    fn not_yet_due_is_kept() {
        let mut q = TimerQueue::new();
        q.schedule(1, Duration::from_secs(60));
        assert_eq!(q.pop_due(Instant::now()), None);
        assert!(!q.is_empty());
        assert!(q.next_delay(Instant::now()).is_some());
    }
}
