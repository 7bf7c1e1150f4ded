//! User-level event source.
//!
//! A counting semaphore with a waiter list. `notify` wakes exactly one party:
//! it either hands the notification to a registered waiter (translating it to
//! an asynchronous wakeup through the waiter's waker) or bumps the semaphore,
//! never both. A waiter registered in the list is therefore not counted
//! against the semaphore.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Condvar, Mutex},
    task::Waker,
};

/// A waiter registered with an [`EventSource`].
///
/// `word` identifies the waiting operation; the waker delivers the wakeup to
/// the owner of that operation.
pub struct Waiter {
    pub word: u64,
    pub waker: Waker,
}

struct State {
    permits: u64,
    waiters: VecDeque<Waiter>,
}

/// Semaphore-backed event source with asynchronous waiters.
pub struct EventSource {
    state: Mutex<State>,
    cond: Condvar,
}

impl Default for EventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSource {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                permits: 0,
                waiters: VecDeque::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Wake one waiter, or post the semaphore when none is registered.
    pub fn notify(&self) {
        let waiter = {
            let mut state = self.state.lock().unwrap();
            match state.waiters.pop_front() {
                Some(waiter) => Some(waiter),
                None => {
                    state.permits += 1;
                    self.cond.notify_one();
                    None
                }
            }
        };
        if let Some(waiter) = waiter {
            waiter.waker.wake();
        }
    }

    /// Block until a notification is available, then consume it.
    pub fn wait(&self) {
        let mut state = self.state.lock().unwrap();
        while state.permits == 0 {
            state = self.cond.wait(state).unwrap();
        }
        state.permits -= 1;
    }

    /// Consume a notification without blocking. Returns whether one was
    /// available.
    pub fn try_wait(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.permits == 0 {
            false
        } else {
            state.permits -= 1;
            true
        }
    }

    /// Register a waiter for the next notification. When a notification is
    /// already available it is consumed instead, and the waiter is not
    /// registered; the registration and the consumption check are one
    /// critical section, so a notification can never slip between them.
    /// Returns whether the waiter was registered.
    pub fn add_waiter(&self, waiter: Waiter) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.permits > 0 {
            state.permits -= 1;
            false
        } else {
            state.waiters.push_back(waiter);
            true
        }
    }

    /// Remove a previously registered waiter. Returns `false` when the waiter
    /// is no longer in the list, meaning a concurrent `notify` consumed it.
    pub fn remove_waiter(&self, word: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.waiters.iter().position(|w| w.word == word) {
            Some(pos) => {
                state.waiters.remove(pos);
                true
            }
            None => false,
        }
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap();
        assert!(
            state.waiters.is_empty(),
            "event source destroyed with registered waiters"
        );
    }
}

impl fmt::Debug for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSource").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use std::task::Wake;

    use super::*;

    struct CountingWake(AtomicUsize);

    impl Wake for CountingWake {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_waker() -> (Arc<CountingWake>, Waker) {
        let inner = Arc::new(CountingWake(AtomicUsize::new(0)));
        (inner.clone(), Waker::from(inner))
    }

    #[test]
    fn semaphore_round_trip() {
        let source = EventSource::new();
        assert!(!source.try_wait());
        source.notify();
        assert!(source.try_wait());
        assert!(!source.try_wait());
    }

    #[test]
    fn wait_blocks_until_notified() {
        let source = Arc::new(EventSource::new());
        let waiter = {
            let source = source.clone();
            std::thread::spawn(move || source.wait())
        };
        source.notify();
        waiter.join().unwrap();
    }

    #[test]
    fn notify_prefers_waiters_over_permits() {
        let source = EventSource::new();
        let (count, waker) = counting_waker();
        assert!(source.add_waiter(Waiter { word: 1, waker }));
        source.notify();
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
        // The notification went to the waiter, not the semaphore.
        assert!(!source.try_wait());
    }

    #[test]
    fn registration_consumes_a_pending_notification() {
        let source = EventSource::new();
        source.notify();
        let (count, waker) = counting_waker();
        assert!(!source.add_waiter(Waiter { word: 1, waker }));
        assert_eq!(count.0.load(Ordering::SeqCst), 0);
        assert!(!source.try_wait());
    }

    #[test]
    fn remove_waiter_detects_consumed_notification() {
        let source = EventSource::new();
        let (_count, waker) = counting_waker();
        source.add_waiter(Waiter { word: 1, waker });
        assert!(source.remove_waiter(1));
        assert!(!source.remove_waiter(1));

        let (_count, waker) = counting_waker();
        source.add_waiter(Waiter { word: 2, waker });
        source.notify();
        assert!(!source.remove_waiter(2));
    }

    #[test]
    fn waiters_are_woken_in_registration_order() {
        let source = EventSource::new();
        let (first, waker) = counting_waker();
        source.add_waiter(Waiter { word: 1, waker });
        let (second, waker) = counting_waker();
        source.add_waiter(Waiter { word: 2, waker });
        source.notify();
        assert_eq!(first.0.load(Ordering::SeqCst), 1);
        assert_eq!(second.0.load(Ordering::SeqCst), 0);
        source.notify();
        assert_eq!(second.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "event source destroyed with registered waiters")]
    fn destroy_with_waiters_is_fatal() {
        let source = EventSource::new();
        let (_count, waker) = counting_waker();
        source.add_waiter(Waiter { word: 1, waker });
        drop(source);
    }
}
