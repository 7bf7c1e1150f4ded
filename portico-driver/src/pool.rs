//! Elastic worker pool for blocking operations.
//!
//! Threads are spawned on demand up to a configured cap and retire after an
//! idle timeout. A serial bitset gives lower-indexed threads first claim on
//! the run queue; the tail therefore sees the least work and is the part that
//! idles out. The ordering is a scheduling policy, not a correctness
//! requirement.

use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Condvar, Mutex},
    thread,
    time::{Duration, Instant},
};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct SerialSet {
    words: Box<[u64]>,
}

impl SerialSet {
    fn new(len: usize) -> Self {
        // All bits start set: a slot that never hosted a thread must not
        // block its successors.
        Self {
            words: vec![u64::MAX; len.div_ceil(64).max(1)].into_boxed_slice(),
        }
    }

    fn set(&mut self, index: usize) {
        self.words[index / 64] |= 1 << (index % 64);
    }

    fn clear(&mut self, index: usize) {
        self.words[index / 64] &= !(1 << (index % 64));
    }

    fn get(&self, index: usize) -> bool {
        self.words[index / 64] & (1 << (index % 64)) != 0
    }

    fn all_set_below(&self, index: usize) -> bool {
        (0..index).all(|i| self.get(i))
    }
}

struct Slot {
    active: bool,
    thread: Option<thread::JoinHandle<()>>,
}

struct State {
    queue: VecDeque<Job>,
    slots: Box<[Slot]>,
    serial: SerialSet,
    active: usize,
    idle: usize,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    max_threads: usize,
    idle_timeout: Duration,
    name: Option<String>,
}

/// A worker pool that grows up to `max_threads` and retires idle threads.
///
/// With `max_threads == 0` the pool is disabled: [`spawn`](Self::spawn)
/// panics, and callers are expected to run the work inline instead.
pub struct DynamicThreadPool {
    shared: Option<Arc<Shared>>,
}

impl DynamicThreadPool {
    /// Default inactivity timeout after which a worker retires.
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(max_threads: usize, idle_timeout: Duration, name: Option<String>) -> Self {
        if max_threads == 0 {
            return Self { shared: None };
        }
        let slots = (0..max_threads)
            .map(|_| Slot {
                active: false,
                thread: None,
            })
            .collect();
        Self {
            shared: Some(Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    slots,
                    serial: SerialSet::new(max_threads),
                    active: 0,
                    idle: 0,
                }),
                cond: Condvar::new(),
                max_threads,
                idle_timeout,
                name,
            })),
        }
    }

    /// Whether the pool was built without worker threads.
    pub fn is_disabled(&self) -> bool {
        self.shared.is_none()
    }

    /// Number of live worker threads.
    pub fn active_threads(&self) -> usize {
        match &self.shared {
            Some(shared) => shared.state.lock().unwrap().active,
            None => 0,
        }
    }

    /// Enqueue a closure, promoting a new worker when no thread is idle and
    /// the cap allows one. A failure to start the thread is returned to the
    /// caller and the closure is not enqueued.
    ///
    /// # Panics
    ///
    /// Panics when the pool is disabled.
    pub fn spawn(&self, f: impl FnOnce() + Send + 'static) -> io::Result<()> {
        let shared = self
            .shared
            .as_ref()
            .expect("a worker thread is needed but the pool is disabled");
        {
            let mut state = shared.state.lock().unwrap();
            if state.idle == 0 && state.active < shared.max_threads {
                let index = state
                    .slots
                    .iter()
                    .position(|slot| !slot.active)
                    .expect("active thread count out of sync");
                state.slots[index].active = true;
                state.serial.clear(index);
                state.active += 1;
                let mut builder = thread::Builder::new();
                if let Some(name) = &shared.name {
                    builder = builder.name(name.clone());
                }
                let routine = {
                    let shared = shared.clone();
                    move || worker(shared, index)
                };
                match builder.spawn(routine) {
                    Ok(handle) => state.slots[index].thread = Some(handle),
                    Err(e) => {
                        state.slots[index].active = false;
                        state.serial.set(index);
                        state.active -= 1;
                        return Err(e);
                    }
                }
            }
            state.queue.push_front(Box::new(f));
        }
        // Broadcast: the acquisition protocol may force higher-indexed
        // threads back to sleep, so a single signal could be swallowed.
        shared.cond.notify_all();
        Ok(())
    }
}

impl Drop for DynamicThreadPool {
    fn drop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        let handles: Vec<_> = {
            let mut state = shared.state.lock().unwrap();
            for slot in state.slots.iter_mut() {
                slot.active = false;
            }
            state
                .slots
                .iter_mut()
                .filter_map(|slot| slot.thread.take())
                .collect()
        };
        shared.cond.notify_all();
        for handle in handles {
            handle.join().ok();
        }
    }
}

fn worker(shared: Arc<Shared>, index: usize) {
    let mut state = shared.state.lock().unwrap();
    let mut deadline = Instant::now() + shared.idle_timeout;
    'run: while state.slots[index].active {
        while !state.queue.is_empty() {
            if index == 0 || state.serial.all_set_below(index) {
                state.serial.set(index);
                while let Some(job) = state.queue.pop_front() {
                    drop(state);
                    job();
                    state = shared.state.lock().unwrap();
                    deadline = Instant::now() + shared.idle_timeout;
                }
                state.serial.clear(index);
                break;
            }
            if Instant::now() >= deadline {
                break 'run;
            }
            // A predecessor is awake but has not claimed the queue yet; give
            // it the first shot.
            drop(state);
            thread::yield_now();
            state = shared.state.lock().unwrap();
            if !state.slots[index].active {
                break 'run;
            }
        }
        if !state.slots[index].active {
            break;
        }
        state.idle += 1;
        let wait = deadline.saturating_duration_since(Instant::now());
        let (guard, timeout) = shared.cond.wait_timeout(state, wait).unwrap();
        state = guard;
        state.idle -= 1;
        if timeout.timed_out() && state.queue.is_empty() {
            break;
        }
    }
    state.active -= 1;
    // Successors must not wait on a retired predecessor.
    state.serial.set(index);
    state.slots[index].thread.take();
    state.slots[index].active = false;
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc,
    };

    use super::*;

    #[test]
    fn runs_jobs() {
        let pool = DynamicThreadPool::new(4, DynamicThreadPool::DEFAULT_IDLE_TIMEOUT, None);
        let (tx, rx) = mpsc::channel();
        for i in 0..16 {
            let tx = tx.clone();
            pool.spawn(move || tx.send(i).unwrap()).unwrap();
        }
        let mut got: Vec<_> = (0..16).map(|_| rx.recv().unwrap()).collect();
        got.sort_unstable();
        assert_eq!(got, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn respects_thread_cap() {
        let pool = DynamicThreadPool::new(2, DynamicThreadPool::DEFAULT_IDLE_TIMEOUT, None);
        let (tx, rx) = mpsc::channel();
        for _ in 0..8 {
            let tx = tx.clone();
            pool.spawn(move || {
                thread::sleep(Duration::from_millis(20));
                tx.send(()).unwrap();
            })
            .unwrap();
        }
        assert!(pool.active_threads() <= 2);
        for _ in 0..8 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
    }

    #[test]
    fn idle_threads_retire() {
        let pool = DynamicThreadPool::new(4, Duration::from_millis(50), None);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let counter = counter.clone();
            pool.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.active_threads() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.active_threads(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    #[should_panic(expected = "a worker thread is needed but the pool is disabled")]
    fn disabled_pool_panics_on_spawn() {
        let pool = DynamicThreadPool::new(0, DynamicThreadPool::DEFAULT_IDLE_TIMEOUT, None);
        pool.spawn(|| {}).unwrap();
    }

    #[test]
    fn drop_joins_idle_workers() {
        let pool = DynamicThreadPool::new(8, DynamicThreadPool::DEFAULT_IDLE_TIMEOUT, None);
        let (tx, rx) = mpsc::channel();
        for _ in 0..8 {
            let tx = tx.clone();
            pool.spawn(move || {
                thread::sleep(Duration::from_millis(10));
                tx.send(()).unwrap();
            })
            .unwrap();
        }
        for _ in 0..8 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        // All workers are idle now; teardown must join them promptly.
        let start = Instant::now();
        drop(pool);
        assert!(start.elapsed() < DynamicThreadPool::DEFAULT_IDLE_TIMEOUT);
    }

    #[test]
    fn named_workers() {
        let pool = DynamicThreadPool::new(
            1,
            DynamicThreadPool::DEFAULT_IDLE_TIMEOUT,
            Some("portico-worker".into()),
        );
        let (tx, rx) = mpsc::channel();
        pool.spawn(move || {
            tx.send(thread::current().name().map(str::to_owned)).unwrap();
        })
        .unwrap();
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("portico-worker"));
    }
}
