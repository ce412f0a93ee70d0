//! Worker pools
//!
//! Each pool owns a FIFO queue and a set of OS threads that pull items from
//! it. A worker runs one item at a time; queue and counters share a single
//! short-held lock that is never held while an item executes.
//!
//! # Policies
//!
//! - [`PoolPolicy::Fixed`]: threads are started eagerly and live until
//!   shutdown (CPU and disk pools).
//! - [`PoolPolicy::Elastic`]: a thread is spawned whenever an item is queued
//!   and no idle thread can take it, up to `max_threads`; idle threads exit
//!   after `idle_timeout` (web pools).

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, trace, warn};

/// Thread sizing policy of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPolicy {
    /// A fixed number of threads
    Fixed(usize),
    /// Threads spawned on demand
    Elastic {
        max_threads: usize,
        idle_timeout: Duration,
    },
}

/// Point-in-time counters of a pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub queued: usize,
    pub total_threads: usize,
    pub idle_threads: usize,
}

/// Callback that processes one queued item on a worker thread
pub type WorkHandler<T> = Arc<dyn Fn(T) + Send + Sync>;

struct PoolState<T> {
    queue: VecDeque<T>,
    total_threads: usize,
    idle_threads: usize,
    spawned: usize,
    shutdown: bool,
    handles: Vec<JoinHandle<()>>,
}

struct Shared<T> {
    name: &'static str,
    policy: PoolPolicy,
    state: Mutex<PoolState<T>>,
    work_available: Condvar,
    handler: WorkHandler<T>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A FIFO queue drained by a set of worker threads
pub struct WorkerPool<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Create a pool; fixed pools start their threads immediately
    pub fn new(name: &'static str, policy: PoolPolicy, handler: WorkHandler<T>) -> Self {
        let pool = Self {
            shared: Arc::new(Shared {
                name,
                policy,
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    total_threads: 0,
                    idle_threads: 0,
                    spawned: 0,
                    shutdown: false,
                    handles: Vec::new(),
                }),
                work_available: Condvar::new(),
                handler,
            }),
        };

        if let PoolPolicy::Fixed(threads) = policy {
            let mut state = pool.shared.lock();
            for _ in 0..threads {
                spawn_worker(&pool.shared, &mut state);
            }
            debug!(pool = name, threads = state.total_threads, "fixed pool started");
        }

        pool
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    /// Queue an item at the back. Returns false once the pool is shut down.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.shared.lock();
        if state.shutdown {
            debug!(pool = self.shared.name, "pool shut down, dropping work item");
            return false;
        }

        state.queue.push_back(item);

        if let PoolPolicy::Elastic { max_threads, .. } = self.shared.policy {
            if state.idle_threads < state.queue.len() && state.total_threads < max_threads {
                spawn_worker(&self.shared, &mut state);
            }
        }

        drop(state);
        self.shared.work_available.notify_one();
        true
    }

    /// Remove queued items matching `predicate`, preserving the order of the rest
    pub fn drain_where(&self, mut predicate: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut state = self.shared.lock();
        let mut drained = Vec::new();
        let mut kept = VecDeque::with_capacity(state.queue.len());
        for item in state.queue.drain(..) {
            if predicate(&item) {
                drained.push(item);
            } else {
                kept.push_back(item);
            }
        }
        state.queue = kept;
        drained
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.shared.lock();
        PoolStatus {
            queued: state.queue.len(),
            total_threads: state.total_threads,
            idle_threads: state.idle_threads,
        }
    }

    /// Stop accepting work, discard the queue and join every worker.
    ///
    /// Items already executing run to completion. Returns the discarded items.
    pub fn shutdown(&self) -> Vec<T> {
        let (handles, discarded) = {
            let mut state = self.shared.lock();
            state.shutdown = true;
            let discarded: Vec<T> = state.queue.drain(..).collect();
            (std::mem::take(&mut state.handles), discarded)
        };
        self.shared.work_available.notify_all();

        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(pool = self.shared.name, "worker thread panicked during shutdown");
            }
        }

        debug!(
            pool = self.shared.name,
            discarded = discarded.len(),
            "pool shut down"
        );
        discarded
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        let already_down = self.shared.lock().shutdown;
        if !already_down {
            self.shutdown();
        }
    }
}

fn spawn_worker<T: Send + 'static>(shared: &Arc<Shared<T>>, state: &mut PoolState<T>) {
    state.handles.retain(|handle| !handle.is_finished());

    let index = state.spawned;
    let worker_shared = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name(format!("stoker-{}-{}", shared.name, index))
        .spawn(move || worker_loop(worker_shared));

    match spawned {
        Ok(handle) => {
            state.spawned += 1;
            state.total_threads += 1;
            state.handles.push(handle);
            trace!(pool = shared.name, index, "worker spawned");
        }
        Err(e) => {
            error!(pool = shared.name, error = %e, "failed to spawn worker thread");
        }
    }
}

fn worker_loop<T: Send + 'static>(shared: Arc<Shared<T>>) {
    let mut state = shared.lock();
    loop {
        if let Some(item) = state.queue.pop_front() {
            drop(state);
            let handler = Arc::clone(&shared.handler);
            if panic::catch_unwind(AssertUnwindSafe(move || handler(item))).is_err() {
                error!(pool = shared.name, "work item panicked; worker continues");
            }
            state = shared.lock();
            continue;
        }

        if state.shutdown {
            break;
        }

        state.idle_threads += 1;
        match shared.policy {
            PoolPolicy::Fixed(_) => {
                state = shared
                    .work_available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            PoolPolicy::Elastic { idle_timeout, .. } => {
                let (guard, timeout) = shared
                    .work_available
                    .wait_timeout(state, idle_timeout)
                    .unwrap_or_else(PoisonError::into_inner);
                state = guard;
                if timeout.timed_out() && state.queue.is_empty() && !state.shutdown {
                    state.idle_threads -= 1;
                    trace!(pool = shared.name, "idle worker retiring");
                    break;
                }
            }
        }
        state.idle_threads -= 1;
    }
    state.total_threads -= 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Instant;

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_fixed_pool_starts_threads() {
        let pool: WorkerPool<u32> = WorkerPool::new("test", PoolPolicy::Fixed(3), Arc::new(|_| {}));
        assert!(wait_for(|| pool.status().idle_threads == 3));
        assert_eq!(pool.status().total_threads, 3);
        pool.shutdown();
        assert_eq!(pool.status().total_threads, 0);
    }

    #[test]
    fn test_single_worker_preserves_fifo_order() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let pool = WorkerPool::new(
            "fifo",
            PoolPolicy::Fixed(1),
            Arc::new(move |item: u32| {
                let _ = tx.lock().unwrap().send(item);
            }),
        );

        for i in 0..20 {
            pool.push(i);
        }

        let received: Vec<u32> = (0..20)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(received, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_elastic_pool_spawns_per_pending_item() {
        let release = Arc::new((Mutex::new(false), Condvar::new()));
        let gate = Arc::clone(&release);
        let pool = WorkerPool::new(
            "elastic",
            PoolPolicy::Elastic {
                max_threads: 8,
                idle_timeout: Duration::from_secs(30),
            },
            Arc::new(move |_: u32| {
                let (lock, cvar) = &*gate;
                let mut open = lock.lock().unwrap();
                while !*open {
                    open = cvar.wait(open).unwrap();
                }
            }),
        );

        for i in 0..4 {
            pool.push(i);
        }
        assert!(wait_for(|| pool.status().total_threads == 4));
        assert_eq!(pool.status().idle_threads, 0);

        {
            let (lock, cvar) = &*release;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }
        assert!(wait_for(|| pool.status().idle_threads == 4));
    }

    #[test]
    fn test_elastic_pool_respects_max_threads() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        let pool = WorkerPool::new(
            "bounded",
            PoolPolicy::Elastic {
                max_threads: 2,
                idle_timeout: Duration::from_secs(30),
            },
            Arc::new(move |_: u32| {
                thread::sleep(Duration::from_millis(20));
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        for i in 0..6 {
            pool.push(i);
        }
        assert!(pool.status().total_threads <= 2);
        assert!(wait_for(|| counter.load(Ordering::SeqCst) == 6));
    }

    #[test]
    fn test_elastic_idle_threads_retire() {
        let pool = WorkerPool::new(
            "retire",
            PoolPolicy::Elastic {
                max_threads: 4,
                idle_timeout: Duration::from_millis(20),
            },
            Arc::new(|_: u32| {}),
        );

        pool.push(1);
        assert!(wait_for(|| pool.status().total_threads == 0));
    }

    #[test]
    fn test_worker_survives_panic() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        let pool = WorkerPool::new(
            "panicky",
            PoolPolicy::Fixed(1),
            Arc::new(move |item: u32| {
                if item == 0 {
                    panic!("boom");
                }
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        pool.push(0);
        pool.push(1);
        assert!(wait_for(|| counter.load(Ordering::SeqCst) == 1));
        assert_eq!(pool.status().total_threads, 1);
    }

    #[test]
    fn test_drain_where_keeps_order() {
        let release = Arc::new(Mutex::new(()));
        let hold = release.lock().unwrap();
        let gate = Arc::clone(&release);
        let pool = WorkerPool::new(
            "drain",
            PoolPolicy::Fixed(1),
            Arc::new(move |_: u32| {
                let _guard = gate.lock().unwrap();
            }),
        );

        for i in 0..6 {
            pool.push(i);
        }
        // item 0 may already be claimed by the worker
        assert!(wait_for(|| pool.status().queued == 5));

        let drained = pool.drain_where(|item| item % 2 == 0);
        assert_eq!(drained, vec![2, 4]);
        assert_eq!(pool.status().queued, 3);

        drop(hold);
        pool.shutdown();
    }

    #[test]
    fn test_push_after_shutdown_is_rejected() {
        let pool: WorkerPool<u32> = WorkerPool::new("closed", PoolPolicy::Fixed(1), Arc::new(|_| {}));
        pool.shutdown();
        assert!(!pool.push(1));
    }
}
