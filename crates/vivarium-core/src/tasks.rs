//! Worker pool for blocking syscalls.
//!
//! A handler that would block the transport (command execution,
//! outbound HTTP, LLM calls) submits a thunk here and immediately
//! returns an async acknowledgement carrying a request id. A worker
//! thread runs the thunk and parks the real response payload in the
//! submitter's inbox, drained later by `ASYNC_POLL`.
//!
//! Workers never touch socket state; they only produce payloads.
//! Deadlines are enforced inside the thunks themselves (command wait
//! deadlines, HTTP client timeouts), so a worker is never abandoned
//! mid-flight.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::debug;

/// Default worker count.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// A completed async syscall waiting to be polled.
#[derive(Debug, Clone)]
pub struct AsyncResult {
    pub request_id: u64,
    pub opcode: u8,
    /// Response payload, UTF-8 JSON.
    pub payload: String,
}

/// A queued unit of work.
type TaskFn = Box<dyn FnOnce() -> String + Send + 'static>;

struct Task {
    agent_id: u32,
    request_id: u64,
    opcode: u8,
    run: TaskFn,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<VecDeque<Task>>,
    available: Condvar,
    stopping: AtomicBool,
    inboxes: Mutex<HashMap<u32, VecDeque<AsyncResult>>>,
    next_request_id: AtomicU64,
}

/// Fixed-size worker pool with per-agent result inboxes.
pub struct AsyncTaskManager {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for AsyncTaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTaskManager")
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl Default for AsyncTaskManager {
    fn default() -> Self {
        Self::new(DEFAULT_WORKER_COUNT)
    }
}

impl AsyncTaskManager {
    /// Start a pool with `worker_count` threads (at least one).
    #[must_use]
    pub fn new(worker_count: usize) -> Self {
        let shared = Arc::new(Shared {
            next_request_id: AtomicU64::new(1),
            ..Shared::default()
        });

        let workers = (0..worker_count.max(1))
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("vivarium-worker-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { shared, workers }
    }

    /// Draw the next request id from the kernel-wide counter.
    #[must_use]
    pub fn next_request_id(&self) -> u64 {
        self.shared.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue a thunk. Returns `false` if the pool is shutting down.
    pub fn submit(
        &self,
        agent_id: u32,
        opcode: u8,
        request_id: u64,
        run: impl FnOnce() -> String + Send + 'static,
    ) -> bool {
        if self.shared.stopping.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut queue = self.shared.queue.lock().expect("task queue lock poisoned");
            queue.push_back(Task {
                agent_id,
                request_id,
                opcode,
                run: Box::new(run),
            });
        }
        self.shared.available.notify_one();
        true
    }

    /// Drain up to `max` completed results for an agent, FIFO.
    pub fn poll(&self, agent_id: u32, max: usize) -> Vec<AsyncResult> {
        let mut inboxes = self.shared.inboxes.lock().expect("inbox lock poisoned");
        let Some(inbox) = inboxes.get_mut(&agent_id) else {
            return Vec::new();
        };
        let count = max.min(inbox.len());
        inbox.drain(..count).collect()
    }

    /// Drop a reaped agent's inbox.
    pub fn purge(&self, agent_id: u32) {
        let mut inboxes = self.shared.inboxes.lock().expect("inbox lock poisoned");
        inboxes.remove(&agent_id);
    }
}

impl Drop for AsyncTaskManager {
    fn drop(&mut self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().expect("task queue lock poisoned");
            loop {
                if let Some(task) = queue.pop_front() {
                    break task;
                }
                if shared.stopping.load(Ordering::Acquire) {
                    return;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .expect("task queue lock poisoned");
            }
        };

        debug!(
            agent_id = task.agent_id,
            request_id = task.request_id,
            "running async task"
        );
        let payload = (task.run)();

        let mut inboxes = shared.inboxes.lock().expect("inbox lock poisoned");
        inboxes.entry(task.agent_id).or_default().push_back(AsyncResult {
            request_id: task.request_id,
            opcode: task.opcode,
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached within a second");
    }

    #[test]
    fn request_ids_are_unique_and_increasing() {
        let pool = AsyncTaskManager::new(2);
        let a = pool.next_request_id();
        let b = pool.next_request_id();
        assert!(b > a);
    }

    #[test]
    fn results_land_in_the_submitters_inbox() {
        let pool = AsyncTaskManager::new(2);
        let id = pool.next_request_id();
        pool.submit(7, 0x02, id, || "{\"success\":true}".to_string());

        wait_for(|| !pool.poll_peek_empty(7));
        let results = pool.poll(7, 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].request_id, id);
        assert_eq!(results[0].opcode, 0x02);
        assert!(pool.poll(7, 10).is_empty());
        assert!(pool.poll(8, 10).is_empty());
    }

    #[test]
    fn poll_is_fifo_and_batched() {
        let pool = AsyncTaskManager::new(1);
        for i in 0..4u64 {
            let id = pool.next_request_id();
            pool.submit(1, 0x50, id, move || format!("{i}"));
        }

        wait_for(|| pool.pending_count(1) == 4);
        let first = pool.poll(1, 2);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].payload, "0");
        assert_eq!(first[1].payload, "1");
        let rest = pool.poll(1, 10);
        assert_eq!(rest[0].payload, "2");
    }

    #[test]
    fn purge_discards_unpolled_results() {
        let pool = AsyncTaskManager::new(1);
        let id = pool.next_request_id();
        pool.submit(3, 0x02, id, || String::new());
        wait_for(|| pool.pending_count(3) == 1);

        pool.purge(3);
        assert!(pool.poll(3, 10).is_empty());
    }

    #[test]
    fn shutdown_refuses_new_work() {
        let pool = AsyncTaskManager::new(1);
        pool.shared.stopping.store(true, Ordering::Release);
        assert!(!pool.submit(1, 0, 1, || String::new()));
    }

    impl AsyncTaskManager {
        fn pending_count(&self, agent_id: u32) -> usize {
            let inboxes = self.shared.inboxes.lock().unwrap();
            inboxes.get(&agent_id).map_or(0, VecDeque::len)
        }

        fn poll_peek_empty(&self, agent_id: u32) -> bool {
            self.pending_count(agent_id) == 0
        }
    }
}
