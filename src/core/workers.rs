//! Background thread pool for short tasks (cache loads, prefetch, lyric checks)
//!
//! Work-stealing layout:
//! - External tasks go to a global injector
//! - Each worker drains its own deque first, then the injector, then steals
//!
//! Results come back through [`TaskHandle`], a typed one-shot channel, so
//! callers never share mutable state with the worker that produced it.

use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use log::{trace, warn};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Typed result of a task submitted with [`Workers::spawn`]
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: Receiver<T>,
}

/// Why a task produced no value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// Deadline passed before the task finished
    Timeout,
    /// Task panicked or the pool shut down before running it
    Dropped,
}

impl<T> TaskHandle<T> {
    /// Block until the task finishes
    pub fn join(self) -> Result<T, TaskError> {
        self.rx.recv().map_err(|_| TaskError::Dropped)
    }

    pub fn join_timeout(&self, timeout: Duration) -> Result<T, TaskError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => TaskError::Timeout,
            RecvTimeoutError::Disconnected => TaskError::Dropped,
        })
    }

    /// Non-blocking poll (for the interactive loop)
    pub fn try_join(&self) -> Option<Result<T, TaskError>> {
        match self.rx.try_recv() {
            Ok(v) => Some(Ok(v)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(TaskError::Dropped)),
        }
    }
}

/// Worker pool with work-stealing
///
/// # Example
/// ```ignore
/// let workers = Workers::new(4);
/// let handle = workers.spawn(move || lyrics.load(&folder));
/// let lines = handle.join()?;
/// ```
pub struct Workers {
    injector: Arc<Injector<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
}

impl Workers {
    /// Create pool with `num_threads` workers (min 1).
    ///
    /// Recommended: `num_cpus::get() * 3 / 4` (leave room for the interactive thread).
    pub fn new(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let injector: Arc<Injector<Job>> = Arc::new(Injector::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let locals: Vec<Worker<Job>> = (0..num_threads).map(|_| Worker::new_fifo()).collect();
        let stealers: Vec<Stealer<Job>> = locals.iter().map(Worker::stealer).collect();

        let mut handles = Vec::with_capacity(num_threads);
        for (worker_id, local) in locals.into_iter().enumerate() {
            let injector = Arc::clone(&injector);
            let shutdown = Arc::clone(&shutdown);
            let stealers = stealers.clone();

            let spawned = thread::Builder::new()
                .name(format!("stemdeck-worker-{}", worker_id))
                .spawn(move || {
                    trace!("Worker {} started", worker_id);
                    loop {
                        if let Some(job) = find_job(&local, &injector, &stealers) {
                            job();
                            continue;
                        }
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        // No work: short sleep instead of spinning
                        thread::sleep(Duration::from_millis(1));
                    }
                    trace!("Worker {} stopped", worker_id);
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => warn!("Failed to spawn worker {}: {}", worker_id, e),
            }
        }

        trace!("Workers initialized: {} threads", handles.len());

        Self {
            injector,
            handles,
            shutdown,
            in_flight,
        }
    }

    /// Run closure on a worker thread, no result.
    ///
    /// A panic inside `f` is caught and logged; the worker keeps running.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.fetch_add(1, Ordering::SeqCst);
        self.injector.push(Box::new(move || {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
                warn!("Background task panicked");
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
        }));
    }

    /// Run closure on a worker thread and get its typed result back
    pub fn spawn<T, F>(&self, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.execute(move || {
            let _ = tx.send(f());
        });
        TaskHandle { rx }
    }

    /// Tasks queued or running
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until every submitted task finished (or timeout). Returns true if idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    pub fn num_threads(&self) -> usize {
        self.handles.len()
    }
}

fn find_job(local: &Worker<Job>, injector: &Injector<Job>, stealers: &[Stealer<Job>]) -> Option<Job> {
    if let Some(job) = local.pop() {
        return Some(job);
    }
    loop {
        match injector.steal_batch_and_pop(local) {
            Steal::Success(job) => return Some(job),
            Steal::Retry => continue,
            Steal::Empty => break,
        }
    }
    stealers.iter().find_map(|s| s.steal().success())
}

impl Drop for Workers {
    fn drop(&mut self) {
        let num_threads = self.handles.len();
        trace!("Workers shutting down ({} threads)...", num_threads);

        self.shutdown.store(true, Ordering::SeqCst);

        // Wait with timeout (500ms total); detached tasks still running die with the process
        let deadline = Instant::now() + Duration::from_millis(500);
        for handle in std::mem::take(&mut self.handles) {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("Shutdown timeout reached, exiting anyway");
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }

        trace!("All {} workers stopped", num_threads);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_returns_value() {
        let workers = Workers::new(2);
        let handle = workers.spawn(|| 21 * 2);
        assert_eq!(handle.join(), Ok(42));
    }

    #[test]
    fn test_execute_runs_all_tasks() {
        let workers = Workers::new(3);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            workers.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(workers.wait_idle(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_panicking_task_is_isolated() {
        let workers = Workers::new(1);
        let failed = workers.spawn(|| -> u32 { panic!("boom") });
        assert_eq!(failed.join(), Err(TaskError::Dropped));

        // Same single worker still serves tasks
        assert_eq!(workers.spawn(|| 5).join(), Ok(5));
    }

    #[test]
    fn test_join_timeout() {
        let workers = Workers::new(1);
        let handle = workers.spawn(|| {
            thread::sleep(Duration::from_millis(200));
            1
        });
        assert_eq!(handle.join_timeout(Duration::from_millis(10)), Err(TaskError::Timeout));
        assert_eq!(handle.join_timeout(Duration::from_secs(5)), Ok(1));
    }
}
