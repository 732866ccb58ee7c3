//! Sequential separation job queue
//!
//! **Why**: separation takes minutes per track and saturates the machine, so
//! jobs run strictly one at a time, in submission order, off the interactive
//! thread.
//!
//! **Used by**: AppContext (submit / clear / shutdown), CLI `split`
//!
//! State machine (one mutex):
//! - Idle -> Active: `submit` while idle spawns the driver thread
//! - Active -> Active: driver pops the next pending job
//! - Active -> Idle: driver finds the queue empty; `active` is cleared under
//!   the same lock as the empty pop, so a concurrent `submit` either lands in
//!   the queue before the check or starts a fresh driver
//!
//! A failing or panicking job becomes a `JobEvent::Failed` and the driver moves
//! on. When the driver drains after a successful last job, the verifier polls
//! that job's folder; the poll starts under the state lock, so the newest
//! drain always owns the verifier.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use serde::Serialize;
use uuid::Uuid;

use super::job::{JobError, JobEvent, Milestone, SeparationJob};
use super::pipeline::SeparationRunner;
use super::verify::Verifier;

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<SeparationJob>,
    active: bool,
    current: Option<SeparationJob>,
    progress: u8,
    last_submitted: Option<SeparationJob>,
    multiple_pending: bool,
}

/// Point-in-time view of the queue
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSnapshot {
    pub active: bool,
    pub pending: usize,
    pub progress: u8,
    pub current: Option<SeparationJob>,
    pub last_submitted: Option<SeparationJob>,
    pub multiple_pending: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    runner: Arc<dyn SeparationRunner>,
    verifier: Verifier,
    events: Sender<JobEvent>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: JobEvent) {
        // Receiver gone means nobody is listening anymore; jobs still run
        let _ = self.events.send(event);
    }
}

/// FIFO queue with one worker thread while active
pub struct JobQueue {
    shared: Arc<Shared>,
}

impl JobQueue {
    pub fn new(runner: Arc<dyn SeparationRunner>, verifier: Verifier, events: Sender<JobEvent>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                runner,
                verifier,
                events,
                driver: Mutex::new(None),
            }),
        }
    }

    /// Append a job; starts the worker if idle. Returns the job id.
    pub fn submit(&self, job: SeparationJob) -> Uuid {
        let id = job.id;
        let start = {
            let mut state = self.shared.state();
            state.pending.push_back(job.clone());
            state.last_submitted = Some(job.clone());
            let position = state.pending.len();
            self.shared.emit(JobEvent::Queued { id, position });

            if state.active {
                state.multiple_pending = true;
                debug!("Queued {} at position {}", job.display_name(), position);
                false
            } else {
                state.active = true;
                true
            }
        };

        if start {
            self.spawn_driver();
        }
        id
    }

    /// Drop jobs that have not started. Returns how many were removed.
    pub fn clear_pending(&self) -> usize {
        let mut state = self.shared.state();
        let count = state.pending.len();
        state.pending.clear();
        state.multiple_pending = false;
        if count > 0 {
            info!("Cleared {} pending separation jobs", count);
        }
        count
    }

    /// Clear pending jobs, stop verification and wait for the running job.
    pub fn shutdown(&self) {
        self.clear_pending();
        self.shared.verifier.cancel();
        let driver = self.shared.driver.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(driver) = driver {
            debug!("Waiting for separation worker...");
            let _ = driver.join();
        }
        // The driver may have started a poll while draining
        self.shared.verifier.cancel();
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.shared.state();
        QueueSnapshot {
            active: state.active,
            pending: state.pending.len(),
            progress: state.progress,
            current: state.current.clone(),
            last_submitted: state.last_submitted.clone(),
            multiple_pending: state.multiple_pending,
        }
    }

    pub fn is_active(&self) -> bool {
        self.shared.state().active
    }

    pub fn is_verifying(&self) -> bool {
        self.shared.verifier.is_polling()
    }

    fn spawn_driver(&self) {
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("stemdeck-separation".into())
            .spawn(move || drive(&shared));

        match spawned {
            Ok(handle) => {
                let previous = self
                    .shared
                    .driver
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .replace(handle);
                // Previous driver already cleared `active`, it is finishing up
                if let Some(previous) = previous {
                    let _ = previous.join();
                }
            }
            Err(e) => {
                error!("Failed to start separation worker: {}", e);
                let mut state = self.shared.state();
                state.active = false;
                let failed: Vec<SeparationJob> = state.pending.drain(..).collect();
                drop(state);
                for job in failed {
                    self.shared.emit(JobEvent::Failed {
                        id: job.id,
                        message: format!("Failed to start separation worker: {}", e),
                        stderr: String::new(),
                    });
                }
            }
        }
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker loop: run jobs until the queue is empty
fn drive(shared: &Shared) {
    info!("Separation worker started");
    let mut last_success: Option<PathBuf> = None;

    loop {
        let job = {
            let mut state = shared.state();
            match state.pending.pop_front() {
                Some(job) => {
                    state.current = Some(job.clone());
                    state.progress = 0;
                    state.multiple_pending = !state.pending.is_empty();
                    job
                }
                None => {
                    state.active = false;
                    state.current = None;
                    state.multiple_pending = false;
                    // Still under the lock: a driver started by a later
                    // submit can only start its poll after this one
                    shared.emit(JobEvent::Idle);
                    if let Some(folder) = last_success.take() {
                        shared.verifier.start(folder);
                    }
                    break;
                }
            }
        };

        shared.emit(JobEvent::Started {
            id: job.id,
            artist: job.artist.clone(),
            title: job.title.clone(),
        });

        match run_isolated(shared, &job) {
            Ok(folder) => {
                info!("Separation finished: {}", job.display_name());
                shared.emit(JobEvent::Finished {
                    id: job.id,
                    folder: folder.clone(),
                });
                shared.emit(JobEvent::RescanRequested);
                last_success = Some(folder);
            }
            Err(e) => {
                warn!("Separation failed for {}: {}", job.display_name(), e);
                shared.emit(JobEvent::Failed {
                    id: job.id,
                    message: e.to_string(),
                    stderr: e.stderr().to_string(),
                });
                last_success = None;
            }
        }
    }

    info!("Separation worker idle");
}

/// Run one job, turning a panic into a job error
fn run_isolated(shared: &Shared, job: &SeparationJob) -> Result<PathBuf, JobError> {
    let mut progress = |milestone: Milestone| {
        let percent = milestone.percent();
        shared.state().progress = percent;
        debug!("{}: {}% ({})", job.display_name(), percent, milestone.label());
        shared.emit(JobEvent::Progress {
            id: job.id,
            milestone,
            percent,
        });
    };

    panic::catch_unwind(AssertUnwindSafe(|| shared.runner.run(job, &mut progress))).unwrap_or_else(|payload| {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "separation panicked".to_string());
        Err(JobError::ExternalTool {
            message: format!("Separation panicked: {}", msg),
            stderr: String::new(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::Receiver;
    use std::time::Duration;

    /// Runner that records order and fails/panics on request by title
    struct ScriptedRunner {
        order: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl SeparationRunner for ScriptedRunner {
        fn target_folder(&self, job: &SeparationJob) -> PathBuf {
            PathBuf::from("/nonexistent").join(&job.title)
        }

        fn run(&self, job: &SeparationJob, progress: &mut dyn FnMut(Milestone)) -> Result<PathBuf, JobError> {
            self.order.lock().unwrap().push(job.title.clone());
            thread::sleep(self.delay);
            match job.title.as_str() {
                "fail" => Err(JobError::ExternalTool {
                    message: "exit 1".into(),
                    stderr: "bad input".into(),
                }),
                "panic" => panic!("runner exploded"),
                _ => {
                    for m in Milestone::ALL {
                        progress(m);
                    }
                    Ok(self.target_folder(job))
                }
            }
        }
    }

    fn queue(delay_ms: u64) -> (JobQueue, Arc<ScriptedRunner>, Receiver<JobEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let runner = Arc::new(ScriptedRunner {
            order: Mutex::new(Vec::new()),
            delay: Duration::from_millis(delay_ms),
        });
        let verifier = Verifier::new(Duration::from_millis(5), 2, tx.clone());
        (JobQueue::new(runner.clone(), verifier, tx), runner, rx)
    }

    fn wait_idle(rx: &Receiver<JobEvent>) -> Vec<JobEvent> {
        let mut events = Vec::new();
        loop {
            let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            let done = event == JobEvent::Idle;
            events.push(event);
            if done {
                return events;
            }
        }
    }

    #[test]
    fn test_jobs_run_in_fifo_order() {
        let (queue, runner, rx) = queue(20);
        for title in ["one", "two", "three"] {
            queue.submit(SeparationJob::new("A", title, "/src.mp3"));
        }

        wait_idle(&rx);
        assert_eq!(*runner.order.lock().unwrap(), vec!["one", "two", "three"]);
        assert!(!queue.is_active());
    }

    #[test]
    fn test_failure_does_not_stop_queue() {
        let (queue, runner, rx) = queue(5);
        let bad = queue.submit(SeparationJob::new("A", "fail", "/src.mp3"));
        let crashed = queue.submit(SeparationJob::new("A", "panic", "/src.mp3"));
        queue.submit(SeparationJob::new("A", "good", "/src.mp3"));

        let events = wait_idle(&rx);
        assert_eq!(*runner.order.lock().unwrap(), vec!["fail", "panic", "good"]);

        assert!(events.contains(&JobEvent::Failed {
            id: bad,
            message: "exit 1".into(),
            stderr: "bad input".into(),
        }));
        assert!(events.iter().any(|e| matches!(e, JobEvent::Failed { id, message, .. }
            if *id == crashed && message.contains("runner exploded"))));
        assert!(events.iter().any(|e| matches!(e, JobEvent::Finished { .. })));
    }

    #[test]
    fn test_progress_reaches_100() {
        let (queue, _runner, rx) = queue(0);
        let id = queue.submit(SeparationJob::new("A", "song", "/src.mp3"));

        let events = wait_idle(&rx);
        let percents: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                JobEvent::Progress { id: job, percent, .. } if *job == id => Some(*percent),
                _ => None,
            })
            .collect();
        assert_eq!(percents, vec![5, 15, 17, 26, 83, 95, 100]);
        assert_eq!(queue.snapshot().progress, 100);
    }

    #[test]
    fn test_submit_after_idle_restarts_worker() {
        let (queue, runner, rx) = queue(0);
        queue.submit(SeparationJob::new("A", "first", "/src.mp3"));
        wait_idle(&rx);
        queue.submit(SeparationJob::new("A", "second", "/src.mp3"));
        wait_idle(&rx);
        assert_eq!(runner.order.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_clear_pending_keeps_running_job() {
        let (queue, runner, rx) = queue(100);
        queue.submit(SeparationJob::new("A", "running", "/src.mp3"));
        thread::sleep(Duration::from_millis(30));
        queue.submit(SeparationJob::new("A", "dropped1", "/src.mp3"));
        queue.submit(SeparationJob::new("A", "dropped2", "/src.mp3"));

        assert_eq!(queue.clear_pending(), 2);
        wait_idle(&rx);
        assert_eq!(*runner.order.lock().unwrap(), vec!["running"]);
    }

    #[test]
    fn test_verification_after_last_success() {
        let (queue, _runner, rx) = queue(0);
        queue.submit(SeparationJob::new("A", "song", "/src.mp3"));
        wait_idle(&rx);

        // Folder never gets stems: bounded poll gives up after 2 checks
        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            event,
            JobEvent::VerificationTimeout {
                folder: PathBuf::from("/nonexistent/song"),
                attempts: 2
            }
        );
    }

    #[test]
    fn test_latest_drain_owns_verification() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let runner = Arc::new(ScriptedRunner {
            order: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        });
        let verifier = Verifier::new(Duration::from_millis(100), 2, tx.clone());
        let queue = JobQueue::new(runner, verifier, tx);

        queue.submit(SeparationJob::new("A", "first", "/src.mp3"));
        wait_idle(&rx);
        queue.submit(SeparationJob::new("A", "second", "/src.mp3"));
        wait_idle(&rx);

        let mut verified = Vec::new();
        while let Ok(event) = rx.recv_timeout(Duration::from_millis(500)) {
            if let JobEvent::VerificationTimeout { folder, .. } = event {
                verified.push(folder);
            }
        }
        assert_eq!(verified, vec![PathBuf::from("/nonexistent/second")]);
        assert!(!queue.is_verifying());
    }

    #[test]
    fn test_no_verification_after_failure() {
        let (queue, _runner, rx) = queue(0);
        queue.submit(SeparationJob::new("A", "fail", "/src.mp3"));
        wait_idle(&rx);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_shutdown_joins_worker() {
        let (queue, runner, _rx) = queue(50);
        queue.submit(SeparationJob::new("A", "one", "/src.mp3"));
        queue.submit(SeparationJob::new("A", "two", "/src.mp3"));
        thread::sleep(Duration::from_millis(10));

        queue.shutdown();
        assert!(!queue.is_active());
        assert_eq!(*runner.order.lock().unwrap(), vec!["one"]);
    }
}
