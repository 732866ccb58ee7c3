//! Post-completion verification poll
//!
//! After the queue drains, the last finished job's folder is checked for all
//! four stems: immediately, then once per interval, for exactly
//! `max_attempts` checks. A new poll cancels the running one (dropping its
//! cancel sender wakes it up).

use std::path::PathBuf;
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};

use super::job::JobEvent;
use crate::resources::audio::missing_stems;

struct Poll {
    cancel: Sender<()>,
    handle: JoinHandle<()>,
}

/// Single-slot verification poller
pub struct Verifier {
    interval: Duration,
    max_attempts: u32,
    events: Sender<JobEvent>,
    current: Mutex<Option<Poll>>,
}

impl Verifier {
    pub fn new(interval: Duration, max_attempts: u32, events: Sender<JobEvent>) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
            events,
            current: Mutex::new(None),
        }
    }

    /// Start polling `folder`, superseding any running poll
    pub fn start(&self, folder: PathBuf) {
        let (cancel, cancelled) = crossbeam_channel::bounded::<()>(0);
        let interval = self.interval;
        let max_attempts = self.max_attempts;
        let events = self.events.clone();

        let spawned = thread::Builder::new()
            .name("stemdeck-verify".into())
            .spawn(move || poll(folder, interval, max_attempts, cancelled, events));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Failed to start verification thread: {}", e);
                return;
            }
        };

        let previous = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Poll { cancel, handle });
        if let Some(previous) = previous {
            debug!("Superseding running verification");
            stop(previous);
        }
    }

    /// Stop the running poll, if any, and wait for its thread
    pub fn cancel(&self) {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(poll) = current {
            stop(poll);
        }
    }

    pub fn is_polling(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|p| !p.handle.is_finished())
    }
}

impl Drop for Verifier {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn stop(poll: Poll) {
    drop(poll.cancel);
    let _ = poll.handle.join();
}

fn poll(folder: PathBuf, interval: Duration, max_attempts: u32, cancelled: Receiver<()>, events: Sender<JobEvent>) {
    for attempt in 1..=max_attempts {
        let missing = missing_stems(&folder);
        if missing.is_empty() {
            info!("Verified stems in {} (check {})", folder.display(), attempt);
            let _ = events.send(JobEvent::Verified {
                folder,
                attempts: attempt,
            });
            let _ = events.send(JobEvent::RescanRequested);
            return;
        }
        debug!(
            "Verification {}/{}: {} missing in {}",
            attempt,
            max_attempts,
            missing.join(", "),
            folder.display()
        );

        if attempt == max_attempts {
            break;
        }
        match cancelled.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => {
                debug!("Verification of {} cancelled", folder.display());
                return;
            }
        }
    }

    warn!(
        "Stems still missing in {} after {} checks",
        folder.display(),
        max_attempts
    );
    let _ = events.send(JobEvent::VerificationTimeout {
        folder,
        attempts: max_attempts,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::audio::tests::make_track;
    use std::time::Instant;

    #[test]
    fn test_present_stems_verified_immediately() {
        let tmp = tempfile::tempdir().unwrap();
        let folder = make_track(tmp.path(), "song");
        let (tx, rx) = crossbeam_channel::unbounded();

        let verifier = Verifier::new(Duration::from_secs(30), 60, tx);
        verifier.start(folder.clone());

        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event, JobEvent::Verified { folder, attempts: 1 });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), JobEvent::RescanRequested);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();

        let verifier = Verifier::new(Duration::from_millis(10), 3, tx);
        let started = Instant::now();
        verifier.start(tmp.path().to_path_buf());

        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            event,
            JobEvent::VerificationTimeout {
                folder: tmp.path().to_path_buf(),
                attempts: 3
            }
        );
        // Two waits between three checks
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stems_appearing_later() {
        let tmp = tempfile::tempdir().unwrap();
        let folder = tmp.path().join("song");
        let (tx, rx) = crossbeam_channel::unbounded();

        let verifier = Verifier::new(Duration::from_millis(50), 100, tx);
        verifier.start(folder.clone());
        thread::sleep(Duration::from_millis(120));
        make_track(tmp.path(), "song");

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            JobEvent::Verified { attempts, .. } => assert!(attempts >= 2),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_new_poll_supersedes_old() {
        let tmp = tempfile::tempdir().unwrap();
        let stale = tmp.path().join("stale");
        let fresh = make_track(tmp.path(), "fresh");
        let (tx, rx) = crossbeam_channel::unbounded();

        let verifier = Verifier::new(Duration::from_secs(30), 60, tx);
        verifier.start(stale);
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        verifier.start(fresh.clone());

        // The stale poll was woken and stopped instead of sleeping 30s
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            JobEvent::Verified {
                folder: fresh,
                attempts: 1
            }
        );
    }

    #[test]
    fn test_cancel_stops_polling() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();

        let verifier = Verifier::new(Duration::from_secs(30), 60, tx);
        verifier.start(tmp.path().join("never"));
        assert!(verifier.is_polling());

        verifier.cancel();
        assert!(!verifier.is_polling());
        assert!(rx.try_recv().is_err());
    }
}
