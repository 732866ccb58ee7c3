use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use uuid::Uuid;

use crate::separation::JobEvent;

/// Terminal progress for a batch of separation jobs, with a separate log line
#[derive(Debug)]
pub struct SplitProgress {
    log_line: ProgressBar,
    job_bar: ProgressBar,
    names: HashMap<Uuid, String>,
    finished: usize,
    failed: usize,
}

impl SplitProgress {
    pub fn new(total_jobs: usize) -> Self {
        let multi = MultiProgress::new();

        // Top line for status messages
        let log_line = multi.add(ProgressBar::new_spinner());
        log_line.set_style(
            ProgressStyle::default_spinner()
                .template("{msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        log_line.set_message(format!("Queued {} jobs", total_jobs));

        // Bottom line: milestone percent of the running job
        let job_bar = multi.add(ProgressBar::new(100));
        job_bar.set_style(
            ProgressStyle::default_bar()
                .template("[{bar:40.cyan/blue}] {pos}% | {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓░"),
        );

        Self {
            log_line,
            job_bar,
            names: HashMap::new(),
            finished: 0,
            failed: 0,
        }
    }

    /// Reflect one queue event in the bars
    pub fn update(&mut self, event: &JobEvent) {
        match event {
            JobEvent::Started { id, artist, title } => {
                let name = format!("{} - {}", artist, title);
                self.job_bar.set_position(0);
                self.job_bar.set_message(name.clone());
                self.names.insert(*id, name);
            }
            JobEvent::Progress { milestone, percent, .. } => {
                self.job_bar.set_position(*percent as u64);
                self.log_line.set_message(milestone.label());
            }
            JobEvent::Finished { id, folder } => {
                self.finished += 1;
                self.log_line
                    .set_message(format!("{} -> {}", self.name(id), folder.display()));
            }
            JobEvent::Failed { id, message, .. } => {
                self.failed += 1;
                self.log_line.set_message(format!("{} failed: {}", self.name(id), message));
            }
            JobEvent::Idle => {
                self.job_bar.finish_and_clear();
                self.log_line
                    .set_message(format!("{} finished, {} failed; verifying...", self.finished, self.failed));
            }
            JobEvent::Verified { folder, attempts } => {
                self.log_line.finish_with_message(format!(
                    "Stems verified in {} ({} checks)",
                    folder.display(),
                    attempts
                ));
            }
            JobEvent::VerificationTimeout { folder, attempts } => {
                self.log_line.finish_with_message(format!(
                    "Stems still missing in {} after {} checks",
                    folder.display(),
                    attempts
                ));
            }
            JobEvent::Queued { .. } | JobEvent::RescanRequested => {}
        }
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    /// Stop drawing; leaves the last status line visible
    pub fn finish(&self) {
        self.job_bar.finish_and_clear();
        if !self.log_line.is_finished() {
            self.log_line
                .finish_with_message(format!("{} finished, {} failed", self.finished, self.failed));
        }
    }

    fn name(&self, id: &Uuid) -> &str {
        self.names.get(id).map(String::as_str).unwrap_or("job")
    }
}
