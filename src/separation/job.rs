//! Separation job, its progress milestones, errors and events

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

/// Request to split one source file into stems
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeparationJob {
    pub id: Uuid,
    pub artist: String,
    pub title: String,
    pub source: PathBuf,
}

impl SeparationJob {
    pub fn new(artist: impl Into<String>, title: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            artist: artist.into(),
            title: title.into(),
            source: source.into(),
        }
    }

    pub fn display_name(&self) -> String {
        format!("{} - {}", self.artist, self.title)
    }
}

/// Pipeline checkpoints, reported in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Milestone {
    StructureCreated,
    CoverExtracted,
    DescriptorWritten,
    ToolStarted,
    ToolFinished,
    FilesOrganized,
    Completed,
}

impl Milestone {
    pub const ALL: [Milestone; 7] = [
        Milestone::StructureCreated,
        Milestone::CoverExtracted,
        Milestone::DescriptorWritten,
        Milestone::ToolStarted,
        Milestone::ToolFinished,
        Milestone::FilesOrganized,
        Milestone::Completed,
    ];

    pub fn percent(self) -> u8 {
        match self {
            Milestone::StructureCreated => 5,
            Milestone::CoverExtracted => 15,
            Milestone::DescriptorWritten => 17,
            Milestone::ToolStarted => 26,
            Milestone::ToolFinished => 83,
            Milestone::FilesOrganized => 95,
            Milestone::Completed => 100,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Milestone::StructureCreated => "folder created",
            Milestone::CoverExtracted => "cover extracted",
            Milestone::DescriptorWritten => "descriptor written",
            Milestone::ToolStarted => "separating",
            Milestone::ToolFinished => "separation finished",
            Milestone::FilesOrganized => "stems organized",
            Milestone::Completed => "done",
        }
    }
}

/// Job failures. All are fatal for the job, never for the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum JobError {
    /// Filesystem step failed
    Io(String),
    /// Tool could not start or exited unsuccessfully
    ExternalTool { message: String, stderr: String },
    /// Tool exceeded `tool_timeout_secs` and was killed
    Timeout(Duration),
    /// Tool succeeded but expected stems are absent
    OutputMissing { path: PathBuf, missing: Vec<String> },
}

impl JobError {
    pub fn io(context: impl fmt::Display, err: impl fmt::Display) -> Self {
        JobError::Io(format!("{}: {}", context, err))
    }

    /// Captured tool stderr, empty for other errors
    pub fn stderr(&self) -> &str {
        match self {
            JobError::ExternalTool { stderr, .. } => stderr,
            _ => "",
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::Io(e) => write!(f, "I/O error: {}", e),
            JobError::ExternalTool { message, .. } => write!(f, "{}", message),
            JobError::Timeout(d) => write!(f, "Separation timed out after {}s", d.as_secs()),
            JobError::OutputMissing { path, missing } => {
                write!(f, "Separation output missing in {}: {}", path.display(), missing.join(", "))
            }
        }
    }
}

impl std::error::Error for JobError {}

/// Messages from the queue and verifier to the interactive thread
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum JobEvent {
    Queued { id: Uuid, position: usize },
    Started { id: Uuid, artist: String, title: String },
    Progress { id: Uuid, milestone: Milestone, percent: u8 },
    Finished { id: Uuid, folder: PathBuf },
    Failed { id: Uuid, message: String, stderr: String },
    /// Library changed on disk, rescan the playlist
    RescanRequested,
    /// All stems confirmed present at `folder`
    Verified { folder: PathBuf, attempts: u32 },
    VerificationTimeout { folder: PathBuf, attempts: u32 },
    /// Queue drained, worker exited
    Idle,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_milestones_increase() {
        let percents: Vec<u8> = Milestone::ALL.iter().map(|m| m.percent()).collect();
        assert_eq!(percents, vec![5, 15, 17, 26, 83, 95, 100]);
        assert!(Milestone::ToolStarted < Milestone::ToolFinished);
    }

    #[test]
    fn test_job_ids_unique() {
        let a = SeparationJob::new("A", "B", "/tmp/a.mp3");
        let b = SeparationJob::new("A", "B", "/tmp/a.mp3");
        assert_ne!(a.id, b.id);
        assert_eq!(a.display_name(), "A - B");
    }

    #[test]
    fn test_error_display() {
        let err = JobError::ExternalTool {
            message: "demucs exited with status 1".into(),
            stderr: "CUDA out of memory".into(),
        };
        assert_eq!(err.to_string(), "demucs exited with status 1");
        assert_eq!(err.stderr(), "CUDA out of memory");
        assert_eq!(JobError::Timeout(Duration::from_secs(7200)).to_string(), "Separation timed out after 7200s");
    }
}
