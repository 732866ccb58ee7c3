//! Separation pipeline: one job from source file to playable stem folder
//!
//! Steps, each followed by its milestone:
//! 1. create `<library>/<artist>/<title>/`
//! 2. extract the embedded cover to `cover.png` (failure only logged)
//! 3. write the `data.json` descriptor
//! 4. run the external tool under a hard timeout
//! 5. move the stems from the tool's nested output into `separated/`
//! 6. report completion
//!
//! The tool is an opaque subprocess invoked as
//! `<tool> <args...> -n <model> -o <folder>/separated --mp3 <source>`.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use super::job::{JobError, Milestone, SeparationJob};
use crate::config::LoadingConfig;
use crate::playlist::write_descriptor;
use crate::resources::audio::{SEPARATED_DIR, Stem, missing_stems};
use crate::resources::image::{COVER_FILE, save_embedded_cover};

/// How often the child process is polled while waiting
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runs one job to completion on the calling thread
pub trait SeparationRunner: Send + Sync {
    /// Folder a job's stems end up in
    fn target_folder(&self, job: &SeparationJob) -> PathBuf;

    /// Run every step, reporting milestones through `progress`.
    ///
    /// Returns the track folder on success.
    fn run(&self, job: &SeparationJob, progress: &mut dyn FnMut(Milestone)) -> Result<PathBuf, JobError>;
}

/// Tool invocation and layout settings
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub library_dir: PathBuf,
    pub tool: String,
    pub tool_args: Vec<String>,
    pub model: String,
    pub tool_timeout: Duration,
    pub cover_size: (u32, u32),
}

impl From<&LoadingConfig> for PipelineSettings {
    fn from(config: &LoadingConfig) -> Self {
        Self {
            library_dir: config.library_dir.clone(),
            tool: config.separation_tool.clone(),
            tool_args: config.separation_tool_args.clone(),
            model: config.separation_model.clone(),
            tool_timeout: config.tool_timeout(),
            cover_size: config.cover_size,
        }
    }
}

/// Default runner driving a demucs-compatible command line tool
#[derive(Debug, Clone)]
pub struct DemucsPipeline {
    settings: PipelineSettings,
}

impl DemucsPipeline {
    pub fn new(settings: PipelineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    fn command(&self, job: &SeparationJob, folder: &Path) -> Command {
        let mut cmd = Command::new(&self.settings.tool);
        cmd.args(&self.settings.tool_args)
            .arg("-n")
            .arg(&self.settings.model)
            .arg("-o")
            .arg(folder.join(SEPARATED_DIR))
            .arg("--mp3")
            .arg(&job.source)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }

    /// Run the tool, killing it past the timeout
    fn run_tool(&self, job: &SeparationJob, folder: &Path) -> Result<(), JobError> {
        let mut cmd = self.command(job, folder);
        debug!("Running {:?}", cmd);

        let mut child = cmd.spawn().map_err(|e| JobError::ExternalTool {
            message: format!("Failed to start {}: {}", self.settings.tool, e),
            stderr: String::new(),
        })?;

        let stderr_lines = Arc::new(Mutex::new(Vec::new()));
        let reader = child.stderr.take().map(|stderr| {
            let lines = Arc::clone(&stderr_lines);
            let tool = self.settings.tool.clone();
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    trace!("[{}] {}", tool, line);
                    lines.lock().unwrap_or_else(|e| e.into_inner()).push(line);
                }
            })
        });

        let status = wait_with_timeout(&mut child, self.settings.tool_timeout);

        // A killed tool may leave grandchildren holding the pipe open
        if let (Ok(Some(_)), Some(reader)) = (&status, reader) {
            let _ = reader.join();
        }
        let stderr = stderr_lines.lock().unwrap_or_else(|e| e.into_inner()).join("\n");

        match status {
            Ok(Some(status)) if status.success() => Ok(()),
            Ok(Some(status)) => Err(JobError::ExternalTool {
                message: format!("{} exited with {}", self.settings.tool, status),
                stderr,
            }),
            Ok(None) => {
                warn!(
                    "{} exceeded {}s, killed",
                    self.settings.tool,
                    self.settings.tool_timeout.as_secs()
                );
                Err(JobError::Timeout(self.settings.tool_timeout))
            }
            Err(e) => Err(JobError::ExternalTool {
                message: format!("Failed to wait for {}: {}", self.settings.tool, e),
                stderr,
            }),
        }
    }

    /// Move stems from `separated/<model>/<name>/` into `separated/`
    fn organize_output(&self, job: &SeparationJob, folder: &Path) -> Result<(), JobError> {
        let model_dir = folder.join(SEPARATED_DIR).join(&self.settings.model);
        let source_stem = job
            .source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let output_dir = [model_dir.join(&source_stem), model_dir.join(&job.title)]
            .into_iter()
            .find(|dir| dir.is_dir())
            .ok_or_else(|| JobError::OutputMissing {
                path: model_dir.join(&source_stem),
                missing: Stem::ALL.iter().map(|s| s.file_name()).collect(),
            })?;

        let missing: Vec<String> = Stem::ALL
            .iter()
            .map(|s| s.file_name())
            .filter(|name| !output_dir.join(name).is_file())
            .collect();
        if !missing.is_empty() {
            return Err(JobError::OutputMissing {
                path: output_dir,
                missing,
            });
        }

        let target = folder.join(SEPARATED_DIR);
        for stem in Stem::ALL {
            let name = stem.file_name();
            move_file(&output_dir.join(&name), &target.join(&name))?;
        }

        std::fs::remove_dir_all(&model_dir)
            .map_err(|e| JobError::io(format!("Failed to remove {}", model_dir.display()), e))?;

        let still_missing = missing_stems(folder);
        if !still_missing.is_empty() {
            return Err(JobError::OutputMissing {
                path: target,
                missing: still_missing,
            });
        }
        Ok(())
    }
}

impl SeparationRunner for DemucsPipeline {
    fn target_folder(&self, job: &SeparationJob) -> PathBuf {
        self.settings.library_dir.join(&job.artist).join(&job.title)
    }

    fn run(&self, job: &SeparationJob, progress: &mut dyn FnMut(Milestone)) -> Result<PathBuf, JobError> {
        let started = Instant::now();
        let folder = self.target_folder(job);
        info!("Separating {} -> {}", job.display_name(), folder.display());

        if !job.source.is_file() {
            return Err(JobError::io(
                "Source not found",
                job.source.display(),
            ));
        }

        std::fs::create_dir_all(&folder)
            .map_err(|e| JobError::io(format!("Failed to create {}", folder.display()), e))?;
        progress(Milestone::StructureCreated);

        match save_embedded_cover(&job.source, &folder.join(COVER_FILE), self.settings.cover_size) {
            Ok(true) => debug!("Cover extracted for {}", job.display_name()),
            Ok(false) => debug!("No embedded cover in {}", job.source.display()),
            Err(e) => warn!("Cover extraction failed: {:#}", e),
        }
        progress(Milestone::CoverExtracted);

        write_descriptor(&folder, &job.artist, &job.title).map_err(|e| JobError::Io(format!("{:#}", e)))?;
        progress(Milestone::DescriptorWritten);

        progress(Milestone::ToolStarted);
        self.run_tool(job, &folder)?;
        progress(Milestone::ToolFinished);

        self.organize_output(job, &folder)?;
        progress(Milestone::FilesOrganized);

        info!(
            "Separated {} in {:.1}s",
            job.display_name(),
            started.elapsed().as_secs_f64()
        );
        progress(Milestone::Completed);
        Ok(folder)
    }
}

/// Wait for the child; Ok(None) if it was killed after `timeout`
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> std::io::Result<Option<std::process::ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL.min(timeout));
    }
}

/// Rename, falling back to copy + delete across filesystems
fn move_file(from: &Path, to: &Path) -> Result<(), JobError> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to)
        .map_err(|e| JobError::io(format!("Failed to move {} to {}", from.display(), to.display()), e))?;
    std::fs::remove_file(from).map_err(|e| JobError::io(format!("Failed to remove {}", from.display()), e))
}
