//! Background stem separation: job model, pipeline, queue and verification

pub mod job;
pub mod pipeline;
pub mod queue;
pub mod verify;

pub use job::{JobError, JobEvent, Milestone, SeparationJob};
pub use pipeline::{DemucsPipeline, PipelineSettings, SeparationRunner};
pub use queue::{JobQueue, QueueSnapshot};
pub use verify::Verifier;
