//! Jobs: data model, bounded queue and the sequential worker.

pub mod model;
pub mod queue;
pub mod readiness;
pub mod worker;

pub use model::{
    AcquisitionMode, Job, JobRequest, JobState, JobStatus, PlaybackTarget, PostAction,
};
pub use queue::{CleanupScheduler, JobQueue, QueueRejection};
pub use worker::{Worker, WorkerContext};
