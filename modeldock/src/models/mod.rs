mod job;
mod projection;

pub use job::{
    CancelHandle, CompleteInfo, FailInfo, Job, JobKind, JobMetadata, JobStatus, ProgressUpdate,
    StartInfo
};
pub use projection::{ClientProjection, Step};
