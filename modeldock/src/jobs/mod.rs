mod active;
mod registry;
mod sampler;

pub use active::{ActiveClaim, ActiveDownloads, Claim};
pub use registry::{JobRegistry, DEFAULT_JOB_TTL};
pub use sampler::{percent, ProgressSampler, SPEED_SAMPLE_INTERVAL};
