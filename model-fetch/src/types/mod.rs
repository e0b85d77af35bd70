mod progress;
mod protocol;
mod request;

pub use progress::format_bytes;
pub use protocol::{FetchEvent, FetchOutcome, FetchResult, ProgressLine};
pub use request::FetchRequest;
