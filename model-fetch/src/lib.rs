//! Async Rust wrapper for the model fetch helper.
//!
//! The helper is an external process that downloads a model snapshot into a
//! directory and reports on stdout with newline-delimited JSON: progress
//! objects tagged `"type": "progress"` while it runs, and a final result
//! object carrying a `success` key before it exits.
//!
//! # Example
//!
//! ```no_run
//! use model_fetch::{FetchEvent, FetchRequest, ModelFetch};
//! use tokio_stream::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> model_fetch::Result<()> {
//!     let mut client = ModelFetch::new();
//!     client.set_script(Some("scripts/fetch_model.py".into()));
//!
//!     let request = FetchRequest::new("acme/7b", "/srv/models/acme--7b", "job-1");
//!     let mut events = client.fetch_with_progress(&request);
//!
//!     while let Some(event) = events.next().await {
//!         if let FetchEvent::Finished(outcome) = event? {
//!             println!("{outcome:?}");
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

mod client;
mod command;
pub mod error;
pub mod types;

pub use client::{ModelFetch, classify_exit, find_result};
pub use error::{Error, Result};
pub use types::{FetchEvent, FetchOutcome, FetchRequest, FetchResult, ProgressLine, format_bytes};
