//! Download job tracking for model snapshots and single files.
//!
//! Downloads run as [`jobs::JobRegistry`] jobs. Every state change is
//! published as a full snapshot on the [`events::EventBus`], and the
//! [`rooms::RoomBroadcaster`] forwards those snapshots to WebSocket rooms
//! named `download:<job id>`.

pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod jobs;
pub mod models;
pub mod rooms;
pub mod state;
mod sync;
pub mod workers;

use axum::{
    routing::{get, post},
    Router
};

use handlers::{api, ws};
use state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/models", post(api::start_model_download))
        .route("/api/files", post(api::start_file_download))
        .route("/api/jobs", get(api::list_jobs))
        .route("/api/jobs/{id}", get(api::get_job))
        .route("/api/jobs/{id}/cancel", post(api::cancel_job))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}
