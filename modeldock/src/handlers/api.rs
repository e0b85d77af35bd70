use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json
};

use crate::error::AppError;
use crate::models::Job;
use crate::state::AppState;
use crate::workers::{FileRequest, ModelRequest, StartOutcome};

fn accepted(outcome: StartOutcome) -> (StatusCode, Json<StartOutcome>) {
    let status = if outcome.already_in_progress {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    (status, Json(outcome))
}

#[tracing::instrument(skip_all)]
pub async fn start_model_download(
    State(state): State<AppState>,
    Json(input): Json<ModelRequest>
) -> Result<(StatusCode, Json<StartOutcome>), AppError> {
    tracing::info!("Model download requested: {}", input.model_id);
    let outcome = state.models.start(input).await?;
    Ok(accepted(outcome))
}

#[tracing::instrument(skip_all)]
pub async fn start_file_download(
    State(state): State<AppState>,
    Json(input): Json<FileRequest>
) -> Result<(StatusCode, Json<StartOutcome>), AppError> {
    tracing::info!("File download requested: {}", input.url);
    let outcome = state.files.start(input)?;
    Ok(accepted(outcome))
}

pub async fn list_jobs(State(state): State<AppState>) -> Json<Vec<Job>> {
    Json(state.registry.all())
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>
) -> Result<Json<Job>, AppError> {
    state
        .registry
        .get(&id)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("Job {id} not found")))
}

#[tracing::instrument(skip(state))]
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>
) -> Result<Json<serde_json::Value>, AppError> {
    let Some(job) = state.registry.get(&id) else {
        return Err(AppError::not_found(format!("Job {id} not found")));
    };

    if !state.registry.cancel(&id) {
        return Err(AppError::conflict(format!("Job {id} already {}", job.status)));
    }

    tracing::info!("Cancel requested for job {}", id);
    Ok(Json(serde_json::json!({
        "jobId": id,
        "cancelled": true
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CompleteInfo, JobKind, JobMetadata, JobStatus};
    use crate::state::test_state;

    #[tokio::test]
    async fn test_get_unknown_job_is_not_found() {
        let (state, _dir) = test_state();
        let err = get_job(State(state), Path("nope".to_string())).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_registered_job() {
        let (state, _dir) = test_state();
        state
            .registry
            .register("j1", JobMetadata::new("acme/7b", JobKind::Model))
            .unwrap();

        let Json(body) = cancel_job(State(state.clone()), Path("j1".to_string())).await.unwrap();
        assert_eq!(body["cancelled"], true);
        assert!(state.registry.get("j1").is_none_or(|j| j.status == JobStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_finished_job_conflicts() {
        let (state, _dir) = test_state();
        state
            .registry
            .register("j1", JobMetadata::new("acme/7b", JobKind::Model))
            .unwrap();
        state.registry.complete("j1", CompleteInfo::default()).unwrap();

        let err = cancel_job(State(state), Path("j1".to_string())).await.unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert!(err.message.contains("completed"));
    }

    #[tokio::test]
    async fn test_invalid_model_request_is_bad_request() {
        let (state, _dir) = test_state();
        let err = start_model_download(State(state), Json(ModelRequest::new("")))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_jobs_is_sorted() {
        let (state, _dir) = test_state();
        for id in ["b", "a"] {
            state
                .registry
                .register(id, JobMetadata::new("acme/7b", JobKind::Model))
                .unwrap();
        }
        let Json(jobs) = list_jobs(State(state)).await;
        let ids: Vec<_> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
