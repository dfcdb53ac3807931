//! Handlers for `/jobs` endpoints.

use axum::{
  Json,
  extract::{Path, State, rejection::{JsonRejection, PathRejection}},
};
use brandspark_core::{
  engine::AnalysisEngine,
  gateway::Gateway,
  job::{JobStatus, JobView},
  session::title_from_prompt,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AppState, auth::CurrentUser, error::ApiError};

/// Shortest prompt accepted, in characters.
pub const MIN_PROMPT_CHARS: usize = 2;

// ─── Create ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateBody {
  pub prompt:     String,
  /// Client-generated; parsed here so a bad id is a 400, not a 422.
  pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateResponse {
  pub job_id: Uuid,
  pub status: JobStatus,
}

/// `POST /jobs`: record a pending job and start it in the background.
pub async fn create<S, E>(
  State(state): State<AppState<S, E>>,
  user: CurrentUser,
  body: Result<Json<CreateBody>, JsonRejection>,
) -> Result<Json<CreateResponse>, ApiError>
where
  S: Gateway + 'static,
  E: AnalysisEngine + 'static,
{
  let Json(body) = body?;

  if body.prompt.chars().count() < MIN_PROMPT_CHARS {
    return Err(ApiError::BadRequest(format!(
      "prompt must be at least {MIN_PROMPT_CHARS} characters"
    )));
  }
  let session_id = Uuid::parse_str(body.session_id.trim())
    .map_err(|_| ApiError::BadRequest("session_id must be a UUID".into()))?;

  state
    .gateway
    .upsert_session(session_id, user.id, title_from_prompt(&body.prompt))
    .await?;
  let job = state
    .gateway
    .create_job(user.id, session_id, body.prompt)
    .await?;

  // Detached: the task belongs to the orchestrator.
  state.jobs.dispatch(&job)?;
  tracing::info!(
    job_id = %job.job_id,
    %session_id,
    user_id = %user.id,
    status = %job.status,
    "job accepted"
  );

  Ok(Json(CreateResponse { job_id: job.job_id, status: job.status }))
}

// ─── Get one ──────────────────────────────────────────────────────────────────

/// `GET /jobs/{job_id}`: 404 unless the job exists and belongs to the caller.
pub async fn get_one<S, E>(
  State(state): State<AppState<S, E>>,
  user: CurrentUser,
  job_id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<JobView>, ApiError>
where
  S: Gateway + 'static,
  E: AnalysisEngine + 'static,
{
  let Path(job_id) = job_id?;
  let view = state
    .gateway
    .get_job(job_id, user.id)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("job {job_id} not found")))?;
  Ok(Json(view))
}
