//! JSON REST API for brandspark.
//!
//! Exposes an axum [`Router`] backed by any [`Gateway`] and
//! [`AnalysisEngine`]. Every route under `/api/v1` requires a bearer token
//! verified by [`auth::JwksVerifier`]; `/health` does not.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/health` | `200` when the database answers, `503` otherwise |
//! | `POST` | `/api/v1/jobs` | Body: `{"prompt":"...","session_id":"<uuid>"}` |
//! | `GET`  | `/api/v1/jobs/{job_id}` | `report` only once `completed` |
//! | `GET`  | `/api/v1/sessions` | Most recently updated first |
//! | `GET`  | `/api/v1/sessions/{id}/messages` | Oldest first; 403 unless owned |

pub mod auth;
pub mod error;
pub mod jobs;
pub mod sessions;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use axum::{
  Json, Router,
  extract::State,
  http::StatusCode,
  response::IntoResponse,
  routing::{get, post},
};
use brandspark_core::{engine::AnalysisEngine, gateway::Gateway};
use brandspark_jobs::JobOrchestrator;
use serde_json::json;
use tower_http::trace::TraceLayer;

pub use auth::{AuthError, CurrentUser, JwksVerifier};
pub use error::ApiError;

// ─── Application state ────────────────────────────────────────────────────────

/// Shared state threaded through all axum handlers.
pub struct AppState<S, E> {
  pub gateway:  Arc<S>,
  pub jobs:     JobOrchestrator<S, E>,
  pub verifier: Arc<JwksVerifier>,
}

impl<S, E> Clone for AppState<S, E> {
  fn clone(&self) -> Self {
    Self {
      gateway:  self.gateway.clone(),
      jobs:     self.jobs.clone(),
      verifier: self.verifier.clone(),
    }
  }
}

// ─── Router ───────────────────────────────────────────────────────────────────

/// Build the full application router for `state`.
pub fn router<S, E>(state: AppState<S, E>) -> Router
where
  S: Gateway + 'static,
  E: AnalysisEngine + 'static,
{
  let api = Router::new()
    .route("/jobs", post(jobs::create::<S, E>))
    .route("/jobs/{job_id}", get(jobs::get_one::<S, E>))
    .route("/sessions", get(sessions::list::<S, E>))
    .route("/sessions/{id}/messages", get(sessions::messages::<S, E>));

  Router::new()
    .route("/health", get(health::<S, E>))
    .nest("/api/v1", api)
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

/// `GET /health`
async fn health<S, E>(State(state): State<AppState<S, E>>) -> impl IntoResponse
where
  S: Gateway + 'static,
  E: AnalysisEngine + 'static,
{
  match state.gateway.ping().await {
    Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
    Err(e) => {
      tracing::warn!(error = %e, "health check failed");
      (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "unavailable" })))
    }
  }
}
