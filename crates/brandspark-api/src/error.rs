//! API error type and [`axum::response::IntoResponse`] implementation.

use axum::{
  Json,
  extract::rejection::{JsonRejection, PathRejection},
  http::{HeaderValue, StatusCode, header},
  response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::auth::AuthError;

/// An error returned by an API handler.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error(transparent)]
  Unauthorized(#[from] AuthError),

  #[error("forbidden: {0}")]
  Forbidden(String),

  #[error("bad request: {0}")]
  BadRequest(String),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("service unavailable")]
  Unavailable,

  #[error("internal error: {0}")]
  Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<brandspark_core::Error> for ApiError {
  fn from(e: brandspark_core::Error) -> Self {
    use brandspark_core::Error as E;
    match e {
      E::OwnershipViolation(_) => ApiError::Forbidden("session belongs to another user".into()),
      E::Unavailable => ApiError::Unavailable,
      E::Validation(m) => ApiError::BadRequest(m),
      E::NotFound(m) => ApiError::NotFound(m),
      E::Storage(e) => ApiError::Internal(e),
    }
  }
}

impl From<JsonRejection> for ApiError {
  fn from(rejection: JsonRejection) -> Self { ApiError::BadRequest(rejection.body_text()) }
}

impl From<PathRejection> for ApiError {
  fn from(rejection: PathRejection) -> Self { ApiError::BadRequest(rejection.body_text()) }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let (status, message) = match &self {
      ApiError::Unauthorized(e) if e.is_credential_problem() => {
        tracing::debug!(error = %e, "rejected credential");
        let mut res =
          (StatusCode::UNAUTHORIZED, Json(json!({ "error": e.to_string() }))).into_response();
        res
          .headers_mut()
          .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        return res;
      }
      ApiError::Unauthorized(e) => {
        tracing::error!(error = %e, "credential verification unavailable");
        (StatusCode::INTERNAL_SERVER_ERROR, "authentication is unavailable".to_owned())
      }
      ApiError::Forbidden(m) => (StatusCode::FORBIDDEN, m.clone()),
      ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
      ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
      ApiError::Unavailable => {
        (StatusCode::SERVICE_UNAVAILABLE, "database is unavailable".to_owned())
      }
      ApiError::Internal(e) => {
        tracing::error!(error = %e, "internal error");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_owned())
      }
    };
    (status, Json(json!({ "error": message }))).into_response()
  }
}
