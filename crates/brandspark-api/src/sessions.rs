//! Handlers for `/sessions` endpoints.

use axum::{
  Json,
  extract::{Path, State, rejection::PathRejection},
};
use brandspark_core::{
  engine::AnalysisEngine,
  gateway::Gateway,
  session::{Message, Role, SessionSummary},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AppState, auth::CurrentUser, error::ApiError};

/// `GET /sessions`
pub async fn list<S, E>(
  State(state): State<AppState<S, E>>,
  user: CurrentUser,
) -> Result<Json<Vec<SessionSummary>>, ApiError>
where
  S: Gateway + 'static,
  E: AnalysisEngine + 'static,
{
  Ok(Json(state.gateway.list_sessions(user.id).await?))
}

/// One transcript entry as returned to clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageView {
  pub role:       Role,
  pub content:    String,
  pub created_at: DateTime<Utc>,
}

impl From<Message> for MessageView {
  fn from(m: Message) -> Self {
    Self { role: m.role, content: m.content, created_at: m.created_at }
  }
}

/// `GET /sessions/{id}/messages`
pub async fn messages<S, E>(
  State(state): State<AppState<S, E>>,
  user: CurrentUser,
  session_id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Vec<MessageView>>, ApiError>
where
  S: Gateway + 'static,
  E: AnalysisEngine + 'static,
{
  let Path(session_id) = session_id?;

  // An unknown session is reported the same way as a foreign one.
  if state.gateway.session_owner(session_id).await? != Some(user.id) {
    return Err(ApiError::Forbidden(format!(
      "session {session_id} does not belong to the caller"
    )));
  }

  let messages = state.gateway.list_messages(session_id).await?;
  Ok(Json(messages.into_iter().map(MessageView::from).collect()))
}
