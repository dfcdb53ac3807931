//! The narrow contract between the job orchestrator and the analysis engine:
//! a prompt goes in, a stream of response events comes out.

use std::future::Future;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
  /// A conversation context already exists for this (user, session) pair.
  #[error("conversation context already exists for session {0}")]
  ContextExists(Uuid),

  #[error("no conversation context for session {0}")]
  NoSuchContext(Uuid),

  #[error("generation failed: {0}")]
  Generation(String),

  #[error("template error: {0}")]
  Template(String),

  #[error("pipeline error: {0}")]
  Pipeline(String),
}

/// One invocation of the analysis pipeline.
#[derive(Debug, Clone)]
pub struct EngineRequest {
  pub user_id:    Uuid,
  pub session_id: Uuid,
  pub prompt:     String,
}

/// A response event emitted while the engine works.
///
/// Only an event with `is_final` set carries a usable answer; earlier events
/// are progress (one per completed stage).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
  /// Name of the stage (or of the engine) that produced the event.
  pub author:   String,
  /// Text fragments, in order.
  pub parts:    Vec<String>,
  pub is_final: bool,
}

impl EngineEvent {
  /// All text fragments joined with no separator.
  pub fn text(&self) -> String { self.parts.concat() }
}

/// A multi-stage text-generation pipeline with per-(user, session)
/// conversation state.
pub trait AnalysisEngine: Send + Sync {
  /// Create the engine-side conversation context for `(user_id,
  /// session_id)`. Fails with [`EngineError::ContextExists`] if one is
  /// already present.
  fn create_context(
    &self,
    user_id: Uuid,
    session_id: Uuid,
  ) -> impl Future<Output = Result<(), EngineError>> + Send + '_;

  /// Run the pipeline for `request`.
  fn run(
    &self,
    request: EngineRequest,
  ) -> BoxStream<'_, Result<EngineEvent, EngineError>>;

  /// Copy the conversation context into the user's long-term memory.
  fn archive_context(
    &self,
    user_id: Uuid,
    session_id: Uuid,
  ) -> impl Future<Output = Result<(), EngineError>> + Send + '_;
}
