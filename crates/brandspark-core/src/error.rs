//! Error types for `brandspark-core`.

use thiserror::Error;
use uuid::Uuid;

/// Failure of a [`Gateway`](crate::gateway::Gateway) operation.
#[derive(Debug, Error)]
pub enum Error {
  /// The session exists and belongs to another user.
  #[error("session {0} belongs to another user")]
  OwnershipViolation(Uuid),

  /// The connection pool has not been opened, or has been torn down.
  #[error("database connection is not available")]
  Unavailable,

  #[error("validation error: {0}")]
  Validation(String),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("storage error: {0}")]
  Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
