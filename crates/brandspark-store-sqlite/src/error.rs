//! Error type for `brandspark-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error("unknown column value: {0}")]
  UnknownValue(String),

  #[error("invalid database url: {0:?}")]
  InvalidUrl(String),

  /// The pool was never opened or has been closed.
  #[error("database connection is not available")]
  Unavailable,

  #[error("session {0} belongs to another user")]
  OwnershipViolation(uuid::Uuid),

  /// Outcome written for a job that is already terminal (or missing).
  #[error("job {0} is not active")]
  JobNotActive(uuid::Uuid),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<Error> for brandspark_core::Error {
  fn from(e: Error) -> Self {
    match e {
      Error::Unavailable => Self::Unavailable,
      Error::OwnershipViolation(id) => Self::OwnershipViolation(id),
      Error::JobNotActive(id) => Self::Validation(format!("job {id} is not active")),
      Error::InvalidUrl(url) => Self::Validation(format!("invalid database url: {url:?}")),
      Error::Database(tokio_rusqlite::Error::ConnectionClosed) => Self::Unavailable,
      other => Self::Storage(Box::new(other)),
    }
  }
}
