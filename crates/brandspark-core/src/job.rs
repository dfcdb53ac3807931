//! Jobs: one asynchronous execution of the analysis pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The lifecycle state of a job.
///
/// `pending → processing → {completed | failed}`. Terminal states never
/// transition further.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
  strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
  Pending,
  Processing,
  Completed,
  Failed,
}

impl JobStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Completed | Self::Failed)
  }
}

/// A persisted job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
  pub job_id:     Uuid,
  pub user_id:    Uuid,
  pub session_id: Uuid,
  pub prompt:     String,
  pub status:     JobStatus,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// What a poller is allowed to see about one of its jobs.
///
/// `report` is only ever populated when `status` is
/// [`JobStatus::Completed`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
  pub job_id: Uuid,
  pub status: JobStatus,
  pub report: Option<String>,
}
