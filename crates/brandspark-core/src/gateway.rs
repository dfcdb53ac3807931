//! The `Gateway` trait: typed persistence operations for users, sessions,
//! messages, jobs and reports.
//!
//! The trait is implemented by storage backends (e.g.
//! `brandspark-store-sqlite`). The orchestrator and the API depend on this
//! abstraction, not on any concrete backend.

use std::future::Future;

use uuid::Uuid;

use crate::{
  Result,
  job::{Job, JobStatus, JobView},
  session::{Message, Report, Role, Session, SessionSummary},
};

/// Abstraction over the relational store.
///
/// Every operation is atomic at the single-statement or single-transaction
/// level. Backends report a torn-down pool as
/// [`Error::Unavailable`](crate::Error::Unavailable).
///
/// All methods return `Send` futures so the trait can be used from spawned
/// tokio tasks and axum handlers.
pub trait Gateway: Send + Sync {
  // ── Users ─────────────────────────────────────────────────────────────

  /// Create the profile row for `user_id` if it does not exist yet.
  ///
  /// Idempotent: concurrent callers racing on the same id all succeed and
  /// exactly one row results. Returns `true` if this call created the row.
  fn ensure_user_profile(
    &self,
    user_id: Uuid,
  ) -> impl Future<Output = Result<bool>> + Send + '_;

  // ── Sessions ──────────────────────────────────────────────────────────

  /// Insert the session if absent, otherwise refresh its title and
  /// `updated_at`.
  ///
  /// Fails with [`Error::OwnershipViolation`](crate::Error::OwnershipViolation)
  /// without mutating anything if the session belongs to another user.
  fn upsert_session(
    &self,
    session_id: Uuid,
    user_id: Uuid,
    title: String,
  ) -> impl Future<Output = Result<Session>> + Send + '_;

  /// The owner of a session, or `None` if the session does not exist.
  fn session_owner(
    &self,
    session_id: Uuid,
  ) -> impl Future<Output = Result<Option<Uuid>>> + Send + '_;

  /// All sessions owned by `user_id`, most recently updated first.
  fn list_sessions(
    &self,
    user_id: Uuid,
  ) -> impl Future<Output = Result<Vec<SessionSummary>>> + Send + '_;

  // ── Messages ──────────────────────────────────────────────────────────

  /// Append one turn to a session transcript.
  fn append_message(
    &self,
    session_id: Uuid,
    user_id: Uuid,
    role: Role,
    content: String,
  ) -> impl Future<Output = Result<Message>> + Send + '_;

  /// All messages of a session, oldest first. Callers are responsible for
  /// checking ownership first (see [`Gateway::session_owner`]).
  fn list_messages(
    &self,
    session_id: Uuid,
  ) -> impl Future<Output = Result<Vec<Message>>> + Send + '_;

  // ── Jobs ──────────────────────────────────────────────────────────────

  /// Insert a job with status [`JobStatus::Pending`] and a fresh id.
  fn create_job(
    &self,
    user_id: Uuid,
    session_id: Uuid,
    prompt: String,
  ) -> impl Future<Output = Result<Job>> + Send + '_;

  /// Update the status column and bump `updated_at`.
  ///
  /// A job already in a terminal state is left untouched; the return value
  /// tells whether a row changed.
  fn set_job_status(
    &self,
    job_id: Uuid,
    status: JobStatus,
  ) -> impl Future<Output = Result<bool>> + Send + '_;

  /// Look a job up by id **and** owner. `None` if absent or not owned.
  ///
  /// The report content is included only when the job is completed.
  fn get_job(
    &self,
    job_id: Uuid,
    user_id: Uuid,
  ) -> impl Future<Output = Result<Option<JobView>>> + Send + '_;

  /// Mark every job still `pending` or `processing` as `failed` and return
  /// their ids. Run once at startup: nothing from a previous process can
  /// still be working on them.
  fn recover_interrupted_jobs(
    &self,
  ) -> impl Future<Output = Result<Vec<Uuid>>> + Send + '_;

  // ── Reports ───────────────────────────────────────────────────────────

  /// Insert the report for a job. At most one report exists per job.
  fn save_report(
    &self,
    job_id: Uuid,
    user_id: Uuid,
    content: String,
  ) -> impl Future<Output = Result<Report>> + Send + '_;

  /// Persist a successful job outcome as one unit: the `agent` message,
  /// then the report, then status `completed`. Either all three writes land
  /// or none do.
  fn record_outcome(
    &self,
    job_id: Uuid,
    user_id: Uuid,
    session_id: Uuid,
    content: String,
  ) -> impl Future<Output = Result<Report>> + Send + '_;

  // ── Health ────────────────────────────────────────────────────────────

  /// Round-trip a trivial statement through the pool.
  fn ping(&self) -> impl Future<Output = Result<()>> + Send + '_;
}
