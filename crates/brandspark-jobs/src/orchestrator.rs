use std::{
  collections::HashMap,
  sync::{Arc, Mutex, MutexGuard, PoisonError},
  time::Duration,
};

use brandspark_core::{
  engine::{AnalysisEngine, EngineError, EngineRequest},
  gateway::Gateway,
  job::{Job, JobStatus},
  session::Role,
};
use futures::StreamExt as _;
use tokio::{
  sync::Semaphore,
  task::{AbortHandle, JoinHandle},
};
use tokio_util::task::TaskTracker;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
  /// Jobs allowed in `processing` at once; later jobs wait in `pending`.
  pub max_concurrent_jobs: usize,
  /// Wall-clock limit for one job, measured from when it gets a permit.
  pub job_timeout:         Option<Duration>,
}

impl Default for OrchestratorConfig {
  fn default() -> Self {
    Self { max_concurrent_jobs: 8, job_timeout: None }
  }
}

/// Why a job ended in `failed`.
#[derive(Debug, thiserror::Error)]
enum Failure {
  #[error("no analysis engine is configured")]
  NoEngine,
  #[error(transparent)]
  Engine(#[from] EngineError),
  #[error(transparent)]
  Store(#[from] brandspark_core::Error),
  #[error("engine produced no final output")]
  EmptyOutput,
  #[error("job exceeded its {0:?} time limit")]
  TimedOut(Duration),
}

/// The fields of a [`Job`] the background task needs.
#[derive(Debug, Clone)]
struct JobTask {
  job_id:     Uuid,
  user_id:    Uuid,
  session_id: Uuid,
  prompt:     String,
}

/// A dispatched job's task. Dropping it detaches the task.
#[derive(Debug)]
pub struct JobHandle {
  job_id: Uuid,
  handle: JoinHandle<JobStatus>,
}

impl JobHandle {
  pub fn job_id(&self) -> Uuid { self.job_id }

  /// Wait for the task. An aborted or panicked task counts as failed.
  pub async fn join(self) -> JobStatus {
    self.handle.await.unwrap_or(JobStatus::Failed)
  }
}

struct Inner<S, E> {
  gateway: Arc<S>,
  engine:  Option<Arc<E>>,
  tracker: TaskTracker,
  permits: Arc<Semaphore>,
  running: Mutex<HashMap<Uuid, AbortHandle>>,
  timeout: Option<Duration>,
}

/// Runs jobs through `pending → processing → {completed | failed}`.
///
/// Cheap to clone; clones share tasks, permits and abort handles.
pub struct JobOrchestrator<S, E> {
  inner: Arc<Inner<S, E>>,
}

impl<S, E> Clone for JobOrchestrator<S, E> {
  fn clone(&self) -> Self { Self { inner: self.inner.clone() } }
}

impl<S, E> JobOrchestrator<S, E>
where
  S: Gateway + 'static,
  E: AnalysisEngine + 'static,
{
  /// `engine` may be `None`, in which case every job fails.
  pub fn new(gateway: Arc<S>, engine: Option<Arc<E>>, config: OrchestratorConfig) -> Self {
    Self {
      inner: Arc::new(Inner {
        gateway,
        engine,
        tracker: TaskTracker::new(),
        permits: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
        running: Mutex::new(HashMap::new()),
        timeout: config.job_timeout,
      }),
    }
  }

  fn running(&self) -> MutexGuard<'_, HashMap<Uuid, AbortHandle>> {
    self.inner.running.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Number of dispatched jobs whose task has not finished.
  pub fn in_flight(&self) -> usize { self.inner.tracker.len() }

  /// Schedule `job` for background execution. Fails with
  /// [`brandspark_core::Error::Unavailable`] once shutdown has begun.
  pub fn dispatch(&self, job: &Job) -> brandspark_core::Result<JobHandle> {
    if self.inner.tracker.is_closed() {
      return Err(brandspark_core::Error::Unavailable);
    }

    let task = JobTask {
      job_id:     job.job_id,
      user_id:    job.user_id,
      session_id: job.session_id,
      prompt:     job.prompt.clone(),
    };
    let job_id = task.job_id;
    let this = self.clone();

    // Registered under the lock so the task cannot deregister first.
    let mut running = self.running();
    let handle = self.inner.tracker.spawn(async move { this.execute(task).await });
    running.insert(job_id, handle.abort_handle());
    drop(running);

    tracing::debug!(%job_id, "job dispatched");
    Ok(JobHandle { job_id, handle })
  }

  /// Abort a running job and mark it failed. Returns `false` if the job is
  /// not running on this orchestrator.
  pub async fn cancel(&self, job_id: Uuid) -> bool {
    let Some(handle) = self.running().remove(&job_id) else {
      return false;
    };
    handle.abort();
    self.mark(job_id, JobStatus::Failed).await;
    tracing::info!(%job_id, status = %JobStatus::Failed, "job cancelled");
    true
  }

  /// Stop accepting jobs, wait up to `grace` for running ones, then abort
  /// whatever is left. Aborted jobs stay non-terminal until the next
  /// startup recovery sweep.
  pub async fn shutdown(&self, grace: Duration) {
    self.inner.tracker.close();
    let pending = self.inner.tracker.len();
    if pending == 0 {
      return;
    }

    tracing::info!(pending, ?grace, "waiting for running jobs");
    if tokio::time::timeout(grace, self.inner.tracker.wait()).await.is_ok() {
      return;
    }

    let handles: Vec<(Uuid, AbortHandle)> = self.running().drain().collect();
    tracing::warn!(count = handles.len(), "aborting jobs still running after grace period");
    for (job_id, handle) in handles {
      tracing::warn!(%job_id, "job aborted at shutdown");
      handle.abort();
    }
    self.inner.tracker.wait().await;
  }

  async fn execute(self, task: JobTask) -> JobStatus {
    let job_id = task.job_id;

    let status = match self.inner.permits.clone().acquire_owned().await {
      Ok(_permit) => {
        let outcome = match self.inner.timeout {
          Some(limit) => tokio::time::timeout(limit, self.process(&task))
            .await
            .unwrap_or(Err(Failure::TimedOut(limit))),
          None => self.process(&task).await,
        };

        match outcome {
          Ok(()) => JobStatus::Completed,
          Err(failure) => self.fail(&task, failure).await,
        }
      }
      Err(_) => {
        tracing::warn!(%job_id, "job permits closed");
        self.mark(job_id, JobStatus::Failed).await;
        JobStatus::Failed
      }
    };

    self.running().remove(&job_id);
    tracing::info!(
      %job_id,
      session_id = %task.session_id,
      user_id = %task.user_id,
      %status,
      "job finished"
    );
    status
  }

  /// Record `failure` and return the status the job actually ended in. A
  /// timeout can fire after the outcome write has already committed, in
  /// which case the stored terminal status wins.
  async fn fail(&self, task: &JobTask, failure: Failure) -> JobStatus {
    let status = if self.mark(task.job_id, JobStatus::Failed).await {
      JobStatus::Failed
    } else {
      self.stored_status(task).await.unwrap_or(JobStatus::Failed)
    };

    if status == JobStatus::Failed {
      tracing::warn!(
        job_id = %task.job_id,
        session_id = %task.session_id,
        user_id = %task.user_id,
        error = %failure,
        "job failed"
      );
    } else {
      tracing::info!(
        job_id = %task.job_id,
        %status,
        error = %failure,
        "job reached a terminal status before its failure was recorded"
      );
    }
    status
  }

  /// The job's stored status, if it is terminal and readable.
  async fn stored_status(&self, task: &JobTask) -> Option<JobStatus> {
    match self.inner.gateway.get_job(task.job_id, task.user_id).await {
      Ok(view) => view.map(|v| v.status).filter(JobStatus::is_terminal),
      Err(e) => {
        tracing::warn!(job_id = %task.job_id, error = %e, "failed to read job status");
        None
      }
    }
  }

  /// The body of one job. Any `Err` leaves the job to be marked failed.
  async fn process(&self, task: &JobTask) -> Result<(), Failure> {
    let gateway = &self.inner.gateway;

    self.mark(task.job_id, JobStatus::Processing).await;
    let engine = self.inner.engine.as_ref().ok_or(Failure::NoEngine)?;

    match engine.create_context(task.user_id, task.session_id).await {
      Ok(()) => {}
      Err(EngineError::ContextExists(_)) => {
        tracing::debug!(session_id = %task.session_id, "engine context already exists");
      }
      Err(e) => return Err(e.into()),
    }

    gateway
      .append_message(task.session_id, task.user_id, Role::User, task.prompt.clone())
      .await?;

    let request = EngineRequest {
      user_id:    task.user_id,
      session_id: task.session_id,
      prompt:     task.prompt.clone(),
    };
    let mut events = engine.run(request);
    let mut output = None;
    while let Some(event) = events.next().await {
      let event = event?;
      if event.is_final {
        output = Some(event.text());
      } else {
        tracing::debug!(job_id = %task.job_id, author = %event.author, "engine progress");
      }
    }
    drop(events);

    let output = output
      .filter(|text| !text.trim().is_empty())
      .ok_or(Failure::EmptyOutput)?;

    if let Err(e) = engine.archive_context(task.user_id, task.session_id).await {
      tracing::warn!(
        job_id = %task.job_id,
        session_id = %task.session_id,
        error = %e,
        "failed to archive conversation; continuing"
      );
    }

    gateway
      .record_outcome(task.job_id, task.user_id, task.session_id, output)
      .await?;
    Ok(())
  }

  /// Best-effort status write: failures are logged and swallowed. Returns
  /// whether the row changed.
  async fn mark(&self, job_id: Uuid, status: JobStatus) -> bool {
    match self.inner.gateway.set_job_status(job_id, status).await {
      Ok(true) => {
        tracing::debug!(%job_id, %status, "job status updated");
        true
      }
      Ok(false) => {
        tracing::debug!(%job_id, %status, "job already terminal; status unchanged");
        false
      }
      Err(e) => {
        tracing::warn!(%job_id, %status, error = %e, "failed to update job status; continuing");
        false
      }
    }
  }
}
