//! [`SqliteGateway`], the SQLite implementation of [`Gateway`].

use std::sync::Arc;

use brandspark_core::{
  gateway::Gateway,
  job::{Job, JobStatus, JobView},
  session::{Message, Report, Role, Session, SessionSummary},
};
use chrono::Utc;
use rusqlite::{OptionalExtension as _, TransactionBehavior};
use tokio::sync::RwLock;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::{
  Error, Result,
  encode::{RawMessage, RawSession, decode_status, decode_uuid, encode_dt, encode_uuid},
  pool::{DatabaseTarget, Pool},
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// The persistence gateway backed by a pool of SQLite connections.
///
/// Cloning is cheap; clones share the same pool. Once [`close`] has been
/// called every operation fails with [`Error::Unavailable`].
///
/// [`close`]: SqliteGateway::close
#[derive(Clone)]
pub struct SqliteGateway {
  pool: Arc<RwLock<Option<Pool>>>,
}

/// Result of the ownership check inside `upsert_session`'s transaction.
enum SessionWrite {
  Written(RawSession),
  Foreign,
}

impl SqliteGateway {
  /// Open (or create) the database named by `url` with up to `pool_size`
  /// connections and run schema initialisation.
  pub async fn open(url: &str, pool_size: usize) -> Result<Self> {
    let target = DatabaseTarget::parse(url)?;
    let pool = Pool::open(&target, pool_size).await?;
    Ok(Self { pool: Arc::new(RwLock::new(Some(pool))) })
  }

  /// Open an in-memory store for tests.
  pub async fn open_in_memory() -> Result<Self> {
    Self::open(":memory:", 1).await
  }

  /// Tear the pool down. Idempotent.
  pub async fn close(&self) {
    let pool = self.pool.write().await.take();
    if let Some(pool) = pool {
      let size = pool.size();
      pool.close().await;
      tracing::info!(size, "closed database pool");
    }
  }

  /// Number of open connections; `0` once closed.
  pub async fn pool_size(&self) -> usize {
    self.pool.read().await.as_ref().map_or(0, Pool::size)
  }

  async fn conn(&self) -> Result<Connection> {
    self
      .pool
      .read()
      .await
      .as_ref()
      .map(Pool::get)
      .ok_or(Error::Unavailable)
  }

  // ── Users ─────────────────────────────────────────────────────────────────

  async fn insert_profile(&self, user_id: Uuid) -> Result<bool> {
    let id_str = encode_uuid(user_id);
    let now    = encode_dt(Utc::now());

    let created = self
      .conn()
      .await?
      .call(move |conn| {
        let inserted = conn.execute(
          "INSERT INTO user_profiles (id, created_at, updated_at) VALUES (?1, ?2, ?2)
           ON CONFLICT(id) DO NOTHING",
          rusqlite::params![id_str, now],
        )?;
        Ok(inserted > 0)
      })
      .await?;

    if created {
      tracing::info!(%user_id, "created user profile");
    }
    Ok(created)
  }

  // ── Sessions ──────────────────────────────────────────────────────────────

  async fn write_session(
    &self,
    session_id: Uuid,
    user_id:    Uuid,
    title:      String,
  ) -> Result<Session> {
    let sid = encode_uuid(session_id);
    let uid = encode_uuid(user_id);
    let now = encode_dt(Utc::now());

    let outcome = self
      .conn()
      .await?
      .call(move |conn| {
        // Take the write lock before reading. A deferred transaction that
        // upgrades to a write fails at once with SQLITE_BUSY instead of
        // waiting on the busy timeout.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let owner: Option<String> = tx
          .query_row(
            "SELECT user_id FROM sessions WHERE id = ?1",
            rusqlite::params![sid],
            |row| row.get(0),
          )
          .optional()?;

        match owner {
          Some(owner) if owner != uid => return Ok(SessionWrite::Foreign),
          Some(_) => {
            tx.execute(
              "UPDATE sessions SET title = ?1, updated_at = ?2 WHERE id = ?3",
              rusqlite::params![title, now, sid],
            )?;
          }
          None => {
            tx.execute(
              "INSERT INTO sessions (id, user_id, title, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?4)",
              rusqlite::params![sid, uid, title, now],
            )?;
          }
        }

        let raw = tx.query_row(
          "SELECT id, user_id, title, created_at, updated_at FROM sessions WHERE id = ?1",
          rusqlite::params![sid],
          RawSession::from_row,
        )?;
        tx.commit()?;
        Ok(SessionWrite::Written(raw))
      })
      .await?;

    match outcome {
      SessionWrite::Written(raw) => raw.into_session(),
      SessionWrite::Foreign => Err(Error::OwnershipViolation(session_id)),
    }
  }

  async fn fetch_session_owner(&self, session_id: Uuid) -> Result<Option<Uuid>> {
    let sid = encode_uuid(session_id);

    let owner: Option<String> = self
      .conn()
      .await?
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT user_id FROM sessions WHERE id = ?1",
              rusqlite::params![sid],
              |row| row.get(0),
            )
            .optional()?,
        )
      })
      .await?;

    owner.as_deref().map(decode_uuid).transpose()
  }

  async fn fetch_sessions(&self, user_id: Uuid) -> Result<Vec<SessionSummary>> {
    let uid = encode_uuid(user_id);

    let raws: Vec<RawSession> = self
      .conn()
      .await?
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT id, user_id, title, created_at, updated_at
           FROM sessions
           WHERE user_id = ?1
           ORDER BY updated_at DESC, id ASC",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![uid], RawSession::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawSession::into_summary).collect()
  }

  // ── Messages ──────────────────────────────────────────────────────────────

  async fn insert_message(
    &self,
    session_id: Uuid,
    user_id:    Uuid,
    role:       Role,
    content:    String,
  ) -> Result<Message> {
    let message = Message { session_id, user_id, role, content, created_at: Utc::now() };

    let sid     = encode_uuid(session_id);
    let uid     = encode_uuid(user_id);
    let role    = role.to_string();
    let at      = encode_dt(message.created_at);
    let content = message.content.clone();

    self
      .conn()
      .await?
      .call(move |conn| {
        conn.execute(
          "INSERT INTO messages (session_id, user_id, role, content, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5)",
          rusqlite::params![sid, uid, role, content, at],
        )?;
        Ok(())
      })
      .await?;

    Ok(message)
  }

  async fn fetch_messages(&self, session_id: Uuid) -> Result<Vec<Message>> {
    let sid = encode_uuid(session_id);

    let raws: Vec<RawMessage> = self
      .conn()
      .await?
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT session_id, user_id, role, content, created_at
           FROM messages
           WHERE session_id = ?1
           ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![sid], RawMessage::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawMessage::into_message).collect()
  }

  // ── Jobs ──────────────────────────────────────────────────────────────────

  async fn insert_job(
    &self,
    user_id:    Uuid,
    session_id: Uuid,
    prompt:     String,
  ) -> Result<Job> {
    let now = Utc::now();
    let job = Job {
      job_id: Uuid::new_v4(),
      user_id,
      session_id,
      prompt,
      status: JobStatus::Pending,
      created_at: now,
      updated_at: now,
    };

    let id     = encode_uuid(job.job_id);
    let uid    = encode_uuid(user_id);
    let sid    = encode_uuid(session_id);
    let prompt = job.prompt.clone();
    let status = job.status.to_string();
    let at     = encode_dt(now);

    self
      .conn()
      .await?
      .call(move |conn| {
        conn.execute(
          "INSERT INTO jobs (id, user_id, session_id, prompt, status, created_at, updated_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
          rusqlite::params![id, uid, sid, prompt, status, at],
        )?;
        Ok(())
      })
      .await?;

    Ok(job)
  }

  async fn update_status(&self, job_id: Uuid, status: JobStatus) -> Result<bool> {
    let id         = encode_uuid(job_id);
    let status_str = status.to_string();
    let now        = encode_dt(Utc::now());

    let changed = self
      .conn()
      .await?
      .call(move |conn| {
        let n = conn.execute(
          "UPDATE jobs SET status = ?1, updated_at = ?2
           WHERE id = ?3 AND status NOT IN ('completed', 'failed')",
          rusqlite::params![status_str, now, id],
        )?;
        Ok(n > 0)
      })
      .await?;

    Ok(changed)
  }

  async fn fetch_job(&self, job_id: Uuid, user_id: Uuid) -> Result<Option<JobView>> {
    let id  = encode_uuid(job_id);
    let uid = encode_uuid(user_id);

    let row: Option<(String, Option<String>)> = self
      .conn()
      .await?
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT j.status, r.content
               FROM jobs j
               LEFT JOIN reports r ON r.job_id = j.id AND r.user_id = j.user_id
               WHERE j.id = ?1 AND j.user_id = ?2",
              rusqlite::params![id, uid],
              |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?,
        )
      })
      .await?;

    let Some((status, content)) = row else { return Ok(None) };
    let status = decode_status(&status)?;
    let report = content.filter(|_| status == JobStatus::Completed);
    Ok(Some(JobView { job_id, status, report }))
  }

  /// Load a full job row regardless of owner.
  #[cfg(test)]
  pub(crate) async fn job(&self, job_id: Uuid) -> Result<Option<Job>> {
    use crate::encode::RawJob;

    let id = encode_uuid(job_id);

    let raw: Option<RawJob> = self
      .conn()
      .await?
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT id, user_id, session_id, prompt, status, created_at, updated_at
               FROM jobs WHERE id = ?1",
              rusqlite::params![id],
              RawJob::from_row,
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawJob::into_job).transpose()
  }

  async fn fail_interrupted(&self) -> Result<Vec<Uuid>> {
    let now = encode_dt(Utc::now());

    let ids: Vec<String> = self
      .conn()
      .await?
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let ids = {
          let mut stmt = tx.prepare(
            "SELECT id FROM jobs WHERE status IN ('pending', 'processing') ORDER BY created_at",
          )?;
          stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.execute(
          "UPDATE jobs SET status = 'failed', updated_at = ?1
           WHERE status IN ('pending', 'processing')",
          rusqlite::params![now],
        )?;
        tx.commit()?;
        Ok(ids)
      })
      .await?;

    ids.iter().map(|s| decode_uuid(s)).collect()
  }

  // ── Reports ───────────────────────────────────────────────────────────────

  async fn insert_report(
    &self,
    job_id:  Uuid,
    user_id: Uuid,
    content: String,
  ) -> Result<Report> {
    let report = Report { job_id, user_id, content };

    let jid     = encode_uuid(job_id);
    let uid     = encode_uuid(user_id);
    let content = report.content.clone();
    let at      = encode_dt(Utc::now());

    self
      .conn()
      .await?
      .call(move |conn| {
        conn.execute(
          "INSERT INTO reports (job_id, user_id, content, created_at) VALUES (?1, ?2, ?3, ?4)",
          rusqlite::params![jid, uid, content, at],
        )?;
        Ok(())
      })
      .await?;

    Ok(report)
  }

  async fn write_outcome(
    &self,
    job_id:     Uuid,
    user_id:    Uuid,
    session_id: Uuid,
    content:    String,
  ) -> Result<Report> {
    let report = Report { job_id, user_id, content };

    let jid     = encode_uuid(job_id);
    let uid     = encode_uuid(user_id);
    let sid     = encode_uuid(session_id);
    let content = report.content.clone();

    let completed = self
      .conn()
      .await?
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let at = encode_dt(Utc::now());
        tx.execute(
          "INSERT INTO messages (session_id, user_id, role, content, created_at)
           VALUES (?1, ?2, 'agent', ?3, ?4)",
          rusqlite::params![sid, uid, content, at],
        )?;

        let at = encode_dt(Utc::now());
        tx.execute(
          "INSERT INTO reports (job_id, user_id, content, created_at) VALUES (?1, ?2, ?3, ?4)",
          rusqlite::params![jid, uid, content, at],
        )?;

        let at = encode_dt(Utc::now());
        let changed = tx.execute(
          "UPDATE jobs SET status = 'completed', updated_at = ?1
           WHERE id = ?2 AND status NOT IN ('completed', 'failed')",
          rusqlite::params![at, jid],
        )?;

        // Dropping the transaction without committing rolls everything back.
        if changed == 0 {
          return Ok(false);
        }
        tx.commit()?;
        Ok(true)
      })
      .await?;

    if !completed {
      return Err(Error::JobNotActive(job_id));
    }
    Ok(report)
  }

  async fn select_one(&self) -> Result<()> {
    self
      .conn()
      .await?
      .call(|conn| {
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

// ─── Gateway impl ────────────────────────────────────────────────────────────

impl Gateway for SqliteGateway {
  async fn ensure_user_profile(&self, user_id: Uuid) -> brandspark_core::Result<bool> {
    Ok(self.insert_profile(user_id).await?)
  }

  async fn upsert_session(
    &self,
    session_id: Uuid,
    user_id:    Uuid,
    title:      String,
  ) -> brandspark_core::Result<Session> {
    Ok(self.write_session(session_id, user_id, title).await?)
  }

  async fn session_owner(&self, session_id: Uuid) -> brandspark_core::Result<Option<Uuid>> {
    Ok(self.fetch_session_owner(session_id).await?)
  }

  async fn list_sessions(&self, user_id: Uuid) -> brandspark_core::Result<Vec<SessionSummary>> {
    Ok(self.fetch_sessions(user_id).await?)
  }

  async fn append_message(
    &self,
    session_id: Uuid,
    user_id:    Uuid,
    role:       Role,
    content:    String,
  ) -> brandspark_core::Result<Message> {
    Ok(self.insert_message(session_id, user_id, role, content).await?)
  }

  async fn list_messages(&self, session_id: Uuid) -> brandspark_core::Result<Vec<Message>> {
    Ok(self.fetch_messages(session_id).await?)
  }

  async fn create_job(
    &self,
    user_id:    Uuid,
    session_id: Uuid,
    prompt:     String,
  ) -> brandspark_core::Result<Job> {
    Ok(self.insert_job(user_id, session_id, prompt).await?)
  }

  async fn set_job_status(
    &self,
    job_id: Uuid,
    status: JobStatus,
  ) -> brandspark_core::Result<bool> {
    Ok(self.update_status(job_id, status).await?)
  }

  async fn get_job(
    &self,
    job_id:  Uuid,
    user_id: Uuid,
  ) -> brandspark_core::Result<Option<JobView>> {
    Ok(self.fetch_job(job_id, user_id).await?)
  }

  async fn recover_interrupted_jobs(&self) -> brandspark_core::Result<Vec<Uuid>> {
    Ok(self.fail_interrupted().await?)
  }

  async fn save_report(
    &self,
    job_id:  Uuid,
    user_id: Uuid,
    content: String,
  ) -> brandspark_core::Result<Report> {
    Ok(self.insert_report(job_id, user_id, content).await?)
  }

  async fn record_outcome(
    &self,
    job_id:     Uuid,
    user_id:    Uuid,
    session_id: Uuid,
    content:    String,
  ) -> brandspark_core::Result<Report> {
    Ok(self.write_outcome(job_id, user_id, session_id, content).await?)
  }

  async fn ping(&self) -> brandspark_core::Result<()> {
    Ok(self.select_one().await?)
  }
}
