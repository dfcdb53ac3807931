//! Encoding and decoding helpers between domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC strings (microsecond
//! precision, `Z` suffix) so that lexical order equals chronological order.
//! UUIDs are stored as hyphenated lowercase strings.

use std::str::FromStr;

use brandspark_core::{
  job::JobStatus,
  session::{Message, Role, Session, SessionSummary},
};
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Uuid ─────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

// ─── DateTime<Utc> ────────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

// ─── Enumerations ─────────────────────────────────────────────────────────────

pub fn decode_status(s: &str) -> Result<JobStatus> {
  JobStatus::from_str(s)
    .map_err(|_| Error::UnknownValue(format!("job status {s:?}")))
}

pub fn decode_role(s: &str) -> Result<Role> {
  Role::from_str(s).map_err(|_| Error::UnknownValue(format!("role {s:?}")))
}

// ─── Raw rows ─────────────────────────────────────────────────────────────────

/// A `sessions` row as read from SQLite, before decoding.
pub struct RawSession {
  pub id:         String,
  pub user_id:    String,
  pub title:      String,
  pub created_at: String,
  pub updated_at: String,
}

impl RawSession {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:         row.get(0)?,
      user_id:    row.get(1)?,
      title:      row.get(2)?,
      created_at: row.get(3)?,
      updated_at: row.get(4)?,
    })
  }

  pub fn into_session(self) -> Result<Session> {
    Ok(Session {
      session_id: decode_uuid(&self.id)?,
      user_id:    decode_uuid(&self.user_id)?,
      title:      self.title,
      created_at: decode_dt(&self.created_at)?,
      updated_at: decode_dt(&self.updated_at)?,
    })
  }

  pub fn into_summary(self) -> Result<SessionSummary> {
    Ok(SessionSummary {
      id:         decode_uuid(&self.id)?,
      title:      self.title,
      updated_at: decode_dt(&self.updated_at)?,
    })
  }
}

/// A `jobs` row as read from SQLite, before decoding.
#[cfg(test)]
pub struct RawJob {
  pub id:         String,
  pub user_id:    String,
  pub session_id: String,
  pub prompt:     String,
  pub status:     String,
  pub created_at: String,
  pub updated_at: String,
}

#[cfg(test)]
impl RawJob {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:         row.get(0)?,
      user_id:    row.get(1)?,
      session_id: row.get(2)?,
      prompt:     row.get(3)?,
      status:     row.get(4)?,
      created_at: row.get(5)?,
      updated_at: row.get(6)?,
    })
  }

  pub fn into_job(self) -> Result<brandspark_core::job::Job> {
    Ok(brandspark_core::job::Job {
      job_id:     decode_uuid(&self.id)?,
      user_id:    decode_uuid(&self.user_id)?,
      session_id: decode_uuid(&self.session_id)?,
      prompt:     self.prompt,
      status:     decode_status(&self.status)?,
      created_at: decode_dt(&self.created_at)?,
      updated_at: decode_dt(&self.updated_at)?,
    })
  }
}

/// A `messages` row as read from SQLite, before decoding.
pub struct RawMessage {
  pub session_id: String,
  pub user_id:    String,
  pub role:       String,
  pub content:    String,
  pub created_at: String,
}

impl RawMessage {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      session_id: row.get(0)?,
      user_id:    row.get(1)?,
      role:       row.get(2)?,
      content:    row.get(3)?,
      created_at: row.get(4)?,
    })
  }

  pub fn into_message(self) -> Result<Message> {
    Ok(Message {
      session_id: decode_uuid(&self.session_id)?,
      user_id:    decode_uuid(&self.user_id)?,
      role:       decode_role(&self.role)?,
      content:    self.content,
      created_at: decode_dt(&self.created_at)?,
    })
  }
}
