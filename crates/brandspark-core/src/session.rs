//! Sessions, their transcript messages, and the reports jobs produce.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of characters of the prompt kept as a session title.
pub const TITLE_MAX_CHARS: usize = 50;

/// Derive a session title from a prompt: its first [`TITLE_MAX_CHARS`]
/// characters.
pub fn title_from_prompt(prompt: &str) -> String {
  prompt.chars().take(TITLE_MAX_CHARS).collect()
}

/// A named conversation thread, permanently bound to the user that created
/// it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
  pub session_id: Uuid,
  pub user_id:    Uuid,
  pub title:      String,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// Row returned by `GET /sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
  pub id:         Uuid,
  pub title:      String,
  pub updated_at: DateTime<Utc>,
}

/// Who authored a transcript message.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
  strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
  User,
  Agent,
}

/// One append-only turn in a session transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
  pub session_id: Uuid,
  pub user_id:    Uuid,
  pub role:       Role,
  pub content:    String,
  pub created_at: DateTime<Utc>,
}

/// The durable output of a completed job. Written once, never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
  pub job_id:  Uuid,
  pub user_id: Uuid,
  pub content: String,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn title_is_truncated_on_char_boundaries() {
    let long = "é".repeat(80);
    let title = title_from_prompt(&long);
    assert_eq!(title.chars().count(), TITLE_MAX_CHARS);

    assert_eq!(title_from_prompt("Acme vs Globex"), "Acme vs Globex");
  }
}
