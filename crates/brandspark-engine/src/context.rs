//! Engine-side conversation state and per-user long-term memory.

use std::{
  collections::{HashMap, VecDeque},
  sync::{Mutex, MutexGuard, PoisonError},
};

use brandspark_core::engine::EngineError;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Author recorded for turns that carry the caller's prompt.
pub const USER_AUTHOR: &str = "user";

/// Archived conversations kept per user.
pub const MEMORY_CAPACITY: usize = 5;

/// Turns kept per live conversation; the oldest are dropped first.
pub const CONVERSATION_TURN_LIMIT: usize = 16;

/// Characters of each archived answer exposed through the memory digest.
const DIGEST_EXCERPT_CHARS: usize = 1_500;

const EMPTY_MEMORY: &str = "No prior analyses.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
  pub author: String,
  pub text:   String,
  pub at:     DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ArchivedConversation {
  pub session_id:  Uuid,
  pub turns:       Vec<Turn>,
  pub archived_at: DateTime<Utc>,
}

impl ArchivedConversation {
  /// The last turn not authored by the user, if any.
  fn latest_answer(&self) -> Option<&Turn> {
    self.turns.iter().rev().find(|t| t.author != USER_AUTHOR)
  }
}

#[derive(Default)]
struct Inner {
  conversations: HashMap<(Uuid, Uuid), Vec<Turn>>,
  memory:        HashMap<Uuid, VecDeque<ArchivedConversation>>,
}

/// Conversations keyed by `(user_id, session_id)` plus each user's archive.
///
/// Every method holds the lock only for the duration of a map operation and
/// never across an `.await`.
#[derive(Default)]
pub struct ContextStore {
  inner: Mutex<Inner>,
}

impl ContextStore {
  pub fn new() -> Self { Self::default() }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn create(&self, user_id: Uuid, session_id: Uuid) -> Result<(), EngineError> {
    let mut inner = self.lock();
    if inner.conversations.contains_key(&(user_id, session_id)) {
      return Err(EngineError::ContextExists(session_id));
    }
    inner.conversations.insert((user_id, session_id), Vec::new());
    Ok(())
  }

  pub fn exists(&self, user_id: Uuid, session_id: Uuid) -> bool {
    self.lock().conversations.contains_key(&(user_id, session_id))
  }

  pub fn append(
    &self,
    user_id: Uuid,
    session_id: Uuid,
    author: &str,
    text: &str,
  ) -> Result<(), EngineError> {
    let mut inner = self.lock();
    let turns = inner
      .conversations
      .get_mut(&(user_id, session_id))
      .ok_or(EngineError::NoSuchContext(session_id))?;
    turns.push(Turn { author: author.to_owned(), text: text.to_owned(), at: Utc::now() });
    let excess = turns.len().saturating_sub(CONVERSATION_TURN_LIMIT);
    turns.drain(..excess);
    Ok(())
  }

  pub fn turns(&self, user_id: Uuid, session_id: Uuid) -> Option<Vec<Turn>> {
    self.lock().conversations.get(&(user_id, session_id)).cloned()
  }

  /// Move the conversation's turns into the user's memory, newest first.
  /// The live context stays registered but empty. A session archived again
  /// replaces its earlier entry; archiving an empty context changes nothing.
  pub fn archive(&self, user_id: Uuid, session_id: Uuid) -> Result<(), EngineError> {
    let mut inner = self.lock();
    let turns = inner
      .conversations
      .get_mut(&(user_id, session_id))
      .map(std::mem::take)
      .ok_or(EngineError::NoSuchContext(session_id))?;
    if turns.is_empty() {
      return Ok(());
    }

    let memory = inner.memory.entry(user_id).or_default();
    memory.retain(|c| c.session_id != session_id);
    memory.push_front(ArchivedConversation { session_id, turns, archived_at: Utc::now() });
    memory.truncate(MEMORY_CAPACITY);
    Ok(())
  }

  pub fn memory(&self, user_id: Uuid) -> Vec<ArchivedConversation> {
    self
      .lock()
      .memory
      .get(&user_id)
      .map(|m| m.iter().cloned().collect())
      .unwrap_or_default()
  }

  /// Plain-text summary of the user's archived answers for the `memory` slot.
  pub fn memory_digest(&self, user_id: Uuid) -> String {
    let inner = self.lock();
    let Some(memory) = inner.memory.get(&user_id) else {
      return EMPTY_MEMORY.to_owned();
    };

    let entries: Vec<String> = memory
      .iter()
      .filter_map(|c| {
        let answer = c.latest_answer()?;
        let excerpt: String = answer.text.chars().take(DIGEST_EXCERPT_CHARS).collect();
        Some(format!(
          "[{}] {}",
          c.archived_at.format("%Y-%m-%d"),
          excerpt.trim()
        ))
      })
      .collect();

    if entries.is_empty() {
      EMPTY_MEMORY.to_owned()
    } else {
      entries.join("\n\n")
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn create_twice_reports_existing_context() {
    let store = ContextStore::new();
    let (user, session) = (Uuid::new_v4(), Uuid::new_v4());

    store.create(user, session).unwrap();
    assert!(matches!(
      store.create(user, session),
      Err(EngineError::ContextExists(id)) if id == session
    ));
    // Same session id under another user is a separate context.
    store.create(Uuid::new_v4(), session).unwrap();
  }

  #[test]
  fn append_requires_a_context() {
    let store = ContextStore::new();
    let (user, session) = (Uuid::new_v4(), Uuid::new_v4());

    assert!(matches!(
      store.append(user, session, USER_AUTHOR, "hi"),
      Err(EngineError::NoSuchContext(_))
    ));

    store.create(user, session).unwrap();
    store.append(user, session, USER_AUTHOR, "hi").unwrap();
    store.append(user, session, "research", "findings").unwrap();
    let authors: Vec<String> = store
      .turns(user, session)
      .unwrap()
      .into_iter()
      .map(|t| t.author)
      .collect();
    assert_eq!(authors, ["user", "research"]);
  }

  #[test]
  fn memory_is_bounded_and_newest_first() {
    let store = ContextStore::new();
    let user = Uuid::new_v4();

    let sessions: Vec<Uuid> = (0..MEMORY_CAPACITY + 2).map(|_| Uuid::new_v4()).collect();
    for (i, session) in sessions.iter().enumerate() {
      store.create(user, *session).unwrap();
      store.append(user, *session, "report", &format!("report {i}")).unwrap();
      store.archive(user, *session).unwrap();
    }

    let memory = store.memory(user);
    assert_eq!(memory.len(), MEMORY_CAPACITY);
    assert_eq!(memory[0].session_id, *sessions.last().unwrap());

    // Re-archiving moves the session to the front without duplicating it.
    let again = sessions[sessions.len() - 2];
    store.append(user, again, "report", "revised report").unwrap();
    store.archive(user, again).unwrap();
    let memory = store.memory(user);
    assert_eq!(memory.len(), MEMORY_CAPACITY);
    assert_eq!(memory[0].session_id, again);
    assert_eq!(memory.iter().filter(|c| c.session_id == again).count(), 1);
  }

  #[test]
  fn digest_shows_latest_answers() {
    let store = ContextStore::new();
    let (user, session) = (Uuid::new_v4(), Uuid::new_v4());
    assert_eq!(store.memory_digest(user), EMPTY_MEMORY);

    store.create(user, session).unwrap();
    store.append(user, session, USER_AUTHOR, "Analyze Acme").unwrap();
    assert!(store.archive(user, Uuid::new_v4()).is_err());
    store.archive(user, session).unwrap();
    // Only a user turn so far: nothing to show.
    assert_eq!(store.memory_digest(user), EMPTY_MEMORY);

    store.append(user, session, "report", "# Acme report").unwrap();
    store.archive(user, session).unwrap();
    let digest = store.memory_digest(user);
    assert!(digest.contains("# Acme report"));
    assert!(!digest.contains("Analyze Acme"));
  }

  #[test]
  fn live_conversations_are_bounded() {
    let store = ContextStore::new();
    let (user, session) = (Uuid::new_v4(), Uuid::new_v4());
    store.create(user, session).unwrap();

    for i in 0..CONVERSATION_TURN_LIMIT * 3 {
      store.append(user, session, "research", &format!("turn {i}")).unwrap();
    }
    let turns = store.turns(user, session).unwrap();
    assert_eq!(turns.len(), CONVERSATION_TURN_LIMIT);
    assert_eq!(turns[0].text, format!("turn {}", CONVERSATION_TURN_LIMIT * 2));
    assert_eq!(turns.last().unwrap().text, format!("turn {}", CONVERSATION_TURN_LIMIT * 3 - 1));
  }

  #[test]
  fn archiving_empties_the_live_conversation() {
    let store = ContextStore::new();
    let (user, session) = (Uuid::new_v4(), Uuid::new_v4());
    store.create(user, session).unwrap();
    store.append(user, session, USER_AUTHOR, "Analyze Acme").unwrap();
    store.append(user, session, "report", "# Acme report").unwrap();

    store.archive(user, session).unwrap();
    assert_eq!(store.turns(user, session), Some(Vec::new()));
    assert_eq!(store.memory(user)[0].turns.len(), 2);

    // The context is still usable and a no-op archive keeps the old entry.
    assert!(matches!(store.create(user, session), Err(EngineError::ContextExists(_))));
    store.archive(user, session).unwrap();
    assert_eq!(store.memory(user).len(), 1);
    assert!(store.memory_digest(user).contains("# Acme report"));
  }
}
