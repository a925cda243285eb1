//! Persistence gateway: typed access to turns, personas, users and instructions.

use std::fmt;

use crate::relay::turn::{ConversationTurn, DEFAULT_PERSONA, UserRecord};

/// Errors raised by a store backend.
#[derive(Debug)]
pub enum StoreError {
    /// The underlying SQLite call failed.
    Sqlite(rusqlite::Error),
    /// A thread panicked while holding the connection.
    Poisoned,
    /// A turn carries a role other than user or assistant.
    InvalidRole(String),
    /// A stored timestamp is out of range.
    InvalidTimestamp(i64),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "database error: {e}"),
            Self::Poisoned => write!(f, "database connection lock poisoned"),
            Self::InvalidRole(role) => write!(f, "unknown role in stored turn: '{role}'"),
            Self::InvalidTimestamp(ts) => write!(f, "invalid stored timestamp: {ts}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sqlite(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage accessors. Every call is synchronous and independently durable.
///
/// Turns and instructions are append-only inserts. Personas and users are
/// upserted: the key is inserted when absent, otherwise only the named
/// fields change.
pub trait Store: Send + Sync {
    fn append_turn(&self, turn: &ConversationTurn) -> StoreResult<()>;

    /// Turns of a chat, oldest first. `limit` keeps only the newest `n`.
    fn list_turns(&self, chat_id: i64, limit: Option<usize>) -> StoreResult<Vec<ConversationTurn>>;

    fn find_persona(&self, chat_id: i64) -> StoreResult<Option<String>>;
    fn set_persona(&self, chat_id: i64, persona: &str) -> StoreResult<()>;

    fn find_user(&self, user_id: i64) -> StoreResult<Option<UserRecord>>;
    fn set_moderator(&self, user_id: i64, is_mod: bool) -> StoreResult<()>;
    fn set_treatment_score(&self, user_id: i64, score: i64) -> StoreResult<()>;
    fn set_user_info(&self, user_id: i64, username: &str, info: &str) -> StoreResult<()>;

    fn add_instruction(&self, text: &str) -> StoreResult<()>;
    fn list_instructions(&self) -> StoreResult<Vec<String>>;
    /// Removes one instruction with exactly this text. Returns whether one existed.
    fn remove_instruction(&self, text: &str) -> StoreResult<bool>;

    /// Persona of a chat, falling back to [`DEFAULT_PERSONA`].
    fn persona(&self, chat_id: i64) -> StoreResult<String> {
        Ok(self
            .find_persona(chat_id)?
            .unwrap_or_else(|| DEFAULT_PERSONA.to_string()))
    }

    /// Whether a user holds moderator rights. Unknown users do not.
    fn is_mod(&self, user_id: i64) -> StoreResult<bool> {
        Ok(self.find_user(user_id)?.is_some_and(|u| u.is_mod))
    }
}

/// Store that remembers nothing. Running on it gives the stateless relay:
/// no history, default persona, no moderators.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

impl Store for NullStore {
    fn append_turn(&self, _turn: &ConversationTurn) -> StoreResult<()> {
        Ok(())
    }

    fn list_turns(&self, _chat_id: i64, _limit: Option<usize>) -> StoreResult<Vec<ConversationTurn>> {
        Ok(Vec::new())
    }

    fn find_persona(&self, _chat_id: i64) -> StoreResult<Option<String>> {
        Ok(None)
    }

    fn set_persona(&self, _chat_id: i64, _persona: &str) -> StoreResult<()> {
        Ok(())
    }

    fn find_user(&self, _user_id: i64) -> StoreResult<Option<UserRecord>> {
        Ok(None)
    }

    fn set_moderator(&self, _user_id: i64, _is_mod: bool) -> StoreResult<()> {
        Ok(())
    }

    fn set_treatment_score(&self, _user_id: i64, _score: i64) -> StoreResult<()> {
        Ok(())
    }

    fn set_user_info(&self, _user_id: i64, _username: &str, _info: &str) -> StoreResult<()> {
        Ok(())
    }

    fn add_instruction(&self, _text: &str) -> StoreResult<()> {
        Ok(())
    }

    fn list_instructions(&self) -> StoreResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn remove_instruction(&self, _text: &str) -> StoreResult<bool> {
        Ok(false)
    }
}
