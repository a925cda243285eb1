//! Record types shared by the store, the assembler and the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persona used when a chat never had one set.
pub const DEFAULT_PERSONA: &str = "sério";

/// User id recorded on assistant turns.
pub const BOT_USER_ID: i64 = 0;

/// Username recorded on assistant turns.
pub const BOT_USERNAME: &str = "bot";

/// Author of a prompt message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// One message of a chat's history. Never modified after it is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationTurn {
    pub chat_id: i64,
    pub user_id: i64,
    pub username: String,
    pub message_text: String,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    /// A turn written by a chat participant, stamped now.
    pub fn from_user(chat_id: i64, user_id: i64, username: &str, text: &str) -> Self {
        Self {
            chat_id,
            user_id,
            username: username.to_string(),
            message_text: text.to_string(),
            role: Role::User,
            timestamp: Utc::now(),
        }
    }

    /// A reply written by the bot, stamped now.
    pub fn from_assistant(chat_id: i64, text: &str) -> Self {
        Self {
            chat_id,
            user_id: BOT_USER_ID,
            username: BOT_USERNAME.to_string(),
            message_text: text.to_string(),
            role: Role::Assistant,
            timestamp: Utc::now(),
        }
    }

    pub fn to_prompt(&self) -> PromptMessage {
        PromptMessage {
            role: self.role,
            content: self.message_text.clone(),
        }
    }
}

/// A `{role, content}` pair as sent to the completion provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }
}

/// A user known to the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: i64,
    pub username: Option<String>,
    pub is_mod: bool,
    pub treatment_score: Option<i64>,
    pub info: Option<String>,
}
