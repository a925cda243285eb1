//! SQLite-backed store for turns, personas, users and instructions.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use crate::relay::store::{Store, StoreError, StoreResult};
use crate::relay::turn::{ConversationTurn, Role, UserRecord};

/// Administrator flagged as moderator when the store is first created.
pub const BOOTSTRAP_MODERATOR_ID: i64 = 996752722;

/// Persistent SQLite database.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a database file and seed the bootstrap moderator.
    pub fn open(path: &Path, bootstrap_moderator: i64) -> StoreResult<Self> {
        let db = Self { conn: Mutex::new(Connection::open(path)?) };
        db.init_schema()?;
        db.seed_moderator(bootstrap_moderator)?;

        let (turns, users) = db.counts()?;
        info!("Loaded database from {:?} ({} turns, {} users)", path, turns, users);
        Ok(db)
    }

    /// In-memory database, mostly for tests.
    pub fn in_memory(bootstrap_moderator: i64) -> StoreResult<Self> {
        let db = Self { conn: Mutex::new(Connection::open_in_memory()?) };
        db.init_schema()?;
        db.seed_moderator(bootstrap_moderator)?;
        Ok(db)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn()?;

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS turns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                username TEXT NOT NULL,
                message TEXT NOT NULL,
                role TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS personas (
                chat_id INTEGER PRIMARY KEY,
                persona TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY,
                username TEXT,
                is_mod INTEGER NOT NULL DEFAULT 0,
                treatment_score INTEGER,
                info TEXT
            );

            CREATE TABLE IF NOT EXISTS instructions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                text TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_turns_chat_timestamp ON turns(chat_id, timestamp);
        "#)?;
        Ok(())
    }

    /// Insert-only: an existing record for this user is left alone.
    fn seed_moderator(&self, user_id: i64) -> StoreResult<()> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO users (user_id, username, is_mod) VALUES (?1, 'admin', 1)",
            params![user_id],
        )?;
        if inserted > 0 {
            info!("Seeded bootstrap moderator {}", user_id);
        }
        Ok(())
    }

    fn counts(&self) -> StoreResult<(usize, usize)> {
        let conn = self.conn()?;
        let turns: i64 = conn.query_row("SELECT COUNT(*) FROM turns", [], |row| row.get(0))?;
        let users: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok((turns as usize, users as usize))
    }
}

type TurnRow = (i64, i64, String, String, String, i64);

fn read_turn(row: &rusqlite::Row<'_>) -> rusqlite::Result<TurnRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
}

fn turn_from_row((chat_id, user_id, username, message_text, role, ts): TurnRow) -> StoreResult<ConversationTurn> {
    // History only ever holds user and assistant turns
    let role = match Role::parse(&role) {
        Some(r @ (Role::User | Role::Assistant)) => r,
        _ => return Err(StoreError::InvalidRole(role)),
    };
    let timestamp: DateTime<Utc> =
        DateTime::from_timestamp_micros(ts).ok_or(StoreError::InvalidTimestamp(ts))?;
    Ok(ConversationTurn { chat_id, user_id, username, message_text, role, timestamp })
}

impl Store for Database {
    fn append_turn(&self, turn: &ConversationTurn) -> StoreResult<()> {
        if turn.role == Role::System {
            return Err(StoreError::InvalidRole(turn.role.as_str().to_string()));
        }
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO turns (chat_id, user_id, username, message, role, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                turn.chat_id,
                turn.user_id,
                turn.username,
                turn.message_text,
                turn.role.as_str(),
                turn.timestamp.timestamp_micros()
            ],
        )?;
        debug!("Stored {} turn for chat {}", turn.role.as_str(), turn.chat_id);
        Ok(())
    }

    fn list_turns(&self, chat_id: i64, limit: Option<usize>) -> StoreResult<Vec<ConversationTurn>> {
        let conn = self.conn()?;

        let rows: Vec<TurnRow> = match limit {
            None => {
                let mut stmt = conn.prepare(
                    "SELECT chat_id, user_id, username, message, role, timestamp
                     FROM turns WHERE chat_id = ?1
                     ORDER BY timestamp ASC, id ASC",
                )?;
                let rows = stmt
                    .query_map(params![chat_id], read_turn)?
                    .collect::<Result<Vec<TurnRow>, _>>()?;
                rows
            }
            Some(n) => {
                // Newest n, flipped back to oldest first
                let mut stmt = conn.prepare(
                    "SELECT chat_id, user_id, username, message, role, timestamp FROM (
                         SELECT id, chat_id, user_id, username, message, role, timestamp
                         FROM turns WHERE chat_id = ?1
                         ORDER BY timestamp DESC, id DESC LIMIT ?2
                     ) ORDER BY timestamp ASC, id ASC",
                )?;
                let rows = stmt
                    .query_map(params![chat_id, n as i64], read_turn)?
                    .collect::<Result<Vec<TurnRow>, _>>()?;
                rows
            }
        };

        rows.into_iter().map(turn_from_row).collect()
    }

    fn find_persona(&self, chat_id: i64) -> StoreResult<Option<String>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT persona FROM personas WHERE chat_id = ?1",
                params![chat_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn set_persona(&self, chat_id: i64, persona: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO personas (chat_id, persona) VALUES (?1, ?2)
             ON CONFLICT(chat_id) DO UPDATE SET persona = excluded.persona",
            params![chat_id, persona],
        )?;
        Ok(())
    }

    fn find_user(&self, user_id: i64) -> StoreResult<Option<UserRecord>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT user_id, username, is_mod, treatment_score, info FROM users WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(UserRecord {
                        user_id: row.get(0)?,
                        username: row.get(1)?,
                        is_mod: row.get(2)?,
                        treatment_score: row.get(3)?,
                        info: row.get(4)?,
                    })
                },
            )
            .optional()?)
    }

    fn set_moderator(&self, user_id: i64, is_mod: bool) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (user_id, is_mod) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET is_mod = excluded.is_mod",
            params![user_id, is_mod],
        )?;
        Ok(())
    }

    fn set_treatment_score(&self, user_id: i64, score: i64) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (user_id, treatment_score) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET treatment_score = excluded.treatment_score",
            params![user_id, score],
        )?;
        Ok(())
    }

    fn set_user_info(&self, user_id: i64, username: &str, info: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (user_id, username, info) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                username = excluded.username,
                info = excluded.info",
            params![user_id, username, info],
        )?;
        Ok(())
    }

    fn add_instruction(&self, text: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute("INSERT INTO instructions (text) VALUES (?1)", params![text])?;
        Ok(())
    }

    fn list_instructions(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT text FROM instructions ORDER BY id ASC")?;
        let texts = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(texts)
    }

    fn remove_instruction(&self, text: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM instructions WHERE id = (
                 SELECT id FROM instructions WHERE text = ?1 ORDER BY id ASC LIMIT 1
             )",
            params![text],
        )?;
        Ok(removed > 0)
    }
}
