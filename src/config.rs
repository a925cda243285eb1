use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::deepseek;
use crate::relay::BOOTSTRAP_MODERATOR_ID;

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::Validation(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    /// Falls back to the TELEGRAM_BOT_TOKEN environment variable.
    #[serde(default)]
    telegram_bot_token: String,
    /// Falls back to the DEEPSEEK_API_KEY environment variable.
    #[serde(default)]
    deepseek_api_key: String,
    api_url: Option<String>,
    model: Option<String>,
    /// Directory for the database and logs. Defaults to current directory.
    data_dir: Option<String>,
    #[serde(default = "default_bootstrap_moderator")]
    bootstrap_moderator_id: i64,
    /// Only send the newest N turns of history. Unbounded when unset.
    history_limit: Option<usize>,
    /// Lead the prompt with a system message stating persona and instructions.
    #[serde(default)]
    persona_preamble: bool,
    /// Run without persistence: no history, personas, moderators or instructions.
    #[serde(default)]
    stateless: bool,
}

fn default_bootstrap_moderator() -> i64 {
    BOOTSTRAP_MODERATOR_ID
}

pub struct Config {
    pub telegram_bot_token: String,
    pub deepseek_api_key: String,
    pub api_url: String,
    pub model: String,
    /// Directory for state files (database, logs).
    pub data_dir: PathBuf,
    pub bootstrap_moderator_id: i64,
    pub history_limit: Option<usize>,
    pub persona_preamble: bool,
    pub stateless: bool,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        Self::from_file(file, |key| std::env::var(key).ok())
    }

    fn from_file(file: ConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let telegram_bot_token = or_env(file.telegram_bot_token, "TELEGRAM_BOT_TOKEN", &env);
        let deepseek_api_key = or_env(file.deepseek_api_key, "DEEPSEEK_API_KEY", &env);

        // Validate required fields
        if telegram_bot_token.is_empty() {
            return Err(ConfigError::Validation("telegram_bot_token is required".into()));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into()
            ));
        }
        if deepseek_api_key.is_empty() {
            return Err(ConfigError::Validation("deepseek_api_key is required".into()));
        }
        if file.history_limit == Some(0) {
            return Err(ConfigError::Validation("history_limit must be at least 1 when set".into()));
        }

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            telegram_bot_token,
            deepseek_api_key,
            api_url: file.api_url.unwrap_or_else(|| deepseek::DEFAULT_API_URL.to_string()),
            model: file.model.unwrap_or_else(|| deepseek::DEFAULT_MODEL.to_string()),
            data_dir,
            bootstrap_moderator_id: file.bootstrap_moderator_id,
            history_limit: file.history_limit,
            persona_preamble: file.persona_preamble,
            stateless: file.stateless,
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("relaybot.db")
    }
}

fn or_env(value: String, key: &str, env: &impl Fn(&str) -> Option<String>) -> String {
    if value.is_empty() {
        env(key).unwrap_or_default()
    } else {
        value
    }
}
