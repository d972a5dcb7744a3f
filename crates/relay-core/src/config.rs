//! Configuration management
//!
//! Settings are resolved in this order:
//! 1. Environment variables
//! 2. `cc-relay.toml` in the working directory
//! 3. Defaults
//!
//! `${VAR_NAME}` inside the TOML file is replaced with the variable's value.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default config file name
pub const CONFIG_FILE: &str = "cc-relay.toml";

/// Main configuration for cc-relay
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub sessions: SessionsConfig,
    pub context: ContextConfig,
    pub storage: StorageConfig,
    pub access: AccessConfig,
}

/// Claude CLI invocation and query limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Path to the `claude` executable
    pub cli_path: PathBuf,
    /// Working directory for every query
    pub project_path: PathBuf,
    /// Model passed as `--model` (CLI default when unset)
    pub model: Option<String>,
    pub query_timeout_secs: u64,
    /// How long a query may wait for a free slot
    pub queue_timeout_secs: u64,
    pub max_concurrent_queries: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            cli_path: PathBuf::from("claude"),
            project_path: PathBuf::from("."),
            model: None,
            query_timeout_secs: 300,
            queue_timeout_secs: 60,
            max_concurrent_queries: 3,
        }
    }
}

impl BackendConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }
}

/// In-memory session limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub max_sessions: usize,
    /// Sessions with no successful query for this long are dropped
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            idle_timeout_secs: 30 * 60,
            sweep_interval_secs: 5 * 60,
        }
    }
}

impl SessionsConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Context expiry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub ttl_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 2 * 60 * 60,
            cleanup_interval_secs: 5 * 60,
        }
    }
}

impl ContextConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to SQLite database file
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/cc-relay.db"),
        }
    }
}

/// Who may talk to the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Chat or sender ids allowed in. Empty allows everyone.
    pub allowed_chat_ids: Vec<String>,
    pub max_query_length: usize,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            allowed_chat_ids: Vec::new(),
            max_query_length: 10_000,
        }
    }
}

impl AccessConfig {
    pub fn allows(&self, chat_id: &str, sender_id: &str) -> bool {
        self.allowed_chat_ids.is_empty()
            || self
                .allowed_chat_ids
                .iter()
                .any(|id| id == chat_id || id == sender_id)
    }
}

impl Config {
    /// Replace `${VAR_NAME}` with the variable's value (empty when unset).
    fn expand_env_vars(value: &str) -> String {
        let mut result = String::with_capacity(value.len());
        let mut chars = value.chars().peekable();

        while let Some(c) = chars.next() {
            if c == '$' && chars.peek() == Some(&'{') {
                chars.next();

                let mut var_name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    var_name.push(c);
                }

                if let Ok(env_value) = std::env::var(&var_name) {
                    result.push_str(&env_value);
                }
            } else {
                result.push(c);
            }
        }

        result
    }

    /// Parse TOML text without consulting the environment.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))
    }

    /// Load a TOML file, expand `${VAR}` references, then apply env overrides.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let mut config = Self::from_toml_str(&Self::expand_env_vars(&content))?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Read `cc-relay.toml` when present, otherwise the environment only.
    pub fn load() -> Result<Self> {
        if Path::new(CONFIG_FILE).exists() {
            return Self::from_toml_file(CONFIG_FILE);
        }
        Self::from_env()
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(path) = env_string("RELAY_DB_PATH") {
            self.storage.db_path = PathBuf::from(path);
        }
        if let Some(path) = env_string("CLAUDE_CLI_PATH") {
            self.backend.cli_path = PathBuf::from(path);
        }
        if let Some(path) = env_string("CLAUDE_PROJECT_PATH") {
            self.backend.project_path = PathBuf::from(path);
        }
        if let Some(model) = env_string("CLAUDE_MODEL") {
            self.backend.model = Some(model);
        }
        if let Some(secs) = env_parse("QUERY_TIMEOUT_SECS")? {
            self.backend.query_timeout_secs = secs;
        }
        if let Some(n) = env_parse("MAX_CONCURRENT_QUERIES")? {
            self.backend.max_concurrent_queries = n;
        }
        if let Some(n) = env_parse("MAX_SESSIONS")? {
            self.sessions.max_sessions = n;
        }
        if let Some(secs) = env_parse("CONTEXT_TTL_SECS")? {
            self.context.ttl_secs = secs;
        }
        if let Some(secs) = env_parse("CLEANUP_INTERVAL_SECS")? {
            self.context.cleanup_interval_secs = secs;
        }
        if let Some(ids) = env_string("ALLOWED_CHAT_IDS") {
            self.access.allowed_chat_ids = split_list(&ids);
        }
        Ok(())
    }

    /// Reject settings the lifecycle engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let checks: [(bool, &str); 10] = [
            (self.backend.query_timeout_secs == 0, "backend.query_timeout_secs must be positive"),
            (self.backend.queue_timeout_secs == 0, "backend.queue_timeout_secs must be positive"),
            (self.backend.max_concurrent_queries == 0, "backend.max_concurrent_queries must be positive"),
            (self.sessions.max_sessions == 0, "sessions.max_sessions must be positive"),
            (self.sessions.idle_timeout_secs == 0, "sessions.idle_timeout_secs must be positive"),
            (self.sessions.sweep_interval_secs == 0, "sessions.sweep_interval_secs must be positive"),
            (self.context.ttl_secs == 0, "context.ttl_secs must be positive"),
            (self.context.cleanup_interval_secs == 0, "context.cleanup_interval_secs must be positive"),
            (self.storage.db_path.as_os_str().is_empty(), "storage.db_path is required"),
            (self.access.max_query_length == 0, "access.max_query_length must be positive"),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(Error::Config(message.to_string())),
            None => Ok(()),
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Configuration:")?;
        writeln!(f, "  CLI path:           {}", self.backend.cli_path.display())?;
        writeln!(f, "  Project path:       {}", self.backend.project_path.display())?;
        writeln!(f, "  Model:              {}", self.backend.model.as_deref().unwrap_or("(default)"))?;
        writeln!(f, "  Query timeout:      {}s", self.backend.query_timeout_secs)?;
        writeln!(f, "  Concurrent queries: {}", self.backend.max_concurrent_queries)?;
        writeln!(f, "  Max sessions:       {}", self.sessions.max_sessions)?;
        writeln!(f, "  Context TTL:        {}s", self.context.ttl_secs)?;
        writeln!(f, "  Cleanup interval:   {}s", self.context.cleanup_interval_secs)?;
        writeln!(f, "  Database:           {}", self.storage.db_path.display())?;
        write!(f, "  Allowed chats:      {}", self.access.allowed_chat_ids.len())
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env_string(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} is not a valid number: {}", name, raw))),
        None => Ok(None),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
