//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Engine-wide configuration shared by every session.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between claim attempts in each session's processing loop.
    pub poll_interval: Duration,
    /// Location of the libSQL database file.
    pub db_path: PathBuf,
    /// How long a write transaction waits on a lock held by another process.
    pub busy_timeout: Duration,
    /// Directory for daily rolling log files. Logs go to stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            db_path: PathBuf::from("./data/persistent-agent.db"),
            busy_timeout: Duration::from_secs(5),
            log_dir: None,
        }
    }
}

impl EngineConfig {
    /// Build from `PERSISTENT_AGENT_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            poll_interval: env_millis("PERSISTENT_AGENT_POLL_MS")?
                .unwrap_or(defaults.poll_interval),
            db_path: std::env::var("PERSISTENT_AGENT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            busy_timeout: env_millis("PERSISTENT_AGENT_BUSY_TIMEOUT_MS")?
                .unwrap_or(defaults.busy_timeout),
            log_dir: std::env::var("PERSISTENT_AGENT_LOG_DIR")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        })
    }
}

/// Per-agent settings applied to every session the agent runs.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub agent_id: String,
    pub team_id: String,
    /// Model name sent with every completion request.
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Size of the model's context window, used for usage reporting.
    pub context_window_tokens: usize,
    /// Extra instructions prepended to the base system prompt.
    pub system_prompt: Option<String>,
    /// External tools this agent may call. `None` enables every registered tool.
    /// Built-in tools are always enabled.
    pub allowed_tools: Option<Vec<String>>,
}

impl Default for AgentProfile {
    fn default() -> Self {
        Self {
            agent_id: "default".to_string(),
            team_id: "default".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_tokens: 4096,
            context_window_tokens: 128_000,
            system_prompt: None,
            allowed_tools: None,
        }
    }
}

impl AgentProfile {
    /// Defaults overridden by `PERSISTENT_AGENT_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut profile = Self::default();
        if let Ok(id) = std::env::var("PERSISTENT_AGENT_AGENT_ID") {
            profile.agent_id = id;
        }
        if let Ok(team) = std::env::var("PERSISTENT_AGENT_TEAM_ID") {
            profile.team_id = team;
        }
        if let Ok(model) = std::env::var("PERSISTENT_AGENT_MODEL") {
            profile.model = model;
        }
        if let Some(temperature) = env_parse::<f32>("PERSISTENT_AGENT_TEMPERATURE")? {
            profile.temperature = temperature;
        }
        if let Some(max_tokens) = env_parse::<u32>("PERSISTENT_AGENT_MAX_TOKENS")? {
            profile.max_tokens = max_tokens;
        }
        if let Some(window) = env_parse::<usize>("PERSISTENT_AGENT_CONTEXT_WINDOW")? {
            profile.context_window_tokens = window;
        }
        profile.system_prompt = std::env::var("PERSISTENT_AGENT_SYSTEM_PROMPT").ok();
        profile.allowed_tools = std::env::var("PERSISTENT_AGENT_ALLOWED_TOOLS")
            .ok()
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            });
        Ok(profile)
    }
}

/// Web search backend settings.
#[derive(Debug, Clone, Default)]
pub struct SearchConfig {
    /// JSON search endpoint (SearXNG-compatible). Search is disabled when unset.
    pub endpoint: Option<String>,
    pub max_results: usize,
}

impl SearchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            endpoint: std::env::var("PERSISTENT_AGENT_SEARCH_URL").ok(),
            max_results: env_parse("PERSISTENT_AGENT_SEARCH_MAX_RESULTS")?.unwrap_or(5),
        })
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn env_millis(key: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_millis))
}
