use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "agora_config.toml";

/// Upper bound for a single inter-turn delay.
pub const MAX_DELAY_SECS: f64 = 86_400.0;

/// Startup problems that prevent the scheduler from running at all.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("no participating agents configured")]
    NoAgents,
    #[error("invalid agent identity '{0}' (expected letters, digits, '_', '-' or '.')")]
    InvalidIdentity(String),
    #[error("agent '{0}' is configured more than once")]
    DuplicateIdentity(String),
    #[error("skip_probability must be within 0.0..=1.0, got {0}")]
    SkipProbability(f64),
    #[error("delays must be within 0..=86400s and min_delay ({min}s) <= max_delay ({max}s)")]
    DelayRange { min: f64, max: f64 },
    #[error("max_tool_calls must be at least 1")]
    ZeroToolBudget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleConfig {
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,
    #[serde(default = "default_skip_probability")]
    pub skip_probability: f64,
    #[serde(default = "default_min_delay")]
    pub min_delay_secs: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: f64,
    // Tool invocations allowed per agent turn before a forced skip
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: u32,
    #[serde(default = "default_seen_refresh_limit")]
    pub seen_refresh_limit: usize,
}

fn default_cycle_interval() -> u64 {
    300
}

fn default_skip_probability() -> f64 {
    0.2
}

fn default_min_delay() -> f64 {
    30.0
}

fn default_max_delay() -> f64 {
    120.0
}

fn default_max_tool_calls() -> u32 {
    10
}

fn default_seen_refresh_limit() -> usize {
    100
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: default_cycle_interval(),
            skip_probability: default_skip_probability(),
            min_delay_secs: default_min_delay(),
            max_delay_secs: default_max_delay(),
            max_tool_calls: default_max_tool_calls(),
            seen_refresh_limit: default_seen_refresh_limit(),
        }
    }
}

/// OpenAI-compatible endpoint (Ollama, LM Studio, vLLM, OpenAI, etc.)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_url")]
    pub api_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    2000
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: default_llm_url(),
            model: default_llm_model(),
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ForumConfig {
    /// SQLite file for the local forum. Relative paths resolve against `data_dir`.
    #[serde(default)]
    pub database_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    // Overrides llm.model for this agent only
    #[serde(default)]
    pub model: Option<String>,
}

fn default_system_prompt() -> String {
    "You are a thoughtful participant in a collaborative forum. \
     Contribute only when you have something meaningful to add."
        .to_string()
}

impl AgentProfile {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            system_prompt: default_system_prompt(),
            model: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub cycle: CycleConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub forum: ForumConfig,
    #[serde(default)]
    pub agents: Vec<AgentProfile>,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Environment overrides that did not parse, as `KEY=value`.
    #[serde(skip)]
    pub ignored_env: Vec<String>,
}

fn default_data_dir() -> String {
    "./.agent_data".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cycle: CycleConfig::default(),
            llm: LlmConfig::default(),
            forum: ForumConfig::default(),
            agents: Vec::new(),
            data_dir: default_data_dir(),
            ignored_env: Vec::new(),
        }
    }
}

const IDENTITY_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9_.\-]{0,63}$";

pub fn is_valid_identity(name: &str) -> bool {
    regex_lite::Regex::new(IDENTITY_PATTERN)
        .map(|re| re.is_match(name))
        .unwrap_or(false)
}

impl AppConfig {
    /// Load configuration from `path` (or `agora_config.toml` in the working
    /// directory), then apply environment overrides. A missing file is fine;
    /// a malformed one is not.
    ///
    /// Nothing is logged here; this runs before the subscriber is installed.
    /// Callers report the source via [`AppConfig::resolve_path`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let path = Self::resolve_path(path);
        let mut config = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config {:?}", path))?;
            Self::from_toml_str(&contents)
                .with_context(|| format!("Failed to parse config {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env();
        Ok(config)
    }

    /// The file `load` reads: `path` if given, else `agora_config.toml`.
    pub fn resolve_path(path: Option<&Path>) -> PathBuf {
        path.map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Environment overrides. Unparseable values are skipped and listed in
    /// `ignored_env`.
    pub fn apply_env(&mut self) {
        if let Some(seconds) = self.env_parse("CYCLE_INTERVAL") {
            self.cycle.cycle_interval_secs = seconds;
        }
        if let Some(probability) = self.env_parse("SKIP_PROBABILITY") {
            self.cycle.skip_probability = probability;
        }
        if let Some(seconds) = self.env_parse("MIN_DELAY") {
            self.cycle.min_delay_secs = seconds;
        }
        if let Some(seconds) = self.env_parse("MAX_DELAY") {
            self.cycle.max_delay_secs = seconds;
        }
        if let Some(calls) = self.env_parse("MAX_TOOL_CALLS") {
            self.cycle.max_tool_calls = calls;
        }

        if let Ok(dir) = env::var("AGORA_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.data_dir = dir;
            }
        }

        if let Ok(path) = env::var("FORUM_DB_PATH") {
            if !path.trim().is_empty() {
                self.forum.database_path = Some(path);
            }
        }

        if let Ok(url) = env::var("LLM_API_URL") {
            self.llm.api_url = url;
        }
        if let Ok(model) = env::var("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Ok(key) = env::var("LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }

        if let Ok(names) = env::var("AGORA_AGENTS") {
            for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                if !self.agents.iter().any(|a| a.name == name) {
                    self.agents.push(AgentProfile::named(name));
                }
            }
        }
    }

    /// Keep only the named agents, in the order given. Unknown names are
    /// added with a default profile so validation can judge them.
    pub fn restrict_agents(&mut self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        let mut selected = Vec::with_capacity(names.len());
        for name in names {
            let profile = self
                .agents
                .iter()
                .find(|a| &a.name == name)
                .cloned()
                .unwrap_or_else(|| AgentProfile::named(name.clone()));
            selected.push(profile);
        }
        self.agents = selected;
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.agents.is_empty() {
            return Err(ConfigError::NoAgents);
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if !is_valid_identity(&agent.name) {
                return Err(ConfigError::InvalidIdentity(agent.name.clone()));
            }
            if !seen.insert(agent.name.as_str()) {
                return Err(ConfigError::DuplicateIdentity(agent.name.clone()));
            }
        }

        let p = self.cycle.skip_probability;
        if !(0.0..=1.0).contains(&p) {
            return Err(ConfigError::SkipProbability(p));
        }

        let (min, max) = (self.cycle.min_delay_secs, self.cycle.max_delay_secs);
        let in_range = |secs: f64| (0.0..=MAX_DELAY_SECS).contains(&secs);
        if !(in_range(min) && in_range(max) && min <= max) {
            return Err(ConfigError::DelayRange { min, max });
        }

        if self.cycle.max_tool_calls == 0 {
            return Err(ConfigError::ZeroToolBudget);
        }

        Ok(())
    }

    pub fn agent(&self, name: &str) -> Option<&AgentProfile> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn agent_names(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.name.clone()).collect()
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.data_dir().join("agents.db")
    }

    pub fn forum_db_path(&self) -> PathBuf {
        match &self.forum.database_path {
            Some(path) if Path::new(path).is_absolute() => PathBuf::from(path),
            Some(path) => self.data_dir().join(path),
            None => self.data_dir().join("forum.db"),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }

    fn env_parse<T: std::str::FromStr>(&mut self, key: &str) -> Option<T> {
        let raw = env::var(key).ok()?;
        match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                self.ignored_env.push(format!("{}={}", key, raw));
                None
            }
        }
    }
}
