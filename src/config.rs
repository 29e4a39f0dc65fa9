use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::engines::{EngineId, SessionDefaults, DEFAULT_EVICTION_GRACE};
use crate::inspector::DEFAULT_INSPECTOR_CAPACITY;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Could not find config directory")]
    NoConfigDir,
}

fn default_claude_cli() -> String {
    "claude".to_string()
}

fn default_permission_mode() -> String {
    "bypassPermissions".to_string()
}

fn default_iflow_cli() -> String {
    "iflow".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_grace_secs() -> u64 {
    DEFAULT_EVICTION_GRACE.as_secs()
}

fn default_inspector_capacity() -> usize {
    DEFAULT_INSPECTOR_CAPACITY
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaudeCodeSettings {
    #[serde(default = "default_claude_cli")]
    pub cli_path: String,
    #[serde(default = "default_permission_mode")]
    pub permission_mode: String,
    /// Windows only: bash used by the CLI for shell tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_bash_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Default for ClaudeCodeSettings {
    fn default() -> Self {
        Self {
            cli_path: default_claude_cli(),
            permission_mode: default_permission_mode(),
            git_bash_path: None,
            model: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IFlowSettings {
    #[serde(default = "default_iflow_cli")]
    pub cli_path: String,
    /// Overrides `~/.iflow/projects` when locating session transcripts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projects_dir: Option<PathBuf>,
}

impl Default for IFlowSettings {
    fn default() -> Self {
        Self {
            cli_path: default_iflow_cli(),
            projects_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenAiSettings {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
            model: default_openai_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    #[serde(default)]
    pub default_engine: EngineId,
    #[serde(default)]
    pub claude_code: ClaudeCodeSettings,
    #[serde(default)]
    pub iflow: IFlowSettings,
    #[serde(default)]
    pub openai: OpenAiSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_timeout_secs: Option<u64>,
    #[serde(default = "default_grace_secs")]
    pub eviction_grace_secs: u64,
    #[serde(default = "default_inspector_capacity")]
    pub inspector_capacity: usize,
    /// Older configs stored the Claude binary here.
    #[serde(default, skip_serializing)]
    pub claude_cmd: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_engine: EngineId::default(),
            claude_code: ClaudeCodeSettings::default(),
            iflow: IFlowSettings::default(),
            openai: OpenAiSettings::default(),
            work_dir: None,
            task_timeout_secs: None,
            eviction_grace_secs: default_grace_secs(),
            inspector_capacity: default_inspector_capacity(),
            claude_cmd: None,
        }
    }
}

impl RuntimeConfig {
    /// Default location: `<config dir>/polaris/config.json`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(dirs::config_dir()
            .ok_or(ConfigError::NoConfigDir)?
            .join("polaris")
            .join("config.json"))
    }

    /// Load from the default location, falling back to defaults when no file exists.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)?;
            serde_json::from_str::<RuntimeConfig>(&content)?
        } else {
            log::debug!("[config] {} not found, using defaults", path.display());
            RuntimeConfig::default()
        };
        config.migrate();
        config.apply_env();
        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::default_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let dir = path.parent().ok_or(ConfigError::NoConfigDir)?;
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        let content = serde_json::to_string_pretty(self)?;

        // Write to temp file, then atomic rename
        let mut temp_file = NamedTempFile::new_in(dir)?;
        temp_file.write_all(content.as_bytes())?;
        temp_file
            .persist(path)
            .map_err(|e| ConfigError::Io(e.error))?;
        Ok(())
    }

    /// Move the legacy `claudeCmd` field into `claudeCode.cliPath`.
    ///
    /// An explicitly configured `cliPath` wins over the legacy value.
    pub fn migrate(&mut self) {
        if let Some(cmd) = self.claude_cmd.take() {
            let cmd = cmd.trim().to_string();
            if !cmd.is_empty() && self.claude_code.cli_path == default_claude_cli() {
                log::info!("[config] migrating claudeCmd to claudeCode.cliPath");
                self.claude_code.cli_path = cmd;
            }
        }
    }

    /// Fill an empty OpenAI key from `POLARIS_OPENAI_API_KEY` or `OPENAI_API_KEY`.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|name| std::env::var(name).ok());
    }

    fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if !self.openai.api_key.is_empty() {
            return;
        }
        if let Some(key) = ["POLARIS_OPENAI_API_KEY", "OPENAI_API_KEY"]
            .into_iter()
            .filter_map(|name| lookup(name))
            .find(|value| !value.trim().is_empty())
        {
            self.openai.api_key = key.trim().to_string();
        }
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn eviction_grace(&self) -> Duration {
        Duration::from_secs(self.eviction_grace_secs)
    }

    pub fn session_defaults(&self) -> SessionDefaults {
        SessionDefaults {
            work_dir: self.work_dir.clone(),
            task_timeout: self.task_timeout(),
        }
    }
}
