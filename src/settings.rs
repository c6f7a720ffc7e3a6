use crate::streaming::{StreamConfig, DEFAULT_DIAGRAM_MAX_CHARS, DEFAULT_HOLD_BACK_CHARS};
use crate::types::TurnAction;
use crate::utils::offsets::OffsetEncoding;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Host settings loaded from ~/.config/ageaf-host/settings.json
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    pub hold_back_chars: usize,
    pub turn_timeout_secs: u64,
    pub offset_encoding: OffsetEncoding,
    pub diagram_max_chars: usize,
    pub cli: CliSettings,
    pub app_server: AppServerSettings,
    pub byok: ByokSettings,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            hold_back_chars: DEFAULT_HOLD_BACK_CHARS,
            turn_timeout_secs: 600,
            offset_encoding: OffsetEncoding::default(),
            diagram_max_chars: DEFAULT_DIAGRAM_MAX_CHARS,
            cli: CliSettings::default(),
            app_server: AppServerSettings::default(),
            byok: ByokSettings::default(),
        }
    }
}

impl HostSettings {
    pub fn stream_config(&self, action: TurnAction) -> StreamConfig {
        StreamConfig {
            hold_back_chars: self.hold_back_chars,
            offset_encoding: self.offset_encoding,
            diagram_max_chars: self.diagram_max_chars,
            action,
        }
    }
}

/// Coding-agent CLI that prints stream-json
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliSettings {
    pub command: String,
    pub args: Vec<String>,
    pub model: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub context_window: u64,
}

impl Default for CliSettings {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: Vec::new(),
            model: None,
            working_dir: None,
            context_window: 200_000,
        }
    }
}

/// Agent app-server speaking JSON-RPC over stdio
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppServerSettings {
    pub command: String,
    pub args: Vec<String>,
    pub model: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub context_window: u64,
}

impl Default for AppServerSettings {
    fn default() -> Self {
        Self {
            command: "codex".to_string(),
            args: vec!["app-server".to_string()],
            model: None,
            working_dir: None,
            context_window: 272_000,
        }
    }
}

/// OpenAI-compatible endpoint with the user's own key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ByokSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub context_window: u64,
}

impl Default for ByokSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4.1".to_string(),
            context_window: 128_000,
        }
    }
}

pub fn default_settings_path() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
    Ok(home.join(".config").join("ageaf-host").join("settings.json"))
}

/// Loads settings from `path`, or from the default location. A missing file
/// yields the defaults.
pub fn load_settings(path: Option<&Path>) -> Result<HostSettings> {
    let settings_path = match path {
        Some(path) => path.to_path_buf(),
        None => default_settings_path()?,
    };

    if !settings_path.exists() {
        if path.is_some() {
            anyhow::bail!("Settings file {} does not exist", settings_path.display());
        }
        tracing::debug!("No settings at {}, using defaults", settings_path.display());
        return Ok(HostSettings::default());
    }

    let contents = std::fs::read_to_string(&settings_path)
        .with_context(|| format!("Failed to read settings from {}", settings_path.display()))?;
    let mut settings: HostSettings = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse settings from {}", settings_path.display()))?;

    // Secrets may reference the environment as ${VAR}
    if let Some(api_key) = &mut settings.byok.api_key {
        match substitute_env_vars(api_key) {
            Some(resolved) => *api_key = resolved,
            None if api_key.contains("${") => {
                tracing::warn!("Unresolved environment variable in byok.api_key");
                settings.byok.api_key = None;
            }
            None => {}
        }
    }
    if settings.hold_back_chars == 0 {
        tracing::warn!("hold_back_chars of 0 lets partial markers leak, using default");
        settings.hold_back_chars = DEFAULT_HOLD_BACK_CHARS;
    }

    Ok(settings)
}

fn substitute_env_vars(input: &str) -> Option<String> {
    let mut result = input.to_string();
    let mut changed = false;
    while let Some(start) = result.find("${") {
        let end = start + result[start..].find('}')?;
        let var_value = std::env::var(&result[start + 2..end]).ok()?;
        result.replace_range(start..=end, &var_value);
        changed = true;
    }

    changed.then_some(result)
}
