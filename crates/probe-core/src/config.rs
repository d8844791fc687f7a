//! Configuration parsing for the run client.
//!
//! Uses a `key=value` file format, one setting per line, `#` comments.
//! Precedence: CLI flags > `--config` file > `.probe/config` >
//! `$XDG_CONFIG_HOME/probe/config` > defaults.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Public cloud API endpoint.
pub const DEFAULT_API_URL: &str = "https://api.probe.dev";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // API access
    pub api_url: String,
    pub token: Option<String>,
    /// Account to act on behalf of (admin impersonation).
    pub account: Option<String>,

    // Run defaults
    pub browser: String,
    pub width: u32,
    pub height: u32,
    pub region: String,
    pub user_agent: Option<String>,

    // Session budgets
    pub start_timeout_min: u64,
    pub run_timeout_min: u64,
    pub max_starts: u32,
    pub max_system_error_starts: u32,
    pub disable_system_error_retry: bool,

    /// Output format name: `text`, `table` or `json`.
    pub output: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            token: None,
            account: None,
            browser: "chrome".to_string(),
            width: 1920,
            height: 1080,
            region: "us-east".to_string(),
            user_agent: None,
            start_timeout_min: 15,
            run_timeout_min: 65,
            max_starts: 130,
            max_system_error_starts: 5,
            disable_system_error_retry: false,
            output: "text".to_string(),
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load defaults, then the user and workspace config files when present.
    ///
    /// An explicit `--config` path is applied last and must exist.
    pub fn load(workspace_root: &Path, explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(user) = user_config_path() {
            if user.is_file() {
                config.load_file(&user)?;
            }
        }
        let workspace = workspace_root.join(".probe/config");
        if workspace.is_file() {
            config.load_file(&workspace)?;
        }
        if let Some(path) = explicit {
            config.load_file(path)?;
        }
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn optional(value: &str) -> Option<String> {
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "api_url" => self.api_url = value.trim_end_matches('/').to_string(),
            "token" => self.token = Self::optional(value),
            "account" => self.account = Self::optional(value),
            "browser" => self.browser = value.to_string(),
            "width" => self.width = Self::parse_int(key, value)?,
            "height" => self.height = Self::parse_int(key, value)?,
            "region" => self.region = value.to_string(),
            "user_agent" => self.user_agent = Self::optional(value),
            "start_timeout_min" => self.start_timeout_min = Self::parse_int(key, value)?,
            "run_timeout_min" => self.run_timeout_min = Self::parse_int(key, value)?,
            "max_starts" => self.max_starts = Self::parse_int(key, value)?,
            "max_system_error_starts" => {
                self.max_system_error_starts = Self::parse_int(key, value)?;
            }
            "disable_system_error_retry" => {
                self.disable_system_error_retry = Self::parse_bool(key, value)?;
            }
            "output" => {
                self.output = match value {
                    "text" | "table" | "json" => value.to_string(),
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "output must be 'text', 'table', or 'json', got '{value}'"
                        )))
                    }
                }
            }
            _ => {
                // Unknown keys are tolerated so newer config files keep working.
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }
}

/// `$XDG_CONFIG_HOME/probe/config`, falling back to `~/.config/probe/config`.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("probe/config"))
}

mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
    }
}
