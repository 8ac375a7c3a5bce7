use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::permission::{PermissionMode, DEFAULT_PREVIEW_CHARS};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
pub const DEFAULT_CLI: &str = "claude";
pub const DEFAULT_PERMISSION_TIMEOUT_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_PERMISSION_RETENTION_SECS: u64 = 25 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default, rename = "log_level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    #[serde(
        default,
        rename = "default-cli",
        alias = "default_cli",
        skip_serializing_if = "Option::is_none"
    )]
    pub default_cli: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<PermissionsConfig>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cli: BTreeMap<String, CliConfig>,

    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(rename = "bind-addr", alias = "bind_addr", default)]
    pub bind_addr: String,

    /// URL agent hooks use to reach this server. Derived from the bound
    /// address when unset.
    #[serde(
        rename = "public-url",
        alias = "public_url",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub public_url: Option<String>,

    #[serde(
        rename = "projects-dir",
        alias = "projects_dir",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub projects_dir: Option<String>,

    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, toml::Value>,
}

impl ServerConfig {
    pub fn effective_bind_addr(&self) -> &str {
        let trimmed = self.bind_addr.trim();
        if trimmed.is_empty() {
            DEFAULT_BIND_ADDR
        } else {
            trimmed
        }
    }

    pub fn effective_public_url(&self) -> Option<&str> {
        self.public_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionsConfig {
    /// Seconds a tool use may wait for a decision before it is denied.
    #[serde(
        rename = "timeout-secs",
        alias = "timeout_secs",
        default = "PermissionsConfig::default_timeout_secs"
    )]
    pub timeout_secs: u64,

    /// Seconds after creation that a permission record is kept, resolved or not.
    #[serde(
        rename = "retention-secs",
        alias = "retention_secs",
        default = "PermissionsConfig::default_retention_secs"
    )]
    pub retention_secs: u64,

    #[serde(
        rename = "preview-chars",
        alias = "preview_chars",
        default = "PermissionsConfig::default_preview_chars"
    )]
    pub preview_chars: usize,

    #[serde(rename = "default-mode", alias = "default_mode", default)]
    pub default_mode: PermissionMode,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_PERMISSION_TIMEOUT_SECS,
            retention_secs: DEFAULT_PERMISSION_RETENTION_SECS,
            preview_chars: DEFAULT_PREVIEW_CHARS,
            default_mode: PermissionMode::Default,
        }
    }
}

impl PermissionsConfig {
    fn default_timeout_secs() -> u64 {
        DEFAULT_PERMISSION_TIMEOUT_SECS
    }

    fn default_retention_secs() -> u64 {
        DEFAULT_PERMISSION_RETENTION_SECS
    }

    fn default_preview_chars() -> usize {
        DEFAULT_PREVIEW_CHARS
    }

    /// Zero disables expiry.
    pub fn effective_timeout_secs(&self) -> Option<u64> {
        (self.timeout_secs > 0).then_some(self.timeout_secs)
    }

    pub fn effective_retention_secs(&self) -> u64 {
        if self.retention_secs == 0 {
            DEFAULT_PERMISSION_RETENTION_SECS
        } else {
            self.retention_secs.max(self.timeout_secs)
        }
    }

    pub fn effective_preview_chars(&self) -> usize {
        if self.preview_chars == 0 {
            DEFAULT_PREVIEW_CHARS
        } else {
            self.preview_chars
        }
    }
}

/// How to launch one agent CLI.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CliConfig {
    pub command: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(
        rename = "model-flag",
        alias = "model_flag",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub model_flag: Option<String>,

    #[serde(
        rename = "resume-flag",
        alias = "resume_flag",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub resume_flag: Option<String>,

    #[serde(
        rename = "permission-mode-flag",
        alias = "permission_mode_flag",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub permission_mode_flag: Option<String>,

    /// Flag used to pass the PreToolUse hook settings JSON. CLIs without it
    /// are only constrained by their own permission mode.
    #[serde(
        rename = "settings-flag",
        alias = "settings_flag",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub settings_flag: Option<String>,

    #[serde(rename = "prompt-mode", alias = "prompt_mode", default)]
    pub prompt_mode: PromptMode,
}

/// How the instruction reaches the CLI.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PromptMode {
    /// One `stream-json` user message on stdin.
    #[serde(rename = "stream-json")]
    #[default]
    StreamJson,
    /// Trailing positional argument.
    #[serde(rename = "arg")]
    Arg,
}

impl CliConfig {
    fn print_mode(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_owned(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: BTreeMap::new(),
            model_flag: Some("--model".to_owned()),
            resume_flag: Some("--resume".to_owned()),
            permission_mode_flag: None,
            settings_flag: None,
            prompt_mode: PromptMode::Arg,
        }
    }
}

/// CLIs usable without any `[cli.*]` table.
pub fn builtin_clis() -> BTreeMap<String, CliConfig> {
    let claude = CliConfig {
        permission_mode_flag: Some("--permission-mode".to_owned()),
        settings_flag: Some("--settings".to_owned()),
        prompt_mode: PromptMode::StreamJson,
        ..CliConfig::print_mode(
            "claude",
            &[
                "--print",
                "--output-format",
                "stream-json",
                "--input-format",
                "stream-json",
                "--verbose",
            ],
        )
    };

    let cursor = CliConfig::print_mode(
        "cursor-agent",
        &["--print", "--output-format", "stream-json"],
    );

    let qwen = CliConfig::print_mode("qwen", &["--output-format", "stream-json"]);

    BTreeMap::from([
        ("claude".to_owned(), claude),
        ("cursor".to_owned(), cursor),
        ("qwen".to_owned(), qwen),
    ])
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid log level: {value}")]
    InvalidLogLevel { value: String },
    #[error("invalid bind address: {value}")]
    InvalidBindAddr { value: String },
    #[error("invalid cli name: {name}")]
    InvalidCliName { name: String },
    #[error("cli {name} has an empty command")]
    EmptyCommand { name: String },
    #[error("default cli is not configured: {name}")]
    UnknownDefaultCli { name: String },
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

impl ConfigFile {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(level) = self.log_level.as_deref().map(str::trim) {
            if !level.is_empty() && !LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
                return Err(ConfigError::InvalidLogLevel {
                    value: level.to_owned(),
                });
            }
        }

        if let Some(server) = &self.server {
            let addr = server.effective_bind_addr();
            if !addr.contains(':') {
                return Err(ConfigError::InvalidBindAddr {
                    value: addr.to_owned(),
                });
            }
        }

        for (name, cli) in &self.cli {
            validate_cli_name(name)?;
            if cli.command.trim().is_empty() {
                return Err(ConfigError::EmptyCommand { name: name.clone() });
            }
        }

        let default_cli = self.effective_default_cli();
        if self.cli_config(default_cli).is_none() {
            return Err(ConfigError::UnknownDefaultCli {
                name: default_cli.to_owned(),
            });
        }

        Ok(())
    }

    pub fn effective_server(&self) -> ServerConfig {
        self.server.clone().unwrap_or_default()
    }

    pub fn effective_permissions(&self) -> PermissionsConfig {
        self.permissions.clone().unwrap_or_default()
    }

    pub fn effective_default_cli(&self) -> &str {
        self.default_cli
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_CLI)
    }

    /// Configured CLI by name, falling back to the built-in table.
    pub fn cli_config(&self, name: &str) -> Option<CliConfig> {
        let name = name.trim();
        self.cli
            .get(name)
            .cloned()
            .or_else(|| builtin_clis().remove(name))
    }

    pub fn cli_names(&self) -> Vec<String> {
        let mut names = builtin_clis().into_keys().collect::<Vec<_>>();
        for name in self.cli.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names.sort();
        names
    }
}

fn validate_cli_name(name: &str) -> Result<(), ConfigError> {
    let trimmed = name.trim();
    let ok = !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidCliName {
            name: trimmed.to_owned(),
        })
    }
}
