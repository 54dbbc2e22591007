mod bot;
mod server;
mod sessions;
mod workspace;

pub use bot::BotConfig;
pub use server::{CorsConfig, ServerConfig};
pub use sessions::{BackendsConfig, SessionsConfig};
pub use workspace::WorkspaceConfig;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Top-level, file-then-env layered configuration.
///
/// Loaded from an optional TOML file (path from `RELAY_CONFIG`, default
/// `config.toml`; a missing file falls back to [`Config::default`]), then
/// overridden field-by-field by the environment variables named in
/// [`Config::apply_env`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sessions: SessionsConfig,
    pub backends: BackendsConfig,
    pub workspace: WorkspaceConfig,
    pub bot: BotConfig,
}

impl Config {
    /// Load from `path` if it exists, falling back to defaults otherwise,
    /// then apply environment-variable overrides.
    pub fn load(path: &std::path::Path) -> crate::Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw)
                .map_err(|e| crate::Error::Config(format!("{}: {e}", path.display())))?
        } else {
            Config::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply the environment-variable overrides named in spec §6. Env beats
    /// file — these are meant as operational overrides on top of a checked-in
    /// config file.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("RELAY_PORT") {
            if let Ok(port) = v.parse() {
                self.server.port = port;
            }
        }
        if let Ok(v) = std::env::var("MAX_SESSIONS") {
            if let Ok(n) = v.parse() {
                self.sessions.max_sessions = n;
            }
        }
        if let Ok(v) = std::env::var("IDLE_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                self.sessions.idle_timeout_ms = n;
            }
        }
        if let Ok(v) = std::env::var("DEFAULT_CWD") {
            self.sessions.default_cwd = v.into();
        } else if let Ok(v) = std::env::var("OPENCLAW_WORKSPACE") {
            self.sessions.default_cwd = v.into();
        }
        if let Ok(v) = std::env::var("CLAUDE_PATH") {
            self.backends.persistent_path = v;
        }
        if let Ok(v) = std::env::var("CODEX_PATH") {
            self.backends.ephemeral_path = v;
        }
        if let Ok(v) = std::env::var("RELAY_MCP_CONFIG") {
            self.backends.mcp_config = Some(v.into());
        }
        if let Ok(v) = std::env::var("ARINOVA_SERVER_URL") {
            self.bot.server_url = Some(v);
        }
        if let Ok(v) = std::env::var("ARINOVA_BOT_TOKEN") {
            self.bot.bot_token = Some(v);
        }
    }

    /// Run every validation check, returning every issue found (possibly
    /// empty). Does not touch the filesystem or network — see `doctor` for
    /// the checks that actually probe backend binaries.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be non-zero".into(),
            });
        }

        if self.sessions.max_sessions < 1 {
            issues.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "sessions.max_sessions".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.sessions.idle_timeout_ms < 1000 {
            issues.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "sessions.idle_timeout_ms".into(),
                message: "must be at least 1000ms".into(),
            });
        }

        if self.backends.persistent_path.trim().is_empty() {
            issues.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "backends.persistent_path".into(),
                message: "empty; the persistent backend cannot be started".into(),
            });
        }

        if self.backends.ephemeral_path.trim().is_empty() {
            issues.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "backends.ephemeral_path".into(),
                message: "empty; the ephemeral backend cannot be started".into(),
            });
        }

        if let Some(parent) = self.workspace.state_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                issues.push(ConfigError {
                    severity: ConfigSeverity::Warning,
                    field: "workspace.state_path".into(),
                    message: format!("parent directory {} does not exist yet", parent.display()),
                });
            }
        }

        if self.bot.server_url.is_some() != self.bot.bot_token.is_some() {
            issues.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "bot".into(),
                message: "server_url and bot_token must both be set for the WS adapter to start"
                    .into(),
            });
        }

        issues
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

impl fmt::Display for ConfigSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSeverity::Error => write!(f, "ERROR"),
            ConfigSeverity::Warning => write!(f, "WARNING"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.field, self.message)
    }
}
