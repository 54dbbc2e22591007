use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub max_sessions: usize,
    pub idle_timeout_ms: u64,
    pub default_cwd: PathBuf,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_sessions: d_max_sessions(),
            idle_timeout_ms: d_idle_timeout_ms(),
            default_cwd: d_default_cwd(),
        }
    }
}

fn d_max_sessions() -> usize {
    5
}

fn d_idle_timeout_ms() -> u64 {
    1_800_000
}

fn d_default_cwd() -> PathBuf {
    PathBuf::from(".")
}

/// The two model sets a turn can be routed to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    /// Path (or bare name resolved on `PATH`) to the persistent-stream CLI.
    pub persistent_path: String,
    /// Path to the ephemeral spawn-per-turn CLI.
    pub ephemeral_path: String,
    /// Optional MCP config file passed to the persistent backend.
    pub mcp_config: Option<PathBuf>,
    /// Optional system prompt text appended to every persistent-backend turn.
    pub append_system_prompt: Option<String>,
    /// Model names that route to the Ephemeral backend. Anything else
    /// (including an absent model) routes to Persistent.
    pub ephemeral_models: HashSet<String>,
    /// Model names advertised for the Persistent backend. Purely for
    /// `/v1/models` enumeration — `resolve_backend` only consults
    /// `ephemeral_models`, so an unlisted model still routes here.
    pub persistent_models: HashSet<String>,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            persistent_path: d_persistent_path(),
            ephemeral_path: d_ephemeral_path(),
            mcp_config: None,
            append_system_prompt: None,
            ephemeral_models: d_ephemeral_models(),
            persistent_models: d_persistent_models(),
        }
    }
}

fn d_persistent_path() -> String {
    "claude".to_owned()
}

fn d_ephemeral_path() -> String {
    "codex".to_owned()
}

fn d_ephemeral_models() -> HashSet<String> {
    let mut set = HashSet::new();
    set.insert("codex".to_owned());
    set.insert("gpt-5-codex".to_owned());
    set
}

fn d_persistent_models() -> HashSet<String> {
    let mut set = HashSet::new();
    set.insert("claude-opus-4".to_owned());
    set.insert("claude-sonnet-4".to_owned());
    set
}
