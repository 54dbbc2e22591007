use std::path::PathBuf;

use async_trait::async_trait;
use relay_domain::Result;
use tokio::sync::mpsc;

/// Which external CLI a conversation is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Persistent,
    Ephemeral,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Persistent => "persistent",
            BackendKind::Ephemeral => "ephemeral",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Incremental text pieces, delivered in event-arrival order. The sink is
/// an unbounded channel sender so a reader task's `send` never blocks it
/// waiting on a slow frontend socket.
pub type DeltaSink = mpsc::UnboundedSender<String>;

/// The outcome of a completed turn.
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub final_text: String,
    pub session_id: Option<String>,
}

/// One child CLI's lifecycle, reduced to the single operation every
/// conversation actually needs plus the introspection TurnCoordinator and
/// CommandRouter use to report state.
///
/// Two concrete shapes implement this: [`PersistentBackend`] keeps one
/// long-running child alive across turns; [`EphemeralBackend`] spawns a
/// fresh child per turn. Neither is generalized beyond what's listed here.
#[async_trait]
pub trait BackendProcess: Send + Sync {
    async fn start(&self) -> Result<()>;

    /// Idempotent. Bounded-time SIGTERM then SIGKILL.
    async fn stop(&self) -> Result<()>;

    async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    async fn is_alive(&self) -> bool;

    async fn is_busy(&self) -> bool;

    /// Cancel the in-flight turn, if any, without necessarily stopping the
    /// process.
    async fn abort_turn(&self);

    /// Fails with `NotRunning`, `Busy`, `Timeout`, `TurnError`, or
    /// `ChildExited`. `delta_sink` receives every non-empty incremental
    /// piece of text in arrival order before the call resolves.
    async fn send_message(&self, text: &str, delta_sink: DeltaSink) -> Result<TurnResult>;

    async fn session_id(&self) -> Option<String>;

    fn cwd(&self) -> &PathBuf;

    fn model(&self) -> Option<&str>;

    async fn total_cost_usd(&self) -> f64;

    fn kind(&self) -> BackendKind;
}
