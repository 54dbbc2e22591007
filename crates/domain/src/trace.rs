//! Structured business events, distinct from ad-hoc log lines.
//!
//! Each variant is emitted as a single JSON-tagged `tracing::info!` line so
//! log pipelines can filter on `trace_event` without parsing prose.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    SessionCreated {
        conv_id: String,
        backend_kind: String,
        model: Option<String>,
    },
    SessionDestroyed {
        conv_id: String,
        session_id: Option<String>,
    },
    SessionEvicted {
        conv_id: String,
        session_id: Option<String>,
    },
    SessionResumed {
        conv_id: String,
        session_id: String,
    },
    BackendRestarted {
        conv_id: String,
        reason: String,
    },
    TurnStarted {
        conv_id: String,
    },
    TurnCompleted {
        conv_id: String,
        session_id: Option<String>,
        chars: usize,
    },
    TurnFailed {
        conv_id: String,
        error: String,
    },
    TurnCancelled {
        conv_id: String,
    },
    PersistenceFlushed {
        entries: usize,
    },
    CommandHandled {
        conv_id: String,
        command: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "relay_event");
    }
}
