use relay_domain::trace::TraceEvent;
use relay_domain::Config;
use relay_sessions::{CreateSessionParams, SessionRegistry};

use crate::runtime::overrides::ConversationOverrides;

/// Recognizes the administrative slash-commands and operates on
/// SessionRegistry + ConversationOverrides directly, passed in per call so
/// no two-way reference with the registry ever forms.
pub struct CommandRouter;

impl CommandRouter {
    /// Returns `None` for anything that isn't a recognized command, so the
    /// caller can send the text on as a regular prompt.
    pub async fn try_handle(
        conv_id: &str,
        line: &str,
        registry: &SessionRegistry,
        overrides: &ConversationOverrides,
        config: &Config,
    ) -> Option<String> {
        let line = line.trim();
        if !line.starts_with('/') {
            return None;
        }
        let mut parts = line[1..].splitn(2, char::is_whitespace);
        let command = parts.next().unwrap_or("").to_lowercase();
        let rest = parts.next().unwrap_or("").trim();

        let reply = match command.as_str() {
            "new" => Some(cmd_new(conv_id, rest, registry, overrides).await),
            "sessions" => Some(cmd_sessions(registry).await),
            "status" => Some(cmd_status(conv_id, registry).await),
            "help" => Some(cmd_help()),
            "stop" => Some(cmd_stop(conv_id, registry).await),
            "resume" => Some(cmd_resume(conv_id, rest, registry).await),
            "model" => Some(cmd_model(conv_id, rest, registry, overrides, config).await),
            "cost" => Some(cmd_cost(conv_id, registry).await),
            "compact" => Some(cmd_compact(conv_id, registry).await),
            _ => None,
        };

        if reply.is_some() {
            TraceEvent::CommandHandled {
                conv_id: conv_id.to_owned(),
                command,
            }
            .emit();
        }
        reply
    }
}

async fn cmd_new(
    conv_id: &str,
    path: &str,
    registry: &SessionRegistry,
    overrides: &ConversationOverrides,
) -> String {
    if !path.is_empty() {
        let candidate = std::path::PathBuf::from(path);
        if !candidate.exists() {
            return format!("path does not exist: {path}");
        }
        overrides.set_cwd(conv_id, candidate);
    }
    registry.persistence().clear(conv_id);
    registry.destroy_session(conv_id).await;
    let cwd = overrides
        .cwd(conv_id)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<default>".to_owned());
    format!("Opened new session, cwd={cwd}")
}

async fn cmd_sessions(registry: &SessionRegistry) -> String {
    let sessions = registry.list_sessions().await;
    if sessions.is_empty() {
        return "no sessions".to_owned();
    }
    let mut lines = vec!["conv       alive  backend     model            session".to_owned()];
    for s in sessions {
        lines.push(format!(
            "{:<10} {:<6} {:<11} {:<16} {}",
            s.conv_id.as_deref().unwrap_or("-"),
            s.alive,
            s.backend_kind,
            s.model.as_deref().unwrap_or("-"),
            s.session_id
                .as_deref()
                .map(|id| id.chars().take(8).collect::<String>())
                .unwrap_or_else(|| "-".into()),
        ));
    }
    lines.join("\n")
}

async fn cmd_status(conv_id: &str, registry: &SessionRegistry) -> String {
    match registry.get_session(conv_id).await {
        Some(session) => {
            let session_id = session.process.session_id().await;
            let cost = session.process.total_cost_usd().await;
            format!(
                "backend={} cwd={} session={} model={} cost=${:.4}",
                session.backend_kind,
                session.cwd.display(),
                session_id
                    .as_deref()
                    .map(|id| id.chars().take(8).collect::<String>())
                    .unwrap_or_else(|| "-".into()),
                session.model.as_deref().unwrap_or("-"),
                cost,
            )
        }
        None => "no active session".to_owned(),
    }
}

fn cmd_help() -> String {
    [
        "/new [path]      start a fresh session, optionally in a new cwd",
        "/sessions        list live and recently-dead sessions",
        "/status          show the active session's backend/cwd/model/cost",
        "/stop            abort the in-flight turn",
        "/resume <prefix> resume a session by session-id prefix",
        "/model [name]    show or set the model for this conversation",
        "/cost            show accumulated cost",
        "/compact         compact the active session's history",
        "/help            show this text",
    ]
    .join("\n")
}

async fn cmd_stop(conv_id: &str, registry: &SessionRegistry) -> String {
    match registry.get_session(conv_id).await {
        Some(session) if session.is_busy().await => {
            session.process.abort_turn().await;
            "aborted".to_owned()
        }
        Some(_) => "nothing to abort".to_owned(),
        None => "no active session".to_owned(),
    }
}

async fn cmd_resume(conv_id: &str, prefix: &str, registry: &SessionRegistry) -> String {
    if prefix.is_empty() {
        match registry.resume_session(conv_id, None).await {
            Ok(_) => "resumed".to_owned(),
            Err(e) => format!("resume failed: {e}"),
        }
    } else {
        let matches: Vec<String> = registry
            .list_sessions()
            .await
            .into_iter()
            .filter_map(|s| s.session_id)
            .filter(|id| id.starts_with(prefix))
            .collect();
        match matches.as_slice() {
            [] => format!("no session id starts with {prefix}"),
            [id] => match registry.resume_session(conv_id, Some(id.clone())).await {
                Ok(_) => "resumed".to_owned(),
                Err(e) => format!("resume failed: {e}"),
            },
            _ => format!("ambiguous prefix {prefix}, matches {} sessions", matches.len()),
        }
    }
}

async fn cmd_model(
    conv_id: &str,
    name: &str,
    registry: &SessionRegistry,
    overrides: &ConversationOverrides,
    config: &Config,
) -> String {
    if name.is_empty() {
        let active = overrides.model(conv_id);
        let mut models: Vec<&String> = config
            .backends
            .persistent_models
            .iter()
            .chain(config.backends.ephemeral_models.iter())
            .collect();
        models.sort();
        let mut lines = vec!["known models:".to_owned()];
        for model in models {
            let marker = if active.as_deref() == Some(model.as_str()) {
                "*"
            } else {
                " "
            };
            lines.push(format!("{marker} {model}"));
        }
        return lines.join("\n");
    }

    let new_kind = registry.resolve_backend(Some(name));
    let changes_kind = match registry.get_session(conv_id).await {
        Some(session) => session.backend_kind != new_kind,
        None => false,
    };

    overrides.set_model(conv_id, Some(name.to_owned()));

    if changes_kind {
        registry.persistence().clear(conv_id);
        registry.destroy_session(conv_id).await;
    }

    format!("model set to {name}")
}

async fn cmd_cost(conv_id: &str, registry: &SessionRegistry) -> String {
    match registry.get_session(conv_id).await {
        Some(session) => {
            let cost = session.process.total_cost_usd().await;
            if cost > 0.0 {
                format!("${cost:.4}")
            } else {
                "no data".to_owned()
            }
        }
        None => "no data".to_owned(),
    }
}

async fn cmd_compact(conv_id: &str, registry: &SessionRegistry) -> String {
    let current = registry.get_session(conv_id).await;
    let Some(session) = current else {
        return "no active session".to_owned();
    };
    let session_id = session.process.session_id().await;
    registry.destroy_session(conv_id).await;

    let result = registry
        .create_session(
            conv_id,
            CreateSessionParams {
                cwd: Some(session.cwd.clone()),
                model: session.model.clone(),
                resume_id: session_id,
                compact: true,
            },
        )
        .await;

    match result {
        Ok(_) => "compacted".to_owned(),
        Err(e) => format!("compact failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_backends::testutil::FakeBackend;
    use relay_backends::BackendKind;
    use relay_sessions::{PersistenceStore, Session, SessionRegistryConfig};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn test_config() -> SessionRegistryConfig {
        SessionRegistryConfig {
            max_sessions: 5,
            idle_timeout_ms: 1_800_000,
            default_cwd: PathBuf::from("/tmp"),
            persistent_path: "unreachable-claude-binary".into(),
            ephemeral_path: "unreachable-codex-binary".into(),
            ephemeral_models: Default::default(),
            mcp_config: None,
            append_system_prompt: None,
        }
    }

    fn test_store() -> PersistenceStore {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bridge-sessions.json");
        std::mem::forget(dir);
        PersistenceStore::new(path)
    }

    async fn registry_with_fake_session(conv_id: &str) -> Arc<SessionRegistry> {
        registry_with_fake_session_on(SessionRegistry::new(test_config(), test_store()), conv_id).await
    }

    async fn registry_with_fake_session_on(
        registry: Arc<SessionRegistry>,
        conv_id: &str,
    ) -> Arc<SessionRegistry> {
        let process: Arc<dyn relay_backends::BackendProcess> = Arc::new(
            FakeBackend::new(BackendKind::Persistent, PathBuf::from("/tmp"), None)
                .with_session_id("S1"),
        );
        process.start().await.unwrap();
        let session = Arc::new(Session::new(
            conv_id.to_owned(),
            BackendKind::Persistent,
            process,
            PathBuf::from("/tmp"),
            None,
        ));
        session.touch();
        registry.insert_session_for_tests(session);
        registry
    }

    #[tokio::test]
    async fn help_lists_every_command() {
        let reply = cmd_help();
        for cmd in ["/new", "/sessions", "/status", "/stop", "/resume", "/model", "/cost", "/compact", "/help"] {
            assert!(reply.contains(cmd), "missing {cmd} in help text");
        }
    }

    #[tokio::test]
    async fn sessions_with_none_live_reports_no_sessions() {
        let registry = SessionRegistry::new(test_config(), test_store());
        assert_eq!(cmd_sessions(&registry).await, "no sessions");
    }

    #[tokio::test]
    async fn status_with_no_active_session() {
        let registry = SessionRegistry::new(test_config(), test_store());
        assert_eq!(cmd_status("nope", &registry).await, "no active session");
    }

    #[tokio::test]
    async fn status_reports_backend_and_model_for_an_active_session() {
        let registry = registry_with_fake_session("c1").await;
        let status = cmd_status("c1", &registry).await;
        assert!(status.contains("backend=persistent"));
        assert!(status.contains("session=S1"));
    }

    #[tokio::test]
    async fn new_with_a_nonexistent_path_does_not_mutate_state() {
        let registry = registry_with_fake_session("c1").await;
        let overrides = ConversationOverrides::default();
        let reply = cmd_new("c1", "/does/not/exist/anywhere", &registry, &overrides).await;
        assert!(reply.contains("does not exist"));
        // session untouched since the path check failed before any mutation
        assert!(registry.get_session("c1").await.is_some());
    }

    #[tokio::test]
    async fn new_clears_persistence_and_destroys_the_session() {
        let registry = registry_with_fake_session("c1").await;
        registry
            .persistence()
            .persist("c1", "S1", BackendKind::Persistent, None, PathBuf::from("/tmp"));
        let overrides = ConversationOverrides::default();

        let reply = cmd_new("c1", "", &registry, &overrides).await;
        assert!(reply.starts_with("Opened new session"));
        assert!(registry.get_session("c1").await.is_none());
        assert!(registry.persistence().get("c1").is_none());
    }

    #[tokio::test]
    async fn stop_with_no_active_session() {
        let registry = SessionRegistry::new(test_config(), test_store());
        assert_eq!(cmd_stop("nope", &registry).await, "no active session");
    }

    #[tokio::test]
    async fn stop_on_a_non_busy_session_is_a_no_op() {
        let registry = registry_with_fake_session("c1").await;
        assert_eq!(cmd_stop("c1", &registry).await, "nothing to abort");
    }

    #[tokio::test]
    async fn cost_with_no_data_reports_no_data() {
        let registry = registry_with_fake_session("c1").await;
        assert_eq!(cmd_cost("c1", &registry).await, "no data");
    }

    #[tokio::test]
    async fn model_without_an_argument_lists_known_models_marking_the_active_one() {
        let registry = SessionRegistry::new(test_config(), test_store());
        let overrides = ConversationOverrides::default();
        overrides.set_model("c1", Some("claude-opus-4".to_owned()));
        let mut config = Config::default();
        config.backends.persistent_models.insert("claude-opus-4".into());

        let reply = cmd_model("c1", "", &registry, &overrides, &config).await;
        assert!(reply.contains("* claude-opus-4"));
    }

    #[tokio::test]
    async fn model_switch_to_a_different_backend_kind_clears_persistence() {
        let mut registry_config = test_config();
        registry_config.ephemeral_models.insert("codex".into());
        let registry = registry_with_fake_session_on(
            SessionRegistry::new(registry_config, test_store()),
            "c1",
        )
        .await;
        registry
            .persistence()
            .persist("c1", "S1", BackendKind::Persistent, None, PathBuf::from("/tmp"));
        let overrides = ConversationOverrides::default();
        let config = Config::default();

        let reply = cmd_model("c1", "codex", &registry, &overrides, &config).await;
        assert_eq!(reply, "model set to codex");
        assert!(registry.get_session("c1").await.is_none());
        assert!(registry.persistence().get("c1").is_none());
    }

    #[tokio::test]
    async fn model_switch_within_the_same_backend_kind_keeps_the_session() {
        let registry = registry_with_fake_session("c1").await;
        let overrides = ConversationOverrides::default();
        let config = Config::default();

        let reply = cmd_model("c1", "claude-sonnet-4", &registry, &overrides, &config).await;
        assert_eq!(reply, "model set to claude-sonnet-4");
        assert!(registry.get_session("c1").await.is_some());
    }

    #[tokio::test]
    async fn resume_with_no_matching_prefix_is_reported() {
        let registry = registry_with_fake_session("c1").await;
        let reply = cmd_resume("c1", "zzz", &registry).await;
        assert_eq!(reply, "no session id starts with zzz");
    }
}
