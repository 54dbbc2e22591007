use std::path::PathBuf;
use std::sync::Arc;

use relay_domain::trace::TraceEvent;
use relay_domain::{Config, Error, Result};
use relay_sessions::{CreateSessionParams, SessionRegistry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::runtime::command_router::CommandRouter;
use crate::runtime::overrides::ConversationOverrides;

pub struct TurnOutcome {
    pub final_text: String,
}

/// Either a command reply or a regular turn's final text, so callers don't
/// need to special-case which path produced the response.
pub enum HandleOutcome {
    Command(String),
    Turn(TurnOutcome),
}

/// Per-request glue: pick/create a session, stream deltas, handle the
/// one-shot restart-and-retry, persist on success, honor cancellation.
pub struct TurnCoordinator {
    registry: Arc<SessionRegistry>,
    overrides: Arc<ConversationOverrides>,
    config: Arc<Config>,
}

impl TurnCoordinator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        overrides: Arc<ConversationOverrides>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            registry,
            overrides,
            config,
        }
    }

    /// Entry point for a frontend adapter: intercepts slash-commands,
    /// otherwise resolves/creates a session and runs the turn.
    pub async fn handle(
        &self,
        conv_id: &str,
        text: &str,
        request_model: Option<String>,
        cancel: CancellationToken,
        delta_tx: mpsc::UnboundedSender<String>,
    ) -> Result<HandleOutcome> {
        if let Some(reply) = CommandRouter::try_handle(
            conv_id,
            text,
            &self.registry,
            &self.overrides,
            &self.config,
        )
        .await
        {
            return Ok(HandleOutcome::Command(reply));
        }

        let outcome = self
            .run_turn(conv_id, text, request_model, cancel, delta_tx)
            .await?;
        Ok(HandleOutcome::Turn(outcome))
    }

    async fn run_turn(
        &self,
        conv_id: &str,
        text: &str,
        request_model: Option<String>,
        cancel: CancellationToken,
        delta_tx: mpsc::UnboundedSender<String>,
    ) -> Result<TurnOutcome> {
        TraceEvent::TurnStarted {
            conv_id: conv_id.to_owned(),
        }
        .emit();

        let model = self
            .overrides
            .model(conv_id)
            .or(request_model);
        let backend_kind = self.registry.resolve_backend(model.as_deref());

        let existing = self.registry.get_session(conv_id).await;
        let session = match existing {
            Some(session) if session.backend_kind != backend_kind => {
                self.registry.destroy_session(conv_id).await;
                self.create_for_turn(conv_id, model.clone()).await?
            }
            Some(session) if !session.is_alive().await => {
                self.registry.destroy_session(conv_id).await;
                self.create_for_turn(conv_id, model.clone()).await?
            }
            Some(session) => {
                session.touch();
                session
            }
            None => self.create_for_turn(conv_id, model.clone()).await?,
        };

        let process = session.process.clone();

        let result = tokio::select! {
            r = process.send_message(text, delta_tx.clone()) => r,
            _ = cancel.cancelled() => {
                process.abort_turn().await;
                Err(Error::Cancelled)
            }
        };

        let result = match result {
            Err(Error::Cancelled) => {
                TraceEvent::TurnCancelled {
                    conv_id: conv_id.to_owned(),
                }
                .emit();
                return Err(Error::Cancelled);
            }
            Err(e) if !cancel.is_cancelled() => {
                tracing::warn!(conv_id, error = %e, "turn failed, restarting backend and retrying once");
                TraceEvent::BackendRestarted {
                    conv_id: conv_id.to_owned(),
                    reason: e.to_string(),
                }
                .emit();
                process.restart().await?;
                process.send_message(text, delta_tx).await
            }
            other => other,
        };

        match result {
            Ok(turn_result) => {
                if let Some(session_id) = &turn_result.session_id {
                    self.registry.persist_after_turn(
                        conv_id,
                        session_id.clone(),
                        session.backend_kind,
                        session.model.clone(),
                        session.cwd.clone(),
                    );
                }
                TraceEvent::TurnCompleted {
                    conv_id: conv_id.to_owned(),
                    session_id: turn_result.session_id.clone(),
                    chars: turn_result.final_text.len(),
                }
                .emit();
                Ok(TurnOutcome {
                    final_text: turn_result.final_text,
                })
            }
            Err(e) => {
                TraceEvent::TurnFailed {
                    conv_id: conv_id.to_owned(),
                    error: e.to_string(),
                }
                .emit();
                Err(e)
            }
        }
    }

    async fn create_for_turn(
        &self,
        conv_id: &str,
        model: Option<String>,
    ) -> Result<Arc<relay_sessions::Session>> {
        let cwd: Option<PathBuf> = self.overrides.cwd(conv_id);
        self.registry
            .create_session(
                conv_id,
                CreateSessionParams {
                    cwd,
                    model,
                    resume_id: None,
                    compact: false,
                },
            )
            .await
    }
}
