//! Outbound WebSocket "bot" adapter: connects to an external chat server and
//! maps its task events onto the TurnCoordinator. Absent entirely if no bot
//! token/URL is configured. Modeled on the reconnect-with-backoff shape of a
//! long-lived outbound node client.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::runtime::turn::HandleOutcome;
use crate::state::AppState;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum Outbound<'a> {
    #[serde(rename = "hello")]
    Hello {
        bot_token: &'a str,
        skills: &'a [&'static str],
    },
    #[serde(rename = "chunk")]
    Chunk {
        conversation_id: &'a str,
        content: &'a str,
    },
    #[serde(rename = "complete")]
    Complete {
        conversation_id: &'a str,
        content: &'a str,
    },
    #[serde(rename = "error")]
    TaskError {
        conversation_id: &'a str,
        message: &'a str,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Inbound {
    Welcome,
    Task {
        conversation_id: String,
        content: String,
        #[serde(default)]
        model: Option<String>,
    },
    Abort {
        conversation_id: String,
    },
}

const SKILLS: &[&str] = &[
    "new", "sessions", "status", "help", "stop", "resume", "model", "cost", "compact",
];

/// Runs the bot client loop until `shutdown` is cancelled. No-op if the bot
/// isn't configured. Reconnects with exponential backoff on any disconnect.
pub async fn run(state: AppState, shutdown: CancellationToken) {
    if !state.config.bot.is_configured() {
        tracing::info!("bot adapter not configured, skipping");
        return;
    }

    let mut backoff = Duration::from_millis(500);

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        tokio::select! {
            result = connect_and_run(&state) => {
                match result {
                    Ok(()) => {
                        tracing::info!("bot connection closed, reconnecting");
                        backoff = Duration::from_millis(500);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, backoff_ms = backoff.as_millis(), "bot connection failed, backing off");
                    }
                }
            }
            _ = shutdown.cancelled() => return,
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.cancelled() => return,
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn connect_and_run(state: &AppState) -> anyhow::Result<()> {
    let url = state
        .config
        .bot
        .server_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("bot server_url not configured"))?;
    let token = state
        .config
        .bot
        .bot_token
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("bot token not configured"))?;

    let (socket, _) = tokio_tungstenite::connect_async(url).await?;
    let (mut sink, mut stream) = socket.split();

    let hello = serde_json::to_string(&Outbound::Hello {
        bot_token: token,
        skills: SKILLS,
    })?;
    sink.send(WsMessage::Text(hello)).await?;

    let welcome = tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.next()).await;
    match welcome {
        Ok(Some(Ok(WsMessage::Text(text)))) => {
            match serde_json::from_str::<Inbound>(&text) {
                Ok(Inbound::Welcome) => {}
                _ => anyhow::bail!("unexpected handshake reply: {text}"),
            }
        }
        Ok(Some(Ok(_))) => anyhow::bail!("unexpected non-text handshake reply"),
        Ok(Some(Err(e))) => anyhow::bail!("handshake error: {e}"),
        Ok(None) => anyhow::bail!("connection closed during handshake"),
        Err(_) => anyhow::bail!("handshake timed out"),
    }
    tracing::info!("bot handshake complete");

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();

    let mut abort_tokens: std::collections::HashMap<String, CancellationToken> =
        std::collections::HashMap::new();

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(msg) => sink.send(msg).await?,
                    None => return Ok(()),
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<Inbound>(&text) {
                            Ok(Inbound::Task { conversation_id, content, model }) => {
                                let cancel = CancellationToken::new();
                                abort_tokens.insert(conversation_id.clone(), cancel.clone());
                                spawn_task(state.clone(), outbound_tx.clone(), conversation_id, content, model, cancel);
                            }
                            Ok(Inbound::Abort { conversation_id }) => {
                                if let Some(token) = abort_tokens.remove(&conversation_id) {
                                    token.cancel();
                                }
                            }
                            Ok(Inbound::Welcome) => {}
                            Err(e) => tracing::warn!(error = %e, "unrecognized bot message"),
                        }
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = outbound_tx.send(WsMessage::Pong(payload));
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => anyhow::bail!("bot stream error: {e}"),
                }
            }
        }
    }
}

fn spawn_task(
    state: AppState,
    outbound_tx: mpsc::UnboundedSender<WsMessage>,
    conversation_id: String,
    content: String,
    model: Option<String>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let (delta_tx, mut delta_rx) = mpsc::unbounded_channel::<String>();
        let forward_conv_id = conversation_id.clone();
        let forward_tx = outbound_tx.clone();
        let forward_task = tokio::spawn(async move {
            while let Some(chunk) = delta_rx.recv().await {
                let msg = serde_json::to_string(&Outbound::Chunk {
                    conversation_id: &forward_conv_id,
                    content: &chunk,
                })
                .unwrap_or_default();
                if forward_tx.send(WsMessage::Text(msg)).is_err() {
                    break;
                }
            }
        });

        let result = state
            .turns
            .handle(&conversation_id, &content, model, cancel, delta_tx)
            .await;
        let _ = forward_task.await;

        match result {
            Ok(HandleOutcome::Turn(outcome)) => {
                let msg = serde_json::to_string(&Outbound::Complete {
                    conversation_id: &conversation_id,
                    content: &outcome.final_text,
                })
                .unwrap_or_default();
                let _ = outbound_tx.send(WsMessage::Text(msg));
            }
            Ok(HandleOutcome::Command(reply)) => {
                let msg = serde_json::to_string(&Outbound::Complete {
                    conversation_id: &conversation_id,
                    content: &reply,
                })
                .unwrap_or_default();
                let _ = outbound_tx.send(WsMessage::Text(msg));
            }
            Err(e) => {
                let msg = serde_json::to_string(&Outbound::TaskError {
                    conversation_id: &conversation_id,
                    message: &e.to_string(),
                })
                .unwrap_or_default();
                let _ = outbound_tx.send(WsMessage::Text(msg));
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_frame_carries_the_skills_manifest_under_a_snake_case_tag() {
        let json = serde_json::to_value(Outbound::Hello {
            bot_token: "tok",
            skills: SKILLS,
        })
        .unwrap();
        assert_eq!(json["type"], "hello");
        assert_eq!(json["bot_token"], "tok");
        assert!(json["skills"].as_array().unwrap().contains(&serde_json::json!("compact")));
    }

    #[test]
    fn chunk_and_complete_frames_tag_correctly() {
        let chunk = serde_json::to_value(Outbound::Chunk {
            conversation_id: "c1",
            content: "partial",
        })
        .unwrap();
        assert_eq!(chunk["type"], "chunk");
        assert_eq!(chunk["content"], "partial");

        let complete = serde_json::to_value(Outbound::Complete {
            conversation_id: "c1",
            content: "final",
        })
        .unwrap();
        assert_eq!(complete["type"], "complete");
    }

    #[test]
    fn inbound_task_deserializes_with_an_optional_model() {
        let msg: Inbound = serde_json::from_str(
            r#"{"type":"task","conversation_id":"c1","content":"go"}"#,
        )
        .unwrap();
        match msg {
            Inbound::Task { conversation_id, content, model } => {
                assert_eq!(conversation_id, "c1");
                assert_eq!(content, "go");
                assert_eq!(model, None);
            }
            _ => panic!("expected Task"),
        }
    }

    #[test]
    fn inbound_abort_carries_only_the_conversation_id() {
        let msg: Inbound =
            serde_json::from_str(r#"{"type":"abort","conversation_id":"c1"}"#).unwrap();
        assert!(matches!(msg, Inbound::Abort { conversation_id } if conversation_id == "c1"));
    }

    #[test]
    fn inbound_welcome_has_no_payload() {
        let msg: Inbound = serde_json::from_str(r#"{"type":"welcome"}"#).unwrap();
        assert!(matches!(msg, Inbound::Welcome));
    }

    #[test]
    fn backoff_doubles_and_is_capped_at_max() {
        let mut backoff = Duration::from_millis(500);
        for _ in 0..10 {
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        assert_eq!(backoff, MAX_BACKOFF);
    }
}
