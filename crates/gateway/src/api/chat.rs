//! `POST /v1/chat/completions` — the OpenAI-compatible streaming/non-streaming
//! entry point. Every request here shares one fixed conversation id ("debug")
//! so the HTTP path participates in the same session ecosystem as the WS bot.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Json};
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use relay_domain::Error;

use crate::runtime::turn::HandleOutcome;
use crate::state::AppState;

const DEBUG_CONV_ID: &str = "debug";
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

// ── Request shapes ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatCompletionsRequest {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    messages: Vec<ChatMessage>,
    #[serde(default = "default_stream")]
    stream: bool,
}

fn default_stream() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    role: String,
    content: MessageContent,
}

/// OpenAI allows either a plain string or an array of typed content blocks.
/// Non-text blocks (images, etc.) are ignored; text blocks concatenate with
/// newline separators.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl MessageContent {
    fn as_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter(|b| b.kind.is_empty() || b.kind == "text")
                .filter_map(|b| b.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

// ── Response shapes ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatCompletion {
    id: String,
    object: &'static str,
    created: i64,
    model: String,
    choices: Vec<Choice>,
    usage: Usage,
}

#[derive(Debug, Serialize)]
struct Choice {
    index: u32,
    message: ChoiceMessage,
    finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
struct ChoiceMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize, Default)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Serialize)]
struct Chunk {
    id: String,
    object: &'static str,
    created: i64,
    model: String,
    choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<Usage>,
}

#[derive(Debug, Serialize)]
struct ChunkChoice {
    index: u32,
    delta: ChunkDelta,
    finish_reason: Option<&'static str>,
}

#[derive(Debug, Serialize, Default)]
struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

// ── Entry point ──────────────────────────────────────────────────────

pub async fn chat_completions(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let request: ChatCompletionsRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return invalid_request(&format!("invalid JSON body: {e}")).into_response(),
    };

    if request.messages.is_empty() {
        return invalid_request("'messages' is required and must be a non-empty array")
            .into_response();
    }

    let prompt = match request.messages.iter().rev().find(|m| m.role == "user") {
        Some(msg) => msg.content.as_text(),
        None => return invalid_request("no user message found in 'messages'").into_response(),
    };

    let id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
    let created = chrono::Utc::now().timestamp();
    let model = request.model.clone().unwrap_or_default();

    if request.stream {
        let mut response =
            chat_completions_stream(state, prompt, request.model, id, created, model)
                .into_response();
        response
            .headers_mut()
            .insert("x-accel-buffering", axum::http::HeaderValue::from_static("no"));
        response
    } else {
        chat_completions_blocking(state, prompt, request.model, id, created, model)
            .await
            .into_response()
    }
}

fn invalid_request(message: &str) -> impl IntoResponse {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({
            "error": { "message": message, "type": "invalid_request_error" }
        })),
    )
}

// ── Non-streaming ────────────────────────────────────────────────────

async fn chat_completions_blocking(
    state: AppState,
    prompt: String,
    model: Option<String>,
    id: String,
    created: i64,
    model_label: String,
) -> axum::response::Response {
    let permit = state.http_mutex.clone().lock_owned().await;
    let (delta_tx, _delta_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let result = state
        .turns
        .handle(DEBUG_CONV_ID, &prompt, model, cancel, delta_tx)
        .await;
    drop(permit);

    match result {
        Ok(HandleOutcome::Turn(outcome)) => Json(ChatCompletion {
            id,
            object: "chat.completion",
            created,
            model: model_label,
            choices: vec![Choice {
                index: 0,
                message: ChoiceMessage {
                    role: "assistant",
                    content: outcome.final_text,
                },
                finish_reason: "stop",
            }],
            usage: Usage::default(),
        })
        .into_response(),
        Ok(HandleOutcome::Command(reply)) => Json(ChatCompletion {
            id,
            object: "chat.completion",
            created,
            model: model_label,
            choices: vec![Choice {
                index: 0,
                message: ChoiceMessage {
                    role: "assistant",
                    content: reply,
                },
                finish_reason: "stop",
            }],
            usage: Usage::default(),
        })
        .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

fn error_response(error: &Error) -> impl IntoResponse {
    let status = match error {
        Error::ChildExited { .. } => StatusCode::BAD_GATEWAY,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::NotRunning | Error::Busy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({
            "error": { "message": error.to_string(), "type": "server_error" }
        })),
    )
}

// ── Streaming ────────────────────────────────────────────────────────

/// Cancels the turn's cooperative cancellation token when the SSE stream
/// is dropped for any reason — normal completion or an early client
/// disconnect alike.
struct CancelGuard(CancellationToken);

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

fn chat_completions_stream(
    state: AppState,
    prompt: String,
    model: Option<String>,
    id: String,
    created: i64,
    model_label: String,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        let permit: OwnedMutexGuard<()> = state.http_mutex.clone().lock_owned().await;
        let cancel = CancellationToken::new();
        let _cancel_guard = CancelGuard(cancel.clone());

        let (delta_tx, mut delta_rx) = mpsc::unbounded_channel::<String>();
        let turns = state.turns.clone();
        let conv_id = DEBUG_CONV_ID.to_owned();
        let task_prompt = prompt.clone();
        let task_model = model.clone();
        let task_cancel = cancel.clone();
        let handle_task = tokio::spawn(async move {
            turns.handle(&conv_id, &task_prompt, task_model, task_cancel, delta_tx).await
        });
        tokio::pin!(handle_task);

        yield Ok(Event::default().data(
            serde_json::to_string(&Chunk {
                id: id.clone(),
                object: "chat.completion.chunk",
                created,
                model: model_label.clone(),
                choices: vec![ChunkChoice {
                    index: 0,
                    delta: ChunkDelta { content: Some(String::new()) },
                    finish_reason: None,
                }],
                usage: None,
            }).unwrap_or_default()
        ));

        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await;

        loop {
            tokio::select! {
                maybe_delta = delta_rx.recv() => {
                    match maybe_delta {
                        Some(chunk) => {
                            yield Ok(Event::default().data(
                                serde_json::to_string(&Chunk {
                                    id: id.clone(),
                                    object: "chat.completion.chunk",
                                    created,
                                    model: model_label.clone(),
                                    choices: vec![ChunkChoice {
                                        index: 0,
                                        delta: ChunkDelta { content: Some(chunk) },
                                        finish_reason: None,
                                    }],
                                    usage: None,
                                }).unwrap_or_default()
                            ));
                        }
                        None => break,
                    }
                }
                _ = keepalive.tick() => {
                    yield Ok(Event::default().data(
                        serde_json::to_string(&Chunk {
                            id: id.clone(),
                            object: "chat.completion.chunk",
                            created,
                            model: model_label.clone(),
                            choices: vec![ChunkChoice {
                                index: 0,
                                delta: ChunkDelta { content: Some(String::new()) },
                                finish_reason: None,
                            }],
                            usage: None,
                        }).unwrap_or_default()
                    ));
                }
            }
        }

        let outcome = (&mut handle_task).await;
        match outcome {
            Ok(Ok(HandleOutcome::Command(reply))) => {
                yield Ok(Event::default().data(
                    serde_json::to_string(&Chunk {
                        id: id.clone(),
                        object: "chat.completion.chunk",
                        created,
                        model: model_label.clone(),
                        choices: vec![ChunkChoice {
                            index: 0,
                            delta: ChunkDelta { content: Some(reply) },
                            finish_reason: None,
                        }],
                        usage: None,
                    }).unwrap_or_default()
                ));
                yield Ok(Event::default().data(final_chunk_json(&id, created, &model_label)));
            }
            Ok(Ok(HandleOutcome::Turn(_))) => {
                yield Ok(Event::default().data(final_chunk_json(&id, created, &model_label)));
            }
            Ok(Err(Error::Cancelled)) => {
                // Cancellation is silent: no error delta, no retry, just end.
            }
            Ok(Err(e)) => {
                yield Ok(Event::default().data(format!("Error: {e}")));
            }
            Err(join_err) => {
                yield Ok(Event::default().data(format!("Error: {join_err}")));
            }
        }

        yield Ok(Event::default().data("[DONE]"));
        drop(permit);
    };

    Sse::new(stream)
}

fn final_chunk_json(id: &str, created: i64, model: &str) -> String {
    serde_json::to_string(&Chunk {
        id: id.to_owned(),
        object: "chat.completion.chunk",
        created,
        model: model.to_owned(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta { content: None },
            finish_reason: Some("stop"),
        }],
        usage: Some(Usage::default()),
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_string_content_passes_through() {
        let content = MessageContent::Text("hello".into());
        assert_eq!(content.as_text(), "hello");
    }

    #[test]
    fn content_blocks_concatenate_text_and_drop_non_text() {
        let content: ChatCompletionsRequest = serde_json::from_str(
            r#"{"messages":[{"role":"user","content":[
                {"type":"image_url","image_url":{"url":"http://x"}},
                {"type":"text","text":"line one"},
                {"type":"text","text":"line two"}
            ]}]}"#,
        )
        .unwrap();
        assert_eq!(
            content.messages[0].content.as_text(),
            "line one\nline two"
        );
    }

    #[test]
    fn latest_user_message_is_selected_when_multiple_are_present() {
        let request: ChatCompletionsRequest = serde_json::from_str(
            r#"{"messages":[
                {"role":"user","content":"first"},
                {"role":"assistant","content":"reply"},
                {"role":"user","content":"second"}
            ]}"#,
        )
        .unwrap();
        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_text());
        assert_eq!(prompt.as_deref(), Some("second"));
    }

    #[test]
    fn stream_defaults_to_true_when_omitted() {
        let request: ChatCompletionsRequest =
            serde_json::from_str(r#"{"messages":[{"role":"user","content":"hi"}]}"#).unwrap();
        assert!(request.stream);
    }

    #[tokio::test]
    async fn invalid_request_returns_400_with_openai_shaped_error() {
        let response = invalid_request("bad input").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "invalid_request_error");
        assert_eq!(json["error"]["message"], "bad input");
    }

    #[test]
    fn error_response_maps_child_exited_to_bad_gateway() {
        let error = Error::ChildExited {
            code: Some(1),
            stderr_tail: "boom".into(),
        };
        let response = error_response(&error).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn error_response_maps_timeout_to_gateway_timeout() {
        let response = error_response(&Error::Timeout("slow".into())).into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn error_response_maps_not_running_and_busy_to_service_unavailable() {
        assert_eq!(
            error_response(&Error::NotRunning).into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            error_response(&Error::Busy).into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn error_response_maps_everything_else_to_internal_server_error() {
        let response = error_response(&Error::TurnError("oops".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
