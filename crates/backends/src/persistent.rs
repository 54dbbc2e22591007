use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_domain::{Error, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};

use crate::traits::{BackendKind, BackendProcess, DeltaSink, TurnResult};

const TURN_TIMEOUT: Duration = Duration::from_secs(600);
const KILL_GRACE: Duration = Duration::from_secs(5);
const STDERR_TAIL_LINES: usize = 20;

/// A variant-P (persistent, bidirectional-stream) backend: one long-running
/// child, fed newline-delimited JSON frames on stdin, emitting
/// newline-delimited JSON events on stdout.
pub struct PersistentBackend {
    binary_path: String,
    cwd: PathBuf,
    model: Option<String>,
    mcp_config: Option<PathBuf>,
    append_system_prompt: Option<String>,
    compact: bool,
    resume_id: Mutex<Option<String>>,
    shared: Arc<Shared>,
}

struct Shared {
    session_id: Mutex<Option<String>>,
    total_cost_usd: Mutex<f64>,
    turn: Mutex<Option<TurnState>>,
    stdin_tx: Mutex<Option<mpsc::UnboundedSender<StdinFrame>>>,
    kill_tx: Mutex<Option<mpsc::Sender<()>>>,
    alive: AtomicBool,
    stderr_tail: Mutex<VecDeque<String>>,
}

enum StdinFrame {
    Line(String),
}

struct TurnState {
    buffer: String,
    delta_sink: DeltaSink,
    result_tx: Option<oneshot::Sender<TurnOutcome>>,
}

enum TurnOutcome {
    Result { text: String, session_id: Option<String> },
    ChildClosed,
}

impl PersistentBackend {
    pub fn new(
        binary_path: impl Into<String>,
        cwd: PathBuf,
        model: Option<String>,
        mcp_config: Option<PathBuf>,
        append_system_prompt: Option<String>,
        resume_id: Option<String>,
        compact: bool,
    ) -> Self {
        Self {
            binary_path: binary_path.into(),
            cwd,
            model,
            mcp_config,
            append_system_prompt,
            compact,
            resume_id: Mutex::new(resume_id),
            shared: Arc::new(Shared {
                session_id: Mutex::new(None),
                total_cost_usd: Mutex::new(0.0),
                turn: Mutex::new(None),
                stdin_tx: Mutex::new(None),
                kill_tx: Mutex::new(None),
                alive: AtomicBool::new(false),
                stderr_tail: Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)),
            }),
        }
    }

    fn write_user_frame(&self, text: &str) -> Result<()> {
        let frame = serde_json::json!({
            "type": "user",
            "message": { "role": "user", "content": text },
        });
        let line = serde_json::to_string(&frame)?;
        let tx = self.shared.stdin_tx.lock().clone();
        match tx {
            Some(tx) => tx
                .send(StdinFrame::Line(line))
                .map_err(|_| Error::NotRunning),
            None => Err(Error::NotRunning),
        }
    }
}

#[async_trait]
impl BackendProcess for PersistentBackend {
    async fn start(&self) -> Result<()> {
        if self.shared.alive.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut cmd = tokio::process::Command::new(&self.binary_path);
        cmd.current_dir(&self.cwd)
            .arg("--input-format")
            .arg("stream-json")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--include-partial-messages")
            .arg("--dangerously-skip-permissions");

        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(resume) = self.resume_id.lock().clone() {
            cmd.arg("--resume").arg(resume);
        }
        if self.compact {
            cmd.arg("--compact");
        }
        if let Some(prompt) = &self.append_system_prompt {
            cmd.arg("--append-system-prompt").arg(prompt);
        }
        if let Some(mcp) = &self.mcp_config {
            cmd.arg("--mcp-config").arg(mcp);
        }

        cmd.env_remove("CLAUDECODE");
        cmd.env("CI", "true");
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", strip_local_bin_paths(&path));
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child: Child = cmd.spawn()?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let mut stdin = child.stdin.take().expect("piped stdin");

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<StdinFrame>();
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);

        *self.shared.stdin_tx.lock() = Some(stdin_tx);
        *self.shared.kill_tx.lock() = Some(kill_tx);
        self.shared.alive.store(true, Ordering::Release);

        let shared = self.shared.clone();
        let shared_stderr = self.shared.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => handle_event_line(&shared, &line),
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
            resolve_child_closed(&shared);
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut tail = shared_stderr.stderr_tail.lock();
                if tail.len() >= STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });

        tokio::spawn(async move {
            while let Some(StdinFrame::Line(line)) = stdin_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
            }
        });

        let shared_wait = self.shared.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = child.wait() => {}
                _ = kill_rx.recv() => {
                    let _ = child.start_kill();
                    let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
                }
            }
            shared_wait.alive.store(false, Ordering::Release);
            *shared_wait.stdin_tx.lock() = None;
        });

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        *self.shared.turn.lock() = None;
        if let Some(kill_tx) = self.shared.kill_tx.lock().take() {
            let _ = kill_tx.send(()).await;
        }
        self.shared.alive.store(false, Ordering::Release);
        *self.shared.stdin_tx.lock() = None;
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    async fn is_busy(&self) -> bool {
        self.shared.turn.lock().is_some()
    }

    async fn abort_turn(&self) {
        self.shared.turn.lock().take();
    }

    async fn send_message(&self, text: &str, delta_sink: DeltaSink) -> Result<TurnResult> {
        if !self.is_alive().await {
            return Err(Error::NotRunning);
        }
        if self.is_busy().await {
            return Err(Error::Busy);
        }

        let (result_tx, result_rx) = oneshot::channel();
        {
            let mut turn = self.shared.turn.lock();
            *turn = Some(TurnState {
                buffer: String::new(),
                delta_sink,
                result_tx: Some(result_tx),
            });
        }

        self.write_user_frame(text)?;

        tokio::select! {
            outcome = result_rx => {
                match outcome {
                    Ok(TurnOutcome::Result { text, session_id }) => {
                        Ok(TurnResult { final_text: text, session_id })
                    }
                    Ok(TurnOutcome::ChildClosed) => {
                        let tail = self.shared.stderr_tail.lock().iter().cloned().collect::<Vec<_>>().join("\n");
                        Err(Error::ChildExited { code: None, stderr_tail: tail })
                    }
                    Err(_) => Err(Error::Cancelled),
                }
            }
            _ = tokio::time::sleep(TURN_TIMEOUT) => {
                let buffer = self.shared.turn.lock().take().map(|t| t.buffer).unwrap_or_default();
                Ok(TurnResult {
                    final_text: buffer,
                    session_id: self.shared.session_id.lock().clone(),
                })
            }
        }
    }

    async fn session_id(&self) -> Option<String> {
        self.shared.session_id.lock().clone()
    }

    fn cwd(&self) -> &PathBuf {
        &self.cwd
    }

    fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    async fn total_cost_usd(&self) -> f64 {
        *self.shared.total_cost_usd.lock()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Persistent
    }
}

fn handle_event_line(shared: &Arc<Shared>, line: &str) {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => {
            tracing::debug!(%line, "unparseable event line from persistent backend");
            return;
        }
    };

    let event_type = value.get("type").and_then(Value::as_str).unwrap_or("");

    match event_type {
        "system" => {
            if let Some(session_id) = value.get("session_id").and_then(Value::as_str) {
                *shared.session_id.lock() = Some(session_id.to_owned());
            }
        }
        "stream_event" => {
            if is_text_delta(&value) {
                if let Some(chunk) = extract_delta_text(&value) {
                    if chunk.is_empty() {
                        return;
                    }
                    let mut turn = shared.turn.lock();
                    if let Some(state) = turn.as_mut() {
                        state.buffer.push_str(&chunk);
                        let _ = state.delta_sink.send(chunk);
                    }
                }
            }
        }
        "result" => {
            if let Some(session_id) = value.get("session_id").and_then(Value::as_str) {
                *shared.session_id.lock() = Some(session_id.to_owned());
            }
            if let Some(cost) = value.get("total_cost_usd").and_then(Value::as_f64) {
                *shared.total_cost_usd.lock() = cost;
            }
            let session_id = shared.session_id.lock().clone();
            let mut turn = shared.turn.lock();
            if let Some(mut state) = turn.take() {
                if let Some(tx) = state.result_tx.take() {
                    let _ = tx.send(TurnOutcome::Result {
                        text: std::mem::take(&mut state.buffer),
                        session_id,
                    });
                }
            }
        }
        "rate_limit" => {
            let allowed = value
                .get("status")
                .and_then(Value::as_str)
                .map(|s| s == "allowed")
                .unwrap_or(true);
            if !allowed {
                tracing::warn!(?value, "persistent backend rate-limited");
            }
        }
        _ => {}
    }
}

fn is_text_delta(value: &Value) -> bool {
    value
        .get("event")
        .and_then(|e| e.get("delta"))
        .and_then(|d| d.get("type"))
        .and_then(Value::as_str)
        == Some("text_delta")
}

fn extract_delta_text(value: &Value) -> Option<String> {
    value
        .get("event")?
        .get("delta")?
        .get("text")?
        .as_str()
        .map(str::to_owned)
}

fn resolve_child_closed(shared: &Arc<Shared>) {
    shared.alive.store(false, Ordering::Release);
    let mut turn = shared.turn.lock();
    if let Some(state) = turn.take() {
        if let Some(tx) = state.result_tx {
            let _ = tx.send(TurnOutcome::ChildClosed);
        }
    }
}

/// Drop any `PATH` entries that would shadow the globally installed CLI
/// with a locally vendored copy (e.g. a project's own `node_modules/.bin`).
fn strip_local_bin_paths(path: &str) -> String {
    std::env::join_paths(
        std::env::split_paths(path)
            .filter(|p| !p.to_string_lossy().contains("node_modules")),
    )
    .map(|os| os.to_string_lossy().into_owned())
    .unwrap_or_else(|_| path.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn new_shared() -> Arc<Shared> {
        Arc::new(Shared {
            session_id: Mutex::new(None),
            total_cost_usd: Mutex::new(0.0),
            turn: Mutex::new(None),
            stdin_tx: Mutex::new(None),
            kill_tx: Mutex::new(None),
            alive: AtomicBool::new(true),
            stderr_tail: Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)),
        })
    }

    fn arm_turn(shared: &Arc<Shared>) -> (mpsc::UnboundedReceiver<String>, oneshot::Receiver<TurnOutcome>) {
        let (delta_tx, delta_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        *shared.turn.lock() = Some(TurnState {
            buffer: String::new(),
            delta_sink: delta_tx,
            result_tx: Some(result_tx),
        });
        (delta_rx, result_rx)
    }

    #[test]
    fn system_event_records_session_id() {
        let shared = new_shared();
        handle_event_line(&shared, r#"{"type":"system","session_id":"abc123"}"#);
        assert_eq!(shared.session_id.lock().as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn stream_delta_appends_to_buffer_and_sink() {
        let shared = new_shared();
        let (mut delta_rx, _result_rx) = arm_turn(&shared);

        let line = serde_json::json!({
            "type": "stream_event",
            "event": {"delta": {"type": "text_delta", "text": "he"}},
        })
        .to_string();
        handle_event_line(&shared, &line);

        let chunk = delta_rx.try_recv().expect("delta sent");
        assert_eq!(chunk, "he");
        assert_eq!(shared.turn.lock().as_ref().unwrap().buffer, "he");
    }

    #[test]
    fn non_text_delta_events_are_ignored() {
        let shared = new_shared();
        let (_delta_rx, _result_rx) = arm_turn(&shared);
        let line = serde_json::json!({
            "type": "stream_event",
            "event": {"delta": {"type": "input_json_delta", "partial_json": "{}"}},
        })
        .to_string();
        handle_event_line(&shared, &line);
        assert_eq!(shared.turn.lock().as_ref().unwrap().buffer, "");
    }

    #[tokio::test]
    async fn result_event_resolves_the_turn_and_records_cost() {
        let shared = new_shared();
        let (_delta_rx, result_rx) = arm_turn(&shared);
        shared.turn.lock().as_mut().unwrap().buffer = "hello".into();

        let line = serde_json::json!({
            "type": "result",
            "session_id": "s-1",
            "total_cost_usd": 0.42,
        })
        .to_string();
        handle_event_line(&shared, &line);

        assert!(shared.turn.lock().is_none());
        assert_eq!(*shared.total_cost_usd.lock(), 0.42);
        match result_rx.await.unwrap() {
            TurnOutcome::Result { text, session_id } => {
                assert_eq!(text, "hello");
                assert_eq!(session_id.as_deref(), Some("s-1"));
            }
            TurnOutcome::ChildClosed => panic!("expected Result outcome"),
        }
    }

    #[test]
    fn unparseable_line_is_ignored_without_panicking() {
        let shared = new_shared();
        handle_event_line(&shared, "not json at all");
        assert!(shared.session_id.lock().is_none());
    }

    #[test]
    fn rate_limit_not_allowed_does_not_touch_turn_state() {
        let shared = new_shared();
        let (_delta_rx, _result_rx) = arm_turn(&shared);
        let line = serde_json::json!({"type": "rate_limit", "status": "denied"}).to_string();
        handle_event_line(&shared, &line);
        assert!(shared.turn.lock().is_some());
    }

    #[tokio::test]
    async fn child_closed_always_fails_even_with_partial_buffer() {
        let shared = new_shared();
        let (_delta_rx, result_rx) = arm_turn(&shared);
        shared.turn.lock().as_mut().unwrap().buffer = "partial".into();

        resolve_child_closed(&shared);

        assert!(!shared.alive.load(Ordering::Acquire));
        match result_rx.await.unwrap() {
            TurnOutcome::ChildClosed => {}
            TurnOutcome::Result { .. } => panic!("child close must fail the turn, not succeed with partial text"),
        }
    }

    #[test]
    fn strip_local_bin_paths_removes_node_modules_entries() {
        let joined = strip_local_bin_paths("/usr/bin:/proj/node_modules/.bin:/usr/local/bin");
        assert!(!joined.contains("node_modules"));
        assert!(joined.contains("/usr/bin"));
        assert!(joined.contains("/usr/local/bin"));
    }
}
