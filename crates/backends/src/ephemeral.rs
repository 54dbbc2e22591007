use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_domain::{Error, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;

use crate::traits::{BackendKind, BackendProcess, DeltaSink, TurnResult};

const ERROR_TAIL_CHARS: usize = 500;

/// A variant-E (ephemeral, spawn-per-turn) backend. No child lives between
/// turns; each `send_message` spawns a fresh process, reads its stdout as a
/// JSONL event stream until EOF, then collects the exit status.
pub struct EphemeralBackend {
    binary_path: String,
    cwd: PathBuf,
    model: Option<String>,
    thread_id: Mutex<Option<String>>,
    busy: AtomicBool,
    stopped: AtomicBool,
    current_pid: AtomicU32,
    abort: Notify,
    aborted: AtomicBool,
}

struct RunOutcome {
    produced_text: bool,
    final_text: String,
    session_id: Option<String>,
    turn_error: Option<String>,
    exit_code: Option<i32>,
    stderr_tail: String,
}

impl EphemeralBackend {
    pub fn new(
        binary_path: impl Into<String>,
        cwd: PathBuf,
        model: Option<String>,
        resume_id: Option<String>,
    ) -> Self {
        Self {
            binary_path: binary_path.into(),
            cwd,
            model,
            thread_id: Mutex::new(resume_id),
            busy: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            current_pid: AtomicU32::new(0),
            abort: Notify::new(),
            aborted: AtomicBool::new(false),
        }
    }

    async fn run_once(&self, text: &str, resume: Option<String>, delta_sink: &DeltaSink) -> Result<RunOutcome> {
        let mut cmd = tokio::process::Command::new(&self.binary_path);
        cmd.arg("exec");
        if let Some(thread_id) = &resume {
            cmd.arg("resume").arg(thread_id);
        }
        cmd.arg("--json")
            .arg("--skip-git-repo-check")
            .arg("--full-auto");
        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }
        cmd.arg("--cd").arg(&self.cwd);
        cmd.arg(text);

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        if let Some(id) = child.id() {
            self.current_pid.store(id, Ordering::Release);
        }

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let mut last_sent_len = 0usize;
        let mut final_text = String::new();
        let mut session_id = None;
        let mut turn_error = None;
        let mut produced_text = false;

        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            handle_event_line(
                                &line,
                                delta_sink,
                                &mut last_sent_len,
                                &mut final_text,
                                &mut session_id,
                                &mut turn_error,
                                &mut produced_text,
                            );
                        }
                        _ => break,
                    }
                }
                _ = self.abort.notified() => {
                    break;
                }
            }
        }

        let mut stderr_tail = String::new();
        let mut stderr_lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = stderr_lines.next_line().await {
            stderr_tail.push_str(&line);
            stderr_tail.push('\n');
        }
        if stderr_tail.len() > ERROR_TAIL_CHARS {
            let start = stderr_tail.len() - ERROR_TAIL_CHARS;
            stderr_tail = stderr_tail[start..].to_owned();
        }

        let status = child.wait().await.ok();
        self.current_pid.store(0, Ordering::Release);

        Ok(RunOutcome {
            produced_text,
            final_text,
            session_id,
            turn_error,
            exit_code: status.and_then(|s| s.code()),
            stderr_tail,
        })
    }
}

#[async_trait]
impl BackendProcess for EphemeralBackend {
    async fn start(&self) -> Result<()> {
        self.stopped.store(false, Ordering::Release);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::Release);
        let pid = self.current_pid.load(Ordering::Acquire);
        if pid != 0 {
            let _ = tokio::process::Command::new("kill")
                .arg("-TERM")
                .arg(pid.to_string())
                .status()
                .await;
        }
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
    }

    async fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    async fn abort_turn(&self) {
        self.aborted.store(true, Ordering::Release);
        let pid = self.current_pid.load(Ordering::Acquire);
        if pid != 0 {
            let _ = tokio::process::Command::new("kill")
                .arg("-INT")
                .arg(pid.to_string())
                .status()
                .await;
        }
        self.abort.notify_waiters();
        // The caller drops send_message's future on cancellation, so only
        // this path resets busy for a cancelled turn.
        self.busy.store(false, Ordering::Release);
    }

    async fn send_message(&self, text: &str, delta_sink: DeltaSink) -> Result<TurnResult> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::NotRunning);
        }
        if self.busy.swap(true, Ordering::AcqRel) {
            return Err(Error::Busy);
        }
        self.aborted.store(false, Ordering::Release);

        let resume = self.thread_id.lock().clone();
        let was_resume = resume.is_some();

        let result = self.run_once(text, resume, &delta_sink).await;
        let outcome = match result {
            Ok(o) => o,
            Err(e) => {
                self.busy.store(false, Ordering::Release);
                return Err(e);
            }
        };

        if self.aborted.load(Ordering::Acquire) {
            self.busy.store(false, Ordering::Release);
            return Err(Error::Cancelled);
        }

        // Resume-retry rule: retry exactly once as a fresh spawn if a resume
        // invocation produced no text.
        let outcome = if was_resume && !outcome.produced_text {
            *self.thread_id.lock() = None;
            let retried = self.run_once(text, None, &delta_sink).await;
            self.busy.store(false, Ordering::Release);
            match retried {
                Ok(o) => o,
                Err(e) => return Err(e),
            }
        } else {
            self.busy.store(false, Ordering::Release);
            outcome
        };

        if let Some(session_id) = &outcome.session_id {
            *self.thread_id.lock() = Some(session_id.clone());
        }

        let success = outcome.produced_text || outcome.exit_code == Some(0);
        if success {
            return Ok(TurnResult {
                final_text: outcome.final_text,
                session_id: outcome.session_id,
            });
        }

        if let Some(err) = outcome.turn_error {
            return Err(Error::TurnError(err));
        }
        Err(Error::TurnError(format!(
            "failed (exit {:?}): {}",
            outcome.exit_code,
            outcome.stderr_tail.trim()
        )))
    }

    async fn session_id(&self) -> Option<String> {
        self.thread_id.lock().clone()
    }

    fn cwd(&self) -> &PathBuf {
        &self.cwd
    }

    fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    async fn total_cost_usd(&self) -> f64 {
        0.0
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Ephemeral
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_event_line(
    line: &str,
    delta_sink: &DeltaSink,
    last_sent_len: &mut usize,
    final_text: &mut String,
    session_id: &mut Option<String>,
    turn_error: &mut Option<String>,
    produced_text: &mut bool,
) {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return,
    };

    let event_type = value.get("type").and_then(Value::as_str).unwrap_or("");

    match event_type {
        "thread.started" | "thread_started" => {
            if let Some(id) = value.get("thread_id").and_then(Value::as_str) {
                *session_id = Some(id.to_owned());
            }
        }
        "item.started" | "item.updated" => {
            if let Some(text) = agent_message_text(&value) {
                if text.len() > *last_sent_len {
                    let delta = text[*last_sent_len..].to_owned();
                    if !delta.is_empty() {
                        let _ = delta_sink.send(delta);
                        *produced_text = true;
                    }
                    *last_sent_len = text.len();
                }
            }
        }
        "item.completed" => {
            if let Some(text) = agent_message_text(&value) {
                if text.len() > *last_sent_len {
                    let delta = text[*last_sent_len..].to_owned();
                    if !delta.is_empty() {
                        let _ = delta_sink.send(delta);
                        *produced_text = true;
                    }
                }
                *final_text = text;
                *last_sent_len = 0;
            }
        }
        "turn.completed" => {}
        "turn.failed" | "error" => {
            if let Some(msg) = value.get("message").and_then(Value::as_str) {
                *turn_error = Some(msg.to_owned());
            }
        }
        _ => {}
    }
}

fn agent_message_text(value: &Value) -> Option<String> {
    let item = value.get("item")?;
    if item.get("item_type").and_then(Value::as_str) != Some("agent_message")
        && item.get("type").and_then(Value::as_str) != Some("agent_message")
    {
        return None;
    }
    item.get("text").and_then(Value::as_str).map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct Harness {
        delta_rx: mpsc::UnboundedReceiver<String>,
        sink: DeltaSink,
        last_sent_len: usize,
        final_text: String,
        session_id: Option<String>,
        turn_error: Option<String>,
        produced_text: bool,
    }

    impl Harness {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                delta_rx: rx,
                sink: tx,
                last_sent_len: 0,
                final_text: String::new(),
                session_id: None,
                turn_error: None,
                produced_text: false,
            }
        }

        fn feed(&mut self, line: &str) {
            handle_event_line(
                line,
                &self.sink,
                &mut self.last_sent_len,
                &mut self.final_text,
                &mut self.session_id,
                &mut self.turn_error,
                &mut self.produced_text,
            );
        }
    }

    #[test]
    fn thread_started_records_session_id() {
        let mut h = Harness::new();
        h.feed(r#"{"type":"thread.started","thread_id":"t-1"}"#);
        assert_eq!(h.session_id.as_deref(), Some("t-1"));
    }

    #[test]
    fn item_updated_emits_only_the_incremental_suffix() {
        let mut h = Harness::new();
        let line1 = serde_json::json!({
            "type": "item.started",
            "item": {"item_type": "agent_message", "text": "he"},
        })
        .to_string();
        h.feed(&line1);
        assert_eq!(h.delta_rx.try_recv().unwrap(), "he");

        let line2 = serde_json::json!({
            "type": "item.updated",
            "item": {"item_type": "agent_message", "text": "hello"},
        })
        .to_string();
        h.feed(&line2);
        assert_eq!(h.delta_rx.try_recv().unwrap(), "llo");
        assert!(h.produced_text);
    }

    #[test]
    fn item_completed_sets_final_text_and_resets_cursor() {
        let mut h = Harness::new();
        h.feed(
            &serde_json::json!({
                "type": "item.started",
                "item": {"item_type": "agent_message", "text": "hi"},
            })
            .to_string(),
        );
        let _ = h.delta_rx.try_recv();

        h.feed(
            &serde_json::json!({
                "type": "item.completed",
                "item": {"item_type": "agent_message", "text": "hi there"},
            })
            .to_string(),
        );
        assert_eq!(h.delta_rx.try_recv().unwrap(), " there");
        assert_eq!(h.final_text, "hi there");
        assert_eq!(h.last_sent_len, 0);
    }

    #[test]
    fn turn_failed_records_error_message() {
        let mut h = Harness::new();
        h.feed(r#"{"type":"turn.failed","message":"boom"}"#);
        assert_eq!(h.turn_error.as_deref(), Some("boom"));
    }

    #[test]
    fn malformed_line_is_skipped_silently() {
        let mut h = Harness::new();
        h.feed("not json");
        assert!(h.session_id.is_none());
        assert!(!h.produced_text);
    }

    #[test]
    fn non_agent_message_items_are_ignored() {
        let mut h = Harness::new();
        h.feed(
            &serde_json::json!({
                "type": "item.started",
                "item": {"item_type": "command_execution", "text": "ls"},
            })
            .to_string(),
        );
        assert!(h.delta_rx.try_recv().is_err());
        assert!(!h.produced_text);
    }
}
