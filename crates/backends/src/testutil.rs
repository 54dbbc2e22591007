//! A hand-rolled fake [`BackendProcess`], standing in for the real CLIs
//! (which are external binaries) across the SessionRegistry and
//! TurnCoordinator test suites.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_domain::{Error, Result};

use crate::traits::{BackendKind, BackendProcess, DeltaSink, TurnResult};

pub struct FakeBackend {
    kind: BackendKind,
    cwd: PathBuf,
    model: Option<String>,
    alive: AtomicBool,
    busy: AtomicBool,
    session_id: Mutex<Option<String>>,
    scripted_deltas: Mutex<Vec<String>>,
    fail_next: AtomicBool,
    delay_ms: AtomicU64,
}

impl FakeBackend {
    pub fn new(kind: BackendKind, cwd: PathBuf, model: Option<String>) -> Self {
        Self {
            kind,
            cwd,
            model,
            alive: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            session_id: Mutex::new(None),
            scripted_deltas: Mutex::new(vec!["he".into(), "ll".into(), "o".into()]),
            fail_next: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
        }
    }

    pub fn with_session_id(self, id: impl Into<String>) -> Self {
        *self.session_id.lock() = Some(id.into());
        self
    }

    /// Makes `send_message` sleep before producing deltas, so tests racing a
    /// cancellation token against the turn can make cancellation win
    /// deterministically.
    pub fn with_delay_ms(self, ms: u64) -> Self {
        self.delay_ms.store(ms, Ordering::Release);
        self
    }

    pub fn script(&self, deltas: Vec<String>) {
        *self.scripted_deltas.lock() = deltas;
    }

    pub fn fail_next_turn(&self) {
        self.fail_next.store(true, Ordering::Release);
    }
}

#[async_trait]
impl BackendProcess for FakeBackend {
    async fn start(&self) -> Result<()> {
        self.alive.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.alive.store(false, Ordering::Release);
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    async fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    async fn abort_turn(&self) {
        self.busy.store(false, Ordering::Release);
    }

    async fn send_message(&self, _text: &str, delta_sink: DeltaSink) -> Result<TurnResult> {
        if !self.is_alive().await {
            return Err(Error::NotRunning);
        }
        if self.busy.swap(true, Ordering::AcqRel) {
            return Err(Error::Busy);
        }

        if self.fail_next.swap(false, Ordering::AcqRel) {
            self.busy.store(false, Ordering::Release);
            return Err(Error::TurnError("scripted failure".into()));
        }

        let delay = self.delay_ms.load(Ordering::Acquire);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }

        let mut final_text = String::new();
        for delta in self.scripted_deltas.lock().iter() {
            let _ = delta_sink.send(delta.clone());
            final_text.push_str(delta);
        }

        self.busy.store(false, Ordering::Release);
        let mut session_id = self.session_id.lock();
        if session_id.is_none() {
            static NEXT_ID: AtomicU64 = AtomicU64::new(1);
            let n = NEXT_ID.fetch_add(1, Ordering::Relaxed);
            *session_id = Some(format!("fake-session-{n}"));
        }
        Ok(TurnResult {
            final_text,
            session_id: session_id.clone(),
        })
    }

    async fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
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
        self.kind
    }
}
