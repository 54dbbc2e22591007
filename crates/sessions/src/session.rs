use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use relay_backends::{BackendKind, BackendProcess};

/// A live binding between a conversation and one [`BackendProcess`].
///
/// Mutated only through [`SessionRegistry`](crate::SessionRegistry) methods;
/// the process itself is touched by at most one caller at a time (the
/// Session acts as the lock target, per the turn-serialization rule on
/// `BackendProcess::send_message`).
pub struct Session {
    pub conv_id: String,
    pub backend_kind: BackendKind,
    pub process: Arc<dyn BackendProcess>,
    pub cwd: PathBuf,
    pub model: Option<String>,
    last_activity_epoch_ms: AtomicU64,
    created_at: Instant,
    pub last_session_id: Mutex<Option<String>>,
}

impl Session {
    pub fn new(
        conv_id: String,
        backend_kind: BackendKind,
        process: Arc<dyn BackendProcess>,
        cwd: PathBuf,
        model: Option<String>,
    ) -> Self {
        let now = Instant::now();
        Self {
            conv_id,
            backend_kind,
            process,
            cwd,
            model,
            last_activity_epoch_ms: AtomicU64::new(0),
            created_at: now,
            last_session_id: Mutex::new(None),
        }
    }

    /// Monotonic milliseconds since this session was created. Used instead
    /// of a wall-clock timestamp so eviction/idle comparisons never observe
    /// clock skew.
    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_epoch_ms.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_activity_epoch_ms.store(elapsed, Ordering::Release);
    }

    pub fn idle_for_ms(&self) -> u64 {
        (self.created_at.elapsed().as_millis() as u64).saturating_sub(self.last_activity_ms())
    }

    pub async fn is_busy(&self) -> bool {
        self.process.is_busy().await
    }

    pub async fn is_alive(&self) -> bool {
        self.process.is_alive().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_backends::testutil::FakeBackend;

    #[tokio::test]
    async fn touch_advances_last_activity_and_idle_resets_to_zero() {
        let process: Arc<dyn BackendProcess> =
            Arc::new(FakeBackend::new(BackendKind::Persistent, PathBuf::from("/tmp"), None));
        process.start().await.unwrap();
        let session = Session::new(
            "c1".into(),
            BackendKind::Persistent,
            process,
            PathBuf::from("/tmp"),
            None,
        );

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(session.idle_for_ms() >= 20);

        session.touch();
        assert!(session.idle_for_ms() < session.last_activity_ms());
        assert!(session.last_activity_ms() > 0);
    }
}
