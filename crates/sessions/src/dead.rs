use std::path::PathBuf;

use relay_backends::BackendKind;

/// Retained identity of a stopped session, sufficient to re-spawn with
/// `--resume`. Never holds the process handle itself.
#[derive(Debug, Clone)]
pub struct DeadSessionRecord {
    pub session_id: String,
    pub cwd: PathBuf,
    pub model: Option<String>,
    pub backend_kind: BackendKind,
}
