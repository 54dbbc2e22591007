use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;

/// Per-conversation state that lives above a Session's lifetime: the
/// `/new [path]` cwd override and the `/model` override. Neither belongs
/// to SessionRegistry (they survive session destruction) nor to
/// PersistenceStore (they aren't durable).
#[derive(Default)]
pub struct ConversationOverrides {
    map: RwLock<HashMap<String, Overrides>>,
}

#[derive(Default, Clone)]
struct Overrides {
    cwd: Option<PathBuf>,
    model: Option<String>,
}

impl ConversationOverrides {
    pub fn cwd(&self, conv_id: &str) -> Option<PathBuf> {
        self.map.read().get(conv_id).and_then(|o| o.cwd.clone())
    }

    pub fn model(&self, conv_id: &str) -> Option<String> {
        self.map.read().get(conv_id).and_then(|o| o.model.clone())
    }

    pub fn set_cwd(&self, conv_id: &str, cwd: PathBuf) {
        self.map.write().entry(conv_id.to_owned()).or_default().cwd = Some(cwd);
    }

    pub fn set_model(&self, conv_id: &str, model: Option<String>) {
        self.map.write().entry(conv_id.to_owned()).or_default().model = model;
    }

    pub fn clear(&self, conv_id: &str) {
        self.map.write().remove(conv_id);
    }
}
