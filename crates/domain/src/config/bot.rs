use serde::{Deserialize, Serialize};

/// Outbound WebSocket bot channel. Absent (no `bot_token`) means the
/// WS/bot frontend adapter is never started.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BotConfig {
    pub server_url: Option<String>,
    pub bot_token: Option<String>,
}

impl BotConfig {
    pub fn is_configured(&self) -> bool {
        self.server_url.is_some() && self.bot_token.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_both_url_and_token() {
        assert!(!BotConfig::default().is_configured());
        assert!(!BotConfig {
            server_url: Some("wss://x".into()),
            bot_token: None,
        }
        .is_configured());
        assert!(BotConfig {
            server_url: Some("wss://x".into()),
            bot_token: Some("t".into()),
        }
        .is_configured());
    }
}
