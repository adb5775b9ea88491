//! Chat-platform seam.
//!
//! The supervisor only talks to bots through [`PlatformClient`]; the
//! Telegram implementation lives in [`telegram`]. Tests substitute fakes
//! through [`ClientFactory`].

pub mod telegram;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use telegram::TelegramClientFactory;

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("Platform rejected the bot token")]
    Unauthorized,

    /// The recipient blocked the bot or deleted their account.
    #[error("Recipient is unreachable")]
    Blocked,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Platform API error: {0}")]
    Api(String),

    #[error("Failed to build platform client: {0}")]
    Build(String),

    #[error("Invalid outbound message: {0}")]
    InvalidMessage(String),
}

/// Identity reported by the platform for an authenticated bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotProfile {
    pub bot_id: i64,
    pub username: String,
    pub first_name: String,
    pub last_name: Option<String>,
}

/// A message as seen by a bot. Replies go to `chat_id`; user lookups and
/// role checks use `sender_id`, which differs from it in group chats.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingMessage {
    pub chat_id: i64,
    /// Platform user id of the author. Falls back to `chat_id` when the
    /// platform does not report one.
    pub sender_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingUpdate {
    /// Offset to request next so this update is acknowledged.
    pub next_offset: i32,
    /// `None` for update kinds the service does not consume.
    pub message: Option<IncomingMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineKeyboard {
    pub rows: Vec<Vec<KeyboardButton>>,
}

/// A button that either opens `url` or sends `callback_data` back to the bot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyboardButton {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_data: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub chat_id: i64,
    pub text: String,
    /// Local image files sent ahead of the text.
    pub photos: Vec<PathBuf>,
    pub keyboard: Option<InlineKeyboard>,
}

impl OutboundMessage {
    pub fn text(chat_id: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
            ..Self::default()
        }
    }
}

/// One authenticated bot connection. Owned by a single consumer task.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn get_me(&self) -> Result<BotProfile, PlatformError>;

    /// Long-poll for updates, waiting up to `timeout` server-side.
    async fn get_updates(
        &self,
        offset: Option<i32>,
        timeout: Duration,
    ) -> Result<Vec<IncomingUpdate>, PlatformError>;

    async fn send(&self, message: &OutboundMessage) -> Result<(), PlatformError>;
}

/// Builds clients from plaintext tokens. The token must not be retained
/// beyond what the client itself needs.
pub trait ClientFactory: Send + Sync {
    fn connect(&self, token: &str) -> Result<Arc<dyn PlatformClient>, PlatformError>;
}
