//! Telegram Bot API client on top of `teloxide`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use teloxide::payloads::{GetUpdatesSetters, SendMessageSetters};
use teloxide::requests::Requester;
use teloxide::types::{
    ChatId, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, Message, UpdateKind,
};
use teloxide::{ApiError, Bot, RequestError};

use super::{
    BotProfile, ClientFactory, IncomingMessage, IncomingUpdate, InlineKeyboard, OutboundMessage,
    PlatformClient, PlatformError,
};

/// Headroom on top of the long-poll wait before the HTTP request is abandoned.
const REQUEST_SLACK: Duration = Duration::from_secs(10);

pub struct TelegramClientFactory {
    request_timeout: Duration,
}

impl TelegramClientFactory {
    pub fn new(poll_timeout: Duration) -> Self {
        Self {
            request_timeout: poll_timeout + REQUEST_SLACK,
        }
    }
}

impl ClientFactory for TelegramClientFactory {
    fn connect(&self, token: &str) -> Result<Arc<dyn PlatformClient>, PlatformError> {
        let http = teloxide::net::default_reqwest_settings()
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| PlatformError::Build(e.without_url().to_string()))?;
        Ok(Arc::new(TelegramClient {
            bot: Bot::with_client(token, http),
        }))
    }
}

pub struct TelegramClient {
    bot: Bot,
}

/// Map a teloxide error without leaking the request URL, which embeds the token.
fn map_error(err: RequestError) -> PlatformError {
    match err {
        RequestError::Api(ApiError::InvalidToken) => PlatformError::Unauthorized,
        RequestError::Api(ApiError::BotBlocked | ApiError::UserDeactivated) => {
            PlatformError::Blocked
        }
        RequestError::Api(api) => PlatformError::Api(api.to_string()),
        RequestError::Network(e) => {
            let kind = if e.is_timeout() {
                "request timed out"
            } else if e.is_connect() {
                "connection failed"
            } else {
                "request failed"
            };
            PlatformError::Network(kind.into())
        }
        RequestError::Io(e) => PlatformError::Network(e.to_string()),
        RequestError::RetryAfter(secs) => {
            PlatformError::Api(format!("rate limited, retry after {}s", secs.seconds()))
        }
        RequestError::InvalidJson { .. } => PlatformError::Api("invalid response body".into()),
        other => PlatformError::Api(other.to_string()),
    }
}

fn incoming_message(msg: &Message) -> IncomingMessage {
    let chat_id = msg.chat.id.0;
    match &msg.from {
        Some(user) => IncomingMessage {
            chat_id,
            sender_id: i64::try_from(user.id.0).unwrap_or(chat_id),
            username: user.username.clone(),
            first_name: Some(user.first_name.clone()),
            last_name: user.last_name.clone(),
            text: msg.text().map(str::to_owned),
        },
        None => IncomingMessage {
            chat_id,
            sender_id: chat_id,
            username: msg.chat.username().map(str::to_owned),
            first_name: msg.chat.first_name().map(str::to_owned),
            last_name: msg.chat.last_name().map(str::to_owned),
            text: msg.text().map(str::to_owned),
        },
    }
}

fn keyboard_markup(keyboard: &InlineKeyboard) -> Result<InlineKeyboardMarkup, PlatformError> {
    let mut rows = Vec::with_capacity(keyboard.rows.len());
    for row in &keyboard.rows {
        let mut buttons = Vec::with_capacity(row.len());
        for button in row {
            let built = match (&button.url, &button.callback_data) {
                (Some(url), _) => {
                    let url = url::Url::parse(url).map_err(|e| {
                        PlatformError::InvalidMessage(format!("button '{}': {e}", button.text))
                    })?;
                    InlineKeyboardButton::url(button.text.clone(), url)
                }
                (None, Some(data)) => InlineKeyboardButton::callback(button.text.clone(), data.clone()),
                (None, None) => {
                    return Err(PlatformError::InvalidMessage(format!(
                        "button '{}' has neither url nor callback_data",
                        button.text
                    )));
                }
            };
            buttons.push(built);
        }
        rows.push(buttons);
    }
    Ok(InlineKeyboardMarkup::new(rows))
}

#[async_trait]
impl PlatformClient for TelegramClient {
    async fn get_me(&self) -> Result<BotProfile, PlatformError> {
        let me = self.bot.get_me().await.map_err(map_error)?;
        let bot_id = i64::try_from(me.user.id.0)
            .map_err(|_| PlatformError::Api("bot id out of range".into()))?;
        Ok(BotProfile {
            bot_id,
            username: me.username().to_owned(),
            first_name: me.user.first_name.clone(),
            last_name: me.user.last_name.clone(),
        })
    }

    async fn get_updates(
        &self,
        offset: Option<i32>,
        timeout: Duration,
    ) -> Result<Vec<IncomingUpdate>, PlatformError> {
        let mut request = self
            .bot
            .get_updates()
            .timeout(u32::try_from(timeout.as_secs()).unwrap_or(u32::MAX));
        if let Some(offset) = offset {
            request = request.offset(offset);
        }
        let updates = request.await.map_err(map_error)?;

        Ok(updates
            .into_iter()
            .map(|update| {
                let next_offset = update.id.as_offset().saturating_add(1);
                let message = match update.kind {
                    UpdateKind::Message(msg) => Some(incoming_message(&msg)),
                    _ => None,
                };
                IncomingUpdate {
                    next_offset,
                    message,
                }
            })
            .collect())
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), PlatformError> {
        let chat = ChatId(message.chat_id);
        for photo in &message.photos {
            self.bot
                .send_photo(chat, InputFile::file(photo))
                .await
                .map_err(map_error)?;
        }

        let mut request = self.bot.send_message(chat, message.text.clone());
        if let Some(keyboard) = &message.keyboard {
            request = request.reply_markup(keyboard_markup(keyboard)?);
        }
        request.await.map_err(map_error)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::platform::KeyboardButton;

    #[test]
    fn keyboard_accepts_url_and_callback_buttons() {
        let keyboard = InlineKeyboard {
            rows: vec![vec![
                KeyboardButton {
                    text: "Pay".into(),
                    url: Some("https://example.com/pay".into()),
                    callback_data: None,
                },
                KeyboardButton {
                    text: "Later".into(),
                    url: None,
                    callback_data: Some("later".into()),
                },
            ]],
        };
        let markup = keyboard_markup(&keyboard).unwrap();
        assert_eq!(markup.inline_keyboard.len(), 1);
        assert_eq!(markup.inline_keyboard[0].len(), 2);
    }

    #[test]
    fn keyboard_rejects_empty_or_bad_buttons() {
        let empty = InlineKeyboard {
            rows: vec![vec![KeyboardButton {
                text: "Nothing".into(),
                ..KeyboardButton::default()
            }]],
        };
        assert!(matches!(
            keyboard_markup(&empty),
            Err(PlatformError::InvalidMessage(_))
        ));

        let bad_url = InlineKeyboard {
            rows: vec![vec![KeyboardButton {
                text: "Pay".into(),
                url: Some("not a url".into()),
                callback_data: None,
            }]],
        };
        assert!(keyboard_markup(&bad_url).is_err());
    }

    #[test]
    fn api_errors_map_to_platform_errors() {
        assert!(matches!(
            map_error(RequestError::Api(ApiError::InvalidToken)),
            PlatformError::Unauthorized
        ));
        assert!(matches!(
            map_error(RequestError::Api(ApiError::BotBlocked)),
            PlatformError::Blocked
        ));
        assert!(matches!(
            map_error(RequestError::Api(ApiError::UserDeactivated)),
            PlatformError::Blocked
        ));
        assert!(matches!(
            map_error(RequestError::Api(ApiError::ChatNotFound)),
            PlatformError::Api(_)
        ));
    }

    #[test]
    fn group_message_carries_author_id() {
        let msg: Message = serde_json::from_value(serde_json::json!({
            "message_id": 7,
            "date": 1_700_000_000,
            "chat": {"id": -4200, "type": "group", "title": "Promo fans"},
            "from": {"id": 42, "is_bot": false, "first_name": "Ann", "username": "ann"},
            "text": "/stats"
        }))
        .unwrap();

        let incoming = incoming_message(&msg);
        assert_eq!(incoming.chat_id, -4200);
        assert_eq!(incoming.sender_id, 42);
        assert_eq!(incoming.username.as_deref(), Some("ann"));
        assert_eq!(incoming.first_name.as_deref(), Some("Ann"));
        assert_eq!(incoming.text.as_deref(), Some("/stats"));
    }

    #[test]
    fn factory_builds_client_without_network() {
        let factory = TelegramClientFactory::new(Duration::from_secs(60));
        assert!(factory.connect("123456:TEST-TOKEN").is_ok());
    }
}
