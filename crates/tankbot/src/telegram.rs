//! Minimal Telegram Bot API client.
//!
//! Only the three methods the bot needs: `getMe`, `getUpdates` (long
//! polling) and `sendMessage`. Every call is a JSON POST to
//! `{api_base}/bot{token}/{method}`; the token never appears in errors or
//! logs.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tankwatch::{ChatId, MessageSender, SendError};
use thiserror::Error;
use tracing::debug;

/// Descriptions Telegram returns with a 400 when the chat is gone for good.
const GONE_MARKERS: &[&str] = &["chat not found", "user is deactivated", "bot was kicked"];

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Telegram API error {status}: {description}")]
    Api {
        status: u16,
        description: String,
        retry_after: Option<Duration>,
    },

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl TelegramError {
    /// Sort a failure into permanent (stop sending to this chat) or transient.
    pub fn classify(&self) -> SendError {
        match self {
            TelegramError::Api {
                status: 403,
                description,
                ..
            } => SendError::Permanent(description.clone()),
            TelegramError::Api {
                status: 400,
                description,
                ..
            } if is_gone(description) => SendError::Permanent(description.clone()),
            TelegramError::Api {
                retry_after: Some(wait),
                description,
                ..
            } => SendError::Transient(format!("{} (retry after {}s)", description, wait.as_secs())),
            other => SendError::Transient(other.to_string()),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TelegramError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn is_gone(description: &str) -> bool {
    let description = description.to_lowercase();
    GONE_MARKERS.iter().any(|marker| description.contains(marker))
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    pub first_name: String,
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub from: Option<User>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
}

#[derive(Serialize)]
struct GetUpdates {
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<i64>,
    timeout: u64,
    allowed_updates: &'static [&'static str],
}

pub struct TelegramClient {
    client: Client,
    api_base: String,
    token: String,
}

impl std::fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramClient")
            .field("api_base", &self.api_base)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl TelegramClient {
    pub fn new(api_base: &str, token: &str) -> Result<Self, TelegramError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    pub async fn get_me(&self) -> Result<User, TelegramError> {
        self.call("getMe", &serde_json::json!({}), None).await
    }

    /// Long poll for updates. Waits up to `timeout_secs` server-side.
    pub async fn get_updates(&self, offset: Option<i64>, timeout_secs: u64) -> Result<Vec<Update>, TelegramError> {
        let request = GetUpdates {
            offset,
            timeout: timeout_secs,
            allowed_updates: &["message"],
        };
        // The HTTP timeout has to outlast the server-side wait
        let http_timeout = Duration::from_secs(timeout_secs + 10);
        self.call("getUpdates", &request, Some(http_timeout)).await
    }

    pub async fn send_message(&self, chat: ChatId, text: &str) -> Result<Message, TelegramError> {
        let request = SendMessage {
            chat_id: chat.0,
            text,
        };
        self.call("sendMessage", &request, None).await
    }

    async fn call<B, T>(&self, method: &str, body: &B, timeout: Option<Duration>) -> Result<T, TelegramError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}/bot{}/{}", self.api_base, self.token, method);
        let mut request = self.client.post(&url).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| TelegramError::Http(e.without_url()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TelegramError::Http(e.without_url()))?;

        let parsed: ApiResponse<T> = match serde_json::from_str(&text) {
            Ok(parsed) => parsed,
            Err(e) if status.is_success() => {
                return Err(TelegramError::Decode(format!("{}: {}", method, e)));
            }
            Err(_) => {
                return Err(TelegramError::Api {
                    status: status.as_u16(),
                    description: text,
                    retry_after: None,
                });
            }
        };

        match (parsed.ok, parsed.result) {
            (true, Some(result)) => {
                debug!(method, "Telegram call ok");
                Ok(result)
            }
            (true, None) => Err(TelegramError::Decode(format!("{}: ok without result", method))),
            (false, _) => Err(TelegramError::Api {
                status: status.as_u16(),
                description: parsed.description.unwrap_or_else(|| status.to_string()),
                retry_after: parsed
                    .parameters
                    .and_then(|p| p.retry_after)
                    .map(Duration::from_secs),
            }),
        }
    }
}

#[async_trait]
impl MessageSender for TelegramClient {
    async fn send_text(&self, chat: ChatId, text: &str) -> Result<(), SendError> {
        self.send_message(chat, text)
            .await
            .map(|_| ())
            .map_err(|e| e.classify())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16, description: &str) -> TelegramError {
        TelegramError::Api {
            status,
            description: description.to_string(),
            retry_after: None,
        }
    }

    #[test]
    fn forbidden_is_permanent() {
        assert!(api(403, "Forbidden: bot was blocked by the user").classify().is_permanent());
        assert!(api(403, "Forbidden: user is deactivated").classify().is_permanent());
    }

    #[test]
    fn gone_chats_are_permanent() {
        assert!(api(400, "Bad Request: chat not found").classify().is_permanent());
        assert!(api(400, "Forbidden: bot was kicked from the group chat").classify().is_permanent());
    }

    #[test]
    fn other_failures_are_transient() {
        assert!(!api(400, "Bad Request: message is too long").classify().is_permanent());
        assert!(!api(502, "Bad Gateway").classify().is_permanent());

        let limited = TelegramError::Api {
            status: 429,
            description: "Too Many Requests: retry after 7".into(),
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(7)));
        match limited.classify() {
            SendError::Transient(msg) => assert!(msg.contains("retry after 7s")),
            other => panic!("expected transient, got {other:?}"),
        }
    }

    #[test]
    fn debug_hides_token() {
        let client = TelegramClient::new("https://api.telegram.org", "123:secret").unwrap();
        let debug = format!("{:?}", client);
        assert!(!debug.contains("secret"));
    }
}
