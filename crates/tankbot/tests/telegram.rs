//! Telegram client against a mocked Bot API.

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tankbot::telegram::{TelegramClient, TelegramError};
use tankwatch::{ChatId, MessageSender, SendError};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "123456:TEST";

fn client_for(server: &MockServer) -> TelegramClient {
    TelegramClient::new(&server.uri(), TOKEN).unwrap()
}

fn sent_message(chat: i64, text: &str) -> serde_json::Value {
    json!({
        "ok": true,
        "result": {
            "message_id": 10,
            "chat": { "id": chat, "type": "private" },
            "text": text
        }
    })
}

fn api_error(code: u16, description: &str) -> ResponseTemplate {
    ResponseTemplate::new(code).set_body_json(json!({
        "ok": false,
        "error_code": code,
        "description": description
    }))
}

#[tokio::test]
async fn send_text_posts_chat_and_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{}/sendMessage", TOKEN)))
        .and(body_partial_json(json!({ "chat_id": 42, "text": "level up" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(sent_message(42, "level up")))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.send_text(ChatId(42), "level up").await.unwrap();
}

#[tokio::test]
async fn blocked_user_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{}/sendMessage", TOKEN)))
        .respond_with(api_error(403, "Forbidden: bot was blocked by the user"))
        .mount(&server)
        .await;

    let result = client_for(&server).send_text(ChatId(1), "hi").await;
    assert_eq!(
        result,
        Err(SendError::Permanent("Forbidden: bot was blocked by the user".into()))
    );
}

#[tokio::test]
async fn missing_chat_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{}/sendMessage", TOKEN)))
        .respond_with(api_error(400, "Bad Request: chat not found"))
        .mount(&server)
        .await;

    let result = client_for(&server).send_text(ChatId(1), "hi").await;
    assert!(matches!(result, Err(SendError::Permanent(_))));
}

#[tokio::test]
async fn rate_limit_is_transient_with_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{}/sendMessage", TOKEN)))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "ok": false,
            "error_code": 429,
            "description": "Too Many Requests: retry after 3",
            "parameters": { "retry_after": 3 }
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client.send_message(ChatId(1), "hi").await.unwrap_err();
    assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
    assert!(!err.classify().is_permanent());
}

#[tokio::test]
async fn server_errors_are_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{}/sendMessage", TOKEN)))
        .respond_with(ResponseTemplate::new(502).set_body_string("<html>Bad Gateway</html>"))
        .mount(&server)
        .await;

    let err = client_for(&server).send_message(ChatId(1), "hi").await.unwrap_err();
    assert!(matches!(err, TelegramError::Api { status: 502, .. }));
    assert!(!err.classify().is_permanent());
}

#[tokio::test]
async fn network_failure_is_transient_and_hides_token() {
    // Nothing listens on port 1
    let client = TelegramClient::new("http://127.0.0.1:1", TOKEN).unwrap();
    let err = client.send_message(ChatId(1), "hi").await.unwrap_err();

    assert!(matches!(err, TelegramError::Http(_)));
    assert!(!err.to_string().contains(TOKEN));
    assert!(!err.classify().is_permanent());
}

#[tokio::test]
async fn get_updates_parses_messages() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{}/getUpdates", TOKEN)))
        .and(body_partial_json(json!({ "offset": 7, "timeout": 0 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": [
                {
                    "update_id": 7,
                    "message": {
                        "message_id": 1,
                        "chat": { "id": -100123, "type": "supergroup" },
                        "from": { "id": 5, "is_bot": false, "first_name": "Ana" },
                        "text": "/status@tankbot"
                    }
                },
                { "update_id": 8 }
            ]
        })))
        .mount(&server)
        .await;

    let updates = client_for(&server).get_updates(Some(7), 0).await.unwrap();

    assert_eq!(updates.len(), 2);
    let message = updates[0].message.as_ref().unwrap();
    assert_eq!(message.chat.id, -100123);
    assert_eq!(message.text.as_deref(), Some("/status@tankbot"));
    assert!(updates[1].message.is_none());
}

#[tokio::test]
async fn get_me_returns_username() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{}/getMe", TOKEN)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": { "id": 99, "is_bot": true, "first_name": "Tank", "username": "tankbot" }
        })))
        .mount(&server)
        .await;

    let me = client_for(&server).get_me().await.unwrap();
    assert_eq!(me.username.as_deref(), Some("tankbot"));
    assert!(me.is_bot);
}
