//! Telegram bot API client.
//!
//! Outbound: `sendMessage` with HTML parse mode and link previews disabled.
//! Inbound: `getUpdates` long polling, mapped to typed updates carrying
//! either a free-text message or a callback-query payload plus the chat id
//! and username. The poll loop owns its own `update_id` offset cursor.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::config::TelegramConfig;

/// Outbound message delivery seam. Implemented by [`TelegramClient`] in
/// production and by recording fakes in tests.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> anyhow::Result<()>;
}

/// Inbound payload of one update.
#[derive(Debug, Clone)]
pub enum InboundPayload {
    Text(String),
    Callback(String),
}

impl InboundPayload {
    pub fn text(&self) -> &str {
        match self {
            InboundPayload::Text(t) | InboundPayload::Callback(t) => t,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Update {
    pub update_id: i64,
    pub chat_id: i64,
    pub username: Option<String>,
    pub payload: InboundPayload,
}

// --- raw wire shapes ---

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    callback_query: Option<RawCallback>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    chat: RawChat,
    #[serde(default)]
    from: Option<RawUser>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCallback {
    #[serde(default)]
    message: Option<RawMessage>,
    from: RawUser,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    #[serde(default)]
    username: Option<String>,
}

pub struct TelegramClient {
    base_url: String,
    token: String,
    poll_timeout: Duration,
    client: reqwest::Client,
}

impl TelegramClient {
    pub fn new(config: &TelegramConfig) -> Self {
        let poll_timeout = Duration::from_secs(config.poll_timeout_secs);
        // Long polls hold the connection open for poll_timeout; leave headroom.
        let client = reqwest::Client::builder()
            .timeout(poll_timeout + Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: config.base_url.clone(),
            token: config.bot_token.clone(),
            poll_timeout,
            client,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    /// Long-poll for updates newer than `offset`.
    pub async fn get_updates(&self, offset: i64) -> anyhow::Result<Vec<Update>> {
        let resp = self
            .client
            .get(self.method_url("getUpdates"))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", self.poll_timeout.as_secs().to_string()),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            anyhow::bail!("getUpdates returned status {}", resp.status());
        }

        let body: ApiResponse<Vec<RawUpdate>> = resp.json().await?;
        if !body.ok {
            anyhow::bail!(
                "getUpdates rejected: {}",
                body.description.unwrap_or_default()
            );
        }

        let updates: Vec<Update> = body
            .result
            .unwrap_or_default()
            .into_iter()
            .filter_map(parse_update)
            .collect();
        debug!(count = updates.len(), offset = offset, "updates received");
        Ok(updates)
    }
}

fn parse_update(raw: RawUpdate) -> Option<Update> {
    if let Some(cb) = raw.callback_query {
        let chat_id = cb.message.as_ref().map(|m| m.chat.id)?;
        return Some(Update {
            update_id: raw.update_id,
            chat_id,
            username: cb.from.username,
            payload: InboundPayload::Callback(cb.data.unwrap_or_default()),
        });
    }
    let message = raw.message?;
    let text = message.text?;
    Some(Update {
        update_id: raw.update_id,
        chat_id: message.chat.id,
        username: message.from.and_then(|u| u.username),
        payload: InboundPayload::Text(text),
    })
}

#[async_trait]
impl MessageSink for TelegramClient {
    async fn send_message(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "HTML",
                "disable_web_page_preview": true,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("sendMessage failed: {} - {}", status, body);
        }

        let body: ApiResponse<serde_json::Value> = resp.json().await?;
        if !body.ok {
            anyhow::bail!(
                "sendMessage rejected: {}",
                body.description.unwrap_or_default()
            );
        }
        debug!(chat = chat_id, bytes = text.len(), "message sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_update() {
        let raw: RawUpdate = serde_json::from_str(
            r#"{"update_id": 7, "message": {"chat": {"id": 42}, "from": {"username": "alice"}, "text": "/subscribe"}}"#,
        )
        .unwrap();
        let update = parse_update(raw).unwrap();
        assert_eq!(update.chat_id, 42);
        assert_eq!(update.username.as_deref(), Some("alice"));
        assert_eq!(update.payload.text(), "/subscribe");
    }

    #[test]
    fn test_parse_callback_update() {
        let raw: RawUpdate = serde_json::from_str(
            r#"{"update_id": 8, "callback_query": {"from": {"username": "bob"}, "data": "unsubscribe", "message": {"chat": {"id": 9}}}}"#,
        )
        .unwrap();
        let update = parse_update(raw).unwrap();
        assert_eq!(update.chat_id, 9);
        assert!(matches!(update.payload, InboundPayload::Callback(_)));
    }

    #[test]
    fn test_non_text_update_is_skipped() {
        let raw: RawUpdate =
            serde_json::from_str(r#"{"update_id": 9, "message": {"chat": {"id": 1}}}"#).unwrap();
        assert!(parse_update(raw).is_none());
    }
}
