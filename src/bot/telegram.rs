//! Telegram Bot API transport (JSON over HTTPS, HTML parse mode).

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::bot::transport::{
    ChatError, ChatId, ChatTransport, InlineKeyboard, MessageId, Update, UpdateBatch, UpdateKind,
};

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    error_code: Option<i64>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct RawChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    message_id: i64,
    chat: RawChat,
    from: Option<RawUser>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCallback {
    id: String,
    from: RawUser,
    message: Option<RawMessage>,
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawUpdate {
    update_id: i64,
    message: Option<RawMessage>,
    callback_query: Option<RawCallback>,
}

impl RawUpdate {
    fn into_update(self) -> Option<Update> {
        if let Some(cb) = self.callback_query {
            let chat_id = cb.message.as_ref().map(|m| m.chat.id).unwrap_or(cb.from.id);
            return Some(Update {
                update_id: self.update_id,
                user_id: cb.from.id,
                chat_id,
                kind: UpdateKind::Callback {
                    query_id: cb.id,
                    data: cb.data.unwrap_or_default(),
                    message_id: cb.message.map(|m| m.message_id),
                },
            });
        }
        let msg = self.message?;
        let user_id = msg.from.map(|u| u.id)?;
        Some(Update {
            update_id: self.update_id,
            user_id,
            chat_id: msg.chat.id,
            kind: UpdateKind::Text(msg.text?),
        })
    }
}

pub struct TelegramTransport {
    client: reqwest::Client,
    base: String,
}

impl TelegramTransport {
    pub fn new(token: &str) -> Result<Self, ChatError> {
        Self::with_base_url(token, DEFAULT_API_BASE)
    }

    pub fn with_base_url(token: &str, api_base: &str) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .user_agent(crate::app::fetcher::USER_AGENT)
            .build()
            .map_err(|e| ChatError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base: format!("{}/bot{}", api_base.trim_end_matches('/'), token),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: Value,
        timeout: Duration,
    ) -> Result<T, ChatError> {
        trace!(method, "chat api call");
        let response = self
            .client
            .post(format!("{}/{}", self.base, method))
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            // 错误里的 URL 含 bot token
            .map_err(|e| ChatError::Transport(e.without_url().to_string()))?;

        let parsed: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| ChatError::Decode(e.without_url().to_string()))?;
        into_result(parsed)
    }
}

fn into_result<T>(resp: ApiResponse<T>) -> Result<T, ChatError> {
    if resp.ok {
        return resp
            .result
            .ok_or_else(|| ChatError::Decode("ok response without result".into()));
    }
    let description = resp.description.unwrap_or_default();
    if description.contains("message is not modified") {
        return Err(ChatError::NotModified);
    }
    Err(ChatError::Api {
        code: resp.error_code.unwrap_or(0),
        description,
    })
}

fn keyboard_json(keyboard: &InlineKeyboard) -> Value {
    let rows: Vec<Vec<Value>> = keyboard
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|b| json!({ "text": b.text, "callback_data": b.callback_data }))
                .collect()
        })
        .collect();
    json!({ "inline_keyboard": rows })
}

fn message_body(chat: ChatId, text: &str, keyboard: Option<&InlineKeyboard>) -> Value {
    let mut body = json!({
        "chat_id": chat,
        "text": text,
        "parse_mode": "HTML",
        "disable_web_page_preview": true,
    });
    if let Some(kb) = keyboard {
        body["reply_markup"] = keyboard_json(kb);
    }
    body
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_message(
        &self,
        chat: ChatId,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<MessageId, ChatError> {
        #[derive(Deserialize)]
        struct Sent {
            message_id: i64,
        }
        let sent: Sent = self
            .call("sendMessage", message_body(chat, text, keyboard), REQUEST_TIMEOUT)
            .await?;
        Ok(sent.message_id)
    }

    async fn edit_message(
        &self,
        chat: ChatId,
        message_id: MessageId,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<(), ChatError> {
        let mut body = message_body(chat, text, keyboard);
        body["message_id"] = json!(message_id);
        // editMessageText 返回 Message 或 true
        let _: Value = self.call("editMessageText", body, REQUEST_TIMEOUT).await?;
        Ok(())
    }

    async fn delete_message(&self, chat: ChatId, message_id: MessageId) -> Result<(), ChatError> {
        let _: bool = self
            .call(
                "deleteMessage",
                json!({ "chat_id": chat, "message_id": message_id }),
                REQUEST_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    async fn answer_callback(&self, query_id: &str, text: Option<&str>) -> Result<(), ChatError> {
        let mut body = json!({ "callback_query_id": query_id });
        if let Some(text) = text {
            body["text"] = json!(text);
        }
        let _: bool = self.call("answerCallbackQuery", body, REQUEST_TIMEOUT).await?;
        Ok(())
    }

    async fn poll_updates(
        &self,
        offset: i64,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<UpdateBatch, ChatError> {
        let body = json!({
            "offset": offset,
            "timeout": timeout.as_secs(),
            "allowed_updates": ["message", "callback_query"],
        });
        let request = self.call::<Vec<RawUpdate>>("getUpdates", body, timeout + REQUEST_TIMEOUT);
        let raw = tokio::select! {
            _ = cancel.cancelled() => {
                return Ok(UpdateBatch { next_offset: offset, updates: Vec::new() })
            }
            raw = request => raw?,
        };
        let total = raw.len();
        let batch = into_batch(offset, raw);
        if total > 0 {
            debug!(
                total,
                usable = batch.updates.len(),
                next_offset = batch.next_offset,
                "updates received"
            );
        }
        Ok(batch)
    }
}

/// 无法识别的 update（贴纸、频道消息等）同样要确认，否则服务器会反复下发
fn into_batch(offset: i64, raw: Vec<RawUpdate>) -> UpdateBatch {
    let next_offset = raw
        .iter()
        .map(|u| u.update_id + 1)
        .fold(offset, i64::max);
    UpdateBatch {
        next_offset,
        updates: raw.into_iter().filter_map(RawUpdate::into_update).collect(),
    }
}
