//! Chat transport capability and the value types that cross it.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub type ChatId = i64;
pub type MessageId = i64;

/// Hard limit on message text, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Menu,
    ServerList,
    Status,
    PingResult,
    Progress,
    Confirmation,
    Error,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Menu => "menu",
            MessageType::ServerList => "serverList",
            MessageType::Status => "status",
            MessageType::PingResult => "pingResult",
            MessageType::Progress => "progress",
            MessageType::Confirmation => "confirmation",
            MessageType::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Button {
    pub text: String,
    pub callback_data: String,
}

impl Button {
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InlineKeyboard {
    pub rows: Vec<Vec<Button>>,
}

impl InlineKeyboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row(mut self, buttons: Vec<Button>) -> Self {
        if !buttons.is_empty() {
            self.rows.push(buttons);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn buttons(&self) -> impl Iterator<Item = &Button> {
        self.rows.iter().flatten()
    }
}

/// One outgoing message: text body (HTML) plus optional keyboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContent {
    pub kind: MessageType,
    pub text: String,
    pub keyboard: Option<InlineKeyboard>,
}

impl MessageContent {
    pub fn new(kind: MessageType, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: truncate_chars(text.into(), MAX_MESSAGE_CHARS),
            keyboard: None,
        }
    }

    pub fn with_keyboard(mut self, keyboard: InlineKeyboard) -> Self {
        self.keyboard = (!keyboard.is_empty()).then_some(keyboard);
        self
    }
}

/// Last-resort cut for oversized text. Backs off so the tail is not a
/// half-written `&entity;` or `<tag`.
fn truncate_chars(text: String, max: usize) -> String {
    let Some((idx, _)) = text.char_indices().nth(max) else {
        return text;
    };
    let mut cut: String = text[..idx].to_string();
    cut.pop();
    for (open, close) in [('&', ';'), ('<', '>')] {
        if let Some(pos) = cut.rfind(open) {
            if !cut[pos..].contains(close) {
                cut.truncate(pos);
            }
        }
    }
    cut.push('…');
    cut
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateKind {
    Text(String),
    Callback {
        query_id: String,
        data: String,
        message_id: Option<MessageId>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub update_id: i64,
    pub user_id: i64,
    pub chat_id: ChatId,
    pub kind: UpdateKind,
}

/// Result of one long poll. `next_offset` acknowledges every update the server
/// returned, including the ones that did not map to an [`Update`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateBatch {
    pub next_offset: i64,
    pub updates: Vec<Update>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// Edit with identical content.
    #[error("message is not modified")]
    NotModified,
    #[error("chat API error {code}: {description}")]
    Api { code: i64, description: String },
    #[error("chat transport failure: {0}")]
    Transport(String),
    #[error("chat response decode failure: {0}")]
    Decode(String),
}

/// Server side of the chat channel.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(
        &self,
        chat: ChatId,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<MessageId, ChatError>;

    async fn edit_message(
        &self,
        chat: ChatId,
        message_id: MessageId,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<(), ChatError>;

    async fn delete_message(&self, chat: ChatId, message_id: MessageId) -> Result<(), ChatError>;

    async fn answer_callback(&self, query_id: &str, text: Option<&str>) -> Result<(), ChatError>;

    /// Long-poll for updates after `offset`.
    async fn poll_updates(
        &self,
        offset: i64,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<UpdateBatch, ChatError>;
}
