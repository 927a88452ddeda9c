//! Recording chat transport for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::bot::transport::{
    ChatError, ChatId, ChatTransport, InlineKeyboard, MessageId, Update, UpdateBatch,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Send { chat: ChatId, id: MessageId, text: String },
    Edit { chat: ChatId, id: MessageId, text: String },
    Delete { chat: ChatId, id: MessageId },
    Answer { query_id: String, text: Option<String> },
}

#[derive(Default)]
pub struct MockTransport {
    next_id: AtomicI64,
    ops: Mutex<Vec<Op>>,
    keyboards: Mutex<Vec<Option<InlineKeyboard>>>,
    edit_failures: Mutex<VecDeque<ChatError>>,
    updates: Mutex<VecDeque<Update>>,
    skipped: Mutex<Vec<i64>>,
    polled: Mutex<Vec<i64>>,
}

impl MockTransport {
    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    pub fn fail_next_edit(&self, err: ChatError) {
        self.edit_failures.lock().unwrap().push_back(err);
    }

    pub fn push_update(&self, update: Update) {
        self.updates.lock().unwrap().push_back(update);
    }

    /// Queue an update id the transport cannot turn into an [`Update`].
    pub fn push_unusable(&self, update_id: i64) {
        self.skipped.lock().unwrap().push(update_id);
    }

    /// Offsets passed to every poll so far.
    pub fn polled_offsets(&self) -> Vec<i64> {
        self.polled.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, Op::Send { .. }))
            .count()
    }

    pub fn deleted_count(&self) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, Op::Delete { .. }))
            .count()
    }

    /// Text of the latest send or edit.
    pub fn last_text(&self) -> Option<String> {
        self.ops().into_iter().rev().find_map(|op| match op {
            Op::Send { text, .. } | Op::Edit { text, .. } => Some(text),
            _ => None,
        })
    }

    /// Keyboard of the latest send or edit.
    pub fn last_keyboard(&self) -> Option<InlineKeyboard> {
        self.keyboards.lock().unwrap().last().cloned().flatten()
    }

    pub fn answered(&self) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, Op::Answer { .. }))
            .count()
    }
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn send_message(
        &self,
        chat: ChatId,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<MessageId, ChatError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.ops.lock().unwrap().push(Op::Send {
            chat,
            id,
            text: text.to_string(),
        });
        self.keyboards.lock().unwrap().push(keyboard.cloned());
        Ok(id)
    }

    async fn edit_message(
        &self,
        chat: ChatId,
        message_id: MessageId,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<(), ChatError> {
        if let Some(err) = self.edit_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.ops.lock().unwrap().push(Op::Edit {
            chat,
            id: message_id,
            text: text.to_string(),
        });
        self.keyboards.lock().unwrap().push(keyboard.cloned());
        Ok(())
    }

    async fn delete_message(&self, chat: ChatId, message_id: MessageId) -> Result<(), ChatError> {
        self.ops.lock().unwrap().push(Op::Delete {
            chat,
            id: message_id,
        });
        Ok(())
    }

    async fn answer_callback(&self, query_id: &str, text: Option<&str>) -> Result<(), ChatError> {
        self.ops.lock().unwrap().push(Op::Answer {
            query_id: query_id.to_string(),
            text: text.map(str::to_string),
        });
        Ok(())
    }

    async fn poll_updates(
        &self,
        offset: i64,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<UpdateBatch, ChatError> {
        self.polled.lock().unwrap().push(offset);
        let updates: Vec<Update> = self.updates.lock().unwrap().drain(..).collect();
        let skipped: Vec<i64> = self.skipped.lock().unwrap().drain(..).collect();
        if updates.is_empty() && skipped.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            }
        }
        let next_offset = updates
            .iter()
            .map(|u| u.update_id)
            .chain(skipped)
            .map(|id| id + 1)
            .fold(offset, i64::max);
        Ok(UpdateBatch { next_offset, updates })
    }
}
