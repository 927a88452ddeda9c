//! Per-user live message tracking.
//!
//! Each chat owns at most one live message. Same-type content edits it in place,
//! other content replaces it. A per-chat mutex keeps send/edit/delete for one
//! chat ordered; different chats never contend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::bot::transport::{ChatError, ChatId, ChatTransport, MessageContent, MessageId, MessageType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSession {
    pub message_id: MessageId,
    pub kind: MessageType,
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl ChatSession {
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

type Slot = Arc<Mutex<Option<ChatSession>>>;

pub struct SessionManager {
    transport: Arc<dyn ChatTransport>,
    ttl: Duration,
    sessions: RwLock<HashMap<ChatId, Slot>>,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn ChatTransport>, ttl: Duration) -> Self {
        Self {
            transport,
            ttl,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn transport(&self) -> &Arc<dyn ChatTransport> {
        &self.transport
    }

    async fn slot(&self, chat: ChatId) -> Slot {
        if let Some(slot) = self.sessions.read().await.get(&chat) {
            return Arc::clone(slot);
        }
        let mut sessions = self.sessions.write().await;
        Arc::clone(sessions.entry(chat).or_default())
    }

    pub async fn current(&self, chat: ChatId) -> Option<ChatSession> {
        let slot = self.sessions.read().await.get(&chat).cloned()?;
        let session = slot.lock().await.clone();
        session
    }

    /// Number of chats with a live message.
    pub async fn live_count(&self) -> usize {
        let slots: Vec<Slot> = self.sessions.read().await.values().cloned().collect();
        let mut n = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                n += 1;
            }
        }
        n
    }

    /// Post a new message and retire the previous live one.
    pub async fn send_new(&self, chat: ChatId, content: &MessageContent) -> Result<MessageId, ChatError> {
        let slot = self.slot(chat).await;
        let mut guard = slot.lock().await;
        self.replace_locked(chat, &mut guard, content).await
    }

    /// Edit the live message when it has the same type, otherwise replace it.
    pub async fn send_or_edit(
        &self,
        chat: ChatId,
        content: &MessageContent,
    ) -> Result<MessageId, ChatError> {
        let slot = self.slot(chat).await;
        let mut guard = slot.lock().await;
        let now = Instant::now();

        let editable = guard
            .as_ref()
            .filter(|s| s.kind == content.kind && !s.is_expired_at(now))
            .map(|s| s.message_id);

        let Some(message_id) = editable else {
            return self.replace_locked(chat, &mut guard, content).await;
        };

        match self
            .transport
            .edit_message(chat, message_id, &content.text, content.keyboard.as_ref())
            .await
        {
            Ok(()) | Err(ChatError::NotModified) => {
                if let Some(session) = guard.as_mut() {
                    session.expires_at = now + self.ttl;
                }
                Ok(message_id)
            }
            Err(e) => {
                debug!(chat, message_id, error = %e, "edit failed, sending new message");
                self.replace_locked(chat, &mut guard, content).await
            }
        }
    }

    async fn replace_locked(
        &self,
        chat: ChatId,
        guard: &mut Option<ChatSession>,
        content: &MessageContent,
    ) -> Result<MessageId, ChatError> {
        let message_id = self
            .transport
            .send_message(chat, &content.text, content.keyboard.as_ref())
            .await?;

        if let Some(old) = guard.take() {
            if let Err(e) = self.transport.delete_message(chat, old.message_id).await {
                debug!(chat, message_id = old.message_id, error = %e, "delete of previous message failed");
            }
        }

        let now = Instant::now();
        *guard = Some(ChatSession {
            message_id,
            kind: content.kind,
            created_at: now,
            expires_at: now + self.ttl,
        });
        Ok(message_id)
    }

    /// Delete live messages whose expiry is at or before `now`, then forget
    /// chats left with neither a live message nor an in-flight handler.
    pub async fn cleanup_expired_at(&self, now: Instant) -> usize {
        let slots: Vec<(ChatId, Slot)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(chat, slot)| (*chat, Arc::clone(slot)))
            .collect();

        let mut removed = 0;
        for (chat, slot) in slots {
            let mut guard = slot.lock().await;
            let expired = guard.as_ref().is_some_and(|s| s.is_expired_at(now));
            if !expired {
                continue;
            }
            if let Some(old) = guard.take() {
                if let Err(e) = self.transport.delete_message(chat, old.message_id).await {
                    warn!(chat, error = %e, "expired message delete failed");
                }
                removed += 1;
            }
        }

        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        // strong_count == 1：只有表本身持有，当前没有处理中的命令
        sessions.retain(|_, slot| {
            Arc::strong_count(slot) > 1 || slot.try_lock().map_or(true, |guard| guard.is_some())
        });
        let forgotten = before - sessions.len();
        if removed > 0 || forgotten > 0 {
            debug!(removed, forgotten, "expired chat sessions cleaned");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::mock::{MockTransport, Op};

    fn manager(mock: &Arc<MockTransport>) -> SessionManager {
        SessionManager::new(mock.clone(), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn first_send_creates_session() {
        let mock = Arc::new(MockTransport::default());
        let sm = manager(&mock);
        let id = sm
            .send_or_edit(1, &MessageContent::new(MessageType::Menu, "menu"))
            .await
            .unwrap();
        let s = sm.current(1).await.unwrap();
        assert_eq!(s.message_id, id);
        assert_eq!(s.kind, MessageType::Menu);
        assert_eq!(mock.ops(), vec![Op::Send { chat: 1, id, text: "menu".into() }]);
    }

    #[tokio::test]
    async fn same_type_edits_in_place() {
        let mock = Arc::new(MockTransport::default());
        let sm = manager(&mock);
        let id = sm
            .send_or_edit(1, &MessageContent::new(MessageType::ServerList, "page 1"))
            .await
            .unwrap();
        let id2 = sm
            .send_or_edit(1, &MessageContent::new(MessageType::ServerList, "page 2"))
            .await
            .unwrap();
        assert_eq!(id, id2);
        assert_eq!(
            mock.ops().last().unwrap(),
            &Op::Edit { chat: 1, id, text: "page 2".into() }
        );
        assert_eq!(sm.live_count().await, 1);
    }

    #[tokio::test]
    async fn other_type_replaces_and_deletes_old() {
        let mock = Arc::new(MockTransport::default());
        let sm = manager(&mock);
        let old = sm
            .send_or_edit(1, &MessageContent::new(MessageType::Menu, "menu"))
            .await
            .unwrap();
        let new = sm
            .send_or_edit(1, &MessageContent::new(MessageType::Status, "status"))
            .await
            .unwrap();
        assert_ne!(old, new);
        assert!(mock.ops().contains(&Op::Delete { chat: 1, id: old }));
        assert_eq!(sm.current(1).await.unwrap().kind, MessageType::Status);
        assert_eq!(sm.live_count().await, 1);
    }

    #[tokio::test]
    async fn not_modified_is_success() {
        let mock = Arc::new(MockTransport::default());
        let sm = manager(&mock);
        let id = sm
            .send_or_edit(1, &MessageContent::new(MessageType::Status, "same"))
            .await
            .unwrap();
        mock.fail_next_edit(ChatError::NotModified);
        let id2 = sm
            .send_or_edit(1, &MessageContent::new(MessageType::Status, "same"))
            .await
            .unwrap();
        assert_eq!(id, id2);
        assert_eq!(mock.sent_count(), 1);
    }

    #[tokio::test]
    async fn failed_edit_falls_back_to_new_message() {
        let mock = Arc::new(MockTransport::default());
        let sm = manager(&mock);
        let id = sm
            .send_or_edit(1, &MessageContent::new(MessageType::Status, "a"))
            .await
            .unwrap();
        mock.fail_next_edit(ChatError::Api {
            code: 400,
            description: "message to edit not found".into(),
        });
        let id2 = sm
            .send_or_edit(1, &MessageContent::new(MessageType::Status, "b"))
            .await
            .unwrap();
        assert_ne!(id, id2);
        assert_eq!(sm.current(1).await.unwrap().message_id, id2);
    }

    #[tokio::test]
    async fn send_new_always_posts() {
        let mock = Arc::new(MockTransport::default());
        let sm = manager(&mock);
        let a = sm
            .send_new(1, &MessageContent::new(MessageType::Menu, "a"))
            .await
            .unwrap();
        let b = sm
            .send_new(1, &MessageContent::new(MessageType::Menu, "b"))
            .await
            .unwrap();
        assert_ne!(a, b);
        assert!(mock.ops().contains(&Op::Delete { chat: 1, id: a }));
    }

    #[tokio::test]
    async fn chats_are_independent() {
        let mock = Arc::new(MockTransport::default());
        let sm = manager(&mock);
        sm.send_or_edit(1, &MessageContent::new(MessageType::Menu, "a"))
            .await
            .unwrap();
        sm.send_or_edit(2, &MessageContent::new(MessageType::Menu, "b"))
            .await
            .unwrap();
        assert_eq!(sm.live_count().await, 2);
        let before = sm.current(2).await.unwrap().message_id;
        sm.send_new(1, &MessageContent::new(MessageType::Status, "c"))
            .await
            .unwrap();
        assert_eq!(sm.current(2).await.unwrap().message_id, before);
        assert_eq!(sm.current(1).await.unwrap().kind, MessageType::Status);
    }

    #[tokio::test]
    async fn expired_sessions_removed() {
        let mock = Arc::new(MockTransport::default());
        let sm = SessionManager::new(mock.clone(), Duration::from_secs(60));
        let id = sm
            .send_or_edit(7, &MessageContent::new(MessageType::Menu, "menu"))
            .await
            .unwrap();

        assert_eq!(sm.cleanup_expired_at(Instant::now()).await, 0);
        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(sm.cleanup_expired_at(later).await, 1);
        assert!(sm.current(7).await.is_none());
        assert!(mock.ops().contains(&Op::Delete { chat: 7, id }));
        assert!(sm.sessions.read().await.is_empty());
    }

    #[tokio::test]
    async fn idle_chat_slots_forgotten() {
        let mock = Arc::new(MockTransport::default());
        let sm = manager(&mock);
        // 发送失败后留下空槽位
        let _ = sm.slot(3).await;
        sm.send_or_edit(4, &MessageContent::new(MessageType::Menu, "m"))
            .await
            .unwrap();
        let held = sm.slot(5).await;
        assert_eq!(sm.sessions.read().await.len(), 3);

        assert_eq!(sm.cleanup_expired_at(Instant::now()).await, 0);
        let sessions = sm.sessions.read().await;
        assert!(!sessions.contains_key(&3));
        assert!(sessions.contains_key(&4));
        // 仍被处理中的命令持有
        assert!(sessions.contains_key(&5));
        drop(held);
    }

    #[tokio::test]
    async fn concurrent_sends_keep_single_session() {
        let mock = Arc::new(MockTransport::default());
        let sm = Arc::new(manager(&mock));
        let mut handles = Vec::new();
        for i in 0..10 {
            let sm = sm.clone();
            handles.push(tokio::spawn(async move {
                let kind = if i % 2 == 0 { MessageType::Menu } else { MessageType::Status };
                sm.send_or_edit(1, &MessageContent::new(kind, format!("m{}", i)))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(sm.live_count().await, 1);
        // every replaced message was deleted
        assert_eq!(mock.sent_count(), mock.deleted_count() + 1);
    }
}
