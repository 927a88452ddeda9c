//! Telegram 控制面：会话、键盘、命令路由

pub mod button_text;
pub mod keyboard;
pub mod messages;
pub mod rate_limit;
pub mod router;
pub mod session;
pub mod telegram;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use router::{CommandRouter, RouterDeps};
pub use session::SessionManager;
pub use telegram::TelegramTransport;
pub use transport::{ChatError, ChatTransport, UpdateBatch};
