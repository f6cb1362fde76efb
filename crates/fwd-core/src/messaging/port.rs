use std::path::Path;

use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageRef},
    messaging::types::{InlineKeyboard, MessagingCapabilities},
    Result,
};

/// Port for the controller bot that talks to account owners.
///
/// Telegram (teloxide) is the implementation; core services only use this
/// trait so admin operations stay testable.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    fn capabilities(&self) -> MessagingCapabilities;

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef>;
    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()>;
    async fn delete_message(&self, msg: MessageRef) -> Result<()>;

    async fn send_inline_keyboard(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef>;

    async fn answer_callback_query(
        &self,
        callback_id: &str,
        text: Option<&str>,
        alert: bool,
    ) -> Result<()>;

    async fn send_document(&self, chat_id: ChatId, path: &Path, caption: &str)
        -> Result<MessageRef>;

    /// Copy an existing message (any media) into another chat.
    async fn copy_message(&self, to: ChatId, from: MessageRef) -> Result<()>;
}
