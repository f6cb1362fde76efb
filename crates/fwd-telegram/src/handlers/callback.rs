use std::sync::Arc;

use teloxide::prelude::*;

use fwd_core::{
    domain::{ChatId, MessageId, MessageRef, UserId},
    formatting::escape_html,
    store::ChatRole,
};

use crate::router::AppState;

use super::admin;

/// Inline buttons attached to chat cards: `add_so_<id>`, `rem_ta_<id>`, ...
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChatButton {
    Add(ChatRole, i64),
    Remove(ChatRole, i64),
}

fn role_code(role: ChatRole) -> &'static str {
    match role {
        ChatRole::Source => "so",
        ChatRole::Target => "ta",
    }
}

impl ChatButton {
    pub(crate) fn encode(self) -> String {
        match self {
            ChatButton::Add(role, id) => format!("add_{}_{id}", role_code(role)),
            ChatButton::Remove(role, id) => format!("rem_{}_{id}", role_code(role)),
        }
    }

    pub(crate) fn parse(data: &str) -> Option<Self> {
        let mut parts = data.splitn(3, '_');
        let action = parts.next()?;
        let role = match parts.next()? {
            "so" => ChatRole::Source,
            "ta" => ChatRole::Target,
            _ => return None,
        };
        let id = parts.next()?.parse::<i64>().ok()?;
        match action {
            "add" => Some(ChatButton::Add(role, id)),
            "rem" => Some(ChatButton::Remove(role, id)),
            _ => None,
        }
    }
}

fn is_chat_button(data: &str) -> bool {
    data.starts_with("rem_") || data.starts_with("add_")
}

async fn answer(state: &AppState, cb_id: &str, text: &str) {
    if let Err(e) = state
        .messenger
        .answer_callback_query(cb_id, Some(text), true)
        .await
    {
        tracing::warn!(error = %e, "callback answer failed");
    }
}

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let cb_id = q.id.clone();
    let user_id = UserId(q.from.id.0 as i64);
    let data = q.data.clone().unwrap_or_default();

    // Always answer callback query eventually.
    let Some(message) = q.message.as_ref() else {
        let _ = state.messenger.answer_callback_query(&cb_id, None, false).await;
        return Ok(());
    };
    if data.is_empty() {
        let _ = state.messenger.answer_callback_query(&cb_id, None, false).await;
        return Ok(());
    }
    let origin = MessageRef {
        chat_id: ChatId(message.chat.id.0),
        message_id: MessageId(message.id.0),
    };

    if state.cfg().is_admin(user_id) && !is_chat_button(&data) {
        return admin::handle_admin_button(bot, &state, &cb_id, user_id, origin, &data).await;
    }

    if state.ctx.control.resolve(user_id).await.is_err() {
        answer(&state, &cb_id, "Your client is not active.").await;
        return Ok(());
    }
    let Some(button) = ChatButton::parse(&data) else {
        answer(&state, &cb_id, "Invalid button data.").await;
        return Ok(());
    };

    match button {
        ChatButton::Remove(role, id) => {
            match state.ctx.control.remove_chat_by_id(user_id, role, id).await {
                Ok(true) => {
                    let (note, toast) = match role {
                        ChatRole::Source => ("Source Removed.", "Source removed!"),
                        ChatRole::Target => ("Target Removed.", "Target removed!"),
                    };
                    let original = message.text().unwrap_or_default();
                    let html = format!("<s>{}</s>\n<i>{note}</i>", escape_html(original));
                    let _ = state.messenger.edit_html(origin, &html).await;
                    answer(&state, &cb_id, toast).await;
                }
                Ok(false) => answer(&state, &cb_id, "Already removed.").await,
                Err(e) => answer(&state, &cb_id, &format!("❌ {e}")).await,
            }
        }
        ChatButton::Add(role, id) => {
            let text = match state.ctx.control.add_chat_by_id(user_id, role, id).await {
                Ok(change) => match (role, change.changed) {
                    (ChatRole::Source, true) => "✅ Added as a source!".to_string(),
                    (ChatRole::Target, true) => "✅ Added as a target!".to_string(),
                    (ChatRole::Source, false) => "Already a source.".to_string(),
                    (ChatRole::Target, false) => "Already a target.".to_string(),
                },
                Err(e) => format!("❌ Could not add chat: {e}"),
            };
            answer(&state, &cb_id, &text).await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_buttons_encode_role_and_id() {
        assert_eq!(
            ChatButton::Remove(ChatRole::Source, -1001234).encode(),
            "rem_so_-1001234"
        );
        assert_eq!(ChatButton::Add(ChatRole::Target, 42).encode(), "add_ta_42");
        assert_eq!(
            ChatButton::parse("rem_ta_-1009"),
            Some(ChatButton::Remove(ChatRole::Target, -1009))
        );
    }

    #[test]
    fn malformed_button_data_is_rejected() {
        assert_eq!(ChatButton::parse("rem_xx_1"), None);
        assert_eq!(ChatButton::parse("add_so_abc"), None);
        assert_eq!(ChatButton::parse("zap_so_1"), None);
        assert_eq!(ChatButton::parse("add_so"), None);
        assert!(is_chat_button("add_so_1"));
        assert!(!is_chat_button("list_users"));
    }
}
