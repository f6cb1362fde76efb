//! Telegram update handlers.
//!
//! Each handler is a small adapter that:
//! - identifies the caller (private chats only)
//! - parses the command/button arguments
//! - calls into `fwd-core` services and renders the outcome as HTML

use std::sync::Arc;

use teloxide::{
    prelude::*,
    types::{CallbackQuery, Message},
};

use fwd_core::{
    domain::{ChatId, UserId},
    errors::Error,
    formatting::{code, escape_html},
};

use crate::router::AppState;

pub mod admin;
mod callback;
mod commands;
mod document;
mod login;

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    callback::handle_callback(bot, q, state).await
}

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    if !msg.chat.is_private() {
        return Ok(());
    }
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let user_id = UserId(user.id.0 as i64);

    // A pending admin action consumes the next message, whatever it is.
    if state.cfg().is_admin(user_id) {
        if let Some(action) = state.conversations.take_admin_action(user_id).await {
            return admin::handle_admin_input(msg, state, action).await;
        }
    }

    if msg.document().is_some() {
        return document::handle_document(bot, msg, state).await;
    }

    if let Some(text) = msg.text() {
        if text.starts_with('/') {
            return commands::handle_command(msg, state).await;
        }
    }

    Ok(())
}

/// Send an HTML reply, logging (not propagating) delivery failures.
pub(crate) async fn reply(state: &AppState, chat_id: ChatId, html: &str) {
    if let Err(e) = state.messenger.send_html(chat_id, html).await {
        tracing::warn!(chat = chat_id.0, error = %e, "reply failed");
    }
}

/// User-facing rendering of a core error.
pub(crate) fn error_reply(err: &Error) -> String {
    match err {
        Error::NoAccount => {
            "You do not have any accounts logged in. Please use /login first.".to_string()
        }
        Error::NotConnected(account) => format!(
            "The client for {} is not currently active. It may still be connecting. Please try again shortly.",
            code(account.as_str())
        ),
        Error::AlreadyConnected(_) => "This number is already logged in and active.".to_string(),
        Error::LoginAlreadyInProgress(_) => {
            "A login for this number is already in progress. Please wait or cancel.".to_string()
        }
        Error::NotOwner(_) => {
            "❌ You can only log out numbers you have registered yourself.".to_string()
        }
        other => format!("❌ {}", escape_html(&other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fwd_core::domain::AccountId;

    #[test]
    fn errors_render_for_users() {
        assert!(error_reply(&Error::NoAccount).contains("/login"));
        assert!(error_reply(&Error::NotConnected(AccountId::new("+1")))
            .contains("<code>+1</code>"));
        assert_eq!(
            error_reply(&Error::AlreadyConnected(AccountId::new("+1"))),
            "This number is already logged in and active."
        );
        assert_eq!(
            error_reply(&Error::InvalidArgument("a <b>".to_string())),
            "❌ invalid argument: a &lt;b&gt;"
        );
    }
}
