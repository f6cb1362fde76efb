//! Telegram HTML snippets shared by the controller replies.

use crate::{
    admin::UserSummary,
    domain::{ChatEntity, ChatId},
};

/// Escape HTML special characters for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn code(text: &str) -> String {
    format!("<code>{}</code>", escape_html(text))
}

/// Name / id / username card used by chat listings.
pub fn chat_card(id: ChatId, entity: Option<&ChatEntity>) -> String {
    let name = entity
        .and_then(|e| e.title.as_deref().filter(|t| !t.is_empty()))
        .map(escape_html)
        .unwrap_or_else(|| "Unknown or Inaccessible Chat".to_string());
    let username = entity
        .and_then(|e| e.username.as_deref().filter(|u| !u.is_empty()))
        .map(|u| format!("@{}", escape_html(u)))
        .unwrap_or_else(|| "N/A".to_string());
    format!(
        "<b>Name:</b> {name}\n<b>Group ID:</b> {}\n<b>Username:</b> {username}",
        code(&id.to_string())
    )
}

/// Admin user list as HTML.
pub fn user_list_html(users: &[UserSummary]) -> String {
    let mut out = String::from("👥 <b>List of All Users</b>\n\n");
    for u in users {
        let owner = u
            .owner
            .map(|o| o.0.to_string())
            .unwrap_or_else(|| "N/A".to_string());
        out.push_str(&format!(
            "• <b>Phone:</b> {}\n  <b>Controller ID:</b> {}\n  <b>Forwarding:</b> {}\n  <b>Session:</b> {}\n\n",
            code(u.account.as_str()),
            code(&owner),
            if u.forwarding_enabled { "ON" } else { "OFF" },
            if u.active { "✅ Active" } else { "❌ Inactive" },
        ));
    }
    out
}

/// Admin user list as plain text (sent as a file when too long).
pub fn user_list_text(users: &[UserSummary]) -> String {
    let mut out = String::from("List of All Users\n\n");
    for u in users {
        let owner = u
            .owner
            .map(|o| o.0.to_string())
            .unwrap_or_else(|| "N/A".to_string());
        out.push_str(&format!(
            "Phone: {}\nController ID: {owner}\nForwarding: {}\nSession: {}\n\n",
            u.account,
            if u.forwarding_enabled { "ON" } else { "OFF" },
            if u.active { "Active" } else { "Inactive" },
        ));
    }
    out
}
