use std::{sync::Arc, time::Duration};

use teloxide::prelude::*;

use fwd_core::{
    control::AutoForwardChange,
    domain::{AccountId, ChatId, MessageId, MessageRef, UserId},
    errors::Error,
    formatting::{chat_card, code, escape_html},
    messaging::types::{InlineButton, InlineKeyboard},
    store::ChatRole,
};

use crate::router::AppState;

use super::{admin, callback::ChatButton, error_reply, login, reply};

const GROUP_LIST_PAUSE: Duration = Duration::from_millis(200);

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

const HELP: &str = "🛠 <b>Bot Guide</b>\n\n\
<b>Login Commands:</b>\n\
  <code>/login &lt;phone&gt;</code> – Login via QR code.\n\
  <code>/loginotp &lt;phone&gt;</code> – Login via OTP code.\n\
  <code>/session &lt;phone&gt;</code> – Login by uploading a session file.\n\
  <code>/session_string &lt;phone&gt; &lt;string&gt;</code> – Login with an exported session string.\n\
\n<b>Login Steps:</b>\n\
  <code>/otp &lt;code&gt;</code> – Submit the OTP code.\n\
  <code>/password &lt;pass&gt;</code> – Submit your 2FA password.\n\
  <code>/cancel</code> – Abort a pending login.\n\
\n<b>Account Management:</b>\n\
  <code>/logout &lt;phone&gt;</code> – Log out and delete an account's data.\n\
\n<b>Forwarding Commands:</b>\n\
  <code>/add_source &lt;id&gt;</code> – Add a source chat.\n\
  <code>/add_target &lt;id&gt;</code> – Add a target chat.\n\
  <code>/remove_source &lt;id&gt;</code> – Remove a source chat.\n\
  <code>/remove_target &lt;id&gt;</code> – Remove a target chat.\n\
  <code>/list_source</code> – Show sources.\n\
  <code>/list_target</code> – Show targets.\n\
  <code>/getgroups</code> – List all your chats.\n\
  <code>/restart_forwarding</code> – Resume forwarding.\n\
  <code>/stop_forwarding</code> – Pause forwarding.\n\
  <code>/auto_message &lt;min|stop&gt;</code> – Manage auto-messaging.\n\
  <code>/delaytime &lt;min&gt; &lt;max&gt;</code> – Set custom delay between forwards.";

const LOGIN_METHODS: &str = "<b>Available Login Methods:</b>\n\n\
➡️ /login &lt;phone&gt; - <b>Get a QR code to scan.</b>\n\n\
➡️ /loginotp &lt;phone&gt; - <b>Receive a login code in your Telegram app.</b>\n\n\
➡️ /session &lt;phone&gt; - <b>Upload a session file.</b>";

/// `/start` reply for a user with the given accounts.
fn start_text(name: &str, user: UserId, accounts: &[AccountId], active: bool) -> String {
    let Some(first) = accounts.first() else {
        return format!(
            "<b>You are Not Logged in.</b>\nPlease log in first to use the bot.\n\n\
<b>📱TELEGRAM CONNECTION GUIDE📱</b>\n\n{LOGIN_METHODS}"
        );
    };

    if active {
        let phones = accounts
            .iter()
            .map(|a| format!("  - {}", code(a.as_str())))
            .collect::<Vec<_>>()
            .join("\n");
        return format!(
            "👋 <b>Welcome back!</b>\n\n\
👤 <b>Name:</b> {}\n\
🆔 <b>User ID:</b> {}\n\
📱 <b>Logged in with:</b>\n{phones}\n\n\
Use /help for commands.",
            escape_html(name),
            code(&user.0.to_string()),
        );
    }

    format!(
        "<b>⚠️ Session Inactive</b>\n\n\
Hello <b>{}</b>! It looks like you're registered with <b>{}</b>, but your session is no longer active.\n\n\
Please log in again to restart the service. Your saved settings (sources and targets) will be preserved.\n\n\
{LOGIN_METHODS}",
        escape_html(name),
        code(first.as_str()),
    )
}

fn plural_title(role: ChatRole) -> &'static str {
    match role {
        ChatRole::Source => "📚 <b>Your Sources:</b>",
        ChatRole::Target => "🎯 <b>Your Targets:</b>",
    }
}

fn empty_list(role: ChatRole) -> &'static str {
    match role {
        ChatRole::Source => "📚 <b>Sources:</b>\n(none)",
        ChatRole::Target => "🎯 <b>Targets:</b>\n(none)",
    }
}

fn remove_label(role: ChatRole) -> &'static str {
    match role {
        ChatRole::Source => "➖ Remove Source",
        ChatRole::Target => "➖ Remove Target",
    }
}

/// Render a validation error as a sentence.
fn sentence(msg: &str) -> String {
    let mut chars = msg.chars();
    let mut out: String = match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    };
    if !out.ends_with('.') {
        out.push('.');
    }
    out
}

/// Ensure the caller's account is connected, replying with the reason when
/// it is not.
async fn require_connection(state: &AppState, chat_id: ChatId, user: UserId) -> bool {
    match state.ctx.control.resolve(user).await {
        Ok(_) => true,
        Err(e) => {
            reply(state, chat_id, &error_reply(&e)).await;
            false
        }
    }
}

pub async fn handle_command(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let user_id = UserId(user.id.0 as i64);
    let first_name = user.first_name.clone();
    let chat_id = ChatId(msg.chat.id.0);

    let (cmd, arg) = parse_command(text);
    tracing::debug!(user = user_id.0, command = %cmd, "command received");

    match cmd.as_str() {
        "start" => {
            let accounts = state.ctx.control.owned_accounts(user_id).await;
            let active = match accounts.first() {
                Some(a) => state.ctx.registry.is_live(a).await,
                None => false,
            };
            reply(&state, chat_id, &start_text(&first_name, user_id, &accounts, active)).await;
        }

        "help" => reply(&state, chat_id, HELP).await,

        "login" => login::qr_login(&state, chat_id, user_id, &arg).await,
        "loginotp" => login::code_login(&state, chat_id, user_id, &arg).await,
        "otp" => login::submit_code(&state, chat_id, user_id, &arg).await,
        "password" => login::submit_password(&state, chat_id, user_id, &arg).await,
        "cancel" => login::cancel(&state, chat_id, user_id).await,
        "session" => login::start_session_upload(&state, chat_id, user_id, &arg).await,
        "session_string" => {
            let command = MessageRef {
                chat_id,
                message_id: MessageId(msg.id.0),
            };
            login::import_session_string(&state, chat_id, user_id, &arg, command).await
        }
        "logout" => login::logout(&state, chat_id, user_id, &arg).await,

        "admin" => {
            if state.cfg().is_admin(user_id) {
                admin::show_panel(&state, chat_id).await;
            }
        }

        "add_source" => add_chat(&state, chat_id, user_id, ChatRole::Source, &arg).await,
        "add_target" => add_chat(&state, chat_id, user_id, ChatRole::Target, &arg).await,
        "remove_source" => remove_chat(&state, chat_id, user_id, ChatRole::Source, &arg).await,
        "remove_target" => remove_chat(&state, chat_id, user_id, ChatRole::Target, &arg).await,
        "list_source" => list_chats(&state, chat_id, user_id, ChatRole::Source).await,
        "list_target" => list_chats(&state, chat_id, user_id, ChatRole::Target).await,
        "getgroups" => list_groups(&state, chat_id, user_id).await,

        "restart_forwarding" | "stop_forwarding" => {
            let enabled = cmd == "restart_forwarding";
            let text = match state.ctx.control.set_forwarding_enabled(user_id, enabled).await {
                Ok(()) if enabled => "▶️ Forwarding has been <b>started</b>.".to_string(),
                Ok(()) => "⏸️ Forwarding has been <b>stopped</b>.".to_string(),
                Err(e) => error_reply(&e),
            };
            reply(&state, chat_id, &text).await;
        }

        "auto_message" => auto_message(&state, chat_id, user_id, &arg).await,
        "delaytime" => delay_time(&state, chat_id, user_id, &arg).await,

        _ => {}
    }

    Ok(())
}

async fn add_chat(state: &AppState, chat_id: ChatId, user: UserId, role: ChatRole, arg: &str) {
    if !require_connection(state, chat_id, user).await {
        return;
    }
    if arg.is_empty() {
        let cmd = match role {
            ChatRole::Source => "/add_source",
            ChatRole::Target => "/add_target",
        };
        let text = format!(
            "❌ This command requires a chat ID or username.\n<i>Example:</i> {}",
            code(&format!("{cmd} @channelname"))
        );
        reply(state, chat_id, &text).await;
        return;
    }

    let text = match state.ctx.control.add_chat(user, role, arg).await {
        Ok(change) => format!(
            "✅ '{}' is saved as a {}.",
            escape_html(&change.entity.display_name()),
            role.label()
        ),
        Err(e) => format!(
            "❌ Could not find chat '{}'. Error: {}",
            escape_html(arg),
            escape_html(&e.to_string())
        ),
    };
    reply(state, chat_id, &text).await;
}

async fn remove_chat(state: &AppState, chat_id: ChatId, user: UserId, role: ChatRole, arg: &str) {
    if !require_connection(state, chat_id, user).await {
        return;
    }
    if arg.is_empty() {
        let cmd = match role {
            ChatRole::Source => "/remove_source",
            ChatRole::Target => "/remove_target",
        };
        let text = format!(
            "❌ This command requires a chat ID or username.\n<i>Example:</i> {}",
            code(&format!("{cmd} @channelname"))
        );
        reply(state, chat_id, &text).await;
        return;
    }

    let text = match state.ctx.control.remove_chat(user, role, arg).await {
        Ok(change) if change.changed => format!(
            "🧹 Removed '{}' from {}S.",
            escape_html(&change.entity.display_name()),
            role.label()
        ),
        Ok(change) => format!(
            "ℹ️ '{}' is not in your {}S.",
            escape_html(&change.entity.display_name()),
            role.label()
        ),
        Err(e) => format!(
            "❌ Could not find chat '{}'. Error: {}",
            escape_html(arg),
            escape_html(&e.to_string())
        ),
    };
    reply(state, chat_id, &text).await;
}

async fn list_chats(state: &AppState, chat_id: ChatId, user: UserId, role: ChatRole) {
    let listings = match state.ctx.control.list_chats(user, role).await {
        Ok(l) => l,
        Err(e) => {
            reply(state, chat_id, &error_reply(&e)).await;
            return;
        }
    };
    if listings.is_empty() {
        reply(state, chat_id, empty_list(role)).await;
        return;
    }

    reply(state, chat_id, plural_title(role)).await;
    for listing in listings {
        let keyboard = InlineKeyboard::single(InlineButton::new(
            remove_label(role),
            ChatButton::Remove(role, listing.id.0).encode(),
        ));
        let card = chat_card(listing.id, listing.entity.as_ref());
        if let Err(e) = state
            .messenger
            .send_inline_keyboard(chat_id, &card, keyboard)
            .await
        {
            tracing::warn!(chat = chat_id.0, error = %e, "chat listing failed");
        }
    }
}

async fn list_groups(state: &AppState, chat_id: ChatId, user: UserId) {
    if !require_connection(state, chat_id, user).await {
        return;
    }
    let status = match state
        .messenger
        .send_html(chat_id, "🔄 Fetching your group list, please wait...")
        .await
    {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(chat = chat_id.0, error = %e, "group list status failed");
            return;
        }
    };

    let groups = match state.ctx.control.list_groups(user).await {
        Ok(g) => g,
        Err(e) => {
            let text = format!(
                "❌ An error occurred while fetching your groups: {}",
                escape_html(&e.to_string())
            );
            let _ = state.messenger.edit_html(status, &text).await;
            return;
        }
    };
    if groups.is_empty() {
        let _ = state
            .messenger
            .edit_html(status, "ℹ️ No groups or channels found.")
            .await;
        return;
    }

    let _ = state
        .messenger
        .edit_html(
            status,
            "📚 <b>Your Joined Groups &amp; Channels:</b> (Click to add)",
        )
        .await;
    for group in &groups {
        let id = group.canonical_id.0;
        let keyboard = InlineKeyboard::row(vec![
            InlineButton::new("➕ Add Source", ChatButton::Add(ChatRole::Source, id).encode()),
            InlineButton::new("➕ Add Target", ChatButton::Add(ChatRole::Target, id).encode()),
        ]);
        let card = chat_card(group.canonical_id, Some(group));
        if let Err(e) = state
            .messenger
            .send_inline_keyboard(chat_id, &card, keyboard)
            .await
        {
            tracing::warn!(chat = chat_id.0, error = %e, "group listing failed");
        }
        tokio::time::sleep(GROUP_LIST_PAUSE).await;
    }
    reply(
        state,
        chat_id,
        "✅ <b>Finished listing all groups and channels.</b>",
    )
    .await;
}

async fn auto_message(state: &AppState, chat_id: ChatId, user: UserId, arg: &str) {
    if !require_connection(state, chat_id, user).await {
        return;
    }

    let arg = arg.to_lowercase();
    let minutes = if arg == "stop" {
        None
    } else if !arg.is_empty() && arg.chars().all(|c| c.is_ascii_digit()) {
        match arg.parse::<u64>() {
            Ok(0) => {
                reply(state, chat_id, "❌ The time in minutes must be greater than 0.").await;
                return;
            }
            Ok(m) => Some(m),
            Err(_) => {
                reply(state, chat_id, AUTO_MESSAGE_USAGE).await;
                return;
            }
        }
    } else {
        reply(state, chat_id, AUTO_MESSAGE_USAGE).await;
        return;
    };

    let text = match state.ctx.control.set_auto_forward(user, minutes).await {
        Ok(AutoForwardChange::Stopped) => "🛑 Auto-messaging has been <b>stopped</b>.".to_string(),
        Ok(AutoForwardChange::Started { minutes }) => format!(
            "✅ Auto-messaging started from the first source group every <b>{minutes}</b> minutes."
        ),
        Err(e) => error_reply(&e),
    };
    reply(state, chat_id, &text).await;
}

const AUTO_MESSAGE_USAGE: &str = "<b>Auto-Message Usage:</b>\n\
<code>/auto_message &lt;minutes&gt;</code> - Start auto-messaging\n\
<code>/auto_message stop</code> - Stop auto-messaging";

async fn delay_time(state: &AppState, chat_id: ChatId, user: UserId, arg: &str) {
    if !require_connection(state, chat_id, user).await {
        return;
    }

    let parts: Vec<&str> = arg.split_whitespace().collect();
    if parts.len() != 2 {
        let text = match state.ctx.control.delay(user).await {
            Ok((min, max)) => format!(
                "ℹ️ <b>Current Delay:</b> Your messages are forwarded with a random delay between <b>{min}</b> and <b>{max}</b> seconds.\n\n\
<b>To change this, use:</b>\n<code>/delaytime &lt;min_seconds&gt; &lt;max_seconds&gt;</code>\n\n\
<i>Example:</i> <code>/delaytime 10 30</code>"
            ),
            Err(e) => error_reply(&e),
        };
        reply(state, chat_id, &text).await;
        return;
    }

    let (Ok(min), Ok(max)) = (parts[0].parse::<i64>(), parts[1].parse::<i64>()) else {
        reply(
            state,
            chat_id,
            "❌ Invalid input. Please provide two numbers for the delay range (e.g., <code>/delaytime 5 20</code>).",
        )
        .await;
        return;
    };

    let text = match state.ctx.control.set_delay(user, min, max).await {
        Ok(()) => format!(
            "✅ Delay time has been set to a random interval between <b>{min}</b> and <b>{max}</b> seconds."
        ),
        Err(Error::InvalidArgument(m)) => format!("❌ {}", escape_html(&sentence(&m))),
        Err(e) => error_reply(&e),
    };
    reply(state, chat_id, &text).await;
}
