//! Login, session upload and logout commands.

use qrcode::{render::unicode, QrCode};
use tracing::{info, warn};

use fwd_core::{
    domain::{AccountId, ChatId, MessageRef, UserId},
    errors::Error,
    formatting::{code, escape_html},
    lifecycle::{LoginStage, LoginStep, LogoutResult},
    registry::ConnectionHandle,
};

use crate::router::AppState;

use super::{error_reply, reply};

const PASSWORD_PROMPT: &str =
    "🔑 Your account has 2FA enabled. Please reply with <code>/password &lt;your_password&gt;</code>";

/// A single phone-number argument.
fn parse_phone(arg: &str) -> Option<AccountId> {
    let mut parts = arg.split_whitespace();
    let phone = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some(AccountId::new(phone))
}

/// `<phone> <session string>`.
fn parse_session_string(arg: &str) -> Option<(AccountId, &str)> {
    let mut parts = arg.split_whitespace();
    let phone = parts.next()?;
    let encoded = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some((AccountId::new(phone), encoded))
}

/// Text QR code for a login URL, ready to go inside `<pre>`.
fn render_qr(url: &str) -> Result<String, qrcode::types::QrError> {
    let qr = QrCode::new(url.as_bytes())?;
    Ok(qr
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build())
}

fn login_failure(err: &Error) -> String {
    if err.is_rejection() {
        return error_reply(err);
    }
    format!("❌ Login error: {}", escape_html(&err.to_string()))
}

pub(crate) fn logout_text(account: &AccountId, result: LogoutResult) -> String {
    match result {
        LogoutResult::Removed => format!(
            "✅ <b>Logout Complete.</b>\nAll data and sessions for {} have been successfully removed.",
            code(account.as_str())
        ),
        LogoutResult::NothingExisted => format!(
            "ℹ️ No data or active session found for {}.",
            code(account.as_str())
        ),
    }
}

async fn first_name(conn: &ConnectionHandle) -> String {
    match conn.client().get_me().await {
        Ok(me) => me.first_name,
        Err(e) => {
            warn!(account = %conn.account(), error = %e, "could not fetch profile");
            conn.account().to_string()
        }
    }
}

async fn announce_login(state: &AppState, chat_id: ChatId, conn: &ConnectionHandle) {
    let name = first_name(conn).await;
    info!(account = %conn.account(), "login completed");
    let text = format!(
        "✅ Logged in as {} ({}). Session saved.",
        escape_html(&name),
        code(conn.account().as_str())
    );
    reply(state, chat_id, &text).await;
}

async fn report_step(state: &AppState, chat_id: ChatId, step: Result<LoginStep, Error>) {
    match step {
        Ok(LoginStep::Connected(conn)) => announce_login(state, chat_id, &conn).await,
        Ok(LoginStep::PasswordRequired) => reply(state, chat_id, PASSWORD_PROMPT).await,
        Err(e) => reply(state, chat_id, &login_failure(&e)).await,
    }
}

pub(crate) async fn qr_login(state: &AppState, chat_id: ChatId, user: UserId, arg: &str) {
    let Some(account) = parse_phone(arg) else {
        reply(state, chat_id, "Usage: <code>/login &lt;phone_number&gt;</code>").await;
        return;
    };

    let challenge = match state.ctx.lifecycle.begin_qr_login(user, &account).await {
        Ok(c) => c,
        Err(e) => {
            reply(state, chat_id, &login_failure(&e)).await;
            return;
        }
    };

    let qr = match render_qr(&challenge.url) {
        Ok(qr) => qr,
        Err(e) => {
            state.ctx.lifecycle.cancel_login(user).await;
            let text = format!("❌ Login error: could not render QR code ({e})");
            reply(state, chat_id, &escape_html(&text)).await;
            return;
        }
    };
    let text = format!(
        "<pre>{}</pre>\nScan this QR code with your Telegram app:",
        escape_html(&qr)
    );
    reply(state, chat_id, &text).await;

    // Waiting may take minutes; keep the dispatcher free for this chat.
    let state = state.clone();
    tokio::spawn(async move {
        let step = state.ctx.lifecycle.await_qr_login(user).await;
        report_step(&state, chat_id, step).await;
    });
}

pub(crate) async fn code_login(state: &AppState, chat_id: ChatId, user: UserId, arg: &str) {
    let Some(account) = parse_phone(arg) else {
        reply(state, chat_id, "Usage: <code>/loginotp &lt;phone_number&gt;</code>").await;
        return;
    };

    let text = match state.ctx.lifecycle.begin_code_login(user, &account).await {
        Ok(()) => "✅ A login code has been sent to your Telegram app. Please reply with <code>/otp &lt;code&gt;</code>".to_string(),
        Err(e) => login_failure(&e),
    };
    reply(state, chat_id, &text).await;
}

pub(crate) async fn submit_code(state: &AppState, chat_id: ChatId, user: UserId, arg: &str) {
    let mut parts = arg.split_whitespace();
    let (Some(login_code), None) = (parts.next(), parts.next()) else {
        reply(state, chat_id, "Usage: <code>/otp &lt;code&gt;</code>").await;
        return;
    };
    if state.ctx.lifecycle.pending_stage(user).await != Some(LoginStage::Code) {
        reply(
            state,
            chat_id,
            "❌ No pending login. Please start with <code>/loginotp &lt;phone_number&gt;</code>",
        )
        .await;
        return;
    }

    let step = state.ctx.lifecycle.submit_code(user, login_code).await;
    report_step(state, chat_id, step).await;
}

pub(crate) async fn submit_password(state: &AppState, chat_id: ChatId, user: UserId, arg: &str) {
    if arg.is_empty() {
        reply(state, chat_id, "Usage: <code>/password &lt;your_password&gt;</code>").await;
        return;
    }
    if state.ctx.lifecycle.pending_stage(user).await != Some(LoginStage::Password) {
        reply(
            state,
            chat_id,
            "❌ No pending 2FA login. Please start with a login command first.",
        )
        .await;
        return;
    }

    let step = state
        .ctx
        .lifecycle
        .submit_password(user, arg)
        .await
        .map(LoginStep::Connected);
    report_step(state, chat_id, step).await;
}

pub(crate) async fn cancel(state: &AppState, chat_id: ChatId, user: UserId) {
    let text = if state.ctx.lifecycle.cancel_login(user).await {
        "🛑 Pending login cancelled."
    } else {
        "ℹ️ No pending login."
    };
    reply(state, chat_id, text).await;
}

pub(crate) async fn start_session_upload(
    state: &AppState,
    chat_id: ChatId,
    user: UserId,
    arg: &str,
) {
    let Some(account) = parse_phone(arg) else {
        reply(
            state,
            chat_id,
            "Usage: <code>/session &lt;phone_number&gt;</code>\n\n<i>Example:</i> <code>/session +1234567890</code>",
        )
        .await;
        return;
    };
    if state.ctx.registry.is_live(&account).await {
        reply(state, chat_id, &error_reply(&Error::AlreadyConnected(account))).await;
        return;
    }

    let text = format!(
        "✅ Ready to receive session file for {}.\n\nPlease upload the {} file now.",
        code(account.as_str()),
        code(&fwd_core::credentials::CredentialStore::file_name(&account)),
    );
    state
        .conversations
        .expect_session_upload(user, account)
        .await;
    reply(state, chat_id, &text).await;
}

/// `/session_string <phone> <string>`: log in from an exported session string.
pub(crate) async fn import_session_string(
    state: &AppState,
    chat_id: ChatId,
    user: UserId,
    arg: &str,
    command: MessageRef,
) {
    let Some((account, encoded)) = parse_session_string(arg) else {
        reply(
            state,
            chat_id,
            "Usage: <code>/session_string &lt;phone&gt; &lt;session_string&gt;</code>",
        )
        .await;
        return;
    };
    // The string is a live credential.
    if let Err(e) = state.messenger.delete_message(command).await {
        warn!(account = %account, error = %e, "could not delete session string message");
    }

    let text = match state.ctx.lifecycle.import_session(user, &account, encoded).await {
        Ok(conn) => {
            let name = first_name(&conn).await;
            format!(
                "✅ <b>Session Validated!</b>\nSuccessfully logged in as <b>{}</b> ({}). The client is now running.",
                escape_html(&name),
                code(account.as_str())
            )
        }
        Err(e) if e.is_rejection() => error_reply(&e),
        Err(e) => {
            warn!(account = %account, error = %e, "session string rejected");
            format!(
                "❌ <b>Login Failed!</b>\nCould not start the client for {}.\n\n<b>Reason:</b> {}",
                code(account.as_str()),
                escape_html(&e.to_string())
            )
        }
    };
    reply(state, chat_id, &text).await;
}

/// Resume an account from a freshly uploaded session file and tell the
/// uploader how it went.
pub(crate) async fn validate_uploaded_session(
    state: &AppState,
    chat_id: ChatId,
    user: UserId,
    account: AccountId,
) {
    let text = match state.ctx.lifecycle.resume(&account, Some(user)).await {
        Ok(conn) => {
            let name = first_name(&conn).await;
            format!(
                "✅ <b>Session Validated!</b>\nSuccessfully logged in as <b>{}</b> ({}). The client is now running.",
                escape_html(&name),
                code(account.as_str())
            )
        }
        Err(e) => {
            warn!(account = %account, error = %e, "uploaded session rejected");
            format!(
                "❌ <b>Login Failed!</b>\nCould not start the client for {}.\n\n<b>Reason:</b> {}",
                code(account.as_str()),
                escape_html(&e.to_string())
            )
        }
    };
    reply(state, chat_id, &text).await;
}

pub(crate) async fn logout(state: &AppState, chat_id: ChatId, user: UserId, arg: &str) {
    let Some(account) = parse_phone(arg) else {
        reply(state, chat_id, "Usage: <code>/logout &lt;phone&gt;</code>").await;
        return;
    };

    let text = match state.ctx.control.logout_owned(user, &account).await {
        Ok(result) => logout_text(&account, result),
        Err(e @ Error::NotOwner(_)) => error_reply(&e),
        Err(e) => format!(
            "❌ An error occurred during the logout process: {}",
            escape_html(&e.to_string())
        ),
    };
    reply(state, chat_id, &text).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_argument_must_be_a_single_token() {
        assert_eq!(parse_phone(" +15550 "), Some(AccountId::new("+15550")));
        assert_eq!(parse_phone(""), None);
        assert_eq!(parse_phone("+1 +2"), None);
    }

    #[test]
    fn session_string_takes_phone_then_string() {
        assert_eq!(
            parse_session_string("+1 1AbC_-"),
            Some((AccountId::new("+1"), "1AbC_-"))
        );
        assert_eq!(parse_session_string("+1"), None);
        assert_eq!(parse_session_string("+1 1AbC extra"), None);
    }

    #[test]
    fn qr_renders_as_text_blocks() {
        let qr = render_qr("tg://login?token=abc").unwrap();
        assert!(qr.lines().count() > 10);
        assert!(qr.chars().any(|c| c == '█' || c == '▀' || c == '▄'));
    }

    #[test]
    fn logout_text_reflects_outcome() {
        let account = AccountId::new("+1");
        assert!(logout_text(&account, LogoutResult::Removed).contains("Logout Complete"));
        assert!(logout_text(&account, LogoutResult::NothingExisted).contains("No data"));
    }

    #[test]
    fn rejections_keep_their_own_wording() {
        let busy = Error::LoginAlreadyInProgress(AccountId::new("+1"));
        assert!(login_failure(&busy).starts_with("A login for this number"));
        assert!(login_failure(&Error::Auth("bad code".to_string())).starts_with("❌ Login error"));
    }
}
