//! Session file uploads (`/session <phone>` followed by a document).

use std::{path::Path, sync::Arc};

use teloxide::{net::Download, prelude::*};
use tokio::io::AsyncWriteExt;

use fwd_core::{
    credentials::CredentialStore,
    domain::{AccountId, ChatId, UserId},
    formatting::{code, escape_html},
};

use crate::router::AppState;

use super::{login, reply};

const MAX_SESSION_FILE: u64 = 10 * 1024 * 1024; // 10MB

/// Why an uploaded document cannot be the expected session file.
fn upload_problem(account: &AccountId, file_name: &str, size: u64) -> Option<String> {
    let expected = CredentialStore::file_name(account);
    if file_name != expected {
        return Some(format!(
            "❌ <b>Invalid Filename.</b>\nExpected {} but received {}.",
            code(&expected),
            code(file_name)
        ));
    }
    if size > MAX_SESSION_FILE {
        return Some("❌ File too large. Maximum size is 10MB.".to_string());
    }
    None
}

async fn download_session_file(
    bot: &Bot,
    doc: &teloxide::types::Document,
    dest: &Path,
) -> anyhow::Result<()> {
    let file = bot.get_file(doc.file.id.clone()).await?;

    // Never leave a half-written artifact where the connector would read it.
    let partial = dest.with_extension("session.part");
    let mut dst = tokio::fs::File::create(&partial).await?;
    bot.download_file(&file.path, &mut dst).await?;
    dst.flush().await?;
    drop(dst);
    tokio::fs::rename(&partial, dest).await?;
    Ok(())
}

pub async fn handle_document(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(doc) = msg.document() else {
        return Ok(());
    };

    let user_id = UserId(user.id.0 as i64);
    let chat_id = ChatId(msg.chat.id.0);

    let Some(account) = state.conversations.session_upload_for(user_id).await else {
        return Ok(());
    };

    let file_name = doc
        .file_name
        .clone()
        .unwrap_or_else(|| "unknown_file".to_string());
    if let Some(problem) = upload_problem(&account, &file_name, doc.file.size as u64) {
        reply(&state, chat_id, &problem).await;
        return Ok(());
    }
    state.conversations.finish_session_upload(user_id).await;

    let dest = state.ctx.lifecycle.credentials().path_for(&account);
    if let Err(e) = download_session_file(&bot, doc, &dest).await {
        tracing::error!(account = %account, error = %e, "session upload failed");
        let text = format!(
            "❌ An error occurred while processing the session file: {}",
            escape_html(&e.to_string())
        );
        reply(&state, chat_id, &text).await;
        return Ok(());
    }
    tracing::info!(account = %account, user = user_id.0, "session file uploaded");

    reply(&state, chat_id, "✅ Session file received. Trying to log in...").await;
    let state = state.clone();
    tokio::spawn(async move {
        login::validate_uploaded_session(&state, chat_id, user_id, account).await;
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_must_match_the_requested_account() {
        let account = AccountId::new("+15550");
        assert_eq!(upload_problem(&account, "+15550.session", 1024), None);

        let wrong = upload_problem(&account, "other.session", 1024).unwrap();
        assert!(wrong.contains("<code>+15550.session</code>"));
        assert!(wrong.contains("<code>other.session</code>"));

        assert!(upload_problem(&account, "+15550.session", MAX_SESSION_FILE + 1)
            .unwrap()
            .contains("too large"));
    }
}
