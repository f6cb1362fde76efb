use std::{collections::HashMap, sync::Arc};

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fwd_core::messaging::throttled::{ThrottleConfig, ThrottledMessenger};
use fwd_core::{
    config::Config,
    context::AppContext,
    domain::{AccountId, UserId},
    messaging::port::MessagingPort,
    protocol::ProtocolConnector,
};

use crate::handlers::{self, admin::AdminAction};
use crate::TelegramMessenger;

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<AppContext>,
    pub messenger: Arc<dyn MessagingPort>,
    pub conversations: Arc<Conversations>,
}

impl AppState {
    pub fn cfg(&self) -> &Config {
        &self.ctx.cfg
    }
}

/// Per-user conversation state that spans several updates.
#[derive(Default)]
pub struct Conversations {
    admin: Mutex<HashMap<UserId, AdminAction>>,
    uploads: Mutex<HashMap<UserId, AccountId>>,
}

impl Conversations {
    pub async fn await_admin_input(&self, user: UserId, action: AdminAction) {
        self.admin.lock().await.insert(user, action);
    }

    /// Consume the pending admin action; it applies to exactly one message.
    pub async fn take_admin_action(&self, user: UserId) -> Option<AdminAction> {
        self.admin.lock().await.remove(&user)
    }

    pub async fn cancel_admin_action(&self, user: UserId) -> bool {
        self.admin.lock().await.remove(&user).is_some()
    }

    pub async fn expect_session_upload(&self, user: UserId, account: AccountId) {
        self.uploads.lock().await.insert(user, account);
    }

    pub async fn session_upload_for(&self, user: UserId) -> Option<AccountId> {
        self.uploads.lock().await.get(&user).cloned()
    }

    pub async fn finish_session_upload(&self, user: UserId) -> Option<AccountId> {
        self.uploads.lock().await.remove(&user)
    }
}

pub async fn run_polling(
    cfg: Arc<Config>,
    connector: Arc<dyn ProtocolConnector>,
) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.telegram_bot_token.clone());

    match bot.get_me().await {
        Ok(me) => info!(bot = %me.username(), "controller bot started"),
        Err(e) => warn!(error = %e, "could not fetch bot profile"),
    }
    info!(
        data_file = %cfg.data_file.display(),
        sessions_dir = %cfg.sessions_dir.display(),
        admin = cfg.admin_id.0,
        "forwarder configuration"
    );

    // Keep bursts (group listings, broadcasts) under the Bot API flood limits.
    // 429 RetryAfter is still retried once in the Telegram adapter.
    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::default(),
    ));

    let ctx = Arc::new(AppContext::new(cfg.clone(), connector, messenger.clone()));

    let resumes = ctx.lifecycle.resume_all().await;
    info!(accounts = resumes.len(), "resuming stored sessions");

    let shutdown = CancellationToken::new();
    let heartbeat = ctx.spawn_heartbeat(shutdown.child_token());

    let state = Arc::new(AppState {
        ctx,
        messenger,
        conversations: Arc::new(Conversations::default()),
    });

    let handler = dptree::entry()
        .branch(Update::filter_callback_query().endpoint(handlers::handle_callback))
        .branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    shutdown.cancel();
    let _ = heartbeat.await;
    info!("controller bot stopped");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admin_action_is_consumed_once() {
        let conv = Conversations::default();
        conv.await_admin_input(UserId(1), AdminAction::Broadcast).await;

        assert_eq!(conv.take_admin_action(UserId(2)).await, None);
        assert_eq!(
            conv.take_admin_action(UserId(1)).await,
            Some(AdminAction::Broadcast)
        );
        assert_eq!(conv.take_admin_action(UserId(1)).await, None);
        assert!(!conv.cancel_admin_action(UserId(1)).await);
    }

    #[tokio::test]
    async fn session_upload_is_tracked_per_user() {
        let conv = Conversations::default();
        let account = AccountId::new("+100");
        conv.expect_session_upload(UserId(7), account.clone()).await;

        assert_eq!(conv.session_upload_for(UserId(7)).await, Some(account.clone()));
        assert_eq!(conv.session_upload_for(UserId(8)).await, None);
        assert_eq!(conv.finish_session_upload(UserId(7)).await, Some(account));
        assert_eq!(conv.session_upload_for(UserId(7)).await, None);
    }
}
