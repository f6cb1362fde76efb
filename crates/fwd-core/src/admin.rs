//! Cross-account operations for the bot administrator.

use std::{collections::BTreeSet, path::PathBuf, sync::Arc, time::Duration};

use tokio::time::sleep;
use tracing::{info, warn};

use crate::{
    domain::{AccountId, ChatId, ChatKind, ChatLookup, MessageRef, UserId},
    errors::Error,
    lifecycle::{LogoutResult, SessionLifecycleManager},
    messaging::port::MessagingPort,
    registry::ConnectionRegistry,
    store::ConfigStore,
    Result,
};

const BROADCAST_PAUSE: Duration = Duration::from_millis(500);
const JOIN_PAUSE: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserSummary {
    pub account: AccountId,
    pub owner: Option<UserId>,
    pub forwarding_enabled: bool,
    pub active: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
}

pub struct AdminOps {
    store: Arc<ConfigStore>,
    registry: Arc<ConnectionRegistry>,
    lifecycle: SessionLifecycleManager,
    messenger: Arc<dyn MessagingPort>,
}

impl AdminOps {
    pub fn new(
        store: Arc<ConfigStore>,
        registry: Arc<ConnectionRegistry>,
        lifecycle: SessionLifecycleManager,
        messenger: Arc<dyn MessagingPort>,
    ) -> Self {
        Self {
            store,
            registry,
            lifecycle,
            messenger,
        }
    }

    pub async fn list_users(&self) -> Vec<UserSummary> {
        let mut out = Vec::new();
        for (account, cfg) in self.store.snapshot().await {
            let active = self.registry.is_live(&account).await;
            out.push(UserSummary {
                account,
                owner: cfg.controller_id,
                forwarding_enabled: cfg.forwarding_enabled,
                active,
            });
        }
        out
    }

    /// Copy `message` to every distinct account owner.
    pub async fn broadcast(&self, message: MessageRef) -> BatchReport {
        let owners: BTreeSet<UserId> = self
            .store
            .snapshot()
            .await
            .into_iter()
            .filter_map(|(_, cfg)| cfg.controller_id)
            .collect();

        let mut report = BatchReport::default();
        for owner in owners {
            match self
                .messenger
                .copy_message(ChatId(owner.0), message)
                .await
            {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    warn!(owner = owner.0, error = %e, "broadcast delivery failed");
                    report.failed += 1;
                }
            }
            sleep(BROADCAST_PAUSE).await;
        }
        info!(sent = report.succeeded, failed = report.failed, "broadcast finished");
        report
    }

    /// Make every live account join a channel/megagroup or start a bot.
    ///
    /// Returns `None` when no account is live.
    pub async fn force_join(&self, target: &str) -> Result<Option<BatchReport>> {
        let lookup = ChatLookup::parse(target)
            .ok_or_else(|| Error::InvalidArgument("a username or chat id is required".to_string()))?;
        let live = self.registry.live().await;
        if live.is_empty() {
            return Ok(None);
        }

        let mut report = BatchReport::default();
        for conn in live {
            let client = conn.client();
            let joined = match client.get_entity(&lookup).await {
                Ok(entity) if matches!(entity.kind, ChatKind::Bot | ChatKind::Channel) => {
                    client.join(&entity).await
                }
                Ok(entity) => Err(Error::InvalidArgument(format!(
                    "{} is neither a channel nor a bot",
                    entity.display_name()
                ))),
                Err(e) => Err(e),
            };
            match joined {
                Ok(action) => {
                    report.succeeded += 1;
                    info!(account = %conn.account(), chat = target, ?action, "force join done");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(account = %conn.account(), chat = target, error = %e, "force join failed");
                }
            }
            sleep(JOIN_PAUSE).await;
        }
        Ok(Some(report))
    }

    /// Resolve `+<phone>` or a numeric owner id to a stored account.
    pub async fn find_account(&self, identifier: &str) -> Option<AccountId> {
        let identifier = identifier.trim();
        if let Some(digits) = identifier.strip_prefix('+') {
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let account = AccountId::new(identifier);
            return self.store.contains(&account).await.then_some(account);
        }
        let owner = identifier.parse::<i64>().ok().map(UserId)?;
        self.store.accounts_owned_by(owner).await.into_iter().next()
    }

    pub async fn delete_user(&self, identifier: &str) -> Result<(AccountId, LogoutResult)> {
        let account = self
            .find_account(identifier)
            .await
            .ok_or_else(|| Error::NotFound(format!("no user matches {identifier}")))?;
        let result = self.lifecycle.logout(&account).await?;
        Ok((account, result))
    }

    /// Path of the account's session file, if it still exists.
    pub async fn session_file(&self, identifier: &str) -> Result<(AccountId, PathBuf)> {
        let account = self
            .find_account(identifier)
            .await
            .ok_or_else(|| Error::NotFound(format!("no user matches {identifier}")))?;
        let creds = self.lifecycle.credentials();
        if !creds.exists(&account) {
            return Err(Error::NotFound(format!("no session file for {account}")));
        }
        let path = creds.path_for(&account);
        Ok((account, path))
    }
}
