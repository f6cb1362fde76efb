//! Command surface used by the controller bot.
//!
//! Every operation acts on the caller's account: the first account whose
//! configuration records the caller as owner. Commands require that account's
//! connection to be live.

use std::sync::Arc;

use tracing::info;

use crate::{
    autoforward::AutoForwardScheduler,
    delay::DelayPolicy,
    domain::{canonical_chat_id, AccountId, ChatEntity, ChatId, ChatKind, ChatLookup, UserId},
    errors::Error,
    lifecycle::{LogoutResult, SessionLifecycleManager},
    registry::{ConnectionHandle, ConnectionRegistry},
    store::{ChatRole, ConfigStore},
    Result,
};

/// One stored chat, resolved for display when the provider still knows it.
#[derive(Clone, Debug)]
pub struct ChatListing {
    pub id: ChatId,
    pub entity: Option<ChatEntity>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatChange {
    pub entity: ChatEntity,
    /// `false` when the list already had (add) or lacked (remove) the chat.
    pub changed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AutoForwardChange {
    Started { minutes: u64 },
    Stopped,
}

pub struct ControlService {
    store: Arc<ConfigStore>,
    registry: Arc<ConnectionRegistry>,
    scheduler: AutoForwardScheduler,
    delay: Arc<DelayPolicy>,
    lifecycle: SessionLifecycleManager,
}

impl ControlService {
    pub fn new(
        store: Arc<ConfigStore>,
        registry: Arc<ConnectionRegistry>,
        scheduler: AutoForwardScheduler,
        delay: Arc<DelayPolicy>,
        lifecycle: SessionLifecycleManager,
    ) -> Self {
        Self {
            store,
            registry,
            scheduler,
            delay,
            lifecycle,
        }
    }

    /// Accounts owned by `user`, in store order.
    pub async fn owned_accounts(&self, user: UserId) -> Vec<AccountId> {
        self.store.accounts_owned_by(user).await
    }

    /// The caller's account, whether or not it is connected.
    pub async fn account_of(&self, user: UserId) -> Result<AccountId> {
        self.owned_accounts(user)
            .await
            .into_iter()
            .next()
            .ok_or(Error::NoAccount)
    }

    /// The caller's live connection.
    pub async fn resolve(&self, user: UserId) -> Result<ConnectionHandle> {
        let account = self.account_of(user).await?;
        match self.registry.get(&account).await {
            Some(handle) if handle.is_live() => Ok(handle),
            _ => Err(Error::NotConnected(account)),
        }
    }

    pub async fn add_chat(&self, user: UserId, role: ChatRole, input: &str) -> Result<ChatChange> {
        let conn = self.resolve(user).await?;
        let lookup = parse_lookup(input)?;
        let entity = conn.client().get_entity(&lookup).await?;
        self.store_chat(&conn, role, entity).await
    }

    /// Add a chat picked from the group list by its raw id.
    pub async fn add_chat_by_id(&self, user: UserId, role: ChatRole, raw_id: i64) -> Result<ChatChange> {
        let conn = self.resolve(user).await?;
        let entity = conn.client().get_entity(&ChatLookup::Id(raw_id)).await?;
        self.store_chat(&conn, role, entity).await
    }

    async fn store_chat(
        &self,
        conn: &ConnectionHandle,
        role: ChatRole,
        entity: ChatEntity,
    ) -> Result<ChatChange> {
        let id = entity.canonical_id;
        let changed = self
            .store
            .update(conn.account(), |cfg| cfg.add_chat(role, id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("no configuration for {}", conn.account())))?;
        info!(account = %conn.account(), chat = %id, role = role.label(), changed, "chat added");
        Ok(ChatChange { entity, changed })
    }

    /// Remove a chat, accepting both its raw and canonical id.
    pub async fn remove_chat(&self, user: UserId, role: ChatRole, input: &str) -> Result<ChatChange> {
        let conn = self.resolve(user).await?;
        let lookup = parse_lookup(input)?;
        let entity = match conn.client().get_entity(&lookup).await {
            Ok(entity) => entity,
            // Chats the account has left can still be removed by id.
            Err(e) => match lookup {
                ChatLookup::Id(id) => ChatEntity::new(kind_from_marked_id(id), id),
                ChatLookup::Username(_) => return Err(e),
            },
        };

        let mut forms = entity.id_forms().to_vec();
        if let ChatLookup::Id(id) = lookup {
            forms.extend(id_variants(id));
        }
        let changed = self
            .store
            .update(conn.account(), |cfg| cfg.remove_chat(role, &forms))
            .await?
            .unwrap_or(false);
        info!(account = %conn.account(), chat = %entity.canonical_id, role = role.label(), changed, "chat removed");
        Ok(ChatChange { entity, changed })
    }

    /// Remove a stored id exactly as listed (inline "Remove" buttons).
    pub async fn remove_chat_by_id(&self, user: UserId, role: ChatRole, id: i64) -> Result<bool> {
        let conn = self.resolve(user).await?;
        let forms = id_variants(id);
        let changed = self
            .store
            .update(conn.account(), |cfg| cfg.remove_chat(role, &forms))
            .await?
            .unwrap_or(false);
        Ok(changed)
    }

    pub async fn list_chats(&self, user: UserId, role: ChatRole) -> Result<Vec<ChatListing>> {
        let conn = self.resolve(user).await?;
        let ids = self
            .store
            .get(conn.account())
            .await
            .map(|cfg| cfg.chats(role).to_vec())
            .unwrap_or_default();

        let client = conn.client();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let entity = client.get_entity(&ChatLookup::Id(id.0)).await.ok();
            out.push(ChatListing { id, entity });
        }
        Ok(out)
    }

    /// Every group or channel the caller's account has joined.
    pub async fn list_groups(&self, user: UserId) -> Result<Vec<ChatEntity>> {
        let conn = self.resolve(user).await?;
        let dialogs = conn.client().list_dialogs().await?;
        Ok(dialogs.into_iter().filter(|d| d.is_group_like()).collect())
    }

    pub async fn set_forwarding_enabled(&self, user: UserId, enabled: bool) -> Result<()> {
        let conn = self.resolve(user).await?;
        self.store
            .update(conn.account(), |cfg| cfg.forwarding_enabled = enabled)
            .await?;
        info!(account = %conn.account(), enabled, "forwarding toggled");
        Ok(())
    }

    /// `Some(minutes)` starts (or restarts) auto-forward, `None` stops it.
    pub async fn set_auto_forward(&self, user: UserId, minutes: Option<u64>) -> Result<AutoForwardChange> {
        let conn = self.resolve(user).await?;
        match minutes {
            Some(minutes) => {
                self.scheduler.start(&conn, minutes).await?;
                Ok(AutoForwardChange::Started { minutes })
            }
            None => {
                self.scheduler.stop(conn.account()).await?;
                Ok(AutoForwardChange::Stopped)
            }
        }
    }

    /// Current `(min, max)` relay delay of the caller's account.
    pub async fn delay(&self, user: UserId) -> Result<(u64, u64)> {
        let conn = self.resolve(user).await?;
        Ok(self.delay.range(conn.account()).await)
    }

    pub async fn set_delay(&self, user: UserId, min: i64, max: i64) -> Result<()> {
        let conn = self.resolve(user).await?;
        if min < 0 || max < 0 {
            return Err(Error::InvalidArgument(
                "delay values cannot be negative".to_string(),
            ));
        }
        if min > max {
            return Err(Error::InvalidArgument(
                "minimum delay cannot be greater than maximum delay".to_string(),
            ));
        }
        let (min, max) = (min as u64, max as u64);
        self.store
            .update(conn.account(), |cfg| {
                cfg.min_delay = Some(min);
                cfg.max_delay = Some(max);
            })
            .await?;
        info!(account = %conn.account(), min, max, "delay updated");
        Ok(())
    }

    /// Log out an account the caller owns.
    pub async fn logout_owned(&self, user: UserId, account: &AccountId) -> Result<LogoutResult> {
        let owner = self.store.get(account).await.and_then(|cfg| cfg.controller_id);
        if owner != Some(user) {
            return Err(Error::NotOwner(account.clone()));
        }
        self.lifecycle.logout(account).await
    }
}

fn parse_lookup(input: &str) -> Result<ChatLookup> {
    ChatLookup::parse(input)
        .ok_or_else(|| Error::InvalidArgument("a chat id or username is required".to_string()))
}

fn kind_from_marked_id(id: i64) -> ChatKind {
    if id.to_string().starts_with("-100") {
        ChatKind::Channel
    } else if id < 0 {
        ChatKind::Group
    } else {
        ChatKind::User
    }
}

/// Every form a numeric id may have been stored under.
fn id_variants(id: i64) -> Vec<ChatId> {
    let mut out = vec![ChatId(id)];
    let text = id.to_string();
    if let Some(raw) = text.strip_prefix("-100").and_then(|r| r.parse::<i64>().ok()) {
        out.push(ChatId(raw));
    } else if id > 0 {
        out.push(canonical_chat_id(ChatKind::Channel, id));
    }
    out
}
