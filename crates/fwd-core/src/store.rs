//! Durable per-account forwarding configuration (`users.json`).
//!
//! The whole document is rewritten on every mutation; an unreadable document
//! at startup is treated as an empty store.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    domain::{AccountId, ChatId, UserId},
    Result,
};

/// Longest accepted auto-forward interval (one week).
pub const MAX_INTERVAL_MINUTES: u64 = 7 * 24 * 60;

fn default_true() -> bool {
    true
}

/// Which of the two chat lists a command operates on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatRole {
    Source,
    Target,
}

impl ChatRole {
    pub fn label(self) -> &'static str {
        match self {
            ChatRole::Source => "SOURCE",
            ChatRole::Target => "TARGET",
        }
    }
}

/// Forwarding configuration of one account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfig {
    #[serde(default)]
    pub sources: Vec<ChatId>,
    #[serde(default)]
    pub targets: Vec<ChatId>,
    #[serde(default = "default_true")]
    pub forwarding_enabled: bool,
    #[serde(default)]
    pub auto_forward_enabled: bool,
    /// Minutes between auto-forward rounds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_forward_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_id: Option<UserId>,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            targets: Vec::new(),
            forwarding_enabled: true,
            auto_forward_enabled: false,
            auto_forward_interval: None,
            min_delay: None,
            max_delay: None,
            controller_id: None,
        }
    }
}

impl AccountConfig {
    pub fn chats(&self, role: ChatRole) -> &[ChatId] {
        match role {
            ChatRole::Source => &self.sources,
            ChatRole::Target => &self.targets,
        }
    }

    fn chats_mut(&mut self, role: ChatRole) -> &mut Vec<ChatId> {
        match role {
            ChatRole::Source => &mut self.sources,
            ChatRole::Target => &mut self.targets,
        }
    }

    /// Append `id` unless already present. Returns whether it was added.
    pub fn add_chat(&mut self, role: ChatRole, id: ChatId) -> bool {
        let list = self.chats_mut(role);
        if list.contains(&id) {
            return false;
        }
        list.push(id);
        true
    }

    /// Remove every stored entry matching any of `forms`.
    pub fn remove_chat(&mut self, role: ChatRole, forms: &[ChatId]) -> bool {
        let list = self.chats_mut(role);
        let before = list.len();
        list.retain(|id| !forms.contains(id));
        list.len() != before
    }

    /// Auto-forward interval, treating zero and out-of-range values as unset.
    pub fn interval_minutes(&self) -> Option<u64> {
        self.auto_forward_interval
            .filter(|m| (1..=MAX_INTERVAL_MINUTES).contains(m))
    }

    /// Effective delay range, falling back to the process defaults.
    pub fn delay_range(&self, default_min: u64, default_max: u64) -> (u64, u64) {
        let min = self.min_delay.unwrap_or(default_min);
        let max = self.max_delay.unwrap_or(default_max);
        if min > max {
            (max, min)
        } else {
            (min, max)
        }
    }
}

type AccountMap = BTreeMap<AccountId, AccountConfig>;

pub struct ConfigStore {
    path: PathBuf,
    accounts: Mutex<AccountMap>,
}

impl ConfigStore {
    /// Load the store from `path`. Missing or malformed files yield an empty
    /// store.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let accounts = read_accounts(&path);
        info!(path = %path.display(), accounts = accounts.len(), "config store loaded");
        Self {
            path,
            accounts: Mutex::new(accounts),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, account: &AccountId) -> Option<AccountConfig> {
        self.accounts.lock().await.get(account).cloned()
    }

    pub async fn contains(&self, account: &AccountId) -> bool {
        self.accounts.lock().await.contains_key(account)
    }

    /// Snapshot of every stored account, ordered by account id.
    pub async fn snapshot(&self) -> Vec<(AccountId, AccountConfig)> {
        self.accounts
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Accounts whose configuration is owned by `owner`.
    pub async fn accounts_owned_by(&self, owner: UserId) -> Vec<AccountId> {
        self.accounts
            .lock()
            .await
            .iter()
            .filter(|(_, cfg)| cfg.controller_id == Some(owner))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Create the account's configuration if missing and record its owner.
    pub async fn ensure(&self, account: &AccountId, owner: Option<UserId>) -> Result<AccountConfig> {
        let mut accounts = self.accounts.lock().await;
        let mut cfg = accounts.get(account).cloned().unwrap_or_default();
        if let Some(owner) = owner {
            cfg.controller_id = Some(owner);
        }
        let mut next = accounts.clone();
        next.insert(account.clone(), cfg.clone());
        self.persist(&next)?;
        *accounts = next;
        Ok(cfg)
    }

    /// Mutate an existing account configuration and rewrite the file.
    ///
    /// Returns `None` without writing if the account has no configuration.
    /// The in-memory state only changes once the file was written.
    pub async fn update<T>(
        &self,
        account: &AccountId,
        f: impl FnOnce(&mut AccountConfig) -> T,
    ) -> Result<Option<T>> {
        let mut accounts = self.accounts.lock().await;
        let Some(mut cfg) = accounts.get(account).cloned() else {
            return Ok(None);
        };
        let out = f(&mut cfg);
        let mut next = accounts.clone();
        next.insert(account.clone(), cfg);
        self.persist(&next)?;
        *accounts = next;
        Ok(Some(out))
    }

    /// Delete the account's configuration. Returns whether it existed.
    pub async fn remove(&self, account: &AccountId) -> Result<bool> {
        let mut accounts = self.accounts.lock().await;
        if !accounts.contains_key(account) {
            return Ok(false);
        }
        let mut next = accounts.clone();
        next.remove(account);
        self.persist(&next)?;
        *accounts = next;
        Ok(true)
    }

    fn persist(&self, accounts: &AccountMap) -> Result<()> {
        let json = serde_json::to_string_pretty(accounts)?;
        let tmp = self.path.with_extension("json.tmp");
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn read_accounts(path: &Path) -> AccountMap {
    let txt = match fs::read_to_string(path) {
        Ok(txt) => txt,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return AccountMap::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "config store unreadable, starting empty");
            return AccountMap::new();
        }
    };
    match serde_json::from_str::<AccountMap>(&txt) {
        Ok(map) => map,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "config store corrupt, starting empty");
            AccountMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acct(s: &str) -> AccountId {
        AccountId::new(s)
    }

    #[tokio::test]
    async fn persist_then_reload_preserves_order_and_scalars() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");

        let store = ConfigStore::load(&path);
        store.ensure(&acct("+1"), Some(UserId(9))).await.unwrap();
        store
            .update(&acct("+1"), |cfg| {
                for id in [300, 100, 200] {
                    cfg.add_chat(ChatRole::Source, ChatId(id));
                }
                for id in [-1002, -1001] {
                    cfg.add_chat(ChatRole::Target, ChatId(id));
                }
                cfg.forwarding_enabled = false;
                cfg.auto_forward_enabled = true;
                cfg.auto_forward_interval = Some(7);
                cfg.min_delay = Some(2);
                cfg.max_delay = Some(4);
            })
            .await
            .unwrap();
        let before = store.get(&acct("+1")).await.unwrap();

        let reloaded = ConfigStore::load(&path);
        let after = reloaded.get(&acct("+1")).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(after.sources, vec![ChatId(300), ChatId(100), ChatId(200)]);
        assert_eq!(after.targets, vec![ChatId(-1002), ChatId(-1001)]);
        assert_eq!(after.controller_id, Some(UserId(9)));
    }

    #[tokio::test]
    async fn corrupt_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        fs::write(&path, "{not json").unwrap();

        let store = ConfigStore::load(&path);
        assert!(store.snapshot().await.is_empty());

        // The next mutation rewrites the whole document.
        store.ensure(&acct("+2"), None).await.unwrap();
        let txt = fs::read_to_string(&path).unwrap();
        assert!(txt.contains("+2"));
    }

    #[tokio::test]
    async fn legacy_documents_get_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        fs::write(
            &path,
            r#"{"+3": {"sources": [1], "targets": [2], "controller_id": 5}}"#,
        )
        .unwrap();

        let store = ConfigStore::load(&path);
        let cfg = store.get(&acct("+3")).await.unwrap();
        assert!(cfg.forwarding_enabled);
        assert!(!cfg.auto_forward_enabled);
        assert_eq!(cfg.delay_range(5, 15), (5, 15));
        assert_eq!(store.accounts_owned_by(UserId(5)).await, vec![acct("+3")]);
    }

    #[tokio::test]
    async fn update_of_missing_account_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        let store = ConfigStore::load(&path);

        let out = store
            .update(&acct("+4"), |cfg| cfg.forwarding_enabled = false)
            .await
            .unwrap();
        assert!(out.is_none());
        assert!(!path.exists());
        assert!(!store.remove(&acct("+4")).await.unwrap());
    }

    #[test]
    fn chat_lists_dedupe_and_remove_any_form() {
        let mut cfg = AccountConfig::default();
        assert!(cfg.add_chat(ChatRole::Source, ChatId(5)));
        assert!(!cfg.add_chat(ChatRole::Source, ChatId(5)));
        assert!(cfg.add_chat(ChatRole::Source, ChatId(-1005)));
        assert!(cfg.remove_chat(ChatRole::Source, &[ChatId(5), ChatId(-1005)]));
        assert!(cfg.sources.is_empty());
        assert!(!cfg.remove_chat(ChatRole::Target, &[ChatId(5)]));
    }

    #[test]
    fn zero_and_oversized_intervals_count_as_unset() {
        let with = |minutes| AccountConfig {
            auto_forward_interval: Some(minutes),
            ..AccountConfig::default()
        };
        assert_eq!(with(0).interval_minutes(), None);
        assert_eq!(with(MAX_INTERVAL_MINUTES + 1).interval_minutes(), None);
        assert_eq!(with(u64::MAX).interval_minutes(), None);
        assert_eq!(
            with(MAX_INTERVAL_MINUTES).interval_minutes(),
            Some(MAX_INTERVAL_MINUTES)
        );
    }

    #[tokio::test]
    async fn failed_write_leaves_memory_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("data");
        let store = ConfigStore::load(sub.join("users.json"));
        store.ensure(&acct("+1"), Some(UserId(7))).await.unwrap();

        // Make the parent directory unusable so the next write fails.
        fs::remove_dir_all(&sub).unwrap();
        fs::write(&sub, b"not a directory").unwrap();

        let res = store
            .update(&acct("+1"), |cfg| cfg.forwarding_enabled = false)
            .await;
        assert!(res.is_err());
        assert!(store.get(&acct("+1")).await.unwrap().forwarding_enabled);

        assert!(store.ensure(&acct("+2"), None).await.is_err());
        assert!(!store.contains(&acct("+2")).await);

        assert!(store.remove(&acct("+1")).await.is_err());
        assert!(store.contains(&acct("+1")).await);
    }
}
