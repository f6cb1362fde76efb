use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Local};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{domain::AccountId, errors::Error, protocol::ProtocolClient, Result};

/// Live, authenticated session of one account.
///
/// Cancelling the token tears down every task bound to the connection (event
/// pump, in-flight relays, auto-forward loop).
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    account: AccountId,
    client: Arc<dyn ProtocolClient>,
    cancel: CancellationToken,
    connected_at: DateTime<Local>,
}

impl ConnectionHandle {
    fn new(id: u64, account: AccountId, client: Arc<dyn ProtocolClient>) -> Self {
        Self {
            id,
            account,
            client,
            cancel: CancellationToken::new(),
            connected_at: Local::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn client(&self) -> Arc<dyn ProtocolClient> {
        self.client.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn connected_at(&self) -> DateTime<Local> {
        self.connected_at
    }

    pub fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && self.client.is_connected()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("account", &self.account)
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

struct ConnectionEntry {
    handle: ConnectionHandle,
    supervisor: Option<JoinHandle<()>>,
}

/// In-memory map of live connections, one per account.
#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<AccountId, ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an authenticated client in a handle with a fresh connection id.
    /// The handle is not registered yet.
    pub fn connection(&self, account: AccountId, client: Arc<dyn ProtocolClient>) -> ConnectionHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        ConnectionHandle::new(id, account, client)
    }

    /// Register a connection. A live entry for the same account is never
    /// superseded; a dead one is replaced.
    pub async fn register(&self, handle: ConnectionHandle) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(handle.account()) {
            if existing.handle.is_live() {
                return Err(Error::AlreadyConnected(handle.account().clone()));
            }
        }
        entries.insert(
            handle.account().clone(),
            ConnectionEntry {
                handle,
                supervisor: None,
            },
        );
        Ok(())
    }

    /// Store the supervising task of a registered connection.
    pub async fn attach_supervisor(&self, account: &AccountId, id: u64, task: JoinHandle<()>) {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(account) {
            Some(entry) if entry.handle.id() == id => entry.supervisor = Some(task),
            // The connection already went away; the task finishes on its own.
            _ => {}
        }
    }

    pub async fn get(&self, account: &AccountId) -> Option<ConnectionHandle> {
        self.entries
            .lock()
            .await
            .get(account)
            .map(|e| e.handle.clone())
    }

    pub async fn is_live(&self, account: &AccountId) -> bool {
        self.entries
            .lock()
            .await
            .get(account)
            .map(|e| e.handle.is_live())
            .unwrap_or(false)
    }

    /// Remove the account's entry. Idempotent.
    pub async fn remove(&self, account: &AccountId) -> Option<ConnectionHandle> {
        self.entries
            .lock()
            .await
            .remove(account)
            .map(|e| e.handle)
    }

    /// Remove the entry only if it still holds connection `id`.
    pub async fn remove_exact(&self, account: &AccountId, id: u64) -> bool {
        let mut entries = self.entries.lock().await;
        if entries.get(account).map(|e| e.handle.id()) == Some(id) {
            entries.remove(account);
            return true;
        }
        false
    }

    /// Every registered connection that is still live.
    pub async fn live(&self) -> Vec<ConnectionHandle> {
        let entries = self.entries.lock().await;
        let mut out: Vec<ConnectionHandle> = entries
            .values()
            .filter(|e| e.handle.is_live())
            .map(|e| e.handle.clone())
            .collect();
        out.sort_by(|a, b| a.account().cmp(b.account()));
        out
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeClient;

    fn handle(reg: &ConnectionRegistry, account: &str, client: &Arc<FakeClient>) -> ConnectionHandle {
        reg.connection(AccountId::new(account), client.clone())
    }

    #[tokio::test]
    async fn second_live_registration_is_rejected() {
        let reg = ConnectionRegistry::new();
        let client = Arc::new(FakeClient::default());

        reg.register(handle(&reg, "+1", &client)).await.unwrap();
        let err = reg.register(handle(&reg, "+1", &client)).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyConnected(_)));
        assert!(reg.is_live(&AccountId::new("+1")).await);
    }

    #[tokio::test]
    async fn dead_entries_are_replaced_and_reported_not_live() {
        let reg = ConnectionRegistry::new();
        let dead = Arc::new(FakeClient::default());
        reg.register(handle(&reg, "+1", &dead)).await.unwrap();
        dead.drop_connection();
        assert!(!reg.is_live(&AccountId::new("+1")).await);

        let fresh = Arc::new(FakeClient::default());
        reg.register(handle(&reg, "+1", &fresh)).await.unwrap();
        assert!(reg.is_live(&AccountId::new("+1")).await);
        assert_eq!(reg.live().await.len(), 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_exact_removal_checks_identity() {
        let reg = ConnectionRegistry::new();
        let client = Arc::new(FakeClient::default());
        let account = AccountId::new("+1");
        let first = handle(&reg, "+1", &client);
        let first_id = first.id();
        reg.register(first).await.unwrap();

        assert!(!reg.remove_exact(&account, first_id + 1000).await);
        assert!(reg.remove_exact(&account, first_id).await);
        assert!(reg.remove(&account).await.is_none());
        assert!(!reg.is_live(&account).await);
        assert!(reg.is_empty().await);
    }

    #[test]
    fn connection_ids_are_per_registry_and_increasing() {
        let client = Arc::new(FakeClient::default());
        let a = ConnectionRegistry::new();
        let b = ConnectionRegistry::new();

        let first = handle(&a, "+1", &client);
        let second = handle(&a, "+1", &client);
        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 2);
        assert_eq!(handle(&b, "+1", &client).id(), 1);
    }
}
