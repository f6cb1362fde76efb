//! Account connection lifecycle: login, resume, activation and teardown.
//!
//! Every successful authentication runs the same activation sequence and
//! every connection is torn down through the same path, so the registry, the
//! relay hook and the auto-forward task always come and go together.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{
    autoforward::AutoForwardScheduler,
    credentials::CredentialStore,
    domain::{AccountId, UserId},
    errors::Error,
    forwarder::ForwardRouter,
    protocol::{ClientEvent, ProtocolClient, ProtocolConnector, QrChallenge, SignInOutcome},
    registry::{ConnectionHandle, ConnectionRegistry},
    store::ConfigStore,
    Result,
};

/// Result of a logout request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogoutResult {
    NothingExisted,
    Removed,
}

/// What the owner has to do next after a login step.
#[derive(Clone, Debug)]
pub enum LoginStep {
    Connected(ConnectionHandle),
    PasswordRequired,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoginStage {
    Code,
    Password,
    Qr,
}

struct PendingLogin {
    account: AccountId,
    client: Arc<dyn ProtocolClient>,
    stage: LoginStage,
    generation: u64,
    expiry: Option<JoinHandle<()>>,
}

impl PendingLogin {
    fn disarm(&mut self) {
        if let Some(timer) = self.expiry.take() {
            timer.abort();
        }
    }
}

#[derive(Clone)]
pub struct SessionLifecycleManager {
    inner: Arc<LifecycleInner>,
}

struct LifecycleInner {
    store: Arc<ConfigStore>,
    registry: Arc<ConnectionRegistry>,
    credentials: CredentialStore,
    connector: Arc<dyn ProtocolConnector>,
    router: Arc<ForwardRouter>,
    scheduler: AutoForwardScheduler,
    login_timeout: Duration,
    in_flight: Mutex<HashSet<AccountId>>,
    pending: Mutex<HashMap<UserId, PendingLogin>>,
    generation: AtomicU64,
}

impl SessionLifecycleManager {
    pub fn new(
        store: Arc<ConfigStore>,
        registry: Arc<ConnectionRegistry>,
        credentials: CredentialStore,
        connector: Arc<dyn ProtocolConnector>,
        router: Arc<ForwardRouter>,
        scheduler: AutoForwardScheduler,
        login_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(LifecycleInner {
                store,
                registry,
                credentials,
                connector,
                router,
                scheduler,
                login_timeout,
                in_flight: Mutex::new(HashSet::new()),
                pending: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.inner.credentials
    }

    pub async fn login_in_progress(&self, account: &AccountId) -> bool {
        self.inner.in_flight.lock().await.contains(account)
    }

    /// Stage of the owner's pending login, if any.
    pub async fn pending_stage(&self, owner: UserId) -> Option<LoginStage> {
        self.inner.pending.lock().await.get(&owner).map(|p| p.stage)
    }

    // ---- login -----------------------------------------------------------

    /// Start a code login: the provider sends a one-time code to the account.
    pub async fn begin_code_login(&self, owner: UserId, account: &AccountId) -> Result<()> {
        let client = self.open_guarded(owner, account).await?;
        if let Err(e) = client.send_code(account.as_str()).await {
            self.abandon(account, &client).await;
            return Err(e);
        }
        self.park(owner, account.clone(), client, LoginStage::Code)
            .await;
        info!(account = %account, owner = owner.0, "login code requested");
        Ok(())
    }

    /// Complete a code login with the received code.
    pub async fn submit_code(&self, owner: UserId, code: &str) -> Result<LoginStep> {
        let (account, client) = self.take_pending(owner, LoginStage::Code).await?;
        let outcome = client.sign_in(code).await;
        self.advance(owner, account, client, outcome).await
    }

    /// Complete a login that requires the second factor.
    pub async fn submit_password(&self, owner: UserId, password: &str) -> Result<ConnectionHandle> {
        let (account, client) = self.take_pending(owner, LoginStage::Password).await?;
        match client.check_password(password).await {
            Ok(SignInOutcome::Success) => self.finish_login(owner, account, client).await,
            Ok(SignInOutcome::NeedsSecondFactor) => {
                self.abandon(&account, &client).await;
                Err(Error::Auth("second factor was not accepted".to_string()))
            }
            Ok(SignInOutcome::Failed(reason)) => {
                self.abandon(&account, &client).await;
                Err(Error::Auth(reason))
            }
            Err(e) => {
                self.abandon(&account, &client).await;
                Err(e)
            }
        }
    }

    /// Start a QR login and return the challenge to show the owner.
    pub async fn begin_qr_login(&self, owner: UserId, account: &AccountId) -> Result<QrChallenge> {
        let client = self.open_guarded(owner, account).await?;
        let challenge = match client.qr_login().await {
            Ok(c) => c,
            Err(e) => {
                self.abandon(account, &client).await;
                return Err(e);
            }
        };
        self.park(owner, account.clone(), client, LoginStage::Qr)
            .await;
        info!(account = %account, owner = owner.0, "qr login started");
        Ok(challenge)
    }

    /// Wait (bounded by the login timeout) for the QR code to be scanned.
    pub async fn await_qr_login(&self, owner: UserId) -> Result<LoginStep> {
        let (account, client) = self.take_pending(owner, LoginStage::Qr).await?;
        let timeout = self.inner.login_timeout;
        match tokio::time::timeout(timeout, client.wait_qr_login(timeout)).await {
            Ok(outcome) => self.advance(owner, account, client, outcome).await,
            Err(_) => {
                warn!(account = %account, "qr login expired");
                self.abandon(&account, &client).await;
                Err(Error::Auth(
                    "the QR code was not scanned in time".to_string(),
                ))
            }
        }
    }

    /// Drop the owner's pending login, if any.
    pub async fn cancel_login(&self, owner: UserId) -> bool {
        let pending = self.inner.pending.lock().await.remove(&owner);
        match pending {
            Some(mut p) => {
                p.disarm();
                self.abandon(&p.account, &p.client).await;
                true
            }
            None => false,
        }
    }

    async fn open_guarded(
        &self,
        owner: UserId,
        account: &AccountId,
    ) -> Result<Arc<dyn ProtocolClient>> {
        self.reserve(account).await?;
        // A new login replaces whatever the owner had pending before.
        self.cancel_login(owner).await;
        match self.inner.connector.open(account).await {
            Ok(client) => Ok(client),
            Err(e) => {
                self.release(account).await;
                Err(e)
            }
        }
    }

    async fn advance(
        &self,
        owner: UserId,
        account: AccountId,
        client: Arc<dyn ProtocolClient>,
        outcome: Result<SignInOutcome>,
    ) -> Result<LoginStep> {
        match outcome {
            Ok(SignInOutcome::Success) => self
                .finish_login(owner, account, client)
                .await
                .map(LoginStep::Connected),
            Ok(SignInOutcome::NeedsSecondFactor) => {
                self.park(owner, account, client, LoginStage::Password)
                    .await;
                Ok(LoginStep::PasswordRequired)
            }
            Ok(SignInOutcome::Failed(reason)) => {
                self.abandon(&account, &client).await;
                Err(Error::Auth(reason))
            }
            Err(e) => {
                self.abandon(&account, &client).await;
                Err(e)
            }
        }
    }

    async fn finish_login(
        &self,
        owner: UserId,
        account: AccountId,
        client: Arc<dyn ProtocolClient>,
    ) -> Result<ConnectionHandle> {
        let result = self.activate(&account, Some(owner), client.clone()).await;
        self.release(&account).await;
        if result.is_err() {
            client.disconnect().await;
        }
        result
    }

    /// Store a pending login and arm its expiry timer.
    async fn park(
        &self,
        owner: UserId,
        account: AccountId,
        client: Arc<dyn ProtocolClient>,
        stage: LoginStage,
    ) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let manager = self.clone();
        let timeout = self.inner.login_timeout;
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            manager.expire(owner, generation).await;
        });
        self.inner.pending.lock().await.insert(
            owner,
            PendingLogin {
                account,
                client,
                stage,
                generation,
                expiry: Some(expiry),
            },
        );
    }

    async fn take_pending(
        &self,
        owner: UserId,
        stage: LoginStage,
    ) -> Result<(AccountId, Arc<dyn ProtocolClient>)> {
        let mut pending = self.inner.pending.lock().await;
        match pending.get(&owner) {
            Some(p) if p.stage == stage => {}
            _ => {
                return Err(Error::NotFound(match stage {
                    LoginStage::Code => "no login is waiting for a code".to_string(),
                    LoginStage::Password => "no login is waiting for a password".to_string(),
                    LoginStage::Qr => "no QR login is pending".to_string(),
                }))
            }
        }
        let Some(mut p) = pending.remove(&owner) else {
            return Err(Error::NotFound("no pending login".to_string()));
        };
        p.disarm();
        Ok((p.account, p.client))
    }

    async fn expire(&self, owner: UserId, generation: u64) {
        let expired = {
            let mut pending = self.inner.pending.lock().await;
            match pending.get(&owner) {
                Some(p) if p.generation == generation => pending.remove(&owner),
                _ => None,
            }
        };
        if let Some(p) = expired {
            warn!(account = %p.account, owner = owner.0, "pending login expired");
            self.abandon(&p.account, &p.client).await;
        }
    }

    async fn abandon(&self, account: &AccountId, client: &Arc<dyn ProtocolClient>) {
        client.disconnect().await;
        self.release(account).await;
    }

    async fn reserve(&self, account: &AccountId) -> Result<()> {
        if self.inner.registry.is_live(account).await {
            return Err(Error::AlreadyConnected(account.clone()));
        }
        let mut in_flight = self.inner.in_flight.lock().await;
        if !in_flight.insert(account.clone()) {
            return Err(Error::LoginAlreadyInProgress(account.clone()));
        }
        Ok(())
    }

    async fn release(&self, account: &AccountId) {
        self.inner.in_flight.lock().await.remove(account);
    }

    // ---- resume ----------------------------------------------------------

    /// Reconnect from the persisted credential artifact.
    ///
    /// A rejected artifact is deleted and reported as
    /// [`Error::InvalidOrExpiredSession`].
    pub async fn resume(&self, account: &AccountId, owner: Option<UserId>) -> Result<ConnectionHandle> {
        self.reserve(account).await?;
        let result = self.resume_reserved(account, owner).await;
        self.release(account).await;
        result
    }

    async fn resume_reserved(
        &self,
        account: &AccountId,
        owner: Option<UserId>,
    ) -> Result<ConnectionHandle> {
        let client = match self.inner.connector.open(account).await {
            Ok(client) => client,
            Err(e) => {
                warn!(account = %account, error = %e, "could not open stored session");
                self.inner.credentials.delete(account)?;
                return Err(Error::InvalidOrExpiredSession(account.clone()));
            }
        };

        let authorized = match client.is_authorized().await {
            Ok(v) => v,
            Err(e) => {
                warn!(account = %account, error = %e, "authorization check failed");
                false
            }
        };
        if !authorized {
            client.disconnect().await;
            self.inner.credentials.delete(account)?;
            return Err(Error::InvalidOrExpiredSession(account.clone()));
        }

        match self.activate(account, owner, client.clone()).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                client.disconnect().await;
                Err(e)
            }
        }
    }

    /// Import an exported session string as the account's credential
    /// artifact and resume from it on behalf of `owner`.
    pub async fn import_session(
        &self,
        owner: UserId,
        account: &AccountId,
        encoded: &str,
    ) -> Result<ConnectionHandle> {
        self.reserve(account).await?;
        let result = match self.inner.connector.import_session(account, encoded).await {
            Ok(()) => {
                info!(account = %account, owner = owner.0, "session string imported");
                self.resume_reserved(account, Some(owner)).await
            }
            Err(e) => Err(e),
        };
        self.release(account).await;
        result
    }

    /// Resume every stored account that still has a credential artifact, each
    /// in its own task.
    pub async fn resume_all(&self) -> Vec<JoinHandle<()>> {
        let accounts = self.inner.store.snapshot().await;
        let mut tasks = Vec::new();
        for (account, cfg) in accounts {
            if !self.inner.credentials.exists(&account) {
                continue;
            }
            let manager = self.clone();
            tasks.push(tokio::spawn(async move {
                match manager.resume(&account, cfg.controller_id).await {
                    Ok(_) => info!(account = %account, "session resumed"),
                    Err(e) => warn!(account = %account, error = %e, "session not resumed"),
                }
            }));
        }
        info!(count = tasks.len(), "resuming stored sessions");
        tasks
    }

    // ---- activation --------------------------------------------------------

    async fn activate(
        &self,
        account: &AccountId,
        owner: Option<UserId>,
        client: Arc<dyn ProtocolClient>,
    ) -> Result<ConnectionHandle> {
        self.inner.store.ensure(account, owner).await?;

        let handle = self.inner.registry.connection(account.clone(), client);
        self.inner.registry.register(handle.clone()).await?;

        self.inner.scheduler.resume_if_enabled(&handle).await;

        let manager = self.clone();
        let supervised = handle.clone();
        let supervisor = tokio::spawn(async move {
            manager.supervise(supervised).await;
        });
        self.inner
            .registry
            .attach_supervisor(account, handle.id(), supervisor)
            .await;

        info!(account = %account, connection = handle.id(), "account connected");
        Ok(handle)
    }

    /// Pump the connection's events into the relay hook until it ends.
    async fn supervise(&self, handle: ConnectionHandle) {
        let account = handle.account().clone();
        let client = handle.client();
        let cancel = handle.cancel_token();

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => None,
                ev = client.next_event() => ev,
            };
            let Some(ClientEvent::NewMessage(message)) = event else {
                break;
            };

            let router = self.inner.router.clone();
            let client = client.clone();
            let account = account.clone();
            let relay_cancel = cancel.child_token();
            tokio::spawn(async move {
                router
                    .on_message(&account, client.as_ref(), &message, &relay_cancel)
                    .await;
            });
        }

        cancel.cancel();
        if self
            .inner
            .registry
            .remove_exact(&account, handle.id())
            .await
        {
            info!(account = %account, connection = handle.id(), "connection ended");
        }
    }

    // ---- logout ------------------------------------------------------------

    /// Full logout: deauthorize, disconnect and forget the account.
    pub async fn logout(&self, account: &AccountId) -> Result<LogoutResult> {
        let mut existed = false;

        if let Some(handle) = self.inner.registry.remove(account).await {
            existed = true;
            handle.cancel_token().cancel();
            let client = handle.client();
            if client.is_connected() {
                if let Err(e) = client.log_out().await {
                    warn!(account = %account, error = %e, "provider logout failed");
                }
                client.disconnect().await;
            }
        }

        self.inner.scheduler.cancel(account).await;

        let owners: Vec<UserId> = {
            let pending = self.inner.pending.lock().await;
            pending
                .iter()
                .filter(|(_, p)| &p.account == account)
                .map(|(owner, _)| *owner)
                .collect()
        };
        for owner in owners {
            existed |= self.cancel_login(owner).await;
        }
        self.release(account).await;

        existed |= self.inner.store.remove(account).await?;
        match self.inner.credentials.delete(account) {
            Ok(removed) => existed |= removed,
            Err(e) => error!(account = %account, error = %e, "could not delete session file"),
        }

        if existed {
            info!(account = %account, "account logged out");
            Ok(LogoutResult::Removed)
        } else {
            Ok(LogoutResult::NothingExisted)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::{
        config::Config,
        delay::DelayPolicy,
        domain::ChatId,
        store::ChatRole,
        testing::{relay, FakeClient, FakeConnector},
    };

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<ConfigStore>,
        registry: Arc<ConnectionRegistry>,
        connector: Arc<FakeConnector>,
        scheduler: AutoForwardScheduler,
        manager: SessionLifecycleManager,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::default();
        let store = Arc::new(ConfigStore::load(dir.path().join("users.json")));
        let registry = Arc::new(ConnectionRegistry::new());
        let connector = Arc::new(FakeConnector::default());
        let delay = Arc::new(DelayPolicy::new(store.clone(), &cfg));
        let router = Arc::new(ForwardRouter::new(store.clone(), delay.clone()));
        let scheduler = AutoForwardScheduler::new(store.clone(), delay, cfg.auto_forward_retry);
        let manager = SessionLifecycleManager::new(
            store.clone(),
            registry.clone(),
            CredentialStore::new(dir.path()),
            connector.clone(),
            router,
            scheduler.clone(),
            cfg.login_timeout,
        );
        Fixture {
            dir,
            store,
            registry,
            connector,
            scheduler,
            manager,
        }
    }

    fn acct() -> AccountId {
        AccountId::new("+15550001")
    }

    const OWNER: UserId = UserId(42);

    #[tokio::test(start_paused = true)]
    async fn code_login_activates_and_records_owner() {
        let fx = fixture();
        fx.manager.begin_code_login(OWNER, &acct()).await.unwrap();
        let client = fx.connector.last_opened(&acct()).unwrap();
        assert_eq!(client.codes_requested(), vec!["+15550001".to_string()]);
        assert_eq!(fx.manager.pending_stage(OWNER).await, Some(LoginStage::Code));

        let step = fx.manager.submit_code(OWNER, "12345").await.unwrap();
        assert!(matches!(step, LoginStep::Connected(_)));
        assert!(fx.registry.is_live(&acct()).await);
        assert!(!fx.manager.login_in_progress(&acct()).await);

        let cfg = fx.store.get(&acct()).await.unwrap();
        assert_eq!(cfg.controller_id, Some(OWNER));
        assert!(cfg.forwarding_enabled);
        assert!(cfg.sources.is_empty() && cfg.targets.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn second_factor_is_an_explicit_step() {
        let fx = fixture();
        let client = Arc::new(FakeClient::unauthorized());
        client.script_sign_in(SignInOutcome::NeedsSecondFactor);
        fx.connector.prepare(&acct(), client.clone());

        fx.manager.begin_code_login(OWNER, &acct()).await.unwrap();
        let step = fx.manager.submit_code(OWNER, "1").await.unwrap();
        assert!(matches!(step, LoginStep::PasswordRequired));
        assert!(fx.manager.login_in_progress(&acct()).await);

        fx.manager.submit_password(OWNER, "hunter2").await.unwrap();
        assert!(fx.registry.is_live(&acct()).await);
        assert_eq!(fx.manager.pending_stage(OWNER).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_login_is_rejected_until_the_first_fails() {
        let fx = fixture();
        let first = Arc::new(FakeClient::unauthorized());
        first.script_sign_in(SignInOutcome::Failed("bad code".to_string()));
        fx.connector.prepare(&acct(), first.clone());

        fx.manager.begin_code_login(OWNER, &acct()).await.unwrap();
        let err = fx
            .manager
            .begin_code_login(UserId(7), &acct())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LoginAlreadyInProgress(_)));

        let err = fx.manager.submit_code(OWNER, "0").await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert!(!first.is_connected());

        fx.manager.begin_code_login(UserId(7), &acct()).await.unwrap();
        fx.manager.submit_code(UserId(7), "1").await.unwrap();
        assert!(fx.registry.is_live(&acct()).await);

        let err = fx
            .manager
            .begin_code_login(OWNER, &acct())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyConnected(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn qr_login_times_out_and_releases_the_guard() {
        let fx = fixture();
        let client = Arc::new(FakeClient::unauthorized());
        fx.connector.prepare(&acct(), client.clone());

        let challenge = fx.manager.begin_qr_login(OWNER, &acct()).await.unwrap();
        assert!(challenge.url.starts_with("tg://login"));

        let err = fx.manager.await_qr_login(OWNER).await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert!(!fx.manager.login_in_progress(&acct()).await);
        assert!(!client.is_connected());
        assert!(!fx.registry.is_live(&acct()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn scanned_qr_code_connects() {
        let fx = fixture();
        let client = Arc::new(FakeClient::unauthorized());
        client.set_qr_outcome(Some(SignInOutcome::Success));
        fx.connector.prepare(&acct(), client);

        fx.manager.begin_qr_login(OWNER, &acct()).await.unwrap();
        let step = fx.manager.await_qr_login(OWNER).await.unwrap();
        assert!(matches!(step, LoginStep::Connected(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_code_login_expires() {
        let fx = fixture();
        fx.manager.begin_code_login(OWNER, &acct()).await.unwrap();
        let client = fx.connector.last_opened(&acct()).unwrap();

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(fx.manager.pending_stage(OWNER).await, None);
        assert!(!fx.manager.login_in_progress(&acct()).await);
        assert!(!client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_session_file_is_deleted() {
        let fx = fixture();
        let creds = CredentialStore::new(fx.dir.path());
        fs::write(creds.path_for(&acct()), b"stale").unwrap();
        fx.connector
            .prepare(&acct(), Arc::new(FakeClient::unauthorized()));

        let err = fx.manager.resume(&acct(), Some(OWNER)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidOrExpiredSession(_)));
        assert!(!creds.exists(&acct()));
        assert!(!fx.manager.login_in_progress(&acct()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn resumed_connection_relays_and_restarts_auto_forward() {
        let fx = fixture();
        fx.store.ensure(&acct(), Some(OWNER)).await.unwrap();
        fx.store
            .update(&acct(), |cfg| {
                cfg.add_chat(ChatRole::Source, ChatId(100));
                cfg.add_chat(ChatRole::Target, ChatId(200));
                cfg.auto_forward_enabled = true;
                cfg.auto_forward_interval = Some(10);
                cfg.min_delay = Some(0);
                cfg.max_delay = Some(0);
            })
            .await
            .unwrap();
        fs::write(CredentialStore::new(fx.dir.path()).path_for(&acct()), b"ok").unwrap();
        let client = Arc::new(FakeClient::default());
        fx.connector.prepare(&acct(), client.clone());

        for task in fx.manager.resume_all().await {
            task.await.unwrap();
        }
        assert!(fx.registry.is_live(&acct()).await);
        assert!(fx.scheduler.is_running(&acct()).await);

        client.push_event(relay(100, 5));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(client.sent_dests(), vec![ChatId(200)]);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_connection_is_unregistered_and_stops_auto_forward() {
        let fx = fixture();
        fx.store.ensure(&acct(), Some(OWNER)).await.unwrap();
        fx.store
            .update(&acct(), |cfg| {
                cfg.auto_forward_enabled = true;
                cfg.auto_forward_interval = Some(1);
            })
            .await
            .unwrap();
        let client = Arc::new(FakeClient::default());
        fx.connector.prepare(&acct(), client.clone());
        fx.manager.resume(&acct(), None).await.unwrap();
        assert!(fx.scheduler.is_running(&acct()).await);

        client.drop_connection();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!fx.registry.is_live(&acct()).await);
        assert!(fx.registry.is_empty().await);
        assert!(!fx.scheduler.is_running(&acct()).await);
        // Persisted state is untouched so a later resume restarts the loop.
        assert!(fx.store.get(&acct()).await.unwrap().auto_forward_enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn logout_is_idempotent() {
        let fx = fixture();
        let client = Arc::new(FakeClient::default());
        fx.connector.prepare(&acct(), client.clone());
        fs::write(CredentialStore::new(fx.dir.path()).path_for(&acct()), b"ok").unwrap();
        fx.manager.resume(&acct(), Some(OWNER)).await.unwrap();

        assert_eq!(
            fx.manager.logout(&acct()).await.unwrap(),
            LogoutResult::Removed
        );
        assert!(client.was_logged_out());
        assert!(!fx.registry.is_live(&acct()).await);
        assert!(fx.store.get(&acct()).await.is_none());
        assert!(!CredentialStore::new(fx.dir.path()).exists(&acct()));

        assert_eq!(
            fx.manager.logout(&acct()).await.unwrap(),
            LogoutResult::NothingExisted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn logout_clears_a_pending_login() {
        let fx = fixture();
        fx.manager.begin_code_login(OWNER, &acct()).await.unwrap();

        assert_eq!(
            fx.manager.logout(&acct()).await.unwrap(),
            LogoutResult::Removed
        );
        assert!(!fx.manager.login_in_progress(&acct()).await);
        assert_eq!(fx.manager.pending_stage(OWNER).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn imported_session_string_connects_for_its_owner() {
        let fx = fixture();
        let handle = fx
            .manager
            .import_session(OWNER, &acct(), "1AbC")
            .await
            .unwrap();

        assert_eq!(handle.account(), &acct());
        assert_eq!(fx.connector.imported(), vec![(acct(), "1AbC".to_string())]);
        assert!(fx.registry.is_live(&acct()).await);
        let cfg = fx.store.get(&acct()).await.unwrap();
        assert_eq!(cfg.controller_id, Some(OWNER));
        assert!(!fx.manager.login_in_progress(&acct()).await);

        let err = fx
            .manager
            .import_session(OWNER, &acct(), "1AbC")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyConnected(_)));
        assert_eq!(fx.connector.imported().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bad_or_rejected_session_strings_do_not_connect() {
        let fx = fixture();
        let err = fx
            .manager
            .import_session(OWNER, &acct(), "garbage")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(fx.connector.opened().is_empty());
        assert!(!fx.manager.login_in_progress(&acct()).await);

        fx.connector
            .prepare(&acct(), Arc::new(FakeClient::unauthorized()));
        let err = fx
            .manager
            .import_session(OWNER, &acct(), "1AbC")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOrExpiredSession(_)));
        assert!(!fx.registry.is_live(&acct()).await);
        assert!(!fx.manager.login_in_progress(&acct()).await);
    }
}
