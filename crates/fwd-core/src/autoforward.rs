//! Periodic re-send of the latest source message (auto-forward).
//!
//! One cancellable task per account. The task token is a child of the
//! connection token, so a task never outlives its connection.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    delay::DelayPolicy,
    domain::AccountId,
    errors::Error,
    forwarder::{pause, relay_batch},
    protocol::ProtocolClient,
    registry::ConnectionHandle,
    store::{ConfigStore, MAX_INTERVAL_MINUTES},
    Result,
};

#[derive(Clone)]
pub struct AutoForwardScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    store: Arc<ConfigStore>,
    delay: Arc<DelayPolicy>,
    retry: Duration,
    next_task: AtomicU64,
    tasks: tokio::sync::Mutex<HashMap<AccountId, TaskEntry>>,
}

struct TaskEntry {
    id: u64,
    connection: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl TaskEntry {
    fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && !self.handle.is_finished()
    }
}

impl AutoForwardScheduler {
    pub fn new(store: Arc<ConfigStore>, delay: Arc<DelayPolicy>, retry: Duration) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                delay,
                retry,
                next_task: AtomicU64::new(1),
                tasks: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Persist `auto_forward_enabled = true` with `minutes` and (re)start the
    /// account's task on `conn`.
    pub async fn start(&self, conn: &ConnectionHandle, minutes: u64) -> Result<()> {
        if minutes == 0 {
            return Err(Error::InvalidArgument(
                "interval must be a positive number of minutes".to_string(),
            ));
        }
        if minutes > MAX_INTERVAL_MINUTES {
            return Err(Error::InvalidArgument(format!(
                "interval cannot exceed {MAX_INTERVAL_MINUTES} minutes (one week)"
            )));
        }
        let account = conn.account().clone();
        self.cancel(&account).await;

        let updated = self
            .inner
            .store
            .update(&account, |cfg| {
                cfg.auto_forward_enabled = true;
                cfg.auto_forward_interval = Some(minutes);
            })
            .await?;
        if updated.is_none() {
            return Err(Error::NotFound(format!("no configuration for {account}")));
        }

        self.spawn(conn).await;
        info!(account = %account, minutes, "auto-forward started");
        Ok(())
    }

    /// Cancel the task and persist `auto_forward_enabled = false`. Returns
    /// whether a task was running.
    pub async fn stop(&self, account: &AccountId) -> Result<bool> {
        let was_running = self.cancel(account).await;
        self.inner
            .store
            .update(account, |cfg| cfg.auto_forward_enabled = false)
            .await?;
        info!(account = %account, was_running, "auto-forward stopped");
        Ok(was_running)
    }

    /// Launch the loop if the persisted flag says so (after a restart or a
    /// fresh activation). A loop already running on `conn` is left alone.
    pub async fn resume_if_enabled(&self, conn: &ConnectionHandle) -> bool {
        let enabled = self
            .inner
            .store
            .get(conn.account())
            .await
            .map(|cfg| cfg.auto_forward_enabled)
            .unwrap_or(false);
        if !enabled {
            return false;
        }
        let running_here = self
            .inner
            .tasks
            .lock()
            .await
            .get(conn.account())
            .map(|e| e.connection == conn.id() && e.is_active())
            .unwrap_or(false);
        if running_here {
            return true;
        }
        self.cancel(conn.account()).await;
        self.spawn(conn).await;
        info!(account = %conn.account(), "auto-forward resumed");
        true
    }

    /// Cancel the account's task without touching persisted state.
    pub async fn cancel(&self, account: &AccountId) -> bool {
        let entry = self.inner.tasks.lock().await.remove(account);
        match entry {
            Some(entry) => {
                entry.cancel.cancel();
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self, account: &AccountId) -> bool {
        self.inner
            .tasks
            .lock()
            .await
            .get(account)
            .map(TaskEntry::is_active)
            .unwrap_or(false)
    }

    async fn spawn(&self, conn: &ConnectionHandle) {
        let account = conn.account().clone();
        let client = conn.client();
        let cancel = conn.cancel_token().child_token();
        let id = self.inner.next_task.fetch_add(1, Ordering::SeqCst);

        // Hold the map lock across the spawn so the task cannot finish and
        // deregister before its entry exists.
        let mut tasks = self.inner.tasks.lock().await;
        let scheduler = self.clone();
        let task_account = account.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            scheduler
                .run(&task_account, client, &task_cancel)
                .await;
            scheduler.forget(&task_account, id).await;
        });
        tasks.insert(
            account,
            TaskEntry {
                id,
                connection: conn.id(),
                cancel,
                handle,
            },
        );
    }

    async fn forget(&self, account: &AccountId, id: u64) {
        let mut tasks = self.inner.tasks.lock().await;
        if tasks.get(account).map(|e| e.id) == Some(id) {
            tasks.remove(account);
        }
    }

    async fn run(
        &self,
        account: &AccountId,
        client: Arc<dyn ProtocolClient>,
        cancel: &CancellationToken,
    ) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let Some(cfg) = self.inner.store.get(account).await else {
                debug!(account = %account, "configuration gone, auto-forward exits");
                return;
            };
            if !cfg.auto_forward_enabled {
                debug!(account = %account, "auto-forward disabled, loop exits");
                return;
            }

            let (Some(minutes), Some(source)) = (cfg.interval_minutes(), cfg.sources.first())
            else {
                if !pause(cancel, self.inner.retry).await {
                    return;
                }
                continue;
            };
            if cfg.targets.is_empty() {
                if !pause(cancel, self.inner.retry).await {
                    return;
                }
                continue;
            }
            let interval = Duration::from_secs(minutes.saturating_mul(60));

            match client.get_recent_messages(*source, 1).await {
                Ok(messages) => match messages.into_iter().next() {
                    Some(message) => {
                        let report = relay_batch(
                            account,
                            client.as_ref(),
                            &message,
                            &cfg.targets,
                            &self.inner.delay,
                            cancel,
                        )
                        .await;
                        if report.cancelled {
                            return;
                        }
                        info!(
                            account = %account,
                            source = %source,
                            sent = report.sent,
                            failed = report.failed,
                            "auto-forward round finished"
                        );
                    }
                    None => {
                        debug!(account = %account, source = %source, "no message to auto-forward yet");
                    }
                },
                Err(e) => {
                    warn!(account = %account, source = %source, error = %e, "auto-forward fetch failed");
                }
            }

            if !pause(cancel, interval).await {
                return;
            }
        }
    }
}
