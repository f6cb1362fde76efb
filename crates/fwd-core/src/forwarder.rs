//! Event-driven relay: copies every message posted in a source chat to the
//! account's targets.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    delay::DelayPolicy,
    domain::{AccountId, ChatId},
    protocol::{ProtocolClient, RelayMessage},
    store::ConfigStore,
};

/// Outcome of one relay batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub sent: usize,
    pub failed: usize,
    pub cancelled: bool,
}

impl RelayReport {
    pub fn attempted(&self) -> usize {
        self.sent + self.failed
    }
}

/// Sleep for `dur` unless `cancel` fires first. Returns `false` when cancelled.
pub(crate) async fn pause(cancel: &CancellationToken, dur: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(dur) => true,
    }
}

/// Send `message` to each target in order, pausing after every attempt.
///
/// The pause length is re-read from the account's configuration before each
/// wait. Per-target failures are logged and skipped.
pub(crate) async fn relay_batch(
    account: &AccountId,
    client: &dyn ProtocolClient,
    message: &RelayMessage,
    targets: &[ChatId],
    delay: &DelayPolicy,
    cancel: &CancellationToken,
) -> RelayReport {
    let mut report = RelayReport::default();
    for target in targets {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        match client.send_message(*target, message).await {
            Ok(()) => {
                report.sent += 1;
                debug!(account = %account, dest = %target, "relayed message");
            }
            Err(e) => {
                report.failed += 1;
                warn!(account = %account, dest = %target, error = %e, "relay failed");
            }
        }

        let wait = delay.next_pause(account).await;
        if !pause(cancel, wait).await {
            report.cancelled = true;
            break;
        }
    }
    report
}

/// Message-received hook attached to every live connection.
pub struct ForwardRouter {
    store: Arc<ConfigStore>,
    delay: Arc<DelayPolicy>,
}

impl ForwardRouter {
    pub fn new(store: Arc<ConfigStore>, delay: Arc<DelayPolicy>) -> Self {
        Self { store, delay }
    }

    /// Relay `message` if it was posted in one of the account's sources.
    ///
    /// Returns `None` when the message is ignored.
    pub async fn on_message(
        &self,
        account: &AccountId,
        client: &dyn ProtocolClient,
        message: &RelayMessage,
        cancel: &CancellationToken,
    ) -> Option<RelayReport> {
        let cfg = self.store.get(account).await?;
        if !cfg.forwarding_enabled {
            return None;
        }
        if !cfg.sources.contains(&message.chat_id) {
            return None;
        }
        if cfg.targets.is_empty() {
            debug!(account = %account, chat = %message.chat_id, "source message but no targets");
            return None;
        }

        let report = relay_batch(
            account,
            client,
            message,
            &cfg.targets,
            &self.delay,
            cancel,
        )
        .await;
        info!(
            account = %account,
            chat = %message.chat_id,
            sent = report.sent,
            failed = report.failed,
            "relay batch finished"
        );
        Some(report)
    }
}
