use std::{sync::Arc, time::Duration};

use rand::Rng;

use crate::{config::Config, domain::AccountId, store::ConfigStore};

/// Pacing gap between consecutive outbound relays of one account.
pub struct DelayPolicy {
    store: Arc<ConfigStore>,
    default_min: u64,
    default_max: u64,
}

impl DelayPolicy {
    pub fn new(store: Arc<ConfigStore>, cfg: &Config) -> Self {
        Self {
            store,
            default_min: cfg.default_min_delay,
            default_max: cfg.default_max_delay,
        }
    }

    /// Current `(min, max)` seconds for the account.
    pub async fn range(&self, account: &AccountId) -> (u64, u64) {
        match self.store.get(account).await {
            Some(cfg) => cfg.delay_range(self.default_min, self.default_max),
            None => (self.default_min, self.default_max),
        }
    }

    /// Seconds to wait before the next relay send, read fresh every call.
    pub async fn next_delay(&self, account: &AccountId) -> u64 {
        let (min, max) = self.range(account).await;
        draw(min, max)
    }

    pub async fn next_pause(&self, account: &AccountId) -> Duration {
        Duration::from_secs(self.next_delay(account).await)
    }
}

/// Uniform integer in `[min, max]`.
pub fn draw(min: u64, max: u64) -> u64 {
    if min >= max {
        return min;
    }
    rand::rng().random_range(min..=max)
}
