use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{domain::UserId, errors::Error, Result};

pub const DEFAULT_MIN_DELAY_SECS: u64 = 5;
pub const DEFAULT_MAX_DELAY_SECS: u64 = 15;

/// Typed configuration for the forwarder process.
#[derive(Clone, Debug)]
pub struct Config {
    // Controller bot
    pub telegram_bot_token: String,
    pub admin_id: UserId,

    // User-account protocol client
    pub api_id: i32,
    pub api_hash: String,

    // Persistence
    pub data_file: PathBuf,
    pub sessions_dir: PathBuf,

    // Relay pacing defaults (per-account values override these)
    pub default_min_delay: u64,
    pub default_max_delay: u64,

    // Timing
    pub login_timeout: Duration,
    pub auto_forward_retry: Duration,
    pub heartbeat_interval: Duration,

    // Telegram limits
    pub telegram_message_limit: usize,
    pub telegram_safe_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telegram_bot_token: String::new(),
            admin_id: UserId(0),
            api_id: 0,
            api_hash: String::new(),
            data_file: PathBuf::from("users.json"),
            sessions_dir: PathBuf::from("."),
            default_min_delay: DEFAULT_MIN_DELAY_SECS,
            default_max_delay: DEFAULT_MAX_DELAY_SECS,
            login_timeout: Duration::from_secs(300),
            auto_forward_retry: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(60),
            telegram_message_limit: 4096,
            telegram_safe_limit: 4000,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        // Required env vars
        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let admin_id = env_i64("ADMIN_ID").map(UserId).ok_or_else(|| {
            Error::Config("ADMIN_ID environment variable is required".to_string())
        })?;

        let api_id = env_str("TELEGRAM_API_ID")
            .and_then(|s| s.trim().parse::<i32>().ok())
            .ok_or_else(|| {
                Error::Config("TELEGRAM_API_ID environment variable is required".to_string())
            })?;
        let api_hash = env_str("TELEGRAM_API_HASH")
            .and_then(non_empty)
            .ok_or_else(|| {
                Error::Config("TELEGRAM_API_HASH environment variable is required".to_string())
            })?;

        let data_file = env_path("DATA_FILE").unwrap_or_else(|| PathBuf::from("users.json"));
        let sessions_dir = env_path("SESSIONS_DIR").unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&sessions_dir)?;

        let default_min_delay = env_u64("DEFAULT_MIN_DELAY").unwrap_or(DEFAULT_MIN_DELAY_SECS);
        let default_max_delay = env_u64("DEFAULT_MAX_DELAY").unwrap_or(DEFAULT_MAX_DELAY_SECS);
        if default_min_delay > default_max_delay {
            return Err(Error::Config(format!(
                "DEFAULT_MIN_DELAY ({default_min_delay}) must not exceed DEFAULT_MAX_DELAY ({default_max_delay})"
            )));
        }

        let login_timeout = Duration::from_secs(env_u64("LOGIN_TIMEOUT_SECS").unwrap_or(300));
        let auto_forward_retry =
            Duration::from_secs(env_u64("AUTO_FORWARD_RETRY_SECS").unwrap_or(300));
        let heartbeat_interval = Duration::from_secs(env_u64("HEARTBEAT_SECS").unwrap_or(60));

        let telegram_message_limit = env_usize("TELEGRAM_MESSAGE_LIMIT").unwrap_or(4096);
        let telegram_safe_limit = env_usize("TELEGRAM_SAFE_LIMIT").unwrap_or(4000);

        Ok(Self {
            telegram_bot_token,
            admin_id,
            api_id,
            api_hash,
            data_file,
            sessions_dir,
            default_min_delay,
            default_max_delay,
            login_timeout,
            auto_forward_retry,
            heartbeat_interval,
            telegram_message_limit,
            telegram_safe_limit,
        })
    }

    pub fn is_admin(&self, user: UserId) -> bool {
        self.admin_id.0 != 0 && self.admin_id == user
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_i64(key: &str) -> Option<i64> {
    env_str(key).and_then(|s| s.trim().parse::<i64>().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_pacing() {
        let cfg = Config::default();
        assert_eq!(cfg.default_min_delay, 5);
        assert_eq!(cfg.default_max_delay, 15);
        assert_eq!(cfg.login_timeout, Duration::from_secs(300));
        assert_eq!(cfg.auto_forward_retry, Duration::from_secs(300));
    }

    #[test]
    fn admin_check_requires_a_configured_admin() {
        let mut cfg = Config::default();
        assert!(!cfg.is_admin(UserId(0)));
        cfg.admin_id = UserId(7);
        assert!(cfg.is_admin(UserId(7)));
        assert!(!cfg.is_admin(UserId(8)));
    }

    #[test]
    fn dotenv_does_not_override_existing_vars() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(
            &path,
            "# comment\nFWD_TEST_DOTENV_NEW=\"quoted\"\nFWD_TEST_DOTENV_KEEP=file\n",
        )
        .unwrap();
        env::set_var("FWD_TEST_DOTENV_KEEP", "env");

        load_dotenv_if_present(&path);

        assert_eq!(env::var("FWD_TEST_DOTENV_NEW").unwrap(), "quoted");
        assert_eq!(env::var("FWD_TEST_DOTENV_KEEP").unwrap(), "env");
    }
}
