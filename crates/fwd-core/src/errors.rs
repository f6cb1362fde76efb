use crate::domain::AccountId;

/// Core error type for the forwarder.
///
/// Adapter crates map their specific errors into this type so the controller
/// can tell rejections (already connected, login in progress) apart from real
/// failures when replying to a user.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("account {0} is already logged in and active")]
    AlreadyConnected(AccountId),

    #[error("a login for {0} is already in progress")]
    LoginAlreadyInProgress(AccountId),

    #[error("the session for {0} is invalid or expired")]
    InvalidOrExpiredSession(AccountId),

    #[error("the client for {0} is not currently active")]
    NotConnected(AccountId),

    #[error("no account is logged in for this user")]
    NoAccount,

    #[error("account {0} is not registered to this user")]
    NotOwner(AccountId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// Rejections leave all state untouched; callers report them without
    /// treating the account as failed.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::AlreadyConnected(_) | Error::LoginAlreadyInProgress(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
