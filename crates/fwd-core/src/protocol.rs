//! Port for the user-account protocol client (MTProto today).
//!
//! The core only depends on these behavioral contracts. Authentication,
//! encryption and transport live in the adapter crate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::{
    domain::{AccountId, ChatEntity, ChatId, ChatLookup, MessageId},
    Result,
};

/// A message as seen by the relay engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayMessage {
    /// Canonical id of the chat the message was posted in.
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub text: Option<String>,
}

/// Events delivered by a live connection.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    NewMessage(RelayMessage),
}

/// Three-state result of a sign-in step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignInOutcome {
    Success,
    NeedsSecondFactor,
    Failed(String),
}

/// QR login challenge; the URL is rendered as a QR code for the user.
#[derive(Clone, Debug)]
pub struct QrChallenge {
    pub url: String,
}

/// Minimal profile of the logged-in account.
#[derive(Clone, Debug, Default)]
pub struct AccountProfile {
    pub first_name: String,
    pub username: Option<String>,
}

/// What `join` ended up doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinAction {
    Joined,
    StartedBot,
}

/// One authenticated (or authenticating) session for a single account.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn disconnect(&self);

    /// Deauthorize the session with the provider.
    async fn log_out(&self) -> Result<()>;

    async fn is_authorized(&self) -> Result<bool>;

    async fn get_me(&self) -> Result<AccountProfile>;

    /// Send a copy of `message` to `dest`.
    async fn send_message(&self, dest: ChatId, message: &RelayMessage) -> Result<()>;

    /// Most recent messages of `chat`, newest first.
    async fn get_recent_messages(&self, chat: ChatId, limit: usize) -> Result<Vec<RelayMessage>>;

    async fn get_entity(&self, lookup: &ChatLookup) -> Result<ChatEntity>;

    /// Every dialog the account is a member of.
    async fn list_dialogs(&self) -> Result<Vec<ChatEntity>>;

    /// Join a channel/megagroup or start a bot.
    async fn join(&self, entity: &ChatEntity) -> Result<JoinAction>;

    /// Next event from the connection. `None` means the connection ended.
    async fn next_event(&self) -> Option<ClientEvent>;

    // Authentication primitives.

    async fn send_code(&self, phone: &str) -> Result<()>;

    async fn sign_in(&self, code: &str) -> Result<SignInOutcome>;

    async fn check_password(&self, password: &str) -> Result<SignInOutcome>;

    async fn qr_login(&self) -> Result<QrChallenge>;

    /// Wait until the QR code was scanned. Implementations must give up after
    /// `timeout`.
    async fn wait_qr_login(&self, timeout: Duration) -> Result<SignInOutcome>;
}

/// Opens protocol clients bound to an account's credential artifact.
#[async_trait]
pub trait ProtocolConnector: Send + Sync {
    async fn open(&self, account: &AccountId) -> Result<Arc<dyn ProtocolClient>>;

    /// Write the account's credential artifact from an exported session
    /// string. The session is not validated here; `open` does that.
    async fn import_session(&self, account: &AccountId, encoded: &str) -> Result<()>;
}
