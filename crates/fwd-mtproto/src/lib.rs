//! User-account protocol adapter (grammers / MTProto).
//!
//! Implements the `fwd-core` ProtocolConnector/ProtocolClient ports. Each
//! account gets its own client backed by `<sessions_dir>/<account>.session`.

mod string_session;

use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE, Engine};
use grammers_client::{
    types::{Chat, InputMessage, LoginToken, Message, PasswordToken},
    Client, Config as ClientConfig, InitParams, SignInError, Update,
};
use grammers_mtsender::InvocationError;
use grammers_session::{PackedChat, PackedType, Session};
use grammers_tl_types as tl;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fwd_core::{
    config::Config,
    credentials::CredentialStore,
    domain::{canonical_chat_id, AccountId, ChatEntity, ChatId, ChatKind, ChatLookup, MessageId},
    errors::Error,
    protocol::{
        AccountProfile, ClientEvent, JoinAction, ProtocolClient, ProtocolConnector, QrChallenge,
        RelayMessage, SignInOutcome,
    },
    Result,
};

pub use string_session::StringSession;

/// Inbound messages kept around so a relay to several targets fetches the
/// original once.
const RECENT_MESSAGES: usize = 32;

fn external(context: &str, e: impl std::fmt::Display) -> Error {
    Error::External(format!("{context}: {e}"))
}

fn kind_of(ty: PackedType) -> ChatKind {
    match ty {
        PackedType::User => ChatKind::User,
        PackedType::Bot => ChatKind::Bot,
        PackedType::Chat => ChatKind::Group,
        PackedType::Megagroup | PackedType::Broadcast | PackedType::Gigagroup => ChatKind::Channel,
    }
}

/// `@name`, `t.me/name` and `https://t.me/name` all resolve to `name`.
fn normalize_username(input: &str) -> &str {
    let s = input.trim();
    let s = s
        .strip_prefix("https://")
        .or_else(|| s.strip_prefix("http://"))
        .unwrap_or(s);
    let s = s.strip_prefix("t.me/").unwrap_or(s);
    let s = s.strip_prefix('@').unwrap_or(s);
    s.trim_end_matches('/')
}

/// Canonical ids a user-supplied numeric id may refer to.
fn id_candidates(id: i64) -> Vec<ChatId> {
    let mut out = vec![ChatId(id)];
    for kind in [ChatKind::Channel, ChatKind::Group] {
        let c = canonical_chat_id(kind, id);
        if !out.contains(&c) {
            out.push(c);
        }
    }
    out
}

fn qr_url(token: &[u8]) -> String {
    format!("tg://login?token={}", URL_SAFE.encode(token))
}

fn needs_password(e: &InvocationError) -> bool {
    matches!(e, InvocationError::Rpc(rpc) if rpc.name == "SESSION_PASSWORD_NEEDED")
}

/// Fresh in-memory session whose home is `dc_id`.
fn session_homed_at(dc_id: i32) -> Session {
    let session = Session::new();
    // The user id is not known yet; it is filled in once logged in.
    session.set_user(0, dc_id, false);
    session
}

/// Copy of `msg`: text, formatting and media, without a forward header.
fn copy_of(msg: &Message) -> InputMessage {
    let mut input = InputMessage::text(msg.text());
    if let Some(entities) = msg.fmt_entities() {
        input = input.fmt_entities(entities.clone());
    }
    if let Some(media) = msg.media() {
        input = input.copy_media(&media);
    }
    input
}

#[derive(Default)]
enum LoginState {
    #[default]
    Idle,
    AwaitingCode(LoginToken),
    AwaitingPassword(PasswordToken),
}

#[derive(Clone)]
struct ClientParams {
    api_id: i32,
    api_hash: String,
}

impl ClientParams {
    async fn connect(&self, session: Session) -> Result<Client> {
        Client::connect(ClientConfig {
            session,
            api_id: self.api_id,
            api_hash: self.api_hash.clone(),
            params: InitParams {
                catch_up: false,
                ..Default::default()
            },
        })
        .await
        .map_err(|e| external("connect", e))
    }
}

/// Opens one grammers client per account.
pub struct MtprotoConnector {
    params: ClientParams,
    credentials: CredentialStore,
}

impl MtprotoConnector {
    pub fn new(cfg: &Config) -> Self {
        Self {
            params: ClientParams {
                api_id: cfg.api_id,
                api_hash: cfg.api_hash.clone(),
            },
            credentials: CredentialStore::new(&cfg.sessions_dir),
        }
    }
}

/// Write a session file for `decoded` at `path` (via a `.part` file).
fn write_imported_session(decoded: &StringSession, path: &Path) -> Result<()> {
    let session = session_homed_at(decoded.dc_id);
    session.insert_dc(decoded.dc_id, decoded.addr, decoded.auth_key);

    let partial = path.with_extension("session.part");
    session
        .save_to_file(&partial)
        .map_err(|e| external("save session", e))?;
    std::fs::rename(&partial, path)?;
    Ok(())
}

#[async_trait]
impl ProtocolConnector for MtprotoConnector {
    async fn open(&self, account: &AccountId) -> Result<Arc<dyn ProtocolClient>> {
        let session_path = self.credentials.path_for(account);
        // A fresh session stays in memory until a login succeeds.
        let session = if session_path.exists() {
            Session::load_file(&session_path).map_err(|e| external("load session", e))?
        } else {
            Session::new()
        };

        let client = self.params.connect(session).await?;
        debug!(account = %account, "protocol client connected");

        Ok(Arc::new(MtprotoClient {
            account: account.clone(),
            params: self.params.clone(),
            client: RwLock::new(client),
            session_path,
            connected: AtomicBool::new(true),
            closed: CancellationToken::new(),
            peers: Mutex::new(HashMap::new()),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_MESSAGES)),
            login: Mutex::new(LoginState::Idle),
        }))
    }

    async fn import_session(&self, account: &AccountId, encoded: &str) -> Result<()> {
        let decoded = StringSession::decode(encoded)?;
        let path = self.credentials.path_for(account);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        write_imported_session(&decoded, &path)?;
        info!(account = %account, dc = decoded.dc_id, "session string written");
        Ok(())
    }
}

pub struct MtprotoClient {
    account: AccountId,
    params: ClientParams,
    /// Replaced once if a QR login migrates the account to its home DC.
    client: RwLock<Client>,
    session_path: PathBuf,
    connected: AtomicBool,
    closed: CancellationToken,
    /// Access hashes by canonical chat id.
    peers: Mutex<HashMap<ChatId, (PackedChat, ChatEntity)>>,
    recent: Mutex<VecDeque<(ChatId, MessageId, Message)>>,
    login: Mutex<LoginState>,
}

impl MtprotoClient {
    async fn client(&self) -> Client {
        self.client.read().await.clone()
    }

    fn entity_of(chat: &Chat) -> (PackedChat, ChatEntity) {
        let packed = chat.pack();
        let mut entity = ChatEntity::new(kind_of(packed.ty), chat.id());
        let name = chat.name();
        if !name.is_empty() {
            entity = entity.with_title(name);
        }
        if let Some(username) = chat.username() {
            entity = entity.with_username(username);
        }
        (packed, entity)
    }

    async fn remember(&self, chat: &Chat) -> (PackedChat, ChatEntity) {
        let (packed, entity) = Self::entity_of(chat);
        self.peers
            .lock()
            .await
            .insert(entity.canonical_id, (packed, entity.clone()));
        (packed, entity)
    }

    async fn cached(&self, candidates: &[ChatId]) -> Option<(PackedChat, ChatEntity)> {
        let peers = self.peers.lock().await;
        candidates.iter().find_map(|id| peers.get(id).cloned())
    }

    /// Resolve a canonical id, refreshing the dialog list on a cache miss.
    async fn packed(&self, id: ChatId) -> Result<PackedChat> {
        let candidates = id_candidates(id.0);
        if let Some((packed, _)) = self.cached(&candidates).await {
            return Ok(packed);
        }
        self.list_dialogs().await?;
        self.cached(&candidates)
            .await
            .map(|(packed, _)| packed)
            .ok_or_else(|| Error::NotFound(format!("chat {id} is not known to {}", self.account)))
    }

    async fn keep_recent(&self, chat: ChatId, msg: &Message) {
        let mut recent = self.recent.lock().await;
        if recent.len() == RECENT_MESSAGES {
            recent.pop_front();
        }
        recent.push_back((chat, MessageId(msg.id()), msg.clone()));
    }

    /// The original message behind `relay`, from the recent buffer or the
    /// provider.
    async fn original(&self, from: PackedChat, relay: &RelayMessage) -> Result<Option<Message>> {
        let hit = self
            .recent
            .lock()
            .await
            .iter()
            .rev()
            .find(|(chat, id, _)| *chat == relay.chat_id && *id == relay.message_id)
            .map(|(_, _, msg)| msg.clone());
        if hit.is_some() {
            return Ok(hit);
        }

        let fetched = self
            .client()
            .await
            .get_messages_by_id(from, &[relay.message_id.0])
            .await
            .map_err(|e| external("fetch message", e))?
            .into_iter()
            .next()
            .flatten();
        if let Some(msg) = &fetched {
            self.keep_recent(relay.chat_id, msg).await;
        }
        Ok(fetched)
    }

    fn relay_of(chat: ChatId, msg: &Message) -> RelayMessage {
        RelayMessage {
            chat_id: chat,
            message_id: MessageId(msg.id()),
            text: Some(msg.text().to_string()).filter(|t| !t.is_empty()),
        }
    }

    async fn save_session(&self) {
        let client = self.client().await;
        if let Err(e) = client.session().save_to_file(&self.session_path) {
            warn!(account = %self.account, error = %e, "could not save session");
        }
    }

    fn mark_closed(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.cancel();
    }

    // ---- QR login ----------------------------------------------------------

    fn export_request(&self) -> tl::functions::auth::ExportLoginToken {
        tl::functions::auth::ExportLoginToken {
            api_id: self.params.api_id,
            api_hash: self.params.api_hash.clone(),
            except_ids: Vec::new(),
        }
    }

    /// The token was accepted on another device; collect the authorization.
    async fn finish_qr_login(&self) -> Result<SignInOutcome> {
        let client = self.client().await;
        let token = match client.invoke(&self.export_request()).await {
            Ok(token) => token,
            Err(e) => return self.qr_login_error(e).await,
        };
        match token {
            tl::enums::auth::LoginToken::Success(s) => self.qr_login_success(s.authorization, None).await,
            tl::enums::auth::LoginToken::MigrateTo(m) => self.migrate_and_import(m.dc_id, m.token).await,
            tl::enums::auth::LoginToken::Token(_) => Ok(SignInOutcome::Failed(
                "the QR code was not confirmed".to_string(),
            )),
        }
    }

    /// The account lives in another DC: reconnect there and import the token.
    async fn migrate_and_import(&self, dc_id: i32, token: Vec<u8>) -> Result<SignInOutcome> {
        info!(account = %self.account, dc = dc_id, "qr login migrates to home dc");
        let fresh = self.params.connect(session_homed_at(dc_id)).await?;
        let imported = fresh
            .invoke(&tl::functions::auth::ImportLoginToken { token })
            .await;
        *self.client.write().await = fresh;

        match imported {
            Ok(tl::enums::auth::LoginToken::Success(s)) => {
                self.qr_login_success(s.authorization, Some(dc_id)).await
            }
            Ok(_) => Ok(SignInOutcome::Failed(
                "the QR code was not confirmed".to_string(),
            )),
            Err(e) => self.qr_login_error(e).await,
        }
    }

    async fn qr_login_success(
        &self,
        authorization: tl::enums::auth::Authorization,
        dc_id: Option<i32>,
    ) -> Result<SignInOutcome> {
        let tl::enums::auth::Authorization::Authorization(auth) = authorization else {
            return Ok(SignInOutcome::Failed(
                "this account has not finished signing up".to_string(),
            ));
        };
        if let (Some(dc_id), tl::enums::User::User(user)) = (dc_id, &auth.user) {
            self.client()
                .await
                .session()
                .set_user(user.id, dc_id, user.bot);
        }
        self.save_session().await;
        info!(account = %self.account, "signed in with qr code");
        Ok(SignInOutcome::Success)
    }

    async fn qr_login_error(&self, e: InvocationError) -> Result<SignInOutcome> {
        if !needs_password(&e) {
            return Err(external("qr login", e));
        }
        let password = self
            .client()
            .await
            .invoke(&tl::functions::account::GetPassword {})
            .await
            .map_err(|e| external("get password", e))?;
        let tl::enums::account::Password::Password(password) = password;
        *self.login.lock().await = LoginState::AwaitingPassword(PasswordToken::new(password));
        Ok(SignInOutcome::NeedsSecondFactor)
    }
}

#[async_trait]
impl ProtocolClient for MtprotoClient {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        if self.is_connected() && self.is_authorized().await.unwrap_or(false) {
            self.save_session().await;
        }
        self.mark_closed();
        debug!(account = %self.account, "protocol client disconnected");
    }

    async fn log_out(&self) -> Result<()> {
        self.client()
            .await
            .sign_out()
            .await
            .map(|_| ())
            .map_err(|e| external("sign out", e))
    }

    async fn is_authorized(&self) -> Result<bool> {
        self.client()
            .await
            .is_authorized()
            .await
            .map_err(|e| external("authorization check", e))
    }

    async fn get_me(&self) -> Result<AccountProfile> {
        let me = self
            .client()
            .await
            .get_me()
            .await
            .map_err(|e| external("get_me", e))?;
        Ok(AccountProfile {
            first_name: me.first_name().to_string(),
            username: me.username().map(str::to_string),
        })
    }

    async fn send_message(&self, dest: ChatId, message: &RelayMessage) -> Result<()> {
        let to = self.packed(dest).await?;
        let from = self.packed(message.chat_id).await?;

        let input = match self.original(from, message).await? {
            Some(original) => copy_of(&original),
            // Gone at the source; the text we saw is all that is left.
            None => match message.text.as_deref() {
                Some(text) => InputMessage::text(text),
                None => {
                    return Err(Error::NotFound(format!(
                        "message {} in {} no longer exists",
                        message.message_id.0, message.chat_id
                    )))
                }
            },
        };

        self.client()
            .await
            .send_message(to, input)
            .await
            .map_err(|e| external("send", e))?;
        Ok(())
    }

    async fn get_recent_messages(&self, chat: ChatId, limit: usize) -> Result<Vec<RelayMessage>> {
        let packed = self.packed(chat).await?;
        let client = self.client().await;
        let mut iter = client.iter_messages(packed).limit(limit);
        let mut out = Vec::with_capacity(limit);
        while let Some(msg) = iter.next().await.map_err(|e| external("history", e))? {
            self.keep_recent(chat, &msg).await;
            out.push(Self::relay_of(chat, &msg));
        }
        Ok(out)
    }

    async fn get_entity(&self, lookup: &ChatLookup) -> Result<ChatEntity> {
        match lookup {
            ChatLookup::Id(id) => {
                let candidates = id_candidates(*id);
                if let Some((_, entity)) = self.cached(&candidates).await {
                    return Ok(entity);
                }
                self.list_dialogs().await?;
                self.cached(&candidates)
                    .await
                    .map(|(_, entity)| entity)
                    .ok_or_else(|| Error::NotFound(format!("no chat with id {id}")))
            }
            ChatLookup::Username(raw) => {
                let name = normalize_username(raw);
                let chat = self
                    .client()
                    .await
                    .resolve_username(name)
                    .await
                    .map_err(|e| external("resolve username", e))?
                    .ok_or_else(|| Error::NotFound(format!("no chat named {raw}")))?;
                Ok(self.remember(&chat).await.1)
            }
        }
    }

    async fn list_dialogs(&self) -> Result<Vec<ChatEntity>> {
        let client = self.client().await;
        let mut dialogs = client.iter_dialogs();
        let mut out = Vec::new();
        while let Some(dialog) = dialogs.next().await.map_err(|e| external("dialogs", e))? {
            let (_, entity) = self.remember(dialog.chat()).await;
            out.push(entity);
        }
        Ok(out)
    }

    async fn join(&self, entity: &ChatEntity) -> Result<JoinAction> {
        let packed = self.packed(entity.canonical_id).await?;
        let client = self.client().await;
        match entity.kind {
            ChatKind::Bot => {
                client
                    .send_message(packed, "/start")
                    .await
                    .map_err(|e| external("start bot", e))?;
                Ok(JoinAction::StartedBot)
            }
            ChatKind::Channel => {
                client
                    .join_chat(packed)
                    .await
                    .map_err(|e| external("join", e))?;
                Ok(JoinAction::Joined)
            }
            ChatKind::User | ChatKind::Group => Err(Error::InvalidArgument(format!(
                "{} is neither a channel nor a bot",
                entity.display_name()
            ))),
        }
    }

    async fn next_event(&self) -> Option<ClientEvent> {
        let client = self.client().await;
        loop {
            let update = tokio::select! {
                _ = self.closed.cancelled() => return None,
                u = client.next_update() => u,
            };
            match update {
                Ok(Update::NewMessage(msg)) => {
                    let (_, entity) = self.remember(&msg.chat()).await;
                    self.keep_recent(entity.canonical_id, &msg).await;
                    return Some(ClientEvent::NewMessage(Self::relay_of(entity.canonical_id, &msg)));
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(account = %self.account, error = %e, "update stream ended");
                    self.mark_closed();
                    return None;
                }
            }
        }
    }

    async fn send_code(&self, phone: &str) -> Result<()> {
        let token = self
            .client()
            .await
            .request_login_code(phone)
            .await
            .map_err(|e| external("request login code", e))?;
        *self.login.lock().await = LoginState::AwaitingCode(token);
        Ok(())
    }

    async fn sign_in(&self, code: &str) -> Result<SignInOutcome> {
        let state = std::mem::take(&mut *self.login.lock().await);
        let LoginState::AwaitingCode(token) = state else {
            return Err(Error::Auth("no login code was requested".to_string()));
        };

        match self.client().await.sign_in(&token, code.trim()).await {
            Ok(_) => {
                self.save_session().await;
                info!(account = %self.account, "signed in");
                Ok(SignInOutcome::Success)
            }
            Err(SignInError::PasswordRequired(password_token)) => {
                *self.login.lock().await = LoginState::AwaitingPassword(password_token);
                Ok(SignInOutcome::NeedsSecondFactor)
            }
            Err(SignInError::InvalidCode) => {
                Ok(SignInOutcome::Failed("the login code is invalid".to_string()))
            }
            Err(SignInError::SignUpRequired { .. }) => Ok(SignInOutcome::Failed(
                "this phone number has no Telegram account".to_string(),
            )),
            Err(e) => Err(external("sign in", e)),
        }
    }

    async fn check_password(&self, password: &str) -> Result<SignInOutcome> {
        let state = std::mem::take(&mut *self.login.lock().await);
        let LoginState::AwaitingPassword(token) = state else {
            return Err(Error::Auth("no password was requested".to_string()));
        };

        match self
            .client()
            .await
            .check_password(token, password.as_bytes())
            .await
        {
            Ok(_) => {
                self.save_session().await;
                info!(account = %self.account, "signed in with password");
                Ok(SignInOutcome::Success)
            }
            Err(SignInError::InvalidPassword) => {
                Ok(SignInOutcome::Failed("the password is invalid".to_string()))
            }
            Err(e) => Err(external("check password", e)),
        }
    }

    async fn qr_login(&self) -> Result<QrChallenge> {
        let token = self
            .client()
            .await
            .invoke(&self.export_request())
            .await
            .map_err(|e| external("export login token", e))?;
        match token {
            tl::enums::auth::LoginToken::Token(t) => Ok(QrChallenge { url: qr_url(&t.token) }),
            _ => Err(Error::Auth(
                "the provider did not issue a login token".to_string(),
            )),
        }
    }

    async fn wait_qr_login(&self, timeout: Duration) -> Result<SignInOutcome> {
        let deadline = tokio::time::Instant::now() + timeout;
        let client = self.client().await;
        loop {
            let update = tokio::select! {
                _ = self.closed.cancelled() => {
                    return Err(Error::External("connection closed during qr login".to_string()))
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Ok(SignInOutcome::Failed("the QR code was not scanned in time".to_string()))
                }
                u = client.next_update() => u,
            };
            match update {
                Ok(Update::Raw(tl::enums::Update::LoginToken)) => return self.finish_qr_login().await,
                Ok(_) => continue,
                Err(e) => return Err(external("updates", e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usernames_are_normalized() {
        assert_eq!(normalize_username("@chan"), "chan");
        assert_eq!(normalize_username("https://t.me/chan/"), "chan");
        assert_eq!(normalize_username("t.me/chan"), "chan");
        assert_eq!(normalize_username(" chan "), "chan");
    }

    #[test]
    fn numeric_ids_try_every_canonical_form() {
        assert_eq!(
            id_candidates(123),
            vec![ChatId(123), ChatId(-100123), ChatId(-123)]
        );
        assert_eq!(id_candidates(-100123), vec![ChatId(-100123)]);
        assert_eq!(id_candidates(-55), vec![ChatId(-55), ChatId(-10055)]);
    }

    #[test]
    fn packed_types_map_to_chat_kinds() {
        assert_eq!(kind_of(PackedType::Bot), ChatKind::Bot);
        assert_eq!(kind_of(PackedType::Chat), ChatKind::Group);
        assert_eq!(kind_of(PackedType::Megagroup), ChatKind::Channel);
        assert_eq!(kind_of(PackedType::Broadcast), ChatKind::Channel);
    }

    #[test]
    fn qr_tokens_become_login_urls() {
        assert_eq!(qr_url(&[0xfb, 0xff]), "tg://login?token=-_8=");
    }

    #[test]
    fn imported_session_file_is_homed_at_its_dc() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("+1.session");
        let decoded = StringSession {
            dc_id: 4,
            addr: "149.154.167.92:443".parse().unwrap(),
            auth_key: [9; 256],
        };

        write_imported_session(&decoded, &path).unwrap();
        assert!(path.is_file());
        assert!(!path.with_extension("session.part").exists());

        let session = Session::load_file(&path).unwrap();
        assert_eq!(session.get_user().map(|u| u.dc), Some(4));
    }
}
