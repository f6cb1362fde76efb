//! In-memory fakes for the protocol and messaging ports.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{AccountId, ChatEntity, ChatId, ChatLookup, MessageId, MessageRef},
    errors::Error,
    messaging::{
        port::MessagingPort,
        types::{InlineKeyboard, MessagingCapabilities},
    },
    protocol::{
        AccountProfile, ClientEvent, JoinAction, ProtocolClient, ProtocolConnector, QrChallenge,
        RelayMessage, SignInOutcome,
    },
    Result,
};

pub fn relay(chat: i64, id: i32) -> RelayMessage {
    RelayMessage {
        chat_id: ChatId(chat),
        message_id: MessageId(id),
        text: Some(format!("message {id}")),
    }
}

#[derive(Clone, Debug)]
pub struct SentRelay {
    pub dest: ChatId,
    pub message: RelayMessage,
    pub at: Instant,
    pub ok: bool,
}

pub struct FakeClient {
    connected: AtomicBool,
    authorized: AtomicBool,
    logged_out: AtomicBool,
    sends: StdMutex<Vec<SentRelay>>,
    failing: StdMutex<HashSet<ChatId>>,
    recent: StdMutex<HashMap<ChatId, Vec<RelayMessage>>>,
    fetch_fails: AtomicBool,
    fetches: AtomicUsize,
    entities: StdMutex<Vec<ChatEntity>>,
    dialogs: StdMutex<Vec<ChatEntity>>,
    joins: StdMutex<Vec<ChatId>>,
    codes_requested: StdMutex<Vec<String>>,
    sign_in: StdMutex<VecDeque<SignInOutcome>>,
    password: StdMutex<VecDeque<SignInOutcome>>,
    qr_outcome: StdMutex<Option<SignInOutcome>>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    events_rx: Mutex<mpsc::UnboundedReceiver<ClientEvent>>,
    closed: CancellationToken,
}

impl Default for FakeClient {
    fn default() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            connected: AtomicBool::new(true),
            authorized: AtomicBool::new(true),
            logged_out: AtomicBool::new(false),
            sends: StdMutex::new(Vec::new()),
            failing: StdMutex::new(HashSet::new()),
            recent: StdMutex::new(HashMap::new()),
            fetch_fails: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
            entities: StdMutex::new(Vec::new()),
            dialogs: StdMutex::new(Vec::new()),
            joins: StdMutex::new(Vec::new()),
            codes_requested: StdMutex::new(Vec::new()),
            sign_in: StdMutex::new(VecDeque::new()),
            password: StdMutex::new(VecDeque::new()),
            qr_outcome: StdMutex::new(None),
            events_tx,
            events_rx: Mutex::new(events_rx),
            closed: CancellationToken::new(),
        }
    }
}

impl FakeClient {
    pub fn unauthorized() -> Self {
        let client = Self::default();
        client.authorized.store(false, Ordering::SeqCst);
        client
    }

    /// Simulate the transport going away.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.cancel();
    }

    pub fn push_event(&self, msg: RelayMessage) {
        let _ = self.events_tx.send(ClientEvent::NewMessage(msg));
    }

    pub fn fail_sends_to(&self, chat: ChatId) {
        self.failing.lock().unwrap().insert(chat);
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fetch_fails.store(fail, Ordering::SeqCst);
    }

    pub fn set_recent(&self, chat: ChatId, messages: Vec<RelayMessage>) {
        self.recent.lock().unwrap().insert(chat, messages);
    }

    pub fn add_entity(&self, entity: ChatEntity) {
        self.entities.lock().unwrap().push(entity);
    }

    pub fn add_dialog(&self, entity: ChatEntity) {
        self.dialogs.lock().unwrap().push(entity);
    }

    pub fn script_sign_in(&self, outcome: SignInOutcome) {
        self.sign_in.lock().unwrap().push_back(outcome);
    }

    pub fn script_password(&self, outcome: SignInOutcome) {
        self.password.lock().unwrap().push_back(outcome);
    }

    /// `None` keeps QR waits pending until their timeout.
    pub fn set_qr_outcome(&self, outcome: Option<SignInOutcome>) {
        *self.qr_outcome.lock().unwrap() = outcome;
    }

    pub fn sends(&self) -> Vec<SentRelay> {
        self.sends.lock().unwrap().clone()
    }

    pub fn sent_dests(&self) -> Vec<ChatId> {
        self.sends().into_iter().map(|s| s.dest).collect()
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn joins(&self) -> Vec<ChatId> {
        self.joins.lock().unwrap().clone()
    }

    pub fn codes_requested(&self) -> Vec<String> {
        self.codes_requested.lock().unwrap().clone()
    }

    pub fn was_logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }

    fn outcome(&self, outcome: SignInOutcome) -> SignInOutcome {
        if outcome == SignInOutcome::Success {
            self.authorized.store(true, Ordering::SeqCst);
        }
        outcome
    }
}

#[async_trait]
impl ProtocolClient for FakeClient {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.drop_connection();
    }

    async fn log_out(&self) -> Result<()> {
        self.logged_out.store(true, Ordering::SeqCst);
        self.authorized.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_authorized(&self) -> Result<bool> {
        Ok(self.authorized.load(Ordering::SeqCst))
    }

    async fn get_me(&self) -> Result<AccountProfile> {
        Ok(AccountProfile {
            first_name: "Tester".to_string(),
            username: Some("tester".to_string()),
        })
    }

    async fn send_message(&self, dest: ChatId, message: &RelayMessage) -> Result<()> {
        let ok = !self.failing.lock().unwrap().contains(&dest);
        self.sends.lock().unwrap().push(SentRelay {
            dest,
            message: message.clone(),
            at: Instant::now(),
            ok,
        });
        if ok {
            Ok(())
        } else {
            Err(Error::External(format!("cannot write to {dest}")))
        }
    }

    async fn get_recent_messages(&self, chat: ChatId, limit: usize) -> Result<Vec<RelayMessage>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fetch_fails.load(Ordering::SeqCst) {
            return Err(Error::External("fetch failed".to_string()));
        }
        let recent = self.recent.lock().unwrap();
        Ok(recent
            .get(&chat)
            .map(|msgs| msgs.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_entity(&self, lookup: &ChatLookup) -> Result<ChatEntity> {
        let entities = self.entities.lock().unwrap();
        let found = entities.iter().find(|e| match lookup {
            ChatLookup::Id(id) => e.id_forms().contains(&ChatId(*id)),
            ChatLookup::Username(name) => {
                let name = name.trim_start_matches('@');
                e.username.as_deref() == Some(name)
            }
        });
        found
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no entity for {lookup}")))
    }

    async fn list_dialogs(&self) -> Result<Vec<ChatEntity>> {
        Ok(self.dialogs.lock().unwrap().clone())
    }

    async fn join(&self, entity: &ChatEntity) -> Result<JoinAction> {
        self.joins.lock().unwrap().push(entity.canonical_id);
        match entity.kind {
            crate::domain::ChatKind::Bot => Ok(JoinAction::StartedBot),
            crate::domain::ChatKind::Channel => Ok(JoinAction::Joined),
            _ => Err(Error::InvalidArgument("not a channel or bot".to_string())),
        }
    }

    async fn next_event(&self) -> Option<ClientEvent> {
        let mut rx = self.events_rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => None,
            ev = rx.recv() => ev,
        }
    }

    async fn send_code(&self, phone: &str) -> Result<()> {
        self.codes_requested.lock().unwrap().push(phone.to_string());
        Ok(())
    }

    async fn sign_in(&self, _code: &str) -> Result<SignInOutcome> {
        let next = self.sign_in.lock().unwrap().pop_front();
        Ok(self.outcome(next.unwrap_or(SignInOutcome::Success)))
    }

    async fn check_password(&self, _password: &str) -> Result<SignInOutcome> {
        let next = self.password.lock().unwrap().pop_front();
        Ok(self.outcome(next.unwrap_or(SignInOutcome::Success)))
    }

    async fn qr_login(&self) -> Result<QrChallenge> {
        Ok(QrChallenge {
            url: "tg://login?token=fake".to_string(),
        })
    }

    async fn wait_qr_login(&self, timeout: Duration) -> Result<SignInOutcome> {
        let outcome = self.qr_outcome.lock().unwrap().clone();
        match outcome {
            Some(outcome) => Ok(self.outcome(outcome)),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(SignInOutcome::Failed("timed out".to_string()))
            }
        }
    }
}

/// Hands out prepared clients per account; unknown accounts get a fresh,
/// authorized client.
#[derive(Default)]
pub struct FakeConnector {
    prepared: StdMutex<HashMap<AccountId, VecDeque<Arc<FakeClient>>>>,
    opened: StdMutex<Vec<(AccountId, Arc<FakeClient>)>>,
    imported: StdMutex<Vec<(AccountId, String)>>,
}

impl FakeConnector {
    pub fn prepare(&self, account: &AccountId, client: Arc<FakeClient>) {
        self.prepared
            .lock()
            .unwrap()
            .entry(account.clone())
            .or_default()
            .push_back(client);
    }

    pub fn opened(&self) -> Vec<(AccountId, Arc<FakeClient>)> {
        self.opened.lock().unwrap().clone()
    }

    pub fn imported(&self) -> Vec<(AccountId, String)> {
        self.imported.lock().unwrap().clone()
    }

    pub fn last_opened(&self, account: &AccountId) -> Option<Arc<FakeClient>> {
        self.opened()
            .into_iter()
            .rev()
            .find(|(a, _)| a == account)
            .map(|(_, c)| c)
    }
}

#[async_trait]
impl ProtocolConnector for FakeConnector {
    async fn open(&self, account: &AccountId) -> Result<Arc<dyn ProtocolClient>> {
        let client = self
            .prepared
            .lock()
            .unwrap()
            .get_mut(account)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| Arc::new(FakeClient::default()));
        self.opened
            .lock()
            .unwrap()
            .push((account.clone(), client.clone()));
        Ok(client)
    }

    /// Accepts strings with the `1` version prefix, like real exports.
    async fn import_session(&self, account: &AccountId, encoded: &str) -> Result<()> {
        if !encoded.starts_with('1') {
            return Err(Error::InvalidArgument("unsupported session string".to_string()));
        }
        self.imported
            .lock()
            .unwrap()
            .push((account.clone(), encoded.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeMessenger {
    next_id: AtomicI32,
    html: StdMutex<Vec<(ChatId, String)>>,
    keyboards: StdMutex<Vec<(ChatId, String, InlineKeyboard)>>,
    documents: StdMutex<Vec<(ChatId, String)>>,
    copies: StdMutex<Vec<(ChatId, MessageRef)>>,
    failing: StdMutex<HashSet<ChatId>>,
}

impl FakeMessenger {
    pub fn fail_chat(&self, chat: ChatId) {
        self.failing.lock().unwrap().insert(chat);
    }

    pub fn sent_html(&self) -> Vec<(ChatId, String)> {
        self.html.lock().unwrap().clone()
    }

    pub fn keyboards(&self) -> Vec<(ChatId, String, InlineKeyboard)> {
        self.keyboards.lock().unwrap().clone()
    }

    pub fn documents(&self) -> Vec<(ChatId, String)> {
        self.documents.lock().unwrap().clone()
    }

    pub fn copies(&self) -> Vec<(ChatId, MessageRef)> {
        self.copies.lock().unwrap().clone()
    }

    fn check(&self, chat: ChatId) -> Result<MessageRef> {
        if self.failing.lock().unwrap().contains(&chat) {
            return Err(Error::External(format!("bot blocked by {chat}")));
        }
        Ok(MessageRef {
            chat_id: chat,
            message_id: MessageId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1),
        })
    }
}

#[async_trait]
impl MessagingPort for FakeMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            supports_html: true,
            supports_edit: true,
            supports_inline_keyboards: true,
            supports_documents: true,
            max_message_len: 4096,
        }
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        let msg = self.check(chat_id)?;
        self.html.lock().unwrap().push((chat_id, html.to_string()));
        Ok(msg)
    }

    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()> {
        self.html
            .lock()
            .unwrap()
            .push((msg.chat_id, html.to_string()));
        Ok(())
    }

    async fn delete_message(&self, _msg: MessageRef) -> Result<()> {
        Ok(())
    }

    async fn send_inline_keyboard(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        let msg = self.check(chat_id)?;
        self.keyboards
            .lock()
            .unwrap()
            .push((chat_id, html.to_string(), keyboard));
        Ok(msg)
    }

    async fn answer_callback_query(
        &self,
        _callback_id: &str,
        _text: Option<&str>,
        _alert: bool,
    ) -> Result<()> {
        Ok(())
    }

    async fn send_document(
        &self,
        chat_id: ChatId,
        path: &Path,
        _caption: &str,
    ) -> Result<MessageRef> {
        let msg = self.check(chat_id)?;
        self.documents
            .lock()
            .unwrap()
            .push((chat_id, path.display().to_string()));
        Ok(msg)
    }

    async fn copy_message(&self, to: ChatId, from: MessageRef) -> Result<()> {
        self.check(to)?;
        self.copies.lock().unwrap().push((to, from));
        Ok(())
    }
}
