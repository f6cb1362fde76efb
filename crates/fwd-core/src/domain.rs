use std::fmt;

use serde::{Deserialize, Serialize};

/// Phone number / account identity of a logged-in user account.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(phone: impl Into<String>) -> Self {
        Self(phone.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Telegram user id of a controller-bot user (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

/// Telegram chat id (numeric, canonical form when stored).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Telegram message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub i32);

/// A stable reference to a Telegram message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// Kind of chat returned by an entity lookup.
///
/// `Channel` covers both broadcast channels and megagroups.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChatKind {
    User,
    Group,
    Channel,
    Bot,
}

const CHANNEL_PREFIX: &str = "-100";

/// Normalize a raw provider id to the canonical chat id used for storage and
/// comparison.
///
/// Channels and megagroups get the `-100` prefix, basic groups are negated,
/// users and bots keep their raw id. Already-canonical ids are returned as is.
pub fn canonical_chat_id(kind: ChatKind, raw_id: i64) -> ChatId {
    match kind {
        ChatKind::Channel => {
            let raw = raw_id.to_string();
            if raw.starts_with(CHANNEL_PREFIX) {
                return ChatId(raw_id);
            }
            format!("{CHANNEL_PREFIX}{}", raw_id.unsigned_abs())
                .parse::<i64>()
                .map(ChatId)
                .unwrap_or(ChatId(raw_id))
        }
        ChatKind::Group if raw_id > 0 => ChatId(-raw_id),
        ChatKind::Group | ChatKind::User | ChatKind::Bot => ChatId(raw_id),
    }
}

/// Tagged result of an entity lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatEntity {
    pub kind: ChatKind,
    pub raw_id: i64,
    pub canonical_id: ChatId,
    pub title: Option<String>,
    pub username: Option<String>,
}

impl ChatEntity {
    pub fn new(kind: ChatKind, raw_id: i64) -> Self {
        Self {
            kind,
            raw_id,
            canonical_id: canonical_chat_id(kind, raw_id),
            title: None,
            username: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Both forms an id may have been stored under.
    pub fn id_forms(&self) -> [ChatId; 2] {
        [ChatId(self.raw_id), self.canonical_id]
    }

    /// Name to show to a user: title, then `@username`, then the id.
    pub fn display_name(&self) -> String {
        if let Some(title) = self.title.as_deref().filter(|t| !t.is_empty()) {
            return title.to_string();
        }
        if let Some(username) = self.username.as_deref().filter(|u| !u.is_empty()) {
            return format!("@{username}");
        }
        self.canonical_id.to_string()
    }

    pub fn is_group_like(&self) -> bool {
        matches!(self.kind, ChatKind::Group | ChatKind::Channel)
    }
}

/// How a user referred to a chat in a command argument.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatLookup {
    Id(i64),
    Username(String),
}

impl ChatLookup {
    /// Numeric arguments (optionally negative) are ids, everything else is a
    /// username or link.
    pub fn parse(input: &str) -> Option<Self> {
        let s = input.trim();
        if s.is_empty() {
            return None;
        }
        let digits = s.strip_prefix('-').unwrap_or(s);
        if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
            return s.parse::<i64>().ok().map(ChatLookup::Id);
        }
        Some(ChatLookup::Username(s.to_string()))
    }
}

impl fmt::Display for ChatLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatLookup::Id(id) => write!(f, "{id}"),
            ChatLookup::Username(name) => f.write_str(name),
        }
    }
}
