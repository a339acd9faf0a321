//! Inbox, thread and message model plus the shared ingest path used by
//! inbound sync and outbound send.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

mod ingest;
mod linker;
mod store;
mod threading;

pub use ingest::{IngestOutcome, Ingestor};
pub use linker::{EntityDirectory, EntityLinker, EntityLinks};
pub use store::SqliteMailStore;
pub use threading::{
    CorrelationStrategy, MatchCandidate, SubjectPrefixStrategy, ThreadMatch, ThreadMatcher,
    strip_reply_prefixes,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub address: String,
    pub name: Option<String>,
}

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
        }
    }

    pub fn with_name(address: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            address: address.into(),
            name: if name.trim().is_empty() {
                None
            } else {
                Some(name)
            },
        }
    }
}

/// Attachment metadata only; part content is never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub filename: String,
    pub content_type: String,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "inbound" => Some(Direction::Inbound),
            "outbound" => Some(Direction::Outbound),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImapSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub tls: bool,
    pub skip_tls_verify: bool,
    pub mailbox: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub tls: bool,
    pub skip_tls_verify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inbox {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub imap: Option<ImapSettings>,
    pub smtp: Option<SmtpSettings>,
    pub is_active: bool,
    pub sync_enabled: bool,
    pub poll_interval_minutes: i64,
    pub last_synced_at: Option<i64>,
}

impl Inbox {
    pub fn syncable(&self) -> bool {
        self.is_active && self.sync_enabled
    }

    /// True when the poll interval has elapsed since the last completed sync.
    pub fn is_due(&self, now_ts: i64) -> bool {
        match self.last_synced_at {
            None => true,
            Some(last) => now_ts - last >= self.poll_interval_minutes.max(1) * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInbox {
    pub name: String,
    pub address: String,
    pub imap: Option<ImapSettings>,
    pub smtp: Option<SmtpSettings>,
    pub is_active: bool,
    pub sync_enabled: bool,
    pub poll_interval_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: i64,
    pub inbox_id: i64,
    pub subject: String,
    pub counterpart_address: String,
    pub counterpart_name: Option<String>,
    pub booking_id: Option<i64>,
    pub user_id: Option<i64>,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_archived: bool,
    pub last_message_at: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadFlags {
    pub read: Option<bool>,
    pub starred: Option<bool>,
    pub archived: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewThread {
    pub inbox_id: i64,
    pub subject: String,
    pub counterpart: Address,
    pub links: EntityLinks,
}

#[derive(Debug, Clone)]
pub enum ThreadTarget {
    Existing(i64),
    New(NewThread),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub thread_id: i64,
    pub inbox_id: i64,
    pub subject: String,
    pub from: Address,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub attachments: Vec<AttachmentMeta>,
    pub direction: Direction,
    pub is_read: bool,
    pub is_starred: bool,
    pub sent_by_user_id: Option<i64>,
    pub sent_at: i64,
}

/// A normalized message ready for ingest, from either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub subject: String,
    pub from: Address,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub attachments: Vec<AttachmentMeta>,
    pub direction: Direction,
    pub sent_by_user_id: Option<i64>,
    pub sent_at: i64,
}

impl NewMessage {
    /// The other party of the conversation: sender for inbound mail,
    /// first recipient for outbound mail.
    pub fn counterpart(&self) -> Option<&Address> {
        match self.direction {
            Direction::Inbound => Some(&self.from),
            Direction::Outbound => self.to.first(),
        }
    }

    /// Identifiers that can name this message's parent, most specific first.
    pub fn parent_candidates(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        if let Some(parent) = self.in_reply_to.as_deref() {
            out.push(parent);
        }
        for reference in self.references.iter().rev() {
            if !out.contains(&reference.as_str()) {
                out.push(reference);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Stored {
        message_row_id: i64,
        thread_id: i64,
        thread_created: bool,
    },
    Duplicate,
}

#[async_trait]
pub trait MailStore: Send + Sync {
    async fn get_inbox(&self, inbox_id: i64) -> Result<Option<Inbox>>;
    async fn list_inboxes(&self) -> Result<Vec<Inbox>>;
    async fn mark_inbox_synced(&self, inbox_id: i64, synced_at: i64) -> Result<()>;
    async fn message_exists(&self, message_id: &str) -> Result<bool>;
    async fn find_message(&self, message_id: &str) -> Result<Option<StoredMessage>>;
    async fn get_thread(&self, thread_id: i64) -> Result<Option<Thread>>;
    async fn find_thread_by_subject_prefix(
        &self,
        inbox_id: i64,
        counterpart: &str,
        subject_prefix: &str,
    ) -> Result<Option<Thread>>;
    async fn latest_thread_message(&self, thread_id: i64) -> Result<Option<StoredMessage>>;
    /// Stores `message` under `inbox_id`. The target thread must belong to
    /// the same inbox.
    async fn persist_message(
        &self,
        inbox_id: i64,
        target: ThreadTarget,
        message: &NewMessage,
    ) -> Result<PersistOutcome>;
}

/// Normalizes a Message-ID style value: trims whitespace and angle brackets.
pub fn normalize_message_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_start_matches('<').trim_end_matches('>').trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::{Address, Direction, Inbox, NewMessage, normalize_message_id};

    fn inbox(last_synced_at: Option<i64>) -> Inbox {
        Inbox {
            id: 1,
            name: "Support".to_string(),
            address: "support@biz.com".to_string(),
            imap: None,
            smtp: None,
            is_active: true,
            sync_enabled: true,
            poll_interval_minutes: 5,
            last_synced_at,
        }
    }

    fn message(direction: Direction) -> NewMessage {
        NewMessage {
            message_id: "m1".to_string(),
            in_reply_to: Some("p1".to_string()),
            references: vec!["r0".to_string(), "p1".to_string(), "r2".to_string()],
            subject: "Hello".to_string(),
            from: Address::new("support@biz.com"),
            to: vec![Address::new("client@example.com")],
            cc: Vec::new(),
            text_body: None,
            html_body: None,
            attachments: Vec::new(),
            direction,
            sent_by_user_id: None,
            sent_at: 0,
        }
    }

    #[test]
    fn inbox_due_after_poll_interval() {
        assert!(inbox(None).is_due(0));
        assert!(!inbox(Some(1_000)).is_due(1_000 + 299));
        assert!(inbox(Some(1_000)).is_due(1_000 + 300));
    }

    #[test]
    fn counterpart_depends_on_direction() {
        assert_eq!(
            message(Direction::Inbound).counterpart().map(|a| a.address.as_str()),
            Some("support@biz.com")
        );
        assert_eq!(
            message(Direction::Outbound).counterpart().map(|a| a.address.as_str()),
            Some("client@example.com")
        );
    }

    #[test]
    fn parent_candidates_prefer_in_reply_to_then_newest_reference() {
        let msg = message(Direction::Inbound);
        assert_eq!(msg.parent_candidates(), vec!["p1", "r2", "r0"]);
    }

    #[test]
    fn message_ids_are_stored_bare() {
        assert_eq!(
            normalize_message_id(" <abc@host> "),
            Some("abc@host".to_string())
        );
        assert_eq!(normalize_message_id("<>"), None);
    }

    #[test]
    fn blank_display_names_are_dropped() {
        assert_eq!(Address::with_name("a@b.c", "  ").name, None);
        assert_eq!(
            Address::with_name("a@b.c", "Alice").name.as_deref(),
            Some("Alice")
        );
    }
}
