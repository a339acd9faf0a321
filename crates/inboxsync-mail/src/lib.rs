//! Mail protocol integration (IMAP in, SMTP out), inbox sync and send.

use anyhow::Result;
use async_trait::async_trait;
use lettre::Message;

use inboxsync_core::{ImapSettings, SmtpSettings};

mod imap_source;
mod send;
mod smtp_transport;
mod sync;

pub use imap_source::ImapConnector;
pub use send::{SendError, SendReceipt, SendRequest, Sender};
pub use smtp_transport::SmtpConnector;
pub use sync::{FleetReport, InboxOutcome, SyncEngine, SyncError, SyncReport};

/// An open mailbox session. Dropped sessions are not guaranteed to log out;
/// callers close explicitly.
#[async_trait]
pub trait MailSource: Send {
    /// Every message currently in the mailbox, raw, in retrieval order.
    async fn fetch_all(&mut self) -> Result<Vec<Vec<u8>>>;
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait MailSourceConnector: Send + Sync {
    async fn connect(&self, settings: &ImapSettings) -> Result<Box<dyn MailSource>>;
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, email: Message) -> Result<()>;
}

/// Builds a fresh transport for each send from the inbox's own settings.
pub trait MailTransportConnector: Send + Sync {
    fn transport(&self, settings: &SmtpSettings) -> Result<Box<dyn MailTransport>>;
}
