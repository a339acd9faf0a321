use std::sync::Arc;

use anyhow::anyhow;
use serde::Serialize;
use tracing::{info, warn};

use inboxsync_content::{NO_SUBJECT, new_message_id};
use inboxsync_core::{
    Address, Direction, IngestOutcome, Ingestor, MailStore, NewMessage, Thread,
    normalize_message_id, now_ts,
};

use crate::MailTransportConnector;
use crate::smtp_transport::{Outgoing, compose, parse_address_list};

const FALLBACK_DOMAIN: &str = "inboxsync.local";

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("inbox {0} not found")]
    InboxNotFound(i64),
    #[error("inbox {0} has no SMTP settings")]
    MissingTransportConfig(i64),
    #[error("no recipients")]
    NoRecipients,
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("thread {0} not found in this inbox")]
    ThreadNotFound(i64),
    #[error("compose failed: {0}")]
    Compose(anyhow::Error),
    #[error("transport failed: {0}")]
    Transport(anyhow::Error),
    #[error("store error: {0}")]
    Store(anyhow::Error),
}

#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub inbox_id: i64,
    /// Each entry may be a single address, `Name <addr>`, or a comma list.
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub text: String,
    pub html: Option<String>,
    /// Identifier of the message being answered, with or without brackets.
    pub in_reply_to: Option<String>,
    pub thread_id: Option<i64>,
    pub sent_by_user_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendReceipt {
    pub success: bool,
    pub message_id: String,
    pub thread_id: i64,
    pub thread_created: bool,
}

/// Transmits first, then records the message in the same threads inbound
/// sync uses. Nothing is stored when the transport rejects the message.
#[derive(Clone)]
pub struct Sender {
    ingestor: Ingestor,
    transports: Arc<dyn MailTransportConnector>,
}

impl Sender {
    pub fn new(ingestor: Ingestor, transports: Arc<dyn MailTransportConnector>) -> Self {
        Self {
            ingestor,
            transports,
        }
    }

    fn store(&self) -> &Arc<dyn MailStore> {
        self.ingestor.store()
    }

    pub async fn send(&self, request: &SendRequest) -> Result<SendReceipt, SendError> {
        let inbox = self
            .store()
            .get_inbox(request.inbox_id)
            .await
            .map_err(SendError::Store)?
            .ok_or(SendError::InboxNotFound(request.inbox_id))?;
        let smtp = inbox
            .smtp
            .clone()
            .ok_or(SendError::MissingTransportConfig(inbox.id))?;

        let to = parse_recipients(&request.to)?;
        let cc = parse_recipients(&request.cc)?;
        if to.is_empty() {
            return Err(SendError::NoRecipients);
        }

        let thread = match request.thread_id {
            Some(thread_id) => Some(self.thread_in_inbox(thread_id, inbox.id).await?),
            None => None,
        };
        let in_reply_to = match request.in_reply_to.as_deref().and_then(normalize_message_id) {
            Some(parent) => Some(parent),
            None => match &thread {
                Some(thread) => self
                    .store()
                    .latest_thread_message(thread.id)
                    .await
                    .map_err(SendError::Store)?
                    .map(|latest| latest.message_id),
                None => None,
            },
        };
        let references = self.references_for(in_reply_to.as_deref()).await?;

        let subject = match request.subject.trim() {
            "" => NO_SUBJECT.to_string(),
            subject => subject.to_string(),
        };
        let from = Address::with_name(inbox.address.as_str(), inbox.name.as_str());
        let message_id = new_message_id(address_domain(&inbox.address));
        let email = compose(&Outgoing {
            from: &from,
            to: &to,
            cc: &cc,
            subject: &subject,
            text: &request.text,
            html: request.html.as_deref(),
            message_id: &message_id,
            in_reply_to: in_reply_to.as_deref(),
            references: &references,
        })
        .map_err(SendError::Compose)?;

        let transport = self
            .transports
            .transport(&smtp)
            .map_err(SendError::Transport)?;
        if let Err(err) = transport.send(email).await {
            warn!(inbox_id = inbox.id, error = %err, "send rejected by transport");
            return Err(SendError::Transport(err));
        }

        let message = NewMessage {
            message_id: message_id.clone(),
            in_reply_to,
            references,
            subject,
            from,
            to,
            cc,
            text_body: Some(request.text.clone()),
            html_body: request.html.clone(),
            attachments: Vec::new(),
            direction: Direction::Outbound,
            sent_by_user_id: request.sent_by_user_id,
            sent_at: now_ts(),
        };
        let outcome = self
            .ingestor
            .ingest(&inbox, &message, thread.as_ref().map(|t| t.id))
            .await
            .map_err(SendError::Store)?;
        match outcome {
            IngestOutcome::Stored {
                thread_id,
                thread_created,
                ..
            } => {
                info!(inbox_id = inbox.id, message_id = %message_id, thread_id, "message sent");
                Ok(SendReceipt {
                    success: true,
                    message_id,
                    thread_id,
                    thread_created,
                })
            }
            IngestOutcome::Duplicate => Err(SendError::Store(anyhow!(
                "sent message {} already stored",
                message_id
            ))),
        }
    }

    async fn thread_in_inbox(&self, thread_id: i64, inbox_id: i64) -> Result<Thread, SendError> {
        self.store()
            .get_thread(thread_id)
            .await
            .map_err(SendError::Store)?
            .filter(|thread| thread.inbox_id == inbox_id)
            .ok_or(SendError::ThreadNotFound(thread_id))
    }

    /// The parent's own parent followed by the parent, when the parent is stored.
    async fn references_for(&self, parent: Option<&str>) -> Result<Vec<String>, SendError> {
        let Some(parent) = parent else {
            return Ok(Vec::new());
        };
        let stored = self
            .store()
            .find_message(parent)
            .await
            .map_err(SendError::Store)?;
        let mut references = Vec::new();
        if let Some(grandparent) = stored.and_then(|m| m.in_reply_to) {
            references.push(grandparent);
        }
        references.push(parent.to_string());
        Ok(references)
    }
}

fn parse_recipients(fields: &[String]) -> Result<Vec<Address>, SendError> {
    let mut out = Vec::new();
    for field in fields {
        let parsed = parse_address_list(field)
            .map_err(|_| SendError::InvalidAddress(field.trim().to_string()))?;
        out.extend(parsed);
    }
    Ok(out)
}

fn address_domain(address: &str) -> &str {
    match address.rsplit_once('@') {
        Some((_, domain)) if !domain.trim().is_empty() => domain.trim(),
        _ => FALLBACK_DOMAIN,
    }
}
