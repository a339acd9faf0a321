use std::sync::Arc;

use anyhow::{Result, anyhow};
use tracing::debug;

use crate::{
    EntityLinker, Inbox, MailStore, NewMessage, NewThread, PersistOutcome, ThreadMatch,
    ThreadMatcher, ThreadTarget,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored {
        message_row_id: i64,
        thread_id: i64,
        thread_created: bool,
    },
    Duplicate,
}

/// Dedup check, thread resolution, linking and persistence for one message.
/// Inbound sync and outbound send both go through here so their messages
/// land in the same threads.
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn MailStore>,
    matcher: Arc<ThreadMatcher>,
    linker: EntityLinker,
}

impl Ingestor {
    pub fn new(store: Arc<dyn MailStore>, matcher: Arc<ThreadMatcher>, linker: EntityLinker) -> Self {
        Self {
            store,
            matcher,
            linker,
        }
    }

    pub fn store(&self) -> &Arc<dyn MailStore> {
        &self.store
    }

    /// `thread_hint` pins the message to a known thread and skips matching.
    pub async fn ingest(
        &self,
        inbox: &Inbox,
        message: &NewMessage,
        thread_hint: Option<i64>,
    ) -> Result<IngestOutcome> {
        if self.store.message_exists(&message.message_id).await? {
            debug!(inbox_id = inbox.id, message_id = %message.message_id, "duplicate skipped");
            return Ok(IngestOutcome::Duplicate);
        }

        let target = match thread_hint {
            Some(thread_id) => ThreadTarget::Existing(thread_id),
            None => {
                let matched = self
                    .matcher
                    .resolve(self.store.as_ref(), inbox.id, message)
                    .await?;
                match matched {
                    ThreadMatch::Parent(thread) | ThreadMatch::Correlated(thread) => {
                        ThreadTarget::Existing(thread.id)
                    }
                    ThreadMatch::NoThread => self.new_thread(inbox, message).await?,
                }
            }
        };

        let outcome = self.store.persist_message(inbox.id, target, message).await?;
        Ok(match outcome {
            PersistOutcome::Stored {
                message_row_id,
                thread_id,
                thread_created,
            } => {
                debug!(
                    inbox_id = inbox.id,
                    message_id = %message.message_id,
                    thread_id,
                    thread_created,
                    "message stored"
                );
                IngestOutcome::Stored {
                    message_row_id,
                    thread_id,
                    thread_created,
                }
            }
            PersistOutcome::Duplicate => IngestOutcome::Duplicate,
        })
    }

    async fn new_thread(&self, inbox: &Inbox, message: &NewMessage) -> Result<ThreadTarget> {
        let counterpart = message
            .counterpart()
            .cloned()
            .ok_or_else(|| anyhow!("message {} has no counterpart", message.message_id))?;
        let links = self.linker.link(&counterpart.address).await;
        Ok(ThreadTarget::New(NewThread {
            inbox_id: inbox.id,
            subject: message.subject.clone(),
            counterpart,
            links,
        }))
    }
}
