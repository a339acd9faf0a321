use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, info, warn};

use inboxsync_content::parse_message;
use inboxsync_core::{Inbox, IngestOutcome, Ingestor, MailStore, now_ts};

use crate::{MailSource, MailSourceConnector};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("inbox {0} not found")]
    InboxNotFound(i64),
    #[error("inbox {0} is inactive or has sync disabled")]
    SyncDisabled(i64),
    #[error("inbox {0} has no IMAP settings")]
    MissingSourceConfig(i64),
    #[error("inbox {0} is already syncing")]
    AlreadyRunning(i64),
    #[error("connect failed: {0}")]
    Connect(anyhow::Error),
    #[error("fetch failed: {0}")]
    Fetch(anyhow::Error),
    #[error("store error: {0}")]
    Store(anyhow::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub fetched: usize,
    pub stored: usize,
    pub duplicates: usize,
    pub parse_failures: usize,
    pub threads_created: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct InboxOutcome {
    pub inbox_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<SyncReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FleetReport {
    pub successful: usize,
    pub failed: usize,
    pub inboxes: Vec<InboxOutcome>,
}

/// Pulls mail for configured inboxes through the shared ingest path.
#[derive(Clone)]
pub struct SyncEngine {
    ingestor: Ingestor,
    connector: Arc<dyn MailSourceConnector>,
    running: InboxLocks,
}

impl SyncEngine {
    pub fn new(ingestor: Ingestor, connector: Arc<dyn MailSourceConnector>) -> Self {
        Self {
            ingestor,
            connector,
            running: InboxLocks::default(),
        }
    }

    fn store(&self) -> &Arc<dyn MailStore> {
        self.ingestor.store()
    }

    pub async fn sync_inbox(&self, inbox_id: i64) -> Result<SyncReport, SyncError> {
        let inbox = self
            .store()
            .get_inbox(inbox_id)
            .await
            .map_err(SyncError::Store)?
            .ok_or(SyncError::InboxNotFound(inbox_id))?;
        if !inbox.syncable() {
            return Err(SyncError::SyncDisabled(inbox_id));
        }
        let settings = inbox
            .imap
            .clone()
            .ok_or(SyncError::MissingSourceConfig(inbox_id))?;
        let _guard = self
            .running
            .try_acquire(inbox_id)
            .ok_or(SyncError::AlreadyRunning(inbox_id))?;

        debug!(inbox_id, host = %settings.host, "sync start");
        let mut source = self
            .connector
            .connect(&settings)
            .await
            .map_err(SyncError::Connect)?;
        let result = self.process_source(&inbox, source.as_mut()).await;
        if let Err(err) = source.close().await {
            warn!(inbox_id, error = %err, "mail source close failed");
        }
        let report = result?;

        self.store()
            .mark_inbox_synced(inbox_id, now_ts())
            .await
            .map_err(SyncError::Store)?;
        info!(
            inbox_id,
            fetched = report.fetched,
            stored = report.stored,
            duplicates = report.duplicates,
            parse_failures = report.parse_failures,
            threads_created = report.threads_created,
            "sync done"
        );
        Ok(report)
    }

    async fn process_source(
        &self,
        inbox: &Inbox,
        source: &mut dyn MailSource,
    ) -> Result<SyncReport, SyncError> {
        let raw_messages = source.fetch_all().await.map_err(SyncError::Fetch)?;
        let mut report = SyncReport {
            fetched: raw_messages.len(),
            ..SyncReport::default()
        };
        for (index, raw) in raw_messages.iter().enumerate() {
            let message = match parse_message(raw) {
                Ok(message) => message,
                Err(err) => {
                    warn!(inbox_id = inbox.id, index, error = %err, "skipping unparseable message");
                    report.parse_failures += 1;
                    continue;
                }
            };
            match self
                .ingestor
                .ingest(inbox, &message, None)
                .await
                .map_err(SyncError::Store)?
            {
                IngestOutcome::Stored { thread_created, .. } => {
                    report.stored += 1;
                    if thread_created {
                        report.threads_created += 1;
                    }
                }
                IngestOutcome::Duplicate => report.duplicates += 1,
            }
        }
        Ok(report)
    }

    /// Syncs every active, sync-enabled inbox concurrently. A failing inbox
    /// is counted and reported without affecting the others.
    pub async fn sync_all(&self) -> Result<FleetReport, SyncError> {
        let inboxes = self.store().list_inboxes().await.map_err(SyncError::Store)?;
        let ids = inboxes
            .iter()
            .filter(|inbox| inbox.syncable())
            .map(|inbox| inbox.id)
            .collect();
        Ok(self.sync_many(ids).await)
    }

    /// Like [`SyncEngine::sync_all`], restricted to inboxes whose poll
    /// interval has elapsed at `now`.
    pub async fn sync_due(&self, now: i64) -> Result<FleetReport, SyncError> {
        let inboxes = self.store().list_inboxes().await.map_err(SyncError::Store)?;
        let ids = inboxes
            .iter()
            .filter(|inbox| inbox.syncable() && inbox.is_due(now))
            .map(|inbox| inbox.id)
            .collect();
        Ok(self.sync_many(ids).await)
    }

    async fn sync_many(&self, inbox_ids: Vec<i64>) -> FleetReport {
        let mut handles = Vec::with_capacity(inbox_ids.len());
        for inbox_id in inbox_ids {
            let engine = self.clone();
            let handle = tokio::spawn(async move { engine.sync_inbox(inbox_id).await });
            handles.push((inbox_id, handle));
        }

        let mut fleet = FleetReport::default();
        for (inbox_id, handle) in handles {
            let outcome = match handle.await {
                Ok(Ok(report)) => {
                    fleet.successful += 1;
                    InboxOutcome {
                        inbox_id,
                        report: Some(report),
                        error: None,
                    }
                }
                Ok(Err(err)) => {
                    warn!(inbox_id, error = %err, "inbox sync failed");
                    fleet.failed += 1;
                    InboxOutcome {
                        inbox_id,
                        report: None,
                        error: Some(err.to_string()),
                    }
                }
                Err(err) => {
                    warn!(inbox_id, error = %err, "inbox sync task aborted");
                    fleet.failed += 1;
                    InboxOutcome {
                        inbox_id,
                        report: None,
                        error: Some(err.to_string()),
                    }
                }
            };
            fleet.inboxes.push(outcome);
        }
        fleet.inboxes.sort_by_key(|outcome| outcome.inbox_id);
        fleet
    }
}

#[derive(Clone, Default)]
struct InboxLocks {
    running: Arc<Mutex<HashSet<i64>>>,
}

impl InboxLocks {
    fn try_acquire(&self, inbox_id: i64) -> Option<InboxLockGuard> {
        if !lock_set(&self.running).insert(inbox_id) {
            return None;
        }
        Some(InboxLockGuard {
            running: self.running.clone(),
            inbox_id,
        })
    }
}

struct InboxLockGuard {
    running: Arc<Mutex<HashSet<i64>>>,
    inbox_id: i64,
}

impl Drop for InboxLockGuard {
    fn drop(&mut self) {
        lock_set(&self.running).remove(&self.inbox_id);
    }
}

fn lock_set(running: &Mutex<HashSet<i64>>) -> MutexGuard<'_, HashSet<i64>> {
    running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
