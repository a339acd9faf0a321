use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use imap::{ClientBuilder, ConnectionMode};
use tracing::{debug, warn};

use inboxsync_core::ImapSettings;

use crate::{MailSource, MailSourceConnector};

pub const DEFAULT_MAILBOX: &str = "INBOX";
const DEFAULT_FETCH_CHUNK_SIZE: usize = 25;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(300);

type ImapSession = imap::Session<imap::Connection>;

/// Opens blocking `imap` sessions on the tokio blocking pool.
#[derive(Debug, Clone)]
pub struct ImapConnector {
    default_mailbox: String,
    fetch_chunk_size: usize,
    connect_timeout: Duration,
    fetch_timeout: Duration,
}

impl Default for ImapConnector {
    fn default() -> Self {
        Self {
            default_mailbox: DEFAULT_MAILBOX.to_string(),
            fetch_chunk_size: DEFAULT_FETCH_CHUNK_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

impl ImapConnector {
    pub fn new(default_mailbox: &str, fetch_chunk_size: usize, connect_timeout: Duration) -> Self {
        Self {
            default_mailbox: default_mailbox.to_string(),
            fetch_chunk_size: fetch_chunk_size.max(1),
            connect_timeout,
            ..Self::default()
        }
    }

    /// Upper bound for one full mailbox fetch.
    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }
}

#[async_trait]
impl MailSourceConnector for ImapConnector {
    async fn connect(&self, settings: &ImapSettings) -> Result<Box<dyn MailSource>> {
        let mailbox = settings
            .mailbox
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.default_mailbox.clone());
        let connect_settings = settings.clone();
        let host = settings.host.clone();
        let connected = blocking_with_deadline(
            self.connect_timeout,
            move || imap_connect(&connect_settings),
            move |late: Result<ImapSession>| {
                if let Ok(session) = late {
                    warn!(host = %host, "imap login finished after timeout, logging out");
                    logout_quietly(session);
                }
            },
        )
        .await?;
        let session = connected.ok_or_else(|| {
            anyhow!(
                "IMAP connect to {}:{} timed out",
                settings.host,
                settings.port
            )
        })??;
        Ok(Box::new(ImapMailbox {
            session: Some(session),
            mailbox,
            fetch_chunk_size: self.fetch_chunk_size,
            fetch_timeout: self.fetch_timeout,
        }))
    }
}

struct ImapMailbox {
    session: Option<ImapSession>,
    mailbox: String,
    fetch_chunk_size: usize,
    fetch_timeout: Duration,
}

#[async_trait]
impl MailSource for ImapMailbox {
    async fn fetch_all(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| anyhow!("IMAP session already closed"))?;
        let mailbox = self.mailbox.clone();
        let chunk_size = self.fetch_chunk_size;
        let finished = blocking_with_deadline(
            self.fetch_timeout,
            move || {
                let fetched = fetch_mailbox(&mut session, &mailbox, chunk_size);
                (session, fetched)
            },
            |(session, _): (ImapSession, Result<Vec<Vec<u8>>>)| logout_quietly(session),
        )
        .await?;
        // On timeout the session stays with the blocking task and `close` is a no-op.
        let (session, fetched) = finished.ok_or_else(|| {
            anyhow!(
                "IMAP fetch of {} timed out after {}s",
                self.mailbox,
                self.fetch_timeout.as_secs()
            )
        })?;
        self.session = Some(session);
        fetched
    }

    async fn close(&mut self) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || session.logout()).await??;
        debug!("imap logout");
        Ok(())
    }
}

/// Runs blocking work on the blocking pool, giving up after `limit`.
/// Returns `None` on timeout; the result of work that finishes later is
/// handed to `late` on the blocking pool instead of being dropped.
async fn blocking_with_deadline<T, W, L>(limit: Duration, work: W, late: L) -> Result<Option<T>>
where
    T: Send + 'static,
    W: FnOnce() -> T + Send + 'static,
    L: FnOnce(T) + Send + 'static,
{
    let mut handle = tokio::task::spawn_blocking(work);
    match tokio::time::timeout(limit, &mut handle).await {
        Ok(joined) => Ok(Some(joined?)),
        Err(_) => {
            tokio::spawn(async move {
                if let Ok(value) = handle.await {
                    let _ = tokio::task::spawn_blocking(move || late(value)).await;
                }
            });
            Ok(None)
        }
    }
}

fn logout_quietly(mut session: ImapSession) {
    if let Err(err) = session.logout() {
        debug!(error = %err, "imap logout failed");
    }
}

fn imap_connect(imap: &ImapSettings) -> Result<ImapSession> {
    debug!(host = %imap.host, port = imap.port, "imap connect start");
    let mode = if imap.tls {
        ConnectionMode::Tls
    } else {
        ConnectionMode::AutoTls
    };
    let client = ClientBuilder::new(imap.host.as_str(), imap.port)
        .tls_kind(imap::TlsKind::Native)
        .mode(mode)
        .danger_skip_tls_verify(imap.skip_tls_verify)
        .connect()?;
    let session = client
        .login(&imap.username, &imap.password)
        .map_err(|e| e.0)?;
    debug!(host = %imap.host, "imap login ok");
    Ok(session)
}

fn fetch_mailbox(
    session: &mut ImapSession,
    mailbox: &str,
    fetch_chunk_size: usize,
) -> Result<Vec<Vec<u8>>> {
    let selected = session.select(mailbox)?;
    debug!(mailbox, exists = selected.exists, "imap mailbox selected");
    if selected.exists == 0 {
        return Ok(Vec::new());
    }
    let mut uids: Vec<u32> = session.uid_search("ALL")?.into_iter().collect();
    uids.sort_unstable();

    let mut raw_messages = Vec::with_capacity(uids.len());
    for chunk in uids.chunks(fetch_chunk_size.max(1)) {
        debug!(mailbox, count = chunk.len(), "imap uid fetch");
        let fetches = session.uid_fetch(uid_set(chunk), "(UID BODY.PEEK[])")?;
        for fetch in fetches.iter() {
            match fetch.body() {
                Some(body) => raw_messages.push(body.to_vec()),
                None => debug!(mailbox, uid = ?fetch.uid, "imap fetch without body"),
            }
        }
    }
    Ok(raw_messages)
}

fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(|uid| uid.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::{ImapConnector, blocking_with_deadline, uid_set};

    #[test]
    fn uid_set_is_comma_separated() {
        assert_eq!(uid_set(&[3, 9, 27]), "3,9,27");
        assert_eq!(uid_set(&[]), "");
    }

    #[test]
    fn connector_never_uses_empty_chunks() {
        let connector = ImapConnector::new("INBOX", 0, Duration::from_secs(5));
        assert_eq!(connector.fetch_chunk_size, 1);
    }

    #[test]
    fn fetch_timeout_defaults_and_overrides() {
        let connector = ImapConnector::new("INBOX", 10, Duration::from_secs(5));
        assert_eq!(connector.fetch_timeout, Duration::from_secs(300));
        let connector = connector.with_fetch_timeout(Duration::from_secs(20));
        assert_eq!(connector.fetch_timeout, Duration::from_secs(20));
    }

    #[tokio::test]
    async fn slow_blocking_work_is_handed_to_late_handler() -> anyhow::Result<()> {
        let (late_tx, late_rx) = oneshot::channel();
        let outcome = blocking_with_deadline(
            Duration::from_millis(20),
            || {
                std::thread::sleep(Duration::from_millis(200));
                "session"
            },
            move |value| {
                let _ = late_tx.send(value);
            },
        )
        .await?;
        assert!(outcome.is_none());
        let late = tokio::time::timeout(Duration::from_secs(5), late_rx).await??;
        assert_eq!(late, "session");
        Ok(())
    }

    #[tokio::test]
    async fn fast_blocking_work_skips_late_handler() -> anyhow::Result<()> {
        let (late_tx, late_rx) = oneshot::channel::<u32>();
        let outcome = blocking_with_deadline(
            Duration::from_secs(5),
            || 7,
            move |value| {
                let _ = late_tx.send(value);
            },
        )
        .await?;
        assert_eq!(outcome, Some(7));
        assert!(late_rx.await.is_err());
        Ok(())
    }
}
