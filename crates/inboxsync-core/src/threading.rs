//! Thread matching.
//!
//! Parent identifiers (`In-Reply-To`, then `References`) are authoritative.
//! Without one, a [`CorrelationStrategy`] guesses the conversation; the
//! default compares subjects with reply/forward prefixes removed.

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::{MailStore, NewMessage, Thread};

const REPLY_PREFIXES: [&str; 3] = ["re:", "fwd:", "fw:"];

/// Removes leading `Re:`, `Fwd:` and `Fw:` prefixes, case-insensitively and
/// repeatedly, so `"RE: Fwd: re: Quote"` becomes `"Quote"`.
pub fn strip_reply_prefixes(subject: &str) -> &str {
    let mut rest = subject.trim();
    loop {
        let mut stripped = false;
        for prefix in REPLY_PREFIXES {
            let Some(head) = rest.get(..prefix.len()) else {
                continue;
            };
            if head.eq_ignore_ascii_case(prefix) {
                rest = rest[prefix.len()..].trim_start();
                stripped = true;
                break;
            }
        }
        if !stripped {
            return rest;
        }
    }
}

pub struct MatchCandidate<'a> {
    pub inbox_id: i64,
    pub counterpart: &'a str,
    pub subject: &'a str,
}

#[async_trait]
pub trait CorrelationStrategy: Send + Sync {
    async fn correlate(
        &self,
        store: &dyn MailStore,
        candidate: &MatchCandidate<'_>,
    ) -> Result<Option<Thread>>;
}

/// Same inbox, same counterpart, and the thread subject starts with the
/// message subject once reply prefixes are gone. Most recently active wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubjectPrefixStrategy;

#[async_trait]
impl CorrelationStrategy for SubjectPrefixStrategy {
    async fn correlate(
        &self,
        store: &dyn MailStore,
        candidate: &MatchCandidate<'_>,
    ) -> Result<Option<Thread>> {
        let subject = strip_reply_prefixes(candidate.subject);
        if subject.is_empty() || candidate.counterpart.trim().is_empty() {
            return Ok(None);
        }
        store
            .find_thread_by_subject_prefix(candidate.inbox_id, candidate.counterpart, subject)
            .await
    }
}

#[derive(Debug, Clone)]
pub enum ThreadMatch {
    /// A stored message named by the parent headers owns the thread.
    Parent(Thread),
    Correlated(Thread),
    NoThread,
}

impl ThreadMatch {
    pub fn thread(&self) -> Option<&Thread> {
        match self {
            ThreadMatch::Parent(thread) | ThreadMatch::Correlated(thread) => Some(thread),
            ThreadMatch::NoThread => None,
        }
    }
}

pub struct ThreadMatcher {
    strategy: Box<dyn CorrelationStrategy>,
}

impl Default for ThreadMatcher {
    fn default() -> Self {
        Self::new(Box::new(SubjectPrefixStrategy))
    }
}

impl ThreadMatcher {
    pub fn new(strategy: Box<dyn CorrelationStrategy>) -> Self {
        Self { strategy }
    }

    pub async fn resolve(
        &self,
        store: &dyn MailStore,
        inbox_id: i64,
        message: &NewMessage,
    ) -> Result<ThreadMatch> {
        if let Some(thread) = self.resolve_parent(store, inbox_id, message).await? {
            return Ok(ThreadMatch::Parent(thread));
        }
        let Some(counterpart) = message.counterpart() else {
            return Ok(ThreadMatch::NoThread);
        };
        let candidate = MatchCandidate {
            inbox_id,
            counterpart: &counterpart.address,
            subject: &message.subject,
        };
        Ok(match self.strategy.correlate(store, &candidate).await? {
            Some(thread) => ThreadMatch::Correlated(thread),
            None => ThreadMatch::NoThread,
        })
    }

    /// Parents stored under another inbox are ignored.
    async fn resolve_parent(
        &self,
        store: &dyn MailStore,
        inbox_id: i64,
        message: &NewMessage,
    ) -> Result<Option<Thread>> {
        for parent_id in message.parent_candidates() {
            let Some(parent) = store.find_message(parent_id).await? else {
                continue;
            };
            match store.get_thread(parent.thread_id).await? {
                Some(thread) if thread.inbox_id == inbox_id => return Ok(Some(thread)),
                Some(thread) => {
                    debug!(
                        inbox_id,
                        parent_id,
                        thread_id = thread.id,
                        "parent belongs to another inbox"
                    );
                }
                None => {}
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::{ThreadMatch, ThreadMatcher, strip_reply_prefixes};
    use crate::store::tests::{fresh_store, inbound, support_inbox};
    use crate::{Address, Direction, EntityLinks, MailStore, NewThread, PersistOutcome, ThreadTarget};

    #[test]
    fn strips_repeated_prefixes_case_insensitively() {
        assert_eq!(strip_reply_prefixes("Re: Event Inquiry"), "Event Inquiry");
        assert_eq!(strip_reply_prefixes("RE: fwd: Fw:re:Quote"), "Quote");
        assert_eq!(strip_reply_prefixes("Reunion dinner"), "Reunion dinner");
        assert_eq!(strip_reply_prefixes("AW: Angebot"), "AW: Angebot");
        assert_eq!(strip_reply_prefixes("Re:"), "");
    }

    async fn seed_thread(
        store: &crate::SqliteMailStore,
        inbox_id: i64,
        message_id: &str,
        subject: &str,
        counterpart: &str,
        sent_at: i64,
    ) -> anyhow::Result<i64> {
        let outcome = store
            .persist_message(
                inbox_id,
                ThreadTarget::New(NewThread {
                    inbox_id,
                    subject: subject.to_string(),
                    counterpart: Address::new(counterpart),
                    links: EntityLinks::default(),
                }),
                &inbound(message_id, counterpart, subject, sent_at),
            )
            .await?;
        match outcome {
            PersistOutcome::Stored { thread_id, .. } => Ok(thread_id),
            PersistOutcome::Duplicate => anyhow::bail!("unexpected duplicate"),
        }
    }

    #[tokio::test]
    async fn parent_header_wins_over_subject() -> anyhow::Result<()> {
        let (store, db_path) = fresh_store().await?;
        let inbox = store.upsert_inbox(&support_inbox()).await?;
        let first = seed_thread(&store, inbox.id, "a1", "Band hire", "x@example.com", 100).await?;
        seed_thread(&store, inbox.id, "b1", "Totally different", "x@example.com", 200).await?;

        let mut reply = inbound("a2", "x@example.com", "Re: Totally different", 300);
        reply.in_reply_to = Some("a1".to_string());
        let matched = ThreadMatcher::default()
            .resolve(&store, inbox.id, &reply)
            .await?;
        assert!(matches!(matched, ThreadMatch::Parent(ref t) if t.id == first));
        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn references_are_used_when_in_reply_to_is_unknown() -> anyhow::Result<()> {
        let (store, db_path) = fresh_store().await?;
        let inbox = store.upsert_inbox(&support_inbox()).await?;
        let first = seed_thread(&store, inbox.id, "a1", "Band hire", "x@example.com", 100).await?;

        let mut reply = inbound("a3", "y@example.com", "New subject", 300);
        reply.in_reply_to = Some("missing@elsewhere".to_string());
        reply.references = vec!["a1".to_string(), "missing@elsewhere".to_string()];
        let matched = ThreadMatcher::default()
            .resolve(&store, inbox.id, &reply)
            .await?;
        assert_eq!(matched.thread().map(|t| t.id), Some(first));
        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn parent_in_another_inbox_falls_back_to_subject() -> anyhow::Result<()> {
        let (store, db_path) = fresh_store().await?;
        let sales = store.upsert_inbox(&support_inbox()).await?;
        let mut events_inbox = support_inbox();
        events_inbox.address = "events@biz.com".to_string();
        let events = store.upsert_inbox(&events_inbox).await?;
        seed_thread(&store, sales.id, "p1", "Catering", "client@example.com", 100).await?;
        let own =
            seed_thread(&store, events.id, "p0", "Catering", "client@example.com", 50).await?;

        let mut reply = inbound("r1", "client@example.com", "Re: Catering", 300);
        reply.in_reply_to = Some("p1".to_string());
        let matched = ThreadMatcher::default()
            .resolve(&store, events.id, &reply)
            .await?;
        assert!(matches!(matched, ThreadMatch::Correlated(ref t) if t.id == own));

        let mut stray = inbound("r2", "nobody@example.com", "Unrelated", 400);
        stray.references = vec!["p1".to_string()];
        assert!(matches!(
            ThreadMatcher::default()
                .resolve(&store, events.id, &stray)
                .await?,
            ThreadMatch::NoThread
        ));
        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn subject_fallback_picks_most_recent_thread_for_counterpart() -> anyhow::Result<()> {
        let (store, db_path) = fresh_store().await?;
        let inbox = store.upsert_inbox(&support_inbox()).await?;
        seed_thread(&store, inbox.id, "e1", "Event Inquiry", "client@example.com", 100).await?;
        let newer =
            seed_thread(&store, inbox.id, "e2", "Event Inquiry", "client@example.com", 500).await?;
        seed_thread(&store, inbox.id, "e3", "Event Inquiry", "other@example.com", 900).await?;

        let reply = inbound("e4", "client@example.com", "Re: Event Inquiry", 1_000);
        let matched = ThreadMatcher::default()
            .resolve(&store, inbox.id, &reply)
            .await?;
        assert!(matches!(matched, ThreadMatch::Correlated(ref t) if t.id == newer));
        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn outbound_matches_on_recipient() -> anyhow::Result<()> {
        let (store, db_path) = fresh_store().await?;
        let inbox = store.upsert_inbox(&support_inbox()).await?;
        let thread =
            seed_thread(&store, inbox.id, "q1", "Quote request", "client@example.com", 100).await?;

        let mut outbound = inbound("q2", "support@biz.com", "RE: Quote request", 200);
        outbound.direction = Direction::Outbound;
        outbound.to = vec![Address::new("client@example.com")];
        let matched = ThreadMatcher::default()
            .resolve(&store, inbox.id, &outbound)
            .await?;
        assert_eq!(matched.thread().map(|t| t.id), Some(thread));
        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn unrelated_message_needs_new_thread() -> anyhow::Result<()> {
        let (store, db_path) = fresh_store().await?;
        let inbox = store.upsert_inbox(&support_inbox()).await?;
        seed_thread(&store, inbox.id, "e1", "Event Inquiry", "client@example.com", 100).await?;

        let fresh = inbound("n1", "client@example.com", "Invoice", 200);
        assert!(matches!(
            ThreadMatcher::default()
                .resolve(&store, inbox.id, &fresh)
                .await?,
            ThreadMatch::NoThread
        ));
        let blank = inbound("n2", "client@example.com", "Re: ", 200);
        assert!(matches!(
            ThreadMatcher::default()
                .resolve(&store, inbox.id, &blank)
                .await?,
            ThreadMatch::NoThread
        ));
        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
