use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::{
    Address, AttachmentMeta, Direction, EntityDirectory, ImapSettings, Inbox, MailStore, NewInbox,
    NewMessage, PersistOutcome, SmtpSettings, StoredMessage, Thread, ThreadFlags, ThreadTarget,
    now_ts,
};

const INBOX_COLUMNS: &str = "id, name, address, imap_host, imap_port, imap_username, imap_password,
     imap_tls, imap_skip_tls_verify, imap_mailbox, smtp_host, smtp_port, smtp_username,
     smtp_password, smtp_tls, smtp_skip_tls_verify, is_active, sync_enabled,
     poll_interval_minutes, last_synced_at";

const THREAD_COLUMNS: &str = "id, inbox_id, subject, counterpart_address, counterpart_name,
     booking_id, user_id, is_read, is_starred, is_archived, last_message_at, created_at";

const MESSAGE_COLUMNS: &str = "id, message_id, in_reply_to, thread_id, inbox_id, subject,
     from_address, from_name, to_json, cc_json, text_body, html_body, attachments_json,
     direction, is_read, is_starred, sent_by_user_id, sent_at";

#[derive(Clone)]
pub struct SqliteMailStore {
    pool: SqlitePool,
}

impl SqliteMailStore {
    pub async fn connect(path: &str) -> Result<Self> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{}", path)
        };
        let options = SqliteConnectOptions::new()
            .filename(url.trim_start_matches("sqlite:"))
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Inserts or updates an inbox keyed by address, compared without case.
    /// Sync metadata is kept.
    pub async fn upsert_inbox(&self, inbox: &NewInbox) -> Result<Inbox> {
        let address = inbox.address.trim();
        let imap = inbox.imap.as_ref();
        let smtp = inbox.smtp.as_ref();
        sqlx::query(
            "INSERT INTO inboxes (name, address, imap_host, imap_port, imap_username, imap_password,
               imap_tls, imap_skip_tls_verify, imap_mailbox, smtp_host, smtp_port, smtp_username,
               smtp_password, smtp_tls, smtp_skip_tls_verify, is_active, sync_enabled,
               poll_interval_minutes, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(address) DO UPDATE SET
               name = excluded.name,
               imap_host = excluded.imap_host,
               imap_port = excluded.imap_port,
               imap_username = excluded.imap_username,
               imap_password = excluded.imap_password,
               imap_tls = excluded.imap_tls,
               imap_skip_tls_verify = excluded.imap_skip_tls_verify,
               imap_mailbox = excluded.imap_mailbox,
               smtp_host = excluded.smtp_host,
               smtp_port = excluded.smtp_port,
               smtp_username = excluded.smtp_username,
               smtp_password = excluded.smtp_password,
               smtp_tls = excluded.smtp_tls,
               smtp_skip_tls_verify = excluded.smtp_skip_tls_verify,
               is_active = excluded.is_active,
               sync_enabled = excluded.sync_enabled,
               poll_interval_minutes = excluded.poll_interval_minutes",
        )
        .bind(&inbox.name)
        .bind(address)
        .bind(imap.map(|i| i.host.clone()))
        .bind(imap.map(|i| i.port as i64))
        .bind(imap.map(|i| i.username.clone()))
        .bind(imap.map(|i| i.password.clone()))
        .bind(imap.map(|i| if i.tls { 1 } else { 0 }).unwrap_or(1))
        .bind(imap.map(|i| if i.skip_tls_verify { 1 } else { 0 }).unwrap_or(0))
        .bind(imap.and_then(|i| i.mailbox.clone()))
        .bind(smtp.map(|s| s.host.clone()))
        .bind(smtp.map(|s| s.port as i64))
        .bind(smtp.map(|s| s.username.clone()))
        .bind(smtp.map(|s| s.password.clone()))
        .bind(smtp.map(|s| if s.tls { 1 } else { 0 }).unwrap_or(0))
        .bind(smtp.map(|s| if s.skip_tls_verify { 1 } else { 0 }).unwrap_or(0))
        .bind(if inbox.is_active { 1 } else { 0 })
        .bind(if inbox.sync_enabled { 1 } else { 0 })
        .bind(inbox.poll_interval_minutes.max(1))
        .bind(now_ts())
        .execute(&self.pool)
        .await?;

        let query = format!("SELECT {} FROM inboxes WHERE address = ?", INBOX_COLUMNS);
        let row = sqlx::query(&query)
            .bind(address)
            .fetch_one(&self.pool)
            .await?;
        inbox_from_row(&row)
    }

    pub async fn inbox_by_address(&self, address: &str) -> Result<Option<Inbox>> {
        let query = format!(
            "SELECT {} FROM inboxes WHERE address = ?",
            INBOX_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(address.trim())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(inbox_from_row).transpose()
    }

    pub async fn list_threads(
        &self,
        inbox_id: i64,
        include_archived: bool,
        limit: Option<i64>,
    ) -> Result<Vec<Thread>> {
        let mut query = format!("SELECT {} FROM threads WHERE inbox_id = ?", THREAD_COLUMNS);
        if !include_archived {
            query.push_str(" AND is_archived = 0");
        }
        query.push_str(" ORDER BY last_message_at DESC, id DESC");
        if limit.is_some() {
            query.push_str(" LIMIT ?");
        }
        let mut q = sqlx::query(&query).bind(inbox_id);
        if let Some(limit) = limit {
            q = q.bind(limit);
        }
        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(thread_from_row).collect()
    }

    /// Messages of one thread, oldest first, regardless of direction.
    pub async fn thread_messages(&self, thread_id: i64) -> Result<Vec<StoredMessage>> {
        let query = format!(
            "SELECT {} FROM messages WHERE thread_id = ? ORDER BY sent_at ASC, id ASC",
            MESSAGE_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(thread_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(message_from_row).collect()
    }

    pub async fn count_messages(&self, inbox_id: i64) -> Result<i64> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM messages WHERE inbox_id = ?")
            .bind(inbox_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    pub async fn set_thread_flags(&self, thread_id: i64, flags: &ThreadFlags) -> Result<()> {
        let result = sqlx::query(
            "UPDATE threads SET
               is_read = COALESCE(?, is_read),
               is_starred = COALESCE(?, is_starred),
               is_archived = COALESCE(?, is_archived)
             WHERE id = ?",
        )
        .bind(flags.read.map(|v| if v { 1 } else { 0 }))
        .bind(flags.starred.map(|v| if v { 1 } else { 0 }))
        .bind(flags.archived.map(|v| if v { 1 } else { 0 }))
        .bind(thread_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("thread {} not found", thread_id));
        }
        Ok(())
    }

    pub async fn set_thread_booking(&self, thread_id: i64, booking_id: Option<i64>) -> Result<()> {
        let result = sqlx::query("UPDATE threads SET booking_id = ? WHERE id = ?")
            .bind(booking_id)
            .bind(thread_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("thread {} not found", thread_id));
        }
        Ok(())
    }

    pub async fn set_message_flags(
        &self,
        message_row_id: i64,
        read: Option<bool>,
        starred: Option<bool>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE messages SET
               is_read = COALESCE(?, is_read),
               is_starred = COALESCE(?, is_starred)
             WHERE id = ?",
        )
        .bind(read.map(|v| if v { 1 } else { 0 }))
        .bind(starred.map(|v| if v { 1 } else { 0 }))
        .bind(message_row_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("message {} not found", message_row_id));
        }
        Ok(())
    }
}

#[async_trait]
impl MailStore for SqliteMailStore {
    async fn get_inbox(&self, inbox_id: i64) -> Result<Option<Inbox>> {
        let query = format!("SELECT {} FROM inboxes WHERE id = ?", INBOX_COLUMNS);
        let row = sqlx::query(&query)
            .bind(inbox_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(inbox_from_row).transpose()
    }

    async fn list_inboxes(&self) -> Result<Vec<Inbox>> {
        let query = format!("SELECT {} FROM inboxes ORDER BY id", INBOX_COLUMNS);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(inbox_from_row).collect()
    }

    async fn mark_inbox_synced(&self, inbox_id: i64, synced_at: i64) -> Result<()> {
        sqlx::query("UPDATE inboxes SET last_synced_at = ? WHERE id = ?")
            .bind(synced_at)
            .bind(inbox_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn message_exists(&self, message_id: &str) -> Result<bool> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT 1 FROM messages WHERE message_id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn find_message(&self, message_id: &str) -> Result<Option<StoredMessage>> {
        let query = format!(
            "SELECT {} FROM messages WHERE message_id = ?",
            MESSAGE_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn get_thread(&self, thread_id: i64) -> Result<Option<Thread>> {
        let query = format!("SELECT {} FROM threads WHERE id = ?", THREAD_COLUMNS);
        let row = sqlx::query(&query)
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(thread_from_row).transpose()
    }

    async fn find_thread_by_subject_prefix(
        &self,
        inbox_id: i64,
        counterpart: &str,
        subject_prefix: &str,
    ) -> Result<Option<Thread>> {
        let query = format!(
            "SELECT {} FROM threads
             WHERE inbox_id = ? AND lower(counterpart_address) = lower(?)
               AND subject LIKE ? ESCAPE '\\'
             ORDER BY last_message_at DESC, id DESC LIMIT 1",
            THREAD_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(inbox_id)
            .bind(counterpart.trim())
            .bind(format!("{}%", escape_like(subject_prefix)))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(thread_from_row).transpose()
    }

    async fn latest_thread_message(&self, thread_id: i64) -> Result<Option<StoredMessage>> {
        let query = format!(
            "SELECT {} FROM messages WHERE thread_id = ? ORDER BY sent_at DESC, id DESC LIMIT 1",
            MESSAGE_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn persist_message(
        &self,
        inbox_id: i64,
        target: ThreadTarget,
        message: &NewMessage,
    ) -> Result<PersistOutcome> {
        let now = now_ts();
        let inbound = message.direction == Direction::Inbound;
        let mut tx = self.pool.begin().await?;

        let (thread_id, thread_created) = match target {
            ThreadTarget::Existing(id) => {
                let owner =
                    sqlx::query_as::<_, (i64,)>("SELECT inbox_id FROM threads WHERE id = ?")
                        .bind(id)
                        .fetch_optional(&mut *tx)
                        .await?
                        .map(|row| row.0)
                        .ok_or_else(|| anyhow!("thread {} not found", id))?;
                if owner != inbox_id {
                    bail!("thread {} does not belong to inbox {}", id, inbox_id);
                }
                (id, false)
            }
            ThreadTarget::New(thread) => {
                if thread.inbox_id != inbox_id {
                    bail!(
                        "new thread for inbox {} stored under inbox {}",
                        thread.inbox_id,
                        inbox_id
                    );
                }
                let result = sqlx::query(
                    "INSERT INTO threads (inbox_id, subject, counterpart_address, counterpart_name,
                       booking_id, user_id, is_read, last_message_at, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(thread.inbox_id)
                .bind(&thread.subject)
                .bind(&thread.counterpart.address)
                .bind(&thread.counterpart.name)
                .bind(thread.links.booking_id)
                .bind(thread.links.user_id)
                .bind(if inbound { 0 } else { 1 })
                .bind(message.sent_at)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                (result.last_insert_rowid(), true)
            }
        };

        let inserted = sqlx::query(
            "INSERT INTO messages (message_id, in_reply_to, thread_id, inbox_id, subject,
               from_address, from_name, to_json, cc_json, text_body, html_body, attachments_json,
               direction, is_read, sent_by_user_id, sent_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(message_id) DO NOTHING",
        )
        .bind(&message.message_id)
        .bind(&message.in_reply_to)
        .bind(thread_id)
        .bind(inbox_id)
        .bind(&message.subject)
        .bind(&message.from.address)
        .bind(&message.from.name)
        .bind(serde_json::to_string(&message.to)?)
        .bind(serde_json::to_string(&message.cc)?)
        .bind(&message.text_body)
        .bind(&message.html_body)
        .bind(serde_json::to_string(&message.attachments)?)
        .bind(message.direction.as_str())
        .bind(if inbound { 0 } else { 1 })
        .bind(message.sent_by_user_id)
        .bind(message.sent_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            // Lost a race with another writer; dropping tx discards any new thread.
            return Ok(PersistOutcome::Duplicate);
        }
        let message_row_id = inserted.last_insert_rowid();

        sqlx::query(
            "UPDATE threads SET
               last_message_at = MAX(last_message_at, ?),
               is_read = CASE WHEN ? = 1 THEN 0 ELSE is_read END
             WHERE id = ?",
        )
        .bind(message.sent_at)
        .bind(if inbound { 1 } else { 0 })
        .bind(thread_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(PersistOutcome::Stored {
            message_row_id,
            thread_id,
            thread_created,
        })
    }
}

#[async_trait]
impl EntityDirectory for SqliteMailStore {
    async fn find_booking_by_email(&self, email: &str) -> Result<Option<i64>> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT id FROM bookings WHERE lower(email) = lower(?)
             ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<i64>> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT id FROM users WHERE lower(email) = lower(?) ORDER BY id LIMIT 1",
        )
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0))
    }
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn flag(row: &SqliteRow, column: &str) -> Result<bool> {
    Ok(row.try_get::<i64, _>(column)? != 0)
}

fn inbox_from_row(row: &SqliteRow) -> Result<Inbox> {
    let imap = match row.try_get::<Option<String>, _>("imap_host")? {
        Some(host) => Some(ImapSettings {
            host,
            port: row.try_get::<Option<i64>, _>("imap_port")?.unwrap_or(993) as u16,
            username: row
                .try_get::<Option<String>, _>("imap_username")?
                .unwrap_or_default(),
            password: row
                .try_get::<Option<String>, _>("imap_password")?
                .unwrap_or_default(),
            tls: flag(row, "imap_tls")?,
            skip_tls_verify: flag(row, "imap_skip_tls_verify")?,
            mailbox: row.try_get("imap_mailbox")?,
        }),
        None => None,
    };
    let smtp = match row.try_get::<Option<String>, _>("smtp_host")? {
        Some(host) => Some(SmtpSettings {
            host,
            port: row.try_get::<Option<i64>, _>("smtp_port")?.unwrap_or(587) as u16,
            username: row
                .try_get::<Option<String>, _>("smtp_username")?
                .unwrap_or_default(),
            password: row
                .try_get::<Option<String>, _>("smtp_password")?
                .unwrap_or_default(),
            tls: flag(row, "smtp_tls")?,
            skip_tls_verify: flag(row, "smtp_skip_tls_verify")?,
        }),
        None => None,
    };
    Ok(Inbox {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        address: row.try_get("address")?,
        imap,
        smtp,
        is_active: flag(row, "is_active")?,
        sync_enabled: flag(row, "sync_enabled")?,
        poll_interval_minutes: row.try_get("poll_interval_minutes")?,
        last_synced_at: row.try_get("last_synced_at")?,
    })
}

fn thread_from_row(row: &SqliteRow) -> Result<Thread> {
    Ok(Thread {
        id: row.try_get("id")?,
        inbox_id: row.try_get("inbox_id")?,
        subject: row.try_get("subject")?,
        counterpart_address: row.try_get("counterpart_address")?,
        counterpart_name: row.try_get("counterpart_name")?,
        booking_id: row.try_get("booking_id")?,
        user_id: row.try_get("user_id")?,
        is_read: flag(row, "is_read")?,
        is_starred: flag(row, "is_starred")?,
        is_archived: flag(row, "is_archived")?,
        last_message_at: row.try_get("last_message_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<StoredMessage> {
    let direction: String = row.try_get("direction")?;
    let to: String = row.try_get("to_json")?;
    let cc: String = row.try_get("cc_json")?;
    let attachments: String = row.try_get("attachments_json")?;
    Ok(StoredMessage {
        id: row.try_get("id")?,
        message_id: row.try_get("message_id")?,
        in_reply_to: row.try_get("in_reply_to")?,
        thread_id: row.try_get("thread_id")?,
        inbox_id: row.try_get("inbox_id")?,
        subject: row.try_get("subject")?,
        from: Address {
            address: row.try_get("from_address")?,
            name: row.try_get("from_name")?,
        },
        to: serde_json::from_str::<Vec<Address>>(&to)?,
        cc: serde_json::from_str::<Vec<Address>>(&cc)?,
        text_body: row.try_get("text_body")?,
        html_body: row.try_get("html_body")?,
        attachments: serde_json::from_str::<Vec<AttachmentMeta>>(&attachments)?,
        direction: Direction::parse(&direction)
            .ok_or_else(|| anyhow!("unknown message direction {}", direction))?,
        is_read: flag(row, "is_read")?,
        is_starred: flag(row, "is_starred")?,
        sent_by_user_id: row.try_get("sent_by_user_id")?,
        sent_at: row.try_get("sent_at")?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use sqlx::Row;

    use super::SqliteMailStore;
    use crate::{
        Address, Direction, EntityDirectory, EntityLinks, MailStore, NewInbox, NewMessage,
        NewThread, PersistOutcome, ThreadFlags, ThreadTarget,
    };

    fn temp_db_path() -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!(
            "inboxsync-core-{}-{}.db",
            std::process::id(),
            ts
        ))
    }

    pub(crate) async fn fresh_store() -> anyhow::Result<(SqliteMailStore, PathBuf)> {
        let db_path = temp_db_path();
        let _ = std::fs::remove_file(&db_path);
        let store = SqliteMailStore::connect(
            db_path
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("invalid temp db path"))?,
        )
        .await?;
        store.init().await?;
        Ok((store, db_path))
    }

    pub(crate) fn support_inbox() -> NewInbox {
        NewInbox {
            name: "Support".to_string(),
            address: "support@biz.com".to_string(),
            imap: None,
            smtp: None,
            is_active: true,
            sync_enabled: true,
            poll_interval_minutes: 5,
        }
    }

    pub(crate) fn inbound(message_id: &str, from: &str, subject: &str, sent_at: i64) -> NewMessage {
        NewMessage {
            message_id: message_id.to_string(),
            in_reply_to: None,
            references: Vec::new(),
            subject: subject.to_string(),
            from: Address::new(from),
            to: vec![Address::new("support@biz.com")],
            cc: Vec::new(),
            text_body: Some("hello".to_string()),
            html_body: None,
            attachments: Vec::new(),
            direction: Direction::Inbound,
            sent_by_user_id: None,
            sent_at,
        }
    }

    fn new_thread(inbox_id: i64, subject: &str, counterpart: &str) -> ThreadTarget {
        ThreadTarget::New(NewThread {
            inbox_id,
            subject: subject.to_string(),
            counterpart: Address::new(counterpart),
            links: EntityLinks::default(),
        })
    }

    #[tokio::test]
    async fn init_creates_message_identifier_unique_index() -> anyhow::Result<()> {
        let (store, db_path) = fresh_store().await?;
        let rows = sqlx::query_as::<_, (i64, String, String, i64, Option<String>, i64)>(
            "PRAGMA table_info(messages)",
        )
        .fetch_all(&store.pool)
        .await?;
        let columns: HashSet<String> = rows.into_iter().map(|row| row.1).collect();
        for required in [
            "message_id",
            "in_reply_to",
            "thread_id",
            "inbox_id",
            "direction",
            "attachments_json",
            "sent_by_user_id",
            "sent_at",
        ] {
            assert!(columns.contains(required), "missing column {}", required);
        }

        let mut unique_on_message_id = false;
        for index in sqlx::query("PRAGMA index_list(messages)")
            .fetch_all(&store.pool)
            .await?
        {
            if index.try_get::<i64, _>("unique")? != 1 {
                continue;
            }
            let name: String = index.try_get("name")?;
            let indexed: Vec<String> = sqlx::query(&format!("PRAGMA index_info('{}')", name))
                .fetch_all(&store.pool)
                .await?
                .iter()
                .map(|col| col.try_get::<String, _>("name"))
                .collect::<Result<_, _>>()?;
            unique_on_message_id |= indexed == ["message_id"];
        }
        assert!(unique_on_message_id, "no unique index on messages.message_id");

        let inbox = store.upsert_inbox(&support_inbox()).await?;
        let PersistOutcome::Stored { thread_id, .. } = store
            .persist_message(
                inbox.id,
                new_thread(inbox.id, "Quote", "a@example.com"),
                &inbound("m1", "a@example.com", "Quote", 100),
            )
            .await?
        else {
            anyhow::bail!("expected stored");
        };
        let raw_insert = sqlx::query(
            "INSERT INTO messages (message_id, thread_id, inbox_id, subject, from_address,
               to_json, cc_json, attachments_json, direction, sent_at, created_at)
             VALUES ('m1', ?, ?, 'Quote', 'a@example.com', '[]', '[]', '[]', 'inbound', 1, 1)",
        )
        .bind(thread_id)
        .bind(inbox.id)
        .execute(&store.pool)
        .await;
        assert!(raw_insert.is_err());
        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn inbox_address_is_unique_regardless_of_case() -> anyhow::Result<()> {
        let (store, db_path) = fresh_store().await?;
        let mut mixed = support_inbox();
        mixed.address = " Support@Biz.com ".to_string();
        let first = store.upsert_inbox(&mixed).await?;
        let second = store.upsert_inbox(&support_inbox()).await?;

        assert_eq!(first.id, second.id);
        assert_eq!(first.address, "Support@Biz.com");
        assert_eq!(store.list_inboxes().await?.len(), 1);
        let found = store
            .inbox_by_address("SUPPORT@biz.com")
            .await?
            .ok_or_else(|| anyhow::anyhow!("missing inbox"))?;
        assert_eq!(found.id, first.id);
        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn persist_rejects_thread_of_another_inbox() -> anyhow::Result<()> {
        let (store, db_path) = fresh_store().await?;
        let inbox = store.upsert_inbox(&support_inbox()).await?;
        let mut events = support_inbox();
        events.address = "events@biz.com".to_string();
        let events = store.upsert_inbox(&events).await?;
        let PersistOutcome::Stored { thread_id, .. } = store
            .persist_message(
                inbox.id,
                new_thread(inbox.id, "Quote", "a@example.com"),
                &inbound("m1", "a@example.com", "Quote", 100),
            )
            .await?
        else {
            anyhow::bail!("expected stored");
        };

        let reply = inbound("m2", "a@example.com", "Re: Quote", 200);
        assert!(
            store
                .persist_message(events.id, ThreadTarget::Existing(thread_id), &reply)
                .await
                .is_err()
        );
        assert!(
            store
                .persist_message(events.id, new_thread(inbox.id, "Quote", "a@example.com"), &reply)
                .await
                .is_err()
        );
        assert!(!store.message_exists("m2").await?);
        assert_eq!(store.list_threads(events.id, true, None).await?.len(), 0);
        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn upsert_inbox_keeps_last_synced_at() -> anyhow::Result<()> {
        let (store, db_path) = fresh_store().await?;
        let inbox = store.upsert_inbox(&support_inbox()).await?;
        store.mark_inbox_synced(inbox.id, 1_700_000_000).await?;

        let mut edited = support_inbox();
        edited.name = "Support Desk".to_string();
        let again = store.upsert_inbox(&edited).await?;

        assert_eq!(again.id, inbox.id);
        assert_eq!(again.name, "Support Desk");
        assert_eq!(again.last_synced_at, Some(1_700_000_000));
        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_persist_rolls_back_new_thread() -> anyhow::Result<()> {
        let (store, db_path) = fresh_store().await?;
        let inbox = store.upsert_inbox(&support_inbox()).await?;
        let msg = inbound("m1", "bride@example.com", "Wedding Inquiry", 100);

        let first = store
            .persist_message(
                inbox.id,
                new_thread(inbox.id, "Wedding Inquiry", "bride@example.com"),
                &msg,
            )
            .await?;
        assert!(matches!(
            first,
            PersistOutcome::Stored {
                thread_created: true,
                ..
            }
        ));

        let second = store
            .persist_message(
                inbox.id,
                new_thread(inbox.id, "Wedding Inquiry", "bride@example.com"),
                &msg,
            )
            .await?;
        assert_eq!(second, PersistOutcome::Duplicate);
        assert_eq!(store.list_threads(inbox.id, true, None).await?.len(), 1);
        assert_eq!(store.count_messages(inbox.id).await?, 1);
        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn last_message_at_never_moves_backwards() -> anyhow::Result<()> {
        let (store, db_path) = fresh_store().await?;
        let inbox = store.upsert_inbox(&support_inbox()).await?;
        let PersistOutcome::Stored { thread_id, .. } = store
            .persist_message(
                inbox.id,
                new_thread(inbox.id, "Quote", "a@example.com"),
                &inbound("m1", "a@example.com", "Quote", 500),
            )
            .await?
        else {
            anyhow::bail!("expected stored");
        };
        store
            .persist_message(
                inbox.id,
                ThreadTarget::Existing(thread_id),
                &inbound("m0", "a@example.com", "Re: Quote", 200),
            )
            .await?;

        let thread = store
            .get_thread(thread_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("missing thread"))?;
        assert_eq!(thread.last_message_at, 500);
        let ids: Vec<String> = store
            .thread_messages(thread_id)
            .await?
            .into_iter()
            .map(|m| m.message_id)
            .collect();
        assert_eq!(ids, vec!["m0".to_string(), "m1".to_string()]);
        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn subject_prefix_lookup_is_scoped_and_escaped() -> anyhow::Result<()> {
        let (store, db_path) = fresh_store().await?;
        let inbox = store.upsert_inbox(&support_inbox()).await?;
        store
            .persist_message(
                inbox.id,
                new_thread(inbox.id, "Event Inquiry", "Client@Example.com"),
                &inbound("m1", "client@example.com", "Event Inquiry", 100),
            )
            .await?;
        store
            .persist_message(
                inbox.id,
                new_thread(inbox.id, "100% deposit", "client@example.com"),
                &inbound("m2", "client@example.com", "100% deposit", 50),
            )
            .await?;

        let found = store
            .find_thread_by_subject_prefix(inbox.id, "client@example.com", "event inquiry")
            .await?;
        assert_eq!(found.map(|t| t.subject), Some("Event Inquiry".to_string()));
        assert!(
            store
                .find_thread_by_subject_prefix(inbox.id, "other@example.com", "Event Inquiry")
                .await?
                .is_none()
        );
        assert!(
            store
                .find_thread_by_subject_prefix(inbox.id, "client@example.com", "100_")
                .await?
                .is_none()
        );
        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn directory_prefers_most_recent_booking() -> anyhow::Result<()> {
        let (store, db_path) = fresh_store().await?;
        sqlx::query("INSERT INTO bookings (email, created_at) VALUES (?, ?), (?, ?)")
            .bind("Bride@Example.com")
            .bind(100)
            .bind("bride@example.com")
            .bind(200)
            .execute(&store.pool)
            .await?;
        sqlx::query("INSERT INTO users (email) VALUES (?)")
            .bind("bride@example.com")
            .execute(&store.pool)
            .await?;

        assert_eq!(
            store.find_booking_by_email("BRIDE@example.com").await?,
            Some(2)
        );
        assert_eq!(store.find_user_by_email("bride@example.com").await?, Some(1));
        assert_eq!(store.find_user_by_email("nobody@example.com").await?, None);
        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn thread_admin_flags_and_booking_reassignment() -> anyhow::Result<()> {
        let (store, db_path) = fresh_store().await?;
        let inbox = store.upsert_inbox(&support_inbox()).await?;
        let PersistOutcome::Stored {
            thread_id,
            message_row_id,
            ..
        } = store
            .persist_message(
                inbox.id,
                new_thread(inbox.id, "Hire", "a@example.com"),
                &inbound("m1", "a@example.com", "Hire", 100),
            )
            .await?
        else {
            anyhow::bail!("expected stored");
        };

        store
            .set_thread_flags(
                thread_id,
                &ThreadFlags {
                    read: Some(true),
                    starred: Some(true),
                    archived: None,
                },
            )
            .await?;
        store.set_thread_booking(thread_id, Some(42)).await?;
        store
            .set_message_flags(message_row_id, None, Some(true))
            .await?;

        let thread = store
            .get_thread(thread_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("missing thread"))?;
        assert!(thread.is_read && thread.is_starred && !thread.is_archived);
        assert_eq!(thread.booking_id, Some(42));
        assert!(store.list_threads(inbox.id, false, None).await?.len() == 1);

        let messages = store.thread_messages(thread_id).await?;
        assert!(messages[0].is_starred && !messages[0].is_read);
        assert!(store.set_thread_booking(9_999, None).await.is_err());
        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
