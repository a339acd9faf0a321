use anyhow::{Result, anyhow};
use serde_json::{Value as JsonValue, json};

use inboxsync_core::{Inbox, MailStore, SqliteMailStore};

use super::CLI_SCHEMA_VERSION;

pub(crate) fn output_ok(value: JsonValue) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string(&json!({
            "schema": CLI_SCHEMA_VERSION,
            "ok": true,
            "result": value
        }))?
    );
    Ok(())
}

pub(crate) fn output_error(message: &str) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string(&json!({
            "schema": CLI_SCHEMA_VERSION,
            "ok": false,
            "error": message
        }))?
    );
    Ok(())
}

/// Looks an inbox up by numeric id or by address.
pub(crate) async fn resolve_inbox(store: &SqliteMailStore, selector: &str) -> Result<Inbox> {
    let selector = selector.trim();
    let found = match selector.parse::<i64>() {
        Ok(id) => store.get_inbox(id).await?,
        Err(_) => store.inbox_by_address(selector).await?,
    };
    found.ok_or_else(|| anyhow!("Inbox not found: {}", selector))
}

/// Inbox summary without credentials.
pub(crate) fn inbox_to_json(inbox: &Inbox) -> JsonValue {
    json!({
        "id": inbox.id,
        "name": inbox.name,
        "address": inbox.address,
        "active": inbox.is_active,
        "sync_enabled": inbox.sync_enabled,
        "poll_interval_minutes": inbox.poll_interval_minutes,
        "last_synced_at": inbox.last_synced_at,
        "imap": inbox.imap.as_ref().map(|imap| format!("{}:{}", imap.host, imap.port)),
        "smtp": inbox.smtp.as_ref().map(|smtp| format!("{}:{}", smtp.host, smtp.port)),
    })
}
