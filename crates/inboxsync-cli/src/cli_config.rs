use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::warn;

use inboxsync_core::{ImapSettings, NewInbox, SmtpSettings};

const CONFIG_FILE: &str = "inboxsync.toml";
const DEFAULT_DB_FILE: &str = "inboxsync.db";
const DEFAULT_MAILBOX: &str = "INBOX";
const DEFAULT_FETCH_CHUNK_SIZE: usize = 25;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 300;
const DEFAULT_IMAP_PORT: u16 = 993;
const DEFAULT_SMTP_PORT: u16 = 587;
const DEFAULT_POLL_INTERVAL_MINUTES: i64 = 5;

#[derive(Debug, Clone)]
pub(crate) struct AppConfig {
    /// As written in the config; relative paths resolve under the state dir.
    pub(crate) db_path: String,
    pub(crate) fetch_chunk_size: usize,
    pub(crate) mailbox: String,
    pub(crate) connect_timeout_secs: u64,
    pub(crate) fetch_timeout_secs: u64,
    pub(crate) inboxes: Vec<NewInbox>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_FILE.to_string(),
            fetch_chunk_size: DEFAULT_FETCH_CHUNK_SIZE,
            mailbox: DEFAULT_MAILBOX.to_string(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            inboxes: Vec::new(),
        }
    }
}

fn xdg_config_dir() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn xdg_state_dir() -> PathBuf {
    std::env::var_os("XDG_STATE_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local").join("state"))
        })
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn config_path_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from(CONFIG_FILE),
        xdg_config_dir().join("inboxsync").join(CONFIG_FILE),
    ]
}

fn load_config_text() -> Option<String> {
    for path in config_path_candidates() {
        if let Ok(content) = std::fs::read_to_string(&path) {
            return Some(content);
        }
    }
    None
}

fn default_config_template() -> &'static str {
    r#"# Auto-generated by inboxsync on first run.
# Add one [[inboxes]] block per shared mailbox.

[database]
path = "inboxsync.db"

[sync]
fetch_chunk_size = 25
mailbox = "INBOX"
connect_timeout_secs = 30
fetch_timeout_secs = 300

# [[inboxes]]
# name = "Support"
# address = "support@example.com"
# poll_interval_minutes = 5
#
# [inboxes.imap]
# host = "imap.example.com"
# port = 993
# username = "support@example.com"
# password = "app-password"
#
# [inboxes.smtp]
# host = "smtp.example.com"
# port = 587
# username = "support@example.com"
# password = "app-password"
"#
}

pub(crate) fn ensure_default_config_exists() -> Result<()> {
    if load_config_text().is_some() {
        return Ok(());
    }
    let path = xdg_config_dir().join("inboxsync").join(CONFIG_FILE);
    write_text_atomic(&path, default_config_template())
}

fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    if path.exists() {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(path)?;
        file.write_all(content.as_bytes())?;
        return Ok(());
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn resolve_db_path(raw: &str) -> String {
    let path = Path::new(raw);
    if path.is_absolute() {
        return raw.to_string();
    }
    let dir = xdg_state_dir().join("inboxsync");
    let _ = std::fs::create_dir_all(&dir);
    dir.join(path).to_string_lossy().to_string()
}

pub(crate) fn load_config() -> AppConfig {
    match load_config_text() {
        Some(content) => parse_config(&content),
        None => AppConfig::default(),
    }
}

pub(crate) fn parse_config(content: &str) -> AppConfig {
    let value: toml::Value = match toml::from_str(content) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "invalid config, using defaults");
            return AppConfig::default();
        }
    };
    let mut config = AppConfig::default();
    if let Some(path) = value
        .get("database")
        .and_then(|db| db.get("path"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
    {
        config.db_path = path.to_string();
    }
    if let Some(sync) = value.get("sync") {
        config.fetch_chunk_size = sync
            .get("fetch_chunk_size")
            .and_then(|v| v.as_integer())
            .map(|v| v.clamp(1, 200) as usize)
            .unwrap_or(DEFAULT_FETCH_CHUNK_SIZE);
        if let Some(mailbox) = sync
            .get("mailbox")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
        {
            config.mailbox = mailbox.to_string();
        }
        config.connect_timeout_secs = sync
            .get("connect_timeout_secs")
            .and_then(|v| v.as_integer())
            .map(|v| v.max(1) as u64)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);
        config.fetch_timeout_secs = sync
            .get("fetch_timeout_secs")
            .and_then(|v| v.as_integer())
            .map(|v| v.max(1) as u64)
            .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS);
    }
    if let Some(inboxes) = value.get("inboxes").and_then(|v| v.as_array()) {
        config.inboxes = inboxes
            .iter()
            .enumerate()
            .filter_map(|(idx, inbox)| parse_inbox_table(inbox, idx))
            .collect();
    }
    config
}

fn parse_inbox_table(value: &toml::Value, index: usize) -> Option<NewInbox> {
    let Some(address) = value
        .get("address")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    else {
        warn!(index, "inbox without address ignored");
        return None;
    };
    let name = value
        .get("name")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| address.clone());
    Some(NewInbox {
        name,
        address,
        imap: value.get("imap").and_then(parse_imap_table),
        smtp: value.get("smtp").and_then(parse_smtp_table),
        is_active: value
            .get("active")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
        sync_enabled: value
            .get("sync_enabled")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
        poll_interval_minutes: value
            .get("poll_interval_minutes")
            .and_then(|v| v.as_integer())
            .map(|v| v.max(1))
            .unwrap_or(DEFAULT_POLL_INTERVAL_MINUTES),
    })
}

fn port_value(table: &toml::Value, section: &str, default: u16) -> u16 {
    let Some(raw) = table.get("port").and_then(|v| v.as_integer()) else {
        return default;
    };
    match u16::try_from(raw) {
        Ok(port) if port != 0 => port,
        _ => {
            warn!(section, port = raw, default, "port out of range, using default");
            default
        }
    }
}

fn parse_imap_table(imap: &toml::Value) -> Option<ImapSettings> {
    Some(ImapSettings {
        host: imap.get("host")?.as_str()?.to_string(),
        port: port_value(imap, "imap", DEFAULT_IMAP_PORT),
        username: imap.get("username")?.as_str()?.to_string(),
        password: imap.get("password")?.as_str()?.to_string(),
        tls: imap.get("tls").and_then(|v| v.as_bool()).unwrap_or(true),
        skip_tls_verify: imap
            .get("skip_tls_verify")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        mailbox: imap
            .get("mailbox")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    })
}

fn parse_smtp_table(smtp: &toml::Value) -> Option<SmtpSettings> {
    Some(SmtpSettings {
        host: smtp.get("host")?.as_str()?.to_string(),
        port: port_value(smtp, "smtp", DEFAULT_SMTP_PORT),
        username: smtp.get("username")?.as_str()?.to_string(),
        password: smtp.get("password")?.as_str()?.to_string(),
        tls: smtp.get("tls").and_then(|v| v.as_bool()).unwrap_or(false),
        skip_tls_verify: smtp
            .get("skip_tls_verify")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    })
}
