//! MIME parsing into the normalized message record.

use mailparse::{MailAddr, MailHeaderMap, ParsedMail, addrparse_header, dateparse};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};

use inboxsync_core::{
    Address, AttachmentMeta, Direction, NewMessage, normalize_message_id, now_ts,
};

pub const NO_SUBJECT: &str = "(No Subject)";
const HTML_TEXT_WIDTH: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed message: {0}")]
    Malformed(#[from] mailparse::MailParseError),
    #[error("message has no sender address")]
    MissingSender,
}

/// Parses one raw RFC 5322 message as inbound mail. Missing `Date` falls
/// back to the ingestion time.
pub fn parse_message(raw: &[u8]) -> Result<NewMessage, ParseError> {
    parse_message_at(raw, now_ts())
}

pub fn parse_message_at(raw: &[u8], received_at: i64) -> Result<NewMessage, ParseError> {
    let parsed = mailparse::parse_mail(raw)?;
    let headers = &parsed.headers;

    let from = first_address(&parsed, "From").ok_or(ParseError::MissingSender)?;
    let to = header_addresses(&parsed, "To");
    let cc = header_addresses(&parsed, "Cc");

    let subject = headers
        .get_first_value("Subject")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| NO_SUBJECT.to_string());

    let message_id = headers
        .get_first_value("Message-ID")
        .and_then(|v| normalize_message_id(&v))
        .unwrap_or_else(|| synthesize_message_id(raw));
    let in_reply_to = headers
        .get_first_value("In-Reply-To")
        .and_then(|v| v.split_whitespace().next().and_then(normalize_message_id));
    let references = headers
        .get_first_value("References")
        .map(|v| {
            v.split_whitespace()
                .filter_map(normalize_message_id)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let sent_at = headers
        .get_first_value("Date")
        .and_then(|d| dateparse(d.trim()).ok())
        .unwrap_or(received_at);

    let (text_body, html_body) = select_bodies(&parsed);
    let text_body = match (text_body, html_body.as_deref()) {
        (Some(text), _) => Some(text),
        (None, Some(html)) => Some(html2text::from_read(html.as_bytes(), HTML_TEXT_WIDTH)),
        (None, None) => None,
    };

    let mut attachments = Vec::new();
    collect_attachments(&parsed, &mut attachments)?;

    Ok(NewMessage {
        message_id,
        in_reply_to,
        references,
        subject,
        from,
        to,
        cc,
        text_body,
        html_body,
        attachments,
        direction: Direction::Inbound,
        sent_by_user_id: None,
        sent_at,
    })
}

/// Identifier for messages that arrive without a Message-ID. Derived from
/// the raw bytes so the same message maps to the same id on every fetch.
pub fn synthesize_message_id(raw: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw);
    let digest = format!("{:x}", hasher.finalize());
    format!("{}@inboxsync.local", &digest[..32])
}

/// Timestamp plus random suffix, scoped to `domain`. Returned without brackets.
pub fn new_message_id(domain: &str) -> String {
    format!(
        "{}.{:016x}@{}",
        chrono::Utc::now().timestamp_millis(),
        OsRng.next_u64(),
        domain
    )
}

fn header_addresses(parsed: &ParsedMail, name: &str) -> Vec<Address> {
    let Some(header) = parsed.headers.get_first_header(name) else {
        return Vec::new();
    };
    match addrparse_header(header) {
        Ok(list) => mailaddrs_to_addresses(&list),
        Err(_) => Vec::new(),
    }
}

fn first_address(parsed: &ParsedMail, name: &str) -> Option<Address> {
    header_addresses(parsed, name).into_iter().next()
}

fn mailaddrs_to_addresses(addrs: &[MailAddr]) -> Vec<Address> {
    let mut out = Vec::new();
    for addr in addrs {
        match addr {
            MailAddr::Single(info) => push_address(&mut out, &info.addr, &info.display_name),
            MailAddr::Group(group) => {
                for info in &group.addrs {
                    push_address(&mut out, &info.addr, &info.display_name);
                }
            }
        }
    }
    out
}

fn push_address(out: &mut Vec<Address>, addr: &str, name: &Option<String>) {
    let email = addr.trim();
    if email.is_empty() {
        return;
    }
    out.push(match name {
        Some(name) => Address::with_name(email, name.trim()),
        None => Address::new(email),
    });
}

fn is_attachment(part: &ParsedMail) -> bool {
    let disposition = part.get_content_disposition();
    matches!(
        disposition.disposition,
        mailparse::DispositionType::Attachment
    ) || disposition.params.contains_key("filename")
        || part.ctype.params.contains_key("name")
}

fn select_bodies(parsed: &ParsedMail) -> (Option<String>, Option<String>) {
    let mut text_plain: Option<String> = None;
    let mut text_html: Option<String> = None;
    walk_parts(parsed, &mut |part| {
        if !part.subparts.is_empty() || is_attachment(part) {
            return;
        }
        let ctype = part.ctype.mimetype.to_lowercase();
        if ctype == "text/plain" && text_plain.is_none() {
            text_plain = part.get_body().ok();
        } else if ctype == "text/html" && text_html.is_none() {
            text_html = part.get_body().ok();
        }
    });
    (text_plain, text_html)
}

fn walk_parts<F>(parsed: &ParsedMail, cb: &mut F)
where
    F: FnMut(&ParsedMail),
{
    cb(parsed);
    for part in &parsed.subparts {
        walk_parts(part, cb);
    }
}

fn collect_attachments(
    parsed: &ParsedMail,
    out: &mut Vec<AttachmentMeta>,
) -> Result<(), ParseError> {
    if parsed.subparts.is_empty() {
        if !is_attachment(parsed) {
            return Ok(());
        }
        let disposition = parsed.get_content_disposition();
        let filename = disposition
            .params
            .get("filename")
            .cloned()
            .or_else(|| parsed.ctype.params.get("name").cloned())
            .unwrap_or_else(|| "attachment".to_string());
        let size = parsed.get_body_raw()?.len();
        out.push(AttachmentMeta {
            filename,
            content_type: parsed.ctype.mimetype.to_lowercase(),
            size,
        });
        return Ok(());
    }

    for part in &parsed.subparts {
        collect_attachments(part, out)?;
    }
    Ok(())
}
