use anyhow::{Result, anyhow};
use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
    message::{Mailbox, Message, MultiPart, SinglePart},
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
    },
};
use mailparse::{MailAddr, addrparse};
use tracing::debug;

use inboxsync_core::{Address, SmtpSettings};

use crate::{MailTransport, MailTransportConnector};

const IMPLICIT_TLS_PORT: u16 = 465;

/// Builds an authenticated SMTP submission transport per send.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmtpConnector;

impl MailTransportConnector for SmtpConnector {
    fn transport(&self, smtp: &SmtpSettings) -> Result<Box<dyn MailTransport>> {
        let creds = Credentials::new(smtp.username.clone(), smtp.password.clone());
        let mut tls_builder = TlsParameters::builder(smtp.host.clone());
        if smtp.skip_tls_verify {
            tls_builder = tls_builder
                .dangerous_accept_invalid_certs(true)
                .dangerous_accept_invalid_hostnames(true);
        }
        let tls_parameters = tls_builder.build()?;
        let tls = if smtp.tls || smtp.port == IMPLICIT_TLS_PORT {
            Tls::Wrapper(tls_parameters)
        } else {
            Tls::Required(tls_parameters)
        };
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
            .port(smtp.port)
            .tls(tls)
            .credentials(creds)
            .build();
        Ok(Box::new(SmtpTransport {
            mailer,
            host: smtp.host.clone(),
        }))
    }
}

struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn send(&self, email: Message) -> Result<()> {
        let response = self
            .mailer
            .send(email)
            .await
            .map_err(|e| anyhow!(e.to_string()))?;
        debug!(host = %self.host, code = %response.code(), "smtp accepted");
        Ok(())
    }
}

/// An outgoing message before it is rendered to MIME. Identifiers are bare.
pub(crate) struct Outgoing<'a> {
    pub from: &'a Address,
    pub to: &'a [Address],
    pub cc: &'a [Address],
    pub subject: &'a str,
    pub text: &'a str,
    pub html: Option<&'a str>,
    pub message_id: &'a str,
    pub in_reply_to: Option<&'a str>,
    pub references: &'a [String],
}

pub(crate) fn compose(outgoing: &Outgoing<'_>) -> Result<Message> {
    let mut builder = Message::builder()
        .from(to_mailbox(outgoing.from)?)
        .subject(outgoing.subject)
        .message_id(Some(bracketed(outgoing.message_id)))
        .date_now();
    for addr in outgoing.to {
        builder = builder.to(to_mailbox(addr)?);
    }
    for addr in outgoing.cc {
        builder = builder.cc(to_mailbox(addr)?);
    }
    if let Some(parent) = outgoing.in_reply_to {
        builder = builder.in_reply_to(bracketed(parent));
    }
    if !outgoing.references.is_empty() {
        let references = outgoing
            .references
            .iter()
            .map(|id| bracketed(id))
            .collect::<Vec<_>>()
            .join(" ");
        builder = builder.references(references);
    }

    let email = match outgoing.html {
        Some(html) => builder.multipart(MultiPart::alternative_plain_html(
            outgoing.text.to_string(),
            html.to_string(),
        ))?,
        None => builder.singlepart(SinglePart::plain(outgoing.text.to_string()))?,
    };
    Ok(email)
}

/// Parses one recipient field, which may itself hold a comma-separated
/// list or a `Name <addr>` form.
pub(crate) fn parse_address_list(input: &str) -> Result<Vec<Address>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let parsed = addrparse(trimmed)?;
    let mut out = Vec::new();
    for addr in parsed.iter() {
        match addr {
            MailAddr::Single(info) => out.push(checked_address(&info.addr, &info.display_name)?),
            MailAddr::Group(group) => {
                for info in &group.addrs {
                    out.push(checked_address(&info.addr, &info.display_name)?);
                }
            }
        }
    }
    Ok(out)
}

fn checked_address(addr: &str, name: &Option<String>) -> Result<Address> {
    let email = addr.trim();
    email
        .parse::<lettre::Address>()
        .map_err(|e| anyhow!("invalid address {}: {}", email, e))?;
    Ok(match name {
        Some(name) => Address::with_name(email, name.trim()),
        None => Address::new(email),
    })
}

fn to_mailbox(addr: &Address) -> Result<Mailbox> {
    Ok(Mailbox::new(addr.name.clone(), addr.address.parse()?))
}

fn bracketed(id: &str) -> String {
    format!("<{}>", id)
}
