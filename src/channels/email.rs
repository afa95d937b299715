//! Email mailbox: IMAP for fetching and drafts, SMTP via lettre for sending.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::{Mailbox as Address, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::channels::imap::{self, ImapError, ImapSession};
use crate::config::parse_bool;
use crate::error::{ConfigError, DraftError, FetchError, SendError};
use crate::pipeline::types::{FetchedMessage, Mailbox, Message, RenderedReply};

/// Prefix for ids synthesized when a message has no Message-ID header.
pub const UID_ID_PREFIX: &str = "imap-uid-";

// ── Configuration ───────────────────────────────────────────────────

/// Mail account configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    /// Mailbox that receives drafts via IMAP APPEND.
    pub drafts_mailbox: String,
    /// Request Gmail's `X-GM-LABELS` when fetching.
    pub gmail_labels: bool,
}

impl EmailConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. `EMAIL_IMAP_HOST` is required.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let imap_host = get("EMAIL_IMAP_HOST")
            .ok_or_else(|| ConfigError::MissingEnvVar("EMAIL_IMAP_HOST".into()))?;

        let imap_port = parse_port("EMAIL_IMAP_PORT", get("EMAIL_IMAP_PORT"), 993)?;
        let smtp_host = get("EMAIL_SMTP_HOST").unwrap_or_else(|| imap_host.replace("imap", "smtp"));
        let smtp_port = parse_port("EMAIL_SMTP_PORT", get("EMAIL_SMTP_PORT"), 587)?;

        let username = get("EMAIL_USERNAME").unwrap_or_default();
        let password = SecretString::from(lookup("EMAIL_PASSWORD").unwrap_or_default());
        let from_address = get("EMAIL_FROM_ADDRESS").unwrap_or_else(|| username.clone());

        let drafts_mailbox = get("EMAIL_DRAFTS_MAILBOX").unwrap_or_else(|| "[Gmail]/Drafts".into());
        let gmail_labels = match get("EMAIL_GMAIL_LABELS") {
            Some(raw) => parse_bool("EMAIL_GMAIL_LABELS", &raw)?,
            None => true,
        };

        Ok(Self {
            imap_host,
            imap_port,
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
            drafts_mailbox,
            gmail_labels,
        })
    }
}

fn parse_port(key: &str, raw: Option<String>, default: u16) -> Result<u16, ConfigError> {
    match raw {
        Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

// ── Mailbox ─────────────────────────────────────────────────────────

/// IMAP/SMTP mailbox. Every call opens its own connection.
pub struct ImapMailbox {
    config: Arc<EmailConfig>,
}

impl ImapMailbox {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    fn open_session(config: &EmailConfig) -> Result<ImapSession, FetchError> {
        let mut session =
            ImapSession::connect(&config.imap_host, config.imap_port).map_err(|e| {
                FetchError::Connect {
                    host: config.imap_host.clone(),
                    reason: e.to_string(),
                }
            })?;
        session
            .login(&config.username, config.password.expose_secret())
            .map_err(|e| FetchError::Auth(e.to_string()))?;
        Ok(session)
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    fn name(&self) -> &str {
        "imap"
    }

    async fn fetch_unread(&self, limit: usize) -> Result<Vec<FetchedMessage>, FetchError> {
        let config = Arc::clone(&self.config);
        tokio::task::spawn_blocking(move || fetch_unread_imap(&config, limit))
            .await
            .map_err(|e| FetchError::Task(e.to_string()))?
    }

    async fn create_draft(
        &self,
        original: &Message,
        reply: &RenderedReply,
    ) -> Result<(), DraftError> {
        let email = build_reply(&self.config, original, reply)
            .map_err(|e| DraftError::Build(e.to_string()))?;
        let raw = email.formatted();
        let config = Arc::clone(&self.config);

        tokio::task::spawn_blocking(move || -> Result<(), DraftError> {
            let mut session = ImapMailbox::open_session(&config)
                .map_err(|e| DraftError::Transport(e.to_string()))?;
            session
                .append(&config.drafts_mailbox, "\\Draft \\Seen", &raw)
                .map_err(|e| DraftError::Rejected(e.to_string()))?;
            if let Err(e) = session.logout() {
                debug!(error = %e, "IMAP logout failed after APPEND");
            }
            Ok(())
        })
        .await
        .map_err(|e| DraftError::Transport(format!("Draft task failed: {e}")))??;

        debug!(
            message_id = %original.id,
            mailbox = %self.config.drafts_mailbox,
            "Draft appended"
        );
        Ok(())
    }

    async fn send_message(
        &self,
        original: &Message,
        reply: &RenderedReply,
    ) -> Result<(), SendError> {
        let email = build_reply(&self.config, original, reply)?;
        let config = Arc::clone(&self.config);

        tokio::task::spawn_blocking(move || -> Result<(), SendError> {
            let creds = Credentials::new(
                config.username.clone(),
                config.password.expose_secret().to_string(),
            );
            // 465 is implicit TLS; anything else upgrades with STARTTLS.
            let builder = match config.smtp_port {
                465 => SmtpTransport::relay(&config.smtp_host),
                _ => SmtpTransport::starttls_relay(&config.smtp_host),
            };
            let builder =
                builder.map_err(|e| SendError::Transport(format!("SMTP relay error: {e}")))?;

            let transport = builder.port(config.smtp_port).credentials(creds).build();
            transport
                .send(&email)
                .map_err(|e| SendError::Transport(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| SendError::Transport(format!("Send task failed: {e}")))??;

        info!(to = %original.sender, "Email sent");
        Ok(())
    }
}

// ── Helpers (public for testing) ────────────────────────────────────

/// Build the reply to `original`, threaded with In-Reply-To/References when
/// the original carried a Message-ID.
pub fn build_reply(
    config: &EmailConfig,
    original: &Message,
    reply: &RenderedReply,
) -> Result<lettre::Message, SendError> {
    let from: Address = config
        .from_address
        .parse()
        .map_err(|e: lettre::address::AddressError| SendError::InvalidAddress {
            address: config.from_address.clone(),
            reason: e.to_string(),
        })?;
    let to: Address = original
        .sender
        .parse()
        .map_err(|e: lettre::address::AddressError| SendError::InvalidAddress {
            address: original.sender.clone(),
            reason: e.to_string(),
        })?;

    let mut builder = lettre::Message::builder()
        .from(from)
        .to(to)
        .subject(&reply.subject)
        .header(ContentType::TEXT_PLAIN);

    if let Some(thread_id) = thread_reference(&original.id) {
        builder = builder.in_reply_to(thread_id.clone()).references(thread_id);
    }

    builder
        .body(reply.body.clone())
        .map_err(|e| SendError::Build(e.to_string()))
}

/// `<id>` form of a Message-ID, or `None` for synthesized ids.
pub fn thread_reference(message_id: &str) -> Option<String> {
    let id = message_id.trim().trim_start_matches('<').trim_end_matches('>');
    if id.is_empty() || id.starts_with(UID_ID_PREFIX) {
        return None;
    }
    Some(format!("<{id}>"))
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// From header as `Name <addr>`, or the bare address.
fn extract_from(parsed: &mail_parser::Message) -> String {
    let Some(addr) = parsed.from().and_then(|a| a.first()) else {
        return String::new();
    };
    let address = addr.address().unwrap_or_default();
    match addr.name() {
        Some(name) if !name.trim().is_empty() => format!("{} <{address}>", name.trim()),
        _ => address.to_string(),
    }
}

/// Extract readable text from a parsed email.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.to_string();
        }
    }
    String::new()
}

/// Turn a raw RFC 5322 message into a `FetchedMessage`.
pub fn parse_fetched(
    uid: u32,
    raw: &[u8],
    labels: Vec<String>,
) -> Option<FetchedMessage> {
    let parsed = MessageParser::default().parse(raw)?;

    let id = parsed
        .message_id()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("{UID_ID_PREFIX}{uid}"));

    let received_at = parsed
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    Some(FetchedMessage {
        id,
        subject: parsed.subject().unwrap_or_default().to_string(),
        from: extract_from(&parsed),
        body: extract_text(&parsed),
        labels,
        has_attachments: parsed.attachment_count() > 0,
        received_at,
    })
}

/// Fetch unread inbox mail via raw IMAP over TLS (blocking; call from
/// spawn_blocking). Uses `BODY.PEEK[]` so read state is left untouched.
fn fetch_unread_imap(config: &EmailConfig, limit: usize) -> Result<Vec<FetchedMessage>, FetchError> {
    let mut session = ImapMailbox::open_session(config)?;
    let protocol = |e: ImapError| FetchError::Protocol(e.to_string());

    session.select("INBOX").map_err(protocol)?;

    // Newest first.
    let mut uids = session.uid_search("UNSEEN").map_err(protocol)?;
    uids.sort_unstable_by(|a, b| b.cmp(a));
    uids.truncate(limit);

    let items = if config.gmail_labels {
        "(UID FLAGS X-GM-LABELS BODY.PEEK[])"
    } else {
        "(UID FLAGS BODY.PEEK[])"
    };
    let responses = session.uid_fetch(&uids, items).map_err(protocol)?;

    let mut messages: Vec<(u32, FetchedMessage)> = Vec::with_capacity(responses.len());
    for response in &responses {
        let Some(uid) = imap::fetch_uid(&response.text) else {
            warn!(response = %response.text, "FETCH response without UID");
            continue;
        };
        let Some(raw) = response.literal_after("BODY[]") else {
            warn!(uid, "FETCH response without body");
            continue;
        };

        let mut labels = imap::fetch_labels(&response.text);
        labels.extend(imap::fetch_flags(&response.text));
        labels.push("INBOX".to_string());

        match parse_fetched(uid, raw, labels) {
            Some(message) => messages.push((uid, message)),
            None => warn!(uid, "Failed to parse message"),
        }
    }

    // Servers answer FETCH in mailbox order; restore newest first.
    messages.sort_by(|a, b| b.0.cmp(&a.0));

    if let Err(e) = session.logout() {
        debug!(error = %e, "IMAP logout failed");
    }

    debug!(count = messages.len(), "Fetched unread messages");
    Ok(messages.into_iter().map(|(_, message)| message).collect())
}

// ── Tests ───────────────────────────────────────────────────────────
