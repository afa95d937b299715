//! Shared types for the response pipeline.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DraftError, FetchError, SendError};

// ── Inbound message ─────────────────────────────────────────────────

/// A message as the mail provider hands it over, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedMessage {
    /// Stable identifier, unique per mailbox (Message-ID header).
    pub id: String,
    /// Raw subject line.
    pub subject: String,
    /// Raw From header: `Name <addr@domain>` or a bare address.
    pub from: String,
    /// Plain-text body.
    pub body: String,
    /// Provider labels and flags.
    pub labels: Vec<String>,
    /// Whether the message carries attachments.
    pub has_attachments: bool,
    /// When the message was received.
    pub received_at: DateTime<Utc>,
}

/// Normalized message consumed by the rule engine. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub subject: String,
    /// Bare sender address.
    pub sender: String,
    /// Display name from the From header, if any.
    pub sender_name: Option<String>,
    /// Lowercased domain part of the sender address; empty when absent.
    pub sender_domain: String,
    pub body: String,
    /// Lowercased label set.
    pub labels: BTreeSet<String>,
    pub has_attachments: bool,
    pub received_at: DateTime<Utc>,
}

static NAMED_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*"?([^"<]*?)"?\s*<([^>]*)>\s*$"#).expect("static regex")
});

impl Message {
    /// Normalize a fetched message: split the From header into name and
    /// address, derive the sender domain, trim the subject, lowercase labels.
    pub fn normalize(fetched: FetchedMessage) -> Self {
        let (sender_name, sender) = split_from_header(&fetched.from);
        let sender_domain = sender_domain(&sender);

        Self {
            id: fetched.id,
            subject: fetched.subject.trim().to_string(),
            sender,
            sender_name,
            sender_domain,
            body: fetched.body,
            labels: fetched
                .labels
                .iter()
                .map(|l| l.trim().to_lowercase())
                .filter(|l| !l.is_empty())
                .collect(),
            has_attachments: fetched.has_attachments,
            received_at: fetched.received_at,
        }
    }

    /// Display name, falling back to the local part of the address.
    pub fn display_name(&self) -> &str {
        match self.sender_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => self.sender.split('@').next().unwrap_or(&self.sender),
        }
    }
}

/// Split `Name <addr>` into `(Some(name), addr)`; bare addresses pass through.
pub fn split_from_header(from: &str) -> (Option<String>, String) {
    if let Some(caps) = NAMED_ADDRESS.captures(from) {
        let name = caps[1].trim();
        let addr = caps[2].trim().to_string();
        let name = (!name.is_empty()).then(|| name.to_string());
        return (name, addr);
    }
    (None, from.trim().to_string())
}

/// Domain part of an address, lowercased. Empty if there is no `@`.
pub fn sender_domain(address: &str) -> String {
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain.trim().trim_end_matches('>').to_lowercase())
        .unwrap_or_default()
}

// ── Mode ────────────────────────────────────────────────────────────

/// Global operating mode for a run. Never inferred per message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Preview only: log what would be sent.
    Test,
    /// Save responses as drafts for manual review.
    #[default]
    Draft,
    /// Send responses directly.
    Send,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::Draft => "draft",
            Self::Send => "send",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "test" => Ok(Self::Test),
            "draft" => Ok(Self::Draft),
            "send" => Ok(Self::Send),
            other => Err(format!("unknown mode '{other}' (expected test, draft or send)")),
        }
    }
}

// ── Rendered reply ──────────────────────────────────────────────────

/// Response produced by the template renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedReply {
    pub subject: String,
    pub body: String,
}

// ── Dispatch state machine ──────────────────────────────────────────

/// Why a message was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyProcessed,
    Excluded,
    NoRuleMatched,
    TemplateError { detail: String },
}

impl SkipReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::AlreadyProcessed => "already-processed",
            Self::Excluded => "excluded",
            Self::NoRuleMatched => "no-rule-matched",
            Self::TemplateError { .. } => "template-error",
        }
    }
}

/// Per-message dispatch state. Everything except `Pending` is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DispatchState {
    Pending,
    Skipped(SkipReason),
    Logged,
    Drafted,
    Sent,
    Failed { reason: String },
}

impl DispatchState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Skipped(reason) => reason.label(),
            Self::Logged => "logged",
            Self::Drafted => "drafted",
            Self::Sent => "sent",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Outcome for one message in one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub message_id: String,
    /// Winning rule, if matching got that far.
    pub rule: Option<String>,
    pub state: DispatchState,
    /// Set when the external action succeeded but the ledger write did not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_error: Option<String>,
}

impl DispatchRecord {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            rule: None,
            state: DispatchState::Pending,
            ledger_error: None,
        }
    }
}

/// Ordered result of one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub mode: Mode,
    pub started_at: DateTime<Utc>,
    pub records: Vec<DispatchRecord>,
    /// True when the cycle stopped early on a shutdown request.
    pub interrupted: bool,
}

impl RunResult {
    pub fn new(mode: Mode) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            started_at: Utc::now(),
            records: Vec::new(),
            interrupted: false,
        }
    }

    /// Count records whose state carries the given label.
    pub fn count(&self, label: &str) -> usize {
        self.records
            .iter()
            .filter(|r| r.state.label() == label)
            .count()
    }

    /// Records with a terminal failure.
    pub fn failures(&self) -> impl Iterator<Item = &DispatchRecord> {
        self.records
            .iter()
            .filter(|r| matches!(r.state, DispatchState::Failed { .. }))
    }
}

// ── Mail provider trait ─────────────────────────────────────────────

/// Mail provider seam: pure I/O, no decision logic.
///
/// Fetching must not change read state, so a message that fails to dispatch
/// stays unread and is offered again next cycle.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &str;

    /// Fetch up to `limit` unread inbox messages.
    async fn fetch_unread(&self, limit: usize) -> Result<Vec<FetchedMessage>, FetchError>;

    /// Save `reply` as a draft answering `original`.
    async fn create_draft(
        &self,
        original: &Message,
        reply: &RenderedReply,
    ) -> Result<(), DraftError>;

    /// Send `reply` to the sender of `original`.
    async fn send_message(
        &self,
        original: &Message,
        reply: &RenderedReply,
    ) -> Result<(), SendError>;
}
