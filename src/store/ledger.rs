//! Processed-message ledger: the durable dedup record.
//!
//! An id enters the ledger only after its external action (draft or send)
//! succeeded. Entries are never removed.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// Action recorded against a processed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerAction {
    Drafted,
    Sent,
}

impl LedgerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drafted => "drafted",
            Self::Sent => "sent",
        }
    }
}

impl fmt::Display for LedgerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drafted" => Ok(Self::Drafted),
            "sent" => Ok(Self::Sent),
            other => Err(format!("unknown ledger action '{other}'")),
        }
    }
}

/// A recorded message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub message_id: String,
    pub action: LedgerAction,
    pub rule_name: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Durable set of processed message ids.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Whether `message_id` has been recorded.
    async fn has(&self, message_id: &str) -> Result<bool, LedgerError>;

    /// Record `message_id`. Recording an id twice is `AlreadyRecorded`.
    async fn record(
        &self,
        message_id: &str,
        action: LedgerAction,
        rule_name: Option<&str>,
    ) -> Result<(), LedgerError>;

    /// Fetch the entry for `message_id`.
    async fn get(&self, message_id: &str) -> Result<Option<LedgerEntry>, LedgerError>;

    /// Number of recorded messages.
    async fn count(&self) -> Result<u64, LedgerError>;
}
