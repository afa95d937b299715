//! Condition evaluator: pure predicates over a normalized message.
//!
//! Substring variants are case-insensitive any-match. Domain variants compare
//! the derived sender domain for exact case-insensitive equality. An empty
//! list in any variant is a vacuous match and evaluates to `true`.

use serde::{Deserialize, Serialize};

use crate::pipeline::types::Message;

/// A single rule condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Subject contains any of the substrings.
    SubjectContains(Vec<String>),
    /// Subject contains none of the substrings.
    SubjectNotContains(Vec<String>),
    /// Sender domain equals one of the domains.
    FromDomainIs(Vec<String>),
    /// Sender domain equals none of the domains.
    FromDomainNot(Vec<String>),
    /// Body contains any of the substrings.
    BodyContains(Vec<String>),
    /// Message carries any of the labels.
    LabelIs(Vec<String>),
    /// Message has (or lacks) attachments.
    HasAttachments(bool),
}

impl Condition {
    /// Config key for this variant.
    pub fn key(&self) -> &'static str {
        match self {
            Self::SubjectContains(_) => "subject_contains",
            Self::SubjectNotContains(_) => "subject_not_contains",
            Self::FromDomainIs(_) => "from_domain_is",
            Self::FromDomainNot(_) => "from_domain_not",
            Self::BodyContains(_) => "body_contains",
            Self::LabelIs(_) => "label_is",
            Self::HasAttachments(_) => "has_attachments",
        }
    }
}

/// Evaluate one condition against a message. Total and side-effect free.
pub fn evaluate(condition: &Condition, message: &Message) -> bool {
    match condition {
        Condition::SubjectContains(needles) => {
            needles.is_empty() || contains_any(&message.subject, needles)
        }
        Condition::SubjectNotContains(needles) => !contains_any(&message.subject, needles),
        Condition::FromDomainIs(domains) => {
            domains.is_empty() || domain_in(&message.sender_domain, domains)
        }
        Condition::FromDomainNot(domains) => !domain_in(&message.sender_domain, domains),
        Condition::BodyContains(needles) => {
            needles.is_empty() || contains_any(&message.body, needles)
        }
        Condition::LabelIs(labels) => {
            labels.is_empty()
                || labels
                    .iter()
                    .any(|l| message.labels.contains(&l.trim().to_lowercase()))
        }
        Condition::HasAttachments(expected) => message.has_attachments == *expected,
    }
}

/// Conjunction of every condition. An empty list matches everything.
pub fn evaluate_all(conditions: &[Condition], message: &Message) -> bool {
    conditions.iter().all(|c| evaluate(c, message))
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    let haystack = haystack.to_lowercase();
    needles
        .iter()
        .any(|needle| haystack.contains(&needle.to_lowercase()))
}

fn domain_in(domain: &str, domains: &[String]) -> bool {
    if domain.is_empty() {
        return false;
    }
    domains
        .iter()
        .any(|d| d.trim().trim_start_matches('@').to_lowercase() == domain)
}
