//! Rule matcher and global exclusions.
//!
//! A rule is a named, prioritized conjunction of conditions pointing at a
//! template. Matching is pure: the ledger check happens upstream in the
//! dispatcher, so the same message and rule set always yield the same rule.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::pipeline::conditions::{Condition, evaluate_all};
use crate::pipeline::types::Message;

/// Priority used when a rule does not declare one.
pub const DEFAULT_PRIORITY: i64 = 10;

/// An immutable response rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique rule name.
    pub name: String,
    /// All must hold.
    pub conditions: Vec<Condition>,
    /// Lower value wins. Not unique; declaration order breaks ties.
    pub priority: i64,
    /// Name of the template used to render the response.
    pub template: String,
}

impl Rule {
    /// Whether every condition holds for `message`.
    pub fn matches(&self, message: &Message) -> bool {
        evaluate_all(&self.conditions, message)
    }
}

/// Select the winning rule for `message`.
///
/// Among rules whose conditions all hold, the lowest priority value wins;
/// equal priorities resolve to the earliest rule in `rules`.
pub fn match_rule<'a>(message: &Message, rules: &'a [Rule]) -> Option<&'a Rule> {
    let mut winner: Option<&Rule> = None;
    for rule in rules {
        if !rule.matches(message) {
            continue;
        }
        match winner {
            // Strict comparison keeps the earlier rule on ties.
            Some(best) if best.priority <= rule.priority => {}
            _ => winner = Some(rule),
        }
    }

    match winner {
        Some(rule) => debug!(
            message_id = %message.id,
            rule = %rule.name,
            priority = rule.priority,
            "Rule matched"
        ),
        None => debug!(message_id = %message.id, "No rule matched"),
    }
    winner
}

/// Senders and subjects that never get a response, checked before rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusions {
    /// Case-insensitive substrings of the sender address.
    #[serde(default)]
    pub from_addresses: Vec<String>,
    /// Case-insensitive substrings of the subject.
    #[serde(default)]
    pub subject_contains: Vec<String>,
    /// Exact sender domains.
    #[serde(default)]
    pub from_domain: Vec<String>,
}

impl Exclusions {
    /// Return the matching exclusion pattern, if any.
    pub fn excluded_by(&self, message: &Message) -> Option<&str> {
        let sender = message.sender.to_lowercase();
        if let Some(addr) = self
            .from_addresses
            .iter()
            .find(|a| !a.is_empty() && sender.contains(&a.to_lowercase()))
        {
            return Some(addr);
        }

        let subject = message.subject.to_lowercase();
        if let Some(pattern) = self
            .subject_contains
            .iter()
            .find(|s| !s.is_empty() && subject.contains(&s.to_lowercase()))
        {
            return Some(pattern);
        }

        if message.sender_domain.is_empty() {
            return None;
        }
        self.from_domain
            .iter()
            .find(|d| d.trim().trim_start_matches('@').to_lowercase() == message.sender_domain)
            .map(String::as_str)
    }

    /// Whether no exclusion pattern is configured.
    pub fn is_empty(&self) -> bool {
        self.from_addresses.is_empty() && self.subject_contains.is_empty() && self.from_domain.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::FetchedMessage;
    use chrono::Utc;

    fn make_message(from: &str, subject: &str) -> Message {
        Message::normalize(FetchedMessage {
            id: "test-1".into(),
            subject: subject.into(),
            from: from.into(),
            body: String::new(),
            labels: vec![],
            has_attachments: false,
            received_at: Utc::now(),
        })
    }

    fn rule(name: &str, priority: i64, conditions: Vec<Condition>) -> Rule {
        Rule {
            name: name.into(),
            conditions,
            priority,
            template: format!("{name}_template"),
        }
    }

    fn subject(words: &[&str]) -> Condition {
        Condition::SubjectContains(words.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn simple_match() {
        let rules = vec![rule("urgent", 1, vec![subject(&["urgent"])])];
        let msg = make_message("a@b.com", "URGENT: server down");
        assert_eq!(match_rule(&msg, &rules).map(|r| r.name.as_str()), Some("urgent"));
    }

    #[test]
    fn empty_rule_set_matches_nothing() {
        let msg = make_message("a@b.com", "Anything");
        assert!(match_rule(&msg, &[]).is_none());
    }

    #[test]
    fn no_rule_conditions_hold() {
        let rules = vec![
            rule("urgent", 1, vec![subject(&["urgent"])]),
            rule("invoice", 2, vec![subject(&["invoice"])]),
        ];
        let msg = make_message("a@b.com", "Lunch?");
        assert!(match_rule(&msg, &rules).is_none());
    }

    #[test]
    fn lowest_priority_wins_regardless_of_order() {
        let rules = vec![
            rule("catch_all", 100, vec![]),
            rule("general", 5, vec![]),
            rule("urgent", 1, vec![subject(&["urgent"])]),
        ];
        let msg = make_message("a@b.com", "urgent request");
        assert_eq!(match_rule(&msg, &rules).unwrap().name, "urgent");

        let msg = make_message("a@b.com", "hello");
        assert_eq!(match_rule(&msg, &rules).unwrap().name, "general");
    }

    #[test]
    fn equal_priority_earliest_declared_wins() {
        let rules = vec![
            rule("first", 3, vec![subject(&["help"])]),
            rule("second", 3, vec![subject(&["help"])]),
            rule("third", 3, vec![]),
        ];
        let msg = make_message("a@b.com", "need help");
        for _ in 0..5 {
            assert_eq!(match_rule(&msg, &rules).unwrap().name, "first");
        }

        // Non-matching earlier rule does not shift the tie-break.
        let msg = make_message("a@b.com", "hello");
        assert_eq!(match_rule(&msg, &rules).unwrap().name, "third");
    }

    #[test]
    fn negative_priorities_are_ordered() {
        let rules = vec![rule("zero", 0, vec![]), rule("negative", -1, vec![])];
        let msg = make_message("a@b.com", "x");
        assert_eq!(match_rule(&msg, &rules).unwrap().name, "negative");
    }

    #[test]
    fn exclusions_by_address_subject_and_domain() {
        let exclusions = Exclusions {
            from_addresses: vec!["NoReply@".into()],
            subject_contains: vec!["unsubscribe".into()],
            from_domain: vec!["spam.example".into()],
        };

        let msg = make_message("noreply@shop.com", "Your order");
        assert_eq!(exclusions.excluded_by(&msg), Some("NoReply@"));

        let msg = make_message("news@shop.com", "Click to Unsubscribe");
        assert_eq!(exclusions.excluded_by(&msg), Some("unsubscribe"));

        let msg = make_message("x@SPAM.example", "Hi");
        assert_eq!(exclusions.excluded_by(&msg), Some("spam.example"));

        let msg = make_message("alice@company.com", "Meeting");
        assert!(exclusions.excluded_by(&msg).is_none());

        let exclusions = Exclusions {
            from_domain: vec!["ÉCOLE.fr".into()],
            ..Default::default()
        };
        let msg = make_message("prof@école.FR", "Hi");
        assert_eq!(exclusions.excluded_by(&msg), Some("ÉCOLE.fr"));
    }

    #[test]
    fn empty_exclusions_exclude_nothing() {
        let exclusions = Exclusions::default();
        assert!(exclusions.is_empty());
        let msg = make_message("noreply@x.com", "unsubscribe");
        assert!(exclusions.excluded_by(&msg).is_none());
    }
}
