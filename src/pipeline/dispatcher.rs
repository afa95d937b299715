//! Action dispatcher: drives one message from `Pending` to a terminal state.
//!
//! Transitions, in order:
//! 1. Ledger already has the id → `Skipped(AlreadyProcessed)`
//! 2. Global exclusion hit → `Skipped(Excluded)`
//! 3. No rule matches → `Skipped(NoRuleMatched)`
//! 4. Template fails to render → `Skipped(TemplateError)`
//! 5. Mode: test → `Logged`; draft → `Drafted`/`Failed`; send → `Sent`/`Failed`
//!
//! The ledger is written only after the mailbox confirmed the draft or send.
//! A crash between that confirmation and the ledger write can repeat the
//! action once on the next cycle.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::pipeline::rules::match_rule;
use crate::pipeline::template::render;
use crate::pipeline::types::{
    DispatchRecord, DispatchState, Mailbox, Message, Mode, RenderedReply, SkipReason,
};
use crate::rulebook::RuleBook;
use crate::store::{Ledger, LedgerAction};

/// Characters of the body shown in a test-mode preview.
const PREVIEW_CHARS: usize = 100;

/// Per-message decision and action step.
///
/// Every per-message error is converted into a terminal state here; nothing
/// escapes to abort the rest of the cycle.
pub struct ActionDispatcher {
    mailbox: Arc<dyn Mailbox>,
    ledger: Arc<dyn Ledger>,
    rulebook: Arc<RuleBook>,
}

impl ActionDispatcher {
    pub fn new(mailbox: Arc<dyn Mailbox>, ledger: Arc<dyn Ledger>, rulebook: Arc<RuleBook>) -> Self {
        Self {
            mailbox,
            ledger,
            rulebook,
        }
    }

    /// Dispatch one normalized message under `mode`.
    pub async fn dispatch(&self, message: &Message, mode: Mode) -> DispatchRecord {
        let mut record = DispatchRecord::new(&message.id);

        match self.ledger.has(&message.id).await {
            Ok(true) => {
                debug!(message_id = %message.id, "Already processed, skipping");
                record.state = DispatchState::Skipped(SkipReason::AlreadyProcessed);
                return record;
            }
            Ok(false) => {}
            Err(e) => {
                error!(message_id = %message.id, error = %e, "Ledger lookup failed");
                record.state = DispatchState::Failed {
                    reason: e.to_string(),
                };
                return record;
            }
        }

        if let Some(pattern) = self.rulebook.exclusions.excluded_by(message) {
            debug!(
                message_id = %message.id,
                sender = %message.sender,
                pattern,
                "Excluded"
            );
            record.state = DispatchState::Skipped(SkipReason::Excluded);
            return record;
        }

        let Some(rule) = match_rule(message, &self.rulebook.rules) else {
            record.state = DispatchState::Skipped(SkipReason::NoRuleMatched);
            return record;
        };
        record.rule = Some(rule.name.clone());

        let reply = match self.rulebook.template(&rule.template) {
            Some(template) => render(template, message),
            None => {
                // Rule books are validated at load; only reachable with a hand-built one.
                warn!(
                    message_id = %message.id,
                    rule = %rule.name,
                    template = %rule.template,
                    "Rule references an unknown template"
                );
                record.state = DispatchState::Skipped(SkipReason::TemplateError {
                    detail: format!("unknown template '{}'", rule.template),
                });
                return record;
            }
        };
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    message_id = %message.id,
                    rule = %rule.name,
                    template = %rule.template,
                    error = %e,
                    "Template rendering failed, skipping message"
                );
                record.state = DispatchState::Skipped(SkipReason::TemplateError {
                    detail: e.to_string(),
                });
                return record;
            }
        };

        match mode {
            Mode::Test => {
                log_preview(message, &rule.name, &reply);
                record.state = DispatchState::Logged;
            }
            Mode::Draft => match self.mailbox.create_draft(message, &reply).await {
                Ok(()) => {
                    info!(
                        message_id = %message.id,
                        rule = %rule.name,
                        to = %message.sender,
                        "Draft created"
                    );
                    record.state = DispatchState::Drafted;
                    self.record_action(&mut record, LedgerAction::Drafted).await;
                }
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "Draft creation failed");
                    record.state = DispatchState::Failed {
                        reason: e.to_string(),
                    };
                }
            },
            Mode::Send => match self.mailbox.send_message(message, &reply).await {
                Ok(()) => {
                    info!(
                        message_id = %message.id,
                        rule = %rule.name,
                        to = %message.sender,
                        "Reply sent"
                    );
                    record.state = DispatchState::Sent;
                    self.record_action(&mut record, LedgerAction::Sent).await;
                }
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "Send failed");
                    record.state = DispatchState::Failed {
                        reason: e.to_string(),
                    };
                }
            },
        }

        record
    }

    /// Write the ledger entry after a confirmed external action.
    async fn record_action(&self, record: &mut DispatchRecord, action: LedgerAction) {
        if let Err(e) = self
            .ledger
            .record(&record.message_id, action, record.rule.as_deref())
            .await
        {
            error!(
                message_id = %record.message_id,
                action = %action,
                error = %e,
                "Ledger write failed after the action completed; the message may be handled again next cycle"
            );
            record.ledger_error = Some(e.to_string());
        }
    }
}

fn log_preview(message: &Message, rule: &str, reply: &RenderedReply) {
    let preview: String = reply.body.chars().take(PREVIEW_CHARS).collect();
    let truncated = reply.body.chars().count() > PREVIEW_CHARS;
    info!(
        message_id = %message.id,
        rule,
        to = %message.sender,
        subject = %reply.subject,
        body = %preview,
        truncated,
        "[test mode] Would respond"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::error::{DraftError, FetchError, LedgerError, SendError};
    use crate::pipeline::conditions::Condition;
    use crate::pipeline::rules::{Exclusions, Rule};
    use crate::pipeline::template::Template;
    use crate::pipeline::types::FetchedMessage;
    use crate::store::{LedgerEntry, LibSqlLedger};

    #[derive(Default)]
    struct RecordingMailbox {
        drafts: Mutex<Vec<RenderedReply>>,
        sent: Mutex<Vec<RenderedReply>>,
        fail_drafts: bool,
    }

    #[async_trait]
    impl Mailbox for RecordingMailbox {
        fn name(&self) -> &str {
            "recording"
        }

        async fn fetch_unread(&self, _limit: usize) -> Result<Vec<FetchedMessage>, FetchError> {
            Ok(vec![])
        }

        async fn create_draft(
            &self,
            _original: &Message,
            reply: &RenderedReply,
        ) -> Result<(), DraftError> {
            if self.fail_drafts {
                return Err(DraftError::Transport("connection reset".into()));
            }
            self.drafts.lock().unwrap().push(reply.clone());
            Ok(())
        }

        async fn send_message(
            &self,
            _original: &Message,
            reply: &RenderedReply,
        ) -> Result<(), SendError> {
            self.sent.lock().unwrap().push(reply.clone());
            Ok(())
        }
    }

    /// Ledger whose reads or writes always fail.
    struct BrokenLedger {
        fail_reads: bool,
    }

    #[async_trait]
    impl Ledger for BrokenLedger {
        async fn has(&self, _message_id: &str) -> Result<bool, LedgerError> {
            if self.fail_reads {
                Err(LedgerError::Query("disk I/O error".into()))
            } else {
                Ok(false)
            }
        }

        async fn record(
            &self,
            message_id: &str,
            _action: LedgerAction,
            _rule_name: Option<&str>,
        ) -> Result<(), LedgerError> {
            Err(LedgerError::Write {
                message_id: message_id.to_string(),
                reason: "database is locked".into(),
            })
        }

        async fn get(&self, _message_id: &str) -> Result<Option<LedgerEntry>, LedgerError> {
            Ok(None)
        }

        async fn count(&self) -> Result<u64, LedgerError> {
            Ok(0)
        }
    }

    fn make_message(subject: &str) -> Message {
        Message::normalize(FetchedMessage {
            id: "<m1@b.com>".into(),
            subject: subject.into(),
            from: "a@b.com".into(),
            body: "The server is down.".into(),
            labels: vec!["INBOX".into()],
            has_attachments: false,
            received_at: Utc::now(),
        })
    }

    fn make_rulebook() -> RuleBook {
        let mut book = RuleBook {
            rules: vec![Rule {
                name: "urgent".into(),
                conditions: vec![Condition::SubjectContains(vec!["urgent".into()])],
                priority: 1,
                template: "urgent_response".into(),
            }],
            exclusions: Exclusions {
                from_addresses: vec!["noreply@".into()],
                ..Default::default()
            },
            ..Default::default()
        };
        book.templates.insert(
            "urgent_response".into(),
            Template::new(
                "urgent_response",
                "Re: {original_subject} - Urgent Response",
                "Hello {sender_name}, we are on it.",
            ),
        );
        book
    }

    async fn setup(mailbox: Arc<RecordingMailbox>) -> (ActionDispatcher, Arc<LibSqlLedger>) {
        let ledger = Arc::new(LibSqlLedger::new_memory().await.unwrap());
        let dispatcher = ActionDispatcher::new(mailbox, ledger.clone(), Arc::new(make_rulebook()));
        (dispatcher, ledger)
    }

    #[tokio::test]
    async fn draft_mode_drafts_and_records() {
        let mailbox = Arc::new(RecordingMailbox::default());
        let (dispatcher, ledger) = setup(mailbox.clone()).await;

        let record = dispatcher
            .dispatch(&make_message("URGENT: server down"), Mode::Draft)
            .await;
        assert_eq!(record.state, DispatchState::Drafted);
        assert_eq!(record.rule.as_deref(), Some("urgent"));
        assert!(record.ledger_error.is_none());

        let drafts = mailbox.drafts.lock().unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].subject, "Re: URGENT: server down - Urgent Response");

        let entry = ledger.get("<m1@b.com>").await.unwrap().unwrap();
        assert_eq!(entry.action, LedgerAction::Drafted);
        assert_eq!(entry.rule_name.as_deref(), Some("urgent"));
    }

    #[tokio::test]
    async fn already_processed_makes_no_external_call() {
        let mailbox = Arc::new(RecordingMailbox::default());
        let (dispatcher, ledger) = setup(mailbox.clone()).await;
        ledger
            .record("<m1@b.com>", LedgerAction::Sent, None)
            .await
            .unwrap();

        let record = dispatcher
            .dispatch(&make_message("URGENT: server down"), Mode::Send)
            .await;
        assert_eq!(record.state, DispatchState::Skipped(SkipReason::AlreadyProcessed));
        assert!(mailbox.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mode_logs_without_side_effects() {
        let mailbox = Arc::new(RecordingMailbox::default());
        let (dispatcher, ledger) = setup(mailbox.clone()).await;

        let msg = make_message("urgent");
        for _ in 0..2 {
            let record = dispatcher.dispatch(&msg, Mode::Test).await;
            assert_eq!(record.state, DispatchState::Logged);
        }
        assert!(mailbox.drafts.lock().unwrap().is_empty());
        assert!(mailbox.sent.lock().unwrap().is_empty());
        assert_eq!(ledger.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn send_mode_sends_and_records() {
        let mailbox = Arc::new(RecordingMailbox::default());
        let (dispatcher, ledger) = setup(mailbox.clone()).await;

        let record = dispatcher.dispatch(&make_message("urgent"), Mode::Send).await;
        assert_eq!(record.state, DispatchState::Sent);
        assert_eq!(mailbox.sent.lock().unwrap().len(), 1);
        assert!(mailbox.drafts.lock().unwrap().is_empty());
        assert_eq!(
            ledger.get("<m1@b.com>").await.unwrap().unwrap().action,
            LedgerAction::Sent
        );
    }

    #[tokio::test]
    async fn no_rule_matched_leaves_ledger_unchanged() {
        let mailbox = Arc::new(RecordingMailbox::default());
        let (dispatcher, ledger) = setup(mailbox.clone()).await;

        let record = dispatcher.dispatch(&make_message("Lunch?"), Mode::Draft).await;
        assert_eq!(record.state, DispatchState::Skipped(SkipReason::NoRuleMatched));
        assert!(record.rule.is_none());
        assert_eq!(ledger.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn excluded_sender_is_skipped() {
        let mailbox = Arc::new(RecordingMailbox::default());
        let (dispatcher, ledger) = setup(mailbox.clone()).await;

        let mut msg = make_message("urgent");
        msg.sender = "noreply@b.com".into();
        let record = dispatcher.dispatch(&msg, Mode::Draft).await;
        assert_eq!(record.state, DispatchState::Skipped(SkipReason::Excluded));
        assert!(mailbox.drafts.lock().unwrap().is_empty());
        assert_eq!(ledger.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn template_error_skips_message() {
        let mailbox = Arc::new(RecordingMailbox::default());
        let ledger = Arc::new(LibSqlLedger::new_memory().await.unwrap());
        let mut book = make_rulebook();
        book.templates.insert(
            "urgent_response".into(),
            Template::new("urgent_response", "Re: {original_subject", "body"),
        );
        let dispatcher = ActionDispatcher::new(mailbox.clone(), ledger.clone(), Arc::new(book));

        let record = dispatcher.dispatch(&make_message("urgent"), Mode::Draft).await;
        assert_eq!(record.state.label(), "template-error");
        assert_eq!(record.rule.as_deref(), Some("urgent"));
        assert!(mailbox.drafts.lock().unwrap().is_empty());
        assert_eq!(ledger.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn draft_failure_leaves_ledger_untouched() {
        let mailbox = Arc::new(RecordingMailbox {
            fail_drafts: true,
            ..Default::default()
        });
        let (dispatcher, ledger) = setup(mailbox).await;

        let record = dispatcher.dispatch(&make_message("urgent"), Mode::Draft).await;
        assert!(matches!(record.state, DispatchState::Failed { .. }));
        assert!(!ledger.has("<m1@b.com>").await.unwrap());
    }

    #[tokio::test]
    async fn ledger_write_failure_is_surfaced() {
        let mailbox = Arc::new(RecordingMailbox::default());
        let dispatcher = ActionDispatcher::new(
            mailbox.clone(),
            Arc::new(BrokenLedger { fail_reads: false }),
            Arc::new(make_rulebook()),
        );

        let record = dispatcher.dispatch(&make_message("urgent"), Mode::Draft).await;
        // The draft exists; only the bookkeeping failed.
        assert_eq!(record.state, DispatchState::Drafted);
        assert!(record.ledger_error.as_deref().unwrap().contains("database is locked"));
        assert_eq!(mailbox.drafts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ledger_read_failure_fails_without_external_call() {
        let mailbox = Arc::new(RecordingMailbox::default());
        let dispatcher = ActionDispatcher::new(
            mailbox.clone(),
            Arc::new(BrokenLedger { fail_reads: true }),
            Arc::new(make_rulebook()),
        );

        let record = dispatcher.dispatch(&make_message("urgent"), Mode::Send).await;
        assert!(matches!(record.state, DispatchState::Failed { .. }));
        assert!(mailbox.sent.lock().unwrap().is_empty());
    }
}
