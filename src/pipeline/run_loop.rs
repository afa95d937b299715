//! Run loop: fetch, normalize, dispatch, report.
//!
//! One cycle processes the fetched candidates one at a time in fetch order.
//! Cancellation is checked between messages only, so a dispatch in flight
//! always reaches a terminal state before the loop exits.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::config::ResponderConfig;
use crate::error::FetchError;
use crate::pipeline::dispatcher::ActionDispatcher;
use crate::pipeline::types::{DispatchState, Mailbox, Message, Mode, RunResult};
use crate::rulebook::RuleBook;
use crate::store::LibSqlLedger;

/// Cooperative shutdown signal shared between the loop and signal handlers.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}

/// Drives cycles against one mailbox.
pub struct Responder {
    mailbox: Arc<dyn Mailbox>,
    dispatcher: ActionDispatcher,
    max_messages_per_run: usize,
    /// Only one cycle runs at a time, so `has` + `record` never race.
    cycle_lock: Mutex<()>,
}

impl Responder {
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        dispatcher: ActionDispatcher,
        max_messages_per_run: usize,
    ) -> Self {
        Self {
            mailbox,
            dispatcher,
            max_messages_per_run,
            cycle_lock: Mutex::new(()),
        }
    }

    /// Open the ledger at `config.db_path` and wire a responder around `mailbox`.
    pub async fn open(
        config: &ResponderConfig,
        rulebook: RuleBook,
        mailbox: Arc<dyn Mailbox>,
    ) -> crate::Result<Self> {
        let ledger = Arc::new(LibSqlLedger::new_local(&config.db_path).await?);
        let dispatcher = ActionDispatcher::new(Arc::clone(&mailbox), ledger, Arc::new(rulebook));
        Ok(Self::new(mailbox, dispatcher, config.max_messages_per_run))
    }

    /// Run one cycle. A fetch failure aborts the cycle and is returned;
    /// per-message failures end up in the `RunResult`.
    pub async fn run_cycle(&self, mode: Mode, shutdown: &Shutdown) -> Result<RunResult, FetchError> {
        let _guard = self.cycle_lock.lock().await;
        let mut result = RunResult::new(mode);

        debug!(
            run_id = %result.run_id,
            mailbox = self.mailbox.name(),
            limit = self.max_messages_per_run,
            "Fetching unread messages"
        );
        let fetched = self.mailbox.fetch_unread(self.max_messages_per_run).await?;

        if fetched.is_empty() {
            debug!(run_id = %result.run_id, "No unread messages");
            return Ok(result);
        }
        info!(run_id = %result.run_id, count = fetched.len(), "Processing unread messages");

        for fetched_message in fetched {
            if shutdown.is_triggered() {
                info!(run_id = %result.run_id, "Shutdown requested, stopping between messages");
                result.interrupted = true;
                break;
            }

            let message = Message::normalize(fetched_message);
            let record = self.dispatcher.dispatch(&message, mode).await;
            result.records.push(record);
        }

        Ok(result)
    }

    /// Repeat cycles every `interval` until `shutdown` fires.
    pub async fn run_continuously(&self, mode: Mode, interval: Duration, shutdown: Shutdown) {
        info!(
            mode = %mode,
            interval_secs = interval.as_secs(),
            "Starting continuous mode"
        );

        loop {
            match self.run_cycle(mode, &shutdown).await {
                Ok(result) => log_run_result(&result),
                Err(e) => error!(error = %e, "Fetch failed, cycle aborted; retrying next interval"),
            }

            if shutdown.is_triggered() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.wait() => break,
            }
        }

        info!("Responder stopped");
    }
}

/// Emit a cycle's outcome: one line per message, then a summary.
pub fn log_run_result(result: &RunResult) {
    for record in &result.records {
        let rule = record.rule.as_deref().unwrap_or("-");
        match &record.state {
            DispatchState::Failed { reason } => warn!(
                run_id = %result.run_id,
                message_id = %record.message_id,
                rule,
                outcome = record.state.label(),
                reason = %reason,
                "Message outcome"
            ),
            state => info!(
                run_id = %result.run_id,
                message_id = %record.message_id,
                rule,
                outcome = state.label(),
                "Message outcome"
            ),
        }
        if let Some(ledger_error) = &record.ledger_error {
            error!(
                run_id = %result.run_id,
                message_id = %record.message_id,
                outcome = record.state.label(),
                error = %ledger_error,
                "Action completed but was not recorded in the ledger"
            );
        }
    }

    info!(
        run_id = %result.run_id,
        mode = %result.mode,
        total = result.records.len(),
        drafted = result.count("drafted"),
        sent = result.count("sent"),
        logged = result.count("logged"),
        skipped = result
            .records
            .iter()
            .filter(|r| matches!(r.state, DispatchState::Skipped(_)))
            .count(),
        failed = result.failures().count(),
        interrupted = result.interrupted,
        "Cycle complete"
    );

    if tracing::enabled!(tracing::Level::DEBUG)
        && let Ok(json) = serde_json::to_string(result)
    {
        debug!(run_id = %result.run_id, result = %json, "Run result");
    }
}
