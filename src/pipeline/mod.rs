//! Response pipeline.
//!
//! Every unread message flows through:
//! 1. `Mailbox::fetch_unread()`: provider I/O, read state untouched
//! 2. `Message::normalize()`: sender split, domain, label set
//! 3. `ActionDispatcher::dispatch()`: ledger check, exclusions, rule match,
//!    template render, then the mode's action
//! 4. `log_run_result()`: per-message outcomes and a cycle summary

pub mod conditions;
pub mod dispatcher;
pub mod rules;
pub mod run_loop;
pub mod template;
pub mod types;

pub use dispatcher::ActionDispatcher;
pub use run_loop::{Responder, Shutdown, log_run_result};
pub use types::{
    DispatchRecord, DispatchState, FetchedMessage, Mailbox, Message, Mode, RenderedReply,
    RunResult, SkipReason,
};
