//! Mail provider I/O.

pub mod email;
pub mod imap;

pub use email::{EmailConfig, ImapMailbox};
