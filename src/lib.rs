//! Mail Autoresponder: rule-based replies to unread mail.

pub mod channels;
pub mod cli;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod rulebook;
pub mod store;

pub use error::{Error, Result};
