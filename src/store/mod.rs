//! Persistence layer: the libSQL-backed processed-message ledger.

pub mod ledger;
pub mod libsql_backend;
pub mod migrations;

pub use ledger::{Ledger, LedgerAction, LedgerEntry};
pub use libsql_backend::LibSqlLedger;
