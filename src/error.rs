//! Error types for the auto-responder.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Configuration errors. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("Rule at position {index} has an empty name")]
    EmptyRuleName { index: usize },

    #[error("Duplicate rule name: {name}")]
    DuplicateRule { name: String },

    #[error("Duplicate template name: {name}")]
    DuplicateTemplate { name: String },

    #[error("Rule {rule} references unknown template {template}")]
    UnknownTemplate { rule: String, template: String },

    #[error("Template file {path} must start with a 'Subject:' line")]
    MissingSubjectLine { path: String },

    #[error("Template {name} is malformed: {source}")]
    MalformedTemplate {
        name: String,
        #[source]
        source: TemplateError,
    },

    #[error("Send mode requested via RESPONDER_MODE but RESPONDER_ALLOW_SEND is not 'true'")]
    SendNotAllowed,

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failure to list or fetch unread mail. Aborts the cycle, not the process.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Connection to {host} failed: {reason}")]
    Connect { host: String, reason: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Fetch task failed: {0}")]
    Task(String),
}

/// Template rendering errors. Per message; the message is skipped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("Unterminated placeholder starting at byte {position}")]
    UnterminatedPlaceholder { position: usize },
}

/// Draft creation errors. Per message; the message is retried next cycle.
#[derive(Debug, thiserror::Error)]
pub enum DraftError {
    #[error("Failed to build draft: {0}")]
    Build(String),

    #[error("Drafts mailbox rejected the draft: {0}")]
    Rejected(String),

    #[error("Draft transport failed: {0}")]
    Transport(String),
}

/// Send errors. Per message; the message is retried next cycle.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build message: {0}")]
    Build(String),

    #[error("SMTP send failed: {0}")]
    Transport(String),
}

/// Ledger persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Failed to open ledger: {0}")]
    Open(String),

    #[error("Ledger migration failed: {0}")]
    Migration(String),

    #[error("Ledger query failed: {0}")]
    Query(String),

    /// The external action already happened; only the bookkeeping failed.
    #[error("Failed to record {message_id} in ledger: {reason}")]
    Write { message_id: String, reason: String },

    #[error("Message {message_id} is already recorded in the ledger")]
    AlreadyRecorded { message_id: String },
}

/// Result type alias for the auto-responder.
pub type Result<T> = std::result::Result<T, Error>;
