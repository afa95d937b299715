//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::pipeline::types::Mode;

/// Default location of the rule book.
pub const DEFAULT_RULES_PATH: &str = "config/response_rules.yaml";

/// Responder configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    /// YAML rule book path.
    pub rules_path: PathBuf,
    /// libSQL ledger path.
    pub db_path: PathBuf,
    /// Directory holding the log file.
    pub log_dir: PathBuf,
    /// Delay between cycles in continuous mode.
    pub check_interval: Duration,
    /// Upper bound on messages fetched per cycle.
    pub max_messages_per_run: usize,
    /// Mode requested through `RESPONDER_MODE`, if any.
    pub env_mode: Option<Mode>,
    /// Explicit opt-in required before `RESPONDER_MODE=send` is honored.
    pub allow_send: bool,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            rules_path: PathBuf::from(DEFAULT_RULES_PATH),
            db_path: PathBuf::from("./data/autoresponder.db"),
            log_dir: PathBuf::from("logs"),
            check_interval: Duration::from_secs(5 * 60),
            max_messages_per_run: 10,
            env_mode: None,
            allow_send: false,
        }
    }
}

impl ResponderConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let check_interval = match get("CHECK_INTERVAL_MINUTES") {
            Some(raw) => {
                let minutes: u64 = parse_value("CHECK_INTERVAL_MINUTES", &raw)?;
                if minutes == 0 {
                    return Err(invalid("CHECK_INTERVAL_MINUTES", "must be at least 1"));
                }
                Duration::from_secs(minutes * 60)
            }
            None => defaults.check_interval,
        };

        let max_messages_per_run = match get("MAX_EMAILS_PER_RUN") {
            Some(raw) => {
                let max: usize = parse_value("MAX_EMAILS_PER_RUN", &raw)?;
                if max == 0 {
                    return Err(invalid("MAX_EMAILS_PER_RUN", "must be at least 1"));
                }
                max
            }
            None => defaults.max_messages_per_run,
        };

        let env_mode = get("RESPONDER_MODE")
            .map(|raw| {
                raw.parse::<Mode>()
                    .map_err(|message| invalid("RESPONDER_MODE", &message))
            })
            .transpose()?;

        let allow_send = match get("RESPONDER_ALLOW_SEND") {
            Some(raw) => parse_bool("RESPONDER_ALLOW_SEND", &raw)?,
            None => false,
        };

        Ok(Self {
            rules_path: get("RESPONDER_RULES_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.rules_path),
            db_path: get("RESPONDER_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            log_dir: get("LOG_DIR").map(PathBuf::from).unwrap_or(defaults.log_dir),
            check_interval,
            max_messages_per_run,
            env_mode,
            allow_send,
        })
    }

    /// Pick the operating mode: CLI flag, then `RESPONDER_MODE`, then draft.
    ///
    /// Send from the environment needs `RESPONDER_ALLOW_SEND=true`; the CLI
    /// flag is already an explicit opt-in.
    pub fn resolve_mode(&self, cli: Option<Mode>) -> Result<Mode, ConfigError> {
        if let Some(mode) = cli {
            return Ok(mode);
        }
        match self.env_mode {
            Some(Mode::Send) if !self.allow_send => Err(ConfigError::SendNotAllowed),
            Some(mode) => Ok(mode),
            None => Ok(Mode::default()),
        }
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| invalid(key, &format!("{raw:?}: {e}")))
}

/// Parse a boolean flag value (`true/false`, `1/0`, `yes/no`).
pub(crate) fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(invalid(key, &format!("expected a boolean, got {other:?}"))),
    }
}
