//! Command-line interface.

use std::path::PathBuf;

use clap::{ArgGroup, Parser};

use crate::pipeline::types::Mode;

#[derive(Debug, Parser)]
#[command(name = "mail-autoresponder")]
#[command(about = "Rule-based email auto-responder: preview, draft or send replies to unread mail")]
#[command(version)]
#[command(group(ArgGroup::new("mode").args(["test_mode", "draft_mode", "send_mode"])))]
pub struct Cli {
    /// Run a single cycle and exit
    #[arg(long)]
    pub once: bool,

    /// Load and check the rule book, then exit
    #[arg(long)]
    pub validate: bool,

    /// Preview responses in the log only
    #[arg(long)]
    pub test_mode: bool,

    /// Save responses as drafts for manual review
    #[arg(long)]
    pub draft_mode: bool,

    /// Send responses immediately
    #[arg(long)]
    pub send_mode: bool,

    /// Rule book path (overrides RESPONDER_RULES_PATH)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Debug logging unless RUST_LOG is set
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Mode chosen on the command line, if any.
    pub fn selected_mode(&self) -> Option<Mode> {
        if self.test_mode {
            Some(Mode::Test)
        } else if self.draft_mode {
            Some(Mode::Draft)
        } else if self.send_mode {
            Some(Mode::Send)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_flags_means_no_mode() {
        let cli = Cli::try_parse_from(["mail-autoresponder"]).unwrap();
        assert_eq!(cli.selected_mode(), None);
        assert!(!cli.once);
        assert!(!cli.validate);
        assert!(cli.config.is_none());
    }

    #[test]
    fn mode_selectors() {
        let cli = Cli::try_parse_from(["mail-autoresponder", "--test-mode", "--once"]).unwrap();
        assert_eq!(cli.selected_mode(), Some(Mode::Test));
        assert!(cli.once);

        let cli = Cli::try_parse_from(["mail-autoresponder", "--send-mode"]).unwrap();
        assert_eq!(cli.selected_mode(), Some(Mode::Send));
    }

    #[test]
    fn mode_selectors_are_mutually_exclusive() {
        let err = Cli::try_parse_from(["mail-autoresponder", "--test-mode", "--send-mode"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn config_path_and_validate() {
        let cli =
            Cli::try_parse_from(["mail-autoresponder", "--validate", "-c", "rules.yaml"]).unwrap();
        assert!(cli.validate);
        assert_eq!(cli.config, Some(PathBuf::from("rules.yaml")));
    }
}
