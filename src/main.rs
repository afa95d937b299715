use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use mail_autoresponder::channels::{EmailConfig, ImapMailbox};
use mail_autoresponder::cli::Cli;
use mail_autoresponder::config::ResponderConfig;
use mail_autoresponder::pipeline::template::PLACEHOLDERS;
use mail_autoresponder::pipeline::{Mailbox, Mode, Responder, Shutdown, log_run_result};
use mail_autoresponder::rulebook::RuleBook;

/// Log file name inside the log directory.
const LOG_FILE: &str = "autoresponder.log";

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match ResponderConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(path) = &cli.config {
        config.rules_path = path.clone();
    }

    let _log_guard = init_tracing(&config.log_dir, cli.verbose);

    match run(cli, config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: ResponderConfig) -> anyhow::Result<ExitCode> {
    let rulebook = RuleBook::load(&config.rules_path)
        .with_context(|| format!("Invalid rule book {}", config.rules_path.display()))?;
    let mode = config.resolve_mode(cli.selected_mode())?;

    if cli.validate {
        println!("Configuration OK: {}", config.rules_path.display());
        println!("   Rules:      {}", rulebook.rules.len());
        for rule in &rulebook.rules {
            println!(
                "     - {} (priority {}, template {}, {} condition(s))",
                rule.name,
                rule.priority,
                rule.template,
                rule.conditions.len()
            );
        }
        println!("   Templates:  {}", rulebook.templates.len());
        println!("   Placeholders: {}", PLACEHOLDERS.join(", "));
        println!(
            "   Exclusions: {}",
            if rulebook.exclusions.is_empty() { "none" } else { "configured" }
        );
        println!("   Mode:       {mode}");
        return Ok(ExitCode::SUCCESS);
    }

    // Install rustls crypto provider before any TLS usage
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }

    let email_config = EmailConfig::from_env()?;
    info!(
        imap = %email_config.imap_host,
        smtp = %email_config.smtp_host,
        account = %email_config.username,
        "Mail account configured"
    );
    let mailbox: Arc<dyn Mailbox> = Arc::new(ImapMailbox::new(email_config));

    let responder = Responder::open(&config, rulebook, mailbox)
        .await
        .with_context(|| format!("Failed to open ledger at {}", config.db_path.display()))?;

    log_mode_banner(mode);

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, finishing the current message");
            signal.trigger();
        }
    });

    if cli.once {
        return match responder.run_cycle(mode, &shutdown).await {
            Ok(result) => {
                log_run_result(&result);
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => {
                error!(error = %e, "Fetch failed");
                Ok(ExitCode::FAILURE)
            }
        };
    }

    responder
        .run_continuously(mode, config.check_interval, shutdown)
        .await;
    Ok(ExitCode::SUCCESS)
}

fn log_mode_banner(mode: Mode) {
    match mode {
        Mode::Test => warn!(mode = %mode, "TEST MODE: responses are only logged, no mail will be drafted or sent"),
        Mode::Draft => info!(mode = %mode, "DRAFT MODE: responses are saved as drafts for review"),
        Mode::Send => warn!(mode = %mode, "SEND MODE: responses are sent immediately"),
    }
}

/// Stdout plus a log file under `log_dir`. The returned guard flushes the
/// file writer on drop, so it must live as long as `main`.
fn init_tracing(log_dir: &Path, verbose: bool) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    let stdout = fmt::layer().with_target(false);

    match std::fs::create_dir_all(log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::never(log_dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout)
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Some(guard)
        }
        Err(e) => {
            tracing_subscriber::registry().with(filter).with(stdout).init();
            warn!(dir = %log_dir.display(), error = %e, "Log directory unavailable, logging to stdout only");
            None
        }
    }
}
