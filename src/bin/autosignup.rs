#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! CLI for batch account registration

use autosignup::config::{self, Settings};
use autosignup::{
    AccountStore, AttemptStatus, BatchReport, ChromeDriverFactory, CodeParser, MailClient,
    Orchestrator, store,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Exit status after Ctrl-C.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "autosignup")]
#[command(about = "Register accounts with catch-all mail verification")]
#[command(args_conflicts_with_subcommands = true)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Number of accounts to register
    #[arg(default_value_t = 1)]
    total: usize,

    /// Attempts running at the same time
    #[arg(default_value_t = 1)]
    concurrency: usize,

    /// Exit unsuccessfully when fewer accounts were registered
    #[arg(long, default_value_t = 0)]
    min_success: usize,
}

#[derive(Subcommand)]
enum Command {
    /// Merge the per-account JSON files into one array
    MergeAccounts {
        /// Output file (default: accounts_merged-YYYY-MM-DD.json)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config::log_level_from_env()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    match &args.command {
        Some(Command::MergeAccounts { output }) => cmd_merge(output.clone()),
        None => cmd_register(args.total, args.concurrency, args.min_success).await,
    }
}

async fn cmd_register(
    total: usize,
    concurrency: usize,
    min_success: usize,
) -> anyhow::Result<ExitCode> {
    let settings = Settings::from_env()?;

    let store = AccountStore::new(&settings.accounts_dir);
    let mail = MailClient::new(
        settings.imap.clone(),
        CodeParser::new(settings.code_length),
        settings.subject_filter.clone(),
    );
    let factory = ChromeDriverFactory::new(settings.browser.clone());
    let orchestrator = Orchestrator::new(&settings, factory, mail, store);

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling remaining attempts");
                cancel.cancel();
            }
        })
    };

    let result = orchestrator.run_batch(total, concurrency, &cancel).await;
    watcher.abort();
    orchestrator.code_source().shutdown().await;
    let report = result?;

    print_summary(&report);

    if cancel.is_cancelled() {
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }
    if report.meets_threshold(min_success) {
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!(
            "Only {} of the required {} accounts were registered",
            report.succeeded(),
            min_success
        );
        Ok(ExitCode::FAILURE)
    }
}

fn cmd_merge(output: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let dir = config::accounts_dir_from_env();
    let output = output.unwrap_or_else(|| {
        PathBuf::from(format!(
            "accounts_merged-{}.json",
            chrono::Local::now().format("%Y-%m-%d")
        ))
    });

    let report = store::merge(&dir, &output)?;
    info!("Merge of {} finished", dir.display());

    println!(
        "Merged {} account(s) from {} file(s) into {}",
        report.merged,
        report.files,
        output.display()
    );
    for path in &report.skipped {
        println!("Skipped malformed file {}", path.display());
    }

    Ok(ExitCode::SUCCESS)
}

fn print_summary(report: &BatchReport) {
    println!(
        "{:<4} {:<36} {:<6} {:<8} {}",
        "ID", "Email", "Tries", "Time", "Result"
    );
    println!("{}", "-".repeat(100));

    for attempt in &report.attempts {
        let result = match &attempt.status {
            AttemptStatus::Succeeded { .. } => "ok".to_string(),
            other => other.to_string(),
        };
        println!(
            "{:<4} {:<36} {:<6} {:<8} {}",
            attempt.id,
            truncate(&attempt.email, 34),
            attempt.tries,
            format!("{:.1}s", attempt.elapsed.as_secs_f64()),
            result,
        );
    }

    println!(
        "\n{} succeeded, {} failed, {} cancelled",
        report.succeeded(),
        report.failed(),
        report.cancelled()
    );
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}
