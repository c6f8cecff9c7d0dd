//! Flowgate CLI
//!
//! Runs a built-in scenario against the in-memory chain and exits with the
//! scenario's status: 0 when every job succeeded, 1 otherwise, 130 when
//! interrupted with Ctrl-C.
//!
//! Usage:
//!   cargo run --bin flowgate -- smoke
//!   cargo run --bin flowgate -- failure-demo --output target/failure.json
//!
//! Environment (overridden by flags):
//!   LOCK_POLL_INTERVAL_MS, LOCK_TIMEOUT_MS, QUERY_RETRY_INTERVAL_MS,
//!   QUERY_MAX_ATTEMPTS, OUTPUT_PATH, START_KEY_ID, REUSE_KEYS, INTERRUPT_KEY_MARGIN,
//!   KEY_URI_PREFIX, TIP_STEP

mod scenarios;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;

use flowgate_core::{HarnessConfig, MemoryChain, PollConfig, ScenarioError, ScenarioRunner};

use crate::scenarios::ScenarioKind;

/// Scenario runner for the flowgate orchestration engine
#[derive(Parser, Debug)]
#[command(name = "flowgate")]
#[command(about = "Run a test scenario against the in-memory chain")]
struct Args {
    /// Scenario to run
    #[arg(value_enum, default_value_t = ScenarioKind::Smoke)]
    scenario: ScenarioKind,

    /// Snapshot output path
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,

    /// Resource lock re-check interval in milliseconds
    #[arg(long)]
    lock_poll_ms: Option<u64>,

    /// Resource lock acquisition timeout in milliseconds
    #[arg(long)]
    lock_timeout_ms: Option<u64>,

    /// Convergence poll interval in milliseconds
    #[arg(long)]
    query_retry_ms: Option<u64>,

    /// Convergence poll attempts
    #[arg(long)]
    query_attempts: Option<u32>,

    /// Continue account derivation from the previous snapshot
    #[arg(long)]
    reuse_keys: bool,

    /// Simulated block time in milliseconds
    #[arg(long, default_value_t = 6000)]
    block_time_ms: u64,

    /// Simulated indexer lag in milliseconds
    #[arg(long, default_value_t = 12000)]
    indexer_lag_ms: u64,
}

impl Args {
    /// Apply flag overrides on top of the environment configuration.
    fn apply(&self, mut config: HarnessConfig) -> HarnessConfig {
        if let Some(path) = &self.output {
            config.output_path = path.clone();
        }
        if let Some(ms) = self.lock_poll_ms {
            config.lock_poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.lock_timeout_ms {
            config.lock_timeout = Duration::from_millis(ms);
        }
        let interval = self
            .query_retry_ms
            .map(Duration::from_millis)
            .unwrap_or(config.query_poll.interval);
        let attempts = self
            .query_attempts
            .unwrap_or(config.query_poll.max_attempts);
        config.query_poll = PollConfig::new(interval, attempts);
        if self.reuse_keys {
            config.reuse_keys = true;
        }
        config
    }
}

#[tokio::main]
async fn main() {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let config = match HarnessConfig::from_env() {
        Ok(config) => args.apply(config),
        Err(e) => {
            eprintln!("{} {:#}", "ERROR:".red().bold(), e);
            std::process::exit(1);
        }
    };
    let output_path = config.output_path.clone();

    let chain = Arc::new(
        MemoryChain::new()
            .with_block_time(Duration::from_millis(args.block_time_ms))
            .with_indexer_lag(Duration::from_millis(args.indexer_lag_ms)),
    );
    let kind = args.scenario;

    println!("\n{}", "═".repeat(60));
    println!("{} {}", "SCENARIO".bold(), kind.as_str().cyan());
    println!("{}", "═".repeat(60));

    let code = match ScenarioRunner::new(kind.as_str(), chain.clone(), chain, config)
        .run(|s| kind.define(s))
        .await
    {
        Ok(outcome) => {
            let status = match outcome.exit_code() {
                0 => "PASSED".green().bold(),
                130 => "INTERRUPTED".yellow().bold(),
                _ => "FAILED".red().bold(),
            };
            println!("{} {}", "Result:".bold(), status);
            if let Err(e) = outcome.ensure_success() {
                println!("  {}", e.to_string().red());
            }
            println!("  Snapshot: {}", output_path.display());
            outcome.exit_code()
        }
        Err(ScenarioError::Interrupted) => 130,
        Err(e) => {
            eprintln!("{} {}", "ERROR:".red().bold(), e);
            1
        }
    };

    std::process::exit(code);
}
