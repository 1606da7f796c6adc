//! PRM backup runner - main entry point
//!
//! Performs exactly one backup run per invocation and exits with a status
//! reflecting the verdict.

use anyhow::Context;
use clap::Parser;
use prm_backup::transfer::progress::logging_observer;
use prm_backup::{utils, BackupConfig, BackupExecutor};
use std::path::PathBuf;
use std::process::ExitCode;

/// EX_SOFTWARE: startup failed after the configuration was accepted
const EXIT_RUNTIME: u8 = 70;

/// EX_CONFIG: configuration missing or invalid
const EXIT_CONFIG: u8 = 78;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON, or TOML with a .toml extension)
    #[arg(value_name = "CONFIG", env = "PRM_BACKUP_CONFIG_PATH")]
    config_path: Option<PathBuf>,

    /// Path to configuration file (takes precedence over CONFIG)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let Some(config_path) = args.config.clone().or_else(|| args.config_path.clone()) else {
        eprintln!("Missing argument: config path (pass CONFIG or set PRM_BACKUP_CONFIG_PATH)");
        return ExitCode::from(EXIT_CONFIG);
    };

    let config = match BackupConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if args.check {
        println!("Configuration OK: {}", config_path.display());
        return ExitCode::SUCCESS;
    }

    match run(args, config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{:#}", e);
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}

async fn run(args: Args, config: BackupConfig) -> anyhow::Result<ExitCode> {
    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level).context("Failed to initialize logging")?;

    tracing::info!("Starting prm-backup v{}", env!("CARGO_PKG_VERSION"));
    tracing::debug!("Configuration: {:?}", config);

    let executor = BackupExecutor::from_config(config)
        .context("Failed to set up notifications")?
        .with_progress(logging_observer("backup"));

    let report = executor.run().await;

    Ok(if report.verdict().is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
