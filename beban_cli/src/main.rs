//! Beban CLI: run YAML load-test scenarios from the command line.
//!
//! ## Usage
//!
//! ```bash
//! beban validate scenarios/login_stress.yaml
//! beban run scenarios/login_stress.yaml
//! beban run scenarios/read_item_list.yaml --vus 5 --duration 30s --out summary.json
//! ```

mod cli;

use std::{path::Path, process::ExitCode, sync::Arc};

use beban::{
    ConfigError, Overrides, RunError, Runner, Scenario, ScenarioFile, Thresholds,
    report::{ConsoleReporter, JsonReporter, Reporter, Summary},
};
use clap::Parser;
use console::style;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command, RunArgs};

const EXIT_REPORT: u8 = 1;
const EXIT_CONFIG: u8 = 104;
const EXIT_SETUP: u8 = 107;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Validate(args) => validate(&args.file),
        Command::Run(args) => run(args).await,
    }
}

fn load(path: &Path, overrides: &Overrides) -> Result<beban::config::CompiledScenario, ConfigError> {
    ScenarioFile::load(path)?.compile(overrides)
}

fn validate(path: &Path) -> ExitCode {
    match load(path, &Overrides::default()) {
        Ok(compiled) => {
            let schedule = &compiled.executor.schedule;
            println!(
                "{} {} is valid: {} steps, up to {} VUs over {}",
                style("✓").green().bold(),
                compiled.name,
                compiled.plan.len(),
                schedule.max_vus(),
                humantime::format_duration(schedule.total_duration()),
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{} {}: {e}", style("✗").red().bold(), path.display());
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

async fn run(args: RunArgs) -> ExitCode {
    let overrides = Overrides {
        vus: args.vus,
        duration: args.duration,
        base_url: args.base_url,
        seed: args.seed,
    };
    let mut compiled = match load(&args.file, &overrides) {
        Ok(compiled) => compiled,
        Err(e) => {
            tracing::error!("{}: {e}", args.file.display());
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if args.no_thresholds {
        tracing::info!("Ignoring {} thresholds", compiled.thresholds.iter().count());
        compiled.thresholds = Thresholds::default();
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, stopping VUs");
                cancel.cancel();
            }
        }
    });

    let scenario = Scenario::builder()
        .name(compiled.name)
        .action(Arc::new(compiled.plan).action())
        .thresholds(compiled.thresholds)
        .build();
    let runner = Runner::builder()
        .executor(compiled.executor)
        .client(compiled.client)
        .base_url(compiled.base_url)
        .seed(compiled.seed)
        .cancel(cancel)
        .build();

    let result = match runner.run(&scenario).await {
        Ok(result) => result,
        Err(RunError::Config(e)) => {
            tracing::error!("{e}");
            return ExitCode::from(EXIT_CONFIG);
        }
        Err(RunError::Setup(e)) => {
            tracing::error!("Setup failed: {e}");
            return ExitCode::from(EXIT_SETUP);
        }
    };

    let summary = Summary::from(&result);
    if let Err(e) = ConsoleReporter::default().report(&summary).await {
        tracing::error!("{e}");
        return ExitCode::from(EXIT_REPORT);
    }
    if let Some(path) = args.out {
        if let Err(e) = (JsonReporter { path }).report(&summary).await {
            tracing::error!("{e}");
            return ExitCode::from(EXIT_REPORT);
        }
    }

    // Outcome codes are all below 256.
    ExitCode::from(result.outcome.exit_code() as u8)
}
