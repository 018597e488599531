use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use scrapewatch::config::DEFAULT_SETTINGS_PATH;
use scrapewatch::{Orchestrator, OrchestratorResult, ProbeRegistry, Settings, VERSION};

#[derive(Debug, Parser)]
#[command(name = "scrapewatch", version, about = "Availability probe orchestrator")]
struct Cli {
    /// Settings file
    #[arg(short, long, default_value = DEFAULT_SETTINGS_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run every task once, retrying the ones that end Unknown
    Once,
    /// Run the tasks whose names match a pattern (`*` matches anything)
    Test { pattern: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config);

    let level = settings
        .as_ref()
        .map(Settings::log_level)
        .unwrap_or(log::LevelFilter::Info);
    env_logger::builder()
        .filter_level(log::LevelFilter::Warn)
        .filter_module("scrapewatch", level)
        .parse_default_env()
        .init();

    let settings = match settings {
        Ok(settings) => settings,
        Err(err) => {
            log::error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    log::info!("scrapewatch {VERSION} starting with {} task(s)", settings.tasks.len());
    match run(cli.command, &settings).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Option<Command>, settings: &Settings) -> OrchestratorResult<u8> {
    let orchestrator = Orchestrator::from_settings(settings, &ProbeRegistry::with_builtin())?;

    match command {
        None => {
            orchestrator.run_continuous().await?;
            Ok(0)
        }
        Some(Command::Once) => {
            let summary = orchestrator.run_batch().await?;
            for report in summary.failed() {
                log::warn!("task {} ended with status {}", report.name, report.status);
            }
            Ok(summary.exit_code() as u8)
        }
        Some(Command::Test { pattern }) => {
            let summary = orchestrator.run_filtered(&pattern).await?;
            Ok(summary.exit_code() as u8)
        }
    }
}
