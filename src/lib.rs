pub mod commands;
pub mod consolidation;
pub mod db;
pub mod settings;
mod utils;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use commands::{Cli, CommandOutput};
use consolidation::Pipeline;
use db::Database;
use settings::PipelineSettings;

async fn execute(cli: Cli) -> Result<CommandOutput> {
    let mut settings = PipelineSettings::load(&cli.settings)?;
    settings.apply_env()?;
    let config = settings.into_config().context("invalid pipeline settings")?;
    log::info!("Pipeline settings: {config:?}");

    let database = Database::new(cli.db.clone())?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupted; finishing in-flight work");
                cancel.cancel();
            }
        });
    }

    let pipeline = Pipeline::new(database, config).with_cancellation(cancel);
    commands::dispatch(&pipeline, &cli.command).await
}

pub fn run() -> ExitCode {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            log::error!("Failed to start tokio runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(execute(cli)) {
        Ok(output) => {
            match serde_json::to_string_pretty(&output) {
                Ok(json) => println!("{json}"),
                Err(err) => log::error!("Failed to render output: {err}"),
            }
            if output.has_quarantine() {
                ExitCode::from(2)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(err) => {
            log::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
