// Ragtime experiment pipeline
// Main entry point for the ragtime binary

use clap::Parser;
use ragtime_engine::cli::{Cli, Command, ExperimentAction, KeyAction, ValidationSetAction};
use ragtime_engine::config::Config;
use ragtime_engine::handlers::{self, OutputFormat};
use ragtime_engine::telemetry::{init_telemetry, init_telemetry_with_level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the configured level; RUST_LOG wins over both
    match &cli.log {
        Some(level) => init_telemetry_with_level(level),
        None if config.core.log_level.is_empty() => init_telemetry(),
        None => init_telemetry_with_level(&config.core.log_level),
    }
    tracing::debug!("Ragtime v{}", env!("CARGO_PKG_VERSION"));

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    match cli.command {
        Command::Run { config_file } => {
            tracing::info!("Running experiment from {}", config_file.display());
            handlers::handle_run(&config_file, &config, format).await
        }

        Command::Pipeline {
            pipeline_file,
            start_from,
            stop_after,
        } => {
            tracing::info!("Running pipeline {}", pipeline_file.display());
            handlers::handle_pipeline(&pipeline_file, start_from, stop_after, &config, format).await
        }

        Command::Experiments { action } => match action {
            ExperimentAction::List => handlers::handle_experiments_list(&config, format).await,
            ExperimentAction::Show { name } => {
                handlers::handle_experiments_show(&name, &config, format).await
            }
            ExperimentAction::Delete { name } => {
                handlers::handle_experiments_delete(&name, &config, format).await
            }
        },

        Command::ValidationSets { action } => match action {
            ValidationSetAction::List => {
                handlers::handle_validation_sets_list(&config, format).await
            }
            ValidationSetAction::Show { name } => {
                handlers::handle_validation_sets_show(&name, &config, format).await
            }
            ValidationSetAction::Delete { name } => {
                handlers::handle_validation_sets_delete(&name, &config, format).await
            }
        },

        Command::Stats { file } => handlers::handle_stats(&file, format).await,

        Command::Keys { action } => match action {
            KeyAction::List => handlers::handle_keys_list(&config, format).await,
            KeyAction::Set { name, value } => {
                handlers::handle_keys_set(&name, &value, &config, format).await
            }
            KeyAction::Delete { name } => handlers::handle_keys_delete(&name, &config, format).await,
            KeyAction::Status => handlers::handle_keys_status(&config, format).await,
        },

        Command::Models => handlers::handle_models(&config, format).await,
    }
}
