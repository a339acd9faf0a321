use anyhow::Result;
use clap::Parser;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod cli_command_handlers;
mod cli_config;
mod cli_runtime_helpers;

use cli::Cli;
use cli_command_handlers::run_cli;
use cli_config::{ensure_default_config_exists, load_config};
use cli_runtime_helpers::output_error;

const CLI_SCHEMA_VERSION: &str = "inboxsync.cli.v1";
const LOG_ENV: &str = "INBOXSYNC_LOG";

fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries JSON results; logs go to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(err) = ensure_default_config_exists() {
        warn!(error = %err, "config bootstrap failed");
    }
    let config = load_config();
    let rt = tokio::runtime::Runtime::new()?;
    if let Err(err) = run_cli(&rt, cli.command, &config) {
        return output_error(&err.to_string());
    }
    Ok(())
}
