use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::{
    config::{AppConfig, Cli, Command},
    services::{control::CallControl, restore_service::RestoreRequest},
};

mod commands;
mod config;
mod errors;
mod models;
mod services;
#[cfg(test)]
mod test_support;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // --- Logging setup ---
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // --- Config: file -> env -> flags ---
    let cfg = AppConfig::from_cli(&cli)?;
    tracing::debug!("namespace={} backend={:?}", cfg.namespace, cfg.storage.backend);

    // --- Cancellation ---
    let control = CallControl::new(CancellationToken::new(), cfg.backup.timeout());
    let on_signal = control.token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            on_signal.cancel();
        }
    });
    match control.timeout() {
        Some(limit) => tracing::debug!("external calls time out after {}s", limit.as_secs()),
        None => tracing::debug!("external calls have no timeout"),
    }

    match cli.command.unwrap_or(Command::Backup) {
        Command::Backup => commands::pipeline_commands::backup(cfg, control).await,
        Command::Restore {
            object,
            pool,
            image,
            force,
        } => {
            let request = RestoreRequest {
                object_name: object,
                pool,
                image,
                force,
            };
            commands::pipeline_commands::restore(cfg, request, control).await
        }
        Command::List { prefix, json } => {
            commands::object_commands::list(cfg, prefix, json, control).await
        }
        Command::Validate { pool } => commands::health_commands::validate(cfg, pool, control).await,
        Command::Delete { object } => commands::object_commands::delete(cfg, object, control).await,
    }
}
