// Companion entry point.
//
// Startup sequence:
// 1. Parse arguments
// 2. Initialize tracing (log to file; `serve` also logs to stderr)
// 3. Load config (copies defaults into config/ on first run)
// 4. Dispatch the subcommand

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use companion_app::cli::{Cli, Command};
use companion_app::commands;
use companion_core::config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(matches!(cli.command, Command::Serve))?;
    info!("Companion starting up");

    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: model={}, storage={}, relay={}",
        config.llm.model,
        config.storage.primary,
        config.server.bind_address()
    );

    commands::run(cli.command, config).await
}

/// Log to `logs/companion.log`, keeping the terminal free for the chat.
fn init_tracing(mirror_to_stderr: bool) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = Arc::new(std::fs::File::create(log_dir.join("companion.log"))?);
    let writer = if mirror_to_stderr {
        BoxMakeWriter::new(log_file.and(std::io::stderr))
    } else {
        BoxMakeWriter::new(log_file)
    };

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(
                "companion_app=info,companion_core=info,companion_llm=info,companion_relay=info,tower_http=info,warn",
            )
        }))
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
