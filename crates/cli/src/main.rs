#![forbid(unsafe_code)]

use clap::Parser;
use config::Config;
use flume::bounded;
use portwatch::{cli::Cli, commands, signals::wait_for_signal};
use std::io::Write;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(cli.verbosity.tracing_level_filter().into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    debug!(config = ?cli);

    let mut config = match &cli.conffile {
        Some(path) => Config::load(path)?,
        _ => Config::new()?,
    };
    if let Some(endpoint) = cli.endpoint {
        config.client.endpoint = endpoint;
    }

    let mut stdout = std::io::stdout();
    if !cli.command.needs_connection() {
        writeln!(stdout, "{}", config.to_toml()?)?;
        return Ok(());
    }

    let client = commands::connect(&config.client).await?;
    let (events_tx, events_rx) = bounded(8);

    let result = tokio::select! {
        err = wait_for_signal(&events_tx) => {
            error!(error = ?err, "Error while waiting for signal");
            err
        }
        res = commands::run(&client, cli.command, &config, &events_rx, &mut stdout) => res,
    };
    client.close();
    Ok(result?)
}
