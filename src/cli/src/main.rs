//! Repin CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use repin_cli::{App, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Stdout carries the rewritten manifest stream; everything else goes to
    // stderr.
    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let app = match App::new(cli) {
        Ok(app) => app,
        Err(e) => {
            tracing::error!("invalid options: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = app.run().await {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}
