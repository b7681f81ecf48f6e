//! pcs CLI
//!
//! Deploys pcs solutions to a cloud subscription.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pcs_cli::{log_filter, Cli, Error};

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr, away from command output
    tracing_subscriber::registry()
        .with(log_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    match cli.run().await {
        Ok(()) => ExitCode::SUCCESS,
        // Already rendered by the progress reporter
        Err(Error::Reported(_)) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
