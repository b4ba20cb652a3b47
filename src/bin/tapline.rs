//! Command line entry point.
//!
//! Usage:
//! ```text
//! tapline -l -p 8080                 # log every transaction
//! tapline -s --ws-app httpview       # mirror transactions to a websocket viewer
//! tapline -c ws://host:9090 --ui text
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tapline::cli::Cli;
use tapline::logging::{init_tracing, TracingLog};
use tapline::session::{self, SessionOutcome};
use tapline::ui::UiRegistry;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Held until exit so buffered file logs are flushed.
    let _guard = match init_tracing(&cli.log_config()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("tapline: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    // wss relay targets and the engine share the process-wide TLS provider.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let raw = cli.into_raw_options();
    let registry = UiRegistry::builtin();

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    match session::run(&raw, Arc::new(TracingLog), &registry, shutdown).await {
        Ok(SessionOutcome::Stopped) => ExitCode::SUCCESS,
        Ok(SessionOutcome::Failed { .. }) => ExitCode::FAILURE,
        // Start failures already reached the session logger as SessionFailed.
        Err(e) => {
            eprintln!("tapline: {e}");
            ExitCode::FAILURE
        }
    }
}
