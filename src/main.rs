//! orchestra-relay - message backbone for multi-agent orchestration.

use clap::Parser;
use std::process::ExitCode;

use orchestra_relay::cli::Commands;
use orchestra_relay::logging;

#[tokio::main]
async fn main() -> ExitCode {
    let _guard = match logging::init() {
        Ok((guard, _)) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let args = Commands::parse();

    match args.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
