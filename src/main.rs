use anyhow::Result;
use tracing::{info, error};

mod breaker;
mod browser;
mod cli;
mod crawler;
mod error;
mod events;
mod proxy;
mod storage;
mod utils;
mod watchdog;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::parse_args();

    let log_file = args
        .log_file
        .clone()
        .map(|path| path.unwrap_or_else(utils::default_log_file));
    utils::init_logging(args.verbose, log_file)?;

    info!("Starting page orchestrator v{}", env!("CARGO_PKG_VERSION"));

    // Process commands
    match cli::process_command(args).await {
        Ok(_) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            Err(e)
        }
    }
}
