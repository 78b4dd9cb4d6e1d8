//! Work-queue worker
//!
//! Binary entry point: `workqueue publish` or `workqueue subscribe`.

use clap::Parser;
use workqueue_worker::Cli;

#[tokio::main]
async fn main() {
    // Usage errors print help and exit with status 2.
    let cli = Cli::parse();

    if let Err(e) = workqueue_worker::run(cli).await {
        eprintln!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}
