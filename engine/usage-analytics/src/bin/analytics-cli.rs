//! # Analytics CLI Binary
//!
//! Command-line interface for querying and maintaining usage analytics.

use anyhow::Result;
use clap::Parser;
use usage_analytics::cli::{init_logging, Cli, CliHandler};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();
    let config = cli.load_config()?;

    // Initialize logging
    init_logging(&config.logging);

    // Create CLI handler
    let handler = CliHandler::new(config).await?;

    // Handle command
    handler.handle_command(cli.command).await?;

    Ok(())
}
