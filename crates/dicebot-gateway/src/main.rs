mod bootstrap_helpers;
mod cli_args;
mod gateway_commands;
mod gateway_config;
mod onebot_session;

use anyhow::Result;
use clap::Parser;

use crate::bootstrap_helpers::init_tracing;
use crate::cli_args::Cli;
use crate::gateway_commands::run_cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());
    run_cli(cli).await
}
