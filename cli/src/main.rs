use clap::Parser;

use tether_cli::Cli;
use tether_cli::run_main;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run_main(Cli::parse()).await
}
