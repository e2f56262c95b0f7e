//! tunrelay - authenticated TCP/TLS tunnel relay

use anyhow::Result;
use clap::Parser;
use tunrelay_cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    tunrelay_cli::run(Cli::parse()).await
}
