extern crate log;
extern crate pretty_env_logger;

use anyhow::Context;
use clap::Parser;
use fts_tool::{Cli, Config, commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    pretty_env_logger::formatted_builder()
        .filter_level(cli.log_level())
        .parse_env("RUST_LOG")
        .init();

    let config = Config::read(&cli.config)
        .with_context(|| format!("Tried to open --config {}", cli.config.display()))?;

    if let Some(command) = cli.commands {
        commands::process(&config, command).await
    } else {
        eprintln!("Done nothing");
        Ok(())
    }
}
