use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = forgeflow::Cli::parse();
    if let Err(e) = forgeflow::run_cli(cli).context("forgeflow command failed") {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
