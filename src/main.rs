mod cli;

use std::env;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn init_tracing() {
    let filter = EnvFilter::try_from_env("SITELOG_LOG")
        .unwrap_or_else(|_| EnvFilter::new("sitelog=info,warn"));
    let format = env::var("SITELOG_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());
    let registry = tracing_subscriber::registry().with(filter);
    match format.as_str() {
        "json" => registry.with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr)).init(),
        _ => registry.with(fmt::layer().compact().with_writer(std::io::stderr)).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = sitelog::config::load().context("failed to load configuration")?;
    let cli_opts = cli::Cli::parse();
    let ctx = cli::Context::open(&config)?;
    cli::run(cli_opts.command, &ctx).await
}
