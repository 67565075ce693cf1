use anyhow::Result;
use clap::Parser;
use std::path::Path;

mod cli;

use cli::{Cli, Commands};
use lark_base_relay::config::{Config, LoggingConfig};

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref().map(Path::new))?;

    init_logging(cli.verbose, &config.logging);

    match cli.command {
        Commands::Serve(args) => cli::serve::run(args, config).await,
        Commands::CheckConfig(args) => cli::check_config::run(args, config).await,
        Commands::Transcripts(args) => cli::transcripts::run(args, config).await,
    }
}

/// `-v` forces debug; otherwise `RUST_LOG` wins over `logging.level`.
fn init_logging(verbose: bool, logging: &LoggingConfig) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level))
    };

    if logging.format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
