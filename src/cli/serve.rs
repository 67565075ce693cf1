use anyhow::Result;
use clap::Args;
use tracing::info;

use lark_base_relay::config::Config;
use lark_base_relay::server::Server;

#[derive(Args)]
pub struct ServeArgs {
    /// Port to listen on (overrides config and PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to bind (overrides config)
    #[arg(short, long)]
    pub bind: Option<String>,
}

pub async fn run(args: ServeArgs, mut config: Config) -> Result<()> {
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    info!(
        "Relaying table {} with model {} (pipeline mode {:?})",
        config.bitable.table_id, config.gemini.model, config.pipeline.mode
    );

    let server = Server::new(&config)?;
    server.run().await
}
