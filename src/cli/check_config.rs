use anyhow::Result;
use clap::Args;

use lark_base_relay::config::Config;

#[derive(Args)]
pub struct CheckConfigArgs {
    /// Print as JSON instead of TOML
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: CheckConfigArgs, config: Config) -> Result<()> {
    let shown = config.redacted();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&shown)?);
    } else {
        println!("{}", toml::to_string_pretty(&shown)?);
    }

    match config.validate_for_serving() {
        Ok(()) => println!("Configuration is ready to serve."),
        Err(e) => println!("Configuration is incomplete for serving: {}", e),
    }

    Ok(())
}
