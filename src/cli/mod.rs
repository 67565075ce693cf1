pub mod check_config;
pub mod serve;
pub mod transcripts;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "lark-base-relay")]
#[command(author, version, about = "Answers Lark chat questions from a Lark Base table")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "LARK_RELAY_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the webhook server
    Serve(serve::ServeArgs),

    /// Validate and print the effective configuration
    CheckConfig(check_config::CheckConfigArgs),

    /// List saved question/answer transcripts for a chat
    Transcripts(transcripts::TranscriptsArgs),
}
