use anyhow::Result;
use clap::Args;

use lark_base_relay::config::Config;
use lark_base_relay::transcript::{SqliteTranscriptStore, TranscriptStore};

#[derive(Args)]
pub struct TranscriptsArgs {
    /// Chat to list
    pub chat_id: String,

    /// Maximum number of entries, newest first
    #[arg(short, long, default_value_t = 20)]
    pub limit: usize,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: TranscriptsArgs, config: Config) -> Result<()> {
    let path = config.transcript_path();
    if !path.exists() {
        println!("No transcript store at {}", path.display());
        return Ok(());
    }

    let store = SqliteTranscriptStore::open(&path)?;
    let entries = store.list(&args.chat_id, args.limit).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No transcripts for {}", args.chat_id);
        return Ok(());
    }

    for entry in entries {
        println!("[{}]", entry.created_at.format("%Y-%m-%d %H:%M:%S"));
        println!("  Q: {}", entry.question);
        println!("  A: {}", entry.answer);
    }

    Ok(())
}
