use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::prelude::*;

mod cli;
mod config;

use conclave_session::CombineMode;

use crate::cli::ChatOptions;
use crate::config::ClientConfig;

#[derive(Parser)]
#[command(name = "conclave")]
#[command(about = "Chat with several language models at once")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.conclave)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Auth token (overrides CONCLAVE_AUTH__TOKEN and config.toml)
    #[arg(long, global = true)]
    token: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat (the default)
    Chat(ChatArgs),

    /// List conversations
    List(JsonArgs),

    /// Print a conversation's history
    History(HistoryArgs),

    /// Delete a conversation
    Delete(DeleteArgs),

    /// List the models the server offers
    Models(JsonArgs),

    /// Print the effective configuration
    Config,
}

#[derive(Parser, Default)]
struct ChatArgs {
    /// Resume a conversation by id
    #[arg(short, long)]
    conversation: Option<String>,

    /// Comma-separated models to answer with
    #[arg(short, long, value_delimiter = ',')]
    models: Option<Vec<String>>,

    /// How the models' outputs are combined: single, consensus or debate
    #[arg(long)]
    mode: Option<CombineMode>,
}

#[derive(Parser)]
struct JsonArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct HistoryArgs {
    /// Conversation id
    id: String,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct DeleteArgs {
    /// Conversation id
    id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so the transcript on stdout stays clean
    let default_directive = if cli.debug {
        "conclave=debug,conclave_session=debug,warn"
    } else {
        "conclave=info,conclave_session=warn,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let data_dir = config::data_dir(cli.data_dir.clone())?;
    let mut config = ClientConfig::load(&data_dir)?;
    if let Some(token) = cli.token {
        config.token = Some(token);
    }
    debug!(data_dir = %data_dir.display(), "starting");

    match cli.command {
        None => cli::chat_command(&config, ChatOptions::default()).await,
        Some(Commands::Chat(args)) => {
            let options = ChatOptions {
                conversation: args.conversation,
                models: args.models,
                mode: args.mode,
            };
            cli::chat_command(&config, options).await
        }
        Some(Commands::List(args)) => cli::list_command(&config, args.json).await,
        Some(Commands::History(args)) => cli::history_command(&config, &args.id, args.json).await,
        Some(Commands::Delete(args)) => cli::delete_command(&config, &args.id).await,
        Some(Commands::Models(args)) => cli::models_command(&config, args.json).await,
        Some(Commands::Config) => {
            let fc = config::effective_file_config(&data_dir)?;
            print!("{}", config::render_toml(&fc)?);
            Ok(())
        }
    }
}
