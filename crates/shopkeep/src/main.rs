//! shopkeep: operator console for the shopkeep dashboard backend
//!
//! Subcommands:
//! - `chats`: print the inbox once
//! - `watch`: follow the inbox or one conversation until interrupted
//! - `send`: send an operator message
//! - `toggle-ai`: turn the assistant on or off for a chat

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::Result;
use shopkeep_sync::{DashboardClient, SyncConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod render;
mod watch;

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "shopkeep")]
#[command(about = "Operator console for the shopkeep dashboard", long_about = None)]
struct Cli {
    /// Backend base URL
    #[arg(long, global = true, env = "SHOPKEEP_API_URL", default_value = "http://localhost:54321/functions/v1")]
    api_url: String,

    /// Request timeout in seconds
    #[arg(long, global = true, env = "SHOPKEEP_TIMEOUT", default_value = "10")]
    timeout: u64,

    /// Chat list poll interval in seconds
    #[arg(long, global = true, env = "SHOPKEEP_CHATS_POLL", default_value = "10")]
    chats_poll: u64,

    /// Conversation poll interval in seconds
    #[arg(long, global = true, env = "SHOPKEEP_MESSAGES_POLL", default_value = "5")]
    messages_poll: u64,

    /// Instance id prefix reserved for demo resources
    #[arg(long, global = true, env = "SHOPKEEP_DEMO_PREFIX", default_value = "demo-")]
    demo_prefix: String,

    /// Path of the handoff file (defaults to the user cache directory)
    #[arg(long, global = true, env = "SHOPKEEP_HANDOFF_PATH")]
    handoff_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the chat list once
    Chats,

    /// Follow the inbox, or one conversation, until Ctrl-C
    Watch {
        /// Conversation to open. Without it the chat saved by the last
        /// `send` is resumed, or the inbox is shown.
        #[arg(long)]
        chat: Option<String>,

        /// Idle cache retention in seconds
        #[arg(long, env = "SHOPKEEP_RETENTION")]
        retention: Option<u64>,
    },

    /// Send an operator message to a chat
    Send {
        /// Chat id
        #[arg(long)]
        chat: String,

        /// Message text
        #[arg(value_name = "TEXT")]
        content: String,

        /// Let the assistant reply automatically
        #[arg(
            long,
            env = "SHOPKEEP_AI",
            value_parser = parse_bool_env,
            default_value = "true",
            action = clap::ArgAction::Set
        )]
        ai: bool,
    },

    /// Turn the assistant on or off for a chat
    ToggleAi {
        /// Chat id
        #[arg(long)]
        chat: String,

        /// New state (1/true/yes/on or 0/false/no/off)
        #[arg(value_name = "ENABLED", value_parser = parse_bool_env, action = clap::ArgAction::Set)]
        enabled: bool,
    },
}

impl Cli {
    fn config(&self, retention: Option<u64>) -> SyncConfig {
        SyncConfig::default()
            .with_request_timeout(Duration::from_secs(self.timeout))
            .with_poll_intervals(
                Duration::from_secs(self.chats_poll),
                Duration::from_secs(self.messages_poll),
            )
            .with_demo_prefix(self.demo_prefix.clone())
            .with_retention(retention.map(Duration::from_secs))
    }

    fn handoff_path(&self) -> PathBuf {
        self.handoff_path.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("shopkeep")
                .join("handoff.json")
        })
    }

    fn client(&self, retention: Option<u64>) -> Result<DashboardClient> {
        DashboardClient::new(self.api_url.clone(), self.config(retention))
            .map_err(|e| miette::miette!("failed to create dashboard client: {}", e))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "shopkeep=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let handoff_path = cli.handoff_path();

    match &cli.command {
        Commands::Chats => commands::chats(&cli.client(None)?).await,

        Commands::Watch { chat, retention } => {
            let client = cli.client(*retention)?;
            watch::run(&client, chat.clone(), &handoff_path).await
        }

        Commands::Send { chat, content, ai } => {
            commands::send(&cli.client(None)?, chat, content, *ai, &handoff_path).await
        }

        Commands::ToggleAi { chat, enabled } => {
            commands::toggle_ai(&cli.client(None)?, chat, *enabled).await
        }
    }
}
