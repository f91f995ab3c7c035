//! constellation CLI: run two-agent relays and inspect their memory.

mod inspect;
mod relay;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use constellation_config::{AppConfig, ConfigLoader};
use constellation_security::RedactingWriter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "constellation")]
#[command(about = "Two-agent AI relay with layered conversation memory", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (.yml, .yaml or .toml); defaults to ~/.constellation/config.yml.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new relay conversation.
    Run(relay::RunArgs),
    /// Continue a saved conversation.
    Resume(relay::ResumeArgs),
    /// Check that each configured provider backend answers.
    Health,
    /// List known models per agent type.
    Models {
        /// claude, grok or pascal; all types when omitted.
        kind: Option<String>,
    },
    /// Inspect long-term memories.
    #[command(subcommand)]
    Memory(inspect::MemoryCommand),
    /// Manage context diary documents.
    #[command(subcommand)]
    Diary(inspect::DiaryCommand),
    /// Search archived conversations.
    #[command(subcommand)]
    Archive(inspect::ArchiveCommand),
    /// Manage saved conversations.
    #[command(subcommand)]
    Saved(inspect::SavedCommand),
}

/// Per-agent overrides shared by `run` and `resume`.
#[derive(Args, Debug, Clone, Default)]
pub struct AgentKeys {
    /// Own API key for agent 1 instead of the shared credential.
    #[arg(long, env = "CONSTELLATION_AGENT1_KEY", hide_env_values = true)]
    pub agent1_key: Option<String>,
    /// Own API key for agent 2 instead of the shared credential.
    #[arg(long, env = "CONSTELLATION_AGENT2_KEY", hide_env_values = true)]
    pub agent2_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Run(args) => relay::run(config, args).await,
        Commands::Resume(args) => relay::resume(config, args).await,
        Commands::Health => inspect::health(&config).await,
        Commands::Models { kind } => inspect::models(kind.as_deref()),
        Commands::Memory(command) => inspect::memory(&config, command),
        Commands::Diary(command) => inspect::diary(&config, command),
        Commands::Archive(command) => inspect::archive(&config, command),
        Commands::Saved(command) => inspect::saved(command),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(RedactingWriter::stderr())
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    let loader = match path {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    loader.load().context("failed to load configuration")
}

/// Create `~/.constellation` (or the parent of `path`) if needed.
pub fn ensure_parent_dir(path: &std::path::Path) -> Result<()> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    Ok(())
}

pub fn conversations_db_path() -> PathBuf {
    ConfigLoader::default_config_dir().join("conversations.db")
}
