use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use constellation_agents::{ProviderGateway, default_model, direct_models_for, models_for};
use constellation_common::AgentKind;
use constellation_config::AppConfig;
use constellation_db::{DEFAULT_DIGEST_CHUNK_CHARS, MemoryStore, MemoryType, SHARED_OWNER};

use crate::ensure_parent_dir;
use crate::relay::open_conversations;

#[derive(Subcommand, Debug)]
pub enum MemoryCommand {
    /// Totals by speaker, conversation and type.
    Stats,
    /// Most recent memories.
    Recent {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        speaker: Option<String>,
        /// episodic, semantic or relational.
        #[arg(long = "type")]
        memory_type: Option<String>,
    },
    /// Case-insensitive substring search.
    Search {
        term: String,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Delete all memories and summaries. Diary and archive are kept.
    Clear {
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum DiaryCommand {
    /// Store a document, or a new version of an existing one.
    Add {
        #[arg(long)]
        title: String,
        /// Agent name, or "shared" for every agent.
        #[arg(long, default_value = SHARED_OWNER)]
        owner: String,
        /// Read the content from this file.
        #[arg(long, conflicts_with = "content")]
        file: Option<PathBuf>,
        #[arg(long)]
        content: Option<String>,
        /// Existing document id to version.
        #[arg(long)]
        document_id: Option<String>,
    },
    /// Active documents.
    List {
        #[arg(long)]
        owner: Option<String>,
    },
    /// Every version of one document.
    History { document_id: String },
    /// Split a document into semantic memories.
    Digest {
        document_id: String,
        #[arg(long, default_value_t = DEFAULT_DIGEST_CHUNK_CHARS)]
        chunk_size: usize,
    },
}

#[derive(Subcommand, Debug)]
pub enum ArchiveCommand {
    /// Full-text search over archived messages.
    Search {
        query: String,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Recently archived conversations.
    List {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
pub enum SavedCommand {
    List,
    Delete { name: String },
}

pub async fn health(config: &AppConfig) -> Result<()> {
    let gateway = ProviderGateway::new(config.gateway.clone());
    let results = gateway.health_check_all().await;
    if results.is_empty() {
        bail!("no provider credentials configured");
    }

    let mut unhealthy = 0;
    for (backend, healthy) in &results {
        let label = if *healthy { "ok" } else { "unreachable" };
        println!("{backend:<12} {label}");
        if !healthy {
            unhealthy += 1;
        }
    }
    if unhealthy > 0 {
        bail!("{unhealthy} of {} backends failed their health check", results.len());
    }
    Ok(())
}

pub fn models(kind: Option<&str>) -> Result<()> {
    let kinds = match kind {
        Some(kind) => match AgentKind::parse(kind) {
            Some(kind) => vec![kind],
            None => bail!("unknown agent type '{kind}'"),
        },
        None => AgentKind::ALL.to_vec(),
    };

    for kind in kinds {
        println!("{kind} (default {}):", default_model(kind));
        for option in models_for(kind) {
            println!("  {:<28} {}", option.label, option.model);
        }
        if let Some(direct) = direct_models_for(kind) {
            println!("  with own key, direct:");
            for option in direct {
                println!("    {:<26} {}", option.label, option.model);
            }
        }
    }
    Ok(())
}

fn open_store(config: &AppConfig) -> Result<MemoryStore> {
    let path = config.memory.resolved_database_path();
    ensure_parent_dir(&path)?;
    MemoryStore::open(&path).with_context(|| format!("failed to open {}", path.display()))
}

pub fn memory(config: &AppConfig, command: MemoryCommand) -> Result<()> {
    let store = open_store(config)?;
    match command {
        MemoryCommand::Stats => {
            let stats = store.memory_stats()?;
            println!("schema:        v{}", store.schema_version()?);
            println!("memories:      {}", stats.total_memories);
            println!("speakers:      {}", stats.unique_speakers);
            println!("conversations: {}", stats.conversations);
            if let Some(avg) = stats.avg_importance {
                println!("avg importance: {avg:.2}");
            }
            for (memory_type, count) in &stats.by_type {
                println!("  {memory_type}: {count}");
            }
        }
        MemoryCommand::Recent {
            limit,
            speaker,
            memory_type,
        } => {
            let memory_type = match memory_type.as_deref() {
                Some(value) => match MemoryType::parse(value) {
                    Some(memory_type) => Some(memory_type),
                    None => bail!("unknown memory type '{value}'"),
                },
                None => None,
            };
            for memory in store.recall_recent(limit, speaker.as_deref(), memory_type)? {
                println!(
                    "#{} [{}] {} ({}, {:.2}): {}",
                    memory.id,
                    memory.created_at.format("%Y-%m-%d %H:%M"),
                    memory.speaker,
                    memory.memory_type.as_str(),
                    memory.importance,
                    memory.content
                );
            }
        }
        MemoryCommand::Search { term, limit } => {
            for memory in store.search_memories(&term, limit)? {
                println!("#{} {}: {}", memory.id, memory.speaker, memory.content);
            }
        }
        MemoryCommand::Clear { yes } => {
            if !yes {
                bail!("refusing to clear memories without --yes");
            }
            store.clear_all_memories()?;
            println!("Memories and summaries cleared.");
        }
    }
    Ok(())
}

pub fn diary(config: &AppConfig, command: DiaryCommand) -> Result<()> {
    let store = open_store(config)?;
    match command {
        DiaryCommand::Add {
            title,
            owner,
            file,
            content,
            document_id,
        } => {
            let content = match (file, content) {
                (Some(path), _) => std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                (None, Some(content)) => content,
                (None, None) => bail!("provide --file or --content"),
            };
            let row_id =
                store.store_context_document(&title, &content, &owner, document_id.as_deref())?;
            if let Some(document) = store.get_document(row_id)? {
                println!(
                    "Stored {} v{} for {}",
                    document.document_id, document.version, document.owner
                );
            }
        }
        DiaryCommand::List { owner } => {
            for document in store.get_active_documents(owner.as_deref())? {
                println!(
                    "{} v{} [{}] {} ({} chars)",
                    document.document_id,
                    document.version,
                    document.owner,
                    document.title,
                    document.content.chars().count()
                );
            }
        }
        DiaryCommand::History { document_id } => {
            let versions = store.document_history(&document_id)?;
            if versions.is_empty() {
                bail!("no document with id '{document_id}'");
            }
            for document in versions {
                let marker = if document.is_active { "*" } else { " " };
                println!(
                    "{marker} v{} {} {}",
                    document.version,
                    document.created_at.format("%Y-%m-%d %H:%M"),
                    document.title
                );
            }
        }
        DiaryCommand::Digest {
            document_id,
            chunk_size,
        } => {
            let created = store.digest_document_to_memories(&document_id, chunk_size)?;
            println!("Created {created} memories from {document_id}.");
        }
    }
    Ok(())
}

pub fn archive(config: &AppConfig, command: ArchiveCommand) -> Result<()> {
    let store = open_store(config)?;
    match command {
        ArchiveCommand::Search { query, limit } => {
            for hit in store.search_archive(&query, limit)? {
                let title = hit.title.as_deref().unwrap_or(&hit.conversation_id);
                println!("[{title} #{}] {}: {}", hit.message_index, hit.speaker, hit.content);
            }
        }
        ArchiveCommand::List { limit } => {
            for conversation in store.list_archived_conversations(limit)? {
                println!(
                    "{} {} messages, {} words, {} ({})",
                    conversation.conversation_id,
                    conversation.message_count,
                    conversation.word_count,
                    conversation.participants.join(" & "),
                    conversation.updated_at
                );
            }
        }
    }
    Ok(())
}

pub fn saved(command: SavedCommand) -> Result<()> {
    let store = open_conversations()?;
    match command {
        SavedCommand::List => {
            for saved in store.list()? {
                println!(
                    "{:<24} {} updated {}",
                    saved.name,
                    saved.conversation_id,
                    saved.updated_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        SavedCommand::Delete { name } => {
            if !store.delete(&name)? {
                bail!("no saved conversation named '{name}'");
            }
            println!("Deleted '{name}'.");
        }
    }
    Ok(())
}
