//! CLI commands

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::checkpoint::CheckpointKind;
use crate::config::Config;
use crate::core::AppState;
use crate::db::repositories::{MemoryFilter, NewMessage, TodosReplace};
use crate::db::{Database, MemoryKind, MemoryScope, ThreadKey};

#[derive(Parser)]
#[command(name = "runledger")]
#[command(about = "Thread store, checkpoints and tool scheduling for agent runs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.runledger/config.yml)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Database path, overrides the config file
    #[arg(long, global = true)]
    database: Option<String>,

    /// Endpoint id, overrides the config default
    #[arg(long, global = true)]
    endpoint: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List threads of the endpoint
    Threads,

    /// Create a thread
    CreateThread {
        thread_id: String,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        model: Option<String>,
    },

    /// Show transcript messages
    Messages {
        thread_id: String,

        /// Only messages after this id
        #[arg(long)]
        after: Option<i64>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Append a user message
    Post { thread_id: String, text: String },

    /// List checkpoints, newest first
    Checkpoints { thread_id: String },

    /// Capture a pre-run checkpoint
    Checkpoint {
        thread_id: String,

        /// Run the checkpoint belongs to (default: a new id)
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Restore and consume a checkpoint
    Restore {
        thread_id: String,
        checkpoint_id: String,
    },

    /// Show or replace the todo list
    Todos {
        thread_id: String,

        /// New todo list as a JSON array
        #[arg(long)]
        set: Option<String>,

        /// Version the new list is based on
        #[arg(long, requires = "set")]
        expected: Option<i64>,
    },

    /// List memory items
    Memory {
        thread_id: String,

        #[arg(long)]
        scope: Option<String>,

        #[arg(long)]
        kind: Option<String>,
    },

    /// List tools active in a mode
    Tools {
        #[arg(long)]
        mode: Option<String>,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    let db_path = match &cli.database {
        Some(path) => std::path::PathBuf::from(path),
        None => config.resolve_db_path()?,
    };
    let endpoint = cli
        .endpoint
        .clone()
        .unwrap_or_else(|| config.default_endpoint.clone());

    let db = Database::new(&db_path)
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;
    let state = AppState::new(db, config)?;

    // Create a multi-threaded runtime for CLI operations
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(execute(cli.command, &state, &endpoint))
}

async fn execute(command: Commands, state: &AppState, endpoint: &str) -> Result<()> {
    let key = |thread_id: &str| ThreadKey::new(endpoint, thread_id);

    match command {
        Commands::Threads => {
            let threads = state.threads.list(&endpoint).await?;

            if threads.is_empty() {
                println!("No threads found");
            } else {
                for thread in threads {
                    println!(
                        "{} - {} ({}) - {}",
                        thread.thread_id,
                        thread.title.as_deref().unwrap_or("-"),
                        thread.run_status.as_str(),
                        thread.last_message_preview.as_deref().unwrap_or("-")
                    );
                }
            }
            Ok(())
        }

        Commands::CreateThread { thread_id, title, model } => {
            let thread = state.threads.create(&key(&thread_id)?, title, model).await?;
            println!("Created thread: {}", thread.key());
            Ok(())
        }

        Commands::Messages { thread_id, after, limit } => {
            let messages = state.transcript.list_messages(&key(&thread_id)?, after, limit).await?;
            for message in messages {
                println!("[{}] {}: {}", message.id, message.role, message.text);
            }
            Ok(())
        }

        Commands::Post { thread_id, text } => {
            let message = state
                .transcript
                .append_message(&key(&thread_id)?, NewMessage::user(text))
                .await?;
            println!("Appended message {}", message.id);
            Ok(())
        }

        Commands::Checkpoints { thread_id } => {
            let checkpoints = state.checkpoints.list(&key(&thread_id)?).await?;
            if checkpoints.is_empty() {
                println!("No checkpoints found");
            }
            for cp in checkpoints {
                println!(
                    "{} - run {} ({}) - {} messages, {} memory items",
                    cp.checkpoint_id,
                    cp.run_id,
                    cp.created_at.to_rfc3339(),
                    cp.watermarks.transcript,
                    cp.state.memory_items.len()
                );
            }
            Ok(())
        }

        Commands::Checkpoint { thread_id, run_id } => {
            let run_id = run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let cp = state
                .checkpoints
                .create(&key(&thread_id)?, &run_id, CheckpointKind::PreRun)
                .await?;
            println!("Checkpoint: {}", cp.checkpoint_id);
            Ok(())
        }

        Commands::Restore { thread_id, checkpoint_id } => {
            let report = state
                .checkpoints
                .restore_with_report(&key(&thread_id)?, &checkpoint_id)
                .await?;
            println!(
                "Restored {}: removed {} messages, {} runs",
                checkpoint_id, report.messages_removed, report.planes.runs_removed
            );
            Ok(())
        }

        Commands::Todos { thread_id, set, expected } => {
            let key = key(&thread_id)?;
            if let Some(raw) = set {
                let todos: serde_json::Value =
                    serde_json::from_str(&raw).context("--set must be a JSON array")?;
                let snapshot = state
                    .todos
                    .replace_snapshot(
                        &TodosReplace {
                            key,
                            todos,
                            updated_by: Some("cli".to_string()),
                        },
                        expected,
                    )
                    .await?;
                println!("Saved todos (version {})", snapshot.version);
                return Ok(());
            }

            match state.todos.get(&key).await? {
                Some(snapshot) => {
                    println!("version {}", snapshot.version);
                    println!("{}", serde_json::to_string_pretty(&snapshot.todos)?);
                }
                None => println!("No todos"),
            }
            Ok(())
        }

        Commands::Memory { thread_id, scope, kind } => {
            let filter = MemoryFilter {
                scope: scope.as_deref().map(MemoryScope::normalize),
                kind: kind.as_deref().map(MemoryKind::normalize),
            };
            let items = state.memory.list(&key(&thread_id)?, &filter).await?;
            for item in items {
                println!(
                    "[{}] {}/{} {:.2} - {}",
                    item.memory_id,
                    item.scope.as_str(),
                    item.kind.as_str(),
                    item.importance,
                    item.content
                );
            }
            Ok(())
        }

        Commands::Tools { mode } => {
            let mode = mode.unwrap_or_else(|| state.config.scheduler.mode.clone());
            for def in state.scheduler.active_tools(&mode) {
                println!(
                    "{} ({}, priority {}){}{} - {}",
                    def.name,
                    def.source.as_str(),
                    def.priority,
                    if def.mutating { " mutating" } else { "" },
                    if def.parallel_safe { " parallel" } else { "" },
                    def.description
                );
            }
            Ok(())
        }
    }
}
