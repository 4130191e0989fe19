//! Tripmesh CLI
//!
//! Thin wrapper around tripmesh-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show node information
//! tripmesh info
//!
//! # Author an expense offline (queued for replay)
//! tripmesh expense add g1 "Ferry tickets" 120 m1 --split m1:60 --split m2:60
//!
//! # List cached expenses for a group
//! tripmesh expense list g1
//!
//! # Inspect the mutation queue
//! tripmesh queue list
//! tripmesh queue stats
//! tripmesh queue compact
//!
//! # Run a live mesh node (stdin lines become chat messages)
//! tripmesh serve --group g1 --online
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;

use tripmesh_core::{
    BackendApi, ExpenseSplit, GroupId, HttpBackend, MemberId, MeshConfig, MeshEngine, MeshEvent,
    MeshPayload, MemoryHub, PeerId, StaticTokenSource, Transport,
};

/// Tripmesh - offline-first trip coordination
#[derive(Parser)]
#[command(name = "tripmesh")]
#[command(version = "0.1.0")]
#[command(about = "Tripmesh - offline-first peer mesh sync for trip coordination")]
struct Cli {
    /// Data directory (default: ~/.tripmesh/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Backend API root
    #[arg(long, global = true, default_value = "http://localhost:8080/api")]
    backend_url: String,

    /// Bearer token for backend calls
    #[arg(long, global = true, default_value = "")]
    token: String,

    /// Display name announced to peers
    #[arg(long, global = true, default_value = "tripmesh device")]
    name: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node information
    Info,

    /// Mutation queue management
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Expense management
    Expense {
        #[command(subcommand)]
        action: ExpenseCommand,
    },

    /// Run a live mesh node; stdin lines are broadcast as chat
    Serve {
        /// Group to coordinate
        #[arg(short, long)]
        group: String,

        /// Treat the backend as reachable from the start
        #[arg(long)]
        online: bool,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List mutations awaiting replay
    List,
    /// Show queue counts by status
    Stats,
    /// Remove rows already confirmed by the backend
    Compact,
}

#[derive(Subcommand)]
enum ExpenseCommand {
    /// Author an expense offline (cached + queued for replay)
    Add {
        /// Group id
        group: String,
        /// Description
        description: String,
        /// Total amount in minor units
        amount: i64,
        /// Member who paid
        paid_by: String,
        /// Share as member:amount (repeatable)
        #[arg(long = "split", value_name = "MEMBER:AMOUNT")]
        splits: Vec<String>,
    },
    /// List cached expenses for a group
    List {
        /// Group id
        group: String,
    },
}

fn data_dir(cli: &Cli) -> PathBuf {
    cli.data_dir.clone().unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tripmesh")
            .join("data")
    })
}

fn backend(cli: &Cli) -> Arc<dyn BackendApi> {
    Arc::new(HttpBackend::new(
        cli.backend_url.clone(),
        Arc::new(StaticTokenSource::new(cli.token.clone())),
    ))
}

fn parse_split(raw: &str) -> Result<ExpenseSplit> {
    let (member, amount) = raw
        .split_once(':')
        .with_context(|| format!("expected MEMBER:AMOUNT, got '{}'", raw))?;
    Ok(ExpenseSplit {
        member_id: MemberId::new(member),
        amount: amount
            .parse()
            .with_context(|| format!("bad share amount '{}'", amount))?,
    })
}

/// Engine over an in-process transport: store and queue work without radio.
///
/// Used by the offline commands; `serve` binds the real iroh transport.
fn offline_engine(cli: &Cli) -> Result<MeshEngine> {
    let hub = MemoryHub::new();
    let transport: Arc<dyn Transport> =
        Arc::new(hub.register(PeerId::new("local"), cli.name.clone()));
    let engine = MeshEngine::new(
        data_dir(cli),
        MeshConfig::with_display_name(cli.name.clone()),
        transport,
        backend(cli),
    )?;
    Ok(engine)
}

fn format_timestamp(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Info => cmd_info(&cli),
        Commands::Queue { action } => cmd_queue(&cli, action),
        Commands::Expense { action } => cmd_expense(&cli, action).await,
        Commands::Serve { group, online } => cmd_serve(&cli, group, *online).await,
    }
}

fn cmd_info(cli: &Cli) -> Result<()> {
    let engine = offline_engine(cli)?;
    let store = engine.store();

    match store.load_endpoint_secret_key()? {
        Some(key_bytes) => {
            let secret = iroh::SecretKey::from(key_bytes);
            println!("Peer id:  {}", hex::encode(secret.public().as_bytes()));
        }
        None => println!("Peer id:  (none yet - run `tripmesh serve` once)"),
    }
    println!("Name:     {}", cli.name);
    println!("Data dir: {}", data_dir(cli).display());
    println!("Pending:  {} mutation(s)", store.pending_count()?);
    Ok(())
}

fn cmd_queue(cli: &Cli, action: &QueueAction) -> Result<()> {
    let engine = offline_engine(cli)?;
    let store = engine.store();

    match action {
        QueueAction::List => {
            let mutations = store.replayable_mutations()?;
            if mutations.is_empty() {
                println!("Queue is empty.");
                return Ok(());
            }
            for m in mutations {
                println!(
                    "#{:<4} {:?} {} [{}] retries={} created={}",
                    m.id,
                    m.op,
                    m.resource_path,
                    m.status.as_str(),
                    m.retry_count,
                    format_timestamp(m.created_at),
                );
            }
        }
        QueueAction::Stats => {
            use tripmesh_core::MutationStatus;
            println!(
                "pending:   {}",
                store.count_by_status(MutationStatus::Pending)?
            );
            println!(
                "failed:    {}",
                store.count_by_status(MutationStatus::Failed)?
            );
            println!(
                "completed: {}",
                store.count_by_status(MutationStatus::Completed)?
            );
        }
        QueueAction::Compact => {
            let removed = store.compact_completed()?;
            println!("Removed {} completed mutation(s).", removed);
        }
    }
    Ok(())
}

async fn cmd_expense(cli: &Cli, action: &ExpenseCommand) -> Result<()> {
    let engine = offline_engine(cli)?;

    match action {
        ExpenseCommand::Add {
            group,
            description,
            amount,
            paid_by,
            splits,
        } => {
            let split = splits
                .iter()
                .map(|s| parse_split(s))
                .collect::<Result<Vec<_>>>()?;

            engine.set_active_group(Some(GroupId::new(group.clone())));
            let expense = engine
                .create_expense(
                    GroupId::new(group.clone()),
                    description.clone(),
                    *amount,
                    MemberId::new(paid_by.clone()),
                    split,
                )
                .await?;

            println!("Created expense {} ({} minor units).", expense.id, amount);
            println!(
                "{} change(s) pending replay to the backend.",
                engine.pending_count()?
            );
        }
        ExpenseCommand::List { group } => {
            let expenses = engine
                .store()
                .expenses_for_group(&GroupId::new(group.clone()))?;
            if expenses.is_empty() {
                println!("No cached expenses for group {}.", group);
                return Ok(());
            }
            for e in expenses {
                let origin = match &e.provenance {
                    Some(p) => format!("via {}", p.origin_peer),
                    None => "local/server".to_string(),
                };
                println!(
                    "{}  {:<24} {:>8}  paid by {}  ({})",
                    format_timestamp(e.created_at),
                    e.description,
                    e.amount,
                    e.paid_by,
                    origin,
                );
            }
        }
    }
    Ok(())
}

async fn cmd_serve(cli: &Cli, group: &str, online: bool) -> Result<()> {
    let engine = MeshEngine::with_iroh(
        data_dir(cli),
        MeshConfig::with_display_name(cli.name.clone()),
        backend(cli),
    )
    .await?;
    engine.start().await?;
    engine.set_active_group(Some(GroupId::new(group)));
    if online {
        engine.set_online();
    }

    println!("Mesh node running as {}", engine.local_peer());
    println!("Type a message and press enter to chat; Ctrl-C to exit.");

    let mut events = engine.subscribe_mesh();
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(MeshEvent::Message(envelope)) => {
                    if let MeshPayload::Chat(chat) = &envelope.payload {
                        println!("[{}] {}: {}",
                            format_timestamp(envelope.timestamp),
                            chat.author,
                            chat.text,
                        );
                    }
                }
                Ok(MeshEvent::PeerConnected(peer)) => println!("* {} connected", peer),
                Ok(MeshEvent::PeerDisconnected(peer)) => println!("* {} disconnected", peer),
                Ok(_) => {}
                Err(_) => break,
            },
            line = lines.next_line() => match line? {
                Some(text) if !text.trim().is_empty() => {
                    engine.send_chat(text.trim()).await?;
                }
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("Shutting down.");
    engine.shutdown().await;
    // Give in-flight channel teardown a moment
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}
