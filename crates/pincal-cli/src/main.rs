//! Pin Calendar CLI
//!
//! Thin wrapper around pincal-core for running coordinators and inspecting
//! stored documents from the command line.
//!
//! ## Usage
//!
//! ```bash
//! # Run a coordinator with three tabs and watch the WebRTC election
//! pincal demo --tabs 3
//!
//! # Silence the owning tab after two seconds to force a re-election
//! pincal demo --tabs 2 --silence-owner-after 2
//!
//! # Build and parse invitation links
//! pincal invite encode <document_id> <peer_connection_id>
//! pincal invite decode '#action=addPeer&documentId=...&peerConnectionId=...'
//!
//! # List documents in the local store
//! pincal documents list
//!
//! # Show JSONL logs written with --log-dir
//! pincal logs show --log-dir ./logs --calendar <calendar_id>
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use pincal_core::logging::{read_all_entries, read_calendar_entries, JsonlLayer};
use pincal_core::{
    CalendarApp, CalendarId, CoordinatorConfig, CoordinatorHost, DocumentId, DocumentStorage,
    Invitation, MemoryTransport, PeerConnectionId, TabBootstrapper, TabConfig, TabEvent,
};

/// File name of the document database inside the data directory
const DATABASE_FILE: &str = "pincal.redb";

/// Pin Calendar - local-first calendar sync
#[derive(Parser)]
#[command(name = "pincal")]
#[command(version = "0.1.0")]
#[command(about = "Pin Calendar - local-first calendar sync")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.pincal/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Also write structured JSONL logs into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a coordinator with in-process tabs and print ownership changes
    Demo(DemoArgs),

    /// Invitation links
    Invite {
        #[command(subcommand)]
        action: InviteAction,
    },

    /// Stored documents
    Documents {
        #[command(subcommand)]
        action: DocumentsAction,
    },

    /// Structured logs
    Logs {
        #[command(subcommand)]
        action: LogsAction,
    },
}

#[derive(Args)]
struct DemoArgs {
    /// Number of tabs to open
    #[arg(short, long, default_value_t = 2)]
    tabs: usize,

    /// Calendar to open (default: a new one)
    #[arg(short, long)]
    calendar: Option<String>,

    /// Local document to reuse from an earlier run
    #[arg(long)]
    local_document: Option<String>,

    /// Invitation link for the first tab
    #[arg(long)]
    invitation: Option<String>,

    /// Election poll interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Owner answer deadline in milliseconds
    #[arg(long, default_value_t = 4000)]
    poll_timeout_ms: u64,

    /// Stop the owning tab from answering polls after this many seconds
    #[arg(long)]
    silence_owner_after: Option<u64>,

    /// Seconds to keep running once all tabs are loaded
    #[arg(long, default_value_t = 5)]
    duration: u64,

    /// Keep documents in memory instead of the data directory
    #[arg(long)]
    in_memory: bool,
}

#[derive(Subcommand)]
enum InviteAction {
    /// Build an invitation link
    Encode {
        /// Shared document ID (base58)
        document_id: String,
        /// Connection ID of the inviting device
        peer_connection_id: String,
    },

    /// Parse an invitation link
    Decode {
        /// Link fragment, with or without the leading '#'
        hash: String,
    },
}

#[derive(Subcommand)]
enum DocumentsAction {
    /// List stored documents
    List,
}

#[derive(Subcommand)]
enum LogsAction {
    /// Print entries, optionally for one calendar only
    Show {
        /// Calendar ID to filter by
        #[arg(short, long)]
        calendar: Option<String>,
    },
}

fn setup_logging(verbosity: u8, log_dir: Option<&Path>) -> Result<()> {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let jsonl = log_dir
        .map(|dir| JsonlLayer::new(dir, format!("cli-{}", std::process::id())))
        .transpose()
        .context("Failed to open log directory")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(jsonl)
        .init();
    Ok(())
}

/// Get the default data directory (~/.pincal/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pincal")
        .join("data")
}

fn parse_calendar_id(s: &str) -> Result<CalendarId> {
    s.parse()
        .map_err(|e| anyhow::anyhow!("Invalid calendar ID '{}': {}", s, e))
}

fn parse_document_id(s: &str) -> Result<DocumentId> {
    DocumentId::from_base58(s).map_err(|e| anyhow::anyhow!("Invalid document ID '{}': {}", s, e))
}

fn open_storage(data_dir: &Path) -> Result<DocumentStorage> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;
    Ok(DocumentStorage::new(data_dir.join(DATABASE_FILE))?)
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

fn owner_index(apps: &[CalendarApp]) -> Option<usize> {
    apps.iter().position(|app| app.is_webrtc_owner())
}

async fn run_demo(data_dir: &Path, log_dir: Option<&Path>, args: DemoArgs) -> Result<()> {
    if args.tabs == 0 {
        anyhow::bail!("At least one tab is required");
    }
    let calendar = match &args.calendar {
        Some(id) => parse_calendar_id(id)?,
        None => CalendarId::new(),
    };
    let mut local = args.local_document.as_deref().map(parse_document_id).transpose()?;
    let invitation = args
        .invitation
        .as_deref()
        .map(Invitation::decode)
        .transpose()?;

    let storage = if args.in_memory {
        None
    } else {
        Some(open_storage(data_dir)?)
    };
    let config = CoordinatorConfig {
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        poll_timeout: Duration::from_millis(args.poll_timeout_ms),
        ..Default::default()
    };
    let host = CoordinatorHost::new(config, storage);
    let transport = MemoryTransport::new();
    let bootstrapper = TabBootstrapper::new(TabConfig::default(), Arc::new(transport));

    println!("Calendar: {}", calendar);

    let mut apps = Vec::with_capacity(args.tabs);
    for index in 0..args.tabs {
        let tab_invitation = if index == 0 { invitation.clone() } else { None };
        let app = bootstrapper
            .load(host.connect(), calendar, None, local, tab_invitation)
            .await
            .with_context(|| format!("Failed to load tab-{}", index))?;
        local = Some(app.doc_local().document_id());

        let mut events = app.subscribe_events();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let change = match event {
                    TabEvent::WebRtcStarted => "started WebRTC",
                    TabEvent::WebRtcStopped => "stopped WebRTC",
                    TabEvent::Disconnected => "dropped by the coordinator",
                };
                println!("[{}] tab-{}: {}", timestamp(), index, change);
            }
        });
        apps.push(app);
    }

    let first = &apps[0];
    println!("Tabs loaded: {}", apps.len());
    println!("  Local document: {}", first.doc_local().document_id());
    println!("  Shared document: {}", first.doc_shared().document_id());
    println!("  Invitation: {}", first.invitation()?);
    if let Some(dir) = log_dir {
        println!("  Logs: {}", dir.display());
    }
    match owner_index(&apps) {
        Some(index) => println!("Owner: tab-{}", index),
        None => println!("Owner: (election pending)"),
    }

    if let Some(after) = args.silence_owner_after {
        tokio::time::sleep(Duration::from_secs(after)).await;
        match owner_index(&apps) {
            Some(index) => {
                println!("[{}] Silencing tab-{}", timestamp(), index);
                apps[index].set_silenced(true);
            }
            None => println!("[{}] No owner to silence", timestamp()),
        }
    }

    tokio::time::sleep(Duration::from_secs(args.duration)).await;

    match owner_index(&apps) {
        Some(index) => println!("Final owner: tab-{}", index),
        None => println!("Final owner: (none)"),
    }
    for app in apps {
        app.close();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.log_dir.as_deref())?;

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);

    match cli.command {
        Commands::Demo(args) => run_demo(&data_dir, cli.log_dir.as_deref(), args).await?,

        Commands::Invite { action } => match action {
            InviteAction::Encode {
                document_id,
                peer_connection_id,
            } => {
                let document_id = parse_document_id(&document_id)?;
                let invitation =
                    Invitation::add_peer(document_id, PeerConnectionId(peer_connection_id));
                println!("{}", invitation);
            }

            InviteAction::Decode { hash } => {
                let invitation = Invitation::decode(&hash)?;
                println!("Invitation:");
                println!("  Action: addPeer");
                println!("  Document: {}", invitation.document_id);
                println!("  Peer: {}", invitation.peer_connection_id);
            }
        },

        Commands::Documents { action } => match action {
            DocumentsAction::List => {
                let storage = open_storage(&data_dir)?;
                let ids = storage.list_documents()?;
                if ids.is_empty() {
                    println!("No documents found.");
                } else {
                    println!("Documents ({}):", ids.len());
                    println!();
                    for id in ids {
                        let size = storage.load_document(&id)?.map(|d| d.len()).unwrap_or(0);
                        println!("  {} ({} bytes)", id, size);
                    }
                }
            }
        },

        Commands::Logs { action } => match action {
            LogsAction::Show { calendar } => {
                let Some(dir) = cli.log_dir.as_deref() else {
                    anyhow::bail!("--log-dir is required to read logs");
                };
                let entries = match calendar {
                    Some(calendar) => read_calendar_entries(dir, &calendar)?,
                    None => read_all_entries(dir)?,
                };
                if entries.is_empty() {
                    println!("No log entries found.");
                }
                for entry in entries {
                    println!(
                        "{} {:5} [{}] {}: {}",
                        entry.ts, entry.level, entry.instance, entry.target, entry.msg
                    );
                }
            }
        },
    }

    Ok(())
}
