//! Collaborative editing peer
//! Keeps a local replica of a project in sync with other peers over LAN,
//! direct WebSocket or relay connections

mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use collaboration::transport::{LanTransport, WebSocketListener, WebSocketTransport};
use collaboration::{Connector, FileStore, OperatingMode, OutboundQueueStore, PeerAddress, Workspace};
use config::{default_config_path, PeerConfig};
use reasoning::BackendFactory;
use replica::{KeyRef, ProjectId};

#[derive(Parser)]
#[command(name = "collab-peer")]
#[command(about = "Peer-to-peer collaborative code editing")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init {
        /// Join an existing project instead of starting a new one
        #[arg(long)]
        project: Option<String>,

        /// Name shown to other peers
        #[arg(long)]
        name: Option<String>,

        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Open the project and synchronize until interrupted
    Run {
        /// Listen address for incoming peers
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Extra `ws://host:port` peers to dial
        #[arg(long = "peer")]
        peers: Vec<String>,

        /// Relay server URL
        #[arg(long)]
        relay: Option<String>,

        /// Disable LAN discovery
        #[arg(long)]
        no_lan: bool,
    },

    /// Print documents, queued operations and mode from local data
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "collab_peer=debug,collaboration=debug,replica=debug,reasoning=debug"
    } else {
        "collab_peer=info,collaboration=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = cli.config.unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Init {
            project,
            name,
            force,
        } => init_command(config_path, project, name, force),
        Commands::Run {
            listen,
            peers,
            relay,
            no_lan,
        } => {
            let mut config = PeerConfig::load(&config_path)?;
            if let Some(listen) = listen {
                config.listen = listen;
            }
            config.peers.extend(peers);
            if relay.is_some() {
                config.relay_url = relay;
            }
            if no_lan {
                config.lan_discovery = false;
            }
            run_command(config).await
        }
        Commands::Status => status_command(PeerConfig::load(&config_path)?).await,
    }
}

fn init_command(path: PathBuf, project: Option<String>, name: Option<String>, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    let mut config = PeerConfig::default();
    if let Some(project) = project {
        let id = project
            .parse()
            .with_context(|| format!("Invalid project id: {}", project))?;
        config.project_id = ProjectId(id);
    }
    if let Some(name) = name {
        config.display_name = name;
    }
    config.save(&path)?;

    info!("Wrote config to {}", path.display());
    println!("project: {}", config.project_id.0);
    println!("peer:    {}", config.actor_id.0);
    Ok(())
}

async fn open_workspace(config: &PeerConfig) -> Result<Workspace> {
    let backend = BackendFactory::create(config.backend.clone()).context("Failed to create reasoning backend")?;
    let workspace = Workspace::builder(config.project_id)
        .root(config.project_root.clone())
        .actor(config.actor_id)
        .display_name(config.display_name.clone())
        .key_ref(KeyRef(format!("project:{}", config.project_id)))
        .sync_config(config.sync.clone())
        .policy(config.policy.clone())
        .backend(backend)
        .store(Arc::new(FileStore::new(config.log_dir())))
        .queue_store(OutboundQueueStore::new(config.queue_dir()))
        .open()
        .await?;
    Ok(workspace)
}

async fn run_command(config: PeerConfig) -> Result<()> {
    let workspace = open_workspace(&config).await?;
    info!(
        "Project {} open as {} ({} documents)",
        config.project_id,
        config.display_name,
        workspace.paths().len()
    );

    // Incoming peers
    let listener = WebSocketListener::bind(config.listen).await?;
    let local_addr = listener.local_addr()?;
    info!("Listening for peers on ws://{}", local_addr);
    {
        let workspace = workspace.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(channel) => {
                        let workspace = workspace.clone();
                        tokio::spawn(async move {
                            let address = channel.remote().clone();
                            if let Err(e) = workspace.attach(channel).await {
                                warn!(%address, "incoming session refused: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        debug!("accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
    }

    // Outgoing peers
    let mut connector = Connector::new(config.sync.clone())
        .with_transport(Arc::new(WebSocketTransport::direct(config.peers.clone())));
    if let Some(url) = &config.relay_url {
        connector = connector.with_transport(Arc::new(WebSocketTransport::relay(
            url.clone(),
            config.project_id,
            config.actor_id,
        )));
    }
    let mut announcer = None;
    if config.lan_discovery {
        let lan = LanTransport::new(config.project_id, config.actor_id, local_addr.port())
            .with_beacon_port(config.lan_port);
        announcer = Some(lan.spawn_announcer());
        connector = connector.with_transport(Arc::new(lan));
    }
    let connector = Arc::new(connector);

    {
        let workspace = workspace.clone();
        let connector = connector.clone();
        tokio::spawn(async move {
            let mut dialed: HashSet<PeerAddress> = HashSet::new();
            let mut discovered = connector.discover();
            while let Some(address) = discovered.next().await {
                if !dialed.insert(address.clone()) {
                    continue;
                }
                info!(%address, "dialing peer");
                let workspace = workspace.clone();
                let connector = connector.clone();
                tokio::spawn(async move {
                    if let Err(e) = connector.maintain(workspace, vec![address.clone()]).await {
                        warn!(%address, "stopped dialing peer: {}", e);
                    }
                });
            }
        });
    }

    // Surface mode changes
    {
        let mut mode = workspace.subscribe_mode();
        tokio::spawn(async move {
            while mode.changed().await.is_ok() {
                if let OperatingMode::ReadOnly { reason } = &*mode.borrow() {
                    error!("Local changes are disabled: {}", reason);
                }
            }
        });
    }

    let mut checkpoints = tokio::time::interval(Duration::from_secs(config.checkpoint_interval_secs.max(1)));
    checkpoints.tick().await;
    loop {
        tokio::select! {
            _ = checkpoints.tick() => {
                if let Err(e) = workspace.checkpoint().await {
                    warn!("Checkpoint skipped: {}", e);
                }
                for conflict in workspace.list_conflicts(config.project_id)?.iter().filter(|c| c.is_open()) {
                    info!(
                        conflict = %conflict.id,
                        path = %conflict.file_path,
                        status = %conflict.status,
                        "open conflict"
                    );
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    info!("Shutting down");
    if let Some(announcer) = announcer {
        announcer.abort();
    }
    workspace.disconnect_all();
    workspace.settle().await;
    if let Err(e) = workspace.checkpoint().await {
        warn!("Final checkpoint skipped: {}", e);
    }
    Ok(())
}

async fn status_command(config: PeerConfig) -> Result<()> {
    let workspace = open_workspace(&config).await?;

    println!("project:  {}", config.project_id.0);
    println!("peer:     {} ({})", config.display_name, config.actor_id.0);
    match workspace.mode() {
        OperatingMode::ReadWrite => println!("mode:     read-write"),
        OperatingMode::ReadOnly { reason } => println!("mode:     read-only ({})", reason),
    }
    println!("queued:   {} operation(s) awaiting delivery", workspace.queued_len());
    if workspace.is_archived() {
        println!("archived: yes (no new files or edits)");
    }

    let paths = workspace.paths();
    println!("documents ({}):", paths.len());
    for path in paths {
        let text = workspace.get_document_snapshot(&path)?;
        println!("  {:<40} {:>6} lines", path, text.lines().count());
    }

    if config.relay_url.is_none() && config.peers.is_empty() && !config.lan_discovery {
        warn!("No peers configured and LAN discovery is off");
    }
    Ok(())
}
