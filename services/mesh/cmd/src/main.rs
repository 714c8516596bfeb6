//! Radio mesh node binary.
//!
//! Runs one mesh coordinator over a UDP radio simulation with a chat console
//! on stdin/stdout.

use anyhow::Context;
use clap::Parser;
use mesh_coordinator::{ChannelEventHandler, MeshCapability, MeshCoordinator};
use mesh_identity::{MemoryTrustStore, NodeIdentity};
use mesh_storage::open_store;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[macro_use]
mod logging;
mod config;
mod console;
mod radio_udp;

use config::MeshConfig;
use console::Console;
use logging::MeshLogFormatter;

/// Infrastructure-free messaging node
#[derive(Parser, Debug)]
#[command(name = "radio-mesh", version, about = "Infrastructure-free radio messaging mesh node")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "mesh.yaml")]
    config: PathBuf,

    /// Nickname carried in announcements
    #[arg(long)]
    nickname: Option<String>,

    /// Identity key file
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Fixed PeerID as 16 hex characters
    #[arg(long)]
    peer_id: Option<String>,

    /// UDP radio bind address, e.g. 0.0.0.0:7400
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Neighbor radio address (repeatable), e.g. --neighbor 127.0.0.1:7401
    #[arg(long)]
    neighbor: Vec<SocketAddr>,

    /// Hello interval, e.g. 5s
    #[arg(long)]
    hello_interval: Option<humantime::Duration>,

    /// Announcement interval, e.g. 30s
    #[arg(long)]
    announce_interval: Option<humantime::Duration>,

    /// Storage mode: memory, file
    #[arg(long)]
    storage_mode: Option<String>,

    /// Data directory for file storage
    #[arg(long)]
    data_dir: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Flags win over file and environment
    fn apply_to(&self, config: &mut MeshConfig) {
        if let Some(nickname) = &self.nickname {
            config.nickname = nickname.clone();
        }
        if let Some(key_file) = &self.key_file {
            config.key_file = key_file.clone();
        }
        if let Some(peer_id) = &self.peer_id {
            config.peer_id = Some(peer_id.clone());
        }
        if let Some(bind) = self.bind {
            config.radio.bind = bind;
        }
        if !self.neighbor.is_empty() {
            config.radio.neighbors = self.neighbor.clone();
        }
        if let Some(interval) = self.hello_interval {
            config.radio.hello_interval = Duration::from(interval).as_secs().max(1);
        }
        if let Some(interval) = self.announce_interval {
            config.announce_interval = Duration::from(interval).as_secs().max(1);
        }
        if let Some(mode) = &self.storage_mode {
            config.storage.mode = mode.clone();
        }
        if let Some(data_dir) = &self.data_dir {
            config.storage.data_dir = data_dir.clone();
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut env_filter = EnvFilter::new("info");
    for target in [
        "radio_mesh",
        "mesh_wire",
        "mesh_identity",
        "mesh_session",
        "mesh_routing",
        "mesh_storage",
        "mesh_coordinator",
    ] {
        env_filter = env_filter.add_directive(format!("{}={}", target, args.log_level).parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(MeshLogFormatter::new("mesh"))
        .init();

    info!("Starting radio mesh node v{}", env!("CARGO_PKG_VERSION"));

    let mut config = MeshConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config);

    let identity = NodeIdentity::load_or_generate(&config.key_file)
        .with_context(|| format!("Failed to load identity from {:?}", config.key_file))?;
    component_info!(
        "identity",
        "Node fingerprint {} (key file {:?})",
        identity.fingerprint(),
        config.key_file
    );

    let trust = MemoryTrustStore::new();
    let (favorites, blocked) = config.trust_lists()?;
    for fingerprint in favorites {
        trust.favorite(fingerprint);
    }
    for fingerprint in blocked {
        trust.block(fingerprint);
    }

    let store = open_store(config.storage_mode()?)
        .await
        .context("Failed to open store-and-forward storage")?;

    let coordinator_config = config.coordinator_config()?;
    let local_peer = coordinator_config
        .peer_id
        .unwrap_or_else(mesh_wire::PeerId::random);
    let coordinator_config = mesh_coordinator::CoordinatorConfig {
        peer_id: Some(local_peer),
        ..coordinator_config
    };

    let (radio, link) = radio_udp::bind(
        config.radio.bind,
        local_peer,
        config.radio.neighbors.clone(),
        Duration::from_secs(config.radio.hello_interval.max(1)),
    )
    .await
    .with_context(|| format!("Failed to bind radio socket {}", config.radio.bind))?;

    let (handler, events) = ChannelEventHandler::channel();
    let (coordinator, handle) = MeshCoordinator::new(
        coordinator_config,
        identity,
        radio,
        Arc::new(handler),
        Arc::new(trust.clone()),
        store,
    )
    .await?;

    component_info!("mesh", "Mesh node {} ready as {}", handle.my_peer_id(), config.nickname);

    let coordinator_task = tokio::spawn(coordinator.run());
    let radio_task = tokio::spawn(link.run(handle.clone()));

    let sessions: Arc<dyn MeshCapability> = Arc::new(handle.clone());
    let console = Console::new(handle.clone(), sessions, trust);

    tokio::select! {
        result = console.run(events) => {
            if let Err(e) = result {
                component_error!("console", "Console failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, shutting down");
        }
    }

    // the coordinator drains queued events before stopping
    let _ = handle.shutdown().await;
    let _ = coordinator_task.await;
    radio_task.abort();

    info!("Radio mesh node stopped");
    Ok(())
}
