use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use mesh_call::audio::CpalDevices;
use mesh_call::transport::RtcTransportFactory;
use mesh_call::{
    LocalMediaManager, MeshConfig, MeshHandle, RelayClient, RemoteMediaEvent, RoomId,
    SignalingCoordinator, WsRelayClient,
};

#[derive(Parser, Debug)]
#[command(name = "mesh-call", about = "Join a full-mesh WebRTC call room")]
struct Args {
    /// Signaling relay WebSocket URL
    #[arg(long, env = "MESH_RELAY_URL", default_value = "ws://127.0.0.1:8080")]
    relay_url: String,

    /// Room to join
    #[arg(long, env = "MESH_ROOM")]
    room: String,

    /// Video input device id
    #[arg(long)]
    video: Option<String>,

    /// Audio input device id
    #[arg(long)]
    audio: Option<String>,

    /// STUN/TURN server url, repeatable
    #[arg(long = "ice-server")]
    ice_servers: Vec<String>,

    #[arg(long, default_value_t = 30)]
    negotiation_timeout_secs: u64,
}

impl Args {
    fn config(&self) -> MeshConfig {
        let mut config = MeshConfig {
            relay_url: self.relay_url.clone(),
            negotiation_timeout_secs: self.negotiation_timeout_secs,
            ..MeshConfig::default()
        };
        if !self.ice_servers.is_empty() {
            config.ice_servers = self.ice_servers.clone();
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.config();
    config.validate()?;

    let (relay, inbound) = WsRelayClient::connect(&config.relay_url, config.inbound_capacity)
        .await
        .with_context(|| format!("connecting to relay at {}", config.relay_url))?;
    info!(peer = %relay.local_id(), "connected to relay");

    let mut media = LocalMediaManager::new(Arc::new(CpalDevices::new()));
    if args.video.is_some() || args.audio.is_some() {
        media
            .acquire(args.video.as_deref(), args.audio.as_deref())
            .await
            .context("opening requested capture devices")?;
    }

    let factory = Arc::new(RtcTransportFactory::new(config.ice_servers.clone()));
    let coordinator = SignalingCoordinator::new(config, Arc::new(relay), inbound, media, factory);
    let (handle, task) = coordinator.spawn();

    let room = RoomId::new(args.room.clone());
    handle
        .join(room.clone())
        .await
        .with_context(|| format!("joining room {room}"))?;

    run_console(&handle).await?;

    handle.shutdown().await;
    if let Err(e) = task.await {
        error!("coordinator task panicked: {}", e);
    }
    Ok(())
}

async fn run_console(handle: &MeshHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut media_events = handle.subscribe_remote_media();
    println!("commands: devices | video <id> | audio <id> | output <id> | peers | leave");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, leaving room");
                break;
            }
            event = media_events.recv() => match event {
                Ok(RemoteMediaEvent::TrackAdded { remote, track }) => {
                    info!(peer = %remote, kind = ?track.kind(), "receiving remote media");
                }
                Ok(RemoteMediaEvent::Refreshed { remote }) => {
                    info!(peer = ?remote, "remote stream refreshed");
                }
                Ok(RemoteMediaEvent::Removed { remote }) => {
                    info!(peer = %remote, "remote media removed");
                }
                Err(RecvError::Lagged(n)) => warn!("skipped {} remote media events", n),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_line(handle, line.trim()).await {
                    break;
                }
            }
        }
    }

    if let Err(e) = handle.leave().await {
        warn!("leave failed: {}", e);
    }
    Ok(())
}

/// Returns false once the user asked to leave
async fn handle_line(handle: &MeshHandle, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let result = match (parts.next(), parts.next()) {
        (None, _) => Ok(()),
        (Some("leave"), _) => return false,
        (Some("devices"), _) => handle.list_devices().await.map(|list| {
            for device in list
                .video_inputs
                .iter()
                .chain(&list.audio_inputs)
                .chain(&list.audio_outputs)
            {
                println!("{:?}\t{}\t{}", device.kind, device.id, device.label);
            }
        }),
        (Some("peers"), _) => {
            let snapshot = handle.roster();
            for peer in &snapshot.peers {
                println!("{}\t{:?}\t{}", peer.remote_id, peer.role, peer.state);
            }
            Ok(())
        }
        (Some("video"), Some(id)) => handle.switch_video(id).await,
        (Some("audio"), Some(id)) => handle.switch_audio_input(id).await,
        (Some("output"), Some(id)) => handle.set_audio_output(id).await,
        (Some(other), _) => {
            println!("unknown command: {other}");
            Ok(())
        }
    };
    if let Err(e) = result {
        println!("error: {e}");
    }
    true
}
