//! Assembles one device node from a loaded [`AppConfig`].

use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::sync::mpsc;
use tracing::{info, info_span, Instrument};

use pd_app::{App, AppBuilder};
use pd_core::config::AppConfig;
use pd_core::ports::{PeerLinkFactory, ReceivedContent, SignalingPort};
use pd_infra::{ChannelSink, FileDownloadSink, JsonFilePairedDeviceRepository, SystemClock};
use pd_network::{PeerConnectionManager, TcpLinkFactory, WebSocketSignaling};

use super::identity::{resolve_device, resolve_paths, NodePaths};

pub struct Node {
    pub manager: PeerConnectionManager,
    pub app: App,
    pub paths: NodePaths,
    /// Clipboard content accepted from peers, for the platform clipboard
    /// writer to pick up.
    pub clipboard: mpsc::Receiver<ReceivedContent>,
}

impl Node {
    /// Joins the signaling room, then starts the use cases.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.manager
            .initialize()
            .await
            .context("failed to join signaling room")?;
        self.app.start().await
    }

    pub async fn shutdown(&self) {
        self.app.shutdown().await;
        if let Err(err) = self.manager.shutdown().await {
            tracing::warn!(error = %err, "connection manager shutdown failed");
        }
    }
}

/// Production wiring: WebSocket rendezvous and TCP peer links.
pub fn build_node(config: &AppConfig) -> anyhow::Result<Node> {
    if config.signaling_url.trim().is_empty() {
        bail!("signaling url is not configured ([signaling] url)");
    }
    let signaling = WebSocketSignaling::parse(config.signaling_url.trim())?;
    build_node_with(config, Arc::new(signaling), Arc::new(TcpLinkFactory::new()))
}

/// Wires a node over the given transports. Must be called inside a runtime.
pub fn build_node_with(
    config: &AppConfig,
    signaling: Arc<dyn SignalingPort>,
    links: Arc<dyn PeerLinkFactory>,
) -> anyhow::Result<Node> {
    let paths = resolve_paths(config)?;
    let device = resolve_device(config, &paths.data_dir)?;
    let settings = config.settings.clone().unwrap_or_default();

    let span = info_span!("bootstrap.wiring", device_id = %device.device_id);
    let _entered = span.enter();

    let manager = PeerConnectionManager::spawn(
        device.clone(),
        settings.connection.clone(),
        signaling,
        links,
    );
    let (clipboard_sink, clipboard) = ChannelSink::new();

    let app = AppBuilder::new()
        .with_device(device.clone())
        .with_settings(settings)
        .with_connections(Arc::new(manager.clone()))
        .with_paired_devices(Arc::new(JsonFilePairedDeviceRepository::new(
            paths.paired_devices.clone(),
        )))
        .with_clipboard_sink(Arc::new(clipboard_sink))
        .with_file_sink(Arc::new(FileDownloadSink::new(paths.download_dir.clone())))
        .with_clock(Arc::new(SystemClock))
        .build()?;

    info!(
        device_name = %device.device_name,
        platform = %device.platform,
        data_dir = %paths.data_dir.display(),
        "node wired"
    );

    Ok(Node {
        manager,
        app,
        paths,
        clipboard,
    })
}

/// Logs transfer and pairing events until both streams end.
pub async fn log_events(app: &App) {
    let mut transfers = app.transfer.subscribe().await;
    let mut pairing = app.pairing.subscribe().await;

    async move {
        loop {
            tokio::select! {
                Some(event) = transfers.recv() => info!(?event, "transfer event"),
                Some(event) = pairing.recv() => info!(?event, "pairing event"),
                else => break,
            }
        }
    }
    .instrument(info_span!("node.events"))
    .await
}
