use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use pd_core::device::DeviceContext;
use pd_core::ports::{ClockPort, PairedDeviceRepositoryPort, PeerConnectionPort, TransferSinkPort};
use pd_core::settings::Settings;

use crate::usecases::{
    AuthCodeService, ChunkedTransferEngine, PairingConfig, PairingCoordinator, PairingPorts, TransferConfig,
    TransferPorts,
};
use crate::AppDeps;

/// Builder for assembling the application runtime.
pub struct AppBuilder {
    device: Option<DeviceContext>,
    settings: Settings,
    connections: Option<Arc<dyn PeerConnectionPort>>,
    paired_devices: Option<Arc<dyn PairedDeviceRepositoryPort>>,
    clipboard_sink: Option<Arc<dyn TransferSinkPort>>,
    file_sink: Option<Arc<dyn TransferSinkPort>>,
    clock: Option<Arc<dyn ClockPort>>,
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            device: None,
            settings: Settings::default(),
            connections: None,
            paired_devices: None,
            clipboard_sink: None,
            file_sink: None,
            clock: None,
        }
    }

    pub fn with_device(mut self, device: DeviceContext) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_connections(mut self, connections: Arc<dyn PeerConnectionPort>) -> Self {
        self.connections = Some(connections);
        self
    }

    pub fn with_paired_devices(mut self, paired_devices: Arc<dyn PairedDeviceRepositoryPort>) -> Self {
        self.paired_devices = Some(paired_devices);
        self
    }

    pub fn with_clipboard_sink(mut self, sink: Arc<dyn TransferSinkPort>) -> Self {
        self.clipboard_sink = Some(sink);
        self
    }

    pub fn with_file_sink(mut self, sink: Arc<dyn TransferSinkPort>) -> Self {
        self.file_sink = Some(sink);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn ClockPort>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> anyhow::Result<App> {
        let device = self
            .device
            .ok_or_else(|| anyhow::anyhow!("DeviceContext is required"))?;
        let deps = AppDeps {
            connections: self
                .connections
                .ok_or_else(|| anyhow::anyhow!("PeerConnectionPort is required"))?,
            paired_devices: self
                .paired_devices
                .ok_or_else(|| anyhow::anyhow!("PairedDeviceRepositoryPort is required"))?,
            clipboard_sink: self
                .clipboard_sink
                .ok_or_else(|| anyhow::anyhow!("clipboard TransferSinkPort is required"))?,
            file_sink: self
                .file_sink
                .ok_or_else(|| anyhow::anyhow!("file TransferSinkPort is required"))?,
            clock: self.clock.ok_or_else(|| anyhow::anyhow!("ClockPort is required"))?,
        };
        Ok(App::new(device, self.settings, deps))
    }
}

/// The application runtime: one device's use cases over its ports.
pub struct App {
    device: DeviceContext,
    settings: Settings,
    pub transfer: ChunkedTransferEngine,
    pub pairing: PairingCoordinator,
    pub codes: Arc<AuthCodeService>,
}

impl App {
    /// This constructor signature IS the dependency manifest.
    pub fn new(device: DeviceContext, settings: Settings, deps: AppDeps) -> Self {
        let codes = Arc::new(AuthCodeService::from_settings(&settings.pairing, deps.clock.clone()));
        let transfer = ChunkedTransferEngine::new(
            device.clone(),
            TransferConfig::from_settings(&settings),
            TransferPorts {
                connections: deps.connections.clone(),
                paired_devices: deps.paired_devices.clone(),
                clipboard_sink: deps.clipboard_sink,
                file_sink: deps.file_sink,
            },
        );
        let pairing = PairingCoordinator::new(
            device.clone(),
            PairingConfig::from_settings(&settings),
            PairingPorts {
                connections: deps.connections,
                repository: deps.paired_devices,
                clock: deps.clock,
            },
            codes.clone(),
        );

        Self {
            device,
            settings,
            transfer,
            pairing,
            codes,
        }
    }

    pub fn device(&self) -> &DeviceContext {
        &self.device
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Loads paired devices and starts the inbound loops and the code sweep.
    pub async fn start(&self) -> anyhow::Result<()> {
        let paired = self.pairing.load().await.context("failed to load paired devices")?;
        self.pairing.start().await.context("failed to start pairing listener")?;
        self.transfer.start().await.context("failed to start transfer engine")?;
        self.codes.start_sweep(self.settings.pairing.sweep_interval()).await;
        info!(device_id = %self.device.device_id, paired, "app started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.transfer.stop().await;
        self.pairing.stop().await;
        self.codes.stop().await;
        info!(device_id = %self.device.device_id, "app stopped");
    }
}
