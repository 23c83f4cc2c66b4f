//! Pairing coordinator.
//!
//! Keeps the paired-device list (persisted through the repository port) and
//! the set of devices seen by discovery, resolves bootstrap inputs to a
//! device and exchanges `pair` envelopes over signaling.
//!
//! A typed pairing code travels to the issuing device inside a `pair`
//! envelope (`{"code": ..}`). The issuer validates it against its own
//! registry and answers with `{"reciprocal": true, "code": ..}`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use pd_core::device::{DeviceContext, DeviceDescriptor};
use pd_core::ids::DeviceId;
use pd_core::network::{PeerEvent, SignalEnvelope, SignalKind};
use pd_core::pairing::{
    descriptor_from_envelope, normalize_code, parse_scanned, parse_signal_blob, AuthCode, BootstrapParseError,
    DiscoveredDevice, PairedDeviceRecord, PairingError, PairingEvent,
};
use pd_core::ports::{ClockPort, PairedDeviceRepositoryError, PairedDeviceRepositoryPort, PeerConnectionPort};
use pd_core::settings::Settings;

use super::auth_code_service::AuthCodeService;

const EVENT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingConfig {
    /// Pair back automatically when an unpaired device pairs with us.
    pub auto_accept_requests: bool,
}

impl PairingConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            auto_accept_requests: settings.pairing.auto_accept_requests,
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Ports the coordinator talks to.
#[derive(Clone)]
pub struct PairingPorts {
    pub connections: Arc<dyn PeerConnectionPort>,
    pub repository: Arc<dyn PairedDeviceRepositoryPort>,
    pub clock: Arc<dyn ClockPort>,
}

#[derive(Clone)]
pub struct PairingCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    ctx: DeviceContext,
    config: PairingConfig,
    ports: PairingPorts,
    codes: Arc<AuthCodeService>,
    paired: Mutex<HashMap<DeviceId, PairedDeviceRecord>>,
    discovered: Mutex<HashMap<DeviceId, DiscoveredDevice>>,
    pending_requests: Mutex<HashMap<DeviceId, DeviceDescriptor>>,
    /// Devices a typed code was sent to, with the code.
    code_requests: Mutex<HashMap<DeviceId, String>>,
    event_senders: Mutex<Vec<mpsc::Sender<PairingEvent>>>,
    listener: Mutex<Option<AbortHandle>>,
}

impl PairingCoordinator {
    pub fn new(ctx: DeviceContext, config: PairingConfig, ports: PairingPorts, codes: Arc<AuthCodeService>) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                ctx,
                config,
                ports,
                codes,
                paired: Mutex::new(HashMap::new()),
                discovered: Mutex::new(HashMap::new()),
                pending_requests: Mutex::new(HashMap::new()),
                code_requests: Mutex::new(HashMap::new()),
                event_senders: Mutex::new(Vec::new()),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Starts listening for `pair` envelopes. Idempotent.
    pub async fn start(&self) -> Result<(), PairingError> {
        let mut listener = self.inner.listener.lock().await;
        if listener.is_some() {
            return Ok(());
        }

        let mut events = self.inner.ports.connections.subscribe().await?;
        let coordinator = self.clone();
        let span = info_span!("pairing.inbound", device_id = %self.inner.ctx.device_id);
        let task = tokio::spawn(
            async move {
                while let Some(event) = events.recv().await {
                    if let PeerEvent::PairSignal(envelope) = event {
                        if let Err(e) = coordinator.handle_pair_signal(envelope).await {
                            warn!(error = %e, "failed to handle pair envelope");
                        }
                    }
                }
                debug!("peer event stream ended");
            }
            .instrument(span),
        );
        *listener = Some(task.abort_handle());
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(task) = self.inner.listener.lock().await.take() {
            task.abort();
        }
    }

    pub async fn subscribe(&self) -> mpsc::Receiver<PairingEvent> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.inner.event_senders.lock().await.push(event_tx);
        event_rx
    }

    /// Replaces the in-memory paired list with the persisted one.
    pub async fn load(&self) -> Result<usize, PairingError> {
        let records = self.inner.ports.repository.list_all().await.map_err(repository_error)?;
        let count = records.len();
        let paired: HashMap<DeviceId, PairedDeviceRecord> =
            records.into_iter().map(|r| (r.device_id.clone(), r)).collect();

        {
            let mut discovered = self.inner.discovered.lock().await;
            for device in discovered.values_mut() {
                device.is_paired = paired.contains_key(&device.descriptor.device_id);
            }
        }
        *self.inner.paired.lock().await = paired;
        info!(count, "paired devices loaded");
        Ok(count)
    }

    /// Marks `device` as paired locally and sends it a `pair` envelope.
    ///
    /// The local record is kept even when the envelope cannot be sent, so a
    /// retry only needs to repeat the call.
    pub async fn pair(&self, device: DeviceDescriptor) -> Result<PairedDeviceRecord, PairingError> {
        let span = info_span!("pairing.pair", device_id = %device.device_id);
        async {
            let record = self.register(device).await?;
            self.send_pair(&record.device_id, json!({})).await?;
            Ok(record)
        }
        .instrument(span)
        .await
    }

    pub async fn unpair(&self, device_id: &DeviceId) -> Result<(), PairingError> {
        let span = info_span!("pairing.unpair", device_id = %device_id);
        async {
            self.inner
                .ports
                .repository
                .delete(device_id)
                .await
                .map_err(repository_error)?;
            let was_paired = self.inner.paired.lock().await.remove(device_id).is_some();
            if let Some(device) = self.inner.discovered.lock().await.get_mut(device_id) {
                device.is_paired = false;
            }
            self.inner.ports.connections.close(device_id).await?;

            info!(was_paired, "device unpaired");
            self.emit(PairingEvent::Unpaired(device_id.clone())).await;
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Handles an inbound `pair` envelope.
    ///
    /// An envelope carrying a pairing code is checked against the local
    /// registry and, when valid, pairs regardless of the confirmation policy.
    /// Otherwise an envelope from an already paired device is ignored, and a
    /// new request is announced and then either accepted straight away
    /// (sending a reciprocal `pair`) or held for `accept_request` /
    /// `reject_request`.
    pub async fn handle_pair_signal(&self, envelope: SignalEnvelope) -> Result<(), PairingError> {
        if envelope.kind != SignalKind::Pair || envelope.from == self.inner.ctx.device_id {
            return Ok(());
        }

        let device = descriptor_from_envelope(&envelope);
        let device_id = device.device_id.clone();
        let code = envelope.data.get("code").and_then(|c| c.as_str()).map(str::to_string);
        let reciprocal = envelope
            .data
            .get("reciprocal")
            .and_then(|r| r.as_bool())
            .unwrap_or(false);
        match code {
            Some(code) if reciprocal => return self.complete_code_pairing(device, &code).await,
            Some(code) => return self.grant_code_pairing(device, &code).await,
            None => {}
        }

        if self.is_paired(&device_id).await {
            debug!(device_id = %device_id, "pair from already paired device ignored");
            return Ok(());
        }

        info!(device_id = %device_id, name = %device.name, "pairing request received");
        self.emit(PairingEvent::PairingRequestReceived {
            device_id: device_id.clone(),
            name: device.name.clone(),
            platform: device.platform,
        })
        .await;

        if self.inner.config.auto_accept_requests {
            self.register(device).await?;
            self.send_pair(&device_id, json!({ "reciprocal": true })).await
        } else {
            self.inner.pending_requests.lock().await.insert(device_id, device);
            Ok(())
        }
    }

    pub async fn accept_request(&self, device_id: &DeviceId) -> Result<PairedDeviceRecord, PairingError> {
        let device = self
            .inner
            .pending_requests
            .lock()
            .await
            .remove(device_id)
            .ok_or_else(|| PairingError::NoPendingRequest(device_id.clone()))?;
        let record = self.register(device).await?;
        self.send_pair(device_id, json!({ "reciprocal": true })).await?;
        Ok(record)
    }

    pub async fn reject_request(&self, device_id: &DeviceId) -> Result<(), PairingError> {
        self.inner
            .pending_requests
            .lock()
            .await
            .remove(device_id)
            .ok_or_else(|| PairingError::NoPendingRequest(device_id.clone()))?;
        info!(device_id = %device_id, "pairing request rejected");
        self.emit(PairingEvent::RequestRejected(device_id.clone())).await;
        Ok(())
    }

    pub async fn pending_requests(&self) -> Vec<DeviceDescriptor> {
        let mut pending: Vec<_> = self.inner.pending_requests.lock().await.values().cloned().collect();
        pending.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        pending
    }

    /// Pairs with the device named by a scanned QR payload.
    pub async fn pair_with_scanned(&self, raw: &str) -> Result<PairedDeviceRecord, PairingError> {
        let device = parse_scanned(raw)?;
        self.pair(device).await
    }

    /// Sends a typed code to every discovered device that is not paired yet.
    /// Only the device that issued the code answers; the pairing completes
    /// when its reply arrives. Returns the devices the code was sent to.
    pub async fn pair_with_code(&self, raw: &str) -> Result<Vec<DeviceId>, PairingError> {
        let code = normalize_code(raw).ok_or(BootstrapParseError::InvalidCodeFormat)?;
        let targets: Vec<DeviceId> = {
            let discovered = self.inner.discovered.lock().await;
            let mut targets: Vec<_> = discovered
                .values()
                .filter(|d| !d.is_paired && d.descriptor.device_id != self.inner.ctx.device_id)
                .map(|d| d.descriptor.device_id.clone())
                .collect();
            targets.sort();
            targets
        };
        if targets.is_empty() {
            return Err(PairingError::NoCodeTarget);
        }
        self.send_code(&targets, code).await?;
        Ok(targets)
    }

    /// Sends a typed code to a device known to have issued it.
    pub async fn pair_with_code_from(&self, issuer: &DeviceId, raw: &str) -> Result<(), PairingError> {
        let code = normalize_code(raw).ok_or(BootstrapParseError::InvalidCodeFormat)?;
        if issuer == &self.inner.ctx.device_id {
            return Err(PairingError::SelfPairing);
        }
        self.send_code(std::slice::from_ref(issuer), code).await
    }

    /// Pairs with the sender of a pasted signaling envelope. Negotiation
    /// envelopes are also handed to the connection manager.
    pub async fn pair_with_signal_blob(&self, raw: &str) -> Result<PairedDeviceRecord, PairingError> {
        let envelope = parse_signal_blob(raw)?;
        let device = descriptor_from_envelope(&envelope);
        if envelope.kind.is_negotiation() {
            self.inner.ports.connections.handle_signal(envelope).await?;
        }
        self.pair(device).await
    }

    /// Issues a pairing code owned by the local device.
    pub async fn issue_code(&self) -> Result<AuthCode, PairingError> {
        self.inner
            .codes
            .generate_code(&self.inner.ctx.device_id)
            .await
            .map_err(|e| PairingError::CodeUnavailable(e.reason().to_string()))
    }

    async fn send_code(&self, targets: &[DeviceId], code: String) -> Result<(), PairingError> {
        {
            let mut requests = self.inner.code_requests.lock().await;
            for target in targets {
                requests.insert(target.clone(), code.clone());
            }
        }
        info!(targets = targets.len(), "sending pairing code");
        for target in targets {
            self.send_pair(target, json!({ "code": code })).await?;
        }
        Ok(())
    }

    /// Issuer side: a device typed one of our codes.
    async fn grant_code_pairing(&self, device: DeviceDescriptor, code: &str) -> Result<(), PairingError> {
        let device_id = device.device_id.clone();
        self.inner
            .codes
            .validate_code(code, &device_id)
            .await
            .map_err(|e| PairingError::InvalidCode {
                reason: e.reason().to_string(),
            })?;

        info!(device_id = %device_id, name = %device.name, "pairing code accepted");
        self.emit(PairingEvent::PairingRequestReceived {
            device_id: device_id.clone(),
            name: device.name.clone(),
            platform: device.platform,
        })
        .await;
        self.register(device).await?;
        self.send_pair(&device_id, json!({ "reciprocal": true, "code": code }))
            .await
    }

    /// Joiner side: the issuer confirmed the code we sent it.
    async fn complete_code_pairing(&self, device: DeviceDescriptor, code: &str) -> Result<(), PairingError> {
        let device_id = device.device_id.clone();
        {
            let mut requests = self.inner.code_requests.lock().await;
            if requests.get(&device_id).map(String::as_str) != Some(code) {
                debug!(device_id = %device_id, "code confirmation without a matching request ignored");
                return Ok(());
            }
            requests.retain(|_, sent| sent != code);
        }
        self.register(device).await.map(|_| ())
    }

    /// Records a device reported by discovery. A paired device whose name or
    /// platform changed gets its record refreshed.
    pub async fn on_device_found(&self, device: DeviceDescriptor) -> Result<(), PairingError> {
        let device_id = device.device_id.clone();
        if device_id == self.inner.ctx.device_id {
            return Ok(());
        }

        let stale_record = {
            let paired = self.inner.paired.lock().await;
            paired.get(&device_id).filter(|r| r.differs_from(&device)).cloned()
        };
        let is_paired = stale_record.is_some() || self.is_paired(&device_id).await;

        if let Some(record) = stale_record {
            let refreshed = PairedDeviceRecord::from_descriptor(device.clone(), record.paired_at);
            self.inner
                .ports
                .repository
                .upsert(refreshed.clone())
                .await
                .map_err(repository_error)?;
            self.inner.paired.lock().await.insert(device_id.clone(), refreshed);
            info!(device_id = %device_id, name = %device.name, "paired device identity refreshed");
        }

        {
            let now = self.inner.ports.clock.now();
            let mut discovered = self.inner.discovered.lock().await;
            discovered
                .entry(device_id)
                .and_modify(|d| {
                    d.descriptor = device.clone();
                    d.last_seen = now;
                    d.is_paired = is_paired;
                })
                .or_insert_with(|| DiscoveredDevice::new(device.clone(), now, is_paired));
        }

        self.emit(PairingEvent::DeviceFound(device)).await;
        Ok(())
    }

    pub async fn on_device_lost(&self, device_id: &DeviceId) {
        if self.inner.discovered.lock().await.remove(device_id).is_some() {
            debug!(device_id = %device_id, "device lost");
            self.emit(PairingEvent::DeviceLost(device_id.clone())).await;
        }
    }

    /// Paired devices, oldest pairing first.
    pub async fn paired_devices(&self) -> Vec<PairedDeviceRecord> {
        let mut records: Vec<_> = self.inner.paired.lock().await.values().cloned().collect();
        records.sort_by_key(|r| r.paired_at);
        records
    }

    pub async fn is_paired(&self, device_id: &DeviceId) -> bool {
        self.inner.paired.lock().await.contains_key(device_id)
    }

    pub async fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        let mut devices: Vec<_> = self.inner.discovered.lock().await.values().cloned().collect();
        devices.sort_by(|a, b| a.descriptor.name.cmp(&b.descriptor.name));
        devices
    }

    /// Persists and caches the record, clears any pending request and
    /// announces the pairing. An existing record keeps its `paired_at`.
    async fn register(&self, device: DeviceDescriptor) -> Result<PairedDeviceRecord, PairingError> {
        let device_id = device.device_id.clone();
        if device_id == self.inner.ctx.device_id {
            return Err(PairingError::SelfPairing);
        }

        let paired_at = self
            .inner
            .paired
            .lock()
            .await
            .get(&device_id)
            .map(|r| r.paired_at)
            .unwrap_or_else(|| self.inner.ports.clock.now());
        let record = PairedDeviceRecord::from_descriptor(device.clone(), paired_at);
        self.inner
            .ports
            .repository
            .upsert(record.clone())
            .await
            .map_err(repository_error)?;

        self.inner.paired.lock().await.insert(device_id.clone(), record.clone());
        self.inner.pending_requests.lock().await.remove(&device_id);
        if let Some(discovered) = self.inner.discovered.lock().await.get_mut(&device_id) {
            discovered.is_paired = true;
        }

        info!(device_id = %device_id, name = %device.name, "device paired");
        self.emit(PairingEvent::Paired(device)).await;
        Ok(record)
    }

    async fn send_pair(&self, device_id: &DeviceId, data: serde_json::Value) -> Result<(), PairingError> {
        self.inner
            .ports
            .connections
            .signal(device_id, SignalKind::Pair, data)
            .await
            .map_err(PairingError::from)
    }

    async fn emit(&self, event: PairingEvent) {
        let mut senders = self.inner.event_senders.lock().await;
        senders.retain(|sender| match sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("pairing event subscriber is lagging, event dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

fn repository_error(error: PairedDeviceRepositoryError) -> PairingError {
    PairingError::Repository(error.to_string())
}
