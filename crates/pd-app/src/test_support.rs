//! In-process fakes shared by the use case unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Semaphore};

use pd_core::ids::DeviceId;
use pd_core::network::{ConnectionError, ConnectionState, PeerEvent, SignalEnvelope, SignalKind};
use pd_core::pairing::PairedDeviceRecord;
use pd_core::ports::{
    ClockPort, PairedDeviceRepositoryError, PairedDeviceRepositoryPort, PeerConnectionPort, ReceivedContent,
    TransferSinkPort,
};
use pd_core::transfer::TransferMessage;

/// Connection port that records what the use cases push through it.
pub struct FakeConnections {
    pub sent: Mutex<Vec<(DeviceId, TransferMessage)>>,
    pub signals: Mutex<Vec<(DeviceId, SignalKind, serde_json::Value)>>,
    pub handled: Mutex<Vec<SignalEnvelope>>,
    pub closed: Mutex<Vec<DeviceId>>,
    pub offers: Mutex<Vec<DeviceId>>,
    pub live: Mutex<HashSet<DeviceId>>,
    pub drain: Semaphore,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<PeerEvent>>>,
}

impl FakeConnections {
    pub fn new(live: &[&str]) -> Arc<Self> {
        Self::gated(live, Semaphore::MAX_PERMITS)
    }

    /// Only `permits` drain waits succeed until more are added.
    pub fn gated(live: &[&str], permits: usize) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
            handled: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            offers: Mutex::new(Vec::new()),
            live: Mutex::new(live.iter().map(|id| DeviceId::new(*id)).collect()),
            drain: Semaphore::new(permits),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<(DeviceId, TransferMessage)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_names(&self) -> Vec<&'static str> {
        self.sent().iter().map(|(_, m)| m.name()).collect()
    }

    pub fn signals(&self) -> Vec<(DeviceId, SignalKind, serde_json::Value)> {
        self.signals.lock().unwrap().clone()
    }

    /// Pushes an event to every subscriber, as the manager would.
    pub fn inject(&self, event: PeerEvent) {
        for subscriber in self.subscribers.lock().unwrap().iter() {
            let _ = subscriber.send(event.clone());
        }
    }
}

#[async_trait]
impl PeerConnectionPort for FakeConnections {
    async fn create_offer(&self, device_id: &DeviceId) -> Result<(), ConnectionError> {
        self.offers.lock().unwrap().push(device_id.clone());
        self.live.lock().unwrap().insert(device_id.clone());
        Ok(())
    }

    async fn handle_signal(&self, envelope: SignalEnvelope) -> Result<(), ConnectionError> {
        self.handled.lock().unwrap().push(envelope);
        Ok(())
    }

    async fn send(&self, device_id: &DeviceId, message: Bytes) -> Result<(), ConnectionError> {
        if !self.live.lock().unwrap().contains(device_id) {
            return Err(ConnectionError::NoSession(device_id.clone()));
        }
        let message = TransferMessage::from_bytes(&message).unwrap();
        self.sent.lock().unwrap().push((device_id.clone(), message));
        Ok(())
    }

    async fn broadcast(&self, _message: Bytes) -> Result<usize, ConnectionError> {
        Ok(0)
    }

    async fn close(&self, device_id: &DeviceId) -> Result<(), ConnectionError> {
        self.live.lock().unwrap().remove(device_id);
        self.closed.lock().unwrap().push(device_id.clone());
        Ok(())
    }

    async fn signal(
        &self,
        device_id: &DeviceId,
        kind: SignalKind,
        data: serde_json::Value,
    ) -> Result<(), ConnectionError> {
        self.signals.lock().unwrap().push((device_id.clone(), kind, data));
        Ok(())
    }

    async fn buffered_amount(&self, _device_id: &DeviceId) -> Result<usize, ConnectionError> {
        Ok(0)
    }

    async fn wait_for_drain(&self, _device_id: &DeviceId, _low_water: usize) -> Result<(), ConnectionError> {
        if let Ok(permit) = self.drain.acquire().await {
            permit.forget();
        }
        Ok(())
    }

    async fn session_state(&self, device_id: &DeviceId) -> Result<Option<ConnectionState>, ConnectionError> {
        Ok(self
            .live
            .lock()
            .unwrap()
            .contains(device_id)
            .then_some(ConnectionState::Connected))
    }

    async fn connected_devices(&self) -> Result<Vec<DeviceId>, ConnectionError> {
        let mut devices: Vec<_> = self.live.lock().unwrap().iter().cloned().collect();
        devices.sort();
        Ok(devices)
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<PeerEvent>, ConnectionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        Ok(rx)
    }
}

/// Sink that keeps everything it is handed.
#[derive(Default)]
pub struct RecordingSink {
    pub delivered: Mutex<Vec<ReceivedContent>>,
}

#[async_trait]
impl TransferSinkPort for RecordingSink {
    async fn deliver(&self, content: ReceivedContent) -> anyhow::Result<()> {
        self.delivered.lock().unwrap().push(content);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryRepo {
    pub records: Mutex<HashMap<DeviceId, PairedDeviceRecord>>,
}

impl MemoryRepo {
    pub fn with(records: Vec<PairedDeviceRecord>) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(records.into_iter().map(|r| (r.device_id.clone(), r)).collect()),
        })
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl PairedDeviceRepositoryPort for MemoryRepo {
    async fn get(&self, device_id: &DeviceId) -> Result<Option<PairedDeviceRecord>, PairedDeviceRepositoryError> {
        Ok(self.records.lock().unwrap().get(device_id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<PairedDeviceRecord>, PairedDeviceRepositoryError> {
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }

    async fn upsert(&self, record: PairedDeviceRecord) -> Result<(), PairedDeviceRepositoryError> {
        self.records.lock().unwrap().insert(record.device_id.clone(), record);
        Ok(())
    }

    async fn delete(&self, device_id: &DeviceId) -> Result<(), PairedDeviceRepositoryError> {
        self.records.lock().unwrap().remove(device_id);
        Ok(())
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn at(now_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            now_ms: AtomicI64::new(now_ms),
        })
    }

    pub fn advance_secs(&self, secs: i64) {
        self.now_ms.fetch_add(secs * 1000, Ordering::SeqCst);
    }
}

impl ClockPort for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
