//! In-process rendezvous: routes envelopes between clients of one hub by
//! their `to` room. Used by tests and by several simulated devices running
//! in one process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use pd_core::ids::DeviceId;
use pd_core::network::SignalEnvelope;
use pd_core::ports::SignalingPort;

const ROOM_CHANNEL_CAPACITY: usize = 100;

#[derive(Clone, Default)]
pub struct MemorySignalingHub {
    rooms: Arc<Mutex<HashMap<DeviceId, mpsc::Sender<SignalEnvelope>>>>,
}

impl MemorySignalingHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self) -> MemorySignaling {
        MemorySignaling {
            hub: self.clone(),
            room: Mutex::new(None),
            heartbeats: AtomicU64::new(0),
        }
    }

    pub async fn rooms(&self) -> Vec<DeviceId> {
        let mut rooms: Vec<_> = self.rooms.lock().await.keys().cloned().collect();
        rooms.sort();
        rooms
    }

    /// Delivers an envelope as if it came from the rendezvous server.
    pub async fn deliver(&self, envelope: SignalEnvelope) -> Result<()> {
        let target = self.rooms.lock().await.get(&envelope.to).cloned();
        match target {
            Some(tx) => tx
                .send(envelope)
                .await
                .map_err(|_| anyhow!("room closed")),
            None => {
                debug!(to = %envelope.to, "no such room, dropping envelope");
                Ok(())
            }
        }
    }
}

pub struct MemorySignaling {
    hub: MemorySignalingHub,
    room: Mutex<Option<DeviceId>>,
    heartbeats: AtomicU64,
}

impl MemorySignaling {
    pub fn heartbeat_count(&self) -> u64 {
        self.heartbeats.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SignalingPort for MemorySignaling {
    async fn join(&self, room: &DeviceId) -> Result<mpsc::Receiver<SignalEnvelope>> {
        let (tx, rx) = mpsc::channel(ROOM_CHANNEL_CAPACITY);
        self.hub.rooms.lock().await.insert(room.clone(), tx);
        *self.room.lock().await = Some(room.clone());
        Ok(rx)
    }

    async fn send(&self, envelope: SignalEnvelope) -> Result<()> {
        self.hub.deliver(envelope).await
    }

    async fn heartbeat(&self) -> Result<()> {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        if let Some(room) = self.room.lock().await.take() {
            self.hub.rooms.lock().await.remove(&room);
        }
        Ok(())
    }
}
