//! In-process peer link.
//!
//! The initiator parks a rendezvous under a random token and offers the
//! token; the responder claims it, answers and opens. The initiator opens
//! when the answer arrives. Each direction is a bounded channel, so `send`
//! waits once the peer stops reading.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::AbortHandle;
use tracing::debug;

use pd_core::ids::DeviceId;
use pd_core::network::{SessionRole, SignalKind};
use pd_core::ports::{LinkEvent, LinkEventSink, PeerLink, PeerLinkFactory};

const CHANNEL_CAPACITY: usize = 64;

struct Rendezvous {
    to_initiator: mpsc::Sender<Bytes>,
    to_responder: oneshot::Sender<mpsc::Sender<Bytes>>,
}

type PendingRendezvous = Arc<Mutex<HashMap<String, Rendezvous>>>;

/// Creates memory links that find each other through a shared table.
/// Clones share the table.
#[derive(Clone, Default)]
pub struct MemoryLinkFactory {
    pending: PendingRendezvous,
}

impl MemoryLinkFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PeerLinkFactory for MemoryLinkFactory {
    async fn open(
        &self,
        _local: &DeviceId,
        remote: &DeviceId,
        role: SessionRole,
        events: LinkEventSink,
    ) -> Result<Arc<dyn PeerLink>> {
        debug!(remote = %remote, ?role, "opening memory link");
        Ok(Arc::new(MemoryLink {
            role,
            events,
            pending: self.pending.clone(),
            token: Mutex::new(None),
            awaiting_answer: Mutex::new(None),
            peer: Mutex::new(None),
            reader: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

type AwaitingAnswer = (oneshot::Receiver<mpsc::Sender<Bytes>>, mpsc::Receiver<Bytes>);

struct MemoryLink {
    role: SessionRole,
    events: LinkEventSink,
    pending: PendingRendezvous,
    token: Mutex<Option<String>>,
    awaiting_answer: Mutex<Option<AwaitingAnswer>>,
    peer: Mutex<Option<mpsc::Sender<Bytes>>>,
    reader: Mutex<Option<AbortHandle>>,
    closed: Arc<AtomicBool>,
}

impl MemoryLink {
    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    async fn open_with(&self, peer: mpsc::Sender<Bytes>, mut inbound: mpsc::Receiver<Bytes>) {
        *self.peer.lock().await = Some(peer);

        let events = self.events.clone();
        let closed = self.closed.clone();
        let reader = tokio::spawn(async move {
            while let Some(data) = inbound.recv().await {
                if events.send(LinkEvent::Message(data)).is_err() {
                    return;
                }
            }
            if !closed.load(Ordering::Acquire) {
                let _ = events.send(LinkEvent::Closed);
            }
        })
        .abort_handle();
        *self.reader.lock().await = Some(reader);
    }

    async fn claim(&self, data: &serde_json::Value) -> Result<()> {
        let token = data
            .get("token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| anyhow!("offer carries no memory link token"))?;
        let rendezvous = self
            .pending
            .lock()
            .await
            .remove(token)
            .ok_or_else(|| anyhow!("unknown memory link token {token}"))?;

        let (to_me, inbound) = mpsc::channel(CHANNEL_CAPACITY);
        rendezvous
            .to_responder
            .send(to_me)
            .map_err(|_| anyhow!("initiator went away"))?;
        self.open_with(rendezvous.to_initiator, inbound).await;

        self.emit(LinkEvent::Signal {
            kind: SignalKind::Answer,
            data: json!({ "token": token }),
        });
        self.emit(LinkEvent::Open);
        Ok(())
    }

    async fn complete(&self) -> Result<()> {
        let Some((peer_rx, inbound)) = self.awaiting_answer.lock().await.take() else {
            debug!("duplicate answer ignored");
            return Ok(());
        };
        let peer = peer_rx.await.map_err(|_| anyhow!("responder went away"))?;
        self.open_with(peer, inbound).await;
        self.emit(LinkEvent::Open);
        Ok(())
    }
}

#[async_trait]
impl PeerLink for MemoryLink {
    async fn start(&self) -> Result<()> {
        if self.role == SessionRole::Responder {
            return Ok(());
        }

        let token = uuid::Uuid::new_v4().to_string();
        let (to_me, inbound) = mpsc::channel(CHANNEL_CAPACITY);
        let (to_responder, peer_rx) = oneshot::channel();
        self.pending.lock().await.insert(
            token.clone(),
            Rendezvous {
                to_initiator: to_me,
                to_responder,
            },
        );
        *self.awaiting_answer.lock().await = Some((peer_rx, inbound));
        *self.token.lock().await = Some(token.clone());

        self.emit(LinkEvent::Signal {
            kind: SignalKind::Offer,
            data: json!({ "token": token }),
        });
        self.emit(LinkEvent::Signal {
            kind: SignalKind::Candidate,
            data: json!({ "address": "memory" }),
        });
        Ok(())
    }

    async fn apply_remote_signal(&self, kind: SignalKind, data: serde_json::Value) -> Result<()> {
        match (self.role, kind) {
            (SessionRole::Responder, SignalKind::Offer) => self.claim(&data).await,
            (SessionRole::Initiator, SignalKind::Answer) => self.complete().await,
            (_, SignalKind::Candidate) => Ok(()),
            (role, kind) => bail!("{role:?} link cannot apply {kind:?}"),
        }
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        let peer = self
            .peer
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow!("memory link is not open"))?;
        peer.send(data).await.map_err(|_| anyhow!("memory link closed"))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.peer.lock().await.take();
        self.awaiting_answer.lock().await.take();
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        if let Some(token) = self.token.lock().await.take() {
            self.pending.lock().await.remove(&token);
        }
    }
}
