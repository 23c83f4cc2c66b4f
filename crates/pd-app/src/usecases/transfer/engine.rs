//! Chunked transfer engine.
//!
//! Every transfer is one OFFER, an ACCEPT or REJECT, a run of CHUNKs and a
//! COMPLETE, exchanged as JSON over the peer connection port. Either side may
//! abort with ERROR. Both ends keep a [`TransferSession`] per transfer id.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use pd_core::device::DeviceContext;
use pd_core::ids::{DeviceId, SessionId};
use pd_core::network::{ConnectionError, ConnectionState, PeerEvent};
use pd_core::ports::{PairedDeviceRepositoryPort, PeerConnectionPort, ReceivedContent, TransferSinkPort};
use pd_core::transfer::{
    ChangeDetector, ChunkPayload, Chunker, ContentMeta, OfferPayload, TransferDirection, TransferError,
    TransferEvent, TransferKind, TransferMessage, TransferSession, TransferStatus, CHUNK_SIZE,
};

use super::config::TransferConfig;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const PREVIEW_CHARS: usize = 100;

/// Reason sent with REJECT when an offer exceeds the local ceiling.
pub const REJECT_TOO_LARGE: &str = "too_large";
/// Reason sent with REJECT when the sender has no paired-device record.
pub const REJECT_NOT_PAIRED: &str = "not_paired";

/// Result of asking the engine to offer content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferOutcome {
    Offered(SessionId),
    /// Identical to the last content exchanged with this device for this kind.
    Unchanged,
    /// Above the per-kind ceiling; nothing was sent.
    TooLarge { size: u64, limit: u64 },
}

/// Ports the engine talks to.
#[derive(Clone)]
pub struct TransferPorts {
    pub connections: Arc<dyn PeerConnectionPort>,
    pub paired_devices: Arc<dyn PairedDeviceRepositoryPort>,
    pub clipboard_sink: Arc<dyn TransferSinkPort>,
    pub file_sink: Arc<dyn TransferSinkPort>,
}

#[derive(Clone)]
pub struct ChunkedTransferEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    ctx: DeviceContext,
    config: TransferConfig,
    ports: TransferPorts,
    sessions: Mutex<HashMap<SessionId, TransferSession>>,
    streams: Mutex<HashMap<SessionId, CancellationToken>>,
    changes: Mutex<ChangeDetector>,
    event_senders: Mutex<Vec<mpsc::Sender<TransferEvent>>>,
    inbound: Mutex<Option<AbortHandle>>,
}

impl ChunkedTransferEngine {
    pub fn new(ctx: DeviceContext, config: TransferConfig, ports: TransferPorts) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                ctx,
                config,
                ports,
                sessions: Mutex::new(HashMap::new()),
                streams: Mutex::new(HashMap::new()),
                changes: Mutex::new(ChangeDetector::new()),
                event_senders: Mutex::new(Vec::new()),
                inbound: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.inner.config
    }

    /// Subscribes to peer events and starts the inbound loop. Idempotent.
    pub async fn start(&self) -> Result<(), TransferError> {
        let mut inbound = self.inner.inbound.lock().await;
        if inbound.is_some() {
            return Ok(());
        }

        let mut events = self.inner.ports.connections.subscribe().await.map_err(transport_error)?;
        let engine = self.clone();
        let span = info_span!("transfer.inbound", device_id = %self.inner.ctx.device_id);
        let task = tokio::spawn(
            async move {
                while let Some(event) = events.recv().await {
                    engine.on_peer_event(event).await;
                }
                debug!("peer event stream ended");
            }
            .instrument(span),
        );
        *inbound = Some(task.abort_handle());
        Ok(())
    }

    /// Stops the inbound loop and every outbound stream.
    pub async fn stop(&self) {
        if let Some(task) = self.inner.inbound.lock().await.take() {
            task.abort();
        }
        for (_, token) in self.inner.streams.lock().await.drain() {
            token.cancel();
        }
    }

    pub async fn subscribe(&self) -> mpsc::Receiver<TransferEvent> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.inner.event_senders.lock().await.push(event_tx);
        event_rx
    }

    pub async fn offer_clipboard(
        &self,
        device_id: &DeviceId,
        content: Bytes,
        mime_type: &str,
    ) -> Result<OfferOutcome, TransferError> {
        let span = info_span!("transfer.offer_clipboard", device_id = %device_id, size = content.len());
        async {
            let meta = ContentMeta {
                size: content.len() as u64,
                mime_type: mime_type.to_string(),
                preview: preview_of(mime_type, &content),
                file_name: None,
            };
            self.offer_checked(device_id, TransferKind::Clipboard, meta, content).await
        }
        .instrument(span)
        .await
    }

    pub async fn offer_file(
        &self,
        device_id: &DeviceId,
        file_name: &str,
        content: Bytes,
        mime_type: &str,
    ) -> Result<OfferOutcome, TransferError> {
        let span = info_span!("transfer.offer_file", device_id = %device_id, file_name, size = content.len());
        async {
            let meta = ContentMeta {
                size: content.len() as u64,
                mime_type: mime_type.to_string(),
                preview: None,
                file_name: Some(file_name.to_string()),
            };
            self.offer_checked(device_id, TransferKind::File, meta, content).await
        }
        .instrument(span)
        .await
    }

    /// Offers clipboard content to every connected device that is also
    /// paired. Returns the ids of the transfers that were started.
    pub async fn broadcast_clipboard(&self, content: Bytes, mime_type: &str) -> Result<Vec<SessionId>, TransferError> {
        let paired: HashSet<DeviceId> = self
            .inner
            .ports
            .paired_devices
            .list_all()
            .await
            .map_err(|e| TransferError::Resource(e.to_string()))?
            .into_iter()
            .map(|record| record.device_id)
            .collect();
        let targets: Vec<DeviceId> = self
            .inner
            .ports
            .connections
            .connected_devices()
            .await
            .map_err(transport_error)?
            .into_iter()
            .filter(|device_id| paired.contains(device_id))
            .collect();

        let size = content.len() as u64;
        let limit = self.inner.config.max_clipboard_bytes;
        if size > limit {
            info!(size, limit, "clipboard content above ceiling, not broadcast");
            return Ok(Vec::new());
        }
        let targets: Vec<DeviceId> = {
            let changes = self.inner.changes.lock().await;
            targets
                .into_iter()
                .filter(|device_id| !changes.is_unchanged(TransferKind::Clipboard, device_id, &content))
                .collect()
        };
        if targets.is_empty() {
            debug!("clipboard content unchanged for every target, not broadcast");
            return Ok(Vec::new());
        }

        let meta = ContentMeta {
            size,
            mime_type: mime_type.to_string(),
            preview: preview_of(mime_type, &content),
            file_name: None,
        };
        let mut started = Vec::with_capacity(targets.len());
        for device_id in targets {
            match self
                .offer(&device_id, TransferKind::Clipboard, meta.clone(), content.clone())
                .await
            {
                Ok(session_id) => started.push(session_id),
                Err(e) => warn!(device_id = %device_id, error = %e, "clipboard broadcast to device failed"),
            }
        }
        info!(targets = started.len(), "clipboard broadcast");
        Ok(started)
    }

    /// Accepts a pending incoming offer.
    pub async fn accept(&self, session_id: &SessionId) -> Result<(), TransferError> {
        let peer = {
            let mut sessions = self.inner.sessions.lock().await;
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| TransferError::UnknownSession(session_id.clone()))?;
            if session.direction() != TransferDirection::Receive {
                return Err(TransferError::ProtocolViolation(format!(
                    "transfer {session_id} is outgoing and cannot be accepted locally"
                )));
            }
            session.set_status(TransferStatus::Syncing)?;
            session.peer().clone()
        };

        info!(session_id = %session_id, peer = %peer, "accepting transfer");
        let accept = TransferMessage::Accept {
            session_id: session_id.clone(),
        };
        if let Err(e) = self.send_message(&peer, &accept).await {
            self.fail_session(session_id, e.clone(), false).await;
            return Err(e);
        }
        Ok(())
    }

    /// Declines a pending incoming offer.
    pub async fn reject(&self, session_id: &SessionId, reason: &str) -> Result<(), TransferError> {
        let peer = {
            let mut sessions = self.inner.sessions.lock().await;
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| TransferError::UnknownSession(session_id.clone()))?;
            if session.direction() != TransferDirection::Receive {
                return Err(TransferError::ProtocolViolation(format!(
                    "transfer {session_id} is outgoing and cannot be rejected locally"
                )));
            }
            session.set_status(TransferStatus::Rejected)?;
            session.release();
            session.peer().clone()
        };

        info!(session_id = %session_id, peer = %peer, reason, "rejecting transfer");
        self.emit(TransferEvent::Rejected {
            session_id: session_id.clone(),
            reason: reason.to_string(),
        })
        .await;
        self.send_message(&peer, &TransferMessage::reject(session_id.clone(), reason))
            .await
    }

    /// Aborts a transfer in either direction and tells the peer with ERROR.
    pub async fn cancel(&self, session_id: &SessionId) -> Result<(), TransferError> {
        let live = {
            let sessions = self.inner.sessions.lock().await;
            let session = sessions
                .get(session_id)
                .ok_or_else(|| TransferError::UnknownSession(session_id.clone()))?;
            !session.status().is_terminal()
        };
        if live {
            self.fail_session(session_id, TransferError::Cancelled, true).await;
        }
        Ok(())
    }

    /// Drops any payload still held for a transfer and forgets it once it is
    /// terminal. Returns the held payload, if there was one.
    pub async fn release(&self, session_id: &SessionId) -> Result<Option<Bytes>, TransferError> {
        let mut sessions = self.inner.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| TransferError::UnknownSession(session_id.clone()))?;
        let held = session.release();
        if session.status().is_terminal() {
            sessions.remove(session_id);
        }
        Ok(held)
    }

    pub async fn session(&self, session_id: &SessionId) -> Option<TransferSession> {
        self.inner.sessions.lock().await.get(session_id).cloned()
    }

    /// Incoming offers still waiting for a decision, oldest first.
    pub async fn pending_offers(&self) -> Vec<TransferSession> {
        let sessions = self.inner.sessions.lock().await;
        let mut pending: Vec<TransferSession> = sessions
            .values()
            .filter(|s| s.direction() == TransferDirection::Receive && s.status() == TransferStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|s| s.created_at());
        pending
    }

    // ---- outbound -------------------------------------------------------

    async fn offer_checked(
        &self,
        device_id: &DeviceId,
        kind: TransferKind,
        meta: ContentMeta,
        content: Bytes,
    ) -> Result<OfferOutcome, TransferError> {
        if !self.is_paired(device_id).await? {
            info!(%kind, "device is not paired, offer refused");
            return Err(TransferError::NotPaired(device_id.clone()));
        }
        let limit = self.inner.config.limit_for(kind);
        if meta.size > limit {
            info!(size = meta.size, limit, %kind, "content above ceiling, offer skipped");
            return Ok(OfferOutcome::TooLarge { size: meta.size, limit });
        }
        if self.inner.changes.lock().await.is_unchanged(kind, device_id, &content) {
            debug!(%kind, "content unchanged, offer skipped");
            return Ok(OfferOutcome::Unchanged);
        }
        self.offer(device_id, kind, meta, content)
            .await
            .map(OfferOutcome::Offered)
    }

    async fn is_paired(&self, device_id: &DeviceId) -> Result<bool, TransferError> {
        self.inner
            .ports
            .paired_devices
            .get(device_id)
            .await
            .map(|record| record.is_some())
            .map_err(|e| TransferError::Resource(e.to_string()))
    }

    async fn offer(
        &self,
        device_id: &DeviceId,
        kind: TransferKind,
        meta: ContentMeta,
        content: Bytes,
    ) -> Result<SessionId, TransferError> {
        let session_id = SessionId::new();
        let session = TransferSession::outgoing(
            session_id.clone(),
            device_id.clone(),
            kind,
            meta.clone(),
            content.clone(),
        );
        self.inner.sessions.lock().await.insert(session_id.clone(), session);

        let offer = TransferMessage::Offer {
            session_id: session_id.clone(),
            payload: OfferPayload {
                kind,
                content_meta: meta,
                sender_name: self.inner.ctx.device_name.clone(),
            },
        };
        info!(session_id = %session_id, device_id = %device_id, %kind, "offering transfer");
        if let Err(e) = self.send_offer(device_id, &offer).await {
            self.fail_session(&session_id, e.clone(), false).await;
            return Err(e);
        }

        // A REJECT handled before this point already finished the session.
        {
            let sessions = self.inner.sessions.lock().await;
            if sessions.get(&session_id).is_some_and(|s| !s.status().is_terminal()) {
                self.inner.changes.lock().await.remember(kind, device_id, &content);
            }
        }
        Ok(session_id)
    }

    /// Sends an OFFER, opening a connection first when there is no live one.
    async fn send_offer(&self, device_id: &DeviceId, offer: &TransferMessage) -> Result<(), TransferError> {
        let bytes = encode(offer)?;
        let connections = &self.inner.ports.connections;
        match connections.send(device_id, bytes.clone()).await {
            Ok(()) => Ok(()),
            Err(ConnectionError::NoSession(_)) | Err(ConnectionError::NotLive { .. }) => {
                debug!(device_id = %device_id, "no live session, opening one for the offer");
                match connections.create_offer(device_id).await {
                    Ok(()) | Err(ConnectionError::DuplicateSession(_)) => {}
                    Err(e) => return Err(transport_error(e)),
                }
                connections.send(device_id, bytes).await.map_err(transport_error)
            }
            Err(e) => Err(transport_error(e)),
        }
    }

    async fn stream(self, session_id: SessionId, device_id: DeviceId, payload: Bytes, cancel: CancellationToken) {
        let connections = self.inner.ports.connections.clone();
        let low_water = self.inner.config.buffered_low_water;
        let total = payload.len() as u64;
        let chunker = Chunker::new(payload, self.inner.config.chunk_size);
        debug!(chunks = chunker.chunk_count(), total, "streaming transfer");

        for chunk in chunker {
            let drained = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                result = connections.wait_for_drain(&device_id, low_water) => result,
            };
            if let Err(e) = drained {
                self.fail_session(&session_id, transport_error(e), false).await;
                return;
            }
            if cancel.is_cancelled() {
                return;
            }

            let len = chunk.data.len();
            let message = TransferMessage::Chunk {
                session_id: session_id.clone(),
                payload: chunk,
            };
            if let Err(e) = self.send_message(&device_id, &message).await {
                self.fail_session(&session_id, e, false).await;
                return;
            }

            let transferred = {
                let mut sessions = self.inner.sessions.lock().await;
                match sessions.get_mut(&session_id) {
                    Some(session) if !session.status().is_terminal() => session.record_sent(len),
                    _ => return,
                }
            };
            self.emit(TransferEvent::Progress {
                session_id: session_id.clone(),
                transferred_bytes: transferred,
                total_bytes: total,
            })
            .await;
        }

        if cancel.is_cancelled() {
            return;
        }
        let complete = TransferMessage::Complete {
            session_id: session_id.clone(),
        };
        if let Err(e) = self.send_message(&device_id, &complete).await {
            self.fail_session(&session_id, e, false).await;
            return;
        }

        let kind = {
            let mut sessions = self.inner.sessions.lock().await;
            let Some(session) = sessions.get_mut(&session_id) else {
                return;
            };
            if session.set_status(TransferStatus::Completed).is_err() {
                return;
            }
            session.release();
            session.kind()
        };
        self.inner.streams.lock().await.remove(&session_id);
        info!(session_id = %session_id, device_id = %device_id, total, "transfer sent");
        self.emit(TransferEvent::Completed {
            session_id,
            direction: TransferDirection::Send,
            kind,
        })
        .await;
    }

    // ---- inbound --------------------------------------------------------

    async fn on_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::DataReceived { device_id, data } => match TransferMessage::from_bytes(&data) {
                Ok(message) => self.on_message(device_id, message).await,
                Err(e) => warn!(device_id = %device_id, error = %e, "dropping malformed transfer message"),
            },
            PeerEvent::StateChanged { device_id, state, .. } if state.is_terminal() => {
                self.cancel_device(&device_id, state).await;
            }
            _ => {}
        }
    }

    async fn on_message(&self, from: DeviceId, message: TransferMessage) {
        debug!(from = %from, message = message.name(), session_id = %message.session_id(), "transfer message");
        match message {
            TransferMessage::Offer { session_id, payload } => self.on_offer(from, session_id, payload).await,
            TransferMessage::Accept { session_id } => self.on_accept(from, session_id).await,
            TransferMessage::Reject { session_id, payload } => self.on_reject(from, session_id, payload.reason).await,
            TransferMessage::Chunk { session_id, payload } => self.on_chunk(from, session_id, payload).await,
            TransferMessage::Complete { session_id } => self.on_complete(from, session_id).await,
            TransferMessage::Error { session_id, payload } => self.on_remote_error(from, session_id, payload.error).await,
        }
    }

    async fn on_offer(&self, from: DeviceId, session_id: SessionId, offer: OfferPayload) {
        let OfferPayload {
            kind,
            content_meta,
            sender_name,
        } = offer;

        let paired = self.is_paired(&from).await.unwrap_or_else(|e| {
            warn!(from = %from, error = %e, "paired device lookup failed");
            false
        });
        if !paired {
            info!(session_id = %session_id, from = %from, %kind, "offer from unpaired device, rejecting");
            if let Err(e) = self
                .send_message(&from, &TransferMessage::reject(session_id, REJECT_NOT_PAIRED))
                .await
            {
                warn!(error = %e, "failed to send reject");
            }
            return;
        }

        let mut session = TransferSession::incoming(session_id.clone(), from.clone(), kind, content_meta.clone());
        let limit = self.inner.config.limit_for(kind);
        let too_large = content_meta.size > limit;
        let auto_accept = self.inner.config.auto_accepts(kind);
        {
            let mut sessions = self.inner.sessions.lock().await;
            if sessions.contains_key(&session_id) {
                warn!(session_id = %session_id, from = %from, "duplicate offer ignored");
                return;
            }
            // Pending -> Rejected and Pending -> Syncing are always legal.
            let _ = if too_large {
                session.set_status(TransferStatus::Rejected)
            } else if auto_accept {
                session.set_status(TransferStatus::Syncing)
            } else {
                Ok(())
            };
            sessions.insert(session_id.clone(), session);
        }

        if too_large {
            info!(session_id = %session_id, from = %from, size = content_meta.size, limit, "offer above ceiling, rejecting");
            self.emit(TransferEvent::Rejected {
                session_id: session_id.clone(),
                reason: REJECT_TOO_LARGE.to_string(),
            })
            .await;
            if let Err(e) = self
                .send_message(&from, &TransferMessage::reject(session_id, REJECT_TOO_LARGE))
                .await
            {
                warn!(error = %e, "failed to send reject");
            }
            return;
        }

        if auto_accept {
            info!(session_id = %session_id, from = %from, %kind, size = content_meta.size, "auto-accepting offer");
            let accept = TransferMessage::Accept {
                session_id: session_id.clone(),
            };
            if let Err(e) = self.send_message(&from, &accept).await {
                self.fail_session(&session_id, e, false).await;
            }
            return;
        }

        info!(session_id = %session_id, from = %from, %kind, size = content_meta.size, "offer waiting for a decision");
        self.emit(TransferEvent::OfferReceived {
            session_id,
            from,
            kind,
            meta: content_meta,
            sender_name,
        })
        .await;
    }

    async fn on_accept(&self, from: DeviceId, session_id: SessionId) {
        let payload = {
            let mut sessions = self.inner.sessions.lock().await;
            match sessions.get_mut(&session_id) {
                Some(session) if session.peer() == &from && session.direction() == TransferDirection::Send => {
                    if session.status().is_terminal() {
                        debug!(session_id = %session_id, "accept for finished transfer ignored");
                        return;
                    }
                    match session.set_status(TransferStatus::Syncing) {
                        Ok(()) => Ok(session.held().cloned().unwrap_or_default()),
                        Err(e) => Err(TransferError::ProtocolViolation(e.to_string())),
                    }
                }
                _ => Err(TransferError::UnknownSession(session_id.clone())),
            }
        };

        match payload {
            Ok(payload) => {
                let cancel = CancellationToken::new();
                self.inner
                    .streams
                    .lock()
                    .await
                    .insert(session_id.clone(), cancel.clone());
                let span = info_span!("transfer.stream", session_id = %session_id, device_id = %from);
                tokio::spawn(self.clone().stream(session_id, from, payload, cancel).instrument(span));
            }
            Err(TransferError::UnknownSession(_)) => self.reply_unknown(&from, session_id).await,
            Err(violation) => self.fail_session(&session_id, violation, true).await,
        }
    }

    async fn on_reject(&self, from: DeviceId, session_id: SessionId, reason: String) {
        let (kind, offered) = {
            let mut sessions = self.inner.sessions.lock().await;
            let Some(session) = sessions
                .get_mut(&session_id)
                .filter(|s| s.peer() == &from && s.direction() == TransferDirection::Send)
            else {
                debug!(session_id = %session_id, from = %from, "reject for unknown transfer ignored");
                return;
            };
            if session.set_status(TransferStatus::Rejected).is_err() {
                debug!(session_id = %session_id, status = ?session.status(), "late reject ignored");
                return;
            }
            (session.kind(), session.release())
        };
        if let Some(payload) = offered {
            self.inner.changes.lock().await.forget(kind, &from, &payload);
        }

        info!(session_id = %session_id, from = %from, reason = %reason, "transfer rejected by peer");
        self.emit(TransferEvent::Rejected { session_id, reason }).await;
    }

    async fn on_chunk(&self, from: DeviceId, session_id: SessionId, chunk: ChunkPayload) {
        let outcome = {
            let mut sessions = self.inner.sessions.lock().await;
            match sessions.get_mut(&session_id) {
                Some(session) if session.peer() == &from && session.direction() == TransferDirection::Receive => {
                    if session.status().is_terminal() {
                        return;
                    }
                    if chunk.data.len() > CHUNK_SIZE {
                        Err(TransferError::ProtocolViolation(format!(
                            "chunk {} carries {} bytes, above {}",
                            chunk.chunk_id,
                            chunk.data.len(),
                            CHUNK_SIZE
                        )))
                    } else {
                        session
                            .record_chunk(chunk.chunk_id, chunk.data)
                            .map(|receipt| (receipt.transferred_bytes, session.total_bytes()))
                    }
                }
                _ => Err(TransferError::UnknownSession(session_id.clone())),
            }
        };

        match outcome {
            Ok((transferred_bytes, total_bytes)) => {
                self.emit(TransferEvent::Progress {
                    session_id,
                    transferred_bytes,
                    total_bytes,
                })
                .await;
            }
            Err(TransferError::UnknownSession(_)) => self.reply_unknown(&from, session_id).await,
            Err(violation) => self.fail_session(&session_id, violation, true).await,
        }
    }

    async fn on_complete(&self, from: DeviceId, session_id: SessionId) {
        let assembled = {
            let sessions = self.inner.sessions.lock().await;
            match sessions.get(&session_id) {
                Some(session) if session.peer() == &from && session.direction() == TransferDirection::Receive => {
                    match session.status() {
                        status if status.is_terminal() => return,
                        TransferStatus::Syncing => session
                            .assemble()
                            .map(|data| (data, session.kind(), session.meta().clone())),
                        status => Err(TransferError::ProtocolViolation(format!(
                            "COMPLETE arrived while transfer {session_id} is {status:?}"
                        ))),
                    }
                }
                _ => Err(TransferError::UnknownSession(session_id.clone())),
            }
        };

        let (data, kind, meta) = match assembled {
            Ok(assembled) => assembled,
            Err(TransferError::UnknownSession(_)) => return self.reply_unknown(&from, session_id).await,
            Err(violation) => return self.fail_session(&session_id, violation, true).await,
        };

        // Writing the payload locally must not trigger an offer back.
        self.inner.changes.lock().await.remember(kind, &from, &data);

        let sink = match kind {
            TransferKind::Clipboard => &self.inner.ports.clipboard_sink,
            TransferKind::File => &self.inner.ports.file_sink,
        };
        let content = ReceivedContent {
            session_id: session_id.clone(),
            from: from.clone(),
            kind,
            meta,
            data: data.clone(),
        };
        if let Err(e) = sink.deliver(content).await {
            {
                let mut sessions = self.inner.sessions.lock().await;
                if let Some(session) = sessions.get_mut(&session_id) {
                    session.hold(data);
                }
            }
            self.fail_session(&session_id, TransferError::Resource(format!("{e:#}")), false)
                .await;
            return;
        }

        {
            let mut sessions = self.inner.sessions.lock().await;
            let Some(session) = sessions.get_mut(&session_id) else {
                return;
            };
            if session.set_status(TransferStatus::Completed).is_err() {
                return;
            }
            session.release();
        }
        info!(session_id = %session_id, from = %from, %kind, size = data.len(), "transfer received");
        self.emit(TransferEvent::Completed {
            session_id,
            direction: TransferDirection::Receive,
            kind,
        })
        .await;
    }

    async fn on_remote_error(&self, from: DeviceId, session_id: SessionId, error: String) {
        let known = {
            let sessions = self.inner.sessions.lock().await;
            sessions
                .get(&session_id)
                .is_some_and(|s| s.peer() == &from && !s.status().is_terminal())
        };
        if !known {
            debug!(session_id = %session_id, from = %from, error = %error, "error for unknown transfer ignored");
            return;
        }
        self.fail_session(&session_id, TransferError::Remote(error), false).await;
    }

    async fn reply_unknown(&self, to: &DeviceId, session_id: SessionId) {
        warn!(session_id = %session_id, from = %to, "message for unknown transfer");
        let error = TransferError::UnknownSession(session_id.clone()).to_string();
        if let Err(e) = self.send_message(to, &TransferMessage::error(session_id, error)).await {
            debug!(error = %e, "failed to report unknown transfer");
        }
    }

    async fn cancel_device(&self, device_id: &DeviceId, state: ConnectionState) {
        let affected: Vec<SessionId> = {
            let sessions = self.inner.sessions.lock().await;
            sessions
                .values()
                .filter(|s| s.peer() == device_id && !s.status().is_terminal())
                .map(|s| s.id().clone())
                .collect()
        };
        if affected.is_empty() {
            return;
        }

        info!(device_id = %device_id, %state, transfers = affected.len(), "connection ended, failing transfers");
        for session_id in affected {
            let error = TransferError::Transport(format!("connection to {device_id} is {state}"));
            self.fail_session(&session_id, error, false).await;
        }
    }

    // ---- shared ---------------------------------------------------------

    /// Marks a transfer failed, stops its stream and optionally mirrors the
    /// error to the peer. Resource errors keep the held payload. A failed
    /// outgoing transfer may be offered again.
    async fn fail_session(&self, session_id: &SessionId, error: TransferError, notify_peer: bool) {
        let (peer, offered) = {
            let mut sessions = self.inner.sessions.lock().await;
            let Some(session) = sessions.get_mut(session_id) else {
                return;
            };
            if session.status().is_terminal() {
                return;
            }
            session.fail(error.to_string());
            let offered = match session.direction() {
                TransferDirection::Send => session.held().cloned().map(|payload| (session.kind(), payload)),
                TransferDirection::Receive => None,
            };
            if !matches!(error, TransferError::Resource(_)) {
                session.release();
            }
            (session.peer().clone(), offered)
        };
        if let Some((kind, payload)) = offered {
            self.inner.changes.lock().await.forget(kind, &peer, &payload);
        }
        if let Some(cancel) = self.inner.streams.lock().await.remove(session_id) {
            cancel.cancel();
        }

        warn!(session_id = %session_id, peer = %peer, error = %error, "transfer failed");
        self.emit(TransferEvent::Failed {
            session_id: session_id.clone(),
            error: error.to_string(),
        })
        .await;

        if notify_peer {
            let message = TransferMessage::error(session_id.clone(), error.to_string());
            if let Err(e) = self.send_message(&peer, &message).await {
                debug!(error = %e, "failed to send transfer error to peer");
            }
        }
    }

    async fn send_message(&self, device_id: &DeviceId, message: &TransferMessage) -> Result<(), TransferError> {
        let bytes = encode(message)?;
        self.inner
            .ports
            .connections
            .send(device_id, bytes)
            .await
            .map_err(transport_error)
    }

    async fn emit(&self, event: TransferEvent) {
        let mut senders = self.inner.event_senders.lock().await;
        senders.retain(|sender| match sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("transfer event subscriber is lagging, event dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

fn encode(message: &TransferMessage) -> Result<Bytes, TransferError> {
    message
        .to_bytes()
        .map_err(|e| TransferError::ProtocolViolation(format!("cannot encode {}: {e}", message.name())))
}

fn transport_error(error: ConnectionError) -> TransferError {
    TransferError::Transport(error.to_string())
}

/// Short text preview for textual clipboard content.
fn preview_of(mime_type: &str, content: &[u8]) -> Option<String> {
    if !mime_type.starts_with("text/") || content.is_empty() {
        return None;
    }
    let head = &content[..content.len().min(PREVIEW_CHARS * 4)];
    Some(String::from_utf8_lossy(head).chars().take(PREVIEW_CHARS).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeConnections, MemoryRepo, RecordingSink};
    use async_trait::async_trait;
    use mockall::mock;
    use pd_core::device::Platform;
    use pd_core::pairing::PairedDeviceRecord;
    use pd_core::ports::PairedDeviceRepositoryError;
    use pd_core::transfer::RejectPayload;
    use std::time::Duration;
    use tokio::time::timeout;

    mock! {
        pub Sink {}

        #[async_trait]
        impl TransferSinkPort for Sink {
            async fn deliver(&self, content: ReceivedContent) -> anyhow::Result<()>;
        }
    }

    mock! {
        pub Repo {}

        #[async_trait]
        impl PairedDeviceRepositoryPort for Repo {
            async fn get(&self, device_id: &DeviceId) -> Result<Option<PairedDeviceRecord>, PairedDeviceRepositoryError>;
            async fn list_all(&self) -> Result<Vec<PairedDeviceRecord>, PairedDeviceRepositoryError>;
            async fn upsert(&self, record: PairedDeviceRecord) -> Result<(), PairedDeviceRepositoryError>;
            async fn delete(&self, device_id: &DeviceId) -> Result<(), PairedDeviceRepositoryError>;
        }
    }

    fn paired_with(ids: &[&str]) -> Arc<MemoryRepo> {
        let now = chrono::Utc::now();
        MemoryRepo::with(
            ids.iter()
                .map(|id| PairedDeviceRecord::from_descriptor(pd_core::device::DeviceDescriptor::anonymous(*id), now))
                .collect(),
        )
    }

    fn engine_paired_with(
        connections: Arc<FakeConnections>,
        clipboard_sink: Arc<dyn TransferSinkPort>,
        config: TransferConfig,
        paired: &[&str],
    ) -> ChunkedTransferEngine {
        let ctx = DeviceContext::new("local", "Local", Platform::Linux);
        ChunkedTransferEngine::new(
            ctx,
            config,
            TransferPorts {
                connections,
                paired_devices: paired_with(paired),
                clipboard_sink,
                file_sink: Arc::new(RecordingSink::default()),
            },
        )
    }

    fn engine_with(
        connections: Arc<FakeConnections>,
        clipboard_sink: Arc<dyn TransferSinkPort>,
        config: TransferConfig,
    ) -> ChunkedTransferEngine {
        engine_paired_with(connections, clipboard_sink, config, &["peer"])
    }

    fn data_from(device: &str, message: TransferMessage) -> PeerEvent {
        PeerEvent::DataReceived {
            device_id: DeviceId::new(device),
            data: message.to_bytes().unwrap(),
        }
    }

    fn clipboard_offer(session: &str, size: u64) -> TransferMessage {
        TransferMessage::Offer {
            session_id: session.into(),
            payload: OfferPayload {
                kind: TransferKind::Clipboard,
                content_meta: ContentMeta {
                    size,
                    mime_type: "text/plain".to_string(),
                    preview: None,
                    file_name: None,
                },
                sender_name: "Remote".to_string(),
            },
        }
    }

    fn chunk(session: &str, chunk_id: u64, data: &'static [u8], is_last: bool) -> TransferMessage {
        TransferMessage::Chunk {
            session_id: session.into(),
            payload: ChunkPayload {
                chunk_id,
                data: Bytes::from_static(data),
                is_last,
            },
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn next_event(events: &mut mpsc::Receiver<TransferEvent>) -> TransferEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no event in time")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_auto_accepted_clipboard_is_reassembled_and_delivered() {
        let connections = FakeConnections::new(&["peer"]);
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_with(connections.clone(), sink.clone(), TransferConfig::default());
        let mut events = engine.subscribe().await;

        engine.on_peer_event(data_from("peer", clipboard_offer("s1", 6))).await;
        assert_eq!(connections.sent_names(), vec!["ACCEPT"]);

        engine.on_peer_event(data_from("peer", chunk("s1", 1, b"def", true))).await;
        engine.on_peer_event(data_from("peer", chunk("s1", 0, b"abc", false))).await;
        engine
            .on_peer_event(data_from("peer", TransferMessage::Complete { session_id: "s1".into() }))
            .await;

        let delivered = sink.delivered.lock().unwrap().clone();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].data, Bytes::from_static(b"abcdef"));
        assert_eq!(delivered[0].from, DeviceId::new("peer"));

        let session = engine.session(&"s1".into()).await.unwrap();
        assert_eq!(session.status(), TransferStatus::Completed);

        let mut saw_completed = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TransferEvent::Completed { direction: TransferDirection::Receive, .. }) {
                saw_completed = true;
            }
        }
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn test_received_clipboard_is_not_offered_back() {
        let connections = FakeConnections::new(&["peer"]);
        let engine = engine_with(connections.clone(), Arc::new(RecordingSink::default()), TransferConfig::default());

        engine.on_peer_event(data_from("peer", clipboard_offer("s1", 3))).await;
        engine.on_peer_event(data_from("peer", chunk("s1", 0, b"abc", true))).await;
        engine
            .on_peer_event(data_from("peer", TransferMessage::Complete { session_id: "s1".into() }))
            .await;

        let outcome = engine
            .offer_clipboard(&DeviceId::new("peer"), Bytes::from_static(b"abc"), "text/plain")
            .await
            .unwrap();
        assert_eq!(outcome, OfferOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_oversized_offer_is_rejected_as_too_large() {
        let connections = FakeConnections::new(&["peer"]);
        let config = TransferConfig {
            max_clipboard_bytes: 4,
            ..TransferConfig::default()
        };
        let engine = engine_with(connections.clone(), Arc::new(RecordingSink::default()), config);
        let mut events = engine.subscribe().await;

        engine.on_peer_event(data_from("peer", clipboard_offer("big", 5))).await;

        let sent = connections.sent();
        assert_eq!(
            sent[0].1,
            TransferMessage::Reject {
                session_id: "big".into(),
                payload: RejectPayload {
                    reason: REJECT_TOO_LARGE.to_string()
                },
            }
        );
        assert_eq!(
            next_event(&mut events).await,
            TransferEvent::Rejected {
                session_id: "big".into(),
                reason: REJECT_TOO_LARGE.to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_file_offer_waits_for_manual_accept() {
        let connections = FakeConnections::new(&["peer"]);
        let engine = engine_with(connections.clone(), Arc::new(RecordingSink::default()), TransferConfig::default());
        let mut events = engine.subscribe().await;

        let offer = TransferMessage::Offer {
            session_id: "f1".into(),
            payload: OfferPayload {
                kind: TransferKind::File,
                content_meta: ContentMeta {
                    size: 10,
                    mime_type: "application/pdf".to_string(),
                    preview: None,
                    file_name: Some("a.pdf".to_string()),
                },
                sender_name: "Remote".to_string(),
            },
        };
        engine.on_peer_event(data_from("peer", offer)).await;

        assert!(connections.sent().is_empty());
        assert!(matches!(
            next_event(&mut events).await,
            TransferEvent::OfferReceived { kind: TransferKind::File, .. }
        ));
        assert_eq!(engine.pending_offers().await.len(), 1);

        engine.accept(&"f1".into()).await.unwrap();
        assert_eq!(connections.sent_names(), vec!["ACCEPT"]);
        assert!(engine.pending_offers().await.is_empty());
    }

    #[tokio::test]
    async fn test_manual_reject_sends_reason() {
        let connections = FakeConnections::new(&["peer"]);
        let config = TransferConfig {
            clipboard_auto_accept: false,
            ..TransferConfig::default()
        };
        let engine = engine_with(connections.clone(), Arc::new(RecordingSink::default()), config);

        engine.on_peer_event(data_from("peer", clipboard_offer("s1", 3))).await;
        engine.reject(&"s1".into(), "busy").await.unwrap();

        assert_eq!(connections.sent()[0].1, TransferMessage::reject("s1".into(), "busy"));
        let session = engine.session(&"s1".into()).await.unwrap();
        assert_eq!(session.status(), TransferStatus::Rejected);
    }

    #[tokio::test]
    async fn test_sender_streams_chunks_then_complete_after_accept() {
        let connections = FakeConnections::new(&["peer"]);
        let config = TransferConfig {
            chunk_size: 4,
            ..TransferConfig::default()
        };
        let engine = engine_with(connections.clone(), Arc::new(RecordingSink::default()), config);
        let peer = DeviceId::new("peer");

        let outcome = engine
            .offer_clipboard(&peer, Bytes::from_static(b"0123456789"), "text/plain")
            .await
            .unwrap();
        let OfferOutcome::Offered(session_id) = outcome else {
            panic!("expected an offer");
        };
        assert_eq!(connections.sent_names(), vec!["OFFER"]);

        engine
            .on_peer_event(data_from("peer", TransferMessage::Accept { session_id: session_id.clone() }))
            .await;
        wait_until(|| connections.sent_names().last() == Some(&"COMPLETE")).await;

        assert_eq!(
            connections.sent_names(),
            vec!["OFFER", "CHUNK", "CHUNK", "CHUNK", "COMPLETE"]
        );
        let session = timeout(Duration::from_secs(5), async {
            loop {
                let session = engine.session(&session_id).await.unwrap();
                if session.status() == TransferStatus::Completed {
                    return session;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(session.held().is_none());
        assert_eq!(session.transferred_bytes(), 10);
    }

    #[tokio::test]
    async fn test_unchanged_and_oversized_offers_are_skipped() {
        let connections = FakeConnections::new(&["peer"]);
        let config = TransferConfig {
            max_clipboard_bytes: 8,
            ..TransferConfig::default()
        };
        let engine = engine_with(connections.clone(), Arc::new(RecordingSink::default()), config);
        let peer = DeviceId::new("peer");

        let first = engine.offer_clipboard(&peer, Bytes::from_static(b"same"), "text/plain").await.unwrap();
        assert!(matches!(first, OfferOutcome::Offered(_)));
        let second = engine.offer_clipboard(&peer, Bytes::from_static(b"same"), "text/plain").await.unwrap();
        assert_eq!(second, OfferOutcome::Unchanged);
        let big = engine
            .offer_clipboard(&peer, Bytes::from_static(b"far too long"), "text/plain")
            .await
            .unwrap();
        assert_eq!(big, OfferOutcome::TooLarge { size: 12, limit: 8 });

        assert_eq!(connections.sent_names(), vec!["OFFER"]);
    }

    #[tokio::test]
    async fn test_offer_without_session_opens_connection_first() {
        let connections = FakeConnections::new(&[]);
        let engine = engine_with(connections.clone(), Arc::new(RecordingSink::default()), TransferConfig::default());

        let outcome = engine
            .offer_clipboard(&DeviceId::new("peer"), Bytes::from_static(b"hi"), "text/plain")
            .await
            .unwrap();

        assert!(matches!(outcome, OfferOutcome::Offered(_)));
        assert_eq!(*connections.offers.lock().unwrap(), vec![DeviceId::new("peer")]);
        assert_eq!(connections.sent_names(), vec!["OFFER"]);
    }

    #[tokio::test]
    async fn test_chunk_before_accept_fails_transfer_and_reports_error() {
        let connections = FakeConnections::new(&["peer"]);
        let config = TransferConfig {
            clipboard_auto_accept: false,
            ..TransferConfig::default()
        };
        let engine = engine_with(connections.clone(), Arc::new(RecordingSink::default()), config);

        engine.on_peer_event(data_from("peer", clipboard_offer("s1", 3))).await;
        engine.on_peer_event(data_from("peer", chunk("s1", 0, b"abc", true))).await;

        let session = engine.session(&"s1".into()).await.unwrap();
        assert_eq!(session.status(), TransferStatus::Failed);
        assert_eq!(connections.sent_names(), vec!["ERROR"]);
    }

    #[tokio::test]
    async fn test_unknown_session_gets_error_but_error_gets_nothing() {
        let connections = FakeConnections::new(&["peer"]);
        let engine = engine_with(connections.clone(), Arc::new(RecordingSink::default()), TransferConfig::default());

        engine.on_peer_event(data_from("peer", chunk("ghost", 0, b"x", true))).await;
        assert_eq!(connections.sent_names(), vec!["ERROR"]);

        engine
            .on_peer_event(data_from("peer", TransferMessage::error("ghost".into(), "boom")))
            .await;
        assert_eq!(connections.sent_names(), vec!["ERROR"]);
    }

    #[tokio::test]
    async fn test_sink_failure_fails_locally_and_retains_payload() {
        let connections = FakeConnections::new(&["peer"]);
        let mut sink = MockSink::new();
        sink.expect_deliver()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("disk full")));
        let engine = engine_with(connections.clone(), Arc::new(sink), TransferConfig::default());

        engine.on_peer_event(data_from("peer", clipboard_offer("s1", 3))).await;
        engine.on_peer_event(data_from("peer", chunk("s1", 0, b"abc", true))).await;
        engine
            .on_peer_event(data_from("peer", TransferMessage::Complete { session_id: "s1".into() }))
            .await;

        let session = engine.session(&"s1".into()).await.unwrap();
        assert_eq!(session.status(), TransferStatus::Failed);
        assert!(session.error().unwrap().contains("disk full"));
        // Resource errors stay local.
        assert_eq!(connections.sent_names(), vec!["ACCEPT"]);

        let held = engine.release(&"s1".into()).await.unwrap();
        assert_eq!(held, Some(Bytes::from_static(b"abc")));
        assert!(engine.session(&"s1".into()).await.is_none());
    }

    #[tokio::test]
    async fn test_remote_error_fails_transfer() {
        let connections = FakeConnections::new(&["peer"]);
        let engine = engine_with(connections.clone(), Arc::new(RecordingSink::default()), TransferConfig::default());
        let mut events = engine.subscribe().await;

        engine.on_peer_event(data_from("peer", clipboard_offer("s1", 3))).await;
        engine
            .on_peer_event(data_from("peer", TransferMessage::error("s1".into(), "sender gave up")))
            .await;

        let session = engine.session(&"s1".into()).await.unwrap();
        assert_eq!(session.status(), TransferStatus::Failed);
        assert!(matches!(next_event(&mut events).await, TransferEvent::Failed { .. }));
    }

    #[tokio::test]
    async fn test_closing_device_mid_transfer_stops_chunks() {
        let connections = FakeConnections::gated(&["peer"], 2);
        let config = TransferConfig {
            chunk_size: 2,
            ..TransferConfig::default()
        };
        let engine = engine_with(connections.clone(), Arc::new(RecordingSink::default()), config);
        let peer = DeviceId::new("peer");

        let OfferOutcome::Offered(session_id) = engine
            .offer_file(&peer, "notes.txt", Bytes::from_static(b"abcdefghij"), "text/plain")
            .await
            .unwrap()
        else {
            panic!("expected an offer");
        };
        engine
            .on_peer_event(data_from("peer", TransferMessage::Accept { session_id: session_id.clone() }))
            .await;
        wait_until(|| connections.sent_names().iter().filter(|n| **n == "CHUNK").count() == 2).await;

        engine
            .on_peer_event(PeerEvent::StateChanged {
                device_id: peer.clone(),
                connection_id: pd_core::ids::ConnectionId::new(),
                state: ConnectionState::Closed,
            })
            .await;
        connections.drain.add_permits(10);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let names = connections.sent_names();
        assert_eq!(names.iter().filter(|n| **n == "CHUNK").count(), 2);
        assert!(!names.contains(&"COMPLETE"));
        let session = engine.session(&session_id).await.unwrap();
        assert_eq!(session.status(), TransferStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_sends_error_to_peer() {
        let connections = FakeConnections::new(&["peer"]);
        let config = TransferConfig {
            clipboard_auto_accept: false,
            ..TransferConfig::default()
        };
        let engine = engine_with(connections.clone(), Arc::new(RecordingSink::default()), config);

        engine.on_peer_event(data_from("peer", clipboard_offer("s1", 3))).await;
        engine.cancel(&"s1".into()).await.unwrap();

        assert_eq!(
            connections.sent()[0].1,
            TransferMessage::error("s1".into(), TransferError::Cancelled.to_string())
        );
        assert!(matches!(
            engine.cancel(&"nope".into()).await,
            Err(TransferError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_broadcast_targets_connected_paired_devices_only() {
        let connections = FakeConnections::new(&["b", "d"]);
        let mut repo = MockRepo::new();
        repo.expect_list_all().returning(|| {
            let now = chrono::Utc::now();
            Ok(vec![
                PairedDeviceRecord::from_descriptor(pd_core::device::DeviceDescriptor::anonymous("b"), now),
                PairedDeviceRecord::from_descriptor(pd_core::device::DeviceDescriptor::anonymous("c"), now),
            ])
        });
        let engine = ChunkedTransferEngine::new(
            DeviceContext::new("a", "A", Platform::Linux),
            TransferConfig::default(),
            TransferPorts {
                connections: connections.clone(),
                paired_devices: Arc::new(repo),
                clipboard_sink: Arc::new(RecordingSink::default()),
                file_sink: Arc::new(RecordingSink::default()),
            },
        );

        let started = engine
            .broadcast_clipboard(Bytes::from_static(b"hello"), "text/plain")
            .await
            .unwrap();

        assert_eq!(started.len(), 1);
        let sent = connections.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, DeviceId::new("b"));
    }

    #[tokio::test]
    async fn test_offer_from_unpaired_device_is_rejected_and_never_delivered() {
        let connections = FakeConnections::new(&["stranger"]);
        let sink = Arc::new(RecordingSink::default());
        let engine = engine_paired_with(connections.clone(), sink.clone(), TransferConfig::default(), &[]);

        engine.on_peer_event(data_from("stranger", clipboard_offer("s1", 3))).await;
        engine.on_peer_event(data_from("stranger", chunk("s1", 0, b"abc", true))).await;
        engine
            .on_peer_event(data_from("stranger", TransferMessage::Complete { session_id: "s1".into() }))
            .await;

        assert!(sink.delivered.lock().unwrap().is_empty());
        let sent = connections.sent();
        assert_eq!(sent[0].1, TransferMessage::reject("s1".into(), REJECT_NOT_PAIRED));
        assert!(!connections.sent_names().contains(&"ACCEPT"));
        assert!(engine.session(&"s1".into()).await.is_none());
    }

    #[tokio::test]
    async fn test_offers_to_unpaired_devices_are_refused() {
        let connections = FakeConnections::new(&["stranger"]);
        let engine = engine_with(connections.clone(), Arc::new(RecordingSink::default()), TransferConfig::default());
        let stranger = DeviceId::new("stranger");

        let clipboard = engine
            .offer_clipboard(&stranger, Bytes::from_static(b"hi"), "text/plain")
            .await;
        assert_eq!(clipboard, Err(TransferError::NotPaired(stranger.clone())));
        let file = engine
            .offer_file(&stranger, "a.txt", Bytes::from_static(b"hi"), "text/plain")
            .await;
        assert_eq!(file, Err(TransferError::NotPaired(stranger)));
        assert!(connections.sent().is_empty());
    }

    #[tokio::test]
    async fn test_same_file_can_be_offered_to_each_device() {
        let connections = FakeConnections::new(&["b", "c"]);
        let engine = engine_paired_with(
            connections.clone(),
            Arc::new(RecordingSink::default()),
            TransferConfig::default(),
            &["b", "c"],
        );
        let report = Bytes::from_static(b"report");

        let first = engine.offer_file(&"b".into(), "r.txt", report.clone(), "text/plain").await.unwrap();
        let second = engine.offer_file(&"c".into(), "r.txt", report.clone(), "text/plain").await.unwrap();
        let again = engine.offer_file(&"b".into(), "r.txt", report, "text/plain").await.unwrap();

        assert!(matches!(first, OfferOutcome::Offered(_)));
        assert!(matches!(second, OfferOutcome::Offered(_)));
        assert_eq!(again, OfferOutcome::Unchanged);
        assert_eq!(connections.sent_names(), vec!["OFFER", "OFFER"]);
    }

    #[tokio::test]
    async fn test_rejected_offer_can_be_made_again() {
        let connections = FakeConnections::new(&["peer"]);
        let engine = engine_with(connections.clone(), Arc::new(RecordingSink::default()), TransferConfig::default());
        let peer = DeviceId::new("peer");

        let OfferOutcome::Offered(session_id) = engine
            .offer_clipboard(&peer, Bytes::from_static(b"same"), "text/plain")
            .await
            .unwrap()
        else {
            panic!("expected an offer");
        };
        engine
            .on_peer_event(data_from("peer", TransferMessage::reject(session_id, "busy")))
            .await;

        let retry = engine
            .offer_clipboard(&peer, Bytes::from_static(b"same"), "text/plain")
            .await
            .unwrap();
        assert!(matches!(retry, OfferOutcome::Offered(_)));
        assert_eq!(connections.sent_names(), vec!["OFFER", "OFFER"]);
    }

    #[tokio::test]
    async fn test_cancelled_offer_can_be_made_again() {
        let connections = FakeConnections::new(&["peer"]);
        let engine = engine_with(connections.clone(), Arc::new(RecordingSink::default()), TransferConfig::default());
        let peer = DeviceId::new("peer");

        let OfferOutcome::Offered(session_id) = engine
            .offer_file(&peer, "a.txt", Bytes::from_static(b"body"), "text/plain")
            .await
            .unwrap()
        else {
            panic!("expected an offer");
        };
        engine.cancel(&session_id).await.unwrap();

        let retry = engine
            .offer_file(&peer, "a.txt", Bytes::from_static(b"body"), "text/plain")
            .await
            .unwrap();
        assert!(matches!(retry, OfferOutcome::Offered(_)));
    }

    #[test]
    fn test_preview_only_for_text() {
        assert_eq!(preview_of("text/plain", b"hello"), Some("hello".to_string()));
        assert_eq!(preview_of("image/png", b"\x89PNG"), None);
        let long = vec![b'x'; 500];
        assert_eq!(preview_of("text/plain", &long).unwrap().chars().count(), PREVIEW_CHARS);
    }
}
