//! Per-device peer sessions behind a single-writer actor.
//!
//! One task owns every [`PeerSession`]. The cloneable [`PeerConnectionManager`]
//! handle sends it commands and awaits replies; signaling receipt, link
//! events and negotiation timers are multiplexed into the same loop, so
//! session state is never shared.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

use pd_core::device::DeviceContext;
use pd_core::ids::{ConnectionId, DeviceId};
use pd_core::network::{
    ConnectionError, ConnectionState, PeerEvent, PeerSession, SessionRole, SignalEnvelope, SignalKind,
};
use pd_core::ports::{
    LinkEvent, LinkEventSink, PeerConnectionPort, PeerLink, PeerLinkFactory, SignalingPort,
};
use pd_core::settings::ConnectionSettings;

use super::outbox::{BufferGauge, OutboxPump};

const COMMAND_CHANNEL_CAPACITY: usize = 100;

type Reply<T> = oneshot::Sender<Result<T, ConnectionError>>;

enum Command {
    Initialize {
        reply: Reply<()>,
    },
    CreateOffer {
        device_id: DeviceId,
        reply: Reply<()>,
    },
    HandleSignal {
        envelope: SignalEnvelope,
        reply: Reply<()>,
    },
    Send {
        device_id: DeviceId,
        message: Bytes,
        reply: Reply<()>,
    },
    Broadcast {
        message: Bytes,
        reply: Reply<usize>,
    },
    Close {
        device_id: DeviceId,
        reply: Reply<()>,
    },
    Signal {
        device_id: DeviceId,
        kind: SignalKind,
        data: serde_json::Value,
        reply: Reply<()>,
    },
    Gauge {
        device_id: DeviceId,
        reply: Reply<Arc<BufferGauge>>,
    },
    SessionState {
        device_id: DeviceId,
        reply: Reply<Option<ConnectionState>>,
    },
    ConnectedDevices {
        reply: Reply<Vec<DeviceId>>,
    },
    Subscribe {
        reply: Reply<mpsc::UnboundedReceiver<PeerEvent>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

struct TaggedLinkEvent {
    device_id: DeviceId,
    connection_id: ConnectionId,
    event: LinkEvent,
}

/// A session plus the transport resources bound to it.
struct SessionSlot {
    session: PeerSession,
    link: Option<Arc<dyn PeerLink>>,
    link_events: Option<LinkEventSink>,
    gauge: Arc<BufferGauge>,
    pump: Option<OutboxPump>,
    forwarder: Option<AbortHandle>,
    timeout: Option<AbortHandle>,
}

impl SessionSlot {
    fn is_current(&self, connection_id: &ConnectionId) -> bool {
        self.session.connection_id() == connection_id
    }

    fn state(&self) -> ConnectionState {
        self.session.state()
    }

    fn cancel_timeout(&mut self) {
        if let Some(timeout) = self.timeout.take() {
            timeout.abort();
        }
    }

    async fn teardown(&mut self) {
        self.cancel_timeout();
        if let Some(pump) = self.pump.take() {
            pump.stop();
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.link_events = None;
        self.gauge.close();
        if let Some(link) = self.link.take() {
            link.close().await;
        }
    }

    fn transition(&mut self, next: ConnectionState) -> Option<PeerEvent> {
        match self.session.transition(next) {
            Ok(_) => Some(PeerEvent::StateChanged {
                device_id: self.session.device_id().clone(),
                connection_id: self.session.connection_id().clone(),
                state: next,
            }),
            Err(e) => {
                debug!(device_id = %self.session.device_id(), error = %e, "ignored session transition");
                None
            }
        }
    }
}

struct ManagerActor {
    ctx: DeviceContext,
    settings: ConnectionSettings,
    signaling: Arc<dyn SignalingPort>,
    links: Arc<dyn PeerLinkFactory>,
    sessions: HashMap<DeviceId, SessionSlot>,
    subscribers: Vec<mpsc::UnboundedSender<PeerEvent>>,
    inbox: Option<mpsc::Receiver<SignalEnvelope>>,
    heartbeat: Option<AbortHandle>,
    initialized: bool,
    link_tx: mpsc::UnboundedSender<TaggedLinkEvent>,
    timeout_tx: mpsc::UnboundedSender<(DeviceId, ConnectionId)>,
}

impl ManagerActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut link_rx: mpsc::UnboundedReceiver<TaggedLinkEvent>,
        mut timeout_rx: mpsc::UnboundedReceiver<(DeviceId, ConnectionId)>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                envelope = next_envelope(&mut self.inbox) => match envelope {
                    Some(envelope) => self.on_signal(envelope).await,
                    None => {
                        warn!("signaling inbox closed");
                        self.inbox = None;
                    }
                },
                Some(tagged) = link_rx.recv() => self.on_link_event(tagged).await,
                Some((device_id, connection_id)) = timeout_rx.recv() => {
                    self.on_negotiation_timeout(device_id, connection_id).await;
                }
            }
        }
        debug!("connection manager stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initialize { reply } => {
                let _ = reply.send(self.initialize().await);
            }
            Command::CreateOffer { device_id, reply } => {
                let _ = reply.send(self.create_offer(device_id).await);
            }
            Command::HandleSignal { envelope, reply } => {
                self.on_signal(envelope).await;
                let _ = reply.send(Ok(()));
            }
            Command::Send {
                device_id,
                message,
                reply,
            } => {
                let _ = reply.send(self.send(device_id, message));
            }
            Command::Broadcast { message, reply } => {
                let _ = reply.send(Ok(self.broadcast(message)));
            }
            Command::Close { device_id, reply } => {
                self.close_session(&device_id).await;
                let _ = reply.send(Ok(()));
            }
            Command::Signal {
                device_id,
                kind,
                data,
                reply,
            } => {
                let envelope = SignalEnvelope::new(&self.ctx, device_id, kind, data);
                let result = self
                    .signaling
                    .send(envelope)
                    .await
                    .map_err(|e| ConnectionError::Signaling(e.to_string()));
                let _ = reply.send(result);
            }
            Command::Gauge { device_id, reply } => {
                let result = self
                    .sessions
                    .get(&device_id)
                    .map(|slot| slot.gauge.clone())
                    .ok_or(ConnectionError::NoSession(device_id));
                let _ = reply.send(result);
            }
            Command::SessionState { device_id, reply } => {
                let _ = reply.send(Ok(self.sessions.get(&device_id).map(SessionSlot::state)));
            }
            Command::ConnectedDevices { reply } => {
                let mut devices: Vec<DeviceId> = self
                    .sessions
                    .iter()
                    .filter(|(_, slot)| slot.state() == ConnectionState::Connected)
                    .map(|(id, _)| id.clone())
                    .collect();
                devices.sort();
                let _ = reply.send(Ok(devices));
            }
            Command::Subscribe { reply } => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.subscribers.push(tx);
                let _ = reply.send(Ok(rx));
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn emit(&mut self, event: PeerEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn emit_opt(&mut self, event: Option<PeerEvent>) {
        if let Some(event) = event {
            self.emit(event);
        }
    }

    async fn initialize(&mut self) -> Result<(), ConnectionError> {
        if self.initialized {
            return Ok(());
        }

        let inbox = self
            .signaling
            .join(&self.ctx.device_id)
            .await
            .map_err(|e| ConnectionError::Signaling(e.to_string()))?;
        self.inbox = Some(inbox);
        self.heartbeat = Some(spawn_heartbeat(
            self.signaling.clone(),
            self.settings.heartbeat_interval(),
        ));
        self.initialized = true;
        info!("joined signaling room");
        Ok(())
    }

    async fn create_offer(&mut self, device_id: DeviceId) -> Result<(), ConnectionError> {
        if !self.initialized {
            return Err(ConnectionError::NotInitialized);
        }
        if device_id == self.ctx.device_id {
            return Err(ConnectionError::Negotiation(
                "cannot connect to the local device".to_string(),
            ));
        }
        if let Some(slot) = self.sessions.get(&device_id) {
            if slot.state().is_live() {
                return Err(ConnectionError::DuplicateSession(device_id));
            }
        }
        self.discard(&device_id).await;

        info!(device_id = %device_id, "creating offer");
        self.open_session(device_id, SessionRole::Initiator).await?;
        Ok(())
    }

    /// Creates a session and its link, moves it to `connecting` and starts
    /// the link. A start failure fails the session.
    async fn open_session(&mut self, device_id: DeviceId, role: SessionRole) -> Result<ConnectionId, ConnectionError> {
        let session = PeerSession::new(device_id.clone(), role);
        let connection_id = session.connection_id().clone();

        let (sink, mut link_events) = mpsc::unbounded_channel();
        let link = self
            .links
            .open(&self.ctx.device_id, &device_id, role, sink.clone())
            .await
            .map_err(|e| ConnectionError::Negotiation(e.to_string()))?;

        let forwarder = {
            let link_tx = self.link_tx.clone();
            let device_id = device_id.clone();
            let connection_id = connection_id.clone();
            tokio::spawn(async move {
                while let Some(event) = link_events.recv().await {
                    let tagged = TaggedLinkEvent {
                        device_id: device_id.clone(),
                        connection_id: connection_id.clone(),
                        event,
                    };
                    if link_tx.send(tagged).is_err() {
                        break;
                    }
                }
            })
            .abort_handle()
        };

        let timeout = {
            let timeout_tx = self.timeout_tx.clone();
            let device_id = device_id.clone();
            let connection_id = connection_id.clone();
            let after = self.settings.negotiation_timeout();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = timeout_tx.send((device_id, connection_id));
            })
            .abort_handle()
        };

        let mut slot = SessionSlot {
            session,
            link: Some(link.clone()),
            link_events: Some(sink),
            gauge: BufferGauge::new(),
            pump: None,
            forwarder: Some(forwarder),
            timeout: Some(timeout),
        };
        let event = slot.transition(ConnectionState::Connecting);
        self.sessions.insert(device_id.clone(), slot);
        self.emit_opt(event);

        if let Err(e) = link.start().await {
            let reason = format!("link start failed: {e}");
            self.fail(&device_id, &connection_id, &reason).await;
            return Err(ConnectionError::Negotiation(reason));
        }
        Ok(connection_id)
    }

    fn send(&mut self, device_id: DeviceId, message: Bytes) -> Result<(), ConnectionError> {
        let Some(slot) = self.sessions.get_mut(&device_id) else {
            return Err(ConnectionError::NoSession(device_id));
        };

        match slot.state() {
            ConnectionState::Connected => match &slot.pump {
                Some(pump) if pump.push(message) => Ok(()),
                _ => Err(ConnectionError::Transport("peer writer stopped".to_string())),
            },
            ConnectionState::New | ConnectionState::Connecting => {
                slot.gauge.add(message.len());
                slot.session.enqueue(message);
                debug!(device_id = %device_id, pending = slot.session.pending_len(), "queued until connected");
                Ok(())
            }
            state => Err(ConnectionError::NotLive { device_id, state }),
        }
    }

    fn broadcast(&mut self, message: Bytes) -> usize {
        self.sessions
            .values()
            .filter(|slot| slot.state() == ConnectionState::Connected)
            .filter_map(|slot| slot.pump.as_ref())
            .filter(|pump| pump.push(message.clone()))
            .count()
    }

    /// Tears the session down and emits `closed`. No-op without a session.
    async fn close_session(&mut self, device_id: &DeviceId) {
        let Some(mut slot) = self.sessions.remove(device_id) else {
            debug!(device_id = %device_id, "close: no session");
            return;
        };
        slot.teardown().await;
        let event = slot.transition(ConnectionState::Closed);
        info!(device_id = %device_id, "session closed");
        self.emit_opt(event);
    }

    /// Drops a terminal session without emitting anything.
    async fn discard(&mut self, device_id: &DeviceId) {
        if let Some(mut slot) = self.sessions.remove(device_id) {
            slot.teardown().await;
        }
    }

    async fn fail(&mut self, device_id: &DeviceId, connection_id: &ConnectionId, reason: &str) {
        let Some(slot) = self.sessions.get_mut(device_id) else {
            return;
        };
        if !slot.is_current(connection_id) || slot.state().is_terminal() {
            return;
        }

        warn!(device_id = %device_id, reason, "session failed");
        slot.teardown().await;
        let event = slot.transition(ConnectionState::Failed);
        self.emit_opt(event);
    }

    async fn on_signal(&mut self, envelope: SignalEnvelope) {
        if envelope.to != self.ctx.device_id {
            debug!(to = %envelope.to, "dropping envelope addressed elsewhere");
            return;
        }
        if envelope.from == self.ctx.device_id {
            debug!("dropping envelope from the local device");
            return;
        }

        match envelope.kind {
            SignalKind::Pair => self.emit(PeerEvent::PairSignal(envelope)),
            SignalKind::Offer => self.on_remote_offer(envelope).await,
            SignalKind::Answer | SignalKind::Candidate => {
                let remote = envelope.from.clone();
                let target = self
                    .sessions
                    .get(&remote)
                    .filter(|slot| slot.state().is_live())
                    .and_then(|slot| {
                        slot.link
                            .clone()
                            .map(|link| (link, slot.session.connection_id().clone()))
                    });
                let Some((link, connection_id)) = target else {
                    debug!(from = %remote, kind = ?envelope.kind, "dropping envelope without a live session");
                    return;
                };

                if let Err(e) = link.apply_remote_signal(envelope.kind, envelope.data).await {
                    let reason = format!("remote {:?} rejected: {e}", envelope.kind);
                    self.fail(&remote, &connection_id, &reason).await;
                }
            }
        }
    }

    async fn on_remote_offer(&mut self, envelope: SignalEnvelope) {
        let remote = envelope.from.clone();

        if let Some(slot) = self.sessions.get(&remote) {
            let state = slot.state();
            if state.is_live() {
                let glare = slot.session.role() == SessionRole::Initiator && state != ConnectionState::Connected;
                if glare && self.ctx.device_id < remote {
                    info!(device_id = %remote, "offer collision, keeping the local offer");
                    return;
                }
                info!(device_id = %remote, state = %state, "remote offer replaces the current session");
                self.close_session(&remote).await;
            } else {
                self.discard(&remote).await;
            }
        }

        let connection_id = match self.open_session(remote.clone(), SessionRole::Responder).await {
            Ok(id) => id,
            Err(e) => {
                warn!(device_id = %remote, error = %e, "could not answer offer");
                return;
            }
        };

        let link = self.sessions.get(&remote).and_then(|slot| slot.link.clone());
        if let Some(link) = link {
            if let Err(e) = link.apply_remote_signal(SignalKind::Offer, envelope.data).await {
                self.fail(&remote, &connection_id, &format!("offer rejected: {e}")).await;
            }
        }
    }

    async fn on_link_event(&mut self, tagged: TaggedLinkEvent) {
        let TaggedLinkEvent {
            device_id,
            connection_id,
            event,
        } = tagged;

        let state = match self.sessions.get(&device_id) {
            Some(slot) if slot.is_current(&connection_id) => slot.state(),
            _ => {
                debug!(device_id = %device_id, "dropping event from a stale link");
                return;
            }
        };

        match event {
            LinkEvent::Signal { kind, data } => {
                if state.is_terminal() {
                    return;
                }
                let envelope = SignalEnvelope::new(&self.ctx, device_id.clone(), kind, data);
                if let Err(e) = self.signaling.send(envelope).await {
                    self.fail(&device_id, &connection_id, &format!("signaling send failed: {e}"))
                        .await;
                }
            }
            LinkEvent::Open => self.on_link_open(&device_id),
            LinkEvent::Message(data) => {
                if state == ConnectionState::Connected {
                    self.emit(PeerEvent::DataReceived { device_id, data });
                } else {
                    debug!(device_id = %device_id, state = %state, "dropping message on a session that is not connected");
                }
            }
            LinkEvent::Closed => {
                info!(device_id = %device_id, "remote closed the channel");
                self.close_session(&device_id).await;
            }
            LinkEvent::Failed(reason) => self.fail(&device_id, &connection_id, &reason).await,
        }
    }

    fn on_link_open(&mut self, device_id: &DeviceId) {
        let Some(slot) = self.sessions.get_mut(device_id) else {
            return;
        };
        if slot.state() != ConnectionState::Connecting {
            return;
        }

        let event = slot.transition(ConnectionState::Connected);
        slot.cancel_timeout();
        let backlog = slot.session.drain_outbox();
        if let (Some(link), Some(sink)) = (slot.link.clone(), slot.link_events.clone()) {
            slot.pump = Some(OutboxPump::start(link, backlog, slot.gauge.clone(), sink));
        }
        info!(device_id = %device_id, role = ?slot.session.role(), "session connected");
        self.emit_opt(event);
    }

    async fn on_negotiation_timeout(&mut self, device_id: DeviceId, connection_id: ConnectionId) {
        let stuck = self
            .sessions
            .get(&device_id)
            .map(|slot| {
                slot.is_current(&connection_id)
                    && matches!(slot.state(), ConnectionState::New | ConnectionState::Connecting)
            })
            .unwrap_or(false);
        if stuck {
            let reason = ConnectionError::Negotiation(format!(
                "no connection after {:?}",
                self.settings.negotiation_timeout()
            ))
            .to_string();
            self.fail(&device_id, &connection_id, &reason).await;
        }
    }

    async fn shutdown(&mut self) {
        let devices: Vec<DeviceId> = self.sessions.keys().cloned().collect();
        for device_id in devices {
            self.close_session(&device_id).await;
        }
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        if self.initialized {
            if let Err(e) = self.signaling.leave().await {
                warn!(error = %e, "failed to leave signaling room");
            }
        }
        self.inbox = None;
        self.initialized = false;
        info!("connection manager shut down");
    }
}

async fn next_envelope(inbox: &mut Option<mpsc::Receiver<SignalEnvelope>>) -> Option<SignalEnvelope> {
    match inbox {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn spawn_heartbeat(signaling: Arc<dyn SignalingPort>, period: Duration) -> AbortHandle {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = signaling.heartbeat().await {
                warn!(error = %e, "signaling heartbeat failed");
            }
        }
    })
    .abort_handle()
}

/// Handle to the connection manager actor.
#[derive(Clone)]
pub struct PeerConnectionManager {
    commands: mpsc::Sender<Command>,
    local: DeviceId,
}

impl PeerConnectionManager {
    /// Spawns the actor on the current runtime. It stops on `shutdown` or
    /// when every handle is dropped.
    pub fn spawn(
        ctx: DeviceContext,
        settings: ConnectionSettings,
        signaling: Arc<dyn SignalingPort>,
        links: Arc<dyn PeerLinkFactory>,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (timeout_tx, timeout_rx) = mpsc::unbounded_channel();
        let local = ctx.device_id.clone();
        let span = info_span!("peer_connection_manager", device_id = %local);

        let actor = ManagerActor {
            ctx,
            settings,
            signaling,
            links,
            sessions: HashMap::new(),
            subscribers: Vec::new(),
            inbox: None,
            heartbeat: None,
            initialized: false,
            link_tx,
            timeout_tx,
        };
        tokio::spawn(actor.run(command_rx, link_rx, timeout_rx).instrument(span));

        Self { commands, local }
    }

    pub fn local_device_id(&self) -> &DeviceId {
        &self.local
    }

    /// Joins the signaling room keyed by the local device id and starts the
    /// heartbeat. Calling it again is a no-op.
    pub async fn initialize(&self) -> Result<(), ConnectionError> {
        self.request(|reply| Command::Initialize { reply }).await
    }

    /// Closes every session, stops the heartbeat and leaves the room.
    pub async fn shutdown(&self) -> Result<(), ConnectionError> {
        match self.request(|reply| Command::Shutdown { reply }).await {
            Err(ConnectionError::ManagerStopped) => Ok(()),
            other => other,
        }
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ConnectionError::ManagerStopped)?;
        rx.await.map_err(|_| ConnectionError::ManagerStopped)?
    }
}

#[async_trait]
impl PeerConnectionPort for PeerConnectionManager {
    async fn create_offer(&self, device_id: &DeviceId) -> Result<(), ConnectionError> {
        let device_id = device_id.clone();
        self.request(|reply| Command::CreateOffer { device_id, reply })
            .await
    }

    async fn handle_signal(&self, envelope: SignalEnvelope) -> Result<(), ConnectionError> {
        self.request(|reply| Command::HandleSignal { envelope, reply })
            .await
    }

    async fn send(&self, device_id: &DeviceId, message: Bytes) -> Result<(), ConnectionError> {
        let device_id = device_id.clone();
        self.request(|reply| Command::Send {
            device_id,
            message,
            reply,
        })
        .await
    }

    async fn broadcast(&self, message: Bytes) -> Result<usize, ConnectionError> {
        self.request(|reply| Command::Broadcast { message, reply })
            .await
    }

    async fn close(&self, device_id: &DeviceId) -> Result<(), ConnectionError> {
        let device_id = device_id.clone();
        self.request(|reply| Command::Close { device_id, reply }).await
    }

    async fn signal(
        &self,
        device_id: &DeviceId,
        kind: SignalKind,
        data: serde_json::Value,
    ) -> Result<(), ConnectionError> {
        let device_id = device_id.clone();
        self.request(|reply| Command::Signal {
            device_id,
            kind,
            data,
            reply,
        })
        .await
    }

    async fn buffered_amount(&self, device_id: &DeviceId) -> Result<usize, ConnectionError> {
        let device_id = device_id.clone();
        let gauge = self.request(|reply| Command::Gauge { device_id, reply }).await?;
        Ok(gauge.amount())
    }

    async fn wait_for_drain(&self, device_id: &DeviceId, low_water: usize) -> Result<(), ConnectionError> {
        let id = device_id.clone();
        let gauge = self
            .request(|reply| Command::Gauge {
                device_id: id,
                reply,
            })
            .await?;
        if gauge.wait_until_at_most(low_water).await {
            Ok(())
        } else {
            Err(ConnectionError::Transport(format!(
                "session with {device_id} ended before its buffer drained"
            )))
        }
    }

    async fn session_state(&self, device_id: &DeviceId) -> Result<Option<ConnectionState>, ConnectionError> {
        let device_id = device_id.clone();
        self.request(|reply| Command::SessionState { device_id, reply })
            .await
    }

    async fn connected_devices(&self) -> Result<Vec<DeviceId>, ConnectionError> {
        self.request(|reply| Command::ConnectedDevices { reply }).await
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<PeerEvent>, ConnectionError> {
        self.request(|reply| Command::Subscribe { reply }).await
    }
}
