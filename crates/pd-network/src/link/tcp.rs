//! Direct TCP peer link with u32 length-delimited frames.
//!
//! Negotiation through signaling:
//! - initiator binds an ephemeral port, offers `{nonce, port}` and sends one
//!   `{address}` candidate per local IPv4 address;
//! - responder answers `{accepted}`, dials the candidates in order and sends
//!   the nonce as its first frame;
//! - initiator echoes the nonce back, after which both sides are open.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use pd_core::ids::DeviceId;
use pd_core::network::{SessionRole, SignalKind};
use pd_core::ports::{LinkEvent, LinkEventSink, PeerLink, PeerLinkFactory};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_QUEUE_FRAMES: usize = 32;

type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

#[derive(Debug, Serialize, Deserialize)]
struct OfferData {
    nonce: String,
    port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
struct CandidateData {
    address: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnswerData {
    accepted: bool,
}

#[derive(Debug, Clone)]
pub struct TcpLinkFactory {
    bind_ip: IpAddr,
    loopback_only: bool,
}

impl Default for TcpLinkFactory {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            loopback_only: false,
        }
    }
}

impl TcpLinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds and advertises 127.0.0.1 only.
    pub fn loopback_only() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            loopback_only: true,
        }
    }
}

#[async_trait]
impl PeerLinkFactory for TcpLinkFactory {
    async fn open(
        &self,
        _local: &DeviceId,
        remote: &DeviceId,
        role: SessionRole,
        events: LinkEventSink,
    ) -> Result<Arc<dyn PeerLink>> {
        debug!(remote = %remote, ?role, "opening tcp link");
        Ok(Arc::new(TcpLink {
            role,
            bind_ip: self.bind_ip,
            loopback_only: self.loopback_only,
            shared: Arc::new(Shared {
                events,
                writer: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                candidates: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }))
    }
}

struct Shared {
    events: LinkEventSink,
    writer: Mutex<Option<mpsc::Sender<Bytes>>>,
    tasks: Mutex<Vec<AbortHandle>>,
    candidates: Mutex<Option<mpsc::UnboundedSender<SocketAddr>>>,
    closed: AtomicBool,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    /// Reports a transport-level end unless the link was closed locally.
    fn emit_end(&self, event: LinkEvent) {
        if !self.is_closed() {
            self.emit(event);
        }
    }

    async fn track(&self, task: AbortHandle) {
        self.tasks.lock().await.push(task);
    }
}

struct TcpLink {
    role: SessionRole,
    bind_ip: IpAddr,
    loopback_only: bool,
    shared: Arc<Shared>,
}

impl TcpLink {
    fn candidate_addresses(&self, port: u16) -> Vec<SocketAddr> {
        let mut addresses = Vec::new();
        if !self.loopback_only {
            match local_ip_address::list_afinet_netifas() {
                Ok(interfaces) => addresses.extend(
                    interfaces
                        .into_iter()
                        .map(|(_, ip)| ip)
                        .filter(|ip| ip.is_ipv4() && !ip.is_loopback())
                        .map(|ip| SocketAddr::new(ip, port)),
                ),
                Err(e) => warn!(error = %e, "could not list local addresses"),
            }
        }
        addresses.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
        addresses
    }

    async fn start_initiator(&self) -> Result<()> {
        let listener = TcpListener::bind((self.bind_ip, 0))
            .await
            .context("failed to bind peer link listener")?;
        let port = listener.local_addr()?.port();
        let nonce = uuid::Uuid::new_v4().to_string();

        self.shared.emit(LinkEvent::Signal {
            kind: SignalKind::Offer,
            data: serde_json::to_value(OfferData {
                nonce: nonce.clone(),
                port,
            })?,
        });
        for address in self.candidate_addresses(port) {
            self.shared.emit(LinkEvent::Signal {
                kind: SignalKind::Candidate,
                data: serde_json::to_value(CandidateData {
                    address: address.to_string(),
                })?,
            });
        }

        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        shared.emit_end(LinkEvent::Failed(format!("accept failed: {e}")));
                        return;
                    }
                };
                match accept_handshake(stream, &nonce).await {
                    Ok(framed) => {
                        info!(%peer, "peer link accepted");
                        establish(shared, framed).await;
                        return;
                    }
                    Err(e) => debug!(%peer, error = %e, "rejected peer link connection"),
                }
            }
        })
        .abort_handle();
        self.shared.track(task).await;
        Ok(())
    }

    async fn accept_offer(&self, data: serde_json::Value) -> Result<()> {
        let offer: OfferData = serde_json::from_value(data).context("malformed tcp offer")?;
        let (tx, mut rx) = mpsc::unbounded_channel::<SocketAddr>();
        *self.shared.candidates.lock().await = Some(tx);

        let shared = self.shared.clone();
        let nonce = offer.nonce;
        let task = tokio::spawn(async move {
            while let Some(address) = rx.recv().await {
                match dial(address, &nonce).await {
                    Ok(framed) => {
                        info!(%address, "peer link connected");
                        establish(shared, framed).await;
                        return;
                    }
                    Err(e) => debug!(%address, error = %e, "candidate unreachable"),
                }
            }
        })
        .abort_handle();
        self.shared.track(task).await;

        debug!(port = offer.port, "accepted tcp offer");
        self.shared.emit(LinkEvent::Signal {
            kind: SignalKind::Answer,
            data: serde_json::to_value(AnswerData { accepted: true })?,
        });
        Ok(())
    }

    async fn add_candidate(&self, data: serde_json::Value) -> Result<()> {
        let candidate: CandidateData = serde_json::from_value(data).context("malformed tcp candidate")?;
        let Ok(address) = candidate.address.parse::<SocketAddr>() else {
            debug!(address = %candidate.address, "ignoring non-tcp candidate");
            return Ok(());
        };
        match self.shared.candidates.lock().await.as_ref() {
            Some(tx) => {
                let _ = tx.send(address);
            }
            None => debug!(%address, "candidate before offer ignored"),
        }
        Ok(())
    }
}

async fn accept_handshake(stream: TcpStream, nonce: &str) -> Result<FramedStream> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    let first = timeout(HANDSHAKE_TIMEOUT, framed.next())
        .await
        .map_err(|_| anyhow!("handshake timed out"))?
        .ok_or_else(|| anyhow!("connection closed during handshake"))??;
    if &first[..] != nonce.as_bytes() {
        bail!("nonce mismatch");
    }
    framed.send(Bytes::copy_from_slice(nonce.as_bytes())).await?;
    Ok(framed)
}

async fn dial(address: SocketAddr, nonce: &str) -> Result<FramedStream> {
    let stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(address))
        .await
        .map_err(|_| anyhow!("connect timed out"))??;
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    framed.send(Bytes::copy_from_slice(nonce.as_bytes())).await?;
    let echo = timeout(HANDSHAKE_TIMEOUT, framed.next())
        .await
        .map_err(|_| anyhow!("handshake timed out"))?
        .ok_or_else(|| anyhow!("connection closed during handshake"))??;
    if &echo[..] != nonce.as_bytes() {
        bail!("peer did not echo the nonce");
    }
    Ok(framed)
}

async fn establish(shared: Arc<Shared>, framed: FramedStream) {
    if shared.is_closed() {
        return;
    }
    let (mut sink, mut stream) = framed.split();
    let (tx, mut rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_FRAMES);

    let writer_shared = shared.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                writer_shared.emit_end(LinkEvent::Failed(format!("write failed: {e}")));
                return;
            }
        }
    })
    .abort_handle();

    let reader_shared = shared.clone();
    let reader = tokio::spawn(async move {
        loop {
            match stream.next().await {
                Some(Ok(frame)) => reader_shared.emit(LinkEvent::Message(frame.freeze())),
                Some(Err(e)) => {
                    reader_shared.emit_end(LinkEvent::Failed(format!("read failed: {e}")));
                    return;
                }
                None => {
                    reader_shared.emit_end(LinkEvent::Closed);
                    return;
                }
            }
        }
    })
    .abort_handle();

    *shared.writer.lock().await = Some(tx);
    shared.track(writer).await;
    shared.track(reader).await;
    shared.emit(LinkEvent::Open);
}

#[async_trait]
impl PeerLink for TcpLink {
    async fn start(&self) -> Result<()> {
        match self.role {
            SessionRole::Initiator => self.start_initiator().await,
            SessionRole::Responder => Ok(()),
        }
    }

    async fn apply_remote_signal(&self, kind: SignalKind, data: serde_json::Value) -> Result<()> {
        match (self.role, kind) {
            (SessionRole::Responder, SignalKind::Offer) => self.accept_offer(data).await,
            (SessionRole::Responder, SignalKind::Candidate) => self.add_candidate(data).await,
            (SessionRole::Initiator, SignalKind::Answer) => {
                let answer: AnswerData = serde_json::from_value(data).context("malformed tcp answer")?;
                if !answer.accepted {
                    self.shared.emit(LinkEvent::Failed("remote declined the offer".to_string()));
                }
                Ok(())
            }
            (SessionRole::Initiator, SignalKind::Candidate) => Ok(()),
            (role, kind) => bail!("{role:?} link cannot apply {kind:?}"),
        }
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        let writer = self
            .shared
            .writer
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow!("tcp link is not open"))?;
        writer.send(data).await.map_err(|_| anyhow!("tcp link closed"))
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.writer.lock().await.take();
        self.shared.candidates.lock().await.take();
        for task in self.shared.tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}
