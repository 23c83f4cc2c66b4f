//! Outbound path of a session: buffered-amount accounting and the pump that
//! feeds the link in FIFO order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use pd_core::ports::{LinkEvent, LinkEventSink, PeerLink};

/// Bytes accepted for a session but not yet written to its transport.
#[derive(Debug, Default)]
pub struct BufferGauge {
    buffered: AtomicUsize,
    closed: AtomicBool,
    drained: Notify,
}

impl BufferGauge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn add(&self, len: usize) {
        self.buffered.fetch_add(len, Ordering::AcqRel);
    }

    pub(crate) fn sub(&self, len: usize) {
        let _ = self
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(len))
            });
        self.drained.notify_waiters();
    }

    /// Session left the live states: nothing will drain any more.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.buffered.store(0, Ordering::Release);
        self.drained.notify_waiters();
    }

    /// Waits until at most `low_water` bytes are buffered. Returns `false`
    /// if the session was torn down first.
    pub async fn wait_until_at_most(&self, low_water: usize) -> bool {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return false;
            }
            if self.amount() <= low_water {
                return true;
            }
            notified.await;
        }
    }
}

/// Writer task of a connected session.
pub(crate) struct OutboxPump {
    tx: mpsc::UnboundedSender<Bytes>,
    gauge: Arc<BufferGauge>,
    task: AbortHandle,
}

impl OutboxPump {
    /// Starts pumping `backlog` (already counted in `gauge`) followed by
    /// whatever is pushed later. A write failure is reported through
    /// `events` as `LinkEvent::Failed`.
    pub(crate) fn start(
        link: Arc<dyn PeerLink>,
        backlog: VecDeque<Bytes>,
        gauge: Arc<BufferGauge>,
        events: LinkEventSink,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let pump_gauge = gauge.clone();

        let task = tokio::spawn(async move {
            if !backlog.is_empty() {
                debug!(count = backlog.len(), "flushing queued messages");
            }
            for message in backlog {
                if !write(&link, &pump_gauge, &events, message).await {
                    return;
                }
            }
            while let Some(message) = rx.recv().await {
                if !write(&link, &pump_gauge, &events, message).await {
                    return;
                }
            }
        })
        .abort_handle();

        Self { tx, gauge, task }
    }

    pub(crate) fn push(&self, message: Bytes) -> bool {
        let len = message.len();
        self.gauge.add(len);
        if self.tx.send(message).is_err() {
            self.gauge.sub(len);
            return false;
        }
        true
    }

    pub(crate) fn stop(&self) {
        self.task.abort();
    }
}

async fn write(link: &Arc<dyn PeerLink>, gauge: &BufferGauge, events: &LinkEventSink, message: Bytes) -> bool {
    let len = message.len();
    let result = link.send(message).await;
    gauge.sub(len);
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "peer link write failed");
            let _ = events.send(LinkEvent::Failed(format!("write failed: {e}")));
            false
        }
    }
}
