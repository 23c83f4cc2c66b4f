use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use pd_core::ports::{ReceivedContent, TransferSinkPort};

const DEFAULT_CAPACITY: usize = 64;

/// Hands received content to whoever owns the receiver, typically the
/// platform clipboard writer. Fails once the receiver is gone.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ReceivedContent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::Receiver<ReceivedContent>) {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<ReceivedContent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TransferSinkPort for ChannelSink {
    async fn deliver(&self, content: ReceivedContent) -> Result<()> {
        debug!(session_id = %content.session_id, size = content.data.len(), "handing content to channel");
        self.tx
            .send(content)
            .await
            .map_err(|_| anyhow::anyhow!("content receiver closed"))
    }
}
