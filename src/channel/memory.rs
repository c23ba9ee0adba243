//! In-process channel backed by mpsc queues.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::{ChannelAdapter, InboundMessage, OutboundMessage};
use crate::types::{Error, Identity, Result};

/// Daemon side of an in-memory channel.
#[derive(Debug)]
pub struct MemoryChannel {
    inbound: Mutex<mpsc::Receiver<InboundMessage>>,
    outbound: mpsc::Sender<OutboundMessage>,
}

/// The other end: injects inbound messages and reads what the daemon sent.
#[derive(Debug)]
pub struct MemoryPeer {
    inbound: mpsc::Sender<InboundMessage>,
    outbound: Mutex<mpsc::Receiver<OutboundMessage>>,
}

impl MemoryChannel {
    /// Connected pair, each direction buffering up to `buffer` messages.
    pub fn pair(buffer: usize) -> (MemoryChannel, MemoryPeer) {
        let (in_tx, in_rx) = mpsc::channel(buffer.max(1));
        let (out_tx, out_rx) = mpsc::channel(buffer.max(1));
        (
            MemoryChannel {
                inbound: Mutex::new(in_rx),
                outbound: out_tx,
            },
            MemoryPeer {
                inbound: in_tx,
                outbound: Mutex::new(out_rx),
            },
        )
    }
}

#[async_trait]
impl ChannelAdapter for MemoryChannel {
    fn name(&self) -> &str {
        "memory"
    }

    async fn recv(&self) -> Option<InboundMessage> {
        self.inbound.lock().await.recv().await
    }

    async fn send(&self, message: OutboundMessage) -> Result<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| Error::cancelled("memory channel peer dropped"))
    }
}

impl MemoryPeer {
    pub async fn send(&self, sender: &str, text: &str) -> Result<()> {
        let sender = Identity::new(sender).map_err(Error::validation)?;
        self.inbound
            .send(InboundMessage::new(sender, text))
            .await
            .map_err(|_| Error::cancelled("memory channel closed"))
    }

    pub async fn recv(&self) -> Option<OutboundMessage> {
        self.outbound.lock().await.recv().await
    }

    /// Stop delivering inbound messages. The daemon sees end-of-stream.
    pub fn close(self) -> MemoryPeerReader {
        MemoryPeerReader {
            outbound: self.outbound,
        }
    }
}

/// What is left of a [`MemoryPeer`] after closing its inbound side.
#[derive(Debug)]
pub struct MemoryPeerReader {
    outbound: Mutex<mpsc::Receiver<OutboundMessage>>,
}

impl MemoryPeerReader {
    pub async fn recv(&self) -> Option<OutboundMessage> {
        self.outbound.lock().await.recv().await
    }
}
