//! External channel boundary.
//!
//! A [`ChannelAdapter`] moves messages between the daemon and one trusted
//! transport. The daemon only talks to a [`Channel<Verified>`]; getting one
//! means going through `Unlinked → Linked → Verified`.

mod line;
mod memory;

pub use line::{LineChannel, StdioChannel};
pub use memory::{MemoryChannel, MemoryPeer};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::envelope::{Envelope, Payload};
use crate::types::{Identity, Result};

/// A message as the channel delivered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Channel-attributed sender.
    pub sender: Identity,
    pub text: String,
}

impl InboundMessage {
    pub fn new(sender: Identity, text: impl Into<String>) -> Self {
        Self {
            sender,
            text: text.into(),
        }
    }
}

/// A message for the channel to deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub recipient: Identity,
    pub payload: Payload,
}

impl From<&Envelope> for OutboundMessage {
    fn from(envelope: &Envelope) -> Self {
        Self {
            recipient: envelope.peer().clone(),
            payload: envelope.payload().clone(),
        }
    }
}

#[async_trait]
pub trait ChannelAdapter: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Bind the transport to `account`.
    async fn link(&self, _account: &str) -> Result<()> {
        Ok(())
    }

    /// Confirm the linked account can send and receive.
    async fn verify(&self) -> Result<()> {
        Ok(())
    }

    /// Next inbound message. `None` once the transport is closed.
    async fn recv(&self) -> Option<InboundMessage>;

    async fn send(&self, message: OutboundMessage) -> Result<()>;
}

pub mod state {
    /// Not yet bound to an account.
    #[derive(Debug)]
    pub struct Unlinked;

    /// Bound but unconfirmed.
    #[derive(Debug)]
    pub struct Linked {
        pub(super) account: String,
    }

    /// Ready for traffic.
    #[derive(Debug)]
    pub struct Verified {
        pub(super) account: String,
    }
}

use state::{Linked, Unlinked, Verified};

/// An adapter plus its lifecycle phase.
#[derive(Debug)]
pub struct Channel<S> {
    adapter: Arc<dyn ChannelAdapter>,
    state: S,
}

impl Channel<Unlinked> {
    pub fn new(adapter: Arc<dyn ChannelAdapter>) -> Self {
        Self {
            adapter,
            state: Unlinked,
        }
    }

    pub async fn link(self, account: impl Into<String>) -> Result<Channel<Linked>> {
        let account = account.into();
        self.adapter.link(&account).await?;
        tracing::info!(channel = self.adapter.name(), %account, "channel_linked");
        Ok(Channel {
            adapter: self.adapter,
            state: Linked { account },
        })
    }
}

impl Channel<Linked> {
    pub fn account(&self) -> &str {
        &self.state.account
    }

    pub async fn verify(self) -> Result<Channel<Verified>> {
        self.adapter.verify().await?;
        tracing::info!(channel = self.adapter.name(), account = %self.state.account, "channel_verified");
        Ok(Channel {
            adapter: self.adapter,
            state: Verified {
                account: self.state.account,
            },
        })
    }
}

impl Channel<Verified> {
    pub fn account(&self) -> &str {
        &self.state.account
    }

    pub fn name(&self) -> &str {
        self.adapter.name()
    }

    pub async fn recv(&self) -> Option<InboundMessage> {
        self.adapter.recv().await
    }

    pub async fn send(&self, message: OutboundMessage) -> Result<()> {
        self.adapter.send(message).await
    }

    pub(crate) fn adapter(&self) -> Arc<dyn ChannelAdapter> {
        Arc::clone(&self.adapter)
    }
}
