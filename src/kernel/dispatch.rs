//! Message grammar, error replies, and egress forwarding.

use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelAdapter, OutboundMessage};
use crate::commbus::{BusItem, BusReceiver};
use crate::envelope::Envelope;
use crate::types::{Error, Identity, Result};

/// A parsed inbound request: `<skill> [input...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillRequest {
    pub skill: String,
    pub input: String,
}

impl SkillRequest {
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::validation("empty message"));
        }
        let (skill, input) = match text.split_once(char::is_whitespace) {
            Some((skill, rest)) => (skill, rest.trim_start()),
            None => (text, ""),
        };
        Ok(Self {
            skill: skill.to_string(),
            input: input.to_string(),
        })
    }
}

/// Outbound envelope telling `recipient` why their message was refused.
pub fn error_reply(recipient: Identity, error: &Error) -> Envelope {
    Envelope::outbound(
        recipient,
        json!({
            "error": error.code(),
            "message": error.to_string(),
        }),
    )
}

/// Forward outbound bus traffic to the channel until `stop` fires, then
/// flush whatever is already queued.
pub(crate) async fn forward_outbound(
    adapter: Arc<dyn ChannelAdapter>,
    mut outbound: BusReceiver,
    stop: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            item = outbound.recv() => item,
            _ = stop.cancelled() => break,
        };
        match item {
            Ok(item) => deliver(adapter.as_ref(), item).await,
            Err(_) => return,
        }
    }

    while let Ok(Some(item)) = outbound.try_recv() {
        deliver(adapter.as_ref(), item).await;
    }
    tracing::debug!(channel = adapter.name(), "egress_stopped");
}

async fn deliver(adapter: &dyn ChannelAdapter, item: BusItem) {
    match item {
        BusItem::Envelope(envelope) => {
            let sequence = envelope.sequence();
            if let Err(e) = adapter.send(OutboundMessage::from(&envelope)).await {
                tracing::warn!(sequence, error = %e, "egress_send_failed");
            }
        }
        BusItem::Lagged(missed) => {
            tracing::warn!(missed, channel = adapter.name(), "egress_lagged");
        }
    }
}
