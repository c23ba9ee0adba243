//! Event bus for multicast fan-out of envelopes.
//!
//! Every envelope the daemon handles flows through here, inbound and
//! outbound, so observers see the same traffic the kernel does:
//!   - Publishing never blocks and never fails because of a slow reader
//!   - Each subscriber has its own cursor into a fixed-size ring
//!   - A reader that falls more than `capacity` behind is told how many
//!     envelopes it missed, then resumes from the oldest retained one
//!
//! Receivers are read-only: there is no way to publish through one.

use crate::envelope::{Direction, Envelope};
use crate::types::{Error, Result, DEFAULT_BUS_CAPACITY};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

// =============================================================================
// Read Items
// =============================================================================

/// What a subscriber gets from a read.
#[derive(Debug, Clone)]
pub enum BusItem {
    /// The next envelope in publication order.
    Envelope(Envelope),
    /// The subscriber fell behind and this many envelopes were overwritten.
    Lagged(u64),
}

impl BusItem {
    pub fn into_envelope(self) -> Option<Envelope> {
        match self {
            BusItem::Envelope(e) => Some(e),
            BusItem::Lagged(_) => None,
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct Counters {
    next_sequence: AtomicU64,
    published: AtomicU64,
    lag_events: AtomicU64,
    missed: AtomicU64,
}

/// Statistics about bus usage.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub events_published: u64,
    /// Number of `Lagged` indications handed to readers.
    pub lag_events: u64,
    /// Total envelopes readers missed across all lag indications.
    pub envelopes_missed: u64,
    pub active_subscribers: usize,
}

// =============================================================================
// EventBus
// =============================================================================

/// Lossy multicast bus over a tokio broadcast ring.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Envelope>,
    counters: Arc<Counters>,
    capacity: usize,
}

impl EventBus {
    /// Build a bus holding at most `capacity` unread envelopes per reader.
    ///
    /// A zero capacity cannot be constructed and is reported as a
    /// configuration error.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::config_invalid("event bus capacity must be at least 1"));
        }
        if capacity > usize::MAX / 2 {
            return Err(Error::config_invalid(format!(
                "event bus capacity {capacity} is too large"
            )));
        }
        let (sender, _) = broadcast::channel(capacity);
        Ok(Self {
            sender,
            counters: Arc::new(Counters::default()),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish an envelope to every current subscriber.
    ///
    /// Stamps the bus sequence number and returns how many subscribers will
    /// observe it. With no subscribers the envelope is dropped and 0 is
    /// returned.
    pub fn publish(&self, envelope: Envelope) -> usize {
        let sequence = self.counters.next_sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let envelope = envelope.with_sequence(sequence);
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        match self.sender.send(envelope) {
            Ok(n) => {
                tracing::trace!(sequence, subscribers = n, "bus_published");
                n
            }
            Err(_) => {
                tracing::trace!(sequence, "bus_published_no_subscribers");
                0
            }
        }
    }

    /// Subscribe to every envelope published from now on.
    pub fn subscribe(&self) -> BusReceiver {
        BusReceiver {
            receiver: self.sender.subscribe(),
            counters: Arc::clone(&self.counters),
            filter: None,
        }
    }

    /// Subscribe to envelopes travelling in one direction only.
    ///
    /// Lag is still reported even when the missed envelopes were all of
    /// the other direction.
    pub fn subscribe_direction(&self, direction: Direction) -> BusReceiver {
        BusReceiver {
            receiver: self.sender.subscribe(),
            counters: Arc::clone(&self.counters),
            filter: Some(direction),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Get bus statistics.
    pub fn get_stats(&self) -> BusStats {
        BusStats {
            events_published: self.counters.published.load(Ordering::Relaxed),
            lag_events: self.counters.lag_events.load(Ordering::Relaxed),
            envelopes_missed: self.counters.missed.load(Ordering::Relaxed),
            active_subscribers: self.sender.receiver_count(),
        }
    }

    /// Reset counters. Sequence numbering is not reset.
    pub fn reset_stats(&self) {
        self.counters.published.store(0, Ordering::Relaxed);
        self.counters.lag_events.store(0, Ordering::Relaxed);
        self.counters.missed.store(0, Ordering::Relaxed);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_BUS_CAPACITY);
        Self {
            sender,
            counters: Arc::new(Counters::default()),
            capacity: DEFAULT_BUS_CAPACITY,
        }
    }
}

// =============================================================================
// Receiver
// =============================================================================

/// Read-only subscriber handle with its own cursor.
#[derive(Debug)]
pub struct BusReceiver {
    receiver: broadcast::Receiver<Envelope>,
    counters: Arc<Counters>,
    filter: Option<Direction>,
}

impl BusReceiver {
    fn record_lag(&self, missed: u64) {
        self.counters.lag_events.fetch_add(1, Ordering::Relaxed);
        self.counters.missed.fetch_add(missed, Ordering::Relaxed);
        tracing::warn!(missed, "bus_receiver_lagged");
    }

    fn accepts(&self, envelope: &Envelope) -> bool {
        self.filter.map_or(true, |d| envelope.direction() == d)
    }

    /// Wait for the next item.
    ///
    /// Returns `Error::Cancelled` once every sender is gone.
    pub async fn recv(&mut self) -> Result<BusItem> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) if self.accepts(&envelope) => {
                    return Ok(BusItem::Envelope(envelope));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.record_lag(n);
                    return Ok(BusItem::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::cancelled("event bus closed"));
                }
            }
        }
    }

    /// Non-blocking read. `Ok(None)` means nothing is pending.
    pub fn try_recv(&mut self) -> Result<Option<BusItem>> {
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) if self.accepts(&envelope) => {
                    return Ok(Some(BusItem::Envelope(envelope)));
                }
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.record_lag(n);
                    return Ok(Some(BusItem::Lagged(n)));
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Err(Error::cancelled("event bus closed"));
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
