//! Outbound send path.
//!
//! The outbox holds the write queue of the *current* connection. The
//! connection manager attaches a fresh queue once a handshake is written and
//! detaches it before the transport is torn down, so a handle on its way out
//! never receives another frame.
//!
//! Sends are non-blocking and best-effort. [`SendOutcome::Sent`] means the
//! message reached the local write queue, not that the peer received it.

use crate::config::OfflinePolicy;
use crate::monitoring::FRAMES_DROPPED_COUNTER;
use crate::types::OutboundMessage;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub type OutboundSender = mpsc::UnboundedSender<OutboundMessage>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<OutboundMessage>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the live connection's write queue.
    Sent,
    /// Held until the next connection (queue policy only).
    Queued,
    /// No connection and the drop policy is active.
    Dropped,
    /// A field contains a reserved character; nothing was sent.
    Rejected,
}

/// Anything outbound protocol messages can be handed to.
pub trait FrameSink {
    fn send(&self, message: OutboundMessage) -> SendOutcome;
}

#[derive(Debug, Default)]
struct OutboxInner {
    link: Option<OutboundSender>,
    pending: VecDeque<OutboundMessage>,
    dropped: u64,
}

#[derive(Debug, Clone)]
pub struct Outbox {
    inner: Arc<Mutex<OutboxInner>>,
    policy: OfflinePolicy,
}

impl Outbox {
    pub fn new(policy: OfflinePolicy) -> Self {
        Self {
            inner: Arc::new(Mutex::new(OutboxInner::default())),
            policy,
        }
    }

    /// Creates the write queue for a new connection and makes it current.
    /// Messages queued while offline are moved onto it first, in order.
    pub fn attach(&self) -> OutboundReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let flushed = inner.pending.len();
        for message in inner.pending.drain(..) {
            // rx is alive in this scope, send cannot fail
            let _ = tx.send(message);
        }
        if flushed > 0 {
            debug!("Flushed {} queued outbound frames", flushed);
        }
        inner.link = Some(tx);
        rx
    }

    /// Forgets the current write queue. Later sends follow the offline policy.
    pub fn detach(&self) {
        self.lock().link = None;
    }

    /// Takes back messages that were queued for a connection being torn
    /// down. Under the queue policy they go ahead of anything queued since,
    /// oldest first, and the capacity still applies. Otherwise they are
    /// dropped.
    pub fn reclaim(&self, messages: Vec<OutboundMessage>) {
        if messages.is_empty() {
            return;
        }

        let mut inner = self.lock();
        let count = messages.len();
        match self.policy {
            OfflinePolicy::Queue { capacity } => {
                for message in messages.into_iter().rev() {
                    inner.pending.push_front(message);
                }
                let mut evicted = 0u64;
                while inner.pending.len() > capacity {
                    inner.pending.pop_front();
                    evicted += 1;
                }
                inner.dropped += evicted;
                FRAMES_DROPPED_COUNTER.increment(evicted);
                debug!("Requeued {} outbound frames from closed connection", count);
            }
            OfflinePolicy::Drop => {
                inner.dropped += count as u64;
                FRAMES_DROPPED_COUNTER.increment(count as u64);
                warn!("Dropped {} outbound frames on teardown", count);
            }
        }
    }

    pub fn is_attached(&self) -> bool {
        self.lock()
            .link
            .as_ref()
            .is_some_and(|link| !link.is_closed())
    }

    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    fn lock(&self) -> MutexGuard<'_, OutboxInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn offline(&self, inner: &mut OutboxInner, message: OutboundMessage) -> SendOutcome {
        match self.policy {
            OfflinePolicy::Drop => {
                inner.dropped += 1;
                FRAMES_DROPPED_COUNTER.increment(1);
                warn!(
                    tag = message.tag(),
                    request_id = message.request_id(),
                    "Not connected, dropping outbound frame"
                );
                SendOutcome::Dropped
            }
            OfflinePolicy::Queue { capacity } => {
                if capacity == 0 {
                    inner.dropped += 1;
                    FRAMES_DROPPED_COUNTER.increment(1);
                    return SendOutcome::Dropped;
                }
                if inner.pending.len() >= capacity
                    && let Some(evicted) = inner.pending.pop_front()
                {
                    inner.dropped += 1;
                    FRAMES_DROPPED_COUNTER.increment(1);
                    warn!(
                        tag = evicted.tag(),
                        request_id = evicted.request_id(),
                        "Offline queue full, evicting oldest frame"
                    );
                }
                debug!(tag = message.tag(), "Not connected, queueing outbound frame");
                inner.pending.push_back(message);
                SendOutcome::Queued
            }
        }
    }
}

impl FrameSink for Outbox {
    fn send(&self, message: OutboundMessage) -> SendOutcome {
        if let Err(reason) = message.validate() {
            warn!(tag = message.tag(), %reason, "Rejecting outbound frame");
            return SendOutcome::Rejected;
        }

        let mut inner = self.lock();
        let message = match &inner.link {
            Some(link) => match link.send(message) {
                Ok(()) => return SendOutcome::Sent,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };
        // Either never attached or the connection task already went away
        inner.link = None;
        self.offline(&mut inner, message)
    }
}
