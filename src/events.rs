/// file: src/events.rs
/// description: Lifecycle notifications published by the connection manager
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Connecting { endpoint: String, attempt: u32 },
    Connected { connection_id: String },
    HandshakeSent { connection_id: String },
    Disconnected { reason: DisconnectReason },
    Reconnecting { attempt: u32, delay_ms: u64 },
    GaveUp { attempts: u32 },
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DisconnectReason {
    EndOfStream,
    Error(String),
    Shutdown,
}

impl LifecycleEvent {
    pub fn reconnecting(attempt: u32, delay: Duration) -> Self {
        LifecycleEvent::Reconnecting {
            attempt,
            delay_ms: delay.as_millis() as u64,
        }
    }
}

// Slow subscribers lag and skip events rather than stalling the connection task
const LIFECYCLE_CHANNEL_CAPACITY: usize = 256;

pub type LifecycleSender = broadcast::Sender<LifecycleEvent>;
pub type LifecycleReceiver = broadcast::Receiver<LifecycleEvent>;

pub fn create_lifecycle_channel() -> LifecycleSender {
    broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY).0
}
