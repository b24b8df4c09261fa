/// file: src/client_state.rs
/// description: Connection lifecycle state and frame counters, kept apart from the connection logic
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{
    Arc,
    atomic::{AtomicU32, AtomicU64, Ordering},
};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect ceiling exhausted; only reachable when one is configured.
    Failed,
}

#[derive(Debug)]
pub struct ChannelState {
    pub status: LinkStatus,
    pub connection_id: Option<String>,
    pub reconnect_count: AtomicU32,
    pub connected_since: Option<DateTime<Utc>>,
    pub last_frame_time: Option<DateTime<Utc>>,
    pub last_disconnection_time: Option<DateTime<Utc>>,

    pub frames_received: AtomicU64,
    pub frames_sent: AtomicU64,
    pub decode_errors: AtomicU64,
    pub dispatch_errors: AtomicU64,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            status: LinkStatus::Disconnected,
            connection_id: None,
            reconnect_count: AtomicU32::new(0),
            connected_since: None,
            last_frame_time: None,
            last_disconnection_time: None,
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            dispatch_errors: AtomicU64::new(0),
        }
    }
}

impl ChannelState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_connecting(&mut self) {
        self.status = LinkStatus::Connecting;
        self.connection_id = None;
    }

    /// Marks a fresh connection as established and returns its id.
    pub fn mark_connected(&mut self) -> String {
        let connection_id = uuid::Uuid::new_v4().to_string();
        self.connection_id = Some(connection_id.clone());
        self.status = LinkStatus::Connected;
        self.connected_since = Some(Utc::now());
        connection_id
    }

    pub fn mark_disconnected(&mut self) {
        if self.status == LinkStatus::Connected {
            self.last_disconnection_time = Some(Utc::now());
        }
        self.status = LinkStatus::Disconnected;
        self.connection_id = None;
        self.connected_since = None;
    }

    pub fn increment_reconnect(&mut self) {
        self.reconnect_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn mark_failed(&mut self) {
        self.mark_disconnected();
        self.status = LinkStatus::Failed;
    }

    pub fn record_frame(&mut self) {
        self.last_frame_time = Some(Utc::now());
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch_error(&self) {
        self.dispatch_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, frames_dropped: u64) -> ChannelStatus {
        ChannelStatus {
            status: self.status,
            connection_id: self.connection_id.clone(),
            connected_since: self.connected_since,
            last_frame_time: self.last_frame_time,
            reconnect_count: self.reconnect_count.load(Ordering::Acquire),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped,
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            dispatch_errors: self.dispatch_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ChannelState`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStatus {
    pub status: LinkStatus,
    pub connection_id: Option<String>,
    pub connected_since: Option<DateTime<Utc>>,
    pub last_frame_time: Option<DateTime<Utc>>,
    pub reconnect_count: u32,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub decode_errors: u64,
    pub dispatch_errors: u64,
}

pub type SharedChannelState = Arc<Mutex<ChannelState>>;
