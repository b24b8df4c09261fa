//! The event channel: registration, outbound operations and token updates
//! around one [`ConnectionManager`].
//!
//! ```ignore
//! let channel = EventChannel::new(ChannelConfig::new(endpoint), token);
//! channel.on(|request: &BalanceRequested| {
//!     // look the balance up, then answer
//!     Ok(())
//! });
//! let task = channel.start()?;
//! ```

use crate::client_state::{ChannelState, ChannelStatus, SharedChannelState};
use crate::config::ChannelConfig;
use crate::connection::ConnectionManager;
use crate::error::ChannelError;
use crate::events::{LifecycleReceiver, LifecycleSender, create_lifecycle_channel};
use crate::handlers::{ExternalEvent, HandlerRegistry};
use crate::monitoring::TOKEN_UPDATE_COUNTER;
use crate::outbox::{FrameSink, Outbox, SendOutcome};
use crate::token::{TokenCell, TokenSink};
use crate::types::OutboundMessage;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::info;

struct ChannelInner {
    config: Arc<ChannelConfig>,
    token: TokenCell,
    registry: Arc<HandlerRegistry>,
    outbox: Outbox,
    state: SharedChannelState,
    lifecycle: LifecycleSender,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
}

/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<ChannelInner>,
}

impl EventChannel {
    pub fn new(config: ChannelConfig, token: impl Into<String>) -> Self {
        Self::with_registry(config, token, Arc::new(HandlerRegistry::new()))
    }

    /// Uses a registry built (and possibly pre-populated) by the caller.
    pub fn with_registry(
        config: ChannelConfig,
        token: impl Into<String>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        let outbox = Outbox::new(config.offline);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ChannelInner {
                config: Arc::new(config),
                token: TokenCell::new(token),
                registry,
                outbox,
                state: Arc::new(Mutex::new(ChannelState::new())),
                lifecycle: create_lifecycle_channel(),
                shutdown,
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Spawns the connection task. Must be called from within a tokio
    /// runtime, and only once per channel.
    pub fn start(&self) -> Result<JoinHandle<Result<(), ChannelError>>, ChannelError> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(ChannelError::AlreadyStarted);
        }

        let manager = ConnectionManager::new(
            self.inner.config.clone(),
            self.inner.token.clone(),
            self.inner.registry.clone(),
            self.inner.outbox.clone(),
            self.inner.state.clone(),
            self.inner.lifecycle.clone(),
            self.inner.shutdown.subscribe(),
        );
        Ok(tokio::spawn(manager.run()))
    }

    /// Asks the connection task to close the transport and stop.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.inner.registry
    }

    /// Registers the external callback for `E`; see [`HandlerRegistry::register`].
    pub fn on<E, F>(&self, callback: F)
    where
        E: ExternalEvent,
        F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.registry.register(callback);
    }

    /// Replaces the bearer token for every later frame, including the next
    /// reconnect handshake. No handshake is resent.
    pub fn set_token(&self, token: impl Into<String>) {
        self.inner.token.set(token);
        TOKEN_UPDATE_COUNTER.increment(1);
        info!("Channel token updated");
    }

    pub fn token(&self) -> String {
        self.inner.token.get()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.outbox.is_attached()
    }

    pub fn subscribe(&self) -> LifecycleReceiver {
        self.inner.lifecycle.subscribe()
    }

    pub async fn status(&self) -> ChannelStatus {
        let state = self.inner.state.lock().await;
        state.snapshot(self.inner.outbox.dropped())
    }

    /// `accepted|<token>|<requestId>`
    pub fn acknowledge_deposit(&self, request_id: impl Into<String>) -> SendOutcome {
        self.send(OutboundMessage::Accepted {
            request_id: request_id.into(),
        })
    }

    /// `balance|<token>|<requestId>|<email>|<balance>`, the answer to a
    /// balance request.
    pub fn push_balance(
        &self,
        request_id: impl Into<String>,
        email: impl Into<String>,
        balance: f64,
    ) -> SendOutcome {
        self.send(OutboundMessage::Balance {
            request_id: request_id.into(),
            email: email.into(),
            balance,
        })
    }

    /// `withdrawal|<token>|<requestId>|<result>`, the outcome of a
    /// withdrawal or a rollback.
    pub fn push_result(
        &self,
        request_id: impl Into<String>,
        result: impl Into<String>,
    ) -> SendOutcome {
        self.send(OutboundMessage::WithdrawalResult {
            request_id: request_id.into(),
            result: result.into(),
        })
    }

    /// `pong|<token>|<requestId>`
    pub fn push_pong(&self, request_id: impl Into<String>) -> SendOutcome {
        self.send(OutboundMessage::Pong {
            request_id: request_id.into(),
        })
    }

    /// Best effort. Without a live connection the configured offline policy
    /// applies; this includes calls made before the first connection.
    pub fn send(&self, message: OutboundMessage) -> SendOutcome {
        self.inner.outbox.send(message)
    }
}

impl TokenSink for EventChannel {
    fn update_token(&self, token: String) {
        self.set_token(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Endpoint, OfflinePolicy};
    use crate::types::BalanceRequested;

    fn config() -> ChannelConfig {
        ChannelConfig::new(Endpoint::new("127.0.0.1", 1))
    }

    #[test]
    fn test_outbound_before_connect_is_dropped() {
        let channel = EventChannel::new(config(), "T1");
        assert!(!channel.is_connected());
        assert_eq!(channel.push_pong("p1"), SendOutcome::Dropped);
        assert_eq!(channel.acknowledge_deposit("r1"), SendOutcome::Dropped);
        assert_eq!(
            channel.push_balance("r2", "a@b.io", 3.0),
            SendOutcome::Dropped
        );
        assert_eq!(channel.push_result("r3", "ok"), SendOutcome::Dropped);
    }

    #[test]
    fn test_outbound_before_connect_is_queued_under_queue_policy() {
        let mut config = config();
        config.offline = OfflinePolicy::Queue { capacity: 4 };
        let channel = EventChannel::new(config, "T1");
        assert_eq!(channel.push_result("r1", "ok"), SendOutcome::Queued);
    }

    #[test]
    fn test_set_token_visible_to_clones() {
        let channel = EventChannel::new(config(), "T1");
        let clone = channel.clone();
        channel.set_token("T2");
        assert_eq!(clone.token(), "T2");
        clone.update_token("T3".to_string());
        assert_eq!(channel.token(), "T3");
    }

    #[test]
    fn test_injected_registry_is_shared() {
        let registry = Arc::new(HandlerRegistry::new());
        let channel = EventChannel::with_registry(config(), "T1", registry.clone());
        channel.on(|_: &BalanceRequested| Ok(()));
        assert!(registry.is_registered(crate::types::EventKind::BalanceRequested));

        let other = EventChannel::new(config(), "T1");
        assert!(
            !other
                .registry()
                .is_registered(crate::types::EventKind::BalanceRequested)
        );
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let channel = EventChannel::new(config(), "T1");
        let handle = channel.start().unwrap();
        assert!(matches!(channel.start(), Err(ChannelError::AlreadyStarted)));
        channel.shutdown();
        let _ = handle.await;
    }
}
