// file: src/connection.rs
// description: TCP connection lifecycle, reconnect loop and inbound/outbound frame pump

use crate::{
    backoff::Backoff,
    client_state::SharedChannelState,
    codec,
    config::ChannelConfig,
    error::{ChannelError, ParseError},
    events::{DisconnectReason, LifecycleEvent, LifecycleSender},
    framing::LineDecoder,
    handlers::HandlerRegistry,
    monitoring::{
        CONNECTED_GAUGE, DECODE_ERROR_COUNTER, DISPATCH_ERROR_COUNTER, FRAMES_RECEIVED_COUNTER,
        FRAMES_SENT_COUNTER, RECONNECT_COUNTER,
    },
    outbox::{OutboundReceiver, Outbox},
    token::TokenCell,
    types::OutboundMessage,
};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{
    TcpStream,
    tcp::{OwnedReadHalf, OwnedWriteHalf},
};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace, warn};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// How a connected session ended without a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    EndOfStream,
    Shutdown,
}

/// Owns the transport and runs `Disconnected -> Connecting -> Connected`,
/// falling back to `Connecting` whenever the connection errors or the peer
/// closes it.
pub struct ConnectionManager {
    config: Arc<ChannelConfig>,
    token: TokenCell,
    registry: Arc<HandlerRegistry>,
    outbox: Outbox,
    state: SharedChannelState,
    lifecycle: LifecycleSender,
    shutdown: watch::Receiver<bool>,
    backoff: Backoff,
}

impl ConnectionManager {
    pub fn new(
        config: Arc<ChannelConfig>,
        token: TokenCell,
        registry: Arc<HandlerRegistry>,
        outbox: Outbox,
        state: SharedChannelState,
        lifecycle: LifecycleSender,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let backoff = Backoff::new(config.reconnect.clone());
        Self {
            config,
            token,
            registry,
            outbox,
            state,
            lifecycle,
            shutdown,
            backoff,
        }
    }

    /// Runs until shutdown is requested. Only returns an error when a
    /// reconnect ceiling is configured and has been exhausted.
    pub async fn run(mut self) -> Result<(), ChannelError> {
        info!(endpoint = %self.config.endpoint, "Starting event channel");

        let result = self.reconnect_loop().await;

        self.outbox.detach();
        {
            let mut state = self.state.lock().await;
            match result {
                Ok(()) => state.mark_disconnected(),
                Err(_) => state.mark_failed(),
            }
        }
        CONNECTED_GAUGE.set(0.0);
        self.publish(LifecycleEvent::Stopped);
        info!("Event channel stopped");

        result
    }

    async fn reconnect_loop(&mut self) -> Result<(), ChannelError> {
        loop {
            let reason = match self.connect_and_run().await {
                Ok(SessionEnd::Shutdown) => {
                    self.publish(LifecycleEvent::Disconnected {
                        reason: DisconnectReason::Shutdown,
                    });
                    return Ok(());
                }
                Ok(SessionEnd::EndOfStream) => {
                    info!("Disconnected from server, trying to reconnect");
                    DisconnectReason::EndOfStream
                }
                Err(e) => {
                    warn!("Channel error: {}", e);
                    DisconnectReason::Error(e.to_string())
                }
            };

            {
                let mut state = self.state.lock().await;
                state.mark_disconnected();
            }
            CONNECTED_GAUGE.set(0.0);
            self.publish(LifecycleEvent::Disconnected { reason });

            if !self.handle_connection_error().await? {
                return Ok(());
            }
        }
    }

    async fn connect_and_run(&mut self) -> Result<SessionEnd, ChannelError> {
        if *self.shutdown.borrow() {
            return Ok(SessionEnd::Shutdown);
        }

        {
            let mut state = self.state.lock().await;
            state.begin_connecting();
        }
        self.publish(LifecycleEvent::Connecting {
            endpoint: self.config.endpoint.to_string(),
            attempt: self.backoff.attempt(),
        });
        debug!("Connecting to server: {}", self.config.endpoint);

        let connect_timeout = self.config.connect_timeout;
        let connect = TcpStream::connect((
            self.config.endpoint.host.as_str(),
            self.config.endpoint.port,
        ));
        let stream = tokio::select! {
            result = timeout(connect_timeout, connect) => {
                result.map_err(|_| ChannelError::ConnectTimeout(connect_timeout))??
            }
            _ = shutdown_requested(&mut self.shutdown) => return Ok(SessionEnd::Shutdown),
        };
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        // Nothing may reach the socket before the handshake
        self.write_frame(&mut writer, &OutboundMessage::Connect)
            .await?;

        // Sendable before anyone hears about the connection
        let mut outbound = self.outbox.attach();

        let connection_id = {
            let mut state = self.state.lock().await;
            state.mark_connected()
        };
        self.backoff.reset();
        CONNECTED_GAUGE.set(1.0);
        info!(
            %connection_id,
            "Connected to server {}, handshake sent", self.config.endpoint
        );
        self.publish(LifecycleEvent::HandshakeSent {
            connection_id: connection_id.clone(),
        });
        self.publish(LifecycleEvent::Connected { connection_id });

        let end = self
            .pump(&mut reader, &mut writer, &mut outbound)
            .await;

        self.teardown(writer, outbound).await;
        end
    }

    /// Moves frames both ways until the stream ends, errors or shutdown is
    /// requested.
    async fn pump(
        &mut self,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
        outbound: &mut OutboundReceiver,
    ) -> Result<SessionEnd, ChannelError> {
        let mut decoder = LineDecoder::new(self.config.max_frame_len);
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];

        loop {
            tokio::select! {
                read = reader.read(&mut chunk) => {
                    let n = read?;
                    if n == 0 {
                        if let Some(frame) = decoder.finish() {
                            self.handle_frame(frame).await;
                        }
                        return Ok(SessionEnd::EndOfStream);
                    }
                    decoder.extend(&chunk[..n]);
                    while let Some(frame) = decoder.next_frame() {
                        self.handle_frame(frame).await;
                    }
                }
                Some(message) = outbound.recv() => {
                    self.write_frame(writer, &message).await?;
                }
                _ = shutdown_requested(&mut self.shutdown) => {
                    return Ok(SessionEnd::Shutdown);
                }
            }
        }
    }

    /// Detaches the outbox so no new frame can target this handle, hands
    /// what was still queued for it back to the outbox, then closes it.
    async fn teardown(&self, mut writer: OwnedWriteHalf, mut outbound: OutboundReceiver) {
        self.outbox.detach();
        outbound.close();

        let mut leftover = Vec::new();
        while let Ok(message) = outbound.try_recv() {
            leftover.push(message);
        }
        self.outbox.reclaim(leftover);

        if let Err(e) = writer.shutdown().await {
            trace!("Error while closing connection: {}", e);
        }
    }

    async fn handle_frame(&self, frame: Result<String, ParseError>) {
        FRAMES_RECEIVED_COUNTER.increment(1);
        {
            let mut state = self.state.lock().await;
            state.record_frame();
        }

        let line = match frame {
            Ok(line) => line,
            Err(e) => {
                self.record_decode_error(&e, None).await;
                return;
            }
        };
        trace!("Event received: {}", line);

        let event = match codec::decode(&line) {
            Ok(event) => event,
            Err(e) => {
                self.record_decode_error(&e, Some(&line)).await;
                return;
            }
        };

        debug!(
            event = ?event.kind(),
            request_id = event.request_id(),
            "Dispatching event"
        );

        if let Err(e) = self.registry.dispatch(&event, &self.outbox) {
            error!("Failed to handle incoming event: {}", e);
            DISPATCH_ERROR_COUNTER.increment(1);
            let state = self.state.lock().await;
            state.record_dispatch_error();
        }
    }

    async fn record_decode_error(&self, error: &ParseError, line: Option<&str>) {
        match line {
            Some(line) => warn!(
                "Dropping malformed frame: {}. Frame: {}",
                error,
                line.chars().take(100).collect::<String>()
            ),
            None => warn!("Dropping malformed frame: {}", error),
        }
        DECODE_ERROR_COUNTER.increment(1);
        let state = self.state.lock().await;
        state.record_decode_error();
    }

    /// Encodes with the token current at write time.
    async fn write_frame(
        &self,
        writer: &mut OwnedWriteHalf,
        message: &OutboundMessage,
    ) -> Result<(), ChannelError> {
        let mut frame = codec::encode(message, &self.token.get());
        if self.config.terminate_outbound {
            frame.push('\n');
        }

        writer.write_all(frame.as_bytes()).await?;

        FRAMES_SENT_COUNTER.increment(1);
        {
            let state = self.state.lock().await;
            state.record_sent();
        }
        trace!(
            tag = message.tag(),
            request_id = message.request_id(),
            "Sent frame"
        );
        Ok(())
    }

    /// Waits out the backoff delay. `Ok(false)` means shutdown was requested
    /// while waiting.
    async fn handle_connection_error(&mut self) -> Result<bool, ChannelError> {
        {
            let mut state = self.state.lock().await;
            state.increment_reconnect();
        }
        RECONNECT_COUNTER.increment(1);

        let Some(delay) = self.backoff.next_delay() else {
            let attempts = self.backoff.attempt().saturating_sub(1);
            error!("Maximum reconnection attempts ({}) reached", attempts);
            self.publish(LifecycleEvent::GaveUp { attempts });
            return Err(ChannelError::ReconnectAttemptsExhausted { attempts });
        };

        let attempt = self.backoff.attempt();
        if delay.is_zero() {
            debug!("Reconnecting immediately (attempt {})", attempt);
        } else {
            warn!("Reconnecting in {:?} (attempt {})", delay, attempt);
        }
        self.publish(LifecycleEvent::reconnecting(attempt, delay));

        if delay.is_zero() {
            // Still give other tasks a turn against a host that refuses instantly
            tokio::task::yield_now().await;
            return Ok(!*self.shutdown.borrow());
        }

        tokio::select! {
            _ = sleep(delay) => Ok(true),
            _ = shutdown_requested(&mut self.shutdown) => Ok(false),
        }
    }

    fn publish(&self, event: LifecycleEvent) {
        // No subscribers is fine
        let _ = self.lifecycle.send(event);
    }
}

/// Resolves once shutdown is requested or the channel handle is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
