#![doc = include_str!("../docs/rustdoc.md")]

/// Reconnect attempt counter and delay computation.
pub mod backoff;
/// Event channel composition root.
pub mod channel;
/// Command-line argument definitions.
pub mod cli;
/// Connection lifecycle state and counters.
pub mod client_state;
/// Pipe-delimited frame encoding and decoding.
pub mod codec;
/// Runtime configuration model.
pub mod config;
/// Transport connection and reconnect loop.
pub mod connection;
/// Error types used across the crate.
pub mod error;
/// Lifecycle notifications.
pub mod events;
/// Line framing over the byte stream.
pub mod framing;
/// Internal reactions and external callback dispatch.
pub mod handlers;
/// Metrics definitions and exporter setup.
pub mod monitoring;
/// Outbound send path and offline policy.
pub mod outbox;
/// Bearer token storage and refresh scheduling.
pub mod token;
/// Tracing/logging initialization.
pub mod tracing_setup;
/// Channel protocol data models.
pub mod types;

/// Primary crate error type.
pub use error::{ChannelError, ParseError};

pub use channel::EventChannel;
pub use config::{ChannelConfig, Endpoint, OfflinePolicy, ReconnectPolicy};
pub use outbox::SendOutcome;
