/// file: src/config.rs
/// description: Configuration model for the event channel, token refresh and observability
use crate::cli::Args;
use crate::error::ChannelError;
use crate::framing::DEFAULT_MAX_FRAME_LEN;
use anyhow::{Result, bail};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct Config {
    pub channel: ChannelConfig,
    pub token: TokenConfig,
    pub responder: ResponderConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

/// Host and port of the channel server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses a `tcp://host:port` URL.
    pub fn parse(raw: &str) -> Result<Self, ChannelError> {
        let url = Url::parse(raw)?;
        if url.scheme() != "tcp" {
            return Err(ChannelError::InvalidEndpoint(format!(
                "{raw}: expected tcp:// scheme"
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| ChannelError::InvalidEndpoint(format!("{raw}: missing host")))?;
        let port = url
            .port()
            .ok_or_else(|| ChannelError::InvalidEndpoint(format!("{raw}: missing port")))?;
        Ok(Self::new(host.trim_start_matches('[').trim_end_matches(']'), port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub endpoint: Endpoint,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub offline: OfflinePolicy,
    pub max_frame_len: usize,
    /// Append `\n` to outbound frames. Off for peers that expect one
    /// message per write with no terminator.
    pub terminate_outbound: bool,
}

impl ChannelConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            offline: OfflinePolicy::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            terminate_outbound: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Reconnect right away, forever. Can hot-loop against a host that
    /// refuses connections.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
            max_attempts: None,
        }
    }
}

/// What happens to an outbound message sent while no connection is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OfflinePolicy {
    /// Fire and forget: the message is logged and lost.
    #[default]
    Drop,
    /// Hold up to `capacity` messages (oldest evicted first) and flush them
    /// right after the next handshake.
    Queue { capacity: usize },
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub initial: Option<String>,
    pub file: Option<PathBuf>,
    pub refresh_interval: Duration,
    pub expiry_margin: Duration,
}

/// Canned answers the binary sends back for requests that need one.
#[derive(Debug, Clone, Default)]
pub struct ResponderConfig {
    pub balance: Option<f64>,
    pub withdrawal_result: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Config {
    pub fn from_args(args: &Args) -> Result<Self> {
        let raw_endpoint = if args.dev {
            &args.dev_endpoint
        } else {
            &args.endpoint
        };
        let endpoint = Endpoint::parse(raw_endpoint)?;

        if args.token.is_none() && args.token_file.is_none() {
            bail!("a token is required: pass --token (or CGC_TOKEN) or --token-file");
        }

        Ok(Config {
            channel: ChannelConfig {
                endpoint,
                connect_timeout: Duration::from_secs(args.connect_timeout),
                reconnect: ReconnectPolicy {
                    initial_delay: Duration::from_millis(args.reconnect_delay_ms),
                    max_delay: Duration::from_millis(
                        args.max_reconnect_delay_ms.max(args.reconnect_delay_ms),
                    ),
                    multiplier: 2.0,
                    jitter: !args.no_jitter,
                    max_attempts: (args.max_reconnects > 0).then_some(args.max_reconnects),
                },
                offline: match args.queue_offline {
                    0 => OfflinePolicy::Drop,
                    capacity => OfflinePolicy::Queue { capacity },
                },
                max_frame_len: DEFAULT_MAX_FRAME_LEN,
                terminate_outbound: !args.legacy_framing,
            },
            token: TokenConfig {
                initial: args.token.clone(),
                file: args.token_file.clone(),
                refresh_interval: Duration::from_secs(args.refresh_interval),
                expiry_margin: Duration::from_secs(args.expiry_margin),
            },
            responder: ResponderConfig {
                balance: args.balance,
                withdrawal_result: args.withdrawal_result.clone(),
            },
            metrics: MetricsConfig {
                enabled: args.metrics,
                port: args.metrics_port,
            },
            logging: LoggingConfig {
                level: args.log_level.clone(),
                json: args.json_logs,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(
            Endpoint::parse("tcp://127.0.0.1:7000").unwrap(),
            Endpoint::new("127.0.0.1", 7000)
        );
        assert_eq!(
            Endpoint::parse("tcp://channel.example.com:9443").unwrap(),
            Endpoint::new("channel.example.com", 9443)
        );
        assert!(Endpoint::parse("http://127.0.0.1:7000").is_err());
        assert!(Endpoint::parse("tcp://127.0.0.1").is_err());
        assert!(Endpoint::parse("not a url").is_err());
    }

    #[test]
    fn test_from_args_maps_flags() {
        let args = Args::parse_from([
            "cgc-channel",
            "--token",
            "T1",
            "--max-reconnects",
            "5",
            "--queue-offline",
            "16",
            "--legacy-framing",
        ]);
        let config = Config::from_args(&args).unwrap();
        assert_eq!(config.channel.reconnect.max_attempts, Some(5));
        assert_eq!(
            config.channel.offline,
            OfflinePolicy::Queue { capacity: 16 }
        );
        assert!(!config.channel.terminate_outbound);
        assert_eq!(config.token.initial.as_deref(), Some("T1"));
    }

    #[test]
    fn test_dev_flag_selects_dev_endpoint() {
        let args = Args::parse_from([
            "cgc-channel",
            "--token",
            "T1",
            "--dev",
            "--dev-endpoint",
            "tcp://10.0.0.5:7100",
        ]);
        let config = Config::from_args(&args).unwrap();
        assert_eq!(config.channel.endpoint, Endpoint::new("10.0.0.5", 7100));
        assert_eq!(config.channel.reconnect.max_attempts, None);
    }

    #[test]
    fn test_token_is_required() {
        let args = Args::parse_from(["cgc-channel", "--token-file", "/nonexistent"]);
        assert!(Config::from_args(&args).is_ok());

        // Cleared by hand so a CGC_TOKEN in the environment cannot mask the check
        let mut args = Args::parse_from(["cgc-channel"]);
        args.token = None;
        args.token_file = None;
        let err = Config::from_args(&args).unwrap_err();
        assert!(err.to_string().contains("a token is required"));
    }
}
