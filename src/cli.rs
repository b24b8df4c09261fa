use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "cgc-channel",
    about = "authenticated tcp event channel client with automatic reconnect",
    version
)]
pub struct Args {
    /// Channel server endpoint
    #[arg(short, long, default_value = "tcp://127.0.0.1:7000")]
    pub endpoint: String,

    /// Connect to the development endpoint instead
    #[arg(long)]
    pub dev: bool,

    /// Development channel server endpoint
    #[arg(long, default_value = "tcp://127.0.0.1:7001")]
    pub dev_endpoint: String,

    /// Bearer token used for the handshake and every outbound frame
    #[arg(short, long, env = "CGC_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// JSON token response file, re-read when the token nears expiry
    #[arg(long)]
    pub token_file: Option<PathBuf>,

    /// Token refresh check interval in seconds
    #[arg(long, default_value = "10")]
    pub refresh_interval: u64,

    /// Refresh the token when it expires within this many seconds
    #[arg(long, default_value = "300")]
    pub expiry_margin: u64,

    /// Connection timeout in seconds
    #[arg(long, default_value = "10")]
    pub connect_timeout: u64,

    /// Initial reconnection delay in milliseconds (0 reconnects immediately)
    #[arg(long, default_value = "250")]
    pub reconnect_delay_ms: u64,

    /// Upper bound for the reconnection delay in milliseconds
    #[arg(long, default_value = "30000")]
    pub max_reconnect_delay_ms: u64,

    /// Maximum number of consecutive reconnection attempts (0 for unlimited)
    #[arg(long, default_value = "0")]
    pub max_reconnects: u32,

    /// Disable random jitter on reconnection delays
    #[arg(long)]
    pub no_jitter: bool,

    /// Queue up to N outbound frames while disconnected (0 drops them)
    #[arg(long, default_value = "0")]
    pub queue_offline: usize,

    /// Send outbound frames without a trailing newline
    #[arg(long)]
    pub legacy_framing: bool,

    /// Answer every balance request with this balance
    #[arg(long)]
    pub balance: Option<f64>,

    /// Answer every withdrawal and rollback with this result text
    #[arg(long)]
    pub withdrawal_result: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long)]
    pub json_logs: bool,

    /// Enable metrics server
    #[arg(long)]
    pub metrics: bool,

    /// Metrics server port
    #[arg(long, default_value = "9090")]
    pub metrics_port: u16,
}
