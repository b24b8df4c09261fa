use crate::error::ChannelError;
use metrics::{Counter, Gauge, counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{net::SocketAddr, sync::LazyLock};
use tracing::{error, info};

// Global metrics
pub static FRAMES_RECEIVED_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("cgc_channel_frames_received_total"));
pub static FRAMES_SENT_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("cgc_channel_frames_sent_total"));
pub static FRAMES_DROPPED_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("cgc_channel_frames_dropped_total"));
pub static DECODE_ERROR_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("cgc_channel_decode_errors_total"));
pub static DISPATCH_ERROR_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("cgc_channel_dispatch_errors_total"));
pub static RECONNECT_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("cgc_channel_reconnects_total"));
pub static TOKEN_UPDATE_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("cgc_channel_token_updates_total"));
pub static CONNECTED_GAUGE: LazyLock<Gauge> = LazyLock::new(|| gauge!("cgc_channel_connected"));

pub async fn setup_metrics(port: u16) -> Result<(), ChannelError> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    let builder = PrometheusBuilder::new()
        .with_http_listener(addr)
        .add_global_label("service", "cgc-channel")
        .add_global_label("version", env!("CARGO_PKG_VERSION"));

    match builder.install() {
        Ok(()) => {
            info!(
                "Prometheus metrics server started on http://{}/metrics",
                addr
            );

            // Initialize metrics with default values
            FRAMES_RECEIVED_COUNTER.absolute(0);
            FRAMES_SENT_COUNTER.absolute(0);
            FRAMES_DROPPED_COUNTER.absolute(0);
            DECODE_ERROR_COUNTER.absolute(0);
            DISPATCH_ERROR_COUNTER.absolute(0);
            RECONNECT_COUNTER.absolute(0);
            TOKEN_UPDATE_COUNTER.absolute(0);
            CONNECTED_GAUGE.set(0.0);

            Ok(())
        }
        Err(e) => {
            error!("Failed to start metrics server: {}", e);
            Err(ChannelError::Metrics(e.to_string()))
        }
    }
}
