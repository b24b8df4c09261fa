// file: src/tracing_setup.rs
// description: structured logging to stderr; stdout is reserved for event output
// reference: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/

use crate::config::LoggingConfig;
use anyhow::Result;
use std::io::IsTerminal;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// `RUST_LOG` wins over the configured level when it is set and valid.
pub fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("cgc_channel={level},warn")))
        .unwrap_or_else(|_| EnvFilter::new("cgc_channel=info,warn"))
}

pub fn setup_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(&config.level);

    let fmt_layer = if config.json {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_thread_ids(true)
            .with_ansi(std::io::stderr().is_terminal())
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_scopes_level_to_crate() {
        // Only meaningful when RUST_LOG does not override the level
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let filter = build_filter("debug").to_string();
        assert!(filter.contains("cgc_channel=debug"));
        assert!(filter.contains("warn"));
    }

    #[test]
    fn test_invalid_level_falls_back_to_info() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let filter = build_filter("not a level!").to_string();
        assert!(filter.contains("cgc_channel=info"));
    }
}
