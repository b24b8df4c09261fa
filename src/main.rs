use anyhow::{Result, anyhow, bail};
use cgc_channel::{
    EventChannel,
    cli::Args,
    config::{Config, ResponderConfig},
    handlers::ExternalEvent,
    monitoring::setup_metrics,
    token::{FileTokenProvider, IssuedToken, TokenProvider, TokenRefresher},
    tracing_setup::setup_tracing,
    types::{
        BalanceRequested, EventKind, InGameCurrencyDeposit, InGameCurrencyWithdrawal,
        NftLinkStatus, RollbackWithdrawal,
    },
};
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// An event handed from a callback to the responder loop.
#[derive(Debug)]
struct Inbound {
    kind: EventKind,
    payload: serde_json::Value,
    reply: Option<Reply>,
}

#[derive(Debug)]
enum Reply {
    Balance { request_id: String, email: String },
    Result { request_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_args(&args)?;

    setup_tracing(&config.logging)?;
    info!("Starting cgc-channel v{}", env!("CARGO_PKG_VERSION"));
    info!(endpoint = %config.channel.endpoint, "Configuration loaded");

    if config.metrics.enabled {
        setup_metrics(config.metrics.port).await?;
        info!("Metrics server started on port {}", config.metrics.port);
    }

    let provider = config.token.file.clone().map(FileTokenProvider::new);
    let (token, issued) = initial_token(provider.as_ref(), config.token.initial.as_deref()).await?;

    let channel = EventChannel::new(config.channel.clone(), token);

    let (tx, rx) = mpsc::unbounded_channel();
    forward::<BalanceRequested, _>(&channel, &tx, |e| {
        Some(Reply::Balance {
            request_id: e.request_id.clone(),
            email: e.email.clone(),
        })
    });
    forward::<InGameCurrencyDeposit, _>(&channel, &tx, |_| None);
    forward::<NftLinkStatus, _>(&channel, &tx, |_| None);
    forward::<InGameCurrencyWithdrawal, _>(&channel, &tx, |e| {
        Some(Reply::Result {
            request_id: e.request_id.clone(),
        })
    });
    forward::<RollbackWithdrawal, _>(&channel, &tx, |e| {
        Some(Reply::Result {
            request_id: e.request_id.clone(),
        })
    });
    drop(tx);

    let responder = tokio::spawn(respond(channel.clone(), rx, config.responder.clone()));
    let lifecycle = tokio::spawn(print_lifecycle(channel.subscribe()));

    let refresher = provider.map(|provider| {
        info!(
            "Refreshing token from file every {:?}",
            config.token.refresh_interval
        );
        TokenRefresher::new(
            provider,
            channel.clone(),
            config.token.refresh_interval,
            config.token.expiry_margin,
            issued,
        )
        .spawn()
    });

    let mut task = channel.start()?;
    info!("Channel started. Press Ctrl+C to shutdown...");

    let finished = tokio::select! {
        joined = &mut task => Some(joined),
        _ = tokio::signal::ctrl_c() => None,
    };
    let result = match finished {
        Some(joined) => joined,
        None => {
            info!("Shutdown requested");
            channel.shutdown();
            task.await
        }
    };

    if let Some(refresher) = refresher {
        refresher.abort();
    }
    responder.abort();
    lifecycle.abort();

    let status = channel.status().await;
    info!(
        frames_received = status.frames_received,
        frames_sent = status.frames_sent,
        reconnects = status.reconnect_count,
        "Channel stopped"
    );

    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("Event channel error: {}", e);
            Err(e.into())
        }
        Err(e) => Err(anyhow!("connection task failed: {e}")),
    }
}

/// Resolves the token for the first handshake. A token file wins over
/// `--token` because it also carries the expiry.
async fn initial_token(
    provider: Option<&FileTokenProvider>,
    fallback: Option<&str>,
) -> Result<(String, Option<IssuedToken>)> {
    match (provider, fallback) {
        (Some(provider), fallback) => match provider.refresh().await {
            Ok(issued) => {
                info!(expires_at = %issued.expires_at, "Loaded token from file");
                Ok((issued.access_token.clone(), Some(issued)))
            }
            Err(e) => match fallback {
                Some(token) => {
                    warn!("Could not read token file, using --token: {:#}", e);
                    Ok((token.to_string(), None))
                }
                None => Err(e),
            },
        },
        (None, Some(token)) => Ok((token.to_string(), None)),
        (None, None) => bail!("no token available"),
    }
}

/// Registers a callback that hands events of type `E` to the responder loop.
fn forward<E, R>(channel: &EventChannel, tx: &mpsc::UnboundedSender<Inbound>, reply: R)
where
    E: ExternalEvent + Serialize,
    R: Fn(&E) -> Option<Reply> + Send + Sync + 'static,
{
    let tx = tx.clone();
    channel.on(move |event: &E| {
        let inbound = Inbound {
            kind: E::KIND,
            payload: serde_json::to_value(event)?,
            reply: reply(event),
        };
        tx.send(inbound)
            .map_err(|_| anyhow!("responder loop has stopped"))
    });
}

/// Prints every event as a JSON line and answers the ones the responder is
/// configured for.
async fn respond(
    channel: EventChannel,
    mut rx: mpsc::UnboundedReceiver<Inbound>,
    responder: ResponderConfig,
) {
    while let Some(inbound) = rx.recv().await {
        println!("{}", json!({ "event": inbound.kind, "payload": inbound.payload }));

        let outcome = match inbound.reply {
            Some(Reply::Balance { request_id, email }) => responder
                .balance
                .map(|balance| channel.push_balance(request_id, email, balance)),
            Some(Reply::Result { request_id }) => responder
                .withdrawal_result
                .as_ref()
                .map(|result| channel.push_result(request_id, result.as_str())),
            None => None,
        };

        if let Some(outcome) = outcome {
            debug!(event = %inbound.kind, ?outcome, "Answered event");
        }
    }
}

async fn print_lifecycle(mut rx: cgc_channel::events::LifecycleReceiver) {
    loop {
        match rx.recv().await {
            Ok(event) => println!("{}", json!({ "lifecycle": event })),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Skipped {} lifecycle events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
