//! Bearer token storage and periodic refresh.
//!
//! The channel reads its token from a [`TokenCell`] every time it encodes a
//! frame. A [`TokenRefresher`] ticks on a fixed interval, independent of the
//! connection state, and swaps in a new token from a [`TokenProvider`] when
//! the current one is about to expire.

use crate::error::ChannelError;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// Shared, lock-free current token.
#[derive(Debug, Clone)]
pub struct TokenCell {
    inner: Arc<watch::Sender<String>>,
}

impl TokenCell {
    pub fn new(token: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(token.into());
        Self {
            inner: Arc::new(tx),
        }
    }

    pub fn get(&self) -> String {
        self.inner.borrow().clone()
    }

    pub fn set(&self, token: impl Into<String>) {
        self.inner.send_replace(token.into());
    }
}

/// Receiver of refreshed tokens.
pub trait TokenSink: Send + Sync {
    fn update_token(&self, token: String);
}

impl TokenSink for TokenCell {
    fn update_token(&self, token: String) {
        self.set(token);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IssuedToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Source of fresh tokens, e.g. an OAuth2 refresh flow.
pub trait TokenProvider: Send + Sync + 'static {
    fn refresh(&self) -> impl Future<Output = Result<IssuedToken>> + Send;
}

/// OAuth2 token endpoint response shape.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Epoch milliseconds.
    pub expiry_access_date: i64,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl TryFrom<TokenResponse> for IssuedToken {
    type Error = ChannelError;

    fn try_from(response: TokenResponse) -> Result<Self, ChannelError> {
        let expires_at = DateTime::from_timestamp_millis(response.expiry_access_date)
            .ok_or_else(|| {
                ChannelError::Token(format!(
                    "expiry_access_date {} is out of range",
                    response.expiry_access_date
                ))
            })?;
        Ok(IssuedToken {
            access_token: response.access_token,
            expires_at,
        })
    }
}

/// Reads a [`TokenResponse`] JSON document that some other process keeps
/// up to date.
#[derive(Debug, Clone)]
pub struct FileTokenProvider {
    path: PathBuf,
}

impl FileTokenProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenProvider for FileTokenProvider {
    async fn refresh(&self) -> Result<IssuedToken> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read token file {}", self.path.display()))?;
        let response: TokenResponse = serde_json::from_str(&raw)
            .with_context(|| format!("invalid token file {}", self.path.display()))?;
        Ok(IssuedToken::try_from(response)?)
    }
}

pub struct TokenRefresher<P, S> {
    provider: P,
    sink: S,
    period: Duration,
    margin: chrono::Duration,
    current: Option<IssuedToken>,
}

impl<P, S> TokenRefresher<P, S>
where
    P: TokenProvider,
    S: TokenSink + 'static,
{
    /// `current` is the token the channel was created with, if its expiry
    /// is known. Without it the first tick refreshes unconditionally.
    pub fn new(
        provider: P,
        sink: S,
        period: Duration,
        margin: Duration,
        current: Option<IssuedToken>,
    ) -> Self {
        Self {
            provider,
            sink,
            period,
            margin: chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::MAX),
            current,
        }
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match &self.current {
            Some(token) => now
                .checked_add_signed(self.margin)
                .is_none_or(|deadline| token.expires_at < deadline),
            None => true,
        }
    }

    /// One refresh check. Returns whether the sink received a new token.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> bool {
        if !self.needs_refresh(now) {
            debug!("Token still valid, skipping refresh");
            return false;
        }

        match self.provider.refresh().await {
            Ok(token) => {
                let changed = self
                    .current
                    .as_ref()
                    .is_none_or(|current| current.access_token != token.access_token);
                if changed {
                    info!(expires_at = %token.expires_at, "Obtained new channel token");
                    self.sink.update_token(token.access_token.clone());
                }
                self.current = Some(token);
                changed
            }
            Err(e) => {
                warn!("Token refresh failed, retrying next tick: {:#}", e);
                false
            }
        }
    }

    pub async fn run(mut self) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            self.tick(Utc::now()).await;
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Hands out `token-1`, `token-2`, ... each expiring `ttl` from now.
    #[derive(Clone)]
    struct CountingProvider {
        calls: Arc<AtomicUsize>,
        ttl: chrono::Duration,
        fail: bool,
    }

    impl CountingProvider {
        fn new(ttl: chrono::Duration) -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                ttl,
                fail: false,
            }
        }
    }

    impl TokenProvider for CountingProvider {
        async fn refresh(&self) -> Result<IssuedToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                anyhow::bail!("token endpoint unavailable");
            }
            Ok(IssuedToken {
                access_token: format!("token-{n}"),
                expires_at: Utc::now() + self.ttl,
            })
        }
    }

    fn issued(token: &str, expires_at: DateTime<Utc>) -> IssuedToken {
        IssuedToken {
            access_token: token.to_string(),
            expires_at,
        }
    }

    #[tokio::test]
    async fn test_refresh_only_inside_margin() {
        let now = Utc::now();
        let provider = CountingProvider::new(chrono::Duration::hours(1));
        let cell = TokenCell::new("initial");
        let mut refresher = TokenRefresher::new(
            provider.clone(),
            cell.clone(),
            Duration::from_secs(10),
            Duration::from_secs(300),
            Some(issued("initial", now + chrono::Duration::minutes(30))),
        );

        assert!(!refresher.tick(now).await);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert_eq!(cell.get(), "initial");

        // 26 minutes later the token is within the 5 minute margin
        let later = now + chrono::Duration::minutes(26);
        assert!(refresher.tick(later).await);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cell.get(), "token-1");
    }

    #[tokio::test]
    async fn test_unknown_expiry_refreshes_on_first_tick() {
        let provider = CountingProvider::new(chrono::Duration::hours(1));
        let cell = TokenCell::new("initial");
        let mut refresher = TokenRefresher::new(
            provider,
            cell.clone(),
            Duration::from_secs(10),
            Duration::from_secs(300),
            None,
        );
        assert!(refresher.tick(Utc::now()).await);
        assert_eq!(cell.get(), "token-1");
        assert!(!refresher.tick(Utc::now()).await);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_current_token() {
        let mut provider = CountingProvider::new(chrono::Duration::hours(1));
        provider.fail = true;
        let cell = TokenCell::new("initial");
        let mut refresher = TokenRefresher::new(
            provider.clone(),
            cell.clone(),
            Duration::from_secs(10),
            Duration::from_secs(300),
            None,
        );
        assert!(!refresher.tick(Utc::now()).await);
        assert!(!refresher.tick(Utc::now()).await);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cell.get(), "initial");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_on_fixed_period() {
        // Tokens that are always inside the margin force a refresh per tick
        let provider = CountingProvider::new(chrono::Duration::seconds(1));
        let cell = TokenCell::new("initial");
        let handle = TokenRefresher::new(
            provider.clone(),
            cell.clone(),
            Duration::from_secs(10),
            Duration::from_secs(300),
            None,
        )
        .spawn();

        tokio::time::sleep(Duration::from_secs(35)).await;
        handle.abort();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(cell.get(), "token-3");
    }

    #[tokio::test]
    async fn test_file_provider_reads_token_response() {
        let path = std::env::temp_dir().join(format!(
            "cgc-channel-token-{}-{}.json",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        tokio::fs::write(
            &path,
            r#"{"access_token":"abc","refresh_token":"def","expiry_access_date":1700000000000,"token_type":"Bearer"}"#,
        )
        .await
        .unwrap();

        let token = FileTokenProvider::new(&path).refresh().await.unwrap();
        let _ = tokio::fs::remove_file(&path).await;

        assert_eq!(token.access_token, "abc");
        assert_eq!(token.expires_at.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_out_of_range_expiry_is_rejected() {
        let response = TokenResponse {
            access_token: "abc".into(),
            expiry_access_date: i64::MAX,
            refresh_token: None,
            token_type: None,
        };
        assert!(matches!(
            IssuedToken::try_from(response),
            Err(ChannelError::Token(_))
        ));
    }

    #[tokio::test]
    async fn test_file_provider_missing_file_is_error() {
        let provider = FileTokenProvider::new("/nonexistent/cgc-channel-token.json");
        let err = provider.refresh().await.unwrap_err();
        assert!(format!("{err:#}").contains("failed to read token file"));
    }
}
