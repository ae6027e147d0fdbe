//! Admission check in front of every navigation.
//!
//! The gate combines the domain filter and the rate limiter. It is the only place
//! that sleeps for admission: throttling never surfaces as an error, the caller is
//! simply suspended until a slot opens or the task is cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::domain_filter::{DomainFilter, DomainVerdict};
use super::rate_limiter::{Admission, RateLimiter};
use crate::domain::normalize_url;
use crate::error::NavigationError;

/// A navigation that passed both checks. The fetch may start immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    pub url: Url,
    pub host: String,
    /// Total time spent suspended in the gate.
    pub waited: Duration,
}

pub struct BrowsingGate {
    filter: Arc<DomainFilter>,
    limiter: Arc<RateLimiter>,
}

impl BrowsingGate {
    pub fn new(filter: Arc<DomainFilter>, limiter: Arc<RateLimiter>) -> Self {
        Self { filter, limiter }
    }

    pub fn filter(&self) -> &Arc<DomainFilter> {
        &self.filter
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Parse and vet `raw` without touching the rate limiter.
    pub fn check_url(&self, raw: &str) -> Result<(Url, String), NavigationError> {
        let url = parse_navigable(raw)?;
        let host = url
            .host_str()
            .map(super::normalize_host)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| NavigationError::InvalidUrl(raw.to_string()))?;

        match self.filter.check(&host) {
            DomainVerdict::Allowed => Ok((url, host)),
            verdict => {
                warn!(host = %host, ?verdict, "navigation refused by domain filter");
                Err(NavigationError::DomainBlocked { host })
            }
        }
    }

    /// Vet `raw`, then wait for a rate-limit slot on its host.
    ///
    /// Returns `Cancelled` as soon as `cancel` fires, whether the caller is waiting
    /// for the window or sleeping the spacing delay.
    pub async fn before_navigate(
        &self,
        raw: &str,
        cancel: &CancellationToken,
    ) -> Result<Admitted, NavigationError> {
        if cancel.is_cancelled() {
            return Err(NavigationError::Cancelled);
        }
        let (url, host) = self.check_url(raw)?;

        let started = Instant::now();
        loop {
            match self.limiter.admit(&host) {
                Admission::Proceed { delay } => {
                    if !delay.is_zero() {
                        debug!(host = %host, delay_ms = delay.as_millis() as u64, "spacing request");
                        sleep_or_cancel(delay, cancel).await?;
                    }
                    let waited = started.elapsed();
                    info!(host = %host, url = %url, waited_ms = waited.as_millis() as u64, "navigation admitted");
                    return Ok(Admitted { url, host, waited });
                }
                // 枠が空くまで待ってから再判定（待ち時間の上限はタスクのタイムアウト）
                Admission::Wait(wait) => sleep_or_cancel(wait, cancel).await?,
            }
        }
    }
}

/// Normalize and parse a navigation target. Only http(s) with a host is accepted;
/// any other scheme is refused as written, never rewritten to https.
pub fn parse_navigable(raw: &str) -> Result<Url, NavigationError> {
    let url = Url::parse(&normalize_url(raw)).map_err(|_| NavigationError::InvalidUrl(raw.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(NavigationError::UnsupportedScheme {
                scheme: other.to_string(),
            });
        }
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(NavigationError::InvalidUrl(raw.to_string()));
    }
    Ok(url)
}

async fn sleep_or_cancel(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), NavigationError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(NavigationError::Cancelled),
        _ = sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browsing::{DomainList, RateLimitStore};
    use crate::config::RateLimitConfig;
    use rstest::rstest;

    const NONE: [&str; 0] = [];

    fn gate_with(deny: &[&str], config: RateLimitConfig) -> BrowsingGate {
        let filter = DomainFilter::new(DomainList::from_lines(NONE, deny.iter().copied()));
        let limiter = RateLimiter::with_rng_seed(config, Arc::new(RateLimitStore::new()), 42);
        BrowsingGate::new(Arc::new(filter), Arc::new(limiter))
    }

    fn gate() -> BrowsingGate {
        gate_with(&["blocked.example.com", "*.ads.test"], RateLimitConfig::default())
    }

    #[rstest]
    #[case("ftp://example.com/file", NavigationError::UnsupportedScheme { scheme: "ftp".into() })]
    #[case("mailto:someone@evil.example", NavigationError::UnsupportedScheme { scheme: "mailto".into() })]
    #[case("file:/etc/passwd", NavigationError::UnsupportedScheme { scheme: "file".into() })]
    #[case("javascript:void(0)", NavigationError::UnsupportedScheme { scheme: "javascript".into() })]
    #[case("   ", NavigationError::InvalidUrl("   ".into()))]
    #[case("https://", NavigationError::InvalidUrl("https://".into()))]
    #[case("https://blocked.example.com/x", NavigationError::DomainBlocked { host: "blocked.example.com".into() })]
    #[case("tracker.ads.test", NavigationError::DomainBlocked { host: "tracker.ads.test".into() })]
    fn rejects_before_rate_limiting(#[case] raw: &str, #[case] expected: NavigationError) {
        let gate = gate();
        assert_eq!(gate.check_url(raw).unwrap_err(), expected);
        assert_eq!(gate.limiter().host_count(), 0);
    }

    #[test]
    fn bare_host_gets_https_scheme() {
        let (url, host) = gate().check_url("Example.com/page").unwrap();
        assert_eq!(url.as_str(), "https://example.com/page");
        assert_eq!(host, "example.com");
    }

    #[tokio::test(start_paused = true)]
    async fn first_navigation_is_admitted_without_waiting() {
        let gate = gate();
        let token = CancellationToken::new();
        let admitted = gate.before_navigate("https://example.com", &token).await.unwrap();
        assert_eq!(admitted.host, "example.com");
        assert_eq!(admitted.waited, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn second_navigation_sleeps_the_spacing_delay() {
        let gate = gate();
        let token = CancellationToken::new();
        gate.before_navigate("https://example.com/a", &token).await.unwrap();
        let admitted = gate.before_navigate("https://example.com/b", &token).await.unwrap();
        assert!(admitted.waited >= Duration::from_secs(10));
        assert!(admitted.waited <= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn full_window_suspends_until_a_slot_frees() {
        let config = RateLimitConfig {
            delay_min_secs: 0,
            delay_max_secs: 0,
            ..RateLimitConfig::default()
        };
        let gate = gate_with(&[], config);
        let token = CancellationToken::new();
        for _ in 0..5 {
            gate.before_navigate("https://example.com", &token).await.unwrap();
        }
        let admitted = gate.before_navigate("https://example.com", &token).await.unwrap();
        assert!(admitted.waited >= Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let gate = Arc::new(gate());
        let token = CancellationToken::new();
        gate.before_navigate("https://example.com", &token).await.unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            let token = token.clone();
            tokio::spawn(async move { gate.before_navigate("https://example.com", &token).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();

        assert_eq!(waiter.await.unwrap(), Err(NavigationError::Cancelled));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let token = CancellationToken::new();
        token.cancel();
        let err = gate().before_navigate("https://example.com", &token).await.unwrap_err();
        assert_eq!(err, NavigationError::Cancelled);
    }
}
