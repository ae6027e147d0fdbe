//! Per-host admission control: sliding-window cap, randomized spacing, and overload
//! backoff.
//!
//! Every decision for a host is taken under that host's bucket lock, so two tasks
//! can never both consume the last slot of a window. The limiter itself never
//! sleeps; it tells the caller how long to wait.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;

/// Ceiling for the overload multiplier (the wait itself is capped separately).
pub const MAX_BACKOFF_MULTIPLIER: u32 = 64;

/// Decision for one navigation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was reserved. The request must be sent after `delay`.
    Proceed { delay: Duration },
    /// No slot right now. Wait this long, then ask again.
    Wait(Duration),
}

#[derive(Debug)]
struct Bucket {
    /// Reserved send times still inside the window. Not necessarily sorted:
    /// concurrent reservations carry different random delays.
    timestamps: VecDeque<Instant>,
    last_request: Option<Instant>,
    multiplier: u32,
    blocked_until: Option<Instant>,
    last_overload: Option<Instant>,
    last_touched: Instant,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Self {
            timestamps: VecDeque::new(),
            last_request: None,
            multiplier: 1,
            blocked_until: None,
            last_overload: None,
            last_touched: now,
        }
    }

    fn purge(&mut self, now: Instant, window: Duration) {
        self.timestamps
            .retain(|&at| now.saturating_duration_since(at) < window);
        if self.blocked_until.is_some_and(|until| until <= now) {
            self.blocked_until = None;
        }
    }

    fn oldest(&self) -> Option<Instant> {
        self.timestamps.iter().min().copied()
    }

    /// Time until the oldest retained reservation leaves the window.
    fn window_wait(&self, now: Instant, window: Duration) -> Option<Duration> {
        self.oldest()
            .map(|oldest| (oldest + window).saturating_duration_since(now))
            .filter(|wait| !wait.is_zero())
    }

    fn is_idle(&self) -> bool {
        self.timestamps.is_empty() && self.blocked_until.is_none()
    }
}

/// Host -> bucket table. Owned by whoever builds the limiter; there is no global.
#[derive(Debug, Default)]
pub struct RateLimitStore {
    buckets: DashMap<String, Arc<Mutex<Bucket>>>,
}

impl RateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn clear(&self) {
        self.buckets.clear();
    }

    fn bucket(&self, host: &str, now: Instant) -> (Arc<Mutex<Bucket>>, bool) {
        if let Some(existing) = self.buckets.get(host) {
            return (Arc::clone(existing.value()), false);
        }
        let mut created = false;
        let bucket = self
            .buckets
            .entry(host.to_string())
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(Bucket::new(now)))
            })
            .clone();
        (bucket, created)
    }

    fn get(&self, host: &str) -> Option<Arc<Mutex<Bucket>>> {
        self.buckets.get(host).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop least-recently-used buckets until at most `max_hosts` remain, idle ones
    /// first. Buckets currently locked by an admission are skipped.
    fn evict(&self, max_hosts: usize, keep: &str) {
        if self.buckets.len() <= max_hosts {
            return;
        }
        let mut candidates: Vec<(bool, Instant, String)> = self
            .buckets
            .iter()
            .filter(|entry| entry.key() != keep)
            .filter_map(|entry| {
                let bucket = entry.value().try_lock()?;
                Some((!bucket.is_idle(), bucket.last_touched, entry.key().clone()))
            })
            .collect();
        candidates.sort();

        let excess = self.buckets.len().saturating_sub(max_hosts);
        for (_, _, host) in candidates.into_iter().take(excess) {
            debug!(host = %host, "evicting rate-limit bucket");
            self.buckets.remove(&host);
        }
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<RateLimitStore>,
    rng: Mutex<StdRng>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, store: Arc<RateLimitStore>) -> Self {
        Self {
            config,
            store,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic jitter, for tests and simulations.
    pub fn with_rng_seed(config: RateLimitConfig, store: Arc<RateLimitStore>, seed: u64) -> Self {
        Self {
            config,
            store,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn admit(&self, host: &str) -> Admission {
        self.admit_at(host, Instant::now())
    }

    pub fn admit_at(&self, host: &str, now: Instant) -> Admission {
        if !self.config.enabled {
            return Admission::Proceed {
                delay: Duration::ZERO,
            };
        }

        let window = self.config.window();
        let (bucket, created) = self.store.bucket(host, now);
        let decision = {
            let mut b = bucket.lock();
            b.last_touched = now;
            b.purge(now, window);

            if let Some(until) = b.blocked_until {
                Admission::Wait(until.saturating_duration_since(now))
            } else if b.timestamps.len() < self.config.max_requests {
                let delay = if b.last_request.is_some() {
                    self.jitter()
                } else {
                    Duration::ZERO
                };
                let at = now + delay;
                b.timestamps.push_back(at);
                b.last_request = Some(at);
                Admission::Proceed { delay }
            } else {
                let wait = b.window_wait(now, window).unwrap_or(window);
                Admission::Wait(wait)
            }
        };

        if created {
            self.store.evict(self.config.max_hosts, host);
        }

        match decision {
            Admission::Proceed { delay } => {
                debug!(host, delay_ms = delay.as_millis() as u64, "rate limit: slot reserved")
            }
            Admission::Wait(wait) => {
                warn!(host, wait_ms = wait.as_millis() as u64, "rate limit reached; caller must wait")
            }
        }
        decision
    }

    /// Register an overload signal (e.g. HTTP 429) from `host`.
    ///
    /// Doubles the host's multiplier and blocks the host for
    /// `min(max(suggested, window wait) * multiplier, backoff_max)`; every task
    /// targeting the host observes the block. Returns that wait.
    pub fn record_overload(&self, host: &str, suggested: Option<Duration>) -> Duration {
        self.record_overload_at(host, suggested, Instant::now())
    }

    pub fn record_overload_at(&self, host: &str, suggested: Option<Duration>, now: Instant) -> Duration {
        let window = self.config.window();
        let (bucket, _) = self.store.bucket(host, now);
        let mut b = bucket.lock();
        b.last_touched = now;
        b.purge(now, window);

        b.multiplier = b.multiplier.saturating_mul(2).min(MAX_BACKOFF_MULTIPLIER);
        let window_wait = b
            .window_wait(now, window)
            .unwrap_or_else(|| self.config.delay_min());
        let base = suggested.unwrap_or(Duration::ZERO).max(window_wait);
        let wait = base
            .saturating_mul(b.multiplier)
            .min(self.config.backoff_max());

        let until = now + wait;
        b.blocked_until = Some(b.blocked_until.map_or(until, |prev| prev.max(until)));
        b.last_overload = Some(now);

        warn!(
            host,
            multiplier = b.multiplier,
            wait_ms = wait.as_millis() as u64,
            "host signalled overload; backing off"
        );
        wait
    }

    /// Register a non-overloaded response. The multiplier returns to baseline once
    /// the host has been quiet for `backoff_reset_after`.
    pub fn record_success(&self, host: &str) {
        self.record_success_at(host, Instant::now())
    }

    pub fn record_success_at(&self, host: &str, now: Instant) {
        let Some(bucket) = self.store.get(host) else {
            return;
        };
        let mut b = bucket.lock();
        b.last_touched = now;
        if let Some(last) = b.last_overload
            && now.saturating_duration_since(last) >= self.config.backoff_reset_after()
        {
            b.multiplier = 1;
            b.last_overload = None;
        }
    }

    /// Reservations currently inside the window for `host`.
    pub fn retained(&self, host: &str) -> usize {
        self.retained_at(host, Instant::now())
    }

    pub fn retained_at(&self, host: &str, now: Instant) -> usize {
        self.store.get(host).map_or(0, |bucket| {
            let mut b = bucket.lock();
            b.purge(now, self.config.window());
            b.timestamps.len()
        })
    }

    pub fn multiplier(&self, host: &str) -> u32 {
        self.store.get(host).map_or(1, |bucket| bucket.lock().multiplier)
    }

    pub fn host_count(&self) -> usize {
        self.store.len()
    }

    /// Forget all hosts.
    pub fn reset(&self) {
        self.store.clear();
    }

    fn jitter(&self) -> Duration {
        let min = self.config.delay_min().as_millis() as u64;
        let max = self.config.delay_max().as_millis() as u64;
        if min >= max {
            return Duration::from_millis(min);
        }
        Duration::from_millis(self.rng.lock().gen_range(min..=max))
    }
}

/// Consecutive overload signals per host, scoped to one task.
#[derive(Debug, Default)]
pub struct OverloadTracker {
    consecutive: HashMap<String, u32>,
}

impl OverloadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the new consecutive count for `host`.
    pub fn record_overload(&mut self, host: &str) -> u32 {
        let count = self.consecutive.entry(host.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn record_success(&mut self, host: &str) {
        self.consecutive.remove(host);
    }

    pub fn consecutive(&self, host: &str) -> u32 {
        self.consecutive.get(host).copied().unwrap_or(0)
    }
}
