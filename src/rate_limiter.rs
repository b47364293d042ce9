//! Per-source politeness gate
//!
//! Each source gets its own direct `governor` limiter with a one-request
//! burst, so consecutive fetches are at least `base` apart. A random
//! jitter sleep is added on top so request timing does not look scripted.

use governor::{clock::DefaultClock, middleware::NoOpMiddleware, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{HarvestError, Result};
use crate::pattern::RateLimitOverride;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Minimum spacing plus random jitter for one source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayProfile {
    pub base: Duration,
    pub jitter_max: Duration,
}

impl DelayProfile {
    pub fn from_millis(base_ms: u64, jitter_ms: u64) -> Self {
        Self {
            base: Duration::from_millis(base_ms),
            jitter_max: Duration::from_millis(jitter_ms),
        }
    }
}

struct SourceGate {
    period: Duration,
    limiter: Option<Arc<DirectLimiter>>,
}

impl SourceGate {
    fn new(period: Duration) -> Self {
        // A zero period has no quota: the gate is open
        let limiter = Quota::with_period(period).map(|quota| Arc::new(RateLimiter::direct(quota)));
        Self { period, limiter }
    }
}

pub struct SourceRateLimiter {
    defaults: DelayProfile,
    gates: Mutex<HashMap<String, SourceGate>>,
}

impl SourceRateLimiter {
    pub fn new(defaults: DelayProfile) -> Self {
        Self {
            defaults,
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Delay profile for a source: pattern override, else the defaults
    pub fn profile_for(&self, rate_limit: Option<&RateLimitOverride>) -> DelayProfile {
        rate_limit
            .map(|o| DelayProfile::from_millis(o.base_delay_ms, o.jitter_ms))
            .unwrap_or(self.defaults)
    }

    /// Waits until `source_id` may be fetched again.
    ///
    /// Returns `HarvestError::Cancelled` if `cancel` fires first.
    pub async fn wait(&self, source_id: &str, profile: DelayProfile, cancel: &CancellationToken) -> Result<()> {
        let limiter = {
            let mut gates = self.gates.lock();
            let gate = gates
                .entry(source_id.to_string())
                .or_insert_with(|| SourceGate::new(profile.base));
            if gate.period != profile.base {
                *gate = SourceGate::new(profile.base);
            }
            gate.limiter.clone()
        };

        if let Some(limiter) = limiter {
            tokio::select! {
                _ = cancel.cancelled() => return Err(HarvestError::Cancelled),
                _ = limiter.until_ready() => {}
            }
        }

        let jitter = random_jitter(profile.jitter_max);
        if !jitter.is_zero() {
            debug!(source = %source_id, jitter_ms = jitter.as_millis() as u64, "Applying request jitter");
            tokio::select! {
                _ = cancel.cancelled() => return Err(HarvestError::Cancelled),
                _ = tokio::time::sleep(jitter) => {}
            }
        }

        Ok(())
    }
}

fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
