//! Per-source admission control
//!
//! Every request to a source passes a concurrency semaphore and a shared
//! token bucket, so worker count and request rate are bounded independently.

use crate::config::SourceConfig;
use crate::error::FetchError;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// Token bucket plus worker bound for one source
#[derive(Clone)]
pub struct SourceGate {
    source: String,
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    workers: Arc<Semaphore>,
}

/// Held while a request to the source is in progress
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl SourceGate {
    /// Build a gate from the source's rate limit and concurrency settings
    pub fn new(source: &SourceConfig) -> Self {
        let requests = NonZeroU32::new(source.rate_limit.requests).unwrap_or(nonzero!(1u32));
        let interval = Duration::from_secs(source.rate_limit.interval_secs.max(1));
        let period = interval / requests.get();

        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(nonzero!(1u32)))
            .allow_burst(requests);

        Self {
            source: source.id.clone(),
            limiter: Arc::new(RateLimiter::direct(quota)),
            workers: Arc::new(Semaphore::new(source.concurrency.max(1))),
        }
    }

    /// Wait for a free worker slot, then for a token
    pub async fn acquire(&self) -> Result<GatePermit, FetchError> {
        let permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FetchError::NavigationFailed {
                url: self.source.clone(),
                reason: "source gate closed".to_string(),
            })?;
        self.limiter.until_ready().await;
        trace!(source = %self.source, "request admitted");
        Ok(GatePermit { _permit: permit })
    }

    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_sources, RateLimitPolicy};
    use std::time::Instant;

    fn source(requests: u32, interval_secs: u64, concurrency: usize) -> SourceConfig {
        let mut s = default_sources().remove(0);
        s.rate_limit = RateLimitPolicy {
            requests,
            interval_secs,
        };
        s.concurrency = concurrency;
        s
    }

    #[tokio::test]
    async fn test_burst_is_admitted_immediately() {
        let gate = SourceGate::new(&source(5, 1, 5));
        let start = Instant::now();
        for _ in 0..5 {
            let _p = gate.acquire().await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_rate_is_enforced_after_burst() {
        // 10 per second: one token every 100ms
        let gate = SourceGate::new(&source(10, 1, 10));
        for _ in 0..10 {
            let _p = gate.acquire().await.unwrap();
        }
        let start = Instant::now();
        let _p = gate.acquire().await.unwrap();
        let _q = gate.acquire().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        let gate = SourceGate::new(&source(100, 1, 2));
        let a = gate.acquire().await.unwrap();
        let _b = gate.acquire().await.unwrap();
        assert_eq!(gate.available_workers(), 0);
        drop(a);
        assert_eq!(gate.available_workers(), 1);
    }
}
