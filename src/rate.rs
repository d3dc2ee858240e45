//! Token-bucket rate governor for outbound RPC traffic.

use crate::error::{Error, Result};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

/// Token bucket shared by every task that talks to the upstream node.
///
/// One token is consumed per outbound HTTP request, regardless of how many
/// RPC methods the request batches. Waiters are served in FIFO order: the
/// bucket state sits behind a fair async mutex that is held across the
/// refill wait.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Option<Bucket>,
    shutdown: watch::Receiver<bool>,
}

#[derive(Debug)]
struct Bucket {
    /// Tokens replenished per second.
    rate: u64,
    /// Maximum tokens held at once.
    burst: u64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    /// Builds a limiter from the configured event count and window.
    ///
    /// A non-positive count or a zero window disables limiting entirely. A
    /// positive configuration whose integer-floored rate is below one event
    /// per second is rejected.
    pub fn new(
        value: i64,
        window: Duration,
        burst: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        if value <= 0 || window.as_secs() == 0 {
            return Ok(Self {
                bucket: None,
                shutdown,
            });
        }

        let rate = value as u64 / window.as_secs();
        if rate == 0 {
            return Err(Error::Config(
                "rate limit must allow at least one event per second".to_string(),
            ));
        }

        let burst = burst.max(1) as u64;
        Ok(Self {
            bucket: Some(Bucket {
                rate,
                burst,
                state: Mutex::new(BucketState {
                    tokens: burst as f64,
                    refilled_at: Instant::now(),
                }),
            }),
            shutdown,
        })
    }

    /// Whether limiting is disabled.
    pub fn is_unlimited(&self) -> bool {
        self.bucket.is_none()
    }

    /// Waits for one token, or fails with [`Error::Cancelled`] when the
    /// pipeline shutdown signal fires first.
    pub async fn acquire(&self) -> Result<()> {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return Err(Error::Cancelled);
        }
        let Some(bucket) = &self.bucket else {
            return Ok(());
        };

        let mut state = bucket.state.lock().await;
        loop {
            if *shutdown.borrow() {
                return Err(Error::Cancelled);
            }

            let now = Instant::now();
            let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
            state.tokens = (state.tokens + elapsed * bucket.rate as f64).min(bucket.burst as f64);
            state.refilled_at = now;

            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                return Ok(());
            }

            let deficit = 1.0 - state.tokens;
            let wait = Duration::from_secs_f64(deficit / bucket.rate as f64);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Err(Error::Cancelled);
                    }
                }
            }
        }
    }
}
