//! Aggregate rate ceiling for live remote calls.
//!
//! One `governor` limiter with a single-permit quota replenished every
//! `interval`, shared by every in-flight valuation. A zero interval means
//! no limiter at all.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::time::Duration;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct Throttle {
    interval: Duration,
    limiter: Option<DirectLimiter>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            limiter: Quota::with_period(interval).map(RateLimiter::direct),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for the next permit. The first call never waits.
    pub async fn acquire(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }
}
