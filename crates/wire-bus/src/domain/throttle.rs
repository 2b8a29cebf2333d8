//! # Leaky-Bucket Throttle
//!
//! Continuous-refill rate limiter gating message (or byte) admission.
//!
//! ## Algorithm
//!
//! - Tokens accumulate with elapsed time at `refill_rate` per second
//! - The bucket never holds more than `capacity` tokens nor fewer than zero
//! - Admission consumes tokens; when short, the caller waits for the refill
//!   instead of being dropped
//!
//! A request larger than `capacity` is clamped to `capacity`: it waits for a
//! full bucket and then empties it.

use crate::domain::endpoint::{ThrottleStrategy, ThrottlingCriteria};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Poll interval for a bucket that never refills.
const STALLED_BUCKET_POLL: Duration = Duration::from_secs(1);

/// Leaky-bucket rate limiter.
#[derive(Debug)]
pub struct LeakyBucket {
    /// Maximum tokens in bucket.
    capacity: u64,
    /// Tokens added per second.
    refill_rate: u64,
    /// Token count and last refill instant.
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl LeakyBucket {
    /// Create a full bucket.
    ///
    /// # Parameters
    ///
    /// - `capacity`: Maximum burst size
    /// - `refill_rate`: Tokens per second
    pub fn new(capacity: u64, refill_rate: u64) -> Self {
        Self {
            capacity,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Bucket whose capacity and rate both equal `limit`, or `None` for an
    /// unlimited (zero) limit.
    pub fn for_limit(limit: u32) -> Option<Self> {
        (limit > 0).then(|| Self::new(u64::from(limit), u64::from(limit)))
    }

    /// Maximum tokens the bucket holds.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Tokens added per second.
    #[must_use]
    pub fn refill_rate(&self) -> u64 {
        self.refill_rate
    }

    /// Whole tokens currently available.
    pub fn available(&self) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.tokens.floor() as u64
    }

    /// Take `tokens` if they are available right now.
    pub fn try_acquire(&self, tokens: u64) -> bool {
        self.take_or_wait(tokens).is_ok()
    }

    /// Take `tokens`, waiting for the refill when short.
    pub async fn acquire(&self, tokens: u64) {
        loop {
            match self.take_or_wait(tokens) {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Take tokens or report how long until enough have accrued.
    fn take_or_wait(&self, tokens: u64) -> Result<(), Duration> {
        let needed = tokens.min(self.capacity) as f64;
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());

        if state.tokens >= needed {
            state.tokens -= needed;
            return Ok(());
        }

        if self.refill_rate == 0 {
            return Err(STALLED_BUCKET_POLL);
        }
        let missing = needed - state.tokens;
        Err(Duration::from_secs_f64(missing / self.refill_rate as f64))
    }

    /// Refill tokens based on elapsed time.
    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.last_refill = now;

        let added = elapsed.as_secs_f64() * self.refill_rate as f64;
        state.tokens = (state.tokens + added).min(self.capacity as f64).max(0.0);
    }
}

/// The inbound and outbound buckets of one context.
#[derive(Debug, Clone, Default)]
pub struct Throttles {
    strategy: ThrottleStrategy,
    inbound: Option<Arc<LeakyBucket>>,
    outbound: Option<Arc<LeakyBucket>>,
}

impl Throttles {
    /// Build from endpoint criteria; `None` admits everything.
    #[must_use]
    pub fn from_criteria(criteria: Option<&ThrottlingCriteria>) -> Self {
        let Some(criteria) = criteria else {
            return Self::default();
        };

        Self {
            strategy: criteria.strategy,
            inbound: LeakyBucket::for_limit(criteria.incoming_limit_per_second).map(Arc::new),
            outbound: LeakyBucket::for_limit(criteria.outgoing_limit_per_second).map(Arc::new),
        }
    }

    /// Wait until an inbound frame of `len` bytes may be processed.
    pub async fn admit_inbound(&self, len: usize) {
        if let Some(bucket) = &self.inbound {
            bucket.acquire(self.strategy.cost(len)).await;
        }
    }

    /// Wait until an outbound frame of `len` bytes may be written.
    pub async fn admit_outbound(&self, len: usize) {
        if let Some(bucket) = &self.outbound {
            bucket.acquire(self.strategy.cost(len)).await;
        }
    }

    /// Inbound bucket, if throttled.
    #[must_use]
    pub fn inbound(&self) -> Option<&LeakyBucket> {
        self.inbound.as_deref()
    }

    /// Outbound bucket, if throttled.
    #[must_use]
    pub fn outbound(&self) -> Option<&LeakyBucket> {
        self.outbound.as_deref()
    }
}
