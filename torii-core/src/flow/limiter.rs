use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter for one key: refills at `rate` tokens per second up
/// to `burst`, one token per admitted request.
pub struct Limiter {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl Limiter {
    fn new(rate: f64) -> Self {
        let burst = (rate * 3.0).max(1.0);
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> f64 {
        self.burst
    }

    /// True iff a token was available; consumes it.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Lazily-created limiters keyed by flow key.
///
/// The rate is fixed when the limiter is first created; later calls with a
/// different `qps` return the existing limiter unchanged. Callers that need
/// distinct rates must use distinct keys.
#[derive(Default)]
pub struct FlowLimiterRegistry {
    limiters: DashMap<String, Arc<Limiter>>,
}

impl FlowLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limiter(&self, key: &str, qps: f64) -> Arc<Limiter> {
        let entry = self
            .limiters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Limiter::new(qps)));
        entry.value().clone()
    }
}
