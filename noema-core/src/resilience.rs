// Copyright 2025 Noema (https://github.com/noema-ai)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Resilience primitives: retry policy with jittered backoff and
//! process-wide token-bucket rate limiting.
//!
//! Provider calls are gated by a bucket keyed `(provider, resource)` and
//! wrapped in a retry policy that honours rate-limit hints. Only transient
//! failures are retried; everything else propagates on the first attempt.

use crate::error::{NoemaError, Result};
use dashmap::DashMap;
use rand::random;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Exponential-backoff retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl RetryPolicy {
    /// The policy applied to LLM and embedder calls: base 1 s, cap 60 s,
    /// five attempts.
    pub fn provider_default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    /// A policy with a custom attempt budget, otherwise provider defaults.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::provider_default()
        }
    }

    /// Jittered delay before retry number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let jitter_factor = 1.0 + (random::<f64>() - 0.5) * 2.0 * self.jitter;
        let jittered = (base * jitter_factor).max(0.0);
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt budget
    /// is exhausted. A provider's retry-after hint overrides the computed
    /// backoff; a zero hint means retry immediately.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<Retried<T>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => {
                    return Ok(Retried {
                        value,
                        retries: attempt,
                    })
                }
                Err(err) if err.retryable() && attempt + 1 < self.max_attempts => {
                    let delay = match &err {
                        NoemaError::TransientBackend {
                            retry_after: Some(hint),
                            ..
                        } => *hint,
                        _ => self.delay_for_attempt(attempt),
                    };
                    tracing::debug!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient failure"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// A successful result plus the number of retries it took.
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub retries: u32,
}

/// Sustained rate and burst size for one `(provider, resource)` bucket.
#[derive(Debug, Clone, Copy)]
pub struct LimiterConfig {
    pub rate_per_sec: f64,
    pub burst: f64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: 10.0,
            burst: 10.0,
        }
    }
}

/// Token bucket with continuous refill. Acquisitions reserve their slot
/// under the lock, so waiters drain in FIFO order.
pub struct TokenBucket {
    rate_per_sec: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: LimiterConfig) -> Self {
        let rate = config.rate_per_sec.max(f64::MIN_POSITIVE);
        let burst = config.burst.max(1.0);
        Self {
            rate_per_sec: rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until the bucket can cover the debt. The
    /// token balance may go negative while a reservation waits; that is
    /// what keeps acquisition order fair.
    pub async fn acquire(&self) {
        let wait = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let elapsed = now.duration_since(state.last_refill).as_secs_f64();
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.burst);
            state.last_refill = now;
            state.tokens -= 1.0;
            if state.tokens >= 0.0 {
                None
            } else {
                Some(Duration::from_secs_f64(-state.tokens / self.rate_per_sec))
            }
        };
        if let Some(delay) = wait {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Process-wide bucket registry keyed by `(provider, resource)`, e.g.
/// `("openai", "chat")` and `("openai", "embed")` as separate buckets.
#[derive(Default)]
pub struct RateLimiterRegistry {
    buckets: DashMap<(String, String), Arc<TokenBucket>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get or create the bucket for a provider resource with its defaults.
    pub fn bucket(&self, provider: &str, resource: &str) -> Arc<TokenBucket> {
        self.bucket_with(provider, resource, LimiterConfig::default())
    }

    /// Get or create the bucket for a provider resource. The config only
    /// applies on first creation.
    pub fn bucket_with(
        &self,
        provider: &str,
        resource: &str,
        config: LimiterConfig,
    ) -> Arc<TokenBucket> {
        self.buckets
            .entry((provider.to_string(), resource.to_string()))
            .or_insert_with(|| Arc::new(TokenBucket::new(config)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            ..RetryPolicy::provider_default()
        };
        let calls = AtomicU32::new(0);

        let out = policy
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(NoemaError::transient("flaky"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(out.value, 2);
        assert_eq!(out.retries, 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let policy = RetryPolicy::provider_default();
        let calls = AtomicU32::new(0);

        let err = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(NoemaError::permanent("invalid key")) }
            })
            .await
            .unwrap_err();

        assert!(!err.retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_returns_last_error() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            ..RetryPolicy::provider_default()
        };
        let calls = AtomicU32::new(0);

        let err = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(NoemaError::transient("still down")) }
            })
            .await
            .unwrap_err();

        assert!(err.retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_retry_after_hint_retries_immediately() {
        let policy = RetryPolicy::provider_default();
        let calls = AtomicU32::new(0);

        let start = Instant::now();
        let out = policy
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(NoemaError::rate_limited("429", Duration::ZERO))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(out.retries, 1);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn bucket_allows_burst_then_throttles() {
        let bucket = TokenBucket::new(LimiterConfig {
            rate_per_sec: 1000.0,
            burst: 3.0,
        });

        let start = Instant::now();
        for _ in 0..3 {
            bucket.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));

        bucket.acquire().await;
        // Fourth acquisition had to wait for a refill tick.
        assert!(start.elapsed() >= Duration::from_micros(500));
    }

    #[tokio::test]
    async fn registry_shares_buckets_per_key() {
        let registry = RateLimiterRegistry::new();
        let a = registry.bucket("openai", "chat");
        let b = registry.bucket("openai", "chat");
        let c = registry.bucket("openai", "embed");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
