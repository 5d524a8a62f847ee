//! Token-bucket rate limiting per (bot, user).
//!
//! A single [`RateLimiter`] is shared by every runtime in the process, so
//! hot-reloading a bot does not hand its users a fresh burst. Buckets live in
//! a [`DashMap`]: contention is per key, there is no global lock, and no
//! entry guard is ever held across an `.await`.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::time::Instant;
use tower::{BoxError, Layer, Service};
use tracing::{debug, trace};

use fleet_core::RateLimitPolicy;

use crate::context::EventContext;
use crate::router::{Outcome, Rejection};

type BucketKey = (String, String);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: DashMap<BucketKey, Bucket>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes one token from the (bot, user) bucket. Returns `false` when the
    /// bucket is empty.
    pub fn check(&self, bot_id: &str, user_id: &str, policy: &RateLimitPolicy) -> bool {
        if !policy.enabled {
            return true;
        }
        let now = Instant::now();
        let capacity = f64::from(policy.burst.max(1));

        let mut bucket = self
            .buckets
            .entry((bot_id.to_string(), user_id.to_string()))
            .or_insert_with(|| Bucket {
                tokens: capacity,
                last_refill: now,
            });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * policy.refill_per_sec()).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drops buckets untouched for at least `max_idle`. Returns how many were
    /// removed.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_refill) < max_idle);
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed, "Evicted idle rate-limit buckets");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

// =============================================================================
// Layer
// =============================================================================

#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
    policy: Arc<RateLimitPolicy>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<RateLimiter>, policy: RateLimitPolicy) -> Self {
        Self {
            limiter,
            policy: Arc::new(policy),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: Arc::clone(&self.limiter),
            policy: Arc::clone(&self.policy),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
    policy: Arc<RateLimitPolicy>,
}

impl<S> Service<Arc<EventContext>> for RateLimitService<S>
where
    S: Service<Arc<EventContext>, Response = Outcome, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Outcome;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Outcome, BoxError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, ctx: Arc<EventContext>) -> Self::Future {
        let allowed = match ctx.user_id() {
            Some(user) => self.limiter.check(ctx.bot_id(), user, &self.policy),
            None => true,
        };

        if !allowed {
            let notice = self.policy.notice.clone();
            return Box::pin(async move {
                debug!(bot_id = %ctx.bot_id(), user_id = ?ctx.user_id(), "Rate limit exceeded");
                if let Some(notice) = notice
                    && let Err(e) = ctx.reply(notice).await
                {
                    trace!(error = %e, "Could not deliver rate-limit notice");
                }
                Ok(Outcome::Rejected(Rejection::RateLimited))
            });
        }

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move { inner.call(ctx).await })
    }
}

#[cfg(test)]
mod tests {
    use tower::{ServiceBuilder, ServiceExt};

    use super::*;
    use crate::testing::ctx_for;
    use fleet_core::InboundEvent;

    fn policy(rate: u32, burst: u32) -> RateLimitPolicy {
        RateLimitPolicy {
            rate,
            burst,
            period_secs: 60,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_refill() {
        let limiter = RateLimiter::new();
        let policy = policy(60, 3);

        for _ in 0..3 {
            assert!(limiter.check("bot", "alice", &policy));
        }
        assert!(!limiter.check("bot", "alice", &policy));

        // 60 per minute refills one token per second.
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.check("bot", "alice", &policy));
        assert!(!limiter.check("bot", "alice", &policy));
    }

    #[tokio::test(start_paused = true)]
    async fn test_buckets_are_per_bot_and_user() {
        let limiter = RateLimiter::new();
        let policy = policy(1, 1);

        assert!(limiter.check("a", "alice", &policy));
        assert!(!limiter.check("a", "alice", &policy));
        assert!(limiter.check("a", "bob", &policy));
        assert!(limiter.check("b", "alice", &policy));
        assert_eq!(limiter.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_policy_never_limits() {
        let limiter = RateLimiter::new();
        let policy = RateLimitPolicy::disabled();
        for _ in 0..100 {
            assert!(limiter.check("a", "alice", &policy));
        }
        assert!(limiter.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_idle_buckets() {
        let limiter = RateLimiter::new();
        let policy = policy(30, 10);
        limiter.check("a", "old", &policy);
        tokio::time::advance(Duration::from_secs(400)).await;
        limiter.check("a", "fresh", &policy);

        assert_eq!(limiter.sweep_idle(Duration::from_secs(300)), 1);
        assert_eq!(limiter.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_layer_rejects_over_burst() {
        let limiter = Arc::new(RateLimiter::new());
        let svc = ServiceBuilder::new()
            .layer(RateLimitLayer::new(Arc::clone(&limiter), policy(1, 1)))
            .service_fn(|_ctx: Arc<EventContext>| async {
                Ok::<_, BoxError>(Outcome::Unmatched)
            });

        let event = || Arc::new(ctx_for(InboundEvent::message("b", "alice", "c", "hi")));
        assert_eq!(svc.clone().oneshot(event()).await.unwrap(), Outcome::Unmatched);
        assert_eq!(
            svc.oneshot(event()).await.unwrap(),
            Outcome::Rejected(Rejection::RateLimited)
        );
    }
}
