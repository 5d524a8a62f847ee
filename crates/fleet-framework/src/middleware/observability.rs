//! Outermost layer: one tracing span per event, timing, and counters.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tokio::time::Instant;
use tower::{BoxError, Layer, Service};
use tracing::{Instrument, debug, error, info_span};
use uuid::Uuid;

use crate::context::EventContext;
use crate::router::Outcome;

/// Per-runtime event counters.
#[derive(Debug, Default)]
pub struct DispatchStats {
    received: AtomicU64,
    handled: AtomicU64,
    unmatched: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
}

impl DispatchStats {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    pub fn unmatched(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Counts a handler that panicked outside the middleware's view.
    pub fn record_panic(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, result: &Result<Outcome, BoxError>) {
        let counter = match result {
            Ok(Outcome::Handled { .. }) => &self.handled,
            Ok(Outcome::Unmatched) => &self.unmatched,
            Ok(Outcome::Rejected(_)) => &self.rejected,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone)]
pub struct ObservabilityLayer {
    stats: Arc<DispatchStats>,
}

impl ObservabilityLayer {
    pub fn new(stats: Arc<DispatchStats>) -> Self {
        Self { stats }
    }
}

impl<S> Layer<S> for ObservabilityLayer {
    type Service = ObservabilityService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ObservabilityService {
            inner,
            stats: Arc::clone(&self.stats),
        }
    }
}

#[derive(Clone)]
pub struct ObservabilityService<S> {
    inner: S,
    stats: Arc<DispatchStats>,
}

impl<S> Service<Arc<EventContext>> for ObservabilityService<S>
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
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let stats = Arc::clone(&self.stats);

        let request_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let span = info_span!(
            "event",
            bot_id = %ctx.bot_id(),
            request_id = %request_id,
            kind = ?ctx.event().kind,
            user_id = ctx.user_id().unwrap_or("-"),
        );

        Box::pin(
            async move {
                stats.received.fetch_add(1, Ordering::Relaxed);
                let started = Instant::now();
                let result = inner.call(ctx).await;
                let elapsed_ms = started.elapsed().as_millis() as u64;
                stats.record(&result);

                match &result {
                    Ok(outcome) => debug!(elapsed_ms, ?outcome, "Event processed"),
                    Err(e) => error!(elapsed_ms, error = %e, error_id = %request_id, "Event failed"),
                }
                result
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use tower::{ServiceBuilder, ServiceExt};

    use super::*;
    use crate::testing::ctx_for;
    use fleet_core::InboundEvent;

    #[tokio::test]
    async fn test_counts_outcomes_and_failures() {
        let stats = Arc::new(DispatchStats::default());
        let ok = ServiceBuilder::new()
            .layer(ObservabilityLayer::new(Arc::clone(&stats)))
            .service_fn(|_ctx: Arc<EventContext>| async { Ok::<_, BoxError>(Outcome::Unmatched) });
        let failing = ServiceBuilder::new()
            .layer(ObservabilityLayer::new(Arc::clone(&stats)))
            .service_fn(|_ctx: Arc<EventContext>| async { Err::<Outcome, BoxError>("boom".into()) });

        let event = || Arc::new(ctx_for(InboundEvent::message("b", "u", "c", "hi")));
        ok.clone().oneshot(event()).await.unwrap();
        ok.oneshot(event()).await.unwrap();
        assert!(failing.oneshot(event()).await.is_err());

        assert_eq!(stats.received(), 3);
        assert_eq!(stats.unmatched(), 2);
        assert_eq!(stats.failed(), 1);
        assert_eq!(stats.handled(), 0);
    }
}
