//! Acquires one persistence session per event and releases it afterwards.

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tower::{BoxError, Layer, Service};

use fleet_core::SessionProvider;

use crate::context::EventContext;
use crate::router::Outcome;

#[derive(Clone)]
pub struct SessionScopeLayer {
    provider: Arc<dyn SessionProvider>,
}

impl SessionScopeLayer {
    pub fn new(provider: Arc<dyn SessionProvider>) -> Self {
        Self { provider }
    }
}

impl<S> Layer<S> for SessionScopeLayer {
    type Service = SessionScopeService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SessionScopeService {
            inner,
            provider: Arc::clone(&self.provider),
        }
    }
}

#[derive(Clone)]
pub struct SessionScopeService<S> {
    inner: S,
    provider: Arc<dyn SessionProvider>,
}

/// Releases the context's session when dropped, so the session is returned
/// even if the inner future errors, panics, or is dropped mid-flight.
struct ScopeGuard(Arc<EventContext>);

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.0.release_session();
    }
}

impl<S> Service<Arc<EventContext>> for SessionScopeService<S>
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
        let provider = Arc::clone(&self.provider);

        Box::pin(async move {
            let session = provider.acquire_scoped_session(ctx.bot_id()).await?;
            ctx.attach_session(session);
            let _guard = ScopeGuard(Arc::clone(&ctx));
            inner.call(ctx).await
        })
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tower::{ServiceBuilder, ServiceExt};

    use super::*;
    use crate::testing::ctx_for;
    use fleet_core::{BoxedSession, InboundEvent, Session, SessionError};

    #[derive(Default)]
    struct CountingProvider {
        open: Arc<AtomicUsize>,
    }

    #[derive(Debug)]
    struct CountedSession(Arc<AtomicUsize>);

    impl Session for CountedSession {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    impl Drop for CountedSession {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl SessionProvider for CountingProvider {
        async fn acquire_scoped_session(&self, _bot_id: &str) -> Result<BoxedSession, SessionError> {
            self.open.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountedSession(Arc::clone(&self.open))))
        }
    }

    #[tokio::test]
    async fn test_session_visible_to_handler_and_released_on_error() {
        let provider = CountingProvider::default();
        let open = Arc::clone(&provider.open);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_handler = Arc::clone(&seen);

        let svc = ServiceBuilder::new()
            .layer(SessionScopeLayer::new(Arc::new(provider)))
            .service_fn(move |ctx: Arc<EventContext>| {
                let seen = Arc::clone(&seen_in_handler);
                async move {
                    if ctx.has_session() {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                    Err::<Outcome, BoxError>("handler failed".into())
                }
            });

        let ctx = Arc::new(ctx_for(InboundEvent::message("b", "u", "c", "hi")));
        assert!(svc.oneshot(Arc::clone(&ctx)).await.is_err());

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(open.load(Ordering::SeqCst), 0);
        assert!(!ctx.has_session());
    }

    struct Unavailable;

    #[async_trait]
    impl SessionProvider for Unavailable {
        async fn acquire_scoped_session(&self, _bot_id: &str) -> Result<BoxedSession, SessionError> {
            Err(SessionError::Unavailable("db down".into()))
        }
    }

    #[tokio::test]
    async fn test_acquire_failure_fails_event() {
        let svc = ServiceBuilder::new()
            .layer(SessionScopeLayer::new(Arc::new(Unavailable)))
            .service_fn(|_ctx: Arc<EventContext>| async { Ok::<_, BoxError>(Outcome::Unmatched) });

        let err = svc
            .oneshot(Arc::new(ctx_for(InboundEvent::message("b", "u", "c", "hi"))))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("db down"));
    }
}
