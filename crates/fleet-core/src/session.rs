//! The persistence-layer contract.
//!
//! Each inbound event runs inside one scoped session. The session is released
//! by dropping it, which the session middleware guarantees on every exit path
//! (success, error, panic, cancellation).

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SessionError;

/// A unit of work in the persistence layer.
///
/// Dropping the session releases it. Handlers reach the concrete type through
/// [`Session::as_any`].
pub trait Session: Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
}

pub type BoxedSession = Box<dyn Session>;

/// Hands out scoped sessions.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn acquire_scoped_session(&self, bot_id: &str) -> Result<BoxedSession, SessionError>;
}

/// A provider for deployments without a persistence layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSessions;

#[derive(Debug)]
struct NoopSession;

impl Session for NoopSession {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
impl SessionProvider for NoopSessions {
    async fn acquire_scoped_session(&self, _bot_id: &str) -> Result<BoxedSession, SessionError> {
        Ok(Box::new(NoopSession))
    }
}

impl NoopSessions {
    pub fn shared() -> Arc<dyn SessionProvider> {
        Arc::new(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_provider_always_succeeds() {
        let provider = NoopSessions::shared();
        let session = provider.acquire_scoped_session("a").await.unwrap();
        assert!(session.as_any().downcast_ref::<NoopSession>().is_some());
    }
}
