//! Test doubles shared by the framework's unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tower::BoxError;

use fleet_core::{
    AccessRules, ClientError, Credentials, DeliveryMode, EventStream, InboundEvent,
    MessagingClient, OutboundPayload,
};

use crate::context::EventContext;
use crate::matcher::Matcher;

/// Records every outbound payload; never produces events.
#[derive(Default)]
pub struct RecordingClient {
    pub sent: Mutex<Vec<(String, OutboundPayload)>>,
}

#[async_trait]
impl MessagingClient for RecordingClient {
    async fn start_consuming(
        &self,
        _bot_id: &str,
        _credentials: &Credentials,
        _mode: DeliveryMode,
    ) -> Result<EventStream, ClientError> {
        Ok(Box::pin(stream::pending()))
    }

    async fn stop_consuming(&self, _bot_id: &str) -> Result<(), ClientError> {
        Ok(())
    }

    async fn send(&self, bot_id: &str, payload: OutboundPayload) -> Result<(), ClientError> {
        self.sent.lock().push((bot_id.to_string(), payload));
        Ok(())
    }
}

pub fn ctx_for(event: InboundEvent) -> EventContext {
    EventContext::new(
        event,
        Arc::new(RecordingClient::default()),
        Arc::new(AccessRules::default()),
        CancellationToken::new(),
    )
}

pub fn noop_handler(m: Matcher) -> Matcher {
    m.handler(|_ctx| async { Ok::<_, BoxError>(()) })
}
