//! The messaging-platform client contract.
//!
//! Fleet never talks to a platform directly. A [`MessagingClient`] owns the
//! connection (long polling, webhook registration, ...) and hands the
//! orchestrator a stream of events per bot.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::definition::{Credentials, DeliveryMode};
use crate::error::ClientError;
use crate::event::{InboundEvent, OutboundPayload};

/// Stream of updates for one bot.
///
/// An `Err` item or the end of the stream while the bot is supposed to be
/// running is treated as a runtime fault by the supervisor.
pub type EventStream = BoxStream<'static, Result<InboundEvent, ClientError>>;

/// Type alias for a shared messaging client.
pub type BoxedClient = Arc<dyn MessagingClient>;

/// Connection to the messaging platform, shared by every managed bot.
///
/// Implementations must key all state by `bot_id`: calls for different bots
/// may run concurrently.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Begins receiving updates for `bot_id` and returns the event stream.
    async fn start_consuming(
        &self,
        bot_id: &str,
        credentials: &Credentials,
        mode: DeliveryMode,
    ) -> Result<EventStream, ClientError>;

    /// Stops receiving updates for `bot_id`. Idempotent.
    async fn stop_consuming(&self, bot_id: &str) -> Result<(), ClientError>;

    /// Sends `payload` on behalf of `bot_id`.
    async fn send(&self, bot_id: &str, payload: OutboundPayload) -> Result<(), ClientError>;
}
