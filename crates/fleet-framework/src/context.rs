//! Per-event context handed to handlers.
//!
//! One [`EventContext`] is created for every inbound event and shared (via
//! `Arc`) by the middleware chain and the matched handler. It carries:
//!
//! - the event itself and the id of the bot that received it
//! - the bot's access rules (for [`is_admin`](EventContext::is_admin))
//! - the scoped persistence session, attached by the session middleware
//! - the runtime's cancellation token, checked before every outbound send

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use fleet_core::{AccessRules, BoxedClient, BoxedSession, InboundEvent, OutboundPayload, Session};

use crate::error::SendError;

pub struct EventContext {
    event: InboundEvent,
    client: BoxedClient,
    access: Arc<AccessRules>,
    cancel: CancellationToken,
    session: Mutex<Option<BoxedSession>>,
}

impl EventContext {
    pub fn new(
        event: InboundEvent,
        client: BoxedClient,
        access: Arc<AccessRules>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            event,
            client,
            access,
            cancel,
            session: Mutex::new(None),
        }
    }

    // ─── Event ───────────────────────────────────────────────────────────────

    pub fn event(&self) -> &InboundEvent {
        &self.event
    }

    pub fn bot_id(&self) -> &str {
        &self.event.bot_id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.event.user_id.as_deref()
    }

    pub fn text(&self) -> Option<&str> {
        self.event.text()
    }

    /// See [`InboundEvent::command`].
    pub fn command(&self) -> Option<(&str, &str)> {
        self.event.command()
    }

    /// Returns `true` if the sender is listed in the bot's `admin_users`.
    pub fn is_admin(&self) -> bool {
        self.user_id().is_some_and(|u| self.access.is_admin(u))
    }

    // ─── Cancellation / outbound ─────────────────────────────────────────────

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Sends `payload` through the messaging client.
    ///
    /// Refused once the runtime serving this event has been cancelled.
    pub async fn send(&self, payload: OutboundPayload) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            debug!(bot_id = %self.bot_id(), "Dropping outbound message after cancellation");
            return Err(SendError::Cancelled(self.bot_id().to_string()));
        }
        self.client.send(self.bot_id(), payload).await?;
        Ok(())
    }

    /// Sends `text` to the chat the event came from.
    pub async fn reply(&self, text: impl Into<String>) -> Result<(), SendError> {
        let chat = self.event.chat_id.clone().ok_or(SendError::NoChat)?;
        self.send(OutboundPayload::text(chat, text)).await
    }

    // ─── Session ─────────────────────────────────────────────────────────────

    /// Runs `f` against the scoped session, if one is attached.
    pub fn with_session<R>(&self, f: impl FnOnce(&dyn Session) -> R) -> Option<R> {
        let guard = self.session.lock();
        guard.as_ref().map(|session| f(session.as_ref()))
    }

    pub fn has_session(&self) -> bool {
        self.session.lock().is_some()
    }

    pub(crate) fn attach_session(&self, session: BoxedSession) {
        *self.session.lock() = Some(session);
    }

    /// Drops the attached session, releasing it.
    pub(crate) fn release_session(&self) {
        let released = self.session.lock().take();
        drop(released);
    }
}

impl fmt::Debug for EventContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventContext")
            .field("event", &self.event)
            .field("cancelled", &self.is_cancelled())
            .field("has_session", &self.has_session())
            .finish_non_exhaustive()
    }
}
