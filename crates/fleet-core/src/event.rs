//! Platform-neutral inbound events and outbound payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What kind of update the platform delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A text message.
    Message,
    /// A button press or other inline callback; `text` holds the payload.
    Callback,
    /// Membership changes, edits, and anything else.
    Other,
}

/// One update received by a bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub bot_id: String,
    pub kind: EventKind,
    pub user_id: Option<String>,
    pub chat_id: Option<String>,
    pub text: Option<String>,
    /// The untouched platform payload.
    #[serde(default)]
    pub raw: Value,
}

impl InboundEvent {
    /// Creates a text message event.
    pub fn message(
        bot_id: impl Into<String>,
        user_id: impl Into<String>,
        chat_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            bot_id: bot_id.into(),
            kind: EventKind::Message,
            user_id: Some(user_id.into()),
            chat_id: Some(chat_id.into()),
            text: Some(text.into()),
            raw: Value::Null,
        }
    }

    /// Creates a callback event carrying `data`.
    pub fn callback(
        bot_id: impl Into<String>,
        user_id: impl Into<String>,
        chat_id: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            kind: EventKind::Callback,
            ..Self::message(bot_id, user_id, chat_id, data)
        }
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// Splits a `/command args` message into `("command", "args")`.
    ///
    /// A `@botname` suffix on the command is dropped. Returns `None` for
    /// non-message events and for text that does not start with `/`.
    pub fn command(&self) -> Option<(&str, &str)> {
        if self.kind != EventKind::Message {
            return None;
        }
        let body = self.text()?.trim_start().strip_prefix('/')?;
        let (head, args) = match body.split_once(char::is_whitespace) {
            Some((head, args)) => (head, args.trim()),
            None => (body, ""),
        };
        let name = head.split('@').next().unwrap_or(head);
        if name.is_empty() {
            return None;
        }
        Some((name, args))
    }
}

/// A message a bot sends back through the messaging client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundPayload {
    pub chat_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Platform-specific extras such as keyboards or parse modes.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub extra: Value,
}

impl OutboundPayload {
    pub fn text(chat_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            text: text.into(),
            reply_to: None,
            extra: Value::Null,
        }
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = extra;
        self
    }
}
