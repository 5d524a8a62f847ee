//! # Fleet Core
//!
//! The data model shared by every layer of the Fleet orchestrator.
//!
//! This crate has no runtime of its own. It defines:
//!
//! - **Definitions**: the immutable, declarative description of one bot
//!   ([`BotDefinition`], [`PluginSpec`], [`AccessRules`], [`RateLimitPolicy`])
//! - **Lifecycle states**: [`BotState`] and its transition table
//! - **Events**: what the messaging platform delivers ([`InboundEvent`]) and
//!   what a bot sends back ([`OutboundPayload`])
//! - **Collaborator contracts**: the messaging client ([`MessagingClient`]) and
//!   the persistence layer ([`SessionProvider`]) that the orchestrator drives
//!   but does not implement
//! - **Error taxonomy**: [`Phase`] and [`ErrorKind`], carried by every
//!   lifecycle error
//!
//! ```text
//! ┌──────────────┐   start_consuming   ┌────────────────┐
//! │ Orchestrator │────────────────────▶│ MessagingClient │──▶ EventStream
//! │   (runtime)  │◀────── send ────────│   (external)    │
//! └──────────────┘                     └────────────────┘
//! ```

pub mod client;
pub mod definition;
pub mod error;
pub mod event;
pub mod session;
pub mod state;

pub use client::{BoxedClient, EventStream, MessagingClient};
pub use definition::{
    AccessRules, BotDefinition, Credentials, DeliveryMode, PluginSpec, RateLimitPolicy,
};
pub use error::{ClientError, ErrorKind, Phase, SessionError};
pub use event::{EventKind, InboundEvent, OutboundPayload};
pub use session::{BoxedSession, NoopSessions, Session, SessionProvider};
pub use state::BotState;
