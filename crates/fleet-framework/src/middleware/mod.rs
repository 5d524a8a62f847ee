//! The fixed middleware chain wrapping every runtime's router.
//!
//! ```text
//! event ──► Observability ──► SessionScope ──► RateLimit ──► Router ──► handler
//! ```
//!
//! Each layer is an ordinary tower [`Layer`](tower::Layer); the order is
//! fixed by [`RuntimeBuilder`](crate::RuntimeBuilder) and not configurable.

pub mod observability;
pub mod rate_limit;
pub mod session;

pub use observability::{DispatchStats, ObservabilityLayer, ObservabilityService};
pub use rate_limit::{RateLimitLayer, RateLimitService, RateLimiter};
pub use session::{SessionScopeLayer, SessionScopeService};
