//! Matchers: a predicate paired with one handler.
//!
//! A plugin contributes an ordered list of [`Matcher`]s. When the runtime is
//! built, the matchers of all plugins are flattened, in dependency order, into
//! a [`HandlerGraph`](crate::router::HandlerGraph). The first matcher whose
//! checks all pass handles the event; nothing after it runs.
//!
//! ```rust,ignore
//! use fleet_framework::matcher::{on_command, on_message};
//!
//! let help = on_command("help").handler(|ctx| async move {
//!     ctx.reply("Available commands: /start /help").await
//! });
//!
//! let fallback = on_message().handler(|ctx| async move {
//!     ctx.reply("Unknown command").await
//! });
//! ```

use std::future::Future;
use std::sync::Arc;

use tower::util::BoxCloneSyncService;
use tower::{BoxError, Service};

use fleet_core::EventKind;

use crate::context::EventContext;

/// A type-erased check function.
pub type CheckFn = Arc<dyn Fn(&EventContext) -> bool + Send + Sync>;

/// A type-erased handler service.
pub type HandlerService = BoxCloneSyncService<Arc<EventContext>, (), BoxError>;

#[derive(Clone, Default)]
struct MatcherInner {
    name: Option<String>,
    /// All must pass. No checks matches every event.
    checks: Vec<CheckFn>,
    handler: Option<HandlerService>,
}

/// A predicate→handler pair.
///
/// Cheap to clone; builder methods copy-on-write the shared inner state.
#[derive(Clone, Default)]
pub struct Matcher {
    inner: Arc<MatcherInner>,
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner_mut(&mut self) -> &mut MatcherInner {
        Arc::make_mut(&mut self.inner)
    }

    /// Sets a name shown in logs and status output.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.inner_mut().name = Some(name.into());
        self
    }

    /// Adds a check. Checks are combined with AND.
    pub fn check<F>(mut self, f: F) -> Self
    where
        F: Fn(&EventContext) -> bool + Send + Sync + 'static,
    {
        self.inner_mut().checks.push(Arc::new(f));
        self
    }

    /// Restricts the matcher to users listed in `admin_users`.
    pub fn admin_only(self) -> Self {
        self.check(EventContext::is_admin)
    }

    /// Sets the handler from an async function.
    pub fn handler<F, Fut, E>(self, f: F) -> Self
    where
        F: Fn(Arc<EventContext>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let svc = tower::service_fn(move |ctx: Arc<EventContext>| {
            let f = f.clone();
            async move { f(ctx).await.map_err(Into::<BoxError>::into) }
        });
        self.service(svc)
    }

    /// Sets the handler from any tower service, e.g. one wrapped in layers.
    pub fn service<S>(mut self, svc: S) -> Self
    where
        S: Service<Arc<EventContext>, Response = (), Error = BoxError>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        self.inner_mut().handler = Some(BoxCloneSyncService::new(svc));
        self
    }

    /// Returns `true` if every check passes and a handler is set.
    pub fn matches(&self, ctx: &EventContext) -> bool {
        self.inner.handler.is_some() && self.inner.checks.iter().all(|check| check(ctx))
    }

    pub fn get_name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub(crate) fn handler_service(&self) -> Option<HandlerService> {
        self.inner.handler.clone()
    }
}

impl std::fmt::Debug for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matcher")
            .field("name", &self.inner.name)
            .field("checks", &self.inner.checks.len())
            .field("has_handler", &self.inner.handler.is_some())
            .finish()
    }
}

// =============================================================================
// Convenience constructors
// =============================================================================

/// Matches `/name` commands (with or without `@botname`).
pub fn on_command(name: impl Into<String>) -> Matcher {
    let name = name.into();
    Matcher::new()
        .name(format!("/{name}"))
        .check(move |ctx| ctx.command().is_some_and(|(cmd, _)| cmd == name))
}

/// Matches every text message, commands included.
pub fn on_message() -> Matcher {
    Matcher::new()
        .name("message")
        .check(|ctx| ctx.event().kind == EventKind::Message && ctx.text().is_some())
}

/// Matches callbacks whose data starts with `prefix`.
pub fn on_callback(prefix: impl Into<String>) -> Matcher {
    let prefix = prefix.into();
    Matcher::new()
        .name(format!("callback:{prefix}"))
        .check(move |ctx| {
            ctx.event().kind == EventKind::Callback
                && ctx.text().is_some_and(|data| data.starts_with(&prefix))
        })
}

/// Matches every event.
pub fn on_any() -> Matcher {
    Matcher::new().name("any")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ctx_for, noop_handler};
    use fleet_core::InboundEvent;

    #[test]
    fn test_matcher_without_handler_never_matches() {
        let ctx = ctx_for(InboundEvent::message("b", "u", "c", "/help"));
        assert!(!on_command("help").matches(&ctx));
        assert!(noop_handler(on_command("help")).matches(&ctx));
    }

    #[test]
    fn test_on_command_ignores_other_commands_and_plain_text() {
        let m = noop_handler(on_command("start"));
        assert!(m.matches(&ctx_for(InboundEvent::message("b", "u", "c", "/start now"))));
        assert!(!m.matches(&ctx_for(InboundEvent::message("b", "u", "c", "/starts"))));
        assert!(!m.matches(&ctx_for(InboundEvent::message("b", "u", "c", "start"))));
    }

    #[test]
    fn test_on_callback_prefix() {
        let m = noop_handler(on_callback("menu:"));
        assert!(m.matches(&ctx_for(InboundEvent::callback("b", "u", "c", "menu:open"))));
        assert!(!m.matches(&ctx_for(InboundEvent::message("b", "u", "c", "menu:open"))));
    }

    #[test]
    fn test_checks_are_combined_with_and() {
        let m = noop_handler(on_message().check(|ctx| ctx.user_id() == Some("u1")));
        assert!(m.matches(&ctx_for(InboundEvent::message("b", "u1", "c", "hi"))));
        assert!(!m.matches(&ctx_for(InboundEvent::message("b", "u2", "c", "hi"))));
    }

    #[test]
    fn test_builder_does_not_mutate_clones() {
        let base = on_any();
        let named = base.clone().name("other");
        assert_eq!(base.get_name(), Some("any"));
        assert_eq!(named.get_name(), Some("other"));
    }
}
