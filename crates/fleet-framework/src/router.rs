//! The handler graph and the first-match-wins router.
//!
//! [`HandlerGraph`] is the flattened, ordered list of routes contributed by a
//! runtime's plugins. Registration order equals plugin dependency order, so a
//! plugin's handlers are always consulted after those of the plugins it
//! depends on.
//!
//! [`Router`] is the innermost tower service of every runtime's middleware
//! chain. It drops events once the runtime is cancelled, rejects users the
//! bot's access rules exclude, then walks the routes and hands the event to
//! the first matching one.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tower::{BoxError, Service, ServiceExt};
use tracing::{debug, trace};

use fleet_core::AccessRules;

use crate::context::EventContext;
use crate::error::{EventSkipped, HandlerFailed};
use crate::matcher::Matcher;

// =============================================================================
// Outcome
// =============================================================================

/// Why an event was dropped before reaching a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The sender is blocked or not on the allow list.
    AccessDenied,
    /// The sender exceeded the bot's rate-limit policy.
    RateLimited,
    /// The runtime was cancelled before the event was processed.
    Cancelled,
}

/// The result of running one event through a runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Handled { plugin: String, route: String },
    Unmatched,
    Rejected(Rejection),
}

// =============================================================================
// HandlerGraph
// =============================================================================

#[derive(Clone)]
pub struct Route {
    plugin: Arc<str>,
    name: Arc<str>,
    matcher: Matcher,
}

impl Route {
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.plugin, self.name)
    }
}

/// Ordered predicate→handler routes. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct HandlerGraph {
    routes: Arc<[Route]>,
}

impl HandlerGraph {
    pub fn builder() -> HandlerGraphBuilder {
        HandlerGraphBuilder::default()
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[derive(Default)]
pub struct HandlerGraphBuilder {
    routes: Vec<Route>,
}

impl HandlerGraphBuilder {
    /// Appends `plugin`'s matchers, keeping their order.
    pub fn extend(&mut self, plugin: &str, matchers: &[Matcher]) -> &mut Self {
        let plugin: Arc<str> = Arc::from(plugin);
        for (i, matcher) in matchers.iter().enumerate() {
            let name = matcher
                .get_name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("#{i}"));
            self.routes.push(Route {
                plugin: Arc::clone(&plugin),
                name: Arc::from(name),
                matcher: matcher.clone(),
            });
        }
        self
    }

    pub fn build(self) -> HandlerGraph {
        HandlerGraph {
            routes: self.routes.into(),
        }
    }
}

// =============================================================================
// Router
// =============================================================================

/// Innermost service: cancellation and access checks, then first-match-wins
/// dispatch.
#[derive(Clone)]
pub struct Router {
    graph: HandlerGraph,
    access: Arc<AccessRules>,
}

impl Router {
    pub fn new(graph: HandlerGraph, access: Arc<AccessRules>) -> Self {
        Self { graph, access }
    }
}

impl Service<Arc<EventContext>> for Router {
    type Response = Outcome;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Outcome, BoxError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, ctx: Arc<EventContext>) -> Self::Future {
        let graph = self.graph.clone();
        let access = Arc::clone(&self.access);

        Box::pin(async move {
            if ctx.is_cancelled() {
                debug!(bot_id = %ctx.bot_id(), "Runtime cancelled, dropping event");
                return Ok(Outcome::Rejected(Rejection::Cancelled));
            }

            if let Some(user) = ctx.user_id()
                && !access.permits(user)
            {
                debug!(bot_id = %ctx.bot_id(), user_id = %user, "Access denied");
                return Ok(Outcome::Rejected(Rejection::AccessDenied));
            }

            for route in graph.routes() {
                if !route.matcher.matches(&ctx) {
                    continue;
                }
                let Some(handler) = route.matcher.handler_service() else {
                    continue;
                };
                match handler.oneshot(Arc::clone(&ctx)).await {
                    Ok(()) => {
                        return Ok(Outcome::Handled {
                            plugin: route.plugin.to_string(),
                            route: route.name.to_string(),
                        });
                    }
                    Err(e) if e.is::<EventSkipped>() => {
                        trace!(plugin = %route.plugin, route = %route.name, "Handler skipped event");
                    }
                    Err(e) => {
                        return Err(Box::new(HandlerFailed {
                            plugin: route.plugin.to_string(),
                            route: route.name.to_string(),
                            source: e,
                        }) as BoxError);
                    }
                }
            }

            Ok(Outcome::Unmatched)
        })
    }
}
