//! Dispatch — runs the middleware tiers and terminal routes for one request.
//!
//! ## Order
//!
//! 1. Resolve the request's [`MatchPlan`] (from the match cache when enabled).
//! 2. For every candidate terminal route, most specific first:
//!    1. global middleware, in registration order;
//!    2. path middleware, in registration order;
//!    3. the route's own callbacks.
//! 3. With no candidate at all, the two middleware tiers still run once.
//!
//! ## Continuation rules
//!
//! After each callback the dispatcher checks, in this order:
//!
//! | Condition                                   | Effect                                   |
//! |---------------------------------------------|------------------------------------------|
//! | returned `Err`, panicked or `next.fail(..)` | abort with [`DispatchError`]             |
//! | response headers sent                       | stop; nothing else runs                  |
//! | `next.skip()` in middleware                 | rest of the tier is skipped              |
//! | `next.skip()` in a terminal route           | move on to the next candidate route      |
//! | `next.proceed()` or no call                 | next callback                            |
//!
//! The last callback of the last candidate is special: returning without
//! calling `next` ends the dispatch as [`Outcome::Matched`], while calling
//! `next.proceed()` exhausts the candidates and yields [`Outcome::Unmatched`].

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::{debug, trace};

use super::route::{MatchQuery, MatchResult, Route, Specificity, subdomains};
use super::{DispatchError, Router};
use crate::cache::{CacheKey, MatchPlan, MiddlewareHit, TerminalHit};
use crate::context::{RouteRequest, RouteResponse};
use crate::http::Method;
use crate::middleware::{Callback, Next, Signal};

/// Everything [`Router::handle`] needs for one request.
pub struct HandleContext {
    /// Request host; the port is ignored.
    pub host: Option<String>,
    pub method: Method,
    /// Request target; the query string is ignored for matching.
    pub url: String,
    pub request: RouteRequest,
    pub response: RouteResponse,
}

impl HandleContext {
    /// Build a context from the request's own host, method and target.
    pub fn new(request: RouteRequest, response: RouteResponse) -> Self {
        Self {
            host: request.host().map(str::to_owned),
            method: request.method().clone(),
            url: request.target().to_owned(),
            request,
            response,
        }
    }
}

/// How a dispatch ended.
#[derive(Debug)]
pub enum Outcome {
    /// A terminal route handled the request.
    Matched(MatchResult),
    /// Middleware sent a response and no terminal route matched.
    Handled,
    /// Nothing sent a response and no terminal route claimed the request.
    Unmatched,
}

impl Outcome {
    pub fn matched(&self) -> Option<&MatchResult> {
        match self {
            Outcome::Matched(result) => Some(result),
            _ => None,
        }
    }

    pub fn is_unmatched(&self) -> bool {
        matches!(self, Outcome::Unmatched)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    GlobalMiddleware,
    PathMiddleware,
    TerminalRoute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Proceeded,
    Untouched,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Sent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteFlow {
    Finished,
    FallThrough,
}

impl Router {
    /// Dispatch one request through the middleware tiers and terminal routes.
    ///
    /// Never writes a default response: an [`Outcome::Unmatched`] or an `Err`
    /// is for the caller to turn into a 404 or 500.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Handler`] when a callback returns `Err` or calls
    /// [`Next::fail`]; [`DispatchError::Panicked`] when one panics. No later
    /// callback runs in either case.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use waypost::context::{RouteRequest, RouteResponse};
    /// use waypost::http::Request;
    /// use waypost::router::{HandleContext, Router};
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let mut router = Router::new();
    /// router.get("/users/:id", |req, res, _next| async move {
    ///     res.send(req.param("id").unwrap_or_default());
    ///     Ok(())
    /// }).unwrap();
    ///
    /// let (raw, _) = Request::parse(b"GET /users/7?full=1 HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap();
    /// let res = RouteResponse::new();
    /// let ctx = HandleContext::new(RouteRequest::new(raw), res.clone());
    ///
    /// let outcome = router.handle(ctx).await.unwrap();
    /// assert_eq!(outcome.matched().unwrap().params.get("id"), Some("7"));
    /// assert_eq!(res.body(), b"7");
    /// # }
    /// ```
    pub async fn handle(&self, ctx: HandleContext) -> Result<Outcome, DispatchError> {
        let HandleContext {
            host,
            method,
            url,
            request,
            response,
        } = ctx;

        let host = host.as_deref().and_then(normalize_host);
        let path = strip_query(&url);
        let query = MatchQuery {
            subdomain_offset: self.config.subdomain_offset,
            ..MatchQuery::new(host.as_deref(), &method, path)
        };

        request.set_subdomains(
            query
                .host
                .map(|host| subdomains(host, query.subdomain_offset))
                .unwrap_or_default(),
        );

        let plan = self.resolve(&query);
        trace!(
            method = %method,
            path,
            global = plan.global.len(),
            path_middleware = plan.path.len(),
            terminal = plan.terminal.len(),
            "dispatch plan resolved"
        );

        if plan.terminal.is_empty() {
            return match self.run_middleware(&plan, &request, &response).await? {
                Flow::Sent => Ok(Outcome::Handled),
                Flow::Continue => Ok(Outcome::Unmatched),
            };
        }

        let last = plan.terminal.len() - 1;
        for (position, hit) in plan.terminal.iter().enumerate() {
            let Some(route) = self.routes.get(hit.route) else {
                continue;
            };
            let matched =
                route.match_result(&query, hit.params.clone(), hit.host_params.clone());

            if self.run_middleware(&plan, &request, &response).await? == Flow::Sent {
                return Ok(Outcome::Matched(matched));
            }

            request.set_params(matched.params.clone());
            request.set_host_params(matched.host_params.clone());

            match run_route(&matched, position == last, &request, &response).await? {
                RouteFlow::Finished => {
                    debug!(route = matched.route, name = matched.name.as_deref(), "route matched");
                    return Ok(Outcome::Matched(matched));
                }
                RouteFlow::FallThrough => {
                    trace!(route = matched.route, "route passed to next candidate");
                }
            }
        }

        Ok(Outcome::Unmatched)
    }

    fn resolve(&self, query: &MatchQuery<'_>) -> Arc<MatchPlan> {
        if !self.config.cache_enabled {
            return Arc::new(self.plan(query));
        }

        let key = CacheKey::new(query.host, query.path, query.method.as_str());
        if let Some(plan) = self.cache.get(&key) {
            trace!(key = %key, "match cache hit");
            return plan;
        }

        let plan = Arc::new(self.plan(query));
        let stored = self.cache.insert(key.clone(), Arc::clone(&plan));
        debug!(key = %key, stored, "match cache miss");
        plan
    }

    fn plan(&self, query: &MatchQuery<'_>) -> MatchPlan {
        let globals = self.globals.get_or_init(|| {
            self.routes
                .iter()
                .filter(|route| route.is_global_middleware())
                .map(Route::index)
                .collect()
        });

        let global = globals
            .iter()
            .filter_map(|&index| self.routes.get(index))
            .filter_map(|route| middleware_hit(route, query))
            .collect();

        let path = self
            .routes
            .iter()
            .filter(|route| route.is_path_middleware())
            .filter_map(|route| middleware_hit(route, query))
            .collect();

        let mut terminal: Vec<(Specificity, TerminalHit)> = self
            .routes
            .iter()
            .filter(|route| route.is_terminal())
            .filter_map(|route| {
                let (params, host_params) = route.capture(query)?;
                let hit = TerminalHit {
                    route: route.index(),
                    params,
                    host_params,
                };
                Some((Specificity::of(route, query.host, query.method), hit))
            })
            .collect();
        // Stable: equal keys keep registration order.
        terminal.sort_by_key(|(specificity, _)| *specificity);

        MatchPlan {
            global,
            path,
            terminal: terminal.into_iter().map(|(_, hit)| hit).collect(),
        }
    }

    async fn run_middleware(
        &self,
        plan: &MatchPlan,
        req: &RouteRequest,
        res: &RouteResponse,
    ) -> Result<Flow, DispatchError> {
        for (stage, hits) in [
            (Stage::GlobalMiddleware, &plan.global),
            (Stage::PathMiddleware, &plan.path),
        ] {
            if self.run_tier(stage, hits, req, res).await? == Flow::Sent {
                return Ok(Flow::Sent);
            }
        }
        Ok(Flow::Continue)
    }

    async fn run_tier(
        &self,
        stage: Stage,
        hits: &[MiddlewareHit],
        req: &RouteRequest,
        res: &RouteResponse,
    ) -> Result<Flow, DispatchError> {
        for hit in hits {
            let Some(route) = self.routes.get(hit.route) else {
                continue;
            };
            req.set_params(hit.params.clone());
            req.set_host_params(hit.host_params.clone());

            for &position in &hit.callbacks {
                let Some(callback) = route.callbacks().get(position) else {
                    continue;
                };
                trace!(?stage, route = hit.route, callback = position, "invoking callback");
                let step = invoke(callback, req, res).await?;

                if res.headers_sent() {
                    debug!(?stage, route = hit.route, "response sent by middleware");
                    return Ok(Flow::Sent);
                }
                if step == Step::Skipped {
                    trace!(?stage, route = hit.route, "tier skipped");
                    return Ok(Flow::Continue);
                }
            }
        }
        Ok(Flow::Continue)
    }
}

fn middleware_hit(route: &Route, query: &MatchQuery<'_>) -> Option<MiddlewareHit> {
    let (params, host_params) = route.capture(query)?;
    Some(MiddlewareHit {
        route: route.index(),
        callbacks: (0..route.callbacks().len()).collect(),
        params,
        host_params,
    })
}

async fn run_route(
    matched: &MatchResult,
    last_candidate: bool,
    req: &RouteRequest,
    res: &RouteResponse,
) -> Result<RouteFlow, DispatchError> {
    let count = matched.callbacks.len();
    for (position, callback) in matched.callbacks.iter().enumerate() {
        trace!(
            stage = ?Stage::TerminalRoute,
            route = matched.route,
            callback = position,
            "invoking callback"
        );
        let step = invoke(callback, req, res).await?;

        if res.headers_sent() {
            return Ok(RouteFlow::Finished);
        }
        match step {
            Step::Skipped => return Ok(RouteFlow::FallThrough),
            Step::Untouched if last_candidate && position + 1 == count => {
                return Ok(RouteFlow::Finished);
            }
            Step::Untouched | Step::Proceeded => {}
        }
    }
    Ok(RouteFlow::FallThrough)
}

/// Run one callback to completion and read back its continuation.
async fn invoke(
    callback: &Callback,
    req: &RouteRequest,
    res: &RouteResponse,
) -> Result<Step, DispatchError> {
    let next = Next::new();

    let future = panic::catch_unwind(AssertUnwindSafe(|| {
        callback(req.clone(), res.clone(), next.clone())
    }))
    .map_err(|payload| DispatchError::Panicked(panic_message(&*payload)))?;

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return Err(DispatchError::Handler(err)),
        Err(payload) => return Err(DispatchError::Panicked(panic_message(&*payload))),
    }

    match next.take_signal() {
        None => Ok(Step::Untouched),
        Some(Signal::Continue) => Ok(Step::Proceeded),
        Some(Signal::SkipTier) => Ok(Step::Skipped),
        Some(Signal::Abort(err)) => Err(DispatchError::Handler(err)),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Lowercased host with any port removed; `None` when empty.
fn normalize_host(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let host = if raw.starts_with('[') {
        raw.find(']').map_or(raw, |end| &raw[..=end])
    } else {
        raw.split_once(':').map_or(raw, |(host, _)| host)
    };
    (!host.is_empty()).then(|| host.to_ascii_lowercase())
}

fn strip_query(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}
