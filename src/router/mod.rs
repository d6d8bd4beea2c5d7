//! Request routing — route table, registration helpers and dispatch.
//!
//! A [`Router`] stores routes in registration order. Each route is one of
//! three kinds (see [`RouteKind`]):
//!
//! | Registered with                 | Kind             | Runs for                          |
//! |---------------------------------|------------------|-----------------------------------|
//! | [`Router::middleware`]          | global middleware| every request                     |
//! | [`Router::middleware_at`]       | path middleware  | any method under a path prefix    |
//! | [`Router::get`], [`Router::all`], … | terminal route | one method (or any) at one path |
//!
//! [`Router::handle`] runs global middleware, then path middleware, then the
//! matching terminal routes from most to least specific, stopping as soon as
//! a callback sends a response. See [`dispatch`] for the full rules.

use std::collections::HashSet;
use std::future::Future;
use std::sync::OnceLock;

use tracing::debug;

use crate::cache::{CacheStats, MatchCache};
use crate::context::{RouteRequest, RouteResponse};
use crate::http::Method;
use crate::middleware::{HandlerResult, Next};

mod config;
pub mod dispatch;
mod error;
pub mod pattern;
mod route;

pub use config::RouterConfig;
pub use dispatch::{HandleContext, Outcome};
pub use error::{DispatchError, RegistrationError};
pub use route::{
    MatchQuery, MatchResult, MethodFilter, Route, RouteKind, RouteSpec, Specificity, subdomains,
};

/// HTTP request router with Express-style middleware chaining.
///
/// `Router` is `Send + Sync`; share it behind an `Arc` once all routes are
/// registered. Registration takes `&mut self` and clears the match cache, so
/// a cached resolution never outlives the table it was computed from.
///
/// # Examples
///
/// ```rust,no_run
/// use waypost::Router;
///
/// let mut router = Router::new();
///
/// router.middleware(|req, _res, next| async move {
///     tracing::debug!(path = req.path(), "seen");
///     next.proceed();
///     Ok(())
/// }).unwrap();
///
/// router.get("/users/:id", |req, res, _next| async move {
///     let id = req.param("id").unwrap_or_default();
///     res.send(format!("user {id}"));
///     Ok(())
/// }).unwrap();
/// ```
pub struct Router {
    routes: Vec<Route>,
    names: HashSet<String>,
    // Indexes of global middleware, materialized on first dispatch.
    globals: OnceLock<Vec<usize>>,
    cache: MatchCache,
    config: RouterConfig,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Create a new, empty `Router` with the default [`RouterConfig`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// use waypost::Router;
    ///
    /// let router = Router::new();
    /// assert!(router.is_empty());
    /// ```
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    pub fn with_config(config: RouterConfig) -> Self {
        Self {
            routes: Vec::new(),
            names: HashSet::new(),
            globals: OnceLock::new(),
            cache: MatchCache::new(config.cache_capacity),
            config,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Compile `spec` and append it to the route table.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::DuplicateRouteName`] — another route already uses the name.
    /// - [`RegistrationError::NoCallbacks`] — the route declares no callbacks.
    /// - [`RegistrationError::Pattern`] — the host or path pattern does not compile.
    ///
    /// On error the table is unchanged.
    pub fn add_route(&mut self, spec: RouteSpec) -> Result<(), RegistrationError> {
        if let Some(name) = spec.name_ref() {
            if self.names.contains(name) {
                return Err(RegistrationError::DuplicateRouteName(name.to_owned()));
            }
        }

        let route = spec.compile(self.routes.len())?;
        if let Some(name) = route.name() {
            self.names.insert(name.to_owned());
        }

        debug!(
            index = route.index(),
            kind = ?route.kind(),
            name = route.name(),
            "route registered"
        );
        self.routes.push(route);
        self.invalidate();
        Ok(())
    }

    // Cached resolutions and the global list describe the old table.
    fn invalidate(&mut self) {
        self.globals = OnceLock::new();
        self.cache.clear();
    }

    /// All routes in registration order.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Look up a route by its registered name.
    pub fn route_named(&self, name: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.name() == Some(name))
    }

    /// Return the number of routes registered in this router.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Return `true` if no routes have been registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Drop every cached route resolution.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn add_handler<H, F>(&mut self, spec: RouteSpec, handler: H) -> Result<(), RegistrationError>
    where
        H: Fn(RouteRequest, RouteResponse, Next) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add_route(spec.handler(handler))
    }

    /// Register global middleware: runs for every request, before any path
    /// middleware or terminal route, whatever its registration position.
    pub fn middleware<H, F>(&mut self, handler: H) -> Result<(), RegistrationError>
    where
        H: Fn(RouteRequest, RouteResponse, Next) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add_handler(RouteSpec::global(), handler)
    }

    /// Register path middleware for every method under `path`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use waypost::Router;
    /// use waypost::http::StatusCode;
    ///
    /// let mut router = Router::new();
    /// router.middleware_at("/admin", |req, res, _next| async move {
    ///     if req.header("authorization").is_none() {
    ///         res.send_status(StatusCode::Unauthorized);
    ///     }
    ///     Ok(())
    /// }).unwrap();
    /// ```
    pub fn middleware_at<H, F>(&mut self, path: &str, handler: H) -> Result<(), RegistrationError>
    where
        H: Fn(RouteRequest, RouteResponse, Next) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add_handler(RouteSpec::path(path), handler)
    }

    /// Register a handler for `GET` requests matching `path`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use waypost::Router;
    ///
    /// let mut router = Router::new();
    /// router.get("/hello", |_req, res, _next| async move {
    ///     res.send("hi");
    ///     Ok(())
    /// }).unwrap();
    /// assert_eq!(router.len(), 1);
    /// ```
    pub fn get<H, F>(&mut self, path: &str, handler: H) -> Result<(), RegistrationError>
    where
        H: Fn(RouteRequest, RouteResponse, Next) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add_handler(RouteSpec::terminal(Method::Get, path), handler)
    }

    /// Register a handler for `POST` requests matching `path`.
    pub fn post<H, F>(&mut self, path: &str, handler: H) -> Result<(), RegistrationError>
    where
        H: Fn(RouteRequest, RouteResponse, Next) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add_handler(RouteSpec::terminal(Method::Post, path), handler)
    }

    /// Register a handler for `PUT` requests matching `path`.
    pub fn put<H, F>(&mut self, path: &str, handler: H) -> Result<(), RegistrationError>
    where
        H: Fn(RouteRequest, RouteResponse, Next) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add_handler(RouteSpec::terminal(Method::Put, path), handler)
    }

    /// Register a handler for `DELETE` requests matching `path`.
    pub fn delete<H, F>(&mut self, path: &str, handler: H) -> Result<(), RegistrationError>
    where
        H: Fn(RouteRequest, RouteResponse, Next) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add_handler(RouteSpec::terminal(Method::Delete, path), handler)
    }

    /// Register a handler for `PATCH` requests matching `path`.
    pub fn patch<H, F>(&mut self, path: &str, handler: H) -> Result<(), RegistrationError>
    where
        H: Fn(RouteRequest, RouteResponse, Next) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add_handler(RouteSpec::terminal(Method::Patch, path), handler)
    }

    /// Register a handler for `HEAD` requests matching `path`.
    pub fn head<H, F>(&mut self, path: &str, handler: H) -> Result<(), RegistrationError>
    where
        H: Fn(RouteRequest, RouteResponse, Next) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add_handler(RouteSpec::terminal(Method::Head, path), handler)
    }

    /// Register a handler for `OPTIONS` requests matching `path`.
    pub fn options<H, F>(&mut self, path: &str, handler: H) -> Result<(), RegistrationError>
    where
        H: Fn(RouteRequest, RouteResponse, Next) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add_handler(RouteSpec::terminal(Method::Options, path), handler)
    }

    /// Register a handler for every method at `path`.
    ///
    /// A route registered for the exact request method outranks it.
    pub fn all<H, F>(&mut self, path: &str, handler: H) -> Result<(), RegistrationError>
    where
        H: Fn(RouteRequest, RouteResponse, Next) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add_handler(RouteSpec::terminal(MethodFilter::Any, path), handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_starts_empty() {
        let router = Router::new();
        assert!(router.is_empty());
        assert_eq!(router.len(), 0);
        assert!(router.routes().is_empty());
    }

    #[test]
    fn router_default_uses_default_config() {
        let router = Router::default();
        assert_eq!(router.config(), &RouterConfig::default());
    }

    #[test]
    fn verb_helpers_register_terminal_routes() {
        let mut router = Router::new();
        router.get("/r", |_req, _res, _next| async { Ok(()) }).unwrap();
        router.post("/r", |_req, _res, _next| async { Ok(()) }).unwrap();
        router.put("/r", |_req, _res, _next| async { Ok(()) }).unwrap();
        router.delete("/r", |_req, _res, _next| async { Ok(()) }).unwrap();
        router.patch("/r", |_req, _res, _next| async { Ok(()) }).unwrap();
        router.head("/r", |_req, _res, _next| async { Ok(()) }).unwrap();
        router.options("/r", |_req, _res, _next| async { Ok(()) }).unwrap();
        router.all("/r", |_req, _res, _next| async { Ok(()) }).unwrap();

        let methods: Vec<_> = router.routes().iter().filter_map(Route::method).collect();
        assert_eq!(
            methods,
            vec![
                &MethodFilter::Exact(Method::Get),
                &MethodFilter::Exact(Method::Post),
                &MethodFilter::Exact(Method::Put),
                &MethodFilter::Exact(Method::Delete),
                &MethodFilter::Exact(Method::Patch),
                &MethodFilter::Exact(Method::Head),
                &MethodFilter::Exact(Method::Options),
                &MethodFilter::Any,
            ]
        );
        assert!(router.routes().iter().all(Route::is_terminal));
    }

    #[test]
    fn middleware_helpers_register_middleware_kinds() {
        let mut router = Router::new();
        router.middleware(|_req, _res, _next| async { Ok(()) }).unwrap();
        router
            .middleware_at("/api", |_req, _res, _next| async { Ok(()) })
            .unwrap();
        assert!(router.routes()[0].is_global_middleware());
        assert!(router.routes()[1].is_path_middleware());
        assert_eq!(router.routes()[1].path().unwrap().as_str(), "/api");
    }

    #[test]
    fn duplicate_name_is_rejected_and_table_unchanged() {
        let mut router = Router::new();
        let spec = || {
            RouteSpec::terminal(Method::Get, "/a")
                .name("home")
                .handler(|_req, _res, _next| async { Ok(()) })
        };
        router.add_route(spec()).unwrap();
        let err = router.add_route(spec()).unwrap_err();
        assert!(matches!(err, RegistrationError::DuplicateRouteName(ref n) if n == "home"));
        assert_eq!(router.len(), 1);
        assert_eq!(router.route_named("home").unwrap().index(), 0);
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let mut router = Router::new();
        let err = router
            .get("/users/:id(", |_req, _res, _next| async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, RegistrationError::Pattern(_)));
        assert!(router.is_empty());
    }

    #[test]
    fn failed_registration_does_not_reserve_name() {
        let mut router = Router::new();
        let bad = RouteSpec::terminal(Method::Get, "/*/x")
            .name("files")
            .handler(|_req, _res, _next| async { Ok(()) });
        assert!(router.add_route(bad).is_err());
        let good = RouteSpec::terminal(Method::Get, "/files/*")
            .name("files")
            .handler(|_req, _res, _next| async { Ok(()) });
        router.add_route(good).unwrap();
        assert!(router.route_named("files").is_some());
    }
}
