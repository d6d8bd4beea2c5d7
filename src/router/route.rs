//! Route definitions: the registration-side [`RouteSpec`], the compiled
//! [`Route`], per-request [`MatchResult`]s and the [`Specificity`] key used
//! to order competing terminal routes.

use std::cmp::Reverse;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;

use super::error::RegistrationError;
use super::pattern::{HostPattern, PathPattern};
use crate::context::{Parameters, RouteRequest, RouteResponse};
use crate::http::Method;
use crate::middleware::{Callback, HandlerResult, Next, callback};

/// Which request methods a terminal route accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodFilter {
    /// Any method (`Router::all`).
    Any,
    /// One method, compared ignoring ASCII case.
    Exact(Method),
}

impl MethodFilter {
    pub fn matches(&self, method: &Method) -> bool {
        match self {
            MethodFilter::Any => true,
            MethodFilter::Exact(expected) => expected.eq_ignore_ascii_case(method.as_str()),
        }
    }
}

impl From<Method> for MethodFilter {
    fn from(method: Method) -> Self {
        MethodFilter::Exact(method)
    }
}

/// The three route shapes. Derived from what a [`RouteSpec`] declares.
#[derive(Debug, Clone)]
pub enum RouteKind {
    /// Neither path nor method: runs for every request (subject to host).
    GlobalMiddleware,
    /// Path but no method: runs for any method under a path prefix.
    PathMiddleware { path: PathPattern },
    /// Path and method: a request handler.
    Terminal {
        path: PathPattern,
        method: MethodFilter,
    },
}

#[derive(Debug, Clone)]
enum Target {
    Global,
    Path(String),
    Terminal(MethodFilter, String),
}

#[derive(Debug, Clone)]
enum HostSpec {
    Labels(String),
    Regex(String),
}

/// Uncompiled route description passed to
/// [`Router::add_route`](super::Router::add_route).
///
/// # Examples
///
/// ```rust
/// use waypost::http::Method;
/// use waypost::router::{RouteSpec, Router};
///
/// let mut router = Router::new();
/// router
///     .add_route(
///         RouteSpec::terminal(Method::Get, "/users/:id")
///             .host("api.example.com")
///             .name("user-detail")
///             .handler(|_req, res, _next| async move {
///                 res.send("user");
///                 Ok(())
///             }),
///     )
///     .unwrap();
/// assert!(router.route_named("user-detail").is_some());
/// ```
pub struct RouteSpec {
    target: Target,
    host: Option<HostSpec>,
    name: Option<String>,
    callbacks: Vec<Callback>,
}

impl RouteSpec {
    fn with_target(target: Target) -> Self {
        Self {
            target,
            host: None,
            name: None,
            callbacks: Vec::new(),
        }
    }

    /// Global middleware.
    pub fn global() -> Self {
        Self::with_target(Target::Global)
    }

    /// Path middleware under `path`.
    pub fn path(path: impl Into<String>) -> Self {
        Self::with_target(Target::Path(path.into()))
    }

    /// Terminal route for `method` at `path`.
    pub fn terminal(method: impl Into<MethodFilter>, path: impl Into<String>) -> Self {
        Self::with_target(Target::Terminal(method.into(), path.into()))
    }

    /// Restrict the route to hosts matching a label pattern (`:tenant.example.com`).
    #[must_use]
    pub fn host(mut self, pattern: impl Into<String>) -> Self {
        self.host = Some(HostSpec::Labels(pattern.into()));
        self
    }

    /// Restrict the route to hosts matching a regex.
    #[must_use]
    pub fn host_regex(mut self, pattern: impl Into<String>) -> Self {
        self.host = Some(HostSpec::Regex(pattern.into()));
        self
    }

    /// Name the route. Names are unique within a router.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Append an async closure to the callback list.
    #[must_use]
    pub fn handler<H, F>(self, handler: H) -> Self
    where
        H: Fn(RouteRequest, RouteResponse, Next) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.callback(callback(handler))
    }

    /// Append an already-erased callback.
    #[must_use]
    pub fn callback(mut self, callback: Callback) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub(crate) fn name_ref(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn compile(self, index: usize) -> Result<Route, RegistrationError> {
        if self.callbacks.is_empty() {
            return Err(RegistrationError::NoCallbacks);
        }
        let kind = match self.target {
            Target::Global => RouteKind::GlobalMiddleware,
            Target::Path(path) => RouteKind::PathMiddleware {
                path: PathPattern::parse(&path)?,
            },
            Target::Terminal(method, path) => RouteKind::Terminal {
                path: PathPattern::parse(&path)?,
                method,
            },
        };
        let host = match self.host {
            Some(HostSpec::Labels(pattern)) => Some(HostPattern::parse(&pattern)?),
            Some(HostSpec::Regex(pattern)) => Some(HostPattern::regex(&pattern)?),
            None => None,
        };
        Ok(Route {
            index,
            kind,
            host,
            name: self.name,
            callbacks: self.callbacks,
        })
    }
}

/// Inputs a route is matched against.
#[derive(Debug, Clone, Copy)]
pub struct MatchQuery<'a> {
    /// Request host without port, if the request carried one.
    pub host: Option<&'a str>,
    pub method: &'a Method,
    /// Request path without query string.
    pub path: &'a str,
    /// Trailing host labels ignored when computing subdomains.
    pub subdomain_offset: usize,
}

impl<'a> MatchQuery<'a> {
    pub fn new(host: Option<&'a str>, method: &'a Method, path: &'a str) -> Self {
        Self {
            host,
            method,
            path,
            subdomain_offset: 2,
        }
    }
}

/// A compiled route in the route table.
pub struct Route {
    index: usize,
    kind: RouteKind,
    host: Option<HostPattern>,
    name: Option<String>,
    callbacks: Vec<Callback>,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("index", &self.index)
            .field("kind", &self.kind)
            .field("host", &self.host.as_ref().map(HostPattern::as_str))
            .field("name", &self.name)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

impl Route {
    /// Position in the route table.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> &RouteKind {
        &self.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn host(&self) -> Option<&HostPattern> {
        self.host.as_ref()
    }

    pub fn path(&self) -> Option<&PathPattern> {
        match &self.kind {
            RouteKind::GlobalMiddleware => None,
            RouteKind::PathMiddleware { path } | RouteKind::Terminal { path, .. } => Some(path),
        }
    }

    pub fn method(&self) -> Option<&MethodFilter> {
        match &self.kind {
            RouteKind::Terminal { method, .. } => Some(method),
            _ => None,
        }
    }

    pub fn callbacks(&self) -> &[Callback] {
        &self.callbacks
    }

    pub fn is_global_middleware(&self) -> bool {
        matches!(self.kind, RouteKind::GlobalMiddleware)
    }

    pub fn is_path_middleware(&self) -> bool {
        matches!(self.kind, RouteKind::PathMiddleware { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, RouteKind::Terminal { .. })
    }

    /// Match this route against a request.
    ///
    /// Middleware ignores the method; path middleware matches as a prefix.
    pub fn matches(&self, query: &MatchQuery<'_>) -> Option<MatchResult> {
        let (params, host_params) = self.capture(query)?;
        Some(self.match_result(query, params, host_params))
    }

    /// Path and host captures for `query`, or `None` when the route does not apply.
    pub(crate) fn capture(&self, query: &MatchQuery<'_>) -> Option<(Parameters, Parameters)> {
        let host_params = match (&self.host, query.host) {
            (None, _) => Parameters::new(),
            (Some(pattern), Some(host)) => pattern.matches(host)?,
            (Some(_), None) => return None,
        };

        let params = match &self.kind {
            RouteKind::GlobalMiddleware => Parameters::new(),
            RouteKind::PathMiddleware { path } => path.matches_prefix(query.path)?,
            RouteKind::Terminal { path, method } => {
                if !method.matches(query.method) {
                    return None;
                }
                path.matches(query.path)?
            }
        };
        Some((params, host_params))
    }

    pub(crate) fn match_result(
        &self,
        query: &MatchQuery<'_>,
        params: Parameters,
        host_params: Parameters,
    ) -> MatchResult {
        MatchResult {
            route: self.index,
            name: self.name.clone(),
            method: query.method.as_str().to_owned(),
            host: query.host.map(str::to_owned),
            path: query.path.to_owned(),
            params,
            host_params,
            subdomains: query
                .host
                .map(|host| subdomains(host, query.subdomain_offset))
                .unwrap_or_default(),
            callbacks: self.callbacks.clone(),
        }
    }
}

/// A route matched against one request.
#[derive(Clone)]
pub struct MatchResult {
    /// Index of the matched route in the route table.
    pub route: usize,
    pub name: Option<String>,
    /// Request method.
    pub method: String,
    /// Request host, without port.
    pub host: Option<String>,
    /// Request path, without query string.
    pub path: String,
    /// Path captures in declaration order.
    pub params: Parameters,
    pub host_params: Parameters,
    pub subdomains: Vec<String>,
    pub callbacks: Vec<Callback>,
}

impl fmt::Debug for MatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchResult")
            .field("route", &self.route)
            .field("name", &self.name)
            .field("method", &self.method)
            .field("host", &self.host)
            .field("path", &self.path)
            .field("params", &self.params)
            .field("host_params", &self.host_params)
            .field("subdomains", &self.subdomains)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

/// Sort key ranking terminal routes that match the same request.
///
/// Compared field by field, ascending: lower sorts first. Ties keep
/// registration order because the router uses a stable sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Specificity {
    /// 0 when the declared host equals the request host.
    host_rank: u8,
    host_len: Reverse<usize>,
    /// 0 when the declared method equals the request method.
    method_rank: u8,
    params: usize,
    named: Reverse<usize>,
    constrained: Reverse<usize>,
    /// A trailing wildcard ranks below an otherwise equal single-segment param.
    wildcards: usize,
}

impl Specificity {
    pub fn of(route: &Route, host: Option<&str>, method: &Method) -> Self {
        let declared_host = route.host().map(HostPattern::as_str);
        let host_rank = match (declared_host, host) {
            (Some(declared), Some(host)) if declared.eq_ignore_ascii_case(host) => 0,
            _ => 1,
        };
        let method_rank = match route.method() {
            Some(MethodFilter::Exact(declared)) if declared.eq_ignore_ascii_case(method.as_str()) => 0,
            _ => 1,
        };
        let path = route.path();
        Self {
            host_rank,
            host_len: Reverse(declared_host.map_or(0, str::len)),
            method_rank,
            params: path.map_or(0, PathPattern::param_count),
            named: Reverse(path.map_or(0, PathPattern::named_count)),
            constrained: Reverse(path.map_or(0, PathPattern::constrained_count)),
            wildcards: path.map_or(0, PathPattern::wildcard_count),
        }
    }
}

/// Host labels left of the last `offset` labels, most general first.
///
/// `a.b.example.com` with offset 2 gives `["b", "a"]`. IP literals have none.
pub fn subdomains(host: &str, offset: usize) -> Vec<String> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if bare.parse::<IpAddr>().is_ok() {
        return Vec::new();
    }
    host.split('.')
        .rev()
        .skip(offset)
        .map(str::to_ascii_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Callback {
        callback(|_req, _res, _next| async { Ok(()) })
    }

    fn compile(spec: RouteSpec) -> Route {
        spec.callback(noop()).compile(0).unwrap()
    }

    #[test]
    fn kind_is_derived_from_declared_fields() {
        assert!(compile(RouteSpec::global()).is_global_middleware());
        assert!(compile(RouteSpec::path("/api")).is_path_middleware());
        let terminal = compile(RouteSpec::terminal(Method::Get, "/api"));
        assert!(terminal.is_terminal());
        assert_eq!(terminal.method(), Some(&MethodFilter::Exact(Method::Get)));
    }

    #[test]
    fn compile_requires_callbacks() {
        let err = RouteSpec::global().compile(0).unwrap_err();
        assert!(matches!(err, RegistrationError::NoCallbacks));
    }

    #[test]
    fn compile_reports_pattern_errors() {
        let err = RouteSpec::path("/files/*/x")
            .callback(noop())
            .compile(0)
            .unwrap_err();
        assert!(matches!(err, RegistrationError::Pattern(_)));
    }

    #[test]
    fn terminal_match_checks_method_ignoring_case() {
        let route = compile(RouteSpec::terminal(Method::Get, "/users/:id"));
        let custom: Method = "get".parse().unwrap();
        let hit = route
            .matches(&MatchQuery::new(None, &custom, "/users/5"))
            .unwrap();
        assert_eq!(hit.params.get("id"), Some("5"));
        assert!(
            route
                .matches(&MatchQuery::new(None, &Method::Post, "/users/5"))
                .is_none()
        );
    }

    #[test]
    fn host_bound_route_needs_a_host() {
        let route = compile(RouteSpec::global().host(":tenant.example.com"));
        assert!(route.matches(&MatchQuery::new(None, &Method::Get, "/")).is_none());
        assert!(
            route
                .matches(&MatchQuery::new(Some("eu.acme.example.com"), &Method::Get, "/"))
                .is_none()
        );
        let hit = route
            .matches(&MatchQuery::new(Some("acme.example.com"), &Method::Get, "/x"))
            .unwrap();
        assert_eq!(hit.host_params.get("tenant"), Some("acme"));
        assert_eq!(hit.subdomains, vec!["acme".to_string()]);
    }

    #[test]
    fn path_middleware_matches_any_method_by_prefix() {
        let route = compile(RouteSpec::path("/admin"));
        let query = MatchQuery::new(None, &Method::Delete, "/admin/users/3");
        assert!(route.matches(&query).is_some());
    }

    #[test]
    fn specificity_prefers_static_over_params() {
        let dynamic = compile(RouteSpec::terminal(Method::Get, "/users/:id"));
        let fixed = compile(RouteSpec::terminal(Method::Get, "/users/active"));
        assert!(
            Specificity::of(&fixed, None, &Method::Get)
                < Specificity::of(&dynamic, None, &Method::Get)
        );
    }

    #[test]
    fn specificity_prefers_exact_host_then_longer_host() {
        let exact = compile(RouteSpec::terminal(Method::Get, "/a").host("api.example.com"));
        let pattern = compile(RouteSpec::terminal(Method::Get, "/a").host(":sub.example.com"));
        let none = compile(RouteSpec::terminal(Method::Get, "/a"));
        let host = Some("api.example.com");
        let key = |r: &Route| Specificity::of(r, host, &Method::Get);
        assert!(key(&exact) < key(&pattern));
        assert!(key(&pattern) < key(&none));
    }

    #[test]
    fn specificity_prefers_exact_method() {
        let any = compile(RouteSpec::terminal(MethodFilter::Any, "/a"));
        let get = compile(RouteSpec::terminal(Method::Get, "/a"));
        assert!(Specificity::of(&get, None, &Method::Get) < Specificity::of(&any, None, &Method::Get));
    }

    #[test]
    fn specificity_prefers_named_then_constrained() {
        let positional = compile(RouteSpec::terminal(Method::Get, "/v/(\\d+)"));
        let named = compile(RouteSpec::terminal(Method::Get, "/v/:n"));
        let constrained = compile(RouteSpec::terminal(Method::Get, "/v/:n(\\d+)"));
        let key = |r: &Route| Specificity::of(r, None, &Method::Get);
        assert!(key(&named) < key(&positional));
        assert!(key(&constrained) < key(&named));
    }

    #[test]
    fn specificity_prefers_param_over_wildcard() {
        let wildcard = compile(RouteSpec::terminal(Method::Get, "/files/*rest"));
        let param = compile(RouteSpec::terminal(Method::Get, "/files/:name"));
        assert!(
            Specificity::of(&param, None, &Method::Get)
                < Specificity::of(&wildcard, None, &Method::Get)
        );
    }

    #[test]
    fn capture_returns_path_and_host_params() {
        let route = compile(RouteSpec::terminal(Method::Get, "/users/:id").host(":tenant.example.com"));
        let query = MatchQuery::new(Some("acme.example.com"), &Method::Get, "/users/9");
        let (params, host_params) = route.capture(&query).unwrap();
        assert_eq!(params.get("id"), Some("9"));
        assert_eq!(host_params.get("tenant"), Some("acme"));
        let hit = route.match_result(&query, params, host_params);
        assert_eq!(hit.path, "/users/9");
        assert_eq!(hit.subdomains, vec!["acme".to_string()]);
    }

    #[test]
    fn subdomains_follow_offset() {
        assert_eq!(subdomains("a.b.example.com", 2), vec!["b", "a"]);
        assert_eq!(subdomains("example.com", 2), Vec::<String>::new());
        assert_eq!(subdomains("a.b.example.com", 3), vec!["a"]);
        assert!(subdomains("127.0.0.1", 2).is_empty());
        assert!(subdomains("[::1]", 2).is_empty());
    }
}
