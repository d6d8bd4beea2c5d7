use futures_util::future::BoxFuture;
use tracing::trace;

use crate::context::{RouteRequest, RouteResponse};
use crate::http::{Method, StatusCode};
use crate::middleware::{HandlerResult, Middleware, Next};

/// CORS middleware — validates the `Origin` header, answers preflight
/// requests, and decorates the shared response with `Access-Control-*`
/// headers before the rest of the chain runs.
///
/// Register it as global middleware through
/// [`from_middleware`](crate::middleware::from_middleware) so it sees every
/// request.
///
/// # Behavior
///
/// - No `Origin` header, or an origin outside the allow-list: continue untouched.
/// - `OPTIONS` preflight: send `204 No Content` with the CORS headers. No
///   later callback runs.
/// - Otherwise: set the CORS headers and continue; the handler that sends the
///   response keeps them.
/// - `Vary: Origin` is added only when a specific origin is echoed back.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use waypost::Router;
/// use waypost::middleware::from_middleware;
/// use waypost::router::RouteSpec;
/// use waypost::security::CorsMiddleware;
///
/// let cors = CorsMiddleware::new()
///     .allow_origin("https://example.com")
///     .allow_method("PATCH")
///     .allow_header("X-Custom-Header");
///
/// let mut router = Router::new();
/// router
///     .add_route(RouteSpec::global().callback(from_middleware(Arc::new(cors))))
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct CorsMiddleware {
    allowed_origins: Vec<String>,
    allowed_methods: Vec<String>,
    allowed_headers: Vec<String>,
    max_age: u32,
}

impl Default for CorsMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl CorsMiddleware {
    /// Creates a `CorsMiddleware` with permissive defaults.
    ///
    /// | Setting          | Default value                          |
    /// |------------------|----------------------------------------|
    /// | Allowed origins  | `*` (all origins)                      |
    /// | Allowed methods  | `GET`, `POST`, `PUT`, `DELETE`         |
    /// | Allowed headers  | `Content-Type`, `Authorization`        |
    /// | Preflight max age| 3600 seconds                           |
    pub fn new() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: ["GET", "POST", "PUT", "DELETE"].map(String::from).to_vec(),
            allowed_headers: ["Content-Type", "Authorization"].map(String::from).to_vec(),
            max_age: 3600,
        }
    }

    /// Adds an allowed origin.
    ///
    /// The first specific origin replaces the default wildcard. Pass `"*"` to
    /// accept every origin again.
    #[must_use]
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        let origin = origin.into();
        if origin != "*" {
            self.allowed_origins.retain(|o| o != "*");
        }
        self.allowed_origins.push(origin);
        self
    }

    /// Adds an allowed HTTP method, sent verbatim in `Access-Control-Allow-Methods`.
    #[must_use]
    pub fn allow_method(mut self, method: impl Into<String>) -> Self {
        self.allowed_methods.push(method.into());
        self
    }

    /// Adds an allowed request header, sent verbatim in `Access-Control-Allow-Headers`.
    #[must_use]
    pub fn allow_header(mut self, header: impl Into<String>) -> Self {
        self.allowed_headers.push(header.into());
        self
    }

    #[must_use]
    pub fn max_age(mut self, seconds: u32) -> Self {
        self.max_age = seconds;
        self
    }

    fn resolve_origin(&self, origin: &str) -> Option<String> {
        if self.allowed_origins.iter().any(|o| o == "*") {
            Some("*".to_owned())
        } else if self.allowed_origins.iter().any(|o| o == origin) {
            Some(origin.to_owned())
        } else {
            None
        }
    }
}

impl Middleware for CorsMiddleware {
    fn handle(
        &self,
        req: RouteRequest,
        res: RouteResponse,
        next: Next,
    ) -> BoxFuture<'static, HandlerResult> {
        let allow_origin = req
            .header("origin")
            .and_then(|origin| self.resolve_origin(origin));
        let methods = self.allowed_methods.join(", ");
        let headers = self.allowed_headers.join(", ");
        let max_age = self.max_age.to_string();

        Box::pin(async move {
            let Some(allow_origin) = allow_origin else {
                next.proceed();
                return Ok(());
            };

            res.set_header("Access-Control-Allow-Origin", allow_origin.as_str())
                .set_header("Access-Control-Allow-Methods", methods)
                .set_header("Access-Control-Allow-Headers", headers);
            if allow_origin != "*" {
                res.append_header("Vary", "Origin");
            }

            if req.method() == &Method::Options {
                trace!(origin = %allow_origin, "answering CORS preflight");
                res.set_header("Access-Control-Max-Age", max_age);
                res.send_status(StatusCode::NoContent);
                return Ok(());
            }

            next.proceed();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::http::Request;
    use crate::middleware::{Signal, from_middleware};

    fn request(method: &str, origin: Option<&str>) -> RouteRequest {
        let origin = origin
            .map(|o| format!("Origin: {o}\r\n"))
            .unwrap_or_default();
        let raw = format!("{method} /api HTTP/1.1\r\nHost: localhost\r\n{origin}\r\n");
        let (parsed, _) = Request::parse(raw.as_bytes()).unwrap();
        RouteRequest::new(parsed)
    }

    async fn run(cors: CorsMiddleware, req: RouteRequest) -> (RouteResponse, Option<Signal>) {
        let cb = from_middleware(Arc::new(cors));
        let res = RouteResponse::new();
        let next = Next::new();
        cb(req, res.clone(), next.clone()).await.unwrap();
        (res, next.take_signal())
    }

    #[tokio::test]
    async fn without_origin_passes_through() {
        let (res, signal) = run(CorsMiddleware::new(), request("GET", None)).await;
        assert!(matches!(signal, Some(Signal::Continue)));
        assert!(res.header("Access-Control-Allow-Origin").is_none());
    }

    #[tokio::test]
    async fn wildcard_decorates_and_continues() {
        let (res, signal) = run(CorsMiddleware::new(), request("GET", Some("https://a.test"))).await;
        assert!(matches!(signal, Some(Signal::Continue)));
        assert!(!res.headers_sent());
        assert_eq!(res.header("Access-Control-Allow-Origin").as_deref(), Some("*"));
        assert!(res.header("Vary").is_none());
    }

    #[tokio::test]
    async fn preflight_is_answered_with_no_content() {
        let cors = CorsMiddleware::new().allow_origin("https://a.test").max_age(60);
        let (res, signal) = run(cors, request("OPTIONS", Some("https://a.test"))).await;
        assert!(signal.is_none());
        assert!(res.headers_sent());
        assert_eq!(res.status_code(), StatusCode::NoContent);
        assert_eq!(
            res.header("Access-Control-Allow-Origin").as_deref(),
            Some("https://a.test")
        );
        assert_eq!(res.header("Access-Control-Max-Age").as_deref(), Some("60"));
        assert_eq!(res.header("Vary").as_deref(), Some("Origin"));
    }

    #[tokio::test]
    async fn unknown_origin_is_ignored() {
        let cors = CorsMiddleware::new().allow_origin("https://a.test");
        let (res, signal) = run(cors, request("OPTIONS", Some("https://evil.test"))).await;
        assert!(matches!(signal, Some(Signal::Continue)));
        assert!(!res.headers_sent());
        assert!(res.header("Access-Control-Allow-Origin").is_none());
    }
}
