//! Async TCP server using Tokio.
//!
//! Accepts TCP connections, parses HTTP/1.1 requests and dispatches each one
//! through a shared [`Router`]. Supports HTTP/1.1 persistent connections
//! (keep-alive) out of the box.
//!
//! The router never writes default responses; [`respond`] is where an
//! unmatched request becomes `404 Not Found` and a failed dispatch becomes
//! `500 Internal Server Error`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::context::{RouteRequest, RouteResponse};
use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};
use crate::router::{HandleContext, Outcome, Router};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid server config: {0}")]
    Config(#[from] serde_json::Error),
}

/// Connection limits and dispatch timeout.
///
/// ```
/// use waypost::server::ServerConfig;
///
/// let config = ServerConfig::from_json(r#"{ "handler_timeout_ms": 250 }"#).unwrap();
/// assert_eq!(config.max_request_size, 8 * 1024 * 1024);
/// assert_eq!(config.handler_timeout_ms, Some(250));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Largest request buffered before answering `413` (default 8 MiB).
    pub max_request_size: usize,
    /// Initial read buffer capacity per connection.
    pub initial_buffer_size: usize,
    /// Upper bound on one dispatch; `None` waits forever.
    pub handler_timeout_ms: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_request_size: 8 * 1024 * 1024,
            initial_buffer_size: 4096,
            handler_timeout_ms: None,
        }
    }
}

impl ServerConfig {
    pub fn from_json(json: &str) -> Result<Self, ServerError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms.map(Duration::from_millis)
    }
}

/// The waypost HTTP server.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use waypost::Router;
/// use waypost::server::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut router = Router::new();
///     router.get("/", |_req, res, _next| async move {
///         res.send("Hello!");
///         Ok(())
///     })?;
///
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.serve(Arc::new(router)).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            config: ServerConfig::default(),
        })
    }

    #[must_use]
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting connections and dispatching requests to `router`.
    ///
    /// Runs until the process is terminated or an unrecoverable listener
    /// error occurs.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn serve(self, router: Arc<Router>) -> Result<(), ServerError> {
        let config = Arc::new(self.config);
        info!(address = %self.local_addr, routes = router.len(), "waypost listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let router = Arc::clone(&router);
            let config = Arc::clone(&config);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, router, config).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Dispatch one parsed request and turn the outcome into a wire response.
///
/// | Dispatch result                 | Response                              |
/// |---------------------------------|---------------------------------------|
/// | a callback sent a response      | that response                         |
/// | matched, nothing sent           | current status and headers, empty body |
/// | [`Outcome::Unmatched`]          | `404 Not Found`                       |
/// | `Err`                           | `500 Internal Server Error`           |
/// | `handler_timeout_ms` exceeded   | `408 Request Timeout`                 |
pub async fn respond(router: &Router, config: &ServerConfig, request: Request) -> Response {
    let keep_alive = request.is_keep_alive();
    let res = RouteResponse::new();
    let ctx = HandleContext::new(RouteRequest::new(request), res.clone());

    let dispatch = router.handle(ctx);
    let result = match config.handler_timeout() {
        Some(limit) => match tokio::time::timeout(limit, dispatch).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = limit.as_millis() as u64, "dispatch timed out, sending 408");
                return Response::new(StatusCode::RequestTimeout)
                    .body("Request Timeout")
                    .keep_alive(false);
            }
        },
        None => dispatch.await,
    };

    let response = match result {
        Ok(Outcome::Unmatched) => Response::new(StatusCode::NotFound).body("Not Found"),
        Ok(_) => res.take_response().unwrap_or_else(|| res.finish()),
        Err(err) => {
            error!(error = %err, "dispatch failed");
            res.take_response().unwrap_or_else(|| {
                Response::new(StatusCode::InternalServerError).body("Internal Server Error")
            })
        }
    };
    response.keep_alive(keep_alive)
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection or signals
/// `Connection: close`.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    router: Arc<Router>,
    config: Arc<ServerConfig>,
) -> Result<(), std::io::Error> {
    let mut buf = BytesMut::with_capacity(config.initial_buffer_size);
    // Pipelined requests already buffered are served before reading again.
    let mut need_read = true;

    loop {
        if need_read {
            let bytes_read = stream.read_buf(&mut buf).await?;
            if bytes_read == 0 {
                debug!(peer = %peer_addr, "connection closed by peer");
                break;
            }
        }

        if buf.len() > config.max_request_size {
            warn!(peer = %peer_addr, "request too large, sending 413");
            let response = Response::new(StatusCode::PayloadTooLarge)
                .body("Request entity too large")
                .keep_alive(false);
            stream.write_all(&response.into_bytes()).await?;
            break;
        }

        let (request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            // Headers not fully received yet.
            Err(RequestError::Incomplete) => {
                need_read = true;
                continue;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                let response = Response::new(StatusCode::BadRequest)
                    .body(format!("Bad Request: {e}"))
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
        };

        // Wait for the full body when Content-Length is set.
        let total_needed = body_offset + request.content_length().unwrap_or(0);
        if buf.len() < total_needed {
            need_read = true;
            continue;
        }

        let keep_alive = request.is_keep_alive();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            target = %request.target(),
            "dispatching request"
        );

        let response = respond(&router, &config, request).await;
        stream.write_all(&response.into_bytes()).await?;
        stream.flush().await?;

        let _ = buf.split_to(total_needed);
        need_read = buf.is_empty();

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RouteSpec;

    fn parse(raw: &str) -> Request {
        Request::parse(raw.as_bytes()).unwrap().0
    }

    fn router() -> Router {
        let mut router = Router::new();
        router
            .get("/hello/:name", |req, res, _next| async move {
                let name = req.param("name").unwrap_or_default();
                res.send(format!("hello {name}"));
                Ok(())
            })
            .unwrap();
        router
            .get("/broken", |_req, _res, next| async move {
                next.fail("db down");
                Ok(())
            })
            .unwrap();
        router
            .get("/accepted", |_req, res, _next| async move {
                res.status(StatusCode::Accepted);
                Ok(())
            })
            .unwrap();
        router
            .add_route(
                RouteSpec::terminal(crate::http::Method::Get, "/slow").handler(
                    |_req, res, _next| async move {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        res.send("late");
                        Ok(())
                    },
                ),
            )
            .unwrap();
        router
    }

    #[test]
    fn config_defaults() {
        let config = ServerConfig::from_json("{}").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert!(config.handler_timeout().is_none());
    }

    #[test]
    fn config_rejects_wrong_types() {
        let err = ServerConfig::from_json(r#"{ "max_request_size": "big" }"#).unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
    }

    #[tokio::test]
    async fn respond_returns_sent_response() {
        let response = respond(
            &router(),
            &ServerConfig::default(),
            parse("GET /hello/ada HTTP/1.1\r\nHost: localhost\r\n\r\n"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::Ok);
        assert_eq!(response.payload(), b"hello ada");
    }

    #[tokio::test]
    async fn respond_maps_unmatched_to_404() {
        let response = respond(
            &router(),
            &ServerConfig::default(),
            parse("GET /nowhere HTTP/1.1\r\n\r\n"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NotFound);
    }

    #[tokio::test]
    async fn respond_maps_errors_to_500() {
        let response = respond(
            &router(),
            &ServerConfig::default(),
            parse("GET /broken HTTP/1.1\r\n\r\n"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::InternalServerError);
    }

    #[tokio::test]
    async fn respond_finishes_matched_but_unsent() {
        let response = respond(
            &router(),
            &ServerConfig::default(),
            parse("GET /accepted HTTP/1.1\r\n\r\n"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::Accepted);
        assert!(response.payload().is_empty());
    }

    #[tokio::test]
    async fn respond_times_out_slow_dispatch() {
        let config = ServerConfig {
            handler_timeout_ms: Some(10),
            ..ServerConfig::default()
        };
        let response = respond(&router(), &config, parse("GET /slow HTTP/1.1\r\n\r\n")).await;
        assert_eq!(response.status(), StatusCode::RequestTimeout);
    }

    #[tokio::test]
    async fn serves_over_loopback() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.serve(Arc::new(router())));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /hello/world HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        let text = String::from_utf8(raw).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
        assert!(text.ends_with("hello world"), "{text}");
    }

    #[tokio::test]
    async fn answers_requests_pipelined_in_one_write() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.serve(Arc::new(router())));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                b"GET /hello/a HTTP/1.1\r\nHost: localhost\r\n\r\n\
                  GET /hello/b HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        let mut raw = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut raw))
            .await
            .expect("both pipelined requests answered")
            .unwrap();
        let text = String::from_utf8(raw).unwrap();

        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2, "{text}");
        let first = text.find("hello a").expect("first body");
        let second = text.find("hello b").expect("second body");
        assert!(first < second, "{text}");
    }
}
