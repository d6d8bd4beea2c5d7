//! # waypost
//!
//! Express-style request routing and middleware dispatch over a small async
//! HTTP/1.1 transport.
//!
//! A [`Router`] holds global middleware, path middleware and terminal routes.
//! Each request runs through global middleware, then path middleware, then the
//! most specific matching route, stopping as soon as a callback sends a
//! response.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use waypost::{Router, server::Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut router = Router::new();
//!     router.middleware(|req, _res, next| async move {
//!         tracing::info!(path = req.path(), "request");
//!         next.proceed();
//!         Ok(())
//!     })?;
//!     router.get("/users/:id", |req, res, _next| async move {
//!         res.send(format!("user {}", req.param("id").unwrap_or_default()));
//!         Ok(())
//!     })?;
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     server.serve(Arc::new(router)).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod context;
pub mod http;
pub mod middleware;
pub mod router;
pub mod security;
pub mod server;

pub use context::{RouteRequest, RouteResponse};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use middleware::{BoxError, Callback, HandlerResult, Middleware, Next};
pub use router::{DispatchError, HandleContext, Outcome, RegistrationError, RouteSpec, Router};
pub use server::{Server, ServerConfig, ServerError};
