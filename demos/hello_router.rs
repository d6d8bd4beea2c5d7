//! Minimal router demo.
//!
//! ```text
//! RUST_LOG=waypost=debug cargo run --example hello_router
//! curl localhost:8080/users/7
//! curl -X POST localhost:8080/upload
//! ```

use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use waypost::http::{Method, StatusCode};
use waypost::middleware::{RequestLogger, from_middleware};
use waypost::security::CorsMiddleware;
use waypost::{RouteSpec, Router, Server, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut router = Router::new();
    router.add_route(RouteSpec::global().callback(from_middleware(Arc::new(RequestLogger))))?;
    router.add_route(
        RouteSpec::global().callback(from_middleware(Arc::new(
            CorsMiddleware::new().allow_origin("http://localhost:3000"),
        ))),
    )?;

    router.middleware_at("/upload", |req, res, next| async move {
        if req.request().body().is_empty() {
            res.status(StatusCode::BadRequest).send("missing file");
        } else {
            next.proceed();
        }
        Ok(())
    })?;

    router.get("/users/active", |_req, res, _next| async move {
        res.json(&serde_json::json!({ "active": ["ada", "grace"] }))?;
        Ok(())
    })?;

    router.get("/users/:id", |req, res, _next| async move {
        let id = req.param("id").unwrap_or_default();
        res.send(format!("user {id}"));
        Ok(())
    })?;

    router.add_route(
        RouteSpec::terminal(Method::Post, "/upload")
            .name("upload")
            .handler(|req, res, _next| async move {
                let size = req.request().body().len();
                res.status(StatusCode::Created).send(format!("stored {size} bytes"));
                Ok(())
            }),
    )?;

    let server = Server::bind("127.0.0.1:8080")
        .await?
        .with_config(ServerConfig {
            handler_timeout_ms: Some(5_000),
            ..ServerConfig::default()
        });
    server.serve(Arc::new(router)).await?;
    Ok(())
}
