//! Middleware pipeline — callback types and the continuation handed to them.
//!
//! Every layer the router runs, whether global middleware, path middleware or
//! a terminal handler, is a [`Callback`]: an async function of
//! `(RouteRequest, RouteResponse, Next)`. The callback tells the dispatcher how
//! to carry on through the [`Next`] handle it receives.
//!
//! ## Core types
//!
//! - [`Callback`] — type-erased, cheaply-cloneable callback.
//! - [`callback`] — converts an async closure into a [`Callback`].
//! - [`Next`] — continuation handle; records a [`Signal`] for the dispatcher.
//! - [`Middleware`] — trait for reusable, configurable middleware.
//! - [`from_middleware`] — converts a [`Middleware`] into a [`Callback`].
//! - [`RequestLogger`] — built-in request logger.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;

use crate::context::{RouteRequest, RouteResponse};

/// Error type callbacks may fail with.
///
/// Strings convert into it directly, so `next.fail("bad token")` and
/// `Err("bad token".into())` both work.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// What a callback future resolves to. `Err` aborts the whole dispatch.
pub type HandlerResult = Result<(), BoxError>;

/// A type-erased, reference-counted callback.
///
/// Routes store their callbacks as `Callback`s; the [`Arc`] lets a
/// [`MatchResult`](crate::router::MatchResult) hand out the callback list
/// without copying closures.
pub type Callback = Arc<
    dyn Fn(RouteRequest, RouteResponse, Next) -> BoxFuture<'static, HandlerResult>
        + Send
        + Sync
        + 'static,
>;

/// Converts an async closure into a [`Callback`].
///
/// # Examples
///
/// ```rust
/// use waypost::middleware::{Callback, callback};
///
/// let cb: Callback = callback(|_req, _res, next| async move {
///     next.proceed();
///     Ok(())
/// });
/// ```
pub fn callback<H, F>(handler: H) -> Callback
where
    H: Fn(RouteRequest, RouteResponse, Next) -> F + Send + Sync + 'static,
    F: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(
        move |req: RouteRequest, res: RouteResponse, next: Next| -> BoxFuture<'static, HandlerResult> {
            Box::pin(handler(req, res, next))
        },
    )
}

/// How a callback asked the dispatcher to continue.
#[derive(Debug)]
pub enum Signal {
    /// Carry on with the next callback.
    Continue,
    /// Stop the current tier. In middleware this falls through to the next
    /// tier; in a terminal route it abandons that route for the next candidate.
    SkipTier,
    /// Abort the dispatch with an error.
    Abort(BoxError),
}

#[derive(Default)]
struct NextState {
    calls: usize,
    signal: Option<Signal>,
}

/// Continuation handle passed to every callback.
///
/// A callback that returns without touching `Next` is treated like one that
/// called [`proceed`](Self::proceed). An abort, once recorded, survives later
/// calls.
///
/// # Examples
///
/// ```rust
/// use waypost::middleware::{Next, Signal};
///
/// let next = Next::new();
/// assert!(!next.called());
/// next.skip();
/// next.proceed();
/// assert_eq!(next.calls(), 2);
/// assert!(matches!(next.take_signal(), Some(Signal::Continue)));
/// ```
#[derive(Clone, Default)]
pub struct Next {
    state: Arc<Mutex<NextState>>,
}

impl Next {
    /// Creates an untouched continuation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue with the next callback.
    pub fn proceed(&self) {
        self.emit(Signal::Continue);
    }

    /// Stop the current tier without failing the request.
    pub fn skip(&self) {
        self.emit(Signal::SkipTier);
    }

    /// Abort the dispatch with `err`.
    pub fn fail(&self, err: impl Into<BoxError>) {
        self.emit(Signal::Abort(err.into()));
    }

    /// Records `signal`, unless an abort is already recorded.
    pub fn emit(&self, signal: Signal) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.calls += 1;
        if !matches!(state.signal, Some(Signal::Abort(_))) {
            state.signal = Some(signal);
        }
    }

    /// Number of times any continuation method was called.
    pub fn calls(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .calls
    }

    /// Whether the continuation was invoked at least once.
    pub fn called(&self) -> bool {
        self.calls() > 0
    }

    /// Takes the recorded signal, leaving `None` behind.
    pub fn take_signal(&self) -> Option<Signal> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .signal
            .take()
    }
}

/// The trait for reusable waypost middleware.
///
/// Implementors receive the request, the response writer and the
/// continuation. They may:
///
/// - **Pass through** — call `next.proceed()` (or simply return).
/// - **Short-circuit** — write a response with [`RouteResponse::send`]; the
///   dispatcher halts as soon as headers are sent.
/// - **Decorate** — set headers on the response before a later handler sends it.
/// - **Fail** — return `Err` or call [`Next::fail`].
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync` because one router is shared
///   across Tokio tasks.
/// - The returned future **must** be `Send + 'static`; clone what it needs out
///   of `self` before the `async move` block.
pub trait Middleware: Send + Sync {
    /// Handle the request and report how to continue through `next`.
    fn handle(
        &self,
        req: RouteRequest,
        res: RouteResponse,
        next: Next,
    ) -> BoxFuture<'static, HandlerResult>;
}

/// Converts a [`Middleware`] implementation into a [`Callback`].
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use waypost::middleware::{RequestLogger, from_middleware};
///
/// let cb = from_middleware(Arc::new(RequestLogger));
/// ```
pub fn from_middleware<M>(middleware: Arc<M>) -> Callback
where
    M: Middleware + 'static,
{
    Arc::new(move |req: RouteRequest, res: RouteResponse, next: Next| {
        middleware.handle(req, res, next)
    })
}

/// Built-in middleware that logs each request as it enters the chain.
///
/// Emits one `tracing::info!` record per invocation with the method, raw
/// target and host, then continues.
pub struct RequestLogger;

impl Middleware for RequestLogger {
    fn handle(
        &self,
        req: RouteRequest,
        _res: RouteResponse,
        next: Next,
    ) -> BoxFuture<'static, HandlerResult> {
        Box::pin(async move {
            tracing::info!(
                method = %req.method(),
                target = %req.target(),
                host = req.host().unwrap_or("-"),
                "incoming request"
            );
            next.proceed();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Request;

    fn make_request() -> RouteRequest {
        let raw = b"GET /ping HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        RouteRequest::new(req)
    }

    #[test]
    fn next_starts_untouched() {
        let next = Next::new();
        assert_eq!(next.calls(), 0);
        assert!(!next.called());
        assert!(next.take_signal().is_none());
    }

    #[test]
    fn next_last_signal_wins() {
        let next = Next::new();
        next.proceed();
        next.skip();
        assert_eq!(next.calls(), 2);
        assert!(matches!(next.take_signal(), Some(Signal::SkipTier)));
    }

    #[test]
    fn next_abort_is_sticky() {
        let next = Next::new();
        next.fail("token expired");
        next.proceed();
        match next.take_signal() {
            Some(Signal::Abort(err)) => assert_eq!(err.to_string(), "token expired"),
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[test]
    fn next_clones_share_state() {
        let next = Next::new();
        let handle = next.clone();
        handle.proceed();
        assert!(next.called());
    }

    #[tokio::test]
    async fn callback_wraps_closure() {
        let cb = callback(|_req, res, next| async move {
            res.send("pong");
            next.proceed();
            Ok(())
        });
        let res = RouteResponse::new();
        let next = Next::new();
        cb(make_request(), res.clone(), next.clone()).await.unwrap();
        assert!(res.headers_sent());
        assert_eq!(next.calls(), 1);
    }

    #[tokio::test]
    async fn logger_continues() {
        let cb = from_middleware(Arc::new(RequestLogger));
        let res = RouteResponse::new();
        let next = Next::new();
        cb(make_request(), res.clone(), next.clone()).await.unwrap();
        assert!(matches!(next.take_signal(), Some(Signal::Continue)));
        assert!(!res.headers_sent());
    }
}
