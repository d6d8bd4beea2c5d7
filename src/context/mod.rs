//! Request/response adapters handed to every callback.
//!
//! [`RouteRequest`] and [`RouteResponse`] are cheap, clonable handles over
//! shared state. The dispatcher keeps its own clones so it can update
//! `params`/`subdomains` between layers and poll
//! [`RouteResponse::headers_sent`] after each callback without taking
//! ownership away from handlers.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::{Serialize, de::DeserializeOwned};

use crate::http::{Headers, Method, Request, Response, StatusCode};

/// Type-erased request extensions map — used to inject per-request state
/// into handlers without requiring handlers to know about each other's types.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Create a new empty extensions map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous value of the same type
    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    /// Get a value from the extensions map
    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Remove a value from the extensions map
    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

/// Captured route parameters, kept in declaration order.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Parameters {
    entries: Vec<(String, String)>,
}

impl Parameters {
    /// Create a new empty parameters map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value. An existing key keeps its position and takes the new value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Get a value by name
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Number of captured parameters
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(name, value)` pairs in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Parameters::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct RouteState {
    params: Parameters,
    host_params: Parameters,
    subdomains: Vec<String>,
}

struct RequestShared {
    request: Request,
    state: Mutex<RouteState>,
    extensions: Mutex<Extensions>,
}

/// Shared request handle passed to callbacks.
///
/// # Examples
///
/// ```
/// use waypost::context::RouteRequest;
/// use waypost::http::Request;
///
/// let raw = b"GET /users/7 HTTP/1.1\r\nHost: localhost\r\nCookie: sid=abc; theme=dark\r\n\r\n";
/// let (request, _) = Request::parse(raw).unwrap();
/// let req = RouteRequest::new(request);
///
/// assert_eq!(req.path(), "/users/7");
/// assert_eq!(req.cookie("theme").as_deref(), Some("dark"));
/// assert!(req.params().is_empty());
/// ```
#[derive(Clone)]
pub struct RouteRequest {
    inner: Arc<RequestShared>,
}

impl RouteRequest {
    /// Wrap a parsed request
    pub fn new(request: Request) -> Self {
        Self {
            inner: Arc::new(RequestShared {
                request,
                state: Mutex::new(RouteState::default()),
                extensions: Mutex::new(Extensions::new()),
            }),
        }
    }

    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    pub fn method(&self) -> &Method {
        self.inner.request.method()
    }

    pub fn path(&self) -> &str {
        self.inner.request.path()
    }

    pub fn target(&self) -> &str {
        self.inner.request.target()
    }

    pub fn host(&self) -> Option<&str> {
        self.inner.request.host()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.inner.request.headers().get(name)
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.inner.request.query_param(key)
    }

    /// Path parameters captured by the layer currently running
    pub fn params(&self) -> Parameters {
        lock(&self.inner.state).params.clone()
    }

    /// Shorthand for `params().get(name)`
    pub fn param(&self, name: &str) -> Option<String> {
        lock(&self.inner.state).params.get(name).map(str::to_owned)
    }

    pub fn set_params(&self, params: Parameters) {
        lock(&self.inner.state).params = params;
    }

    /// Parameters captured by the route's host pattern
    pub fn host_params(&self) -> Parameters {
        lock(&self.inner.state).host_params.clone()
    }

    pub fn set_host_params(&self, params: Parameters) {
        lock(&self.inner.state).host_params = params;
    }

    pub fn subdomains(&self) -> Vec<String> {
        lock(&self.inner.state).subdomains.clone()
    }

    pub fn set_subdomains(&self, subdomains: Vec<String>) {
        lock(&self.inner.state).subdomains = subdomains;
    }

    /// Store a request-scoped value for later callbacks
    pub fn insert_extension<T>(&self, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        lock(&self.inner.extensions).insert(value)
    }

    /// Clone a request-scoped value out of the extensions map
    pub fn extension<T>(&self) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        lock(&self.inner.extensions).get::<T>().cloned()
    }

    pub fn remove_extension<T>(&self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        lock(&self.inner.extensions).remove::<T>()
    }

    /// Deserialize the body as JSON
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(self.inner.request.body())
    }

    /// Look up a cookie from the `Cookie` header. Values are returned verbatim.
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.inner
            .request
            .headers()
            .get_all("cookie")
            .flat_map(|header| header.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.trim_matches('"').to_owned())
    }
}

struct ResponseState {
    status: StatusCode,
    headers: Headers,
    body: Vec<u8>,
    sent: bool,
}

impl Default for ResponseState {
    fn default() -> Self {
        Self {
            status: StatusCode::Ok,
            headers: Headers::new(),
            body: Vec::new(),
            sent: false,
        }
    }
}

/// Shared response writer passed to callbacks.
///
/// Status and headers may be set freely until one of the sending methods
/// ([`send`](Self::send), [`send_status`](Self::send_status),
/// [`json`](Self::json), [`end`](Self::end)) runs. After that
/// [`headers_sent`](Self::headers_sent) is `true`, the dispatcher stops, and
/// further writes are ignored.
///
/// # Examples
///
/// ```
/// use waypost::context::RouteResponse;
/// use waypost::http::StatusCode;
///
/// let res = RouteResponse::new();
/// res.status(StatusCode::Created).set_header("Location", "/users/7");
/// res.send("created");
///
/// assert!(res.headers_sent());
/// let response = res.take_response().unwrap();
/// assert_eq!(response.status(), StatusCode::Created);
/// assert_eq!(response.payload(), b"created");
/// ```
#[derive(Clone, Default)]
pub struct RouteResponse {
    state: Arc<Mutex<ResponseState>>,
}

impl RouteResponse {
    pub fn new() -> Self {
        Self::default()
    }

    // Runs `write` unless headers are already out.
    fn write(&self, what: &'static str, write: impl FnOnce(&mut ResponseState)) {
        let mut state = lock(&self.state);
        if state.sent {
            tracing::warn!(write = what, "response already sent, write ignored");
            return;
        }
        write(&mut state);
    }

    /// Set the status code
    pub fn status(&self, status: StatusCode) -> &Self {
        self.write("status", |state| state.status = status);
        self
    }

    /// Set a header, replacing any existing values
    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) -> &Self {
        let (name, value) = (name.into(), value.into());
        self.write("header", |state| state.headers.set(name, value));
        self
    }

    /// Add a header value alongside existing ones
    pub fn append_header(&self, name: impl Into<String>, value: impl Into<String>) -> &Self {
        let (name, value) = (name.into(), value.into());
        self.write("header", |state| state.headers.insert(name, value));
        self
    }

    pub fn header(&self, name: &str) -> Option<String> {
        lock(&self.state).headers.get(name).map(str::to_owned)
    }

    pub fn status_code(&self) -> StatusCode {
        lock(&self.state).status
    }

    /// Send `body` with the current status and headers
    pub fn send(&self, body: impl Into<Vec<u8>>) {
        let body = body.into();
        self.write("send", |state| {
            state.body = body;
            state.sent = true;
        });
    }

    /// Send an empty body with `status`
    pub fn send_status(&self, status: StatusCode) {
        self.write("send", |state| {
            state.status = status;
            state.body.clear();
            state.sent = true;
        });
    }

    /// Serialize `value` as the JSON body and send it
    pub fn json<T>(&self, value: &T) -> Result<(), serde_json::Error>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(value)?;
        self.write("json", |state| {
            state.headers.set("Content-Type", "application/json");
            state.body = body;
            state.sent = true;
        });
        Ok(())
    }

    /// Send whatever body has been written so far
    pub fn end(&self) {
        self.write("end", |state| state.sent = true);
    }

    pub fn headers_sent(&self) -> bool {
        lock(&self.state).sent
    }

    /// A copy of the current body
    pub fn body(&self) -> Vec<u8> {
        lock(&self.state).body.clone()
    }

    /// Build a wire [`Response`] from the current state, sent or not.
    pub fn finish(&self) -> Response {
        let state = lock(&self.state);
        let mut response = Response::new(state.status).body_bytes(state.body.clone());
        for (name, value) in state.headers.iter() {
            response.add_header(name, value);
        }
        response
    }

    /// Take the sent response, or `None` if nothing was sent.
    pub fn take_response(&self) -> Option<Response> {
        let mut state = lock(&self.state);
        if !state.sent {
            return None;
        }
        let mut response = Response::new(state.status).body_bytes(std::mem::take(&mut state.body));
        for (name, value) in state.headers.iter() {
            response.add_header(name, value);
        }
        Some(response)
    }
}
