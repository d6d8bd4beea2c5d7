use thiserror::Error;

use super::pattern::PatternError;
use crate::middleware::BoxError;

/// Errors raised while registering a route. The route table is left untouched.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("route name `{0}` is already registered")]
    DuplicateRouteName(String),

    #[error("route has no callbacks")]
    NoCallbacks,

    #[error(transparent)]
    Pattern(#[from] PatternError),
}

/// Errors that abort a dispatch. The engine never turns these into responses.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A callback returned `Err` or called [`Next::fail`](crate::middleware::Next::fail).
    #[error("handler failed: {0}")]
    Handler(#[source] BoxError),

    /// A callback panicked, either while building its future or while it ran.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl DispatchError {
    /// Downcast the handler error to a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            DispatchError::Handler(err) => err.downcast_ref::<E>(),
            DispatchError::Panicked(_) => None,
        }
    }
}
