//! Security middleware — policies that run as ordinary router callbacks.
//!
//! - [`CorsMiddleware`] — Cross-Origin Resource Sharing header injection and
//!   preflight (`OPTIONS`) short-circuiting.

mod cors;

pub use cors::CorsMiddleware;
