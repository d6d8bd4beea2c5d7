//! HTTP/1.1 protocol types and parsing.
//!
//! These are the native primitives the transport hands to the router:
//! [`Method`], [`StatusCode`], [`Headers`], [`Request`], and [`Response`].
//! Handlers never see them directly; they go through the adapters in
//! [`crate::context`].

use std::fmt;

pub mod headers;
pub mod request;
pub mod response;

pub use headers::Headers;
pub use request::Request;
pub use response::Response;

/// Status codes the router, the transport and the built-in middleware emit.
///
/// # Examples
///
/// ```
/// use waypost::http::StatusCode;
///
/// let status = StatusCode::NotFound;
/// assert_eq!(status.as_u16(), 404);
/// assert_eq!(status.to_string(), "404 Not Found");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StatusCode {
    Ok = 200,
    Created = 201,
    Accepted = 202,
    NoContent = 204,

    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    RequestTimeout = 408,
    PayloadTooLarge = 413,

    InternalServerError = 500,
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Reason phrase written on the status line.
    pub fn canonical_reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Created => "Created",
            Self::Accepted => "Accepted",
            Self::NoContent => "No Content",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::RequestTimeout => "Request Timeout",
            Self::PayloadTooLarge => "Payload Too Large",
            Self::InternalServerError => "Internal Server Error",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.canonical_reason())
    }
}

/// An HTTP request method. Extension methods land in `Custom`.
///
/// # Examples
///
/// ```
/// use waypost::http::Method;
///
/// let method: Method = "GET".parse().unwrap();
/// assert_eq!(method, Method::Get);
/// assert!(method.eq_ignore_ascii_case("get"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Custom(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
            Self::Custom(s) => s.as_str(),
        }
    }

    /// Compares against a raw method token, ignoring ASCII case.
    ///
    /// Route matching uses this so that `Custom("get")` and `Get` are treated alike.
    pub fn eq_ignore_ascii_case(&self, other: &str) -> bool {
        self.as_str().eq_ignore_ascii_case(other)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = std::convert::Infallible;

    /// Case-sensitive, as tokens are on the wire.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "HEAD" => Self::Head,
            "OPTIONS" => Self::Options,
            "PATCH" => Self::Patch,
            other => Self::Custom(other.to_owned()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_parse_is_case_sensitive() {
        assert_eq!("PATCH".parse::<Method>().unwrap(), Method::Patch);
        assert_eq!(
            "patch".parse::<Method>().unwrap(),
            Method::Custom("patch".to_owned())
        );
        assert_eq!(
            "TRACE".parse::<Method>().unwrap(),
            Method::Custom("TRACE".to_owned())
        );
    }

    #[test]
    fn method_compare_ignores_case() {
        let custom: Method = "purge".parse().unwrap();
        assert!(custom.eq_ignore_ascii_case("PURGE"));
        assert!(Method::Get.eq_ignore_ascii_case("get"));
        assert!(!Method::Get.eq_ignore_ascii_case("post"));
    }

    #[test]
    fn request_timeout_reason() {
        assert_eq!(StatusCode::RequestTimeout.as_u16(), 408);
        assert_eq!(StatusCode::RequestTimeout.to_string(), "408 Request Timeout");
    }
}
