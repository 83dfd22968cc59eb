//! Unified error type for the station viewer.
//!
//! Every variant carries owned strings so a single failure can be cloned
//! out to all callers waiting on the same in-flight request.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("Network error: {message}")]
    Network { message: String, timeout: bool },

    #[error("Server error (status={status}): {message}")]
    Server { status: u16, message: String },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Authentication required: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        /// Server-requested wait from `Retry-After`, when one was sent.
        retry_after_ms: Option<u64>,
        message: String,
    },

    #[error("Client error (status={status}): {message}")]
    Client { status: u16, message: String },

    #[error("Empty response body: {0}")]
    EmptyBody(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Invalid reading: {0}")]
    Validation(String),

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Session vault error: {0}")]
    Vault(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

/// Coarse classification handed to the UI layer alongside a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Server,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    RateLimited,
    Client,
    EmptyBody,
    Decode,
    Validation,
    Auth,
    Config,
    Storage,
    Other,
}

impl Error {
    /// Map an HTTP status and response body into the error taxonomy.
    ///
    /// Only meaningful for non-success statuses; callers check success first.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = truncate(body, 500);
        match status {
            400 => Error::BadRequest(message),
            401 => Error::Unauthorized(message),
            403 => Error::Forbidden(message),
            404 => Error::NotFound(message),
            429 => Error::RateLimited {
                retry_after_ms: None,
                message,
            },
            400..=499 => Error::Client { status, message },
            _ => Error::Server { status, message },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Network { .. } => ErrorKind::Network,
            Error::Server { .. } => ErrorKind::Server,
            Error::BadRequest(_) => ErrorKind::BadRequest,
            Error::Unauthorized(_) => ErrorKind::Unauthorized,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::Client { .. } => ErrorKind::Client,
            Error::EmptyBody(_) => ErrorKind::EmptyBody,
            Error::Decode(_) => ErrorKind::Decode,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Auth(_) => ErrorKind::Auth,
            Error::Config(_) => ErrorKind::Config,
            Error::Vault(_) | Error::Io(_) => ErrorKind::Storage,
            Error::Other(_) => ErrorKind::Other,
        }
    }

    /// Timeouts, connection failures and 5xx responses.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network { .. } | Error::Server { .. })
    }

    /// True when the UI must send the user back to the sign-in screen.
    pub fn requires_reauthentication(&self) -> bool {
        matches!(self, Error::Unauthorized(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

fn truncate(body: &str, max: usize) -> String {
    if body.len() <= max {
        return body.to_string();
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(Error::from_status(400, "bad").kind(), ErrorKind::BadRequest);
        assert_eq!(Error::from_status(401, "").kind(), ErrorKind::Unauthorized);
        assert_eq!(Error::from_status(403, "").kind(), ErrorKind::Forbidden);
        assert_eq!(Error::from_status(404, "").kind(), ErrorKind::NotFound);
        assert_eq!(Error::from_status(429, "").kind(), ErrorKind::RateLimited);
        assert_eq!(Error::from_status(418, "").kind(), ErrorKind::Client);
        assert_eq!(Error::from_status(503, "").kind(), ErrorKind::Server);
    }

    #[test]
    fn test_rate_limited_keeps_body() {
        match Error::from_status(429, "slow down") {
            Error::RateLimited {
                retry_after_ms,
                message,
            } => {
                assert_eq!(retry_after_ms, None);
                assert_eq!(message, "slow down");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_only_network_and_server_are_transient() {
        assert!(Error::from_status(502, "").is_transient());
        assert!(Error::Network {
            message: "connection reset".into(),
            timeout: false
        }
        .is_transient());
        assert!(!Error::from_status(404, "").is_transient());
        assert!(!Error::from_status(401, "").is_transient());
        assert!(!Error::Validation("humidity 140%".into()).is_transient());
    }

    #[test]
    fn test_unauthorized_requires_reauthentication() {
        assert!(Error::from_status(401, "").requires_reauthentication());
        assert!(!Error::from_status(403, "").requires_reauthentication());
    }

    #[test]
    fn test_long_bodies_are_truncated_on_char_boundary() {
        let body = "é".repeat(400);
        match Error::from_status(500, &body) {
            Error::Server { message, .. } => {
                assert!(message.len() <= 500);
                assert!(message.chars().all(|c| c == 'é'));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
