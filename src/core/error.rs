//! Error types for itinerary-routing
//!
//! Provides the error taxonomy shared by the resolver, the provider client,
//! the cache and the orchestrator.

use std::fmt;

/// Main error type for itinerary-routing operations
#[derive(Debug)]
pub enum Error {
    /// Coordinates outside the valid latitude/longitude range
    InvalidCoordinates { lat: f64, lon: f64 },

    /// Fewer than two usable waypoints remain for a day
    InsufficientWaypoints { found: usize },

    /// A leg could not be routed after all retries were spent
    RoutingFailed { attempts: u32, reason: String },

    /// The provider answered HTTP 429
    ProviderRateLimited,

    /// The provider answered with a non-success status or error code
    ProviderError { status: u16, message: String },

    /// The provider body could not be decoded
    MalformedResponse(String),

    /// Connection or timeout failure
    NetworkError(String),

    /// HTTP-specific error
    HttpError(String),

    /// The place lookup collaborator had no coordinates for an identifier
    PlaceNotFound(String),

    /// A computation for this day key is already in flight
    AlreadyCalculating(String),

    /// The computation was cancelled before completion
    Cancelled(String),

    /// Invalid configuration or parameters
    InvalidInput(String),

    /// File I/O error
    IoError(std::io::Error),
}

impl Error {
    /// Whether the provider retry loop may try again after this error.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::ProviderRateLimited
            | Error::NetworkError(_)
            | Error::MalformedResponse(_) => true,
            Error::ProviderError { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidCoordinates { lat, lon } => {
                write!(f, "Invalid coordinates: ({lat}, {lon})")
            }
            Error::InsufficientWaypoints { found } => {
                write!(f, "insufficient waypoints: need at least 2, found {found}")
            }
            Error::RoutingFailed { attempts, reason } => {
                write!(f, "Routing failed after {attempts} attempt(s): {reason}")
            }
            Error::ProviderRateLimited => {
                write!(f, "Routing provider rate limit exceeded")
            }
            Error::ProviderError { status, message } => {
                write!(f, "Routing provider error ({status}): {message}")
            }
            Error::MalformedResponse(msg) => {
                write!(f, "Malformed provider response: {msg}")
            }
            Error::NetworkError(msg) => {
                write!(f, "Network error: {msg}")
            }
            Error::HttpError(msg) => {
                write!(f, "HTTP error: {msg}")
            }
            Error::PlaceNotFound(id) => {
                write!(f, "Place '{id}' not found")
            }
            Error::AlreadyCalculating(day) => {
                write!(f, "Routes for day '{day}' are already being calculated")
            }
            Error::Cancelled(day) => {
                write!(f, "Route calculation for day '{day}' was cancelled")
            }
            Error::InvalidInput(msg) => {
                write!(f, "Invalid input: {msg}")
            }
            Error::IoError(err) => {
                write!(f, "I/O error: {err}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Error::NetworkError(err.to_string())
        } else if err.is_decode() {
            Error::MalformedResponse(err.to_string())
        } else {
            Error::HttpError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::MalformedResponse(err.to_string())
    }
}

/// Convenience result type for itinerary-routing operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::ProviderRateLimited.is_transient());
        assert!(Error::NetworkError("timed out".to_string()).is_transient());
        assert!(Error::MalformedResponse("eof".to_string()).is_transient());
        assert!(Error::ProviderError { status: 503, message: "busy".to_string() }.is_transient());

        let client_error = Error::ProviderError {
            status: 400,
            message: "NoRoute".to_string(),
        };
        assert!(!client_error.is_transient());
        assert!(!Error::InvalidCoordinates { lat: 91.0, lon: 0.0 }.is_transient());
        assert!(!Error::HttpError("builder".to_string()).is_transient());
    }

    #[test]
    fn test_insufficient_waypoints_message() {
        let err = Error::InsufficientWaypoints { found: 1 };
        assert!(err.to_string().starts_with("insufficient waypoints"));
    }

    #[test]
    fn test_io_error_source() {
        use std::error::Error as _;

        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert!(err.source().is_some());
        assert!(Error::ProviderRateLimited.source().is_none());
    }

    #[test]
    fn test_json_error_is_malformed_response() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = parse.into();
        assert!(matches!(err, Error::MalformedResponse(_)));
    }
}
