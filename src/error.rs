use std::fmt;
use thiserror::Error;
use tokio::time::Duration;

/// Main error type for the wiretap proxy
#[derive(Error, Debug, Clone)]
pub enum WiretapError {
    /// Configuration related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// No route matched the incoming request
    #[error("No route for {method} {path}")]
    NoRoute { method: String, path: String },

    /// No upstream URL could be selected for a matched route
    #[error("No healthy upstream: {message}")]
    NoHealthyUpstream { message: String },

    /// Network or protocol error on the upstream call
    #[error("Upstream error: {message}")]
    Upstream { message: String },

    /// Copying a request or response body failed mid-stream
    #[error("Body copy error: {message}")]
    BodyCopy { message: String },

    /// Timeout errors
    #[error("Operation timed out after {duration:?}: {operation}")]
    Timeout {
        duration: Duration,
        operation: String,
    },

    /// Journal / history persistence errors
    #[error("Journal error: {message}")]
    Journal { message: String },

    /// File system errors
    #[error("File system error: {message}")]
    FileSystem { message: String },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl WiretapError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a no-route error
    pub fn no_route<S: Into<String>, T: Into<String>>(method: S, path: T) -> Self {
        Self::NoRoute {
            method: method.into(),
            path: path.into(),
        }
    }

    /// Create a no-healthy-upstream error
    pub fn no_healthy_upstream<S: Into<String>>(message: S) -> Self {
        Self::NoHealthyUpstream {
            message: message.into(),
        }
    }

    /// Create an upstream call error
    pub fn upstream<S: Into<String>>(message: S) -> Self {
        Self::Upstream {
            message: message.into(),
        }
    }

    /// Create a body copy error
    pub fn body_copy<S: Into<String>>(message: S) -> Self {
        Self::BodyCopy {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(duration: Duration, operation: S) -> Self {
        Self::Timeout {
            duration,
            operation: operation.into(),
        }
    }

    /// Create a journal error
    pub fn journal<S: Into<String>>(message: S) -> Self {
        Self::Journal {
            message: message.into(),
        }
    }

    /// Create a file system error
    pub fn file_system<S: Into<String>>(message: S) -> Self {
        Self::FileSystem {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if the error is retryable.
    ///
    /// Classification is a case-insensitive substring match against the
    /// error text, so errors bubbled up from hyper, the OS resolver, or the
    /// connector are all classified the same way regardless of which layer
    /// produced them. Timeouts are retryable by construction.
    pub fn is_retryable(&self) -> bool {
        if matches!(self, WiretapError::Timeout { .. }) {
            return true;
        }

        const RETRYABLE: &[&str] = &[
            "unexpected eof",
            "connection reset by peer",
            "no such host",
            "timeout",
            "network is unreachable",
            "connection refused",
            "temporary failure",
        ];

        let text = self.to_string().to_lowercase();
        RETRYABLE.iter().any(|needle| text.contains(needle))
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            WiretapError::Config { .. } => ErrorSeverity::Critical,
            WiretapError::Journal { .. } => ErrorSeverity::High,
            WiretapError::FileSystem { .. } => ErrorSeverity::High,
            WiretapError::Internal { .. } => ErrorSeverity::High,
            WiretapError::NoHealthyUpstream { .. } => ErrorSeverity::Medium,
            WiretapError::Upstream { .. } => ErrorSeverity::Medium,
            WiretapError::Timeout { .. } => ErrorSeverity::Medium,
            WiretapError::NoRoute { .. } => ErrorSeverity::Low,
            WiretapError::BodyCopy { .. } => ErrorSeverity::Low,
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Low => write!(f, "LOW"),
            ErrorSeverity::Medium => write!(f, "MEDIUM"),
            ErrorSeverity::High => write!(f, "HIGH"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Result type alias for wiretap operations
pub type WiretapResult<T> = Result<T, WiretapError>;

/// Convert from anyhow::Error to WiretapError
impl From<anyhow::Error> for WiretapError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            return WiretapError::file_system(format!("IO error: {}", io_err));
        }

        if let Some(hyper_err) = err.downcast_ref::<hyper::Error>() {
            return WiretapError::upstream(format!("HTTP error: {}", hyper_err));
        }

        WiretapError::internal(err.to_string())
    }
}

/// Convert from std::io::Error to WiretapError
impl From<std::io::Error> for WiretapError {
    fn from(err: std::io::Error) -> Self {
        WiretapError::file_system(format!("IO error: {}", err))
    }
}

/// Convert from hyper::Error to WiretapError
impl From<hyper::Error> for WiretapError {
    fn from(err: hyper::Error) -> Self {
        if err.is_timeout() {
            WiretapError::timeout(Duration::from_secs(30), "HTTP request")
        } else {
            WiretapError::upstream(format!("HTTP error: {}", err))
        }
    }
}

/// Convert from serde_yaml::Error to WiretapError
impl From<serde_yaml::Error> for WiretapError {
    fn from(err: serde_yaml::Error) -> Self {
        WiretapError::config(format!("YAML parsing error: {}", err))
    }
}

/// Convert from serde_json::Error to WiretapError
impl From<serde_json::Error> for WiretapError {
    fn from(err: serde_json::Error) -> Self {
        WiretapError::internal(format!("JSON serialization error: {}", err))
    }
}

/// Convert from hyper::http::uri::InvalidUri to WiretapError
impl From<hyper::http::uri::InvalidUri> for WiretapError {
    fn from(err: hyper::http::uri::InvalidUri) -> Self {
        WiretapError::upstream(format!("Invalid URI: {}", err))
    }
}

/// Convert from hyper::http::Error to WiretapError
impl From<hyper::http::Error> for WiretapError {
    fn from(err: hyper::http::Error) -> Self {
        WiretapError::upstream(format!("HTTP error: {}", err))
    }
}

/// Convert from tokio::time::error::Elapsed to WiretapError
impl From<tokio::time::error::Elapsed> for WiretapError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        WiretapError::timeout(Duration::from_secs(30), "operation")
    }
}
