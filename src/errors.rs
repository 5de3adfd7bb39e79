//! Error taxonomy for the loading engine.
//!
//! `LoaderError` implements §7's six abstract error kinds (the ones that
//! can make the loop refuse to start, or that are fatal to a running
//! batch). `ErrorCategory` classifies individual transfer outcomes for
//! Prometheus labels and log lines; this half is carried over largely
//! unchanged from the ambient error-categorization this codebase already
//! had for HTTP responses.

use std::fmt;

use thiserror::Error;

/// §7's abstract error kinds. `Configuration` and `Environment` cause the
/// loop to refuse to start; `Internal` is fatal to a running batch; the
/// rest are routed through the trace callback as per-request outcomes and
/// do not themselves stop the loop.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("environment error: {0}")]
    Environment(String),

    #[error("transfer error: {0}")]
    Transfer(String),

    #[error("application error: {0}")]
    Application(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal consistency error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoaderError {
    /// Whether this error should cause the loop to refuse to start (§7:
    /// Configuration and Environment errors), as opposed to being routed
    /// through the trace callback for a single client.
    pub fn refuses_start(&self) -> bool {
        matches!(self, LoaderError::Configuration(_) | LoaderError::Environment(_))
    }
}

/// Categories of errors observed while driving transfers, used for
/// Prometheus labels and the `.log` trace lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    ClientError,
    ServerError,
    NetworkError,
    TimeoutError,
    TlsError,
    OtherError,
}

impl ErrorCategory {
    pub fn from_status_code(status_code: u16) -> Option<Self> {
        match status_code {
            100..=399 => None,
            400..=499 => Some(ErrorCategory::ClientError),
            500..=599 => Some(ErrorCategory::ServerError),
            _ => Some(ErrorCategory::OtherError),
        }
    }

    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            ErrorCategory::TimeoutError
        } else if error.is_connect() {
            ErrorCategory::NetworkError
        } else if error.is_request() || error.is_body() || error.is_decode() {
            ErrorCategory::NetworkError
        } else if error.is_redirect() {
            ErrorCategory::ClientError
        } else {
            let msg = error.to_string().to_lowercase();
            if msg.contains("certificate") || msg.contains("tls") || msg.contains("ssl") {
                ErrorCategory::TlsError
            } else if msg.contains("timeout") {
                ErrorCategory::TimeoutError
            } else if msg.contains("dns") || msg.contains("resolve") || msg.contains("connect") {
                ErrorCategory::NetworkError
            } else {
                ErrorCategory::OtherError
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::ClientError => "client_error",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::TimeoutError => "timeout_error",
            ErrorCategory::TlsError => "tls_error",
            ErrorCategory::OtherError => "other_error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}
