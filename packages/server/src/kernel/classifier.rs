//! Error classification for retry decisions.
//!
//! Given a handler failure, decide whether it is worth retrying and which
//! base backoff delay fits. Classification is deterministic: structured
//! `code`/`status` fields win over message substrings, and anything
//! unrecognised is a non-retryable `Unknown`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Failure taxonomy consumed by the retry controller and the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    RateLimit,
    Server,
    Client,
    Filesystem,
    Validation,
    #[default]
    Unknown,
}

impl ErrorCategory {
    /// Transient categories are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::RateLimit
                | ErrorCategory::Server
        )
    }

    /// Suggested base delay before exponential scaling.
    pub fn base_delay(&self) -> Duration {
        match self {
            ErrorCategory::Server => Duration::from_secs(10),
            ErrorCategory::RateLimit => Duration::from_secs(60),
            _ => Duration::from_secs(5),
        }
    }
}

/// A handler failure in the shape the classifier understands.
///
/// Handlers can build these directly, or convert from `anyhow::Error` /
/// `std::io::Error` and let the structured fields default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    /// Symbolic code (`ETIMEDOUT`, `ENOENT`, ...).
    pub code: Option<String>,
    /// HTTP-style status, when the failure came from a remote call.
    pub status: Option<u16>,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            status: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
            status: None,
        }
    }

    pub fn with_status(message: impl Into<String>, status: u16) -> Self {
        Self {
            message: message.into(),
            code: None,
            status: Some(status),
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        // Preserve the io code when the chain bottoms out in an io error.
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            let code = io_code(io.kind());
            return Self {
                message: format!("{err:#}"),
                code: code.map(str::to_string),
                status: None,
            };
        }
        Self::new(format!("{err:#}"))
    }
}

impl From<std::io::Error> for JobError {
    fn from(err: std::io::Error) -> Self {
        Self {
            message: err.to_string(),
            code: io_code(err.kind()).map(str::to_string),
            status: None,
        }
    }
}

fn io_code(kind: std::io::ErrorKind) -> Option<&'static str> {
    use std::io::ErrorKind;
    match kind {
        ErrorKind::NotFound => Some("ENOENT"),
        ErrorKind::PermissionDenied => Some("EACCES"),
        ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
        ErrorKind::ConnectionReset => Some("ECONNRESET"),
        ErrorKind::ConnectionAborted => Some("ECONNABORTED"),
        ErrorKind::NotConnected => Some("ENOTCONN"),
        ErrorKind::BrokenPipe => Some("EPIPE"),
        ErrorKind::TimedOut => Some("ETIMEDOUT"),
        ErrorKind::AlreadyExists => Some("EEXIST"),
        _ => None,
    }
}

/// The classifier's verdict.
#[derive(Debug, Clone)]
pub struct Classification {
    pub category: ErrorCategory,
    pub retryable: bool,
    pub code: Option<String>,
    pub base_delay: Duration,
    /// Which rule matched, for logs and alerts.
    pub reason: &'static str,
}

/// Classify a failure. Total: any input produces a verdict, with
/// `Unknown`/non-retryable as the safe default.
pub fn classify(error: &JobError) -> Classification {
    let (category, reason) = categorize(error);
    Classification {
        category,
        retryable: category.is_retryable(),
        code: error.code.clone(),
        base_delay: category.base_delay(),
        reason,
    }
}

fn categorize(error: &JobError) -> (ErrorCategory, &'static str) {
    if let Some(code) = error.code.as_deref() {
        match code {
            "ETIMEDOUT" | "ETIME" | "ESOCKETTIMEDOUT" => {
                return (ErrorCategory::Timeout, "timeout code")
            }
            "ECONNREFUSED" | "ECONNRESET" | "ECONNABORTED" | "ENOTCONN" | "EPIPE"
            | "ENOTFOUND" | "EAI_AGAIN" | "ENETUNREACH" | "EHOSTUNREACH" => {
                return (ErrorCategory::Network, "network code")
            }
            "ENOENT" | "EACCES" | "EPERM" | "EISDIR" | "ENOTDIR" | "EEXIST" => {
                return (ErrorCategory::Filesystem, "filesystem code")
            }
            _ => {}
        }
    }

    if let Some(status) = error.status {
        match status {
            408 => return (ErrorCategory::Timeout, "408 status"),
            429 => return (ErrorCategory::RateLimit, "429 status"),
            500..=599 => return (ErrorCategory::Server, "5xx status"),
            400..=499 => return (ErrorCategory::Client, "4xx status"),
            _ => {}
        }
    }

    let message = error.message.to_lowercase();
    if message.contains("timed out") || message.contains("timeout") {
        return (ErrorCategory::Timeout, "timeout message");
    }
    if message.contains("rate limit") || message.contains("too many requests") {
        return (ErrorCategory::RateLimit, "rate limit message");
    }
    if message.contains("connection refused")
        || message.contains("connection reset")
        || message.contains("socket hang up")
        || message.contains("dns")
        || message.contains("network")
    {
        return (ErrorCategory::Network, "network message");
    }
    if message.contains("no such file") || message.contains("permission denied") {
        return (ErrorCategory::Filesystem, "filesystem message");
    }
    if message.contains("validation") || message.contains("invalid") {
        return (ErrorCategory::Validation, "validation message");
    }

    (ErrorCategory::Unknown, "no rule matched")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_code_is_retryable_with_5s_base() {
        let verdict = classify(&JobError::with_code("socket timed out", "ETIMEDOUT"));
        assert_eq!(verdict.category, ErrorCategory::Timeout);
        assert!(verdict.retryable);
        assert_eq!(verdict.base_delay, Duration::from_secs(5));
    }

    #[test]
    fn enoent_is_filesystem_and_terminal() {
        let verdict = classify(&JobError::with_code("missing repo", "ENOENT"));
        assert_eq!(verdict.category, ErrorCategory::Filesystem);
        assert!(!verdict.retryable);
    }

    #[test]
    fn rate_limit_status_gets_60s_base() {
        let verdict = classify(&JobError::with_status("slow down", 429));
        assert_eq!(verdict.category, ErrorCategory::RateLimit);
        assert_eq!(verdict.base_delay, Duration::from_secs(60));
    }

    #[test]
    fn server_status_gets_10s_base() {
        let verdict = classify(&JobError::with_status("bad gateway", 502));
        assert_eq!(verdict.category, ErrorCategory::Server);
        assert!(verdict.retryable);
        assert_eq!(verdict.base_delay, Duration::from_secs(10));
    }

    #[test]
    fn client_status_is_terminal() {
        let verdict = classify(&JobError::with_status("bad request", 400));
        assert_eq!(verdict.category, ErrorCategory::Client);
        assert!(!verdict.retryable);
    }

    #[test]
    fn code_wins_over_message() {
        // The message mentions a timeout but the code says filesystem.
        let verdict = classify(&JobError::with_code("timeout reading file", "ENOENT"));
        assert_eq!(verdict.category, ErrorCategory::Filesystem);
    }

    #[test]
    fn message_fallback_matches_substrings() {
        let verdict = classify(&JobError::new("upstream connection reset by peer"));
        assert_eq!(verdict.category, ErrorCategory::Network);
    }

    #[test]
    fn anything_else_is_unknown_and_terminal() {
        let verdict = classify(&JobError::new("flux capacitor misaligned"));
        assert_eq!(verdict.category, ErrorCategory::Unknown);
        assert!(!verdict.retryable);
    }

    #[test]
    fn io_error_conversion_keeps_the_code() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err: JobError = io.into();
        assert_eq!(err.code.as_deref(), Some("ENOENT"));
    }
}
