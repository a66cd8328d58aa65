use std::time::SystemTime;
use thiserror::Error;

/// Type alias for Result with LabelerError
pub type Result<T> = std::result::Result<T, LabelerError>;

/// Error types for the labeling engine
#[derive(Error, Debug)]
pub enum LabelerError {
    /// Gmail API returned an error that fits no other category
    #[error("Gmail API error: {0}")]
    ApiError(String),

    /// Credentials cannot be used (missing, revoked, or rejected)
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Rate limit exceeded - should retry after specified seconds
    #[error("Rate limit exceeded, retry after {retry_after} seconds")]
    RateLimitExceeded { retry_after: u64 },

    /// Network-related error (connection issues, timeouts, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Server returned 5xx error
    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Resource not found (404)
    #[error("Not found: {0}")]
    MessageNotFound(String),

    /// Bad request (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Forbidden (403)
    #[error("Access forbidden: {0}")]
    Forbidden(String),

    /// A label with the same name already exists remotely (409)
    #[error("Label already exists: {0}")]
    LabelConflict(String),

    /// A rule's target label could not be resolved or created
    #[error("Failed to resolve label '{label}': {reason}")]
    ResolutionError { label: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The run was cancelled before the operation started
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Coarse error classes the orchestrator reasons about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Credentials unusable; aborts the whole run
    Auth,
    /// Label could not be resolved; aborts one rule
    Resolution,
    /// Transient provider condition; retried with backoff
    Retryable,
    /// Permanent failure of a single operation; never retried
    Terminal,
    /// Malformed configuration; aborts before any provider call
    Config,
    /// Cooperative cancellation
    Cancelled,
}

impl LabelerError {
    /// Check if the error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LabelerError::RateLimitExceeded { .. }
                | LabelerError::ServerError { .. }
                | LabelerError::NetworkError(_)
        )
    }

    /// Errors that must abort the whole run rather than a single rule
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, LabelerError::AuthError(_) | LabelerError::ConfigError(_))
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            LabelerError::AuthError(_) => ErrorClass::Auth,
            LabelerError::ResolutionError { .. } => ErrorClass::Resolution,
            LabelerError::ConfigError(_) => ErrorClass::Config,
            LabelerError::Cancelled(_) => ErrorClass::Cancelled,
            e if e.is_transient() => ErrorClass::Retryable,
            _ => ErrorClass::Terminal,
        }
    }

    /// Seconds the provider asked us to wait, if it said so
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            LabelerError::RateLimitExceeded { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Used when a 429 carries no usable `Retry-After`
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Seconds to wait according to a `Retry-After` value
///
/// Accepts delay-seconds or an HTTP-date. Anything unparseable, or a date
/// already in the past, falls back to [`DEFAULT_RETRY_AFTER_SECS`].
fn retry_after_secs(value: Option<&str>, now: SystemTime) -> u64 {
    let Some(value) = value.map(str::trim) else {
        return DEFAULT_RETRY_AFTER_SECS;
    };

    if let Ok(secs) = value.parse::<u64>() {
        return secs;
    }

    httpdate::parse_http_date(value)
        .ok()
        .and_then(|at| at.duration_since(now).ok())
        .map(|wait| wait.as_secs())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

/// Reasons Gmail attaches to a 403 when the caller is being throttled
const RATE_LIMIT_REASONS: &[&str] = &["userRateLimitExceeded", "rateLimitExceeded", "quotaExceeded"];

/// Whether a decoded JSON error body describes throttling rather than a
/// permission problem
fn is_rate_limit_body(body: &serde_json::Value) -> bool {
    let reasons = body
        .pointer("/error/errors")
        .and_then(|e| e.as_array())
        .into_iter()
        .flatten()
        .filter_map(|e| e.get("reason").and_then(|r| r.as_str()));
    let status = body.pointer("/error/status").and_then(|s| s.as_str());

    reasons
        .chain(status)
        .any(|reason| RATE_LIMIT_REASONS.contains(&reason) || reason == "RESOURCE_EXHAUSTED")
        || body
            .pointer("/error/message")
            .and_then(|m| m.as_str())
            .is_some_and(|m| m.to_ascii_lowercase().contains("rate limit exceeded"))
}

/// Classify an HTTP status the same way whether it came back as a bare
/// response or as a decoded JSON error body
fn from_status(status: u16, message: String, retry_after: u64) -> LabelerError {
    match status {
        429 => LabelerError::RateLimitExceeded { retry_after },
        401 => LabelerError::AuthError(message),
        400 => LabelerError::BadRequest(message),
        403 => LabelerError::Forbidden(message),
        404 => LabelerError::MessageNotFound(message),
        409 => LabelerError::LabelConflict(message),
        500..=599 => LabelerError::ServerError { status, message },
        _ => LabelerError::ApiError(message),
    }
}

impl From<google_gmail1::Error> for LabelerError {
    fn from(error: google_gmail1::Error) -> Self {
        use google_gmail1::Error as Gmail;

        match error {
            Gmail::Failure(response) => {
                let status = response.status();
                let retry_after = retry_after_secs(
                    response
                        .headers()
                        .get(hyper::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok()),
                    SystemTime::now(),
                );
                let message = format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                );
                from_status(status.as_u16(), message, retry_after)
            }
            // Gmail reports most API errors (duplicate label names included)
            // as a JSON body carrying the status code
            Gmail::BadRequest(body) => {
                let code = body
                    .pointer("/error/code")
                    .and_then(|c| c.as_u64())
                    .and_then(|c| u16::try_from(c).ok())
                    .unwrap_or(400);
                let message = body
                    .pointer("/error/message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| body.to_string());
                if code == 403 && is_rate_limit_body(&body) {
                    return LabelerError::RateLimitExceeded {
                        retry_after: DEFAULT_RETRY_AFTER_SECS,
                    };
                }
                from_status(code, message, DEFAULT_RETRY_AFTER_SECS)
            }
            Gmail::MissingToken(err) => {
                LabelerError::AuthError(format!("No usable access token: {}", err))
            }
            Gmail::HttpError(err) => LabelerError::NetworkError(format!("Connection error: {}", err)),
            Gmail::Io(err) => LabelerError::NetworkError(err.to_string()),
            other => LabelerError::ApiError(other.to_string()),
        }
    }
}
