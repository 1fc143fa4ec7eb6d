//! Shared constants for structured API errors.

use std::fmt;

pub const ERROR_TYPE_API: &str = "api_error";
pub const ERROR_TYPE_INVALID_REQUEST: &str = "invalid_request_error";
pub const ERROR_TYPE_AUTHENTICATION: &str = "authentication_error";
pub const ERROR_TYPE_RATE_LIMIT: &str = "rate_limit_error";
pub const ERROR_TYPE_OVERLOADED: &str = "overloaded_error";
pub const ERROR_TYPE_NOT_FOUND: &str = "not_found_error";
pub const ERROR_TYPE_UPSTREAM: &str = "upstream_error";

pub const ERROR_CODE_RESOURCE_EXHAUSTED: &str = "RESOURCE_EXHAUSTED";
pub const ERROR_CODE_INVALID_ARGUMENT: &str = "INVALID_ARGUMENT";
pub const ERROR_CODE_UNAUTHENTICATED: &str = "UNAUTHENTICATED";
pub const ERROR_CODE_NOT_FOUND: &str = "NOT_FOUND";
pub const ERROR_CODE_INTERNAL: &str = "INTERNAL";
pub const ERROR_CODE_UNAVAILABLE: &str = "UNAVAILABLE";

/// Error type string used in OpenAI and Claude error bodies for a status code.
pub fn error_type_for_status(status: u16) -> &'static str {
    match status {
        400 | 413 | 422 => ERROR_TYPE_INVALID_REQUEST,
        401 | 403 => ERROR_TYPE_AUTHENTICATION,
        404 => ERROR_TYPE_NOT_FOUND,
        429 => ERROR_TYPE_RATE_LIMIT,
        529 => ERROR_TYPE_OVERLOADED,
        _ => ERROR_TYPE_API,
    }
}

/// Google RPC status string used in Gemini error bodies for a status code.
pub fn google_status_for(status: u16) -> &'static str {
    match status {
        400 => ERROR_CODE_INVALID_ARGUMENT,
        401 | 403 => ERROR_CODE_UNAUTHENTICATED,
        404 => ERROR_CODE_NOT_FOUND,
        429 => ERROR_CODE_RESOURCE_EXHAUSTED,
        503 | 529 => ERROR_CODE_UNAVAILABLE,
        _ => ERROR_CODE_INTERNAL,
    }
}

/// How a failed attempt is treated by the failover loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    QuotaExceeded,
    Failed,
}

impl AttemptOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
