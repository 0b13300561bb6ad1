//! Shared error types for the Grail generation client.
//!
//! This crate provides the error model used by every other Grail crate:
//! - `ErrorCode` — coarse, provider-independent error categories
//! - `GrailError` — the typed error carrying code, cause and provider context
//! - helpers that search an arbitrary error chain for a `GrailError`

use serde::{Deserialize, Serialize};
use std::fmt;

/// Boxed cause attached to a [`GrailError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Coarse-grained category for a Grail error. Callers branch on this, never
/// on the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed, oversized or mistyped input or option.
    InvalidArgument,
    /// Credential missing or rejected by the vendor.
    Unauthorized,
    /// Vendor throttling.
    RateLimited,
    /// Deadline exceeded, locally or at the vendor.
    Timeout,
    /// Transport failure or vendor outage.
    Unavailable,
    /// Capability not implemented by the bound provider.
    Unsupported,
    /// Vendor declined on policy or safety grounds.
    Refused,
    /// Vendor response failed a post-condition.
    OutputInvalid,
    /// Unexpected or uncategorized failure.
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::Unsupported => "unsupported",
            ErrorCode::Refused => "refused",
            ErrorCode::OutputInvalid => "output_invalid",
            ErrorCode::Internal => "internal",
        }
    }

    /// Retryability assumed when an error carries no explicit flag.
    pub fn is_retryable_by_default(&self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimited | ErrorCode::Timeout | ErrorCode::Unavailable
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// GrailError
// ---------------------------------------------------------------------------

/// Typed error returned by the client and every provider adapter.
///
/// Built with [`GrailError::new`] (or one of the per-code shorthands) followed
/// by the consuming `with_*` methods. Once returned it is never mutated.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct GrailError {
    code: ErrorCode,
    message: String,
    #[source]
    cause: Option<BoxError>,
    retryable: Option<bool>,
    provider: Option<String>,
    request_id: Option<String>,
}

impl GrailError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            retryable: None,
            provider: None,
            request_id: None,
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unsupported, message)
    }

    pub fn output_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::OutputInvalid, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Attach the underlying cause.
    pub fn with_cause(mut self, cause: impl Into<BoxError>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Set an explicit retryability flag, overriding the code default.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// The explicit flag as set at construction, if any.
    pub fn retryable_flag(&self) -> Option<bool> {
        self.retryable
    }

    /// Returns `true` if the operation may succeed on retry.
    ///
    /// `InvalidArgument` is never retryable. Otherwise an explicit flag wins,
    /// falling back to [`ErrorCode::is_retryable_by_default`].
    pub fn is_retryable(&self) -> bool {
        if self.code == ErrorCode::InvalidArgument {
            return false;
        }
        self.retryable
            .unwrap_or_else(|| self.code.is_retryable_by_default())
    }

    pub fn is_code(&self, code: ErrorCode) -> bool {
        self.code == code
    }
}

/// A convenience alias for `Result<T, GrailError>`.
pub type Result<T> = std::result::Result<T, GrailError>;

// ---------------------------------------------------------------------------
// Error-chain helpers
// ---------------------------------------------------------------------------

/// Walk `err` and its sources, returning the first `GrailError` found.
pub fn find_grail_error<'a>(
    err: &'a (dyn std::error::Error + 'static),
) -> Option<&'a GrailError> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(ge) = e.downcast_ref::<GrailError>() {
            return Some(ge);
        }
        current = e.source();
    }
    None
}

/// Code of the first `GrailError` in the chain, if any.
pub fn error_code(err: &(dyn std::error::Error + 'static)) -> Option<ErrorCode> {
    find_grail_error(err).map(GrailError::code)
}

/// Retryability of the first `GrailError` in the chain; untyped errors are
/// not retryable.
pub fn is_retryable(err: &(dyn std::error::Error + 'static)) -> bool {
    find_grail_error(err).is_some_and(GrailError::is_retryable)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
