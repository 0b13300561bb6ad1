use async_trait::async_trait;
use std::sync::Arc;

use grail_types::{ErrorCode, GrailError, Result};

use crate::{ModelInfo, ModelRole, ModelTier, Request, Response};

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// The seam every backend implements.
///
/// `generate` routes on the request's output kind, converts each input to the
/// vendor's content representation in order, and classifies vendor failures
/// (rate limiting, timeouts, 5xx) as retryable.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Model used when a request names neither a model nor a tier.
    fn default_model(&self, role: ModelRole) -> &str;

    async fn generate(&self, request: &Request) -> Result<Response>;

    fn model_lister(&self) -> Option<&dyn ModelLister> {
        None
    }

    fn model_resolver(&self) -> Option<&dyn ModelResolver> {
        None
    }

    fn logger_aware(&mut self) -> Option<&mut dyn LoggerAware> {
        None
    }
}

// ---------------------------------------------------------------------------
// Optional capabilities
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ModelLister: Send + Sync {
    async fn list_models(&self) -> Result<Vec<ModelInfo>>;
}

pub trait ModelResolver: Send + Sync {
    /// Concrete model name for (role, tier).
    fn resolve_model(&self, role: ModelRole, tier: ModelTier) -> Result<String>;
}

/// Accepts the client's span so provider events nest under it.
pub trait LoggerAware {
    fn set_span(&mut self, span: tracing::Span);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderCapabilities {
    pub model_listing: bool,
    pub model_resolution: bool,
}

// ---------------------------------------------------------------------------
// DynProvider
// ---------------------------------------------------------------------------

/// Shared, type-erased provider. Cloning is cheap.
#[derive(Clone)]
pub struct DynProvider(Arc<dyn Provider>);

impl DynProvider {
    pub fn new(provider: impl Provider + 'static) -> Self {
        Self(Arc::new(provider))
    }

    pub fn as_provider(&self) -> &dyn Provider {
        self.0.as_ref()
    }

    pub async fn generate(&self, request: &Request) -> Result<Response> {
        self.0.generate(request).await
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn default_model(&self, role: ModelRole) -> &str {
        self.0.default_model(role)
    }

    pub fn model_lister(&self) -> Option<&dyn ModelLister> {
        self.0.model_lister()
    }

    pub fn model_resolver(&self) -> Option<&dyn ModelResolver> {
        self.0.model_resolver()
    }

    pub fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            model_listing: self.0.model_lister().is_some(),
            model_resolution: self.0.model_resolver().is_some(),
        }
    }
}

impl std::fmt::Debug for DynProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DynProvider").field(&self.name()).finish()
    }
}

// ---------------------------------------------------------------------------
// Shared adapter helpers
// ---------------------------------------------------------------------------

/// Heuristic for vendor errors that expose no structured retry signal.
pub(crate) fn looks_retryable(message: &str) -> bool {
    let msg = message.to_ascii_lowercase();
    ["rate_limit", "rate limit", "timeout", "timed out", "temporary", "503", "429"]
        .iter()
        .any(|needle| msg.contains(needle))
}

const POLICY_CODES: &[&str] = &[
    "content_policy_violation",
    "moderation_blocked",
    "content_filter",
    "safety",
];

/// Classify a non-2xx vendor response.
pub(crate) fn map_http_error(provider: &str, status: reqwest::StatusCode, body: &str) -> GrailError {
    let parsed = serde_json::from_str::<serde_json::Value>(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|v| v["error"]["message"].as_str())
        .map(String::from)
        .unwrap_or_else(|| body.to_string());
    let vendor_code = parsed
        .as_ref()
        .and_then(|v| v["error"]["code"].as_str().or_else(|| v["error"]["status"].as_str()))
        .map(|c| c.to_ascii_lowercase())
        .unwrap_or_default();

    let status_u16 = status.as_u16();
    let code = match status_u16 {
        401 | 403 => ErrorCode::Unauthorized,
        429 => ErrorCode::RateLimited,
        408 | 504 => ErrorCode::Timeout,
        400 if POLICY_CODES.iter().any(|p| vendor_code.contains(p)) => ErrorCode::Refused,
        400 => ErrorCode::InvalidArgument,
        500..=599 => ErrorCode::Unavailable,
        _ => ErrorCode::Internal,
    };

    let err = GrailError::new(code, format!("{provider}: HTTP {status_u16}: {message}"))
        .with_provider(provider);
    if code == ErrorCode::Internal {
        err.with_retryable(looks_retryable(&message))
    } else {
        err
    }
}

/// Failure before any HTTP status was received.
pub(crate) fn transport_error(provider: &str, e: reqwest::Error) -> GrailError {
    let code = if e.is_timeout() {
        ErrorCode::Timeout
    } else {
        ErrorCode::Unavailable
    };
    GrailError::new(code, format!("{provider}: request failed: {e}"))
        .with_cause(e)
        .with_provider(provider)
        .with_retryable(true)
}

/// Vendor answered 2xx with a body we cannot interpret.
pub(crate) fn malformed_response(provider: &str, e: serde_json::Error) -> GrailError {
    GrailError::internal(format!("{provider}: failed to parse response JSON: {e}"))
        .with_cause(e)
        .with_provider(provider)
}

/// Read the API key: explicit value, else the named env var, else the
/// provider's default env var. An explicitly empty key is an error.
pub(crate) fn resolve_api_key(
    provider: &str,
    explicit: Option<String>,
    env_var: Option<&str>,
    default_env_var: &str,
) -> Result<String> {
    let key = match (explicit, env_var) {
        (Some(key), _) => key,
        (None, Some(var)) => std::env::var(var).unwrap_or_default(),
        (None, None) => std::env::var(default_env_var).unwrap_or_default(),
    };
    let key = key.trim().to_string();
    if key.is_empty() {
        let var = env_var.unwrap_or(default_env_var);
        return Err(GrailError::unauthorized(format!(
            "{provider}: API key required (set {var} or pass a key explicitly)"
        ))
        .with_provider(provider));
    }
    Ok(key)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
