use grail_types::{GrailError, Result};

use crate::{Output, Provider, Request};

/// Pick the concrete model name a provider should call.
///
/// Order: an explicit `model` verbatim (never checked against the catalog),
/// then `tier` through the provider's resolver, then the provider default for
/// the output's role. A tier request against a provider without a resolver
/// falls back to the default as well.
pub fn resolve_model(request: &Request, provider: &dyn Provider) -> Result<String> {
    if let Some(model) = request.model_name() {
        return Ok(model.to_string());
    }

    let role = request
        .output
        .as_ref()
        .map(Output::model_role)
        .ok_or_else(|| GrailError::invalid_argument("output must be set"))?;

    if let Some(tier) = request.tier {
        if let Some(resolver) = provider.model_resolver() {
            return resolver.resolve_model(role, tier).map_err(|e| {
                GrailError::invalid_argument(format!(
                    "{}: cannot resolve {role} model for tier {tier}",
                    provider.name()
                ))
                .with_provider(provider.name())
                .with_cause(e)
            });
        }
        tracing::debug!(
            provider = provider.name(),
            %role,
            %tier,
            "provider has no model resolver, using default model"
        );
    }

    Ok(provider.default_model(role).to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
