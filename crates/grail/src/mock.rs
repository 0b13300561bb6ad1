//! Test double for [`Provider`]; makes no network calls.
//!
//! ```ignore
//! let provider = MockProvider::new().with_generate(|_req| {
//!     Ok(Response { outputs: vec![OutputPart::Text { text: "mock".into() }], ..Default::default() })
//! });
//! let client = Client::new(provider);
//! ```

use async_trait::async_trait;
use std::sync::Arc;

use grail_types::{GrailError, Result};

use crate::{
    LoggerAware, ModelCatalog, ModelInfo, ModelLister, ModelResolver, ModelRole, ModelTier,
    Provider, Request, Response,
};

type GenerateFn = dyn Fn(&Request) -> Result<Response> + Send + Sync;

#[derive(Clone)]
pub struct MockProvider {
    name: String,
    text_model: String,
    image_model: String,
    generate_fn: Option<Arc<GenerateFn>>,
    catalog: Option<ModelCatalog>,
    span: tracing::Span,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            text_model: "mock-text".to_string(),
            image_model: "mock-image".to_string(),
            generate_fn: None,
            catalog: None,
            span: tracing::Span::none(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_generate<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request) -> Result<Response> + Send + Sync + 'static,
    {
        self.generate_fn = Some(Arc::new(f));
        self
    }

    /// Always answer with a clone of `response`.
    pub fn with_response(self, response: Response) -> Self {
        self.with_generate(move |_| Ok(response.clone()))
    }

    /// Enables model listing and tier resolution backed by `catalog`.
    pub fn with_catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self, role: ModelRole) -> &str {
        match role {
            ModelRole::Text => &self.text_model,
            ModelRole::Image => &self.image_model,
        }
    }

    async fn generate(&self, request: &Request) -> Result<Response> {
        self.span.in_scope(|| {
            tracing::debug!(provider = %self.name, inputs = request.inputs.len(), "mock generate")
        });
        match &self.generate_fn {
            Some(f) => f(request),
            None => Err(GrailError::internal("mock generate function not set")
                .with_provider(self.name.clone())),
        }
    }

    fn model_lister(&self) -> Option<&dyn ModelLister> {
        self.catalog.as_ref().map(|_| self as &dyn ModelLister)
    }

    fn model_resolver(&self) -> Option<&dyn ModelResolver> {
        self.catalog.as_ref().map(|_| self as &dyn ModelResolver)
    }

    fn logger_aware(&mut self) -> Option<&mut dyn LoggerAware> {
        Some(self)
    }
}

#[async_trait]
impl ModelLister for MockProvider {
    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(self.catalog.as_ref().map(ModelCatalog::to_vec).unwrap_or_default())
    }
}

impl ModelResolver for MockProvider {
    fn resolve_model(&self, role: ModelRole, tier: ModelTier) -> Result<String> {
        match &self.catalog {
            Some(catalog) => catalog.resolve(role, tier),
            None => Err(GrailError::unsupported("mock provider has no catalog")),
        }
    }
}

impl LoggerAware for MockProvider {
    fn set_span(&mut self, span: tracing::Span) {
        self.span = span;
    }
}
