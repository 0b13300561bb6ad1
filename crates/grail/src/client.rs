use std::time::Duration;

use grail_types::{GrailError, Result};

use crate::fetch::{self, Expected, DEFAULT_DOWNLOAD_MAX_BYTES, DEFAULT_DOWNLOAD_TIMEOUT};
use crate::{
    resolve_model, validate_request, DynProvider, Input, ModelInfo, ModelRole, ModelTier,
    Provider, ProviderCapabilities, Request, Response,
};

// ---------------------------------------------------------------------------
// ClientConfig
// ---------------------------------------------------------------------------

/// Settings for remote downloads and logging. Immutable once the client
/// is built.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub http_client: reqwest::Client,
    /// Largest body accepted by the `input_*_from_uri` helpers.
    pub download_max_bytes: u64,
    pub download_timeout: Duration,
    /// Parent span for request events; handed to `LoggerAware` providers.
    pub span: tracing::Span,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            http_client: reqwest::Client::new(),
            download_max_bytes: DEFAULT_DOWNLOAD_MAX_BYTES,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            span: tracing::Span::none(),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Single entry point over one provider: validates, resolves the model, logs
/// and dispatches. Responses come back exactly as the provider produced them.
///
/// Cloning is cheap; clones share the provider and HTTP connection pool.
#[derive(Debug, Clone)]
pub struct Client {
    provider: DynProvider,
    config: ClientConfig,
}

impl Client {
    pub fn new(provider: impl Provider + 'static) -> Self {
        Self::with_config(provider, ClientConfig::default())
    }

    pub fn with_config(mut provider: impl Provider + 'static, config: ClientConfig) -> Self {
        if let Some(aware) = provider.logger_aware() {
            aware.set_span(config.span.clone());
        }
        Self {
            provider: DynProvider::new(provider),
            config,
        }
    }

    pub fn with_http_client(mut self, http_client: reqwest::Client) -> Self {
        self.config.http_client = http_client;
        self
    }

    pub fn with_download_max_bytes(mut self, max_bytes: u64) -> Self {
        self.config.download_max_bytes = max_bytes;
        self
    }

    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.config.download_timeout = timeout;
        self
    }

    /// Replace the client span. Providers keep the span they were given at
    /// construction; use [`Client::with_config`] to inject one.
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.config.span = span;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn provider(&self) -> &DynProvider {
        &self.provider
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn capabilities(&self) -> ProviderCapabilities {
        self.provider.capabilities()
    }

    // -- generation ---------------------------------------------------------

    pub async fn generate(&self, mut request: Request) -> Result<Response> {
        validate_request(&mut request)?;

        let model = resolve_model(&request, self.provider.as_provider())?;
        request.model = Some(model);

        self.config.span.in_scope(|| {
            let summary: Vec<String> = request.inputs.iter().map(Input::summary).collect();
            tracing::info!(
                provider = self.provider.name(),
                model = request.model.as_deref().unwrap_or_default(),
                parts = request.inputs.len(),
                inputs = %summary.join(", "),
                "generate"
            );
        });

        self.provider.generate(&request).await
    }

    // -- models -------------------------------------------------------------

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        match self.provider.model_lister() {
            Some(lister) => lister.list_models().await,
            None => Err(GrailError::unsupported(format!(
                "provider {} does not support model listing",
                self.provider.name()
            ))
            .with_provider(self.provider.name())),
        }
    }

    /// First listed model matching `role` and `tier`.
    pub async fn get_model(&self, role: ModelRole, tier: ModelTier) -> Result<ModelInfo> {
        self.list_models()
            .await?
            .into_iter()
            .find(|m| m.role == role && m.tier == Some(tier))
            .ok_or_else(|| {
                GrailError::unsupported(format!(
                    "provider {} has no {role} model with tier {tier}",
                    self.provider.name()
                ))
                .with_provider(self.provider.name())
            })
    }

    // -- remote inputs ------------------------------------------------------

    /// Download `uri` as a generic file input.
    pub async fn input_file_from_uri(&self, uri: &str) -> Result<Input> {
        self.input_from_uri(uri, Expected::Any).await
    }

    /// Download `uri`; the body must be an image.
    pub async fn input_image_from_uri(&self, uri: &str) -> Result<Input> {
        self.input_from_uri(uri, Expected::Image).await
    }

    /// Download `uri`; the body must be a PDF.
    pub async fn input_pdf_from_uri(&self, uri: &str) -> Result<Input> {
        self.input_from_uri(uri, Expected::Pdf).await
    }

    async fn input_from_uri(&self, uri: &str, expected: Expected) -> Result<Input> {
        let download = fetch::download(
            &self.config.http_client,
            uri,
            self.config.download_max_bytes,
            self.config.download_timeout,
        )
        .await?;
        self.config.span.in_scope(|| {
            tracing::debug!(
                uri,
                bytes = download.data.len(),
                content_type = download.content_type.as_deref().unwrap_or("-"),
                "downloaded input"
            );
        });
        fetch::into_input(download, expected, uri)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;
    use crate::{ModelCapabilities, ModelCatalog, Output, OutputPart};
    use grail_types::ErrorCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn text_response(text: &str) -> Response {
        Response {
            outputs: vec![OutputPart::Text { text: text.into() }],
            ..Default::default()
        }
    }

    fn catalog() -> ModelCatalog {
        ModelCatalog::new()
            .with_tier(
                ModelRole::Text,
                ModelTier::Best,
                ModelInfo::new("big", ModelRole::Text, None, ModelCapabilities::language()),
            )
            .with_tier(
                ModelRole::Text,
                ModelTier::Fast,
                ModelInfo::new("small", ModelRole::Text, None, ModelCapabilities::language()),
            )
    }

    #[tokio::test]
    async fn generate_returns_provider_response_unchanged() {
        let client = Client::new(MockProvider::new().with_response(text_response("ok")));
        let resp = client
            .generate(Request::new(vec![Input::text("hi")], Output::text()))
            .await
            .unwrap();
        assert_eq!(resp.text().as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn image_scenario_returns_bytes() {
        let provider = MockProvider::new().with_response(Response {
            outputs: vec![OutputPart::Image {
                data: b"PNGDATA".to_vec(),
                mime: "image/png".into(),
                name: None,
            }],
            ..Default::default()
        });
        let client = Client::new(provider);
        let resp = client
            .generate(Request::new(vec![Input::text("a cat")], Output::image(1)))
            .await
            .unwrap();
        assert_eq!(resp.images(), Some(vec![b"PNGDATA".to_vec()]));
    }

    #[tokio::test]
    async fn decode_json_without_json_part_is_output_invalid() {
        let client = Client::new(MockProvider::new().with_response(text_response("not json")));
        let resp = client
            .generate(Request::new(vec![Input::text("hi")], Output::json(None)))
            .await
            .unwrap();
        let err = resp.decode_json::<serde_json::Value>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::OutputInvalid);
    }

    #[tokio::test]
    async fn invalid_requests_never_reach_provider() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let client = Client::new(MockProvider::new().with_generate(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Response::default())
        }));

        let err = client
            .generate(Request::new(vec![], Output::text()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let missing_output = Request {
            inputs: vec![Input::text("hi")],
            ..Default::default()
        };
        let err = client.generate(missing_output).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn inputs_reach_provider_in_order_with_resolved_model() {
        let seen: Arc<Mutex<Option<Request>>> = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let provider = MockProvider::new()
            .with_catalog(catalog())
            .with_generate(move |req| {
                *sink.lock().unwrap() = Some(req.clone());
                Ok(Response::default())
            });
        let client = Client::new(provider);

        let png = b"\x89PNG\r\n\x1a\n\x00".to_vec();
        let req = Request::new(
            vec![Input::text("first"), Input::image(png), Input::text("third")],
            Output::text(),
        )
        .with_tier(ModelTier::Fast);
        client.generate(req).await.unwrap();

        let seen = seen.lock().unwrap().take().unwrap();
        assert_eq!(seen.model.as_deref(), Some("small"));
        assert_eq!(seen.inputs[0].as_text(), Some("first"));
        assert_eq!(seen.inputs[1].as_file().unwrap().mime, "image/png");
        assert_eq!(seen.inputs[2].as_text(), Some("third"));
    }

    #[tokio::test]
    async fn explicit_model_beats_tier() {
        let seen = Arc::new(Mutex::new(String::new()));
        let sink = seen.clone();
        let provider = MockProvider::new()
            .with_catalog(catalog())
            .with_generate(move |req| {
                *sink.lock().unwrap() = req.model.clone().unwrap_or_default();
                Ok(Response::default())
            });
        let client = Client::new(provider);

        let req = Request::new(vec![Input::text("hi")], Output::text())
            .with_model("X")
            .with_tier(ModelTier::Best);
        client.generate(req).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), "X");
    }

    #[tokio::test]
    async fn provider_errors_pass_through() {
        let client = Client::new(MockProvider::new().with_generate(|_| {
            Err(GrailError::new(ErrorCode::RateLimited, "slow down").with_provider("mock"))
        }));
        let err = client
            .generate(Request::new(vec![Input::text("hi")], Output::text()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RateLimited);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn list_models_requires_capability() {
        let client = Client::new(MockProvider::new().with_name("bare"));
        assert!(!client.capabilities().model_listing);
        let err = client.list_models().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unsupported);
        assert!(err.message().contains("bare"));
    }

    #[tokio::test]
    async fn get_model_scans_listing() {
        let client = Client::new(MockProvider::new().with_catalog(catalog()));
        assert_eq!(client.list_models().await.unwrap().len(), 2);

        let model = client.get_model(ModelRole::Text, ModelTier::Fast).await.unwrap();
        assert_eq!(model.name, "small");

        let err = client.get_model(ModelRole::Image, ModelTier::Best).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unsupported);
    }

    /// Records the span handed over through `LoggerAware`, when it opts in.
    struct SpanRecorder {
        aware: bool,
        seen: Arc<Mutex<Option<tracing::Id>>>,
    }

    #[async_trait::async_trait]
    impl Provider for SpanRecorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn default_model(&self, _role: ModelRole) -> &str {
            "recorder-model"
        }

        async fn generate(&self, _request: &Request) -> Result<Response> {
            Ok(text_response("ok"))
        }

        fn logger_aware(&mut self) -> Option<&mut dyn crate::LoggerAware> {
            if self.aware {
                Some(self)
            } else {
                None
            }
        }
    }

    impl crate::LoggerAware for SpanRecorder {
        fn set_span(&mut self, span: tracing::Span) {
            *self.seen.lock().unwrap() = span.id();
        }
    }

    #[test]
    fn span_is_injected_into_logger_aware_provider() {
        let subscriber = tracing_subscriber::registry();
        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("grail-test");
            let _entered = span.enter();
            let expected = span.id();
            assert!(expected.is_some());

            let seen = Arc::new(Mutex::new(None));
            let config = ClientConfig {
                span: span.clone(),
                ..Default::default()
            };
            let client = Client::with_config(
                SpanRecorder {
                    aware: true,
                    seen: seen.clone(),
                },
                config,
            );
            assert_eq!(client.provider_name(), "recorder");
            assert_eq!(*seen.lock().unwrap(), expected);
        });
    }

    #[tokio::test]
    async fn provider_without_logger_capability_still_builds() {
        let seen = Arc::new(Mutex::new(None));
        let config = ClientConfig {
            span: tracing::info_span!("grail-test"),
            ..Default::default()
        };
        let client = Client::with_config(
            SpanRecorder {
                aware: false,
                seen: seen.clone(),
            },
            config,
        );
        assert!(seen.lock().unwrap().is_none());
        let resp = client
            .generate(Request::new(vec![Input::text("hi")], Output::text()))
            .await
            .unwrap();
        assert_eq!(resp.text(), Some("ok".to_string()));
    }

    #[test]
    fn builders_override_download_settings() {
        let client = Client::new(MockProvider::new())
            .with_download_max_bytes(10)
            .with_download_timeout(Duration::from_millis(50));
        assert_eq!(client.config().download_max_bytes, 10);
        assert_eq!(client.config().download_timeout, Duration::from_millis(50));
    }
}
