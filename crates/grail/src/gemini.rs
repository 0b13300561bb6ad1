use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;

use grail_types::{ErrorCode, GrailError, Result};

use crate::provider::{malformed_response, map_http_error, resolve_api_key, transport_error};
use crate::types::{check_json_output, MAX_FILE_SIZE};
use crate::{
    Input, LoggerAware, ModelCapabilities, ModelCatalog, ModelInfo, ModelLister, ModelResolver,
    ModelRole, ModelTier, ModelUse, Output, OutputPart, Provider, ProviderInfo, Request, Response,
    Usage, Warning,
};

const PROVIDER: &str = "gemini";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub const GEMINI_API_KEY_ENV: &str = "GEMINI_API_KEY";
pub const DEFAULT_TEXT_MODEL: &str = "gemini-3-pro-preview";
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-3-pro-image-preview";

pub const ASPECT_RATIOS: &[&str] = &[
    "1:1", "2:3", "3:2", "3:4", "4:3", "4:5", "5:4", "9:16", "16:9", "21:9",
];

/// Finish reasons that mean the output was withheld by safety filters.
const BLOCKED_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "PROHIBITED_CONTENT",
    "BLOCKLIST",
    "SPII",
    "IMAGE_SAFETY",
];

// ---------------------------------------------------------------------------
// Image options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageSize {
    #[serde(rename = "1K")]
    OneK,
    #[serde(rename = "2K")]
    TwoK,
    #[serde(rename = "4K")]
    FourK,
}

/// Gemini-specific image settings, passed under the `"gemini"` key of
/// [`crate::ProviderOptions`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeminiImageOptions {
    /// One of [`ASPECT_RATIOS`].
    pub aspect_ratio: Option<String>,
    pub size: Option<ImageSize>,
}

impl GeminiImageOptions {
    pub fn with_aspect_ratio(mut self, ratio: impl Into<String>) -> Self {
        self.aspect_ratio = Some(ratio.into());
        self
    }

    pub fn with_size(mut self, size: ImageSize) -> Self {
        self.size = Some(size);
        self
    }

    fn to_image_config(&self) -> Result<Option<serde_json::Value>> {
        if let Some(ratio) = &self.aspect_ratio {
            if !ASPECT_RATIOS.contains(&ratio.as_str()) {
                return Err(GrailError::invalid_argument(format!(
                    "gemini: unsupported aspect ratio '{ratio}'"
                ))
                .with_provider(PROVIDER));
            }
        }
        if self.aspect_ratio.is_none() && self.size.is_none() {
            return Ok(None);
        }
        let mut config = json!({});
        if let Some(ratio) = &self.aspect_ratio {
            config["aspectRatio"] = json!(ratio);
        }
        if let Some(size) = self.size {
            config["imageSize"] = json!(size);
        }
        Ok(Some(config))
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

pub fn default_catalog() -> ModelCatalog {
    let text = |name: &str| ModelInfo::new(name, ModelRole::Text, None, ModelCapabilities::language());
    let image =
        |name: &str| ModelInfo::new(name, ModelRole::Image, None, ModelCapabilities::image_generation());

    ModelCatalog::new()
        .with_tier(ModelRole::Text, ModelTier::Best, text("gemini-3-pro-preview"))
        .with_tier(ModelRole::Text, ModelTier::Fast, text("gemini-3-flash-preview"))
        .with_tier(ModelRole::Image, ModelTier::Best, image("gemini-3-pro-image-preview"))
        .with_tier(ModelRole::Image, ModelTier::Fast, image("gemini-2.5-flash-image"))
        .with_extra(text("gemini-2.5-flash"))
        .with_extra(text("gemini-2.5-flash-lite"))
}

// ---------------------------------------------------------------------------
// GeminiAdapter
// ---------------------------------------------------------------------------

/// Backend for the Gemini `generateContent` API.
#[derive(Debug, Clone)]
pub struct GeminiAdapter {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
    text_model: String,
    image_model: String,
    catalog: ModelCatalog,
    span: tracing::Span,
}

impl GeminiAdapter {
    /// An explicitly empty key is rejected.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let key = resolve_api_key(PROVIDER, Some(api_key.into()), None, GEMINI_API_KEY_ENV)?;
        Ok(Self::with_key(key))
    }

    pub fn from_env() -> Result<Self> {
        let key = resolve_api_key(PROVIDER, None, None, GEMINI_API_KEY_ENV)?;
        Ok(Self::with_key(key))
    }

    pub fn from_env_var(var: &str) -> Result<Self> {
        let key = resolve_api_key(PROVIDER, None, Some(var), GEMINI_API_KEY_ENV)?;
        Ok(Self::with_key(key))
    }

    fn with_key(api_key: String) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            text_model: DEFAULT_TEXT_MODEL.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            catalog: default_catalog(),
            span: tracing::Span::none(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_text_model(mut self, model: impl Into<String>) -> Self {
        self.text_model = model.into();
        self
    }

    pub fn with_image_model(mut self, model: impl Into<String>) -> Self {
        self.image_model = model.into();
        self
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    // -- request building ---------------------------------------------------

    async fn build_parts(&self, inputs: &[Input]) -> Result<Vec<serde_json::Value>> {
        let mut parts = Vec::with_capacity(inputs.len());
        for (i, input) in inputs.iter().enumerate() {
            let part = match input {
                Input::Text(text) => json!({ "text": text }),
                Input::File(file) => inline_part(i, &file.data, &file.mime)?,
                Input::FileReader(reader) => {
                    let data = reader.read_to_end(MAX_FILE_SIZE).await.map_err(|e| {
                        GrailError::new(e.code(), format!("input {i}: {}", e.message()))
                            .with_cause(e)
                            .with_provider(PROVIDER)
                    })?;
                    inline_part(i, &data, &reader.mime)?
                }
            };
            parts.push(part);
        }
        Ok(parts)
    }

    fn build_request_body(
        &self,
        request: &Request,
        parts: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let output = request
            .output
            .as_ref()
            .ok_or_else(|| GrailError::invalid_argument("output must be set"))?;

        let mut body = json!({
            "contents": [{ "role": "user", "parts": parts }],
        });

        let opts = &request.options;
        if let Some(system) = opts.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }

        let mut config = json!({});
        match output {
            Output::Text | Output::Json(_) => {
                if let Some(max_tokens) = opts.max_tokens {
                    config["maxOutputTokens"] = json!(max_tokens);
                }
                if let Some(temp) = opts.temperature {
                    config["temperature"] = json!(temp);
                }
                if let Some(top_p) = opts.top_p {
                    config["topP"] = json!(top_p);
                }
                if let Output::Json(spec) = output {
                    config["responseMimeType"] = json!("application/json");
                    if let Some(schema) = &spec.schema {
                        config["responseSchema"] = schema.clone();
                    }
                }
            }
            Output::Image(_) => {
                config["responseModalities"] = json!(["TEXT", "IMAGE"]);
                let image_opts: GeminiImageOptions = request
                    .provider_options
                    .get(PROVIDER)?
                    .unwrap_or_default();
                if let Some(image_config) = image_opts.to_image_config()? {
                    config["imageConfig"] = image_config;
                }
            }
        }

        if config.as_object().is_some_and(|c| !c.is_empty()) {
            body["generationConfig"] = config;
        }
        Ok(body)
    }

    // -- response parsing ---------------------------------------------------

    fn parse_response(
        &self,
        body: serde_json::Value,
        request: &Request,
        model: &str,
    ) -> Result<Response> {
        let output = request
            .output
            .as_ref()
            .ok_or_else(|| GrailError::invalid_argument("output must be set"))?;
        let request_id = body["responseId"].as_str().map(String::from);

        if let Some(reason) = body["promptFeedback"]["blockReason"].as_str() {
            return Err(refused(format!("prompt blocked: {reason}"), request_id));
        }

        let candidates = body["candidates"].as_array().cloned().unwrap_or_default();
        let mut warnings = Vec::new();
        let mut texts = Vec::new();
        let mut images = Vec::new();

        for candidate in &candidates {
            let finish = candidate["finishReason"].as_str().unwrap_or("");
            if BLOCKED_FINISH_REASONS.contains(&finish) {
                return Err(refused(format!("response blocked: {finish}"), request_id));
            }
            if finish == "MAX_TOKENS" {
                warnings.push(Warning {
                    code: "incomplete".into(),
                    message: "response truncated at max output tokens".into(),
                });
            }

            let parts = candidate["content"]["parts"].as_array().cloned().unwrap_or_default();
            for part in parts {
                if let Some(text) = part["text"].as_str() {
                    // Thought summaries are not part of the answer.
                    if part["thought"] != true {
                        texts.push(text.to_string());
                    }
                } else if let Some(inline) = part.get("inlineData") {
                    let data = base64::engine::general_purpose::STANDARD
                        .decode(inline["data"].as_str().unwrap_or(""))
                        .map_err(|e| {
                            GrailError::output_invalid("gemini: inline data is not valid base64")
                                .with_cause(e)
                                .with_provider(PROVIDER)
                        })?;
                    let mime = inline["mimeType"].as_str().unwrap_or("image/png").to_string();
                    images.push(OutputPart::Image {
                        data,
                        mime,
                        name: None,
                    });
                }
            }
        }

        let (outputs, models) = match output {
            Output::Text => (
                vec![OutputPart::Text {
                    text: texts.concat(),
                }],
                vec![model_use("language", model)],
            ),
            Output::Json(spec) => {
                let raw = texts.concat().into_bytes();
                check_json_output(&raw, spec.strict, PROVIDER)?;
                (vec![OutputPart::Json { raw }], vec![model_use("language", model)])
            }
            Output::Image(spec) => {
                if images.is_empty() {
                    return Err(GrailError::output_invalid("gemini: response contained no image")
                        .with_provider(PROVIDER));
                }
                if spec.count as usize > images.len() {
                    warnings.push(Warning {
                        code: "image_count".into(),
                        message: format!(
                            "requested {} images, received {}",
                            spec.count,
                            images.len()
                        ),
                    });
                }
                (
                    images,
                    vec![model_use("language", model), model_use("image_generation", model)],
                )
            }
        };

        Ok(Response {
            outputs,
            usage: parse_usage(&body["usageMetadata"]),
            provider: ProviderInfo {
                name: PROVIDER.into(),
                route: "generate_content".into(),
                models,
            },
            request_id,
            warnings,
        })
    }

    async fn post(&self, model: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let resp = self
            .client
            .post(format!("{}/models/{}:generateContent", self.base_url, model))
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| transport_error(PROVIDER, e))?;

        if !status.is_success() {
            return Err(map_http_error(PROVIDER, status, &text));
        }

        serde_json::from_str(&text).map_err(|e| malformed_response(PROVIDER, e))
    }
}

fn refused(message: String, request_id: Option<String>) -> GrailError {
    let err = GrailError::new(ErrorCode::Refused, format!("gemini: {message}")).with_provider(PROVIDER);
    match request_id {
        Some(id) => err.with_request_id(id),
        None => err,
    }
}

fn model_use(role: &str, name: &str) -> ModelUse {
    ModelUse {
        role: role.into(),
        name: name.into(),
    }
}

fn inline_part(i: usize, data: &[u8], mime: &str) -> Result<serde_json::Value> {
    if data.is_empty() {
        return Err(GrailError::invalid_argument(format!("input {i}: file data is empty")));
    }
    let mime = if mime.is_empty() {
        "application/octet-stream"
    } else {
        mime
    };
    Ok(json!({
        "inlineData": {
            "mimeType": mime,
            "data": base64::engine::general_purpose::STANDARD.encode(data),
        }
    }))
}

fn parse_usage(usage: &serde_json::Value) -> Usage {
    let input_tokens = usage["promptTokenCount"].as_u64().unwrap_or(0);
    let output_tokens = usage["candidatesTokenCount"].as_u64().unwrap_or(0);
    Usage {
        input_tokens,
        output_tokens,
        total_tokens: usage["totalTokenCount"]
            .as_u64()
            .unwrap_or(input_tokens + output_tokens),
    }
}

// ---------------------------------------------------------------------------
// Provider implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Provider for GeminiAdapter {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn default_model(&self, role: ModelRole) -> &str {
        match role {
            ModelRole::Text => &self.text_model,
            ModelRole::Image => &self.image_model,
        }
    }

    async fn generate(&self, request: &Request) -> Result<Response> {
        let role = request
            .output
            .as_ref()
            .map(Output::model_role)
            .unwrap_or(ModelRole::Text);
        let model = request
            .model_name()
            .unwrap_or_else(|| self.default_model(role))
            .to_string();

        let parts = self.build_parts(&request.inputs).await?;
        let body = self.build_request_body(request, parts)?;

        self.span.in_scope(|| {
            tracing::debug!(provider = PROVIDER, %model, %role, "gemini request");
        });

        let json = self.post(&model, &body).await?;
        let response = self.parse_response(json, request, &model)?;

        self.span.in_scope(|| {
            tracing::debug!(
                provider = PROVIDER,
                %model,
                parts = response.outputs.len(),
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                "gemini response"
            );
        });

        Ok(response)
    }

    fn model_lister(&self) -> Option<&dyn ModelLister> {
        Some(self)
    }

    fn model_resolver(&self) -> Option<&dyn ModelResolver> {
        Some(self)
    }

    fn logger_aware(&mut self) -> Option<&mut dyn LoggerAware> {
        Some(self)
    }
}

#[async_trait]
impl ModelLister for GeminiAdapter {
    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(self.catalog.to_vec())
    }
}

impl ModelResolver for GeminiAdapter {
    fn resolve_model(&self, role: ModelRole, tier: ModelTier) -> Result<String> {
        self.catalog
            .resolve(role, tier)
            .map_err(|e| e.with_provider(PROVIDER))
    }
}

impl LoggerAware for GeminiAdapter {
    fn set_span(&mut self, span: tracing::Span) {
        self.span = span;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
