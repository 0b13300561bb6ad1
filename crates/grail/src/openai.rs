use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;

use grail_types::{ErrorCode, GrailError, Result};

use crate::provider::{malformed_response, map_http_error, resolve_api_key, transport_error};
use crate::types::{check_json_output, MAX_FILE_SIZE, MIME_PDF};
use crate::{
    Input, LoggerAware, ModelCapabilities, ModelCatalog, ModelInfo, ModelLister, ModelResolver,
    ModelRole, ModelTier, ModelUse, Output, OutputPart, Provider, ProviderInfo, Request, Response,
    Usage, Warning,
};

const PROVIDER: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const DEFAULT_TEXT_MODEL: &str = "gpt-5.2";
pub const DEFAULT_IMAGE_MODEL: &str = "gpt-image-1.5";

/// Sizes accepted by the `image_generation` tool.
pub const IMAGE_SIZES: &[&str] = &[
    "auto",
    "1024x1024",
    "1536x1024",
    "1024x1536",
    "256x256",
    "512x512",
    "1792x1024",
    "1024x1792",
];

// ---------------------------------------------------------------------------
// Image options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Png,
    #[serde(alias = "jpg")]
    Jpeg,
    Webp,
}

impl ImageFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Webp => "webp",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Webp => "image/webp",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageBackground {
    #[default]
    Auto,
    Transparent,
    Opaque,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageModeration {
    #[default]
    Auto,
    Low,
}

/// OpenAI-specific image settings, passed under the `"openai"` key of
/// [`crate::ProviderOptions`]. Unset fields use the vendor defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OpenAiImageOptions {
    pub format: Option<ImageFormat>,
    pub background: Option<ImageBackground>,
    /// One of [`IMAGE_SIZES`].
    pub size: Option<String>,
    pub moderation: Option<ImageModeration>,
    /// 0-100, meaningful for JPEG and WebP. Defaults to 100.
    pub output_compression: Option<u8>,
}

impl OpenAiImageOptions {
    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_background(mut self, background: ImageBackground) -> Self {
        self.background = Some(background);
        self
    }

    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size = Some(size.into());
        self
    }

    pub fn with_moderation(mut self, moderation: ImageModeration) -> Self {
        self.moderation = Some(moderation);
        self
    }

    pub fn with_output_compression(mut self, compression: u8) -> Self {
        self.output_compression = Some(compression);
        self
    }

    fn validate(&self) -> Result<()> {
        if let Some(size) = &self.size {
            if !IMAGE_SIZES.contains(&size.as_str()) {
                return Err(GrailError::invalid_argument(format!(
                    "openai: unsupported image size '{size}'"
                ))
                .with_provider(PROVIDER));
            }
        }
        if let Some(c) = self.output_compression {
            if c > 100 {
                return Err(GrailError::invalid_argument(format!(
                    "openai: output_compression must be 0-100, got {c}"
                ))
                .with_provider(PROVIDER));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

pub fn default_catalog() -> ModelCatalog {
    ModelCatalog::new()
        .with_tier(
            ModelRole::Text,
            ModelTier::Best,
            ModelInfo::new("gpt-5.2", ModelRole::Text, None, ModelCapabilities::language()),
        )
        .with_tier(
            ModelRole::Text,
            ModelTier::Fast,
            ModelInfo::new("gpt-4o", ModelRole::Text, None, ModelCapabilities::language()),
        )
        .with_tier(
            ModelRole::Image,
            ModelTier::Best,
            ModelInfo::new("gpt-image-1", ModelRole::Image, None, ModelCapabilities::image_generation()),
        )
        .with_tier(
            ModelRole::Image,
            ModelTier::Fast,
            ModelInfo::new(
                "gpt-image-1-mini",
                ModelRole::Image,
                None,
                ModelCapabilities::image_generation(),
            ),
        )
        .with_extra(ModelInfo::new(
            DEFAULT_IMAGE_MODEL,
            ModelRole::Image,
            None,
            ModelCapabilities::image_generation(),
        ))
}

// ---------------------------------------------------------------------------
// OpenAiAdapter
// ---------------------------------------------------------------------------

/// Backend for the OpenAI Responses API. Text, JSON and images all go
/// through `POST /v1/responses`; images use the `image_generation` tool.
#[derive(Debug, Clone)]
pub struct OpenAiAdapter {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
    text_model: String,
    image_model: String,
    catalog: ModelCatalog,
    span: tracing::Span,
}

impl OpenAiAdapter {
    /// An explicitly empty key is rejected.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let key = resolve_api_key(PROVIDER, Some(api_key.into()), None, OPENAI_API_KEY_ENV)?;
        Ok(Self::with_key(key))
    }

    pub fn from_env() -> Result<Self> {
        let key = resolve_api_key(PROVIDER, None, None, OPENAI_API_KEY_ENV)?;
        Ok(Self::with_key(key))
    }

    pub fn from_env_var(var: &str) -> Result<Self> {
        let key = resolve_api_key(PROVIDER, None, Some(var), OPENAI_API_KEY_ENV)?;
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

    /// Convert inputs, in order, into Responses API content parts.
    async fn build_content(&self, inputs: &[Input]) -> Result<Vec<serde_json::Value>> {
        let mut content = Vec::with_capacity(inputs.len());
        for (i, input) in inputs.iter().enumerate() {
            let part = match input {
                Input::Text(text) => json!({ "type": "input_text", "text": text }),
                Input::File(file) => file_part(i, &file.data, &file.mime, file.name.as_deref())?,
                Input::FileReader(reader) => {
                    let data = reader.read_to_end(MAX_FILE_SIZE).await.map_err(|e| {
                        GrailError::new(e.code(), format!("input {i}: {}", e.message()))
                            .with_cause(e)
                            .with_provider(PROVIDER)
                    })?;
                    file_part(i, &data, &reader.mime, reader.name.as_deref())?
                }
            };
            content.push(part);
        }
        Ok(content)
    }

    fn build_request_body(
        &self,
        request: &Request,
        model: &str,
        content: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let output = request
            .output
            .as_ref()
            .ok_or_else(|| GrailError::invalid_argument("output must be set"))?;

        let top_level_model = match output {
            Output::Image(_) => self.text_model.as_str(),
            _ => model,
        };

        let mut body = json!({
            "model": top_level_model,
            "input": [{
                "type": "message",
                "role": "user",
                "content": content,
            }],
        });

        let opts = &request.options;
        if let Some(system) = opts.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            body["instructions"] = json!(system);
        }

        match output {
            Output::Text => self.apply_sampling(&mut body, request),
            Output::Json(spec) => {
                self.apply_sampling(&mut body, request);
                body["text"] = match &spec.schema {
                    Some(schema) => json!({
                        "format": {
                            "type": "json_schema",
                            "name": "output",
                            "schema": schema,
                            "strict": spec.strict,
                        }
                    }),
                    None => json!({ "format": { "type": "json_object" } }),
                };
            }
            Output::Image(_) => {
                let image_opts: OpenAiImageOptions = request
                    .provider_options
                    .get(PROVIDER)?
                    .unwrap_or_default();
                image_opts.validate()?;
                body["tools"] = json!([image_tool(model, &image_opts)]);
            }
        }

        Ok(body)
    }

    fn apply_sampling(&self, body: &mut serde_json::Value, request: &Request) {
        let opts = &request.options;
        if let Some(max_tokens) = opts.max_tokens {
            body["max_output_tokens"] = json!(max_tokens);
        }
        if let Some(temp) = opts.temperature {
            body["temperature"] = json!(temp);
        }
        if let Some(top_p) = opts.top_p {
            body["top_p"] = json!(top_p);
        }
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
        let request_id = body["id"].as_str().filter(|s| !s.is_empty()).map(String::from);

        let mut warnings = Vec::new();
        if body["status"] == "incomplete" {
            let reason = body["incomplete_details"]["reason"].as_str().unwrap_or("unknown");
            warnings.push(Warning {
                code: "incomplete".into(),
                message: format!("response incomplete: {reason}"),
            });
        }

        let items = body["output"].as_array().cloned().unwrap_or_default();

        // Refusals surface as a content block rather than an HTTP error.
        if let Some(refusal) = items
            .iter()
            .filter(|item| item["type"] == "message")
            .flat_map(|item| item["content"].as_array().cloned().unwrap_or_default())
            .find(|block| block["type"] == "refusal")
        {
            let reason = refusal["refusal"].as_str().unwrap_or("request refused");
            let mut err = GrailError::new(ErrorCode::Refused, format!("openai: {reason}"))
                .with_provider(PROVIDER);
            if let Some(id) = &request_id {
                err = err.with_request_id(id.clone());
            }
            return Err(err);
        }

        let (outputs, models) = match output {
            Output::Text | Output::Json(_) => {
                let text: String = items
                    .iter()
                    .filter(|item| item["type"] == "message")
                    .flat_map(|item| item["content"].as_array().cloned().unwrap_or_default())
                    .filter(|block| block["type"] == "output_text")
                    .filter_map(|block| block["text"].as_str().map(String::from))
                    .collect();

                let part = match output {
                    Output::Json(spec) => {
                        check_json_output(text.as_bytes(), spec.strict, PROVIDER)?;
                        OutputPart::Json {
                            raw: text.into_bytes(),
                        }
                    }
                    _ => OutputPart::Text { text },
                };
                (vec![part], vec![model_use("language", model)])
            }
            Output::Image(spec) => {
                let format = request
                    .provider_options
                    .get::<OpenAiImageOptions>(PROVIDER)?
                    .and_then(|o| o.format)
                    .unwrap_or_default();

                let mut parts = Vec::new();
                for item in items.iter().filter(|i| i["type"] == "image_generation_call") {
                    let Some(b64) = item["result"].as_str().filter(|s| !s.is_empty()) else {
                        continue;
                    };
                    let data = base64::engine::general_purpose::STANDARD
                        .decode(b64)
                        .map_err(|e| {
                            GrailError::output_invalid("openai: image result is not valid base64")
                                .with_cause(e)
                                .with_provider(PROVIDER)
                        })?;
                    parts.push(OutputPart::Image {
                        data,
                        mime: format.mime().to_string(),
                        name: None,
                    });
                }
                if parts.is_empty() {
                    return Err(GrailError::output_invalid("openai: response contained no image")
                        .with_provider(PROVIDER));
                }
                if spec.count > 1 {
                    warnings.push(Warning {
                        code: "image_count".into(),
                        message: format!(
                            "requested {} images, the image_generation tool returns one per call",
                            spec.count
                        ),
                    });
                }
                (
                    parts,
                    vec![
                        model_use("language", &self.text_model),
                        model_use("image_generation", model),
                    ],
                )
            }
        };

        Ok(Response {
            outputs,
            usage: parse_usage(&body["usage"]),
            provider: ProviderInfo {
                name: PROVIDER.into(),
                route: "responses".into(),
                models,
            },
            request_id,
            warnings,
        })
    }

    async fn post(&self, body: &serde_json::Value) -> Result<serde_json::Value> {
        let resp = self
            .client
            .post(format!("{}/v1/responses", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;

        let status = resp.status();
        let request_id = resp
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let text = resp.text().await.map_err(|e| transport_error(PROVIDER, e))?;

        if !status.is_success() {
            let err = map_http_error(PROVIDER, status, &text);
            return Err(match request_id {
                Some(id) => err.with_request_id(id),
                None => err,
            });
        }

        serde_json::from_str(&text).map_err(|e| malformed_response(PROVIDER, e))
    }
}

fn model_use(role: &str, name: &str) -> ModelUse {
    ModelUse {
        role: role.into(),
        name: name.into(),
    }
}

fn data_url(mime: &str, data: &[u8]) -> String {
    format!(
        "data:{mime};base64,{}",
        base64::engine::general_purpose::STANDARD.encode(data)
    )
}

fn file_part(i: usize, data: &[u8], mime: &str, name: Option<&str>) -> Result<serde_json::Value> {
    if data.is_empty() {
        return Err(GrailError::invalid_argument(format!("input {i}: file data is empty")));
    }
    if mime.starts_with("image/") {
        return Ok(json!({
            "type": "input_image",
            "image_url": data_url(mime, data),
            "detail": "auto",
        }));
    }
    if mime.eq_ignore_ascii_case(MIME_PDF) {
        if !data.starts_with(b"%PDF") {
            return Err(GrailError::invalid_argument(format!(
                "input {i}: invalid PDF data (missing PDF header)"
            ))
            .with_provider(PROVIDER));
        }
        return Ok(json!({
            "type": "input_file",
            "filename": name.unwrap_or("document.pdf"),
            "file_data": data_url(mime, data),
        }));
    }
    let mime = if mime.is_empty() {
        "application/octet-stream"
    } else {
        mime
    };
    Ok(json!({
        "type": "input_file",
        "filename": name.unwrap_or("file"),
        "file_data": data_url(mime, data),
    }))
}

fn image_tool(model: &str, opts: &OpenAiImageOptions) -> serde_json::Value {
    json!({
        "type": "image_generation",
        "model": model,
        "output_format": opts.format.unwrap_or_default().as_str(),
        "background": opts.background.unwrap_or_default(),
        "moderation": opts.moderation.unwrap_or_default(),
        "quality": "auto",
        "size": opts.size.as_deref().unwrap_or("auto"),
        "output_compression": opts.output_compression.unwrap_or(100),
        "partial_images": 0,
    })
}

fn parse_usage(usage: &serde_json::Value) -> Usage {
    let input_tokens = usage["input_tokens"].as_u64().unwrap_or(0);
    let output_tokens = usage["output_tokens"].as_u64().unwrap_or(0);
    Usage {
        input_tokens,
        output_tokens,
        total_tokens: usage["total_tokens"]
            .as_u64()
            .unwrap_or(input_tokens + output_tokens),
    }
}

// ---------------------------------------------------------------------------
// Provider implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Provider for OpenAiAdapter {
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

        let content = self.build_content(&request.inputs).await?;
        let body = self.build_request_body(request, &model, content)?;

        self.span.in_scope(|| {
            tracing::debug!(provider = PROVIDER, %model, %role, "openai request");
        });

        let json = self.post(&body).await?;
        let response = self.parse_response(json, request, &model)?;

        self.span.in_scope(|| {
            tracing::debug!(
                provider = PROVIDER,
                %model,
                parts = response.outputs.len(),
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                "openai response"
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
impl ModelLister for OpenAiAdapter {
    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(self.catalog.to_vec())
    }
}

impl ModelResolver for OpenAiAdapter {
    fn resolve_model(&self, role: ModelRole, tier: ModelTier) -> Result<String> {
        self.catalog
            .resolve(role, tier)
            .map_err(|e| e.with_provider(PROVIDER))
    }
}

impl LoggerAware for OpenAiAdapter {
    fn set_span(&mut self, span: tracing::Span) {
        self.span = span;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
