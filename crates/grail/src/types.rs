use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use grail_types::{GrailError, Result};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::catalog::{ModelRole, ModelTier};

/// Largest payload accepted for any single file input (100 MiB).
pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Largest PDF payload accepted (50 MiB). Downstream document limits are
/// stricter than the generic file cap.
pub const MAX_PDF_SIZE: u64 = 50 * 1024 * 1024;

pub const MIME_PDF: &str = "application/pdf";

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// One ordered unit of multimodal input.
#[derive(Debug, Clone)]
pub enum Input {
    Text(String),
    File(FileInput),
    FileReader(FileReaderInput),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Text,
    File,
    FileReader,
}

/// In-memory file payload. An empty `mime` marks an image whose type is
/// sniffed during validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInput {
    pub data: Vec<u8>,
    pub mime: String,
    pub name: Option<String>,
}

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Streamed file payload. The reader can be consumed exactly once; clones
/// share the same underlying stream.
#[derive(Clone)]
pub struct FileReaderInput {
    reader: Arc<tokio::sync::Mutex<Option<BoxReader>>>,
    pub size_hint: u64,
    pub mime: String,
    pub name: Option<String>,
}

impl FileReaderInput {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static, size_hint: u64, mime: impl Into<String>) -> Self {
        Self {
            reader: Arc::new(tokio::sync::Mutex::new(Some(Box::new(reader)))),
            size_hint,
            mime: mime.into(),
            name: None,
        }
    }

    /// Drain the stream into memory, failing if it yields more than
    /// `max_bytes` or has already been consumed.
    pub async fn read_to_end(&self, max_bytes: u64) -> Result<Vec<u8>> {
        let reader = self.reader.lock().await.take().ok_or_else(|| {
            GrailError::invalid_argument("file reader input was already consumed")
        })?;

        let mut buf = Vec::new();
        reader
            .take(max_bytes.saturating_add(1))
            .read_to_end(&mut buf)
            .await
            .map_err(|e| GrailError::internal("failed to read file reader input").with_cause(e))?;

        if buf.len() as u64 > max_bytes {
            return Err(GrailError::invalid_argument(format!(
                "file reader input exceeds {max_bytes} bytes"
            )));
        }
        if buf.is_empty() {
            return Err(GrailError::invalid_argument("file reader input is empty"));
        }
        Ok(buf)
    }
}

impl fmt::Debug for FileReaderInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileReaderInput")
            .field("size_hint", &self.size_hint)
            .field("mime", &self.mime)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Input {
    pub fn text(text: impl Into<String>) -> Self {
        Input::Text(text.into())
    }

    pub fn file(data: impl Into<Vec<u8>>, mime: impl Into<String>) -> Self {
        Input::File(FileInput {
            data: data.into(),
            mime: mime.into(),
            name: None,
        })
    }

    pub fn pdf(data: impl Into<Vec<u8>>) -> Self {
        Self::file(data, MIME_PDF)
    }

    /// Image with its MIME type left for validation to sniff.
    pub fn image(data: impl Into<Vec<u8>>) -> Self {
        Self::file(data, "")
    }

    pub fn file_reader(
        reader: impl AsyncRead + Send + Unpin + 'static,
        size_hint: u64,
        mime: impl Into<String>,
    ) -> Self {
        Input::FileReader(FileReaderInput::new(reader, size_hint, mime))
    }

    /// Set the file name on file-kind inputs; text inputs are returned as is.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        match &mut self {
            Input::File(f) => f.name = Some(name.into()),
            Input::FileReader(r) => r.name = Some(name.into()),
            Input::Text(_) => {}
        }
        self
    }

    pub fn kind(&self) -> InputKind {
        match self {
            Input::Text(_) => InputKind::Text,
            Input::File(_) => InputKind::File,
            Input::FileReader(_) => InputKind::FileReader,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Input::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileInput> {
        match self {
            Input::File(file) => Some(file),
            _ => None,
        }
    }

    pub fn as_file_reader(&self) -> Option<&FileReaderInput> {
        match self {
            Input::FileReader(reader) => Some(reader),
            _ => None,
        }
    }

    /// Compact description used in request log lines.
    pub fn summary(&self) -> String {
        match self {
            Input::Text(text) => format!("text(len={})", text.len()),
            Input::File(f) => format!("file(mime={}, len={})", display_mime(&f.mime), f.data.len()),
            Input::FileReader(r) => {
                format!("file_reader(mime={}, size={})", display_mime(&r.mime), r.size_hint)
            }
        }
    }
}

fn display_mime(mime: &str) -> &str {
    if mime.is_empty() {
        "unsniffed"
    } else {
        mime
    }
}

// ---------------------------------------------------------------------------
// MIME sniffing
// ---------------------------------------------------------------------------

/// Detect an image type from its leading magic bytes.
pub fn sniff_image_mime(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(b"\x89PNG") {
        Some("image/png")
    } else if data.starts_with(&[0xFF, 0xD8]) {
        Some("image/jpeg")
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// The single kind of output a request asks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Output {
    Text,
    Image(ImageSpec),
    Json(JsonSpec),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub count: u32,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self { count: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonSpec {
    pub schema: Option<serde_json::Value>,
    /// Require the response to parse as JSON.
    pub strict: bool,
}

impl Output {
    pub fn text() -> Self {
        Output::Text
    }

    pub fn image(count: u32) -> Self {
        Output::Image(ImageSpec { count })
    }

    /// Strict JSON output, optionally constrained by a JSON schema.
    pub fn json(schema: Option<serde_json::Value>) -> Self {
        Output::Json(JsonSpec {
            schema,
            strict: true,
        })
    }

    /// The model role that serves this output. JSON is produced by language
    /// models, so it maps to the text role.
    pub fn model_role(&self) -> ModelRole {
        match self {
            Output::Text | Output::Json(_) => ModelRole::Text,
            Output::Image(_) => ModelRole::Image,
        }
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Vendor-neutral tuning. `None` leaves the vendor default in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub max_tokens: Option<u32>,
    /// Mutually exclusive with `top_p`.
    pub temperature: Option<f32>,
    /// Mutually exclusive with `temperature`.
    pub top_p: Option<f32>,
    pub system_prompt: Option<String>,
}

/// Provider-specific options keyed by provider name. Each adapter decodes
/// its own entry into its own typed options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderOptions(HashMap<String, serde_json::Value>);

impl ProviderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Serialize>(&mut self, provider: impl Into<String>, options: &T) -> Result<()> {
        let value = serde_json::to_value(options).map_err(|e| {
            GrailError::invalid_argument("provider options are not serializable").with_cause(e)
        })?;
        self.0.insert(provider.into(), value);
        Ok(())
    }

    pub fn with<T: Serialize>(mut self, provider: impl Into<String>, options: &T) -> Result<Self> {
        self.insert(provider, options)?;
        Ok(self)
    }

    pub fn raw(&self, provider: &str) -> Option<&serde_json::Value> {
        self.0.get(provider)
    }

    /// Decode the entry for `provider`; a malformed entry is `InvalidArgument`.
    pub fn get<T: DeserializeOwned>(&self, provider: &str) -> Result<Option<T>> {
        match self.0.get(provider) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                GrailError::invalid_argument(format!("invalid {provider} provider options"))
                    .with_cause(e)
                    .with_provider(provider)
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct Request {
    pub inputs: Vec<Input>,
    pub output: Option<Output>,
    /// Explicit model; always wins over `tier`.
    pub model: Option<String>,
    pub tier: Option<ModelTier>,
    pub options: GenerationOptions,
    pub provider_options: ProviderOptions,
    pub metadata: HashMap<String, String>,
}

impl Request {
    pub fn new(inputs: Vec<Input>, output: Output) -> Self {
        Self {
            inputs,
            output: Some(output),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tier(mut self, tier: ModelTier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_provider_options(mut self, provider_options: ProviderOptions) -> Self {
        self.provider_options = provider_options;
        self
    }

    /// Model name with empty strings treated as unset.
    pub fn model_name(&self) -> Option<&str> {
        self.model.as_deref().filter(|m| !m.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputPart {
    Text {
        text: String,
    },
    Image {
        data: Vec<u8>,
        mime: String,
        name: Option<String>,
    },
    Json {
        raw: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUse {
    pub role: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub route: String,
    pub models: Vec<ModelUse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub outputs: Vec<OutputPart>,
    pub usage: Usage,
    pub provider: ProviderInfo,
    pub request_id: Option<String>,
    pub warnings: Vec<Warning>,
}

impl Response {
    /// Concatenated text parts, or `None` if the response has none.
    pub fn text(&self) -> Option<String> {
        let texts: Vec<&str> = self
            .outputs
            .iter()
            .filter_map(|p| match p {
                OutputPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        if texts.is_empty() {
            None
        } else {
            Some(texts.concat())
        }
    }

    /// Raw bytes of every image part, or `None` if there are none.
    pub fn images(&self) -> Option<Vec<Vec<u8>>> {
        let images: Vec<Vec<u8>> = self
            .outputs
            .iter()
            .filter_map(|p| match p {
                OutputPart::Image { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect();
        if images.is_empty() {
            None
        } else {
            Some(images)
        }
    }

    pub fn image_parts(&self) -> impl Iterator<Item = &OutputPart> {
        self.outputs
            .iter()
            .filter(|p| matches!(p, OutputPart::Image { .. }))
    }

    /// Raw bytes of the first JSON part.
    pub fn json_bytes(&self) -> Option<&[u8]> {
        self.outputs.iter().find_map(|p| match p {
            OutputPart::Json { raw } => Some(raw.as_slice()),
            _ => None,
        })
    }

    /// Decode the first JSON part into `T`. A missing part or a parse failure
    /// is `OutputInvalid`.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T> {
        let raw = self
            .json_bytes()
            .ok_or_else(|| GrailError::output_invalid("response contains no JSON output"))?;
        serde_json::from_slice(raw).map_err(|e| {
            GrailError::output_invalid("failed to decode JSON output").with_cause(e)
        })
    }
}

/// Enforce the strict-JSON post-condition on raw model output.
pub(crate) fn check_json_output(raw: &[u8], strict: bool, provider: &str) -> Result<()> {
    if !strict {
        return Ok(());
    }
    serde_json::from_slice::<serde_json::Value>(raw)
        .map(|_| ())
        .map_err(|e| {
            GrailError::output_invalid(format!("invalid JSON output: {e}"))
                .with_cause(e)
                .with_provider(provider)
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use grail_types::ErrorCode;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n0000";

    #[test]
    fn sniff_detects_known_signatures() {
        assert_eq!(sniff_image_mime(PNG), Some("image/png"));
        assert_eq!(sniff_image_mime(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("image/jpeg"));
        assert_eq!(sniff_image_mime(b"GIF87a...."), Some("image/gif"));
        assert_eq!(sniff_image_mime(b"GIF89a...."), Some("image/gif"));
        assert_eq!(sniff_image_mime(b"RIFF\x00\x00\x00\x00WEBPVP8 "), Some("image/webp"));
    }

    #[test]
    fn sniff_is_total_over_short_and_unknown_input() {
        assert_eq!(sniff_image_mime(&[]), None);
        assert_eq!(sniff_image_mime(&[0xFF]), None);
        assert_eq!(sniff_image_mime(b"RIFF\x00\x00\x00\x00WAVE"), None);
        assert_eq!(sniff_image_mime(b"%PDF-1.7"), None);
    }

    #[test]
    fn input_constructors_and_accessors() {
        let text = Input::text("hello");
        assert_eq!(text.as_text(), Some("hello"));
        assert!(text.as_file().is_none());
        assert_eq!(text.kind(), InputKind::Text);

        let pdf = Input::pdf(b"%PDF-1.4".to_vec()).with_name("doc.pdf");
        let file = pdf.as_file().expect("pdf is a file input");
        assert_eq!(file.mime, MIME_PDF);
        assert_eq!(file.name.as_deref(), Some("doc.pdf"));

        let image = Input::image(PNG.to_vec());
        assert_eq!(image.as_file().unwrap().mime, "");
        assert!(image.as_text().is_none());
        assert!(image.as_file_reader().is_none());
    }

    #[tokio::test]
    async fn file_reader_reads_once() {
        let input = Input::file_reader(std::io::Cursor::new(b"abc".to_vec()), 3, "text/plain");
        let reader = input.as_file_reader().unwrap().clone();
        assert_eq!(reader.read_to_end(10).await.unwrap(), b"abc");

        let err = reader.read_to_end(10).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn file_reader_enforces_cap() {
        let input = FileReaderInput::new(std::io::Cursor::new(vec![1u8; 16]), 0, "application/octet-stream");
        let err = input.read_to_end(8).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn output_role_mapping() {
        assert_eq!(Output::text().model_role(), ModelRole::Text);
        assert_eq!(Output::image(1).model_role(), ModelRole::Image);
        assert_eq!(Output::json(None).model_role(), ModelRole::Text);
        assert!(matches!(Output::json(None), Output::Json(JsonSpec { strict: true, .. })));
    }

    #[test]
    fn response_text_and_images() {
        let resp = Response {
            outputs: vec![
                OutputPart::Text { text: "a".into() },
                OutputPart::Image {
                    data: vec![1, 2],
                    mime: "image/png".into(),
                    name: None,
                },
                OutputPart::Text { text: "b".into() },
            ],
            ..Default::default()
        };
        assert_eq!(resp.text().as_deref(), Some("ab"));
        assert_eq!(resp.images(), Some(vec![vec![1, 2]]));
        assert_eq!(resp.image_parts().count(), 1);
        assert!(resp.json_bytes().is_none());

        let empty = Response::default();
        assert!(empty.text().is_none());
        assert!(empty.images().is_none());
    }

    #[test]
    fn decode_json_without_json_part_is_output_invalid() {
        let resp = Response {
            outputs: vec![OutputPart::Text { text: "{}".into() }],
            ..Default::default()
        };
        let err = resp.decode_json::<serde_json::Value>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::OutputInvalid);
    }

    #[test]
    fn decode_json_parses_first_json_part() {
        #[derive(Deserialize)]
        struct Answer {
            value: i64,
        }
        let resp = Response {
            outputs: vec![OutputPart::Json {
                raw: br#"{"value": 42}"#.to_vec(),
            }],
            ..Default::default()
        };
        assert_eq!(resp.decode_json::<Answer>().unwrap().value, 42);

        let bad = Response {
            outputs: vec![OutputPart::Json { raw: b"not json".to_vec() }],
            ..Default::default()
        };
        assert_eq!(
            bad.decode_json::<serde_json::Value>().unwrap_err().code(),
            ErrorCode::OutputInvalid
        );
    }

    #[test]
    fn strict_json_check() {
        assert!(check_json_output(b"[1,2]", true, "mock").is_ok());
        assert!(check_json_output(b"oops", false, "mock").is_ok());
        let err = check_json_output(b"oops", true, "mock").unwrap_err();
        assert_eq!(err.code(), ErrorCode::OutputInvalid);
        assert_eq!(err.provider(), Some("mock"));
    }

    #[test]
    fn provider_options_round_trip_typed_entries() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Opts {
            size: String,
        }
        let opts = ProviderOptions::new()
            .with("openai", &Opts { size: "1024x1024".into() })
            .unwrap();
        let back: Option<Opts> = opts.get("openai").unwrap();
        assert_eq!(back, Some(Opts { size: "1024x1024".into() }));
        assert!(opts.get::<Opts>("gemini").unwrap().is_none());

        let mut bad = ProviderOptions::new();
        bad.insert("openai", &serde_json::json!({"size": 5})).unwrap();
        let err = bad.get::<Opts>("openai").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn request_model_name_ignores_empty() {
        let req = Request::new(vec![Input::text("hi")], Output::text()).with_model("");
        assert!(req.model_name().is_none());
        let req = req.with_model("gpt-4o");
        assert_eq!(req.model_name(), Some("gpt-4o"));
    }
}
