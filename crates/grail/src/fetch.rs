//! Loading file inputs from remote URIs and the local filesystem.

use std::path::Path;
use std::time::Duration;

use grail_types::{BoxError, ErrorCode, GrailError, Result};
use tokio_stream::{Stream, StreamExt};

use crate::types::{sniff_image_mime, Input, MAX_FILE_SIZE, MIME_PDF};

pub const DEFAULT_DOWNLOAD_MAX_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

const OCTET_STREAM: &str = "application/octet-stream";

// ---------------------------------------------------------------------------
// Remote fetch
// ---------------------------------------------------------------------------

/// Which content family a download must belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expected {
    Any,
    Image,
    Pdf,
}

#[derive(Debug)]
pub(crate) struct Download {
    pub data: Vec<u8>,
    /// Declared `Content-Type`, lowercased and stripped of parameters.
    pub content_type: Option<String>,
    pub file_name: Option<String>,
}

/// GET `uri`, bounded by `timeout` and `max_bytes`.
pub(crate) async fn download(
    http: &reqwest::Client,
    uri: &str,
    max_bytes: u64,
    timeout: Duration,
) -> Result<Download> {
    match tokio::time::timeout(timeout, download_unbounded(http, uri, max_bytes)).await {
        Ok(result) => result,
        Err(elapsed) => Err(GrailError::new(
            ErrorCode::Timeout,
            format!("fetching {uri} exceeded {}ms", timeout.as_millis()),
        )
        .with_cause(elapsed)
        .with_retryable(true)),
    }
}

async fn download_unbounded(http: &reqwest::Client, uri: &str, max_bytes: u64) -> Result<Download> {
    let url = reqwest::Url::parse(uri).map_err(|e| {
        GrailError::invalid_argument(format!("invalid URI '{uri}'")).with_cause(e)
    })?;
    let file_name = file_name_from_url(&url);

    let resp = http.get(url).send().await.map_err(transport_error)?;

    let status = resp.status();
    if status != reqwest::StatusCode::OK {
        let retryable = status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
        return Err(GrailError::new(
            ErrorCode::Unavailable,
            format!("fetching {uri} returned HTTP {}", status.as_u16()),
        )
        .with_retryable(retryable));
    }

    // Fast rejection; the capped read below is authoritative.
    if let Some(len) = resp.content_length() {
        if len > max_bytes {
            return Err(GrailError::invalid_argument(format!(
                "{uri} is {len} bytes, limit is {max_bytes}"
            )));
        }
    }

    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(normalize_content_type)
        .filter(|ct| !ct.is_empty());

    let data = read_capped(Box::pin(resp.bytes_stream()), max_bytes).await?;

    Ok(Download {
        data,
        content_type,
        file_name,
    })
}

/// Drain `stream`, failing once more than `max_bytes` have arrived.
pub(crate) async fn read_capped<S, B, E>(mut stream: S, max_bytes: u64) -> Result<Vec<u8>>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Into<BoxError>,
{
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            let e: BoxError = e.into();
            GrailError::new(ErrorCode::Unavailable, "download interrupted")
                .with_cause(e)
                .with_retryable(true)
        })?;
        let chunk = chunk.as_ref();
        let room = max_bytes.saturating_add(1).saturating_sub(buf.len() as u64);
        let room = usize::try_from(room).unwrap_or(usize::MAX);
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if buf.len() as u64 > max_bytes {
            return Err(GrailError::invalid_argument(format!(
                "download exceeds limit of {max_bytes} bytes"
            )));
        }
    }
    Ok(buf)
}

fn transport_error(e: reqwest::Error) -> GrailError {
    let code = if e.is_timeout() {
        ErrorCode::Timeout
    } else {
        ErrorCode::Unavailable
    };
    GrailError::new(code, format!("download failed: {e}"))
        .with_cause(e)
        .with_retryable(true)
}

fn normalize_content_type(raw: &str) -> String {
    raw.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}

fn file_name_from_url(url: &reqwest::Url) -> Option<String> {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Turn a download into an input of the expected family.
pub(crate) fn into_input(download: Download, expected: Expected, uri: &str) -> Result<Input> {
    let Download {
        data,
        content_type,
        file_name,
    } = download;

    if data.is_empty() {
        return Err(GrailError::invalid_argument(format!("{uri} returned an empty body")));
    }

    let mime = match expected {
        Expected::Any => content_type.unwrap_or_else(|| {
            file_name
                .as_deref()
                .map(|n| mime_from_extension(Path::new(n)))
                .unwrap_or(OCTET_STREAM)
                .to_string()
        }),
        Expected::Image => match content_type {
            Some(ct) if ct.starts_with("image/") => ct,
            Some(ct) => {
                return Err(GrailError::invalid_argument(format!(
                    "{uri} has content type {ct}, expected image/*"
                )));
            }
            None => sniff_image_mime(&data).map(String::from).ok_or_else(|| {
                GrailError::invalid_argument(format!("{uri} is not a recognizable image"))
            })?,
        },
        Expected::Pdf => match content_type {
            Some(ct) if ct == MIME_PDF => ct,
            Some(ct) => {
                return Err(GrailError::invalid_argument(format!(
                    "{uri} has content type {ct}, expected {MIME_PDF}"
                )));
            }
            None if data.starts_with(b"%PDF") => MIME_PDF.to_string(),
            None => {
                return Err(GrailError::invalid_argument(format!("{uri} is not a PDF")));
            }
        },
    };

    let name = match expected {
        Expected::Pdf => Some(pdf_file_name(file_name.as_deref())),
        _ => file_name,
    };

    let input = Input::file(data, mime);
    Ok(match name {
        Some(name) => input.with_name(name),
        None => input,
    })
}

fn pdf_file_name(name: Option<&str>) -> String {
    match name {
        Some(n) if n.to_ascii_lowercase().ends_with(".pdf") => n.to_string(),
        Some(n) => format!("{n}.pdf"),
        None => "document.pdf".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Local files
// ---------------------------------------------------------------------------

/// MIME type for a path's extension; unknown extensions are
/// `application/octet-stream`.
pub fn mime_from_extension(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => MIME_PDF,
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "rs" | "go" | "py" | "js" | "ts" | "c" | "h" | "cpp" | "java" | "sh" | "toml" | "yaml"
        | "yml" => "text/plain",
        _ => OCTET_STREAM,
    }
}

/// Read a local file into a named file input.
pub async fn load_file(path: impl AsRef<Path>) -> Result<Input> {
    let path = path.as_ref();
    let display = path.display().to_string();

    let meta = tokio::fs::metadata(path).await.map_err(|e| io_error(&display, e))?;
    if meta.len() > MAX_FILE_SIZE {
        return Err(GrailError::invalid_argument(format!(
            "{display} is {} bytes, limit is {MAX_FILE_SIZE}",
            meta.len()
        )));
    }

    let data = tokio::fs::read(path).await.map_err(|e| io_error(&display, e))?;
    let input = Input::file(data, mime_from_extension(path));
    Ok(match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => input.with_name(name),
        None => input,
    })
}

fn io_error(path: &str, e: std::io::Error) -> GrailError {
    let code = match e.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
            ErrorCode::InvalidArgument
        }
        _ => ErrorCode::Internal,
    };
    GrailError::new(code, format!("cannot read {path}: {e}")).with_cause(e)
}

impl Input {
    /// Load a local file; see [`load_file`].
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Input> {
        load_file(path).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
