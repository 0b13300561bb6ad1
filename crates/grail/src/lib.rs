//! Provider-neutral text and image generation (OpenAI, Gemini).
//!
//! Requests carry ordered multimodal inputs and one output kind; `Client`
//! validates them, resolves a concrete model, and dispatches to a `Provider`.

mod catalog;
mod client;
mod fetch;
pub mod gemini;
pub mod mock;
pub mod openai;
mod provider;
mod resolve;
mod types;
mod validation;

pub use catalog::*;
pub use client::*;
pub use fetch::{load_file, mime_from_extension, DEFAULT_DOWNLOAD_MAX_BYTES, DEFAULT_DOWNLOAD_TIMEOUT};
pub use gemini::{GeminiAdapter, GeminiImageOptions};
pub use mock::MockProvider;
pub use openai::{OpenAiAdapter, OpenAiImageOptions};
pub use provider::{DynProvider, LoggerAware, ModelLister, ModelResolver, Provider, ProviderCapabilities};
pub use resolve::resolve_model;
pub use types::*;
pub use validation::validate_request;

pub use grail_types::{error_code, find_grail_error, is_retryable, ErrorCode, GrailError, Result};
