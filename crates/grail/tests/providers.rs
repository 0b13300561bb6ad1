//! End-to-end tests: `Client` -> adapter -> HTTP, against a local mock server.

use base64::Engine;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use grail::{
    Client, ErrorCode, GeminiAdapter, GeminiImageOptions, Input, ModelRole, ModelTier,
    OpenAiAdapter, Output, ProviderOptions, Request,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn openai_text_body(text: &str) -> serde_json::Value {
    json!({
        "id": "resp_1",
        "status": "completed",
        "output": [{
            "type": "message",
            "role": "assistant",
            "content": [{ "type": "output_text", "text": text }]
        }],
        "usage": { "input_tokens": 12, "output_tokens": 3, "total_tokens": 15 }
    })
}

fn gemini_text_body(text: &str) -> serde_json::Value {
    json!({
        "responseId": "g-1",
        "candidates": [{ "content": { "role": "model", "parts": [{ "text": text }] }, "finishReason": "STOP" }],
        "usageMetadata": { "promptTokenCount": 4, "candidatesTokenCount": 1, "totalTokenCount": 5 }
    })
}

async fn openai_client(server: &MockServer) -> Client {
    let adapter = OpenAiAdapter::new("test-api-key")
        .unwrap()
        .with_base_url(server.uri());
    Client::new(adapter)
}

async fn gemini_client(server: &MockServer) -> Client {
    let adapter = GeminiAdapter::new("test-api-key")
        .unwrap()
        .with_base_url(server.uri());
    Client::new(adapter)
}

// ---------------------------------------------------------------------------
// OpenAI
// ---------------------------------------------------------------------------

#[tokio::test]
async fn openai_text_generation() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .and(header("Authorization", "Bearer test-api-key"))
        .and(body_partial_json(json!({ "model": "gpt-5.2" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_text_body("ok")))
        .expect(1)
        .mount(&server)
        .await;

    let client = openai_client(&server).await;
    let resp = client
        .generate(Request::new(vec![Input::text("Say ok")], Output::text()))
        .await
        .unwrap();

    assert_eq!(resp.text().as_deref(), Some("ok"));
    assert_eq!(resp.usage.total_tokens, 15);
    assert_eq!(resp.provider.name, "openai");
    assert_eq!(resp.request_id.as_deref(), Some("resp_1"));
}

#[tokio::test]
async fn openai_tier_resolves_through_catalog() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .and(body_partial_json(json!({ "model": "gpt-4o" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_text_body("fast")))
        .expect(1)
        .mount(&server)
        .await;

    let client = openai_client(&server).await;
    let req = Request::new(vec![Input::text("hi")], Output::text()).with_tier(ModelTier::Fast);
    let resp = client.generate(req).await.unwrap();
    assert_eq!(resp.provider.models[0].name, "gpt-4o");
}

#[tokio::test]
async fn openai_image_generation() {
    let server = MockServer::start().await;
    let b64 = base64::engine::general_purpose::STANDARD.encode(b"\x89PNG fake");
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .and(body_partial_json(json!({
            "tools": [{ "type": "image_generation", "model": "gpt-image-1.5" }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "resp_img",
            "output": [{ "type": "image_generation_call", "status": "completed", "result": b64 }]
        })))
        .mount(&server)
        .await;

    let client = openai_client(&server).await;
    let resp = client
        .generate(Request::new(vec![Input::text("a cat")], Output::image(1)))
        .await
        .unwrap();
    assert_eq!(resp.images(), Some(vec![b"\x89PNG fake".to_vec()]));
}

#[tokio::test]
async fn openai_http_errors_are_classified() {
    let cases = [
        (401, ErrorCode::Unauthorized, false),
        (429, ErrorCode::RateLimited, true),
        (503, ErrorCode::Unavailable, true),
        (400, ErrorCode::InvalidArgument, false),
    ];
    for (status, code, retryable) in cases {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/responses"))
            .respond_with(ResponseTemplate::new(status).set_body_json(json!({
                "error": { "message": "boom", "type": "error", "code": null }
            })))
            .mount(&server)
            .await;

        let client = openai_client(&server).await;
        let err = client
            .generate(Request::new(vec![Input::text("hi")], Output::text()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), code, "status {status}");
        assert_eq!(err.is_retryable(), retryable, "status {status}");
        assert_eq!(err.provider(), Some("openai"));
    }
}

#[tokio::test]
async fn invalid_request_never_hits_the_network() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_text_body("ok")))
        .expect(0)
        .mount(&server)
        .await;

    let client = openai_client(&server).await;
    let err = client
        .generate(Request::new(vec![Input::image(b"not an image".to_vec())], Output::text()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
}

#[tokio::test]
async fn openai_model_listing() {
    let server = MockServer::start().await;
    let client = openai_client(&server).await;

    assert!(client.capabilities().model_listing);
    let best_image = client.get_model(ModelRole::Image, ModelTier::Best).await.unwrap();
    assert_eq!(best_image.name, "gpt-image-1");
}

// ---------------------------------------------------------------------------
// Gemini
// ---------------------------------------------------------------------------

#[tokio::test]
async fn gemini_text_generation_uses_model_path() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-3-pro-preview:generateContent"))
        .and(header("x-goog-api-key", "test-api-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(gemini_text_body("ok")))
        .expect(1)
        .mount(&server)
        .await;

    let client = gemini_client(&server).await;
    let resp = client
        .generate(Request::new(vec![Input::text("Say ok")], Output::text()))
        .await
        .unwrap();
    assert_eq!(resp.text().as_deref(), Some("ok"));
    assert_eq!(resp.usage.input_tokens, 4);
}

#[tokio::test]
async fn gemini_json_output_decodes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-3-pro-preview:generateContent"))
        .and(body_partial_json(json!({
            "generationConfig": { "responseMimeType": "application/json" }
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(gemini_text_body(r#"{"title":"Bitcoin"}"#)),
        )
        .mount(&server)
        .await;

    #[derive(serde::Deserialize)]
    struct Doc {
        title: String,
    }

    let client = gemini_client(&server).await;
    let resp = client
        .generate(Request::new(vec![Input::text("title?")], Output::json(None)))
        .await
        .unwrap();
    let doc: Doc = resp.decode_json().unwrap();
    assert_eq!(doc.title, "Bitcoin");
}

#[tokio::test]
async fn gemini_image_generation_with_options() {
    let server = MockServer::start().await;
    let b64 = base64::engine::general_purpose::STANDARD.encode(b"IMAGE");
    Mock::given(method("POST"))
        .and(path("/models/gemini-2.5-flash-image:generateContent"))
        .and(body_partial_json(json!({
            "generationConfig": { "imageConfig": { "aspectRatio": "16:9" } }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{ "content": { "parts": [
                { "inlineData": { "mimeType": "image/png", "data": b64 } }
            ] } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let opts = GeminiImageOptions::default().with_aspect_ratio("16:9");
    let req = Request::new(vec![Input::text("a lighthouse")], Output::image(1))
        .with_tier(ModelTier::Fast)
        .with_provider_options(ProviderOptions::new().with("gemini", &opts).unwrap());

    let client = gemini_client(&server).await;
    let resp = client.generate(req).await.unwrap();
    assert_eq!(resp.images(), Some(vec![b"IMAGE".to_vec()]));
}

#[tokio::test]
async fn gemini_safety_block_is_refused() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "promptFeedback": { "blockReason": "SAFETY" }
        })))
        .mount(&server)
        .await;

    let client = gemini_client(&server).await;
    let err = client
        .generate(Request::new(vec![Input::text("bad")], Output::text()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Refused);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn gemini_malformed_body_is_internal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let client = gemini_client(&server).await;
    let err = client
        .generate(Request::new(vec![Input::text("hi")], Output::text()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Internal);
    assert!(err.cause().is_some());
}
