use std::io::Cursor;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::json;
use tryon_contracts::{ErrorClass, ProviderError};
use tryon_engine::providers::{GeminiProvider, ImageProvider, ProviderOutput, ProviderSubmission};
use tryon_engine::{EngineConfig, ImageAsset};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const KEY: &str = "AIzaSyTest-0123456789";
const MODEL: &str = "gemini-2.5-flash-image-preview";

fn jpeg_bytes() -> anyhow::Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    RgbImage::from_pixel(8, 8, Rgb([90, 90, 90])).write_to(&mut out, ImageFormat::Jpeg)?;
    Ok(out.into_inner())
}

fn provider(server: &MockServer) -> GeminiProvider {
    let config = EngineConfig {
        gemini_api_base: server.uri(),
        ..EngineConfig::default()
    };
    GeminiProvider::new(&config, reqwest::Client::new())
}

async fn submit(provider: &GeminiProvider) -> anyhow::Result<Result<ProviderOutput, ProviderError>> {
    let images = [ImageAsset::from_bytes(jpeg_bytes()?, Some("image/jpeg"), None)?];
    Ok(provider
        .submit(ProviderSubmission {
            prompt: "Give this person a new hairstyle: a short bob.",
            images: &images,
            model: MODEL,
            api_key: Some(KEY),
        })
        .await)
}

#[tokio::test]
async fn inline_data_part_is_returned() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/models/{MODEL}:generateContent")))
        .and(header("x-goog-api-key", KEY))
        .and(body_partial_json(json!({
            "contents": [{
                "role": "user",
                "parts": [
                    {"text": "Give this person a new hairstyle: a short bob."},
                    {"inlineData": {"mimeType": "image/jpeg", "data": BASE64.encode(jpeg_bytes()?)}}
                ]
            }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "Here is the edited photo."},
                    {"inlineData": {"mimeType": "image/jpeg", "data": BASE64.encode(jpeg_bytes()?)}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"totalTokenCount": 1290}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let output = submit(&provider(&server)).await??;
    assert_eq!(output.image.bytes, jpeg_bytes()?);
    assert_eq!(output.image.mime_type.as_deref(), Some("image/jpeg"));
    assert_eq!(
        output.provider_response.get("usage_metadata"),
        Some(&json!({"totalTokenCount": 1290}))
    );
    Ok(())
}

async fn failure(template: ResponseTemplate) -> anyhow::Result<ProviderError> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/models/{MODEL}:generateContent")))
        .respond_with(template)
        .mount(&server)
        .await;
    match submit(&provider(&server)).await? {
        Ok(_) => anyhow::bail!("expected a failure"),
        Err(err) => Ok(err),
    }
}

#[tokio::test]
async fn blocked_prompt_is_a_content_policy_failure() -> anyhow::Result<()> {
    let err = failure(ResponseTemplate::new(200).set_body_json(json!({
        "promptFeedback": {"blockReason": "PROHIBITED_CONTENT"}
    })))
    .await?;
    assert_eq!(err.class, ErrorClass::ContentPolicy);
    assert!(err.message.contains("PROHIBITED_CONTENT"));
    Ok(())
}

#[tokio::test]
async fn text_only_answer_is_malformed() -> anyhow::Result<()> {
    let err = failure(ResponseTemplate::new(200).set_body_json(json!({
        "candidates": [{"content": {"parts": [{"text": "Sorry."}]}, "finishReason": "STOP"}]
    })))
    .await?;
    assert_eq!(err.class, ErrorClass::MalformedResponse);
    assert!(err.message.contains("Sorry."));
    Ok(())
}

#[tokio::test]
async fn quota_failure_detail_means_quota() -> anyhow::Result<()> {
    let err = failure(ResponseTemplate::new(429).set_body_json(json!({
        "error": {
            "code": 429,
            "status": "RESOURCE_EXHAUSTED",
            "message": "You exceeded your current quota.",
            "details": [{"@type": "type.googleapis.com/google.rpc.QuotaFailure", "violations": []}]
        }
    })))
    .await?;
    assert_eq!(err.class, ErrorClass::Quota);
    Ok(())
}

#[tokio::test]
async fn rejected_key_is_auth() -> anyhow::Result<()> {
    let err = failure(ResponseTemplate::new(400).set_body_json(json!({
        "error": {"code": 400, "status": "INVALID_ARGUMENT", "message": "API key not valid. Please pass a valid API key."}
    })))
    .await?;
    assert_eq!(err.class, ErrorClass::Auth);
    Ok(())
}

#[tokio::test]
async fn check_key_treats_throttling_as_valid() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-2.5-flash:generateContent"))
        .and(header("x-goog-api-key", KEY))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": {"code": 429, "status": "RESOURCE_EXHAUSTED", "message": "Resource has been exhausted"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-2.5-flash:generateContent"))
        .and(header("x-goog-api-key", "AIzaSyRevoked-000000"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": {"code": 403, "status": "PERMISSION_DENIED", "message": "Permission denied"}
        })))
        .mount(&server)
        .await;

    let gemini = provider(&server);
    let throttled = gemini.check_key(Some(KEY)).await;
    assert!(throttled.valid);
    assert_eq!(throttled.class, Some(ErrorClass::RateLimit));

    let revoked = gemini.check_key(Some("AIzaSyRevoked-000000")).await;
    assert!(!revoked.valid);
    assert_eq!(revoked.class, Some(ErrorClass::Auth));

    let missing = gemini.check_key(None).await;
    assert!(!missing.valid);
    assert_eq!(missing.class, Some(ErrorClass::Auth));
    Ok(())
}
