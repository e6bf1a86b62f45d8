use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use tryon_contracts::session::GEMINI_KEY;
use tryon_contracts::{ErrorClass, ProviderError};

use super::http::{contains_any, read_body, transport_error, truncate_text};
use super::{sanitize_api_key, ImageProvider, ProviderImage, ProviderOutput, ProviderSubmission};
use crate::config::EngineConfig;

pub const GEMINI_PROVIDER: &str = "gemini";
const KEY_CHECK_MODEL: &str = "gemini-2.5-flash";
const BLOCKING_FINISH_REASONS: [&str; 3] = ["SAFETY", "PROHIBITED_CONTENT", "IMAGE_SAFETY"];

/// Direct client for the first-party `generateContent` REST surface.
pub struct GeminiProvider {
    api_base: String,
    http: reqwest::Client,
    timeout: Duration,
}

/// Result of probing a key with a minimal text request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCheck {
    pub valid: bool,
    pub class: Option<ErrorClass>,
    pub message: String,
}

impl GeminiProvider {
    pub fn new(config: &EngineConfig, http: reqwest::Client) -> Self {
        Self {
            api_base: config.gemini_api_base.clone(),
            http,
            timeout: config.request_timeout,
        }
    }

    pub fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    pub fn build_payload(submission: &ProviderSubmission<'_>) -> Value {
        let mut parts = vec![json!({ "text": submission.prompt })];
        for image in submission.images {
            parts.push(json!({
                "inlineData": {
                    "mimeType": image.mime_type,
                    "data": image.to_base64(),
                }
            }));
        }
        json!({
            "contents": [{
                "role": "user",
                "parts": parts,
            }]
        })
    }

    async fn post(&self, endpoint: &str, api_key: &str, payload: &Value) -> Result<(u16, String), ProviderError> {
        let response = self
            .http
            .post(endpoint)
            .header("x-goog-api-key", api_key)
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await
            .map_err(|err| transport_error(GEMINI_PROVIDER, &err))?;
        read_body(GEMINI_PROVIDER, response).await
    }

    /// Sends a one-line text request to see whether `api_key` is accepted.
    /// A throttled key still counts as valid.
    pub async fn check_key(&self, api_key: Option<&str>) -> KeyCheck {
        let api_key = match sanitize_api_key(GEMINI_PROVIDER, api_key) {
            Ok(key) => key,
            Err(err) => {
                return KeyCheck {
                    valid: false,
                    class: Some(err.class),
                    message: err.message,
                }
            }
        };
        let payload = json!({
            "contents": [{ "role": "user", "parts": [{ "text": "Hello" }] }]
        });
        let endpoint = self.endpoint_for_model(KEY_CHECK_MODEL);
        let outcome = match self.post(&endpoint, &api_key, &payload).await {
            Ok((status, _)) if (200..300).contains(&status) => None,
            Ok((status, body)) => Some(classify_gemini_failure(status, &body)),
            Err(err) => Some(err),
        };
        match outcome {
            None => KeyCheck {
                valid: true,
                class: None,
                message: "API key is valid.".to_string(),
            },
            Some(err) if err.class == ErrorClass::RateLimit => KeyCheck {
                valid: true,
                class: Some(err.class),
                message: "API key is valid but currently rate limited.".to_string(),
            },
            Some(err) => KeyCheck {
                valid: false,
                class: Some(err.class),
                message: err.message,
            },
        }
    }
}

#[async_trait]
impl ImageProvider for GeminiProvider {
    fn name(&self) -> &str {
        GEMINI_PROVIDER
    }

    fn credential_slot(&self) -> Option<&'static str> {
        Some(GEMINI_KEY)
    }

    async fn submit(&self, submission: ProviderSubmission<'_>) -> Result<ProviderOutput, ProviderError> {
        let api_key = sanitize_api_key(GEMINI_PROVIDER, submission.api_key)?;
        let endpoint = self.endpoint_for_model(submission.model);
        let payload = Self::build_payload(&submission);
        info!(
            provider = GEMINI_PROVIDER,
            model = submission.model,
            images = submission.images.len(),
            "submitting generateContent request"
        );

        let (status, body) = self.post(&endpoint, &api_key, &payload).await?;
        debug!(provider = GEMINI_PROVIDER, status, bytes = body.len(), "generateContent response");
        if !(200..300).contains(&status) {
            return Err(classify_gemini_failure(status, &body));
        }

        let parsed: GenerateContentResponse = serde_json::from_str(&body).map_err(|err| {
            ProviderError::malformed(GEMINI_PROVIDER, format!("response was not valid JSON: {err}"))
        })?;
        let candidates = parsed.candidates.len();
        let usage = parsed.usage_metadata.clone().unwrap_or(Value::Null);

        let image = match interpret_generate_content(&parsed) {
            GeminiOutcome::Image { mime_type, data } => {
                let bytes = BASE64.decode(data.as_bytes()).map_err(|err| {
                    ProviderError::malformed(GEMINI_PROVIDER, format!("inline image did not decode: {err}"))
                })?;
                ProviderImage { bytes, mime_type }
            }
            GeminiOutcome::Blocked { reason } => {
                return Err(ProviderError::new(
                    ErrorClass::ContentPolicy,
                    GEMINI_PROVIDER,
                    format!("request blocked by safety filter ({reason})"),
                ))
            }
            GeminiOutcome::NoImage { finish_reason, text } => {
                let mut message = format!(
                    "response contained no inline image (finishReason={})",
                    finish_reason.as_deref().unwrap_or("unknown")
                );
                if let Some(text) = text {
                    message.push_str(&format!(": {}", truncate_text(&text, 200)));
                }
                return Err(ProviderError::malformed(GEMINI_PROVIDER, message));
            }
        };

        let mut provider_response = Map::new();
        provider_response.insert("endpoint".to_string(), Value::String(endpoint));
        provider_response.insert("candidates".to_string(), json!(candidates));
        provider_response.insert("usage_metadata".to_string(), usage);
        Ok(ProviderOutput {
            image,
            provider_response,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    pub usage_metadata: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default, alias = "inline_data")]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default, alias = "mime_type")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    #[serde(default)]
    pub block_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeminiOutcome {
    Image { mime_type: Option<String>, data: String },
    Blocked { reason: String },
    NoImage { finish_reason: Option<String>, text: Option<String> },
}

/// Scans every part of every candidate for the first non-empty inline image.
pub fn interpret_generate_content(response: &GenerateContentResponse) -> GeminiOutcome {
    let image = response
        .candidates
        .iter()
        .filter_map(|candidate| candidate.content.as_ref())
        .flat_map(|content| content.parts.iter())
        .filter_map(|part| part.inline_data.as_ref())
        .find(|inline| !inline.data.trim().is_empty());
    if let Some(inline) = image {
        return GeminiOutcome::Image {
            mime_type: inline.mime_type.clone(),
            data: inline.data.trim().to_string(),
        };
    }

    if let Some(reason) = response
        .prompt_feedback
        .as_ref()
        .and_then(|feedback| feedback.block_reason.clone())
    {
        return GeminiOutcome::Blocked { reason };
    }
    let finish_reason = response
        .candidates
        .first()
        .and_then(|candidate| candidate.finish_reason.clone());
    if let Some(reason) = finish_reason
        .as_deref()
        .filter(|reason| BLOCKING_FINISH_REASONS.contains(reason))
    {
        return GeminiOutcome::Blocked {
            reason: reason.to_string(),
        };
    }
    let text = response
        .candidates
        .iter()
        .filter_map(|candidate| candidate.content.as_ref())
        .flat_map(|content| content.parts.iter())
        .filter_map(|part| part.text.as_deref())
        .map(str::trim)
        .find(|text| !text.is_empty())
        .map(str::to_string);
    GeminiOutcome::NoImage { finish_reason, text }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    details: Vec<Value>,
}

pub(crate) fn classify_gemini_failure(status: u16, body: &str) -> ProviderError {
    let envelope: ErrorEnvelope = serde_json::from_str(body).unwrap_or_default();
    let error = envelope.error.unwrap_or_default();
    let message = error
        .message
        .clone()
        .unwrap_or_else(|| truncate_text(body.trim(), 512));
    let lowered = message.to_ascii_lowercase();
    let rpc_status = error.status.as_deref().unwrap_or_default();
    let quota_failure = error.details.iter().any(|detail| {
        detail
            .get("@type")
            .and_then(Value::as_str)
            .map(|kind| kind.ends_with("QuotaFailure"))
            .unwrap_or(false)
    });

    let (class, message) = match status {
        401 | 403 => (ErrorClass::Auth, message),
        _ if contains_any(&lowered, &["api key not valid", "api_key_invalid"]) => (ErrorClass::Auth, message),
        429 if quota_failure => (ErrorClass::Quota, message),
        _ if rpc_status == "RESOURCE_EXHAUSTED" && quota_failure => (ErrorClass::Quota, message),
        429 => (ErrorClass::RateLimit, message),
        _ if rpc_status == "RESOURCE_EXHAUSTED" => (ErrorClass::RateLimit, message),
        400 if contains_any(&lowered, &["safety", "policy", "blocked", "prohibited"]) => {
            (ErrorClass::ContentPolicy, message)
        }
        408 | 504 => (ErrorClass::Timeout, message),
        413 => (
            ErrorClass::Unknown,
            format!("request too large; try smaller images ({message})"),
        ),
        503 => (
            ErrorClass::Unknown,
            format!("model temporarily unavailable ({message})"),
        ),
        _ => (ErrorClass::Unknown, message),
    };
    ProviderError::new(class, GEMINI_PROVIDER, format!("HTTP {status}: {message}"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn parse(value: Value) -> anyhow::Result<GenerateContentResponse> {
        Ok(serde_json::from_value(value)?)
    }

    #[test]
    fn first_inline_image_wins_over_text() -> anyhow::Result<()> {
        let response = parse(json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "Here is your image"},
                    {"inlineData": {"mimeType": "image/png", "data": ""}},
                    {"inlineData": {"mimeType": "image/png", "data": "iVBORw0KGgo="}},
                    {"inline_data": {"mime_type": "image/jpeg", "data": "/9j/"}}
                ]},
                "finishReason": "STOP"
            }]
        }))?;
        assert_eq!(
            interpret_generate_content(&response),
            GeminiOutcome::Image {
                mime_type: Some("image/png".to_string()),
                data: "iVBORw0KGgo=".to_string()
            }
        );
        Ok(())
    }

    #[test]
    fn snake_case_inline_data_is_accepted() -> anyhow::Result<()> {
        let response = parse(json!({
            "candidates": [{"content": {"parts": [{"inline_data": {"mime_type": "image/jpeg", "data": "/9j/"}}]}}]
        }))?;
        assert!(matches!(
            interpret_generate_content(&response),
            GeminiOutcome::Image { .. }
        ));
        Ok(())
    }

    #[test]
    fn missing_image_is_not_a_crash() -> anyhow::Result<()> {
        let response = parse(json!({
            "candidates": [{"content": {"parts": [{"text": "I can't help with that."}]}, "finishReason": "STOP"}]
        }))?;
        assert_eq!(
            interpret_generate_content(&response),
            GeminiOutcome::NoImage {
                finish_reason: Some("STOP".to_string()),
                text: Some("I can't help with that.".to_string())
            }
        );
        assert!(matches!(
            interpret_generate_content(&parse(json!({}))?),
            GeminiOutcome::NoImage { finish_reason: None, text: None }
        ));
        Ok(())
    }

    #[test]
    fn safety_blocks_are_reported() -> anyhow::Result<()> {
        let feedback = parse(json!({"promptFeedback": {"blockReason": "SAFETY"}}))?;
        assert_eq!(
            interpret_generate_content(&feedback),
            GeminiOutcome::Blocked {
                reason: "SAFETY".to_string()
            }
        );
        let finish = parse(json!({"candidates": [{"finishReason": "IMAGE_SAFETY"}]}))?;
        assert!(matches!(
            interpret_generate_content(&finish),
            GeminiOutcome::Blocked { .. }
        ));
        Ok(())
    }

    #[test]
    fn error_bodies_map_onto_classes() {
        let bad_key = json!({"error": {"code": 400, "message": "API key not valid. Please pass a valid API key.", "status": "INVALID_ARGUMENT"}}).to_string();
        assert_eq!(classify_gemini_failure(400, &bad_key).class, ErrorClass::Auth);

        let quota = json!({"error": {"code": 429, "status": "RESOURCE_EXHAUSTED", "message": "Quota exceeded",
            "details": [{"@type": "type.googleapis.com/google.rpc.QuotaFailure", "violations": []}]}})
        .to_string();
        assert_eq!(classify_gemini_failure(429, &quota).class, ErrorClass::Quota);

        let throttled = json!({"error": {"code": 429, "status": "RESOURCE_EXHAUSTED", "message": "Resource has been exhausted"}}).to_string();
        assert_eq!(classify_gemini_failure(429, &throttled).class, ErrorClass::RateLimit);

        let unsafe_input = json!({"error": {"code": 400, "message": "Request blocked due to safety settings"}}).to_string();
        assert_eq!(classify_gemini_failure(400, &unsafe_input).class, ErrorClass::ContentPolicy);

        let too_big = classify_gemini_failure(413, "payload too large");
        assert_eq!(too_big.class, ErrorClass::Unknown);
        assert!(too_big.message.contains("smaller images"));

        let overloaded = classify_gemini_failure(503, "{}");
        assert_eq!(overloaded.class, ErrorClass::Unknown);
        assert!(overloaded.message.contains("unavailable"));

        assert_eq!(classify_gemini_failure(403, "").class, ErrorClass::Auth);
        assert_eq!(classify_gemini_failure(504, "").class, ErrorClass::Timeout);
    }

    #[test]
    fn endpoint_accepts_prefixed_models() {
        let provider = GeminiProvider::new(&EngineConfig::default(), reqwest::Client::new());
        assert_eq!(
            provider.endpoint_for_model("models/gemini-2.5-flash-image"),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash-image:generateContent"
        );
        assert_eq!(
            provider.endpoint_for_model(" gemini-2.5-flash-image-preview "),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash-image-preview:generateContent"
        );
    }
}
