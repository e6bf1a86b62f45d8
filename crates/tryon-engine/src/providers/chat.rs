use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use tryon_contracts::session::{CHAT_KEY, OPENROUTER_KEY};
use tryon_contracts::{ErrorClass, ProviderError};

use super::http::{contains_any, read_body, transport_error, truncate_text};
use super::{sanitize_api_key, ImageProvider, ProviderImage, ProviderOutput, ProviderSubmission};
use crate::codec::{parse_data_url, read_capped_body, BodyReadError, DataUrlParts};
use crate::config::EngineConfig;

pub const OPENROUTER_PROVIDER: &str = "openrouter";
pub const CHAT_COMPATIBLE_PROVIDER: &str = "chat-compatible";

const MAX_TOKENS: u32 = 4096;
const TEMPERATURE: f64 = 0.7;
const BLOCKING_NATIVE_REASONS: [&str; 3] = ["PROHIBITED_CONTENT", "SAFETY", "IMAGE_SAFETY"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatAuth {
    Bearer,
    Header(String),
}

impl ChatAuth {
    fn from_config(raw: Option<&str>) -> Self {
        match raw.map(str::trim).filter(|value| !value.is_empty()) {
            None => ChatAuth::Bearer,
            Some(name) if name.eq_ignore_ascii_case("authorization") || name.eq_ignore_ascii_case("bearer") => {
                ChatAuth::Bearer
            }
            Some(name) => ChatAuth::Header(name.to_string()),
        }
    }
}

/// Client for `POST {base}/chat/completions` endpoints that answer with
/// generated images in the assistant message.
pub struct ChatCompletionsProvider {
    id: &'static str,
    credential_slot: &'static str,
    api_base: String,
    auth: ChatAuth,
    extra_headers: Vec<(String, String)>,
    http: reqwest::Client,
    timeout: Duration,
    max_image_bytes: u64,
}

impl ChatCompletionsProvider {
    pub fn openrouter(config: &EngineConfig, http: reqwest::Client) -> Self {
        let mut extra_headers = Vec::new();
        if let Some(referer) = config.openrouter_http_referer.as_deref() {
            extra_headers.push(("HTTP-Referer".to_string(), referer.to_string()));
        }
        if let Some(title) = config.openrouter_x_title.as_deref() {
            extra_headers.push(("X-Title".to_string(), title.to_string()));
        }
        Self {
            id: OPENROUTER_PROVIDER,
            credential_slot: OPENROUTER_KEY,
            api_base: config.openrouter_api_base.clone(),
            auth: ChatAuth::Bearer,
            extra_headers,
            http,
            timeout: config.request_timeout,
            max_image_bytes: config.max_upload_bytes,
        }
    }

    pub fn compatible(config: &EngineConfig, http: reqwest::Client) -> Option<Self> {
        let api_base = config.chat_api_base.clone()?;
        Some(Self {
            id: CHAT_COMPATIBLE_PROVIDER,
            credential_slot: CHAT_KEY,
            api_base,
            auth: ChatAuth::from_config(config.chat_auth_header.as_deref()),
            extra_headers: Vec::new(),
            http,
            timeout: config.request_timeout,
            max_image_bytes: config.max_upload_bytes,
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }

    pub fn build_payload(submission: &ProviderSubmission<'_>) -> Value {
        let mut content = vec![json!({
            "type": "text",
            "text": submission.prompt,
        })];
        for image in submission.images {
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": image.to_data_url() },
            }));
        }
        json!({
            "model": submission.model,
            "messages": [{
                "role": "user",
                "content": content,
            }],
            "modalities": ["image", "text"],
            "max_tokens": MAX_TOKENS,
            "temperature": TEMPERATURE,
        })
    }

    async fn resolve_image(&self, source: ImageSource) -> Result<ProviderImage, ProviderError> {
        match source {
            ImageSource::DataUrl(parts) => {
                let bytes = parts.decode().map_err(|err| {
                    ProviderError::malformed(self.id, format!("image data URL did not decode: {err}"))
                })?;
                Ok(ProviderImage {
                    bytes,
                    mime_type: Some(parts.mime_type),
                })
            }
            ImageSource::Remote(url) => self.download_image(&url).await,
        }
    }

    async fn download_image(&self, url: &str) -> Result<ProviderImage, ProviderError> {
        debug!(provider = self.id, url, "downloading generated image");
        let response = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| transport_error(self.id, &err))?;
        if !response.status().is_success() {
            return Err(ProviderError::malformed(
                self.id,
                format!("image download failed (HTTP {})", response.status().as_u16()),
            ));
        }
        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = match read_capped_body(response, self.max_image_bytes).await {
            Ok(bytes) => bytes,
            Err(BodyReadError::TooLarge { size }) => {
                return Err(ProviderError::malformed(
                    self.id,
                    format!(
                        "generated image is larger than {} bytes (read {size})",
                        self.max_image_bytes
                    ),
                ))
            }
            Err(BodyReadError::Transport(err)) => return Err(transport_error(self.id, &err)),
        };
        Ok(ProviderImage { bytes, mime_type })
    }
}

#[async_trait]
impl ImageProvider for ChatCompletionsProvider {
    fn name(&self) -> &str {
        self.id
    }

    fn credential_slot(&self) -> Option<&'static str> {
        Some(self.credential_slot)
    }

    async fn submit(&self, submission: ProviderSubmission<'_>) -> Result<ProviderOutput, ProviderError> {
        let api_key = sanitize_api_key(self.id, submission.api_key)?;
        let endpoint = self.endpoint();
        let payload = Self::build_payload(&submission);
        info!(
            provider = self.id,
            model = submission.model,
            images = submission.images.len(),
            "submitting chat completion request"
        );

        let mut request = self
            .http
            .post(&endpoint)
            .header(ACCEPT, "application/json")
            .timeout(self.timeout)
            .json(&payload);
        request = match &self.auth {
            ChatAuth::Bearer => request.bearer_auth(&api_key),
            ChatAuth::Header(name) => request.header(name.as_str(), api_key.as_str()),
        };
        for (name, value) in &self.extra_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|err| transport_error(self.id, &err))?;
        let (status, body) = read_body(self.id, response).await?;
        debug!(provider = self.id, status, bytes = body.len(), "chat completion response");
        if !(200..300).contains(&status) {
            return Err(classify_chat_failure(
                self.id,
                Some(status),
                &error_message_from_body(&body),
            ));
        }

        let parsed: ChatResponse = serde_json::from_str(&body).map_err(|err| {
            ProviderError::malformed(self.id, format!("response was not valid JSON: {err}"))
        })?;
        let finish_reason = parsed
            .choices
            .first()
            .and_then(|choice| choice.finish_reason.clone());

        let image = match interpret_chat_response(&parsed) {
            ChatOutcome::Image(source) => self.resolve_image(source).await?,
            ChatOutcome::Filtered { reason } => {
                return Err(ProviderError::new(
                    ErrorClass::ContentPolicy,
                    self.id,
                    format!("request blocked by content filter ({reason})"),
                ))
            }
            ChatOutcome::Failed { code, message } => {
                return Err(classify_chat_failure(self.id, code, &message))
            }
            ChatOutcome::Malformed(reason) => return Err(ProviderError::malformed(self.id, reason)),
            ChatOutcome::Empty { finish_reason } => {
                return Err(ProviderError::malformed(
                    self.id,
                    format!(
                        "response contained no image (finish_reason={})",
                        finish_reason.as_deref().unwrap_or("unknown")
                    ),
                ))
            }
        };

        let mut provider_response = Map::new();
        provider_response.insert("endpoint".to_string(), Value::String(endpoint));
        provider_response.insert("id".to_string(), json!(parsed.id));
        provider_response.insert("model".to_string(), json!(parsed.model));
        provider_response.insert("finish_reason".to_string(), json!(finish_reason));
        provider_response.insert("usage".to_string(), parsed.usage.unwrap_or(Value::Null));
        Ok(ProviderOutput {
            image,
            provider_response,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub error: Option<ChatErrorBody>,
    #[serde(default)]
    pub usage: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub message: Option<ChatMessage>,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub native_finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub content: Option<ChatContent>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub images: Vec<ChatImage>,
}

// Some gateways send `"images": null` next to a usable `content`.
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Parts(Vec<ChatContentPart>),
    Other(Value),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ChatContentPart {
    Typed {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        image_url: Option<ImageUrlField>,
    },
    Other(Value),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ChatImage {
    Bare(String),
    Wrapped { image_url: ImageUrlField },
    Other(Value),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ImageUrlField {
    Bare(String),
    Object { url: String },
}

impl ImageUrlField {
    fn url(&self) -> &str {
        match self {
            ImageUrlField::Bare(url) | ImageUrlField::Object { url } => url,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    DataUrl(DataUrlParts),
    Remote(String),
}

/// What a successfully transported chat response amounts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatOutcome {
    Image(ImageSource),
    Filtered { reason: String },
    Failed { code: Option<u16>, message: String },
    Malformed(String),
    Empty { finish_reason: Option<String> },
}

pub fn interpret_chat_response(response: &ChatResponse) -> ChatOutcome {
    if let Some(error) = response.error.as_ref() {
        let code = error.code.as_ref().and_then(|code| match code {
            Value::Number(number) => number.as_u64().and_then(|n| u16::try_from(n).ok()),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        });
        return ChatOutcome::Failed {
            code,
            message: error
                .message
                .clone()
                .unwrap_or_else(|| "provider returned an error object".to_string()),
        };
    }

    let Some(choice) = response.choices.first() else {
        return ChatOutcome::Empty { finish_reason: None };
    };
    let finish = choice.finish_reason.as_deref().map(str::trim);
    let native = choice.native_finish_reason.as_deref().map(str::trim);
    if finish == Some("content_filter") {
        return ChatOutcome::Filtered {
            reason: "content_filter".to_string(),
        };
    }
    if let Some(native) = native.filter(|reason| BLOCKING_NATIVE_REASONS.contains(reason)) {
        return ChatOutcome::Filtered {
            reason: native.to_string(),
        };
    }

    let Some(message) = choice.message.as_ref() else {
        return ChatOutcome::Empty {
            finish_reason: choice.finish_reason.clone(),
        };
    };
    for image in &message.images {
        let url = match image {
            ChatImage::Bare(url) => url.as_str(),
            ChatImage::Wrapped { image_url } => image_url.url(),
            ChatImage::Other(_) => continue,
        };
        return image_source(url);
    }

    let embedded = match message.content.as_ref() {
        Some(ChatContent::Text(text)) => find_embedded_data_url(text),
        Some(ChatContent::Parts(parts)) => parts.iter().find_map(|part| match part {
            ChatContentPart::Typed { image_url: Some(field), .. } => Some(field.url().to_string()),
            ChatContentPart::Typed { text: Some(text), .. } => find_embedded_data_url(text),
            _ => None,
        }),
        _ => None,
    };
    match embedded {
        Some(url) => image_source(&url),
        None => ChatOutcome::Empty {
            finish_reason: choice.finish_reason.clone(),
        },
    }
}

fn image_source(url: &str) -> ChatOutcome {
    let trimmed = url.trim();
    if trimmed.starts_with("data:") {
        return match parse_data_url(trimmed) {
            Ok(parts) if parts.mime_type.starts_with("image/") => {
                ChatOutcome::Image(ImageSource::DataUrl(parts))
            }
            Ok(parts) => ChatOutcome::Malformed(format!(
                "data URL carries '{}', not an image",
                parts.mime_type
            )),
            Err(err) => ChatOutcome::Malformed(err.to_string()),
        };
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return ChatOutcome::Image(ImageSource::Remote(trimmed.to_string()));
    }
    ChatOutcome::Malformed(format!(
        "unexpected image reference '{}'",
        truncate_text(trimmed, 48)
    ))
}

fn find_embedded_data_url(text: &str) -> Option<String> {
    let start = text.find("data:image/")?;
    let tail = &text[start..];
    let end = tail
        .find(|ch: char| ch.is_whitespace() || matches!(ch, ')' | '"' | '\'' | ']' | '>'))
        .unwrap_or(tail.len());
    Some(tail[..end].to_string())
}

fn error_message_from_body(body: &str) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|value| {
        value
            .get("error")
            .and_then(|error| error.get("message").or(Some(error)))
            .map(|message| match message {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
    });
    truncate_text(from_json.as_deref().unwrap_or(body).trim(), 512)
}

/// Maps an HTTP status and/or error text from a chat endpoint onto the
/// shared taxonomy.
pub(crate) fn classify_chat_failure(provider: &str, status: Option<u16>, message: &str) -> ProviderError {
    let lowered = message.to_ascii_lowercase();
    let policy_words = ["moderation", "policy", "safety", "flagged", "prohibited"];
    let quota_words = ["daily", "free-tier", "free tier", "per day", "per-day", "quota"];
    let class = match status {
        Some(401) | Some(403) => ErrorClass::Auth,
        Some(402) => ErrorClass::Quota,
        Some(429) if contains_any(&lowered, &quota_words) => ErrorClass::Quota,
        Some(429) => ErrorClass::RateLimit,
        Some(408) | Some(504) => ErrorClass::Timeout,
        Some(400) if contains_any(&lowered, &policy_words) => ErrorClass::ContentPolicy,
        _ if contains_any(
            &lowered,
            &["invalid api key", "unauthorized", "no auth credentials", "user not found"],
        ) =>
        {
            ErrorClass::Auth
        }
        _ if contains_any(&lowered, &["insufficient credits", "quota"]) => ErrorClass::Quota,
        _ if contains_any(&lowered, &["rate limit", "rate-limit", "too many requests"]) => {
            ErrorClass::RateLimit
        }
        _ if contains_any(&lowered, &policy_words) => ErrorClass::ContentPolicy,
        _ if contains_any(&lowered, &["timed out", "timeout"]) => ErrorClass::Timeout,
        _ => ErrorClass::Unknown,
    };
    let message = match status {
        Some(code) => format!("HTTP {code}: {message}"),
        None => message.to_string(),
    };
    ProviderError::new(class, provider, message)
}
