mod chat;
mod dryrun;
mod gemini;
mod http;

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use tryon_contracts::models::{ModelRegistry, ModelSelector, ModelSpec};
use tryon_contracts::{ErrorClass, ProviderError};

use crate::codec::ImageAsset;
use crate::config::EngineConfig;

pub use chat::{
    interpret_chat_response, ChatAuth, ChatCompletionsProvider, ChatOutcome, ChatResponse,
    ImageSource, CHAT_COMPATIBLE_PROVIDER, OPENROUTER_PROVIDER,
};
pub use dryrun::{DryrunProvider, DRYRUN_PROVIDER};
pub use gemini::{
    interpret_generate_content, GeminiOutcome, GeminiProvider, GenerateContentResponse, KeyCheck,
    GEMINI_PROVIDER,
};

/// Everything a provider needs for one call. Images are already prepared
/// (padded and encoded) and are sent in order: subject first.
#[derive(Debug, Clone, Copy)]
pub struct ProviderSubmission<'a> {
    pub prompt: &'a str,
    pub images: &'a [ImageAsset],
    pub model: &'a str,
    pub api_key: Option<&'a str>,
}

/// Decoded image bytes as the provider delivered them.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderImage {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

impl std::fmt::Debug for ProviderImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderImage")
            .field("bytes", &self.bytes.len())
            .field("mime_type", &self.mime_type)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ProviderOutput {
    pub image: ProviderImage,
    pub provider_response: Map<String, Value>,
}

#[async_trait]
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Session key holding this provider's credential, or `None` when the
    /// provider needs none.
    fn credential_slot(&self) -> Option<&'static str>;

    async fn submit(&self, submission: ProviderSubmission<'_>) -> Result<ProviderOutput, ProviderError>;
}

#[derive(Default, Clone)]
pub struct ImageProviderRegistry {
    providers: IndexMap<String, Arc<dyn ImageProvider>>,
}

impl ImageProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.register_arc(Arc::new(provider));
    }

    pub fn register_arc(&mut self, provider: Arc<dyn ImageProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ImageProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

/// The providers available for `config`. The chat-compatible client is
/// only present when a base URL is configured.
pub fn default_provider_registry(config: &EngineConfig, http: reqwest::Client) -> ImageProviderRegistry {
    let mut registry = ImageProviderRegistry::new();
    registry.register(ChatCompletionsProvider::openrouter(config, http.clone()));
    registry.register(GeminiProvider::new(config, http.clone()));
    if let Some(compatible) = ChatCompletionsProvider::compatible(config, http) {
        registry.register(compatible);
    }
    registry.register(DryrunProvider);
    registry
}

/// Built-in models plus the configured chat-compatible model, if any.
pub fn model_selector(config: &EngineConfig) -> ModelSelector {
    let mut registry = ModelRegistry::default();
    if let Some(model) = config.chat_model.as_deref() {
        registry.register(ModelSpec::new(model, CHAT_COMPATIBLE_PROVIDER, &["image", "edit"]));
    }
    ModelSelector::new(Some(registry))
}

/// Trims the key and strips control characters. Keys that are empty, too
/// short or not plain ASCII cannot be sent in a header and are rejected.
pub fn sanitize_api_key(provider: &str, raw: Option<&str>) -> Result<String, ProviderError> {
    let Some(raw) = raw else {
        return Err(ProviderError::new(
            ErrorClass::Auth,
            provider,
            "no API key configured",
        ));
    };
    let cleaned: String = raw.trim().chars().filter(|ch| !ch.is_control()).collect();
    if cleaned.is_empty() {
        return Err(ProviderError::new(ErrorClass::Auth, provider, "API key is empty"));
    }
    if !cleaned.is_ascii() {
        return Err(ProviderError::new(
            ErrorClass::Auth,
            provider,
            "API key contains non-ASCII characters",
        ));
    }
    if cleaned.len() < 10 {
        return Err(ProviderError::new(
            ErrorClass::Auth,
            provider,
            "API key is too short",
        ));
    }
    Ok(cleaned)
}
