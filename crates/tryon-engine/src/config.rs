use std::env;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_TARGET_DIMENSION: u32 = 1024;
pub const DEFAULT_OUTBOUND_JPEG_QUALITY: u8 = 85;
pub const DEFAULT_CROP_JPEG_QUALITY: u8 = 95;
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;
pub const ALLOWED_MIME_TYPES: [&str; 4] = ["image/jpeg", "image/jpg", "image/png", "image/webp"];

pub const DEFAULT_OPENROUTER_API_BASE: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_OPENROUTER_X_TITLE: &str = "Virtual Try-On";
pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Everything the pipeline needs that is not part of a single request.
///
/// Built once and handed to the orchestrator and provider clients; nothing
/// downstream reads the environment on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub target_dimension: u32,
    pub outbound_jpeg_quality: u8,
    pub crop_jpeg_quality: u8,
    pub max_upload_bytes: u64,
    pub allowed_mime_types: Vec<String>,
    pub file_read_timeout: Duration,
    pub request_timeout: Duration,
    pub fallback_provider: Option<String>,
    pub openrouter_api_base: String,
    pub openrouter_http_referer: Option<String>,
    pub openrouter_x_title: Option<String>,
    pub gemini_api_base: String,
    pub chat_api_base: Option<String>,
    pub chat_auth_header: Option<String>,
    pub chat_model: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            target_dimension: DEFAULT_TARGET_DIMENSION,
            outbound_jpeg_quality: DEFAULT_OUTBOUND_JPEG_QUALITY,
            crop_jpeg_quality: DEFAULT_CROP_JPEG_QUALITY,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            allowed_mime_types: ALLOWED_MIME_TYPES.iter().map(|m| m.to_string()).collect(),
            file_read_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(120),
            fallback_provider: None,
            openrouter_api_base: DEFAULT_OPENROUTER_API_BASE.to_string(),
            openrouter_http_referer: None,
            openrouter_x_title: Some(DEFAULT_OPENROUTER_X_TITLE.to_string()),
            gemini_api_base: DEFAULT_GEMINI_API_BASE.to_string(),
            chat_api_base: None,
            chat_auth_header: None,
            chat_model: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(non_empty_env)
    }

    /// Layers overrides from `lookup` on top of the defaults. Values that do
    /// not parse are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(value) = parse_number::<u32>(&lookup, "TRYON_TARGET_DIMENSION") {
            if value >= 64 {
                config.target_dimension = value;
            } else {
                warn!(value, "TRYON_TARGET_DIMENSION below 64 ignored");
            }
        }
        if let Some(value) = parse_number::<u64>(&lookup, "TRYON_MAX_UPLOAD_BYTES") {
            config.max_upload_bytes = value;
        }
        if let Some(value) = parse_number::<f64>(&lookup, "TRYON_FILE_READ_TIMEOUT") {
            config.file_read_timeout = seconds(value, config.file_read_timeout);
        }
        if let Some(value) = parse_number::<f64>(&lookup, "TRYON_REQUEST_TIMEOUT") {
            config.request_timeout = seconds(value, config.request_timeout);
        }
        config.fallback_provider = lookup("TRYON_FALLBACK_PROVIDER");

        if let Some(base) = lookup("OPENROUTER_API_BASE") {
            config.openrouter_api_base = normalize_base(&base);
        }
        if let Some(referer) = lookup("OPENROUTER_HTTP_REFERER") {
            config.openrouter_http_referer = Some(referer);
        }
        if let Some(title) = lookup("OPENROUTER_X_TITLE") {
            config.openrouter_x_title = Some(title);
        }
        if let Some(base) = lookup("GEMINI_API_BASE") {
            config.gemini_api_base = normalize_base(&base);
        }
        config.chat_api_base = lookup("TRYON_CHAT_API_BASE").map(|base| normalize_base(&base));
        config.chat_auth_header = lookup("TRYON_CHAT_AUTH_HEADER");
        config.chat_model = lookup("TRYON_CHAT_MODEL");
        config
    }

    pub fn allows_mime(&self, mime_type: &str) -> bool {
        self.allowed_mime_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(mime_type))
    }
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, raw = raw.as_str(), "ignoring unparseable config value");
            None
        }
    }
}

fn seconds(value: f64, current: Duration) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        current
    }
}

fn normalize_base(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}
