use std::fmt;

use serde::{Deserialize, Serialize};

use crate::features::FeatureKind;

/// Classification shared by every provider failure.
///
/// Each provider maps its own wire-level failures (status codes, error
/// bodies, transport errors) onto this taxonomy so callers can pick
/// guidance without knowing which backend answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    Auth,
    RateLimit,
    Quota,
    ContentPolicy,
    Network,
    Timeout,
    MalformedResponse,
    Unknown,
}

impl ErrorClass {
    pub const ALL: [ErrorClass; 8] = [
        ErrorClass::Auth,
        ErrorClass::RateLimit,
        ErrorClass::Quota,
        ErrorClass::ContentPolicy,
        ErrorClass::Network,
        ErrorClass::Timeout,
        ErrorClass::MalformedResponse,
        ErrorClass::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Auth => "auth",
            ErrorClass::RateLimit => "rate-limit",
            ErrorClass::Quota => "quota",
            ErrorClass::ContentPolicy => "content-policy",
            ErrorClass::Network => "network",
            ErrorClass::Timeout => "timeout",
            ErrorClass::MalformedResponse => "malformed-response",
            ErrorClass::Unknown => "unknown",
        }
    }

    pub fn guidance(&self) -> &'static str {
        match self {
            ErrorClass::Auth => "Check your API key in settings; it was rejected or is missing.",
            ErrorClass::RateLimit => "The provider is rate limiting requests. Wait a minute before retrying.",
            ErrorClass::Quota => {
                "Your API quota is exhausted. It resets at a fixed time each day; upgrade your plan or wait."
            }
            ErrorClass::ContentPolicy => {
                "The request was blocked by the provider's safety filter. Try different images or wording."
            }
            ErrorClass::Network => "Could not reach the provider. Check your internet connection.",
            ErrorClass::Timeout => "The operation took too long. Try smaller images or retry.",
            ErrorClass::MalformedResponse => {
                "The provider answered without a usable image. Try again; this is usually transient."
            }
            ErrorClass::Unknown => "Something went wrong. Retry, and check the details below if it persists.",
        }
    }

    /// Whether a failure of this class plausibly only affects the provider
    /// that produced it, so a different provider is worth one attempt.
    pub fn allows_fallback(&self) -> bool {
        !matches!(self, ErrorClass::Auth | ErrorClass::Network)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|class| class.as_str() == normalized)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{provider} failed ({class}): {message}")]
pub struct ProviderError {
    pub class: ErrorClass,
    pub provider: String,
    pub message: String,
}

impl ProviderError {
    pub fn new(class: ErrorClass, provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class,
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn malformed(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::MalformedResponse, provider, message)
    }

    /// Guidance text followed by the raw message for `unknown` failures.
    pub fn user_message(&self) -> String {
        match self.class {
            ErrorClass::Unknown => format!("{} ({})", self.class.guidance(), self.message),
            _ => self.class.guidance().to_string(),
        }
    }
}

/// Problems detected before any image work or network call happens.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("a subject photo is required")]
    MissingSubject,

    #[error("{feature} needs a reference image")]
    MissingReference { feature: FeatureKind },

    #[error("{feature} needs either a reference image or a text description")]
    MissingDescription { feature: FeatureKind },

    #[error("file type '{mime}' is not allowed; use JPEG, PNG or WebP")]
    UnsupportedMime { mime: String },

    #[error("file is {size} bytes; the limit is {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("'{raw}' is not a #RRGGBB colour")]
    InvalidColor { raw: String },

    #[error("unknown provider '{name}' (available: {available})")]
    UnknownProvider { name: String, available: String },

    #[error("no API key configured for {provider}")]
    MissingCredential { provider: String },

    #[error("no image model is registered for {provider}")]
    NoModel { provider: String },
}
