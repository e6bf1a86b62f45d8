//! One generation request, end to end: validate, prepare both images,
//! build the prompt, dispatch, and restore the original aspect ratio.
//!
//! A failed primary attempt gets at most one retry on a different provider,
//! and only for failure classes that plausibly stay local to the primary.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use tryon_contracts::events::{EventPayload, EventWriter, GenerationEvent};
use tryon_contracts::features::artifact_file_name;
use tryon_contracts::models::ModelSelector;
use tryon_contracts::prompts::build_prompt;
use tryon_contracts::runs::receipts::AttemptRecord;
use tryon_contracts::session::Credentials;
use tryon_contracts::{ErrorClass, FeatureKind, GenerationOptions, ProviderError, ValidationError};

use crate::codec::{validate_upload, ImageAsset, ImageError};
use crate::config::EngineConfig;
use crate::geometry::{crop_to_original_aspect, pad_to_square};
use crate::providers::{
    ImageProvider, ImageProviderRegistry, ProviderOutput, ProviderSubmission, GEMINI_PROVIDER,
    OPENROUTER_PROVIDER,
};

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub feature: FeatureKind,
    pub subject: Option<ImageAsset>,
    pub reference: Option<ImageAsset>,
    pub options: GenerationOptions,
    pub provider: String,
    pub model: Option<String>,
    /// Pad to a square before sending and crop afterwards. When off, the
    /// images go out as loaded and the provider output is delivered as is.
    pub letterbox: bool,
}

impl GenerationRequest {
    pub fn new(feature: FeatureKind, provider: impl Into<String>) -> Self {
        Self {
            feature,
            subject: None,
            reference: None,
            options: GenerationOptions::default(),
            provider: provider.into(),
            model: None,
            letterbox: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OriginalAspect {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub feature: FeatureKind,
    pub image: ImageAsset,
    pub original_aspect: OriginalAspect,
    pub provider: String,
    pub model: String,
    /// Why the delivered model or provider differs from what was asked for.
    pub fallback_reason: Option<String>,
    pub attempts: Vec<AttemptRecord>,
    pub prompt: String,
    pub provider_response: Map<String, Value>,
}

impl GenerationResult {
    pub fn image_data_url(&self) -> String {
        self.image.to_data_url()
    }

    pub fn mime_type(&self) -> &str {
        &self.image.mime_type
    }

    pub fn width(&self) -> u32 {
        self.image.width
    }

    pub fn height(&self) -> u32 {
        self.image.height
    }

    pub fn artifact_file_name(&self, timestamp_millis: i64) -> String {
        artifact_file_name(self.feature, timestamp_millis, &self.image.mime_type)
    }

    /// Summary suitable for receipts and event payloads; carries no pixels.
    pub fn metadata(&self) -> Map<String, Value> {
        let mut meta = Map::new();
        meta.insert("mime_type".to_string(), json!(self.image.mime_type));
        meta.insert("width".to_string(), json!(self.image.width));
        meta.insert("height".to_string(), json!(self.image.height));
        meta.insert("original_aspect".to_string(), json!(self.original_aspect));
        meta.insert("provider".to_string(), json!(self.provider));
        meta.insert("model".to_string(), json!(self.model));
        meta.insert("fallback_reason".to_string(), json!(self.fallback_reason));
        meta
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("generation failed: {}", render_attempts(.attempts))]
    Provider {
        error: ProviderError,
        attempts: Vec<AttemptRecord>,
    },
}

impl GenerationError {
    /// Final provider classification, if the failure came from a provider.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            GenerationError::Provider { error, .. } => Some(error.class),
            _ => None,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            GenerationError::Validation(err) => err.to_string(),
            GenerationError::Image(err) => err.user_message(),
            GenerationError::Provider { error, .. } => error.user_message(),
        }
    }
}

/// `openrouter: <msg> ; then gemini: <msg>`
pub fn render_attempts(attempts: &[AttemptRecord]) -> String {
    attempts
        .iter()
        .map(|attempt| {
            let detail = match (&attempt.class, &attempt.message) {
                (Some(class), Some(message)) => format!("{class}: {message}"),
                (Some(class), None) => class.to_string(),
                (None, _) => "ok".to_string(),
            };
            format!("{}: {}", attempt.provider, detail)
        })
        .collect::<Vec<_>>()
        .join(" ; then ")
}

struct Target {
    provider: Arc<dyn ImageProvider>,
    model: String,
    api_key: Option<String>,
    fallback_reason: Option<String>,
}

struct Prepared {
    subject: ImageAsset,
    images: Vec<ImageAsset>,
}

pub struct Orchestrator {
    config: EngineConfig,
    providers: ImageProviderRegistry,
    credentials: Credentials,
    selector: ModelSelector,
    events: Option<EventWriter>,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        providers: ImageProviderRegistry,
        credentials: Credentials,
        selector: ModelSelector,
        events: Option<EventWriter>,
    ) -> Self {
        Self {
            config,
            providers,
            credentials,
            selector,
            events,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult, GenerationError> {
        let started = Instant::now();
        let primary = self.validate(&request)?;
        let fallback = self.resolve_fallback(primary.provider.name());
        let prompt = build_prompt(request.feature, &request.options, request.reference.is_some());
        info!(
            feature = %request.feature,
            provider = primary.provider.name(),
            model = %primary.model,
            fallback = fallback.as_ref().map(|target| target.provider.name()),
            "generation started"
        );
        self.emit(
            GenerationEvent::Started,
            json!({
                "feature": request.feature.as_str(),
                "provider": primary.provider.name(),
                "model": primary.model,
                "fallback_provider": fallback.as_ref().map(|target| target.provider.name()),
                "letterbox": request.letterbox,
            }),
        );

        let prepared = match self.prepare(&request).await {
            Ok(prepared) => prepared,
            Err(err) => {
                self.emit_failure(&err, &[]);
                return Err(err.into());
            }
        };
        debug!(
            images = prepared.images.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "images prepared"
        );
        self.emit(
            GenerationEvent::ImagesPrepared,
            json!({
                "images": prepared.images.iter().map(|image| json!({
                    "mime_type": image.mime_type,
                    "width": image.width,
                    "height": image.height,
                    "bytes": image.size(),
                })).collect::<Vec<_>>(),
            }),
        );

        let mut attempts = Vec::new();
        let first_error = match self.attempt(&request, &prepared, &primary, &prompt).await {
            Ok(result) => {
                attempts.push(success_record(&primary));
                return Ok(self.finish(request, prepared, primary, prompt, result, attempts, started));
            }
            Err(err) => err,
        };
        attempts.push(failure_record(&primary, &first_error));
        self.note_attempt_failure(&first_error, &primary.model);

        let fallback = match fallback {
            Some(fallback) if first_error.class.allows_fallback() => fallback,
            _ => return Err(self.exhausted(first_error, attempts)),
        };
        info!(
            from = primary.provider.name(),
            to = fallback.provider.name(),
            class = %first_error.class,
            "engaging fallback provider"
        );
        self.emit(
            GenerationEvent::FallbackEngaged,
            json!({
                "from": primary.provider.name(),
                "to": fallback.provider.name(),
                "model": fallback.model,
                "class": first_error.class.as_str(),
            }),
        );

        match self.attempt(&request, &prepared, &fallback, &prompt).await {
            Ok(result) => {
                attempts.push(success_record(&fallback));
                let mut fallback_target = fallback;
                let reason = format!(
                    "{} failed ({}); delivered by {}.",
                    primary.provider.name(),
                    first_error.class,
                    fallback_target.provider.name()
                );
                fallback_target.fallback_reason = Some(match fallback_target.fallback_reason.take() {
                    Some(model_reason) => format!("{reason} {model_reason}"),
                    None => reason,
                });
                Ok(self.finish(request, prepared, fallback_target, prompt, result, attempts, started))
            }
            Err(err) => {
                attempts.push(failure_record(&fallback, &err));
                self.note_attempt_failure(&err, &fallback.model);
                Err(self.exhausted(err, attempts))
            }
        }
    }

    /// Everything that can be decided without touching pixels or the network.
    fn validate(&self, request: &GenerationRequest) -> Result<Target, GenerationError> {
        let subject = request.subject.as_ref().ok_or(ValidationError::MissingSubject)?;
        validate_upload(Some(subject.mime_type.as_str()), subject.size(), &self.config)?;
        match &request.reference {
            Some(reference) => {
                validate_upload(Some(reference.mime_type.as_str()), reference.size(), &self.config)?
            }
            None if request.feature.requires_reference() => {
                return Err(ValidationError::MissingReference {
                    feature: request.feature,
                }
                .into())
            }
            None if request.options.description_for(request.feature).is_none() => {
                return Err(ValidationError::MissingDescription {
                    feature: request.feature,
                }
                .into())
            }
            None => {}
        }

        let name = request.provider.trim();
        let provider = self.providers.get(name).ok_or_else(|| ValidationError::UnknownProvider {
            name: name.to_string(),
            available: self.providers.names().join(", "),
        })?;
        let api_key = match provider.credential_slot() {
            Some(slot) => Some(
                self.credentials
                    .for_slot(slot)
                    .ok_or_else(|| ValidationError::MissingCredential {
                        provider: name.to_string(),
                    })?
                    .to_string(),
            ),
            None => None,
        };
        let selection = self
            .selector
            .select(request.model.as_deref(), name)
            .map_err(|_| ValidationError::NoModel {
                provider: name.to_string(),
            })?;
        if let Some(reason) = &selection.fallback_reason {
            warn!(provider = name, "{reason}");
        }
        Ok(Target {
            provider,
            model: selection.model.name,
            api_key,
            fallback_reason: selection.fallback_reason,
        })
    }

    /// The secondary target, if one is registered, distinct from the primary,
    /// has a model and has its credential present.
    fn resolve_fallback(&self, primary: &str) -> Option<Target> {
        let name = match self.config.fallback_provider.as_deref() {
            Some(configured) => configured.trim(),
            None if primary == OPENROUTER_PROVIDER => GEMINI_PROVIDER,
            None if primary == GEMINI_PROVIDER => OPENROUTER_PROVIDER,
            None => return None,
        };
        if name.is_empty() || name == primary {
            return None;
        }
        let provider = self.providers.get(name)?;
        let api_key = match provider.credential_slot() {
            Some(slot) => Some(self.credentials.for_slot(slot)?.to_string()),
            None => None,
        };
        // The requested model belongs to the primary; the fallback uses its own default.
        let selection = self.selector.select(None, name).ok()?;
        Some(Target {
            provider,
            model: selection.model.name,
            api_key,
            fallback_reason: None,
        })
    }

    async fn prepare(&self, request: &GenerationRequest) -> Result<Prepared, ImageError> {
        let subject = request
            .subject
            .clone()
            .ok_or(ImageError::Validation(ValidationError::MissingSubject))?;
        if !request.letterbox {
            let mut images = vec![subject.clone()];
            images.extend(request.reference.clone());
            return Ok(Prepared { subject, images });
        }

        let target = self.config.target_dimension;
        let quality = self.config.outbound_jpeg_quality;
        let subject_job = pad_blocking(subject.clone(), target, quality);
        let reference_job = async {
            match request.reference.clone() {
                Some(reference) => pad_blocking(reference, target, quality).await.map(Some),
                None => Ok(None),
            }
        };
        let (padded_subject, padded_reference) = tokio::try_join!(subject_job, reference_job)?;
        let mut images = vec![padded_subject];
        images.extend(padded_reference);
        Ok(Prepared { subject, images })
    }

    /// Submit, decode and crop. Anything that goes wrong after the provider
    /// answered counts as a malformed response from that provider.
    async fn attempt(
        &self,
        request: &GenerationRequest,
        prepared: &Prepared,
        target: &Target,
        prompt: &str,
    ) -> Result<(ImageAsset, Map<String, Value>), ProviderError> {
        let name = target.provider.name().to_string();
        let submission = ProviderSubmission {
            prompt,
            images: &prepared.images,
            model: &target.model,
            api_key: target.api_key.as_deref(),
        };
        let started = Instant::now();
        let ProviderOutput {
            image,
            provider_response,
        } = target.provider.submit(submission).await?;
        debug!(
            provider = %name,
            bytes = image.bytes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "provider returned an image"
        );

        let delivered = ImageAsset::from_bytes(image.bytes, image.mime_type.as_deref(), None)
            .map_err(|err| ProviderError::malformed(&name, format!("returned image is unusable: {err}")))?;
        if !request.letterbox {
            return Ok((delivered, provider_response));
        }

        let subject = &prepared.subject;
        let (width, height) = (subject.width, subject.height);
        let target_dimension = self.config.target_dimension;
        let quality = self.config.crop_jpeg_quality;
        let cropped = tokio::task::spawn_blocking(move || {
            crop_to_original_aspect(&delivered, width, height, target_dimension, quality)
        })
        .await
        .map_err(|err| ProviderError::new(ErrorClass::Unknown, &name, format!("crop task failed: {err}")))?
        .map_err(|err| ProviderError::malformed(&name, format!("returned image is unusable: {err}")))?;
        Ok((cropped, provider_response))
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        request: GenerationRequest,
        prepared: Prepared,
        target: Target,
        prompt: String,
        (mut image, provider_response): (ImageAsset, Map<String, Value>),
        attempts: Vec<AttemptRecord>,
        started: Instant,
    ) -> GenerationResult {
        image.name = prepared.subject.name.clone();
        let result = GenerationResult {
            feature: request.feature,
            image,
            original_aspect: OriginalAspect {
                width: prepared.subject.width,
                height: prepared.subject.height,
            },
            provider: target.provider.name().to_string(),
            model: target.model,
            fallback_reason: target.fallback_reason,
            attempts,
            prompt,
            provider_response,
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            provider = %result.provider,
            model = %result.model,
            width = result.width(),
            height = result.height(),
            elapsed_ms,
            "generation finished"
        );
        let mut payload = result.metadata();
        payload.insert("attempts".to_string(), json!(result.attempts.len()));
        payload.insert("elapsed_ms".to_string(), json!(elapsed_ms));
        self.emit_payload(GenerationEvent::Finished, payload);
        result
    }

    fn note_attempt_failure(&self, error: &ProviderError, model: &str) {
        warn!(
            provider = %error.provider,
            model,
            class = %error.class,
            "provider attempt failed: {}",
            error.message
        );
        self.emit(
            GenerationEvent::AttemptFailed,
            json!({
                "provider": error.provider,
                "model": model,
                "class": error.class.as_str(),
                "message": error.message,
            }),
        );
    }

    fn exhausted(&self, error: ProviderError, attempts: Vec<AttemptRecord>) -> GenerationError {
        self.emit_failure(&error, &attempts);
        GenerationError::Provider { error, attempts }
    }

    fn emit_failure(&self, error: &dyn std::fmt::Display, attempts: &[AttemptRecord]) {
        self.emit(
            GenerationEvent::Failed,
            json!({
                "error": error.to_string(),
                "attempts": attempts,
            }),
        );
    }

    fn emit(&self, event: GenerationEvent, payload: Value) {
        let payload = match payload {
            Value::Object(map) => map,
            _ => EventPayload::new(),
        };
        self.emit_payload(event, payload);
    }

    fn emit_payload(&self, event: GenerationEvent, payload: EventPayload) {
        let Some(events) = &self.events else {
            return;
        };
        if let Err(err) = events.emit_generation(event, payload) {
            warn!(event = event.as_str(), "could not append event: {err:#}");
        }
    }
}

async fn pad_blocking(image: ImageAsset, target: u32, quality: u8) -> Result<ImageAsset, ImageError> {
    tokio::task::spawn_blocking(move || pad_to_square(&image, target, quality))
        .await
        .map_err(|err| ImageError::Encode(format!("padding task failed: {err}")))?
}

fn success_record(target: &Target) -> AttemptRecord {
    AttemptRecord {
        provider: target.provider.name().to_string(),
        model: target.model.clone(),
        class: None,
        message: None,
    }
}

fn failure_record(target: &Target, error: &ProviderError) -> AttemptRecord {
    AttemptRecord {
        provider: target.provider.name().to_string(),
        model: target.model.clone(),
        class: Some(error.class),
        message: Some(error.message.clone()),
    }
}
