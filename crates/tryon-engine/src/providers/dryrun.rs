use std::io::Cursor;

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tryon_contracts::ProviderError;

use super::{ImageProvider, ProviderImage, ProviderOutput, ProviderSubmission};

pub const DRYRUN_PROVIDER: &str = "dryrun";
const FALLBACK_DIMENSION: u32 = 1024;

/// Offline provider. Answers with a flat PNG whose colour is derived from
/// the prompt, sized like the first submitted image.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunProvider;

#[async_trait]
impl ImageProvider for DryrunProvider {
    fn name(&self) -> &str {
        DRYRUN_PROVIDER
    }

    fn credential_slot(&self) -> Option<&'static str> {
        None
    }

    async fn submit(&self, submission: ProviderSubmission<'_>) -> Result<ProviderOutput, ProviderError> {
        let (width, height) = submission
            .images
            .first()
            .map(|image| (image.width.max(1), image.height.max(1)))
            .unwrap_or((FALLBACK_DIMENSION, FALLBACK_DIMENSION));
        let color = color_from_prompt(submission.prompt);
        let canvas = RgbImage::from_pixel(width, height, Rgb(color));
        let mut out = Cursor::new(Vec::new());
        canvas
            .write_to(&mut out, ImageFormat::Png)
            .map_err(|err| ProviderError::malformed(DRYRUN_PROVIDER, err.to_string()))?;

        let mut provider_response = Map::new();
        provider_response.insert("dryrun".to_string(), Value::Bool(true));
        provider_response.insert("color".to_string(), Value::String(hex::encode(color)));
        provider_response.insert("model".to_string(), Value::String(submission.model.to_string()));
        Ok(ProviderOutput {
            image: ProviderImage {
                bytes: out.into_inner(),
                mime_type: Some("image/png".to_string()),
            },
            provider_response,
        })
    }
}

fn color_from_prompt(prompt: &str) -> [u8; 3] {
    let digest = Sha256::digest(prompt.as_bytes());
    [digest[0], digest[1], digest[2]]
}
