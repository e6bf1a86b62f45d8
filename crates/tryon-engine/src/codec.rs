use std::io::Cursor;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::ImageFormat;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;
use tryon_contracts::ValidationError;

use crate::config::EngineConfig;

/// An encoded image plus the metadata the pipeline needs about it.
/// Transforms never mutate an asset; they produce a new one.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageAsset {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub name: Option<String>,
}

impl std::fmt::Debug for ImageAsset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageAsset")
            .field("bytes", &self.bytes.len())
            .field("mime_type", &self.mime_type)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("name", &self.name)
            .finish()
    }
}

impl ImageAsset {
    /// Wraps encoded bytes, reading the dimensions from the image header.
    pub fn from_bytes(
        bytes: Vec<u8>,
        declared_mime: Option<&str>,
        name: Option<String>,
    ) -> Result<Self, ImageError> {
        let sniffed = sniff_mime(&bytes);
        let mime_type = match (sniffed, declared_mime.map(normalize_mime)) {
            (Some(sniffed), _) => sniffed.to_string(),
            (None, Some(declared)) => declared,
            (None, None) => return Err(ImageError::Decode("unrecognised image format".to_string())),
        };
        let (width, height) = image::ImageReader::new(Cursor::new(&bytes))
            .with_guessed_format()
            .map_err(|err| ImageError::Decode(err.to_string()))?
            .into_dimensions()
            .map_err(|err| ImageError::Decode(err.to_string()))?;
        if width == 0 || height == 0 {
            return Err(ImageError::InvalidDimensions { width, height });
        }
        Ok(Self {
            bytes,
            mime_type,
            width,
            height,
            name,
        })
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn to_base64(&self) -> String {
        encode_base64(&self.bytes)
    }

    pub fn to_data_url(&self) -> String {
        to_data_url(&self.mime_type, &self.bytes)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("could not read {}: {reason}", path.display())]
    Unreadable { path: PathBuf, reason: String },

    #[error("reading {} was aborted", path.display())]
    Aborted { path: PathBuf },

    #[error("reading {} took longer than {seconds}s", path.display())]
    TimedOut { path: PathBuf, seconds: u64 },

    #[error("could not fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("invalid data URL: {0}")]
    InvalidDataUrl(String),

    #[error("image could not be decoded: {0}")]
    Decode(String),

    #[error("image has unusable dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("image could not be encoded: {0}")]
    Encode(String),
}

impl ImageError {
    /// Message suitable for showing to the person who picked the file.
    pub fn user_message(&self) -> String {
        match self {
            ImageError::Validation(err) => err.to_string(),
            ImageError::Unreadable { .. } => {
                "The file could not be read. Check that it exists and is a valid image.".to_string()
            }
            ImageError::Aborted { .. } => "Reading the file was interrupted. Please try again.".to_string(),
            ImageError::TimedOut { .. } => {
                "Reading the file took too long. Try a smaller image.".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// `data:<mime>;base64,<payload>` split into its two halves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrlParts {
    pub mime_type: String,
    pub base64_data: String,
}

impl DataUrlParts {
    pub fn decode(&self) -> Result<Vec<u8>, ImageError> {
        BASE64
            .decode(self.base64_data.as_bytes())
            .map_err(|err| ImageError::InvalidDataUrl(format!("base64 payload: {err}")))
    }
}

pub fn encode_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn to_data_url(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime_type, encode_base64(bytes))
}

/// Strict parse: anything that is not `data:<type>/<subtype>;base64,<payload>`
/// with a non-empty payload is rejected.
pub fn parse_data_url(raw: &str) -> Result<DataUrlParts, ImageError> {
    let trimmed = raw.trim();
    let rest = trimmed
        .strip_prefix("data:")
        .ok_or_else(|| ImageError::InvalidDataUrl("missing data: scheme".to_string()))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| ImageError::InvalidDataUrl("missing payload separator".to_string()))?;
    let mime = meta
        .strip_suffix(";base64")
        .ok_or_else(|| ImageError::InvalidDataUrl("payload is not base64".to_string()))?;
    let mime = mime.split(';').next().unwrap_or_default().trim();
    let Some((kind, subtype)) = mime.split_once('/') else {
        return Err(ImageError::InvalidDataUrl(format!("bad media type '{mime}'")));
    };
    if kind.is_empty() || subtype.is_empty() {
        return Err(ImageError::InvalidDataUrl(format!("bad media type '{mime}'")));
    }
    let payload = payload.trim();
    if payload.is_empty() {
        return Err(ImageError::InvalidDataUrl("empty payload".to_string()));
    }
    Ok(DataUrlParts {
        mime_type: normalize_mime(mime),
        base64_data: payload.to_string(),
    })
}

pub fn normalize_mime(raw: &str) -> String {
    let base = raw.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    match base.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        _ => base,
    }
}

pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    match image::guess_format(bytes).ok()? {
        ImageFormat::Jpeg => Some("image/jpeg"),
        ImageFormat::Png => Some("image/png"),
        ImageFormat::WebP => Some("image/webp"),
        ImageFormat::Gif => Some("image/gif"),
        ImageFormat::Bmp => Some("image/bmp"),
        ImageFormat::Tiff => Some("image/tiff"),
        _ => None,
    }
}

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        "tif" | "tiff" => Some("image/tiff"),
        "pdf" => Some("application/pdf"),
        "heic" => Some("image/heic"),
        _ => None,
    }
}

/// Allow-list and size-cap checks. Runs before any decode or network work.
pub fn validate_upload(
    mime_type: Option<&str>,
    size: u64,
    config: &EngineConfig,
) -> Result<(), ValidationError> {
    if let Some(mime) = mime_type {
        let normalized = normalize_mime(mime);
        if !config.allows_mime(&normalized) {
            return Err(ValidationError::UnsupportedMime { mime: normalized });
        }
    }
    if size > config.max_upload_bytes {
        return Err(ValidationError::TooLarge {
            size,
            limit: config.max_upload_bytes,
        });
    }
    Ok(())
}

/// Reads an image from disk. Type and size are checked from the extension
/// and metadata first; the read itself is bounded by the configured timeout.
pub async fn read_image_file(path: &Path, config: &EngineConfig) -> Result<ImageAsset, ImageError> {
    let metadata = tokio::fs::metadata(path).await.map_err(|err| unreadable(path, &err))?;
    if !metadata.is_file() {
        return Err(ImageError::Unreadable {
            path: path.to_path_buf(),
            reason: "not a regular file".to_string(),
        });
    }
    validate_upload(mime_for_path(path), metadata.len(), config)?;

    let bytes = read_bounded(path, config.file_read_timeout, tokio::fs::read(path)).await?;

    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string());
    asset_from_upload(bytes, mime_for_path(path), name, config)
}

async fn read_bounded<F>(path: &Path, limit: Duration, read: F) -> Result<Vec<u8>, ImageError>
where
    F: Future<Output = std::io::Result<Vec<u8>>>,
{
    match tokio::time::timeout(limit, read).await {
        Err(_) => Err(ImageError::TimedOut {
            path: path.to_path_buf(),
            seconds: limit.as_secs(),
        }),
        Ok(Err(err)) if err.kind() == std::io::ErrorKind::Interrupted => Err(ImageError::Aborted {
            path: path.to_path_buf(),
        }),
        Ok(Err(err)) => Err(unreadable(path, &err)),
        Ok(Ok(bytes)) => Ok(bytes),
    }
}

#[derive(Debug)]
pub(crate) enum BodyReadError {
    TooLarge { size: u64 },
    Transport(reqwest::Error),
}

/// Reads `response` chunk by chunk and stops as soon as the body grows past
/// `limit`, whether or not the server announced a length.
pub(crate) async fn read_capped_body(
    mut response: reqwest::Response,
    limit: u64,
) -> Result<Vec<u8>, BodyReadError> {
    if let Some(length) = response.content_length().filter(|length| *length > limit) {
        return Err(BodyReadError::TooLarge { size: length });
    }
    let mut bytes = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(BodyReadError::Transport)? {
        let size = (bytes.len() + chunk.len()) as u64;
        if size > limit {
            return Err(BodyReadError::TooLarge { size });
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

/// Loads an asset from an `http(s)` URL or a `data:` URL and applies the
/// same validation as a local file.
pub async fn fetch_remote_asset(
    http: &reqwest::Client,
    url: &str,
    name: Option<String>,
    config: &EngineConfig,
) -> Result<ImageAsset, ImageError> {
    let trimmed = url.trim();
    if trimmed.starts_with("data:") {
        let parts = parse_data_url(trimmed)?;
        validate_upload(Some(parts.mime_type.as_str()), 0, config)?;
        let bytes = parts.decode()?;
        return asset_from_upload(bytes, Some(parts.mime_type.as_str()), name, config);
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(ImageError::Fetch {
            url: trimmed.to_string(),
            reason: "only http(s) and data URLs are supported".to_string(),
        });
    }

    let fetch_err = |reason: String| ImageError::Fetch {
        url: trimmed.to_string(),
        reason,
    };
    let response = http
        .get(trimmed)
        .timeout(config.request_timeout)
        .send()
        .await
        .map_err(|err| fetch_err(err.to_string()))?;
    if !response.status().is_success() {
        return Err(fetch_err(format!("HTTP {}", response.status().as_u16())));
    }
    let declared = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(normalize_mime);
    // A declared type is trusted for rejection only; accepted bodies are still sniffed.
    if let Some(mime) = declared
        .as_deref()
        .filter(|mime| *mime != "application/octet-stream")
    {
        validate_upload(Some(mime), 0, config)?;
    }
    let bytes = match read_capped_body(response, config.max_upload_bytes).await {
        Ok(bytes) => bytes,
        Err(BodyReadError::TooLarge { size }) => {
            return Err(ValidationError::TooLarge {
                size,
                limit: config.max_upload_bytes,
            }
            .into())
        }
        Err(BodyReadError::Transport(err)) => return Err(fetch_err(err.to_string())),
    };
    debug!(url = trimmed, bytes = bytes.len(), "fetched remote image");
    let name = name.or_else(|| {
        trimmed
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
    });
    asset_from_upload(bytes, declared.as_deref(), name, config)
}

fn asset_from_upload(
    bytes: Vec<u8>,
    declared_mime: Option<&str>,
    name: Option<String>,
    config: &EngineConfig,
) -> Result<ImageAsset, ImageError> {
    // Magic bytes win over the declared type.
    let effective = sniff_mime(&bytes)
        .map(str::to_string)
        .or_else(|| declared_mime.map(normalize_mime));
    validate_upload(
        Some(effective.as_deref().unwrap_or("application/octet-stream")),
        bytes.len() as u64,
        config,
    )?;
    ImageAsset::from_bytes(bytes, effective.as_deref(), name)
}

fn unreadable(path: &Path, err: &std::io::Error) -> ImageError {
    ImageError::Unreadable {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}
