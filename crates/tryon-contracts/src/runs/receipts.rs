use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::ErrorClass;
use crate::features::{FeatureKind, GenerationOptions};

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// One provider call made while serving a generation. `class` is `None` for
/// the attempt that produced the delivered image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub provider: String,
    pub model: String,
    pub class: Option<ErrorClass>,
    pub message: Option<String>,
}

impl AttemptRecord {
    pub fn succeeded(&self) -> bool {
        self.class.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptRequest {
    pub feature: FeatureKind,
    pub provider: String,
    pub model: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub options: GenerationOptions,
    pub subject: Option<String>,
    pub reference: Option<String>,
}

/// Everything needed to audit one delivered image, minus pixels and keys.
pub fn build_receipt(
    request: &ReceiptRequest,
    attempts: &[AttemptRecord],
    provider_response: &Map<String, Value>,
    image_path: &Path,
    receipt_path: &Path,
    result_metadata: &Map<String, Value>,
) -> Value {
    let request = serde_json::to_value(request).unwrap_or(Value::Null);
    let delivered_by = attempts
        .iter()
        .find(|attempt| attempt.succeeded())
        .map(|attempt| attempt.provider.as_str());
    json!({
        "schema_version": RECEIPT_SCHEMA_VERSION,
        "request": sanitize_payload(&request),
        "attempts": attempts,
        "delivered_by": delivered_by,
        "provider_response": sanitize_payload(&Value::Object(provider_response.clone())),
        "artifacts": {
            "image_path": image_path.to_string_lossy(),
            "receipt_path": receipt_path.to_string_lossy(),
        },
        "result_metadata": sanitize_payload(&Value::Object(result_metadata.clone())),
    })
}

/// Writes next to the target and renames, so readers never see half a file.
pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let staging = path.with_extension("json.partial");
    std::fs::write(&staging, serde_json::to_vec_pretty(payload)?)?;
    std::fs::rename(&staging, path)?;
    Ok(())
}

const REDACTED: &str = "<redacted>";
const OMITTED: &str = "<omitted>";

fn replacement_for(key: &str) -> Option<&'static str> {
    match key.to_ascii_lowercase().as_str() {
        "api_key" | "api-key" | "authorization" | "x-goog-api-key" => Some(REDACTED),
        "b64_json" | "data" | "image" | "image_bytes" | "image_data_url" => Some(OMITTED),
        _ => None,
    }
}

/// Drops image payloads and credentials from anything headed for disk.
pub fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::String(text) if text.starts_with("data:") => Value::from(OMITTED),
        Value::Array(rows) => rows.iter().map(sanitize_payload).collect(),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, row)| {
                    let cleaned = match replacement_for(key) {
                        Some(marker) => Value::from(marker),
                        None => sanitize_payload(row),
                    };
                    (key.clone(), cleaned)
                })
                .collect(),
        ),
        other => other.clone(),
    }
}
