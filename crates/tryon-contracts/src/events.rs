use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Lifecycle events of one generation, in the order they can occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationEvent {
    Started,
    ImagesPrepared,
    AttemptFailed,
    FallbackEngaged,
    Finished,
    Failed,
}

impl GenerationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationEvent::Started => "generation_started",
            GenerationEvent::ImagesPrepared => "images_prepared",
            GenerationEvent::AttemptFailed => "provider_attempt_failed",
            GenerationEvent::FallbackEngaged => "fallback_engaged",
            GenerationEvent::Finished => "generation_finished",
            GenerationEvent::Failed => "generation_failed",
        }
    }
}

/// Appends one compact JSON object per line to `events.jsonl`.
///
/// `type`, `run_id` and `ts` are reserved: payload entries with those names
/// are replaced. Clones share the same file handle.
#[derive(Debug, Clone)]
pub struct EventWriter {
    path: PathBuf,
    run_id: String,
    file: Arc<Mutex<File>>,
}

impl EventWriter {
    pub fn open(path: impl Into<PathBuf>, run_id: impl Into<String>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            run_id: run_id.into(),
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn emit_generation(&self, event: GenerationEvent, payload: EventPayload) -> anyhow::Result<Value> {
        self.emit(event.as_str(), payload)
    }

    pub fn emit(&self, event_type: &str, mut payload: EventPayload) -> anyhow::Result<Value> {
        payload.insert("type".to_string(), Value::from(event_type));
        payload.insert("run_id".to_string(), Value::from(self.run_id.as_str()));
        payload.insert(
            "ts".to_string(),
            Value::from(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        let record = Value::Object(payload);

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("event log {} is poisoned", self.path.display()))?;
        file.write_all(&line)?;
        Ok(record)
    }
}
