use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::{Map, Value};

pub const OPENROUTER_KEY: &str = "openrouter_api_key";
pub const GEMINI_KEY: &str = "gemini_api_key";
pub const CHAT_KEY: &str = "chat_api_key";
pub const PROVIDER_SELECTION_KEY: &str = "api_provider";
pub const SAVED_IMAGES_KEY: &str = "saved_images";

/// Which backend the user picked in settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderSelection {
    #[default]
    OpenRouter,
    Direct,
    ChatCompatible,
}

impl ProviderSelection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderSelection::OpenRouter => "openrouter",
            ProviderSelection::Direct => "direct",
            ProviderSelection::ChatCompatible => "chat-compatible",
        }
    }

    /// Registry id of the provider client serving this selection.
    pub fn provider_id(&self) -> &'static str {
        match self {
            ProviderSelection::OpenRouter => "openrouter",
            ProviderSelection::Direct => "gemini",
            ProviderSelection::ChatCompatible => "chat-compatible",
        }
    }
}

impl fmt::Display for ProviderSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderSelection {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openrouter" => Ok(ProviderSelection::OpenRouter),
            "direct" | "gemini" => Ok(ProviderSelection::Direct),
            "chat-compatible" | "chat" => Ok(ProviderSelection::ChatCompatible),
            other => Err(format!("unknown provider selection '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub openrouter: Option<String>,
    pub gemini: Option<String>,
    pub chat: Option<String>,
}

impl Credentials {
    pub fn for_slot(&self, slot: &str) -> Option<&str> {
        let value = match slot {
            OPENROUTER_KEY => self.openrouter.as_deref(),
            GEMINI_KEY => self.gemini.as_deref(),
            CHAT_KEY => self.chat.as_deref(),
            _ => None,
        };
        value.map(str::trim).filter(|value| !value.is_empty())
    }

    /// Environment values win over stored ones.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = lookup("OPENROUTER_API_KEY") {
            self.openrouter = Some(value);
        }
        if let Some(value) = lookup("GEMINI_API_KEY").or_else(|| lookup("GOOGLE_API_KEY")) {
            self.gemini = Some(value);
        }
        if let Some(value) = lookup("TRYON_CHAT_API_KEY") {
            self.chat = Some(value);
        }
        self
    }
}

/// Local key-value state: credentials, the provider selection and saved
/// result locations. Values are opaque; unknown keys survive rewrites.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
    payload: Map<String, Value>,
}

impl SessionStore {
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let payload = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Value>(&raw)? {
                Value::Object(map) => map,
                _ => anyhow::bail!("session file {} is not a JSON object", path.display()),
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, payload })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        self.payload
            .insert(key.to_string(), Value::String(value.trim().to_string()));
        self.flush()
    }

    pub fn remove(&mut self, key: &str) -> anyhow::Result<bool> {
        let removed = self.payload.remove(key).is_some();
        if removed {
            self.flush()?;
        }
        Ok(removed)
    }

    pub fn credentials(&self) -> Credentials {
        let read = |key: &str| {
            self.get(key)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        Credentials {
            openrouter: read(OPENROUTER_KEY),
            gemini: read(GEMINI_KEY),
            chat: read(CHAT_KEY),
        }
    }

    /// Unreadable selections fall back to the default rather than failing.
    pub fn provider_selection(&self) -> ProviderSelection {
        self.get(PROVIDER_SELECTION_KEY)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default()
    }

    pub fn set_provider_selection(&mut self, selection: ProviderSelection) -> anyhow::Result<()> {
        self.set(PROVIDER_SELECTION_KEY, selection.as_str())
    }

    pub fn save_image(&mut self, location: &str) -> anyhow::Result<()> {
        let entry = self
            .payload
            .entry(SAVED_IMAGES_KEY.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if !entry.is_array() {
            *entry = Value::Array(Vec::new());
        }
        if let Value::Array(rows) = entry {
            rows.push(Value::String(location.to_string()));
        }
        self.flush()
    }

    pub fn saved_images(&self) -> Vec<String> {
        self.payload
            .get(SAVED_IMAGES_KEY)
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn flush(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(
            &self.path,
            serde_json::to_string_pretty(&Value::Object(self.payload.clone()))?,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    #[test]
    fn missing_file_loads_empty() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = SessionStore::load(temp.path().join("state.json"))?;
        assert_eq!(store.credentials(), Credentials::default());
        assert_eq!(store.provider_selection(), ProviderSelection::OpenRouter);
        assert!(store.saved_images().is_empty());
        Ok(())
    }

    #[test]
    fn writes_trim_and_survive_reload() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("state.json");
        let mut store = SessionStore::load(&path)?;
        store.set(GEMINI_KEY, "  AIzaSyExample123 \n")?;
        store.set_provider_selection(ProviderSelection::Direct)?;
        store.save_image("/tmp/out/hair-style-1.jpeg")?;
        store.save_image("/tmp/out/hair-style-2.jpeg")?;

        let reloaded = SessionStore::load(&path)?;
        assert_eq!(reloaded.credentials().gemini.as_deref(), Some("AIzaSyExample123"));
        assert_eq!(reloaded.provider_selection().provider_id(), "gemini");
        assert_eq!(reloaded.saved_images().len(), 2);
        Ok(())
    }

    #[test]
    fn unknown_keys_are_preserved() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("state.json");
        std::fs::write(&path, r#"{"language":"fr","api_provider":"nonsense"}"#)?;

        let mut store = SessionStore::load(&path)?;
        assert_eq!(store.provider_selection(), ProviderSelection::OpenRouter);
        store.set(OPENROUTER_KEY, "sk-or-v1-abc")?;
        assert!(store.remove(OPENROUTER_KEY)?);
        assert!(!store.remove(OPENROUTER_KEY)?);

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(raw["language"], Value::String("fr".to_string()));
        assert!(raw.get(OPENROUTER_KEY).is_none());
        Ok(())
    }

    #[test]
    fn non_object_file_is_rejected() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("state.json");
        std::fs::write(&path, "[1,2]")?;
        assert!(SessionStore::load(&path).is_err());
        Ok(())
    }

    #[test]
    fn environment_overrides_stored_keys() {
        let stored = Credentials {
            openrouter: Some("stored-openrouter".to_string()),
            gemini: Some("stored-gemini".to_string()),
            chat: None,
        };
        let merged = stored.with_overrides(|name| match name {
            "GOOGLE_API_KEY" => Some("env-google".to_string()),
            "TRYON_CHAT_API_KEY" => Some("env-chat".to_string()),
            _ => None,
        });
        assert_eq!(merged.for_slot(OPENROUTER_KEY), Some("stored-openrouter"));
        assert_eq!(merged.for_slot(GEMINI_KEY), Some("env-google"));
        assert_eq!(merged.for_slot(CHAT_KEY), Some("env-chat"));
        assert_eq!(merged.for_slot("other"), None);
    }
}
