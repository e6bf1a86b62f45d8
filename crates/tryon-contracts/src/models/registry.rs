use indexmap::IndexMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
}

impl ModelSpec {
    pub fn new(name: &str, provider: &str, capabilities: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            provider: provider.to_string(),
            capabilities: capabilities
                .iter()
                .map(|item| (*item).to_string())
                .collect(),
        }
    }

    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

/// Image-editing models known per provider. The first entry registered for
/// a provider is its default.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn register(&mut self, spec: ModelSpec) {
        self.models.insert(registry_key(&spec.provider, &spec.name), spec);
    }

    pub fn get(&self, provider: &str, name: &str) -> Option<&ModelSpec> {
        self.models.get(&registry_key(provider, name))
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn for_provider(&self, provider: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.provider == provider)
            .cloned()
            .collect()
    }

    pub fn default_for(&self, provider: &str) -> Option<&ModelSpec> {
        self.models
            .values()
            .find(|model| model.provider == provider && model.supports("edit"))
    }

    pub fn ensure(&self, provider: &str, name: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(provider, name)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

// The same model name can be served by more than one provider.
fn registry_key(provider: &str, name: &str) -> String {
    format!("{provider}/{name}")
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();
    let mut insert = |name: &str, provider: &str, capabilities: &[&str]| {
        map.insert(
            registry_key(provider, name),
            ModelSpec::new(name, provider, capabilities),
        );
    };

    insert(
        "google/gemini-2.5-flash-image-preview",
        "openrouter",
        &["image", "edit"],
    );
    insert("google/gemini-2.5-flash-image", "openrouter", &["image", "edit"]);
    insert("gemini-2.5-flash-image-preview", "gemini", &["image", "edit"]);
    insert("gemini-2.5-flash-image", "gemini", &["image", "edit"]);
    insert("gemini-2.5-flash", "gemini", &["text"]);
    insert("dryrun-image-1", "dryrun", &["image", "edit"]);

    map
}
