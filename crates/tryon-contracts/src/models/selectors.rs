use super::registry::{ModelRegistry, ModelSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_default(),
        }
    }

    /// Picks the model a provider should be called with. An unknown or
    /// unsuitable override falls back to the provider default and the
    /// reason is recorded.
    pub fn select(&self, requested: Option<&str>, provider: &str) -> Result<ModelSelection, String> {
        let requested = requested.map(str::trim).filter(|value| !value.is_empty());
        let fallback_reason = match requested {
            Some(requested_value) => {
                if let Some(model) = self.registry.ensure(provider, requested_value, "edit") {
                    return Ok(ModelSelection {
                        model,
                        requested: Some(requested_value.to_string()),
                        fallback_reason: None,
                    });
                }
                Some(format!(
                    "Requested model '{requested_value}' is not available on '{provider}'; using default."
                ))
            }
            None => None,
        };

        let Some(model) = self.registry.default_for(provider).cloned() else {
            return Err(format!("No image models registered for provider '{provider}'."));
        };
        Ok(ModelSelection {
            model,
            requested: requested.map(str::to_string),
            fallback_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::ModelSelector;

    #[test]
    fn known_override_is_honoured() {
        let selector = ModelSelector::default();
        let selection = selector
            .select(Some("gemini-2.5-flash-image"), "gemini")
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(selection.model.name, "gemini-2.5-flash-image");
        assert!(selection.fallback_reason.is_none());
    }

    #[test]
    fn foreign_override_falls_back_with_reason() {
        let selector = ModelSelector::default();
        let selection = selector
            .select(Some("google/gemini-2.5-flash-image"), "gemini")
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(selection.model.name, "gemini-2.5-flash-image-preview");
        assert!(selection
            .fallback_reason
            .as_deref()
            .unwrap_or("")
            .contains("not available on 'gemini'"));
    }

    #[test]
    fn no_override_uses_default_silently() {
        let selector = ModelSelector::default();
        let selection = selector
            .select(None, "openrouter")
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(selection.model.name, "google/gemini-2.5-flash-image-preview");
        assert!(selection.fallback_reason.is_none());
        assert!(selector.select(None, "nowhere").is_err());
    }
}
