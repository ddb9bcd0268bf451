use super::registry::{normalize_model_name, ModelRegistry};

/// Ordered list of model identifiers to try for one capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub models: Vec<String>,
    pub requested: Vec<String>,
    pub fallback_reasons: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    /// Builds the fallback chain for `capability` from a configured list.
    ///
    /// Registered models lacking the capability are dropped, unregistered names are kept
    /// so newly released models can be tried, duplicates are removed, and an empty result
    /// falls back to the registry's own models for the capability.
    pub fn fallback_chain(
        &self,
        requested: &[String],
        capability: &str,
    ) -> Result<ModelSelection, String> {
        let mut models: Vec<String> = Vec::new();
        let mut fallback_reasons = Vec::new();

        for raw in requested {
            let name = normalize_model_name(raw);
            if name.is_empty() || models.iter().any(|existing| existing == name) {
                continue;
            }
            match self.registry.get(name) {
                Some(spec) if !spec.supports(capability) => {
                    fallback_reasons.push(format!(
                        "Model '{name}' does not support capability '{capability}'; skipped."
                    ));
                    continue;
                }
                None => fallback_reasons.push(format!(
                    "Model '{name}' is not in the registry; trying it anyway."
                )),
                Some(_) => {}
            }
            models.push(name.to_string());
        }

        if models.is_empty() {
            if requested.is_empty() {
                fallback_reasons.push("No models configured; using defaults.".to_string());
            } else {
                fallback_reasons.push(format!(
                    "No configured model supports capability '{capability}'; using defaults."
                ));
            }
            models = self
                .registry
                .by_capability(capability)
                .into_iter()
                .map(|spec| spec.name)
                .collect();
        }

        if models.is_empty() {
            return Err(format!(
                "No models available for capability '{capability}'."
            ));
        }
        Ok(ModelSelection {
            models,
            requested: requested.to_vec(),
            fallback_reasons,
        })
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::ModelSelector;
    use crate::models::{ModelRegistry, ModelSpec, CAPABILITY_VISION};

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn keeps_configured_order_and_drops_incapable_models() {
        let selection = ModelSelector::new(None)
            .fallback_chain(
                &names(&[
                    "models/gemini-1.5-pro-latest",
                    "gemini-pro",
                    "gemini-1.5-flash-latest",
                    "gemini-1.5-pro-latest",
                ]),
                CAPABILITY_VISION,
            )
            .unwrap();
        assert_eq!(
            selection.models,
            names(&["gemini-1.5-pro-latest", "gemini-1.5-flash-latest"])
        );
        assert_eq!(selection.fallback_reasons.len(), 1);
        assert!(selection.fallback_reasons[0].contains("'gemini-pro'"));
    }

    #[test]
    fn unknown_models_are_tried_with_a_reason() {
        let selection = ModelSelector::new(None)
            .fallback_chain(&names(&["gemini-9-ultra"]), CAPABILITY_VISION)
            .unwrap();
        assert_eq!(selection.models, names(&["gemini-9-ultra"]));
        assert!(selection.fallback_reasons[0].contains("not in the registry"));
    }

    #[test]
    fn empty_configuration_falls_back_to_registry_defaults() {
        let selection = ModelSelector::new(None)
            .fallback_chain(&[], CAPABILITY_VISION)
            .unwrap();
        assert_eq!(selection.models.first().map(String::as_str), Some("gemini-1.5-flash-latest"));
        assert!(!selection.models.iter().any(|name| name == "gemini-pro"));
        assert_eq!(
            selection.fallback_reasons,
            vec!["No models configured; using defaults.".to_string()]
        );
    }

    #[test]
    fn errors_when_nothing_supports_the_capability() {
        let mut models = IndexMap::new();
        models.insert(
            "text-only".to_string(),
            ModelSpec {
                name: "text-only".to_string(),
                provider: "gemini".to_string(),
                capabilities: vec!["text".to_string()],
                max_output_tokens: None,
            },
        );
        let selector = ModelSelector::new(Some(ModelRegistry::new(Some(models))));
        let err = selector
            .fallback_chain(&names(&["text-only"]), CAPABILITY_VISION)
            .unwrap_err();
        assert_eq!(err, "No models available for capability 'vision'.");
    }
}
