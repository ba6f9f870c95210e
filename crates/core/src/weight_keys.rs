use std::collections::HashMap;

use candle_core::Tensor;
use tracing::debug;

pub const VISION_NAMESPACE: &str = "vision_tower.";
pub const LANGUAGE_NAMESPACE: &str = "language_model.";

/// Ordered prefix rules that move checkpoint parameter names onto the
/// `vision_tower.` / `language_model.` namespaces used by the runtime.
///
/// Rules are tried in order and the first matching prefix wins. Keys already under one of
/// the target namespaces are never rewritten, which makes [`WeightKeyMapper::apply`]
/// idempotent.
#[derive(Debug, Clone)]
pub struct WeightKeyMapper {
    rules: Vec<(String, String)>,
}

impl Default for WeightKeyMapper {
    fn default() -> Self {
        Self::from_rules([
            ("model.visual.", "vision_tower."),
            ("visual.", "vision_tower."),
            ("model.language_model.", "language_model.model."),
            ("model.", "language_model.model."),
            ("lm_head.", "language_model.lm_head."),
        ])
    }
}

impl WeightKeyMapper {
    pub fn from_rules<I, P, R>(rules: I) -> Self
    where
        I: IntoIterator<Item = (P, R)>,
        P: Into<String>,
        R: Into<String>,
    {
        Self {
            rules: rules
                .into_iter()
                .map(|(prefix, replacement)| (prefix.into(), replacement.into()))
                .collect(),
        }
    }

    pub fn rules(&self) -> &[(String, String)] {
        &self.rules
    }

    /// Rewrite a single key. Returns the key unchanged when no rule applies.
    pub fn map_key(&self, key: &str) -> String {
        if is_namespaced(key) {
            return key.to_string();
        }
        self.rules
            .iter()
            .find_map(|(prefix, replacement)| {
                key.strip_prefix(prefix.as_str())
                    .map(|rest| format!("{replacement}{rest}"))
            })
            .unwrap_or_else(|| key.to_string())
    }

    /// Rewrite every key of a loaded weight map. Tensor data is moved, not copied.
    pub fn apply(&self, weights: HashMap<String, Tensor>) -> HashMap<String, Tensor> {
        let mut renamed = 0usize;
        let mapped: HashMap<String, Tensor> = weights
            .into_iter()
            .map(|(key, tensor)| {
                let mapped = self.map_key(&key);
                if mapped != key {
                    renamed += 1;
                }
                (mapped, tensor)
            })
            .collect();
        debug!(renamed, total = mapped.len(), "remapped checkpoint keys");
        mapped
    }
}

fn is_namespaced(key: &str) -> bool {
    key.starts_with(VISION_NAMESPACE) || key.starts_with(LANGUAGE_NAMESPACE)
}
