use std::path::PathBuf;

use thiserror::Error;

/// Terminal failures raised by the fusion, positioning and loading paths.
///
/// Functions in this workspace return `anyhow::Result`; these variants travel inside the
/// `anyhow::Error` and can be recovered with `downcast_ref::<VlmError>()`.
#[derive(Debug, Error)]
pub enum VlmError {
    #[error("no weight archives (*.safetensors) found in {}", path.display())]
    NotFound { path: PathBuf },
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: String,
        actual: String,
    },
    #[error("configuration incomplete: `{field}` is required by the {section} config")]
    ConfigurationIncomplete {
        section: &'static str,
        field: &'static str,
    },
}

impl VlmError {
    pub fn shape_mismatch(
        context: &'static str,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Self::ShapeMismatch {
            context,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn missing_field(section: &'static str, field: &'static str) -> Self {
        Self::ConfigurationIncomplete { section, field }
    }

    pub fn is_shape_mismatch(&self) -> bool {
        matches!(self, Self::ShapeMismatch { .. })
    }
}
