pub mod config;
pub mod prompt;
pub mod transformer;
pub mod vision;

mod generate;
mod model;

pub use config::{LoadedConfig, ModelConfig, ModelFamily, TextConfig, VisionConfig, load_config};
pub use generate::{GenerateOptions, GenerationOutput};
pub use model::QwenVlModel;
pub use prompt::{PromptMedia, build_prompt_tokens};
