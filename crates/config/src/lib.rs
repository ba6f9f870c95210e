pub mod config;
pub mod fs;

pub use config::{
    AppConfig, ConfigDescriptor, ConfigOverride, ConfigOverrides, DEFAULT_MODEL_ID,
    InferenceOverride, InferenceSettings, ModelEntry, ModelRegistry, ModelResources,
    ModelSource, ResourceLocation, save_config,
};
pub use fs::{LocalFileSystem, Namespace, VirtualFileSystem, VirtualPath};
