use std::{
    collections::BTreeMap,
    fs,
    ops::AddAssign,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, bail};
use qwen_vl_core::{
    runtime::{DeviceKind, Precision},
    sampling::SamplingParams,
};
use serde::{Deserialize, Serialize};

use crate::fs::{VirtualFileSystem, VirtualPath};

pub const DEFAULT_MODEL_ID: &str = "qwen2.5-vl-3b";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub models: ModelRegistry,
    pub inference: InferenceSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelRegistry {
    pub active: String,
    pub entries: BTreeMap<String, ModelEntry>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        let mut entries = BTreeMap::new();
        ensure_default_model_entries(&mut entries);
        Self {
            active: DEFAULT_MODEL_ID.to_string(),
            entries,
        }
    }
}

fn ensure_default_model_entries(entries: &mut BTreeMap<String, ModelEntry>) {
    for (id, repo) in [
        ("qwen2-vl-2b", "Qwen/Qwen2-VL-2B-Instruct"),
        ("qwen2-vl-7b", "Qwen/Qwen2-VL-7B-Instruct"),
        ("qwen2.5-vl-3b", "Qwen/Qwen2.5-VL-3B-Instruct"),
        ("qwen2.5-vl-7b", "Qwen/Qwen2.5-VL-7B-Instruct"),
    ] {
        entries
            .entry(id.to_string())
            .or_insert_with(|| ModelEntry::hub(repo));
    }
}

/// Where a model lives: a hub repo id, a local snapshot directory, or both (the local
/// path wins).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelEntry {
    pub repo: Option<String>,
    pub path: Option<PathBuf>,
}

impl ModelEntry {
    pub fn hub(repo: impl Into<String>) -> Self {
        Self {
            repo: Some(repo.into()),
            path: None,
        }
    }

    fn resolved(&self, model_id: &str) -> Result<ModelResources> {
        let source = match (&self.path, &self.repo) {
            (Some(path), _) => ModelSource::Local(path.clone()),
            (None, Some(repo)) => ModelSource::Hub(repo.clone()),
            (None, None) => bail!("model `{model_id}` has neither a `path` nor a `repo`"),
        };
        Ok(ModelResources {
            id: model_id.to_string(),
            source,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Local(PathBuf),
    Hub(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelResources {
    pub id: String,
    pub source: ModelSource,
}

impl ModelResources {
    /// The reference accepted by `load_pretrained`.
    pub fn reference(&self) -> String {
        match &self.source {
            ModelSource::Local(path) => path.display().to_string(),
            ModelSource::Hub(repo) => repo.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    pub device: DeviceKind,
    pub precision: Option<Precision>,
    pub system_prompt: Option<String>,
    pub max_new_tokens: usize,
    pub do_sample: bool,
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub top_k: Option<usize>,
    pub repetition_penalty: f32,
    pub seed: Option<u64>,
    pub min_pixels: Option<usize>,
    pub max_pixels: Option<usize>,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            device: DeviceKind::Cpu,
            precision: None,
            system_prompt: None,
            max_new_tokens: 512,
            do_sample: false,
            temperature: 0.0,
            top_p: None,
            top_k: None,
            repetition_penalty: 1.0,
            seed: None,
            min_pixels: None,
            max_pixels: None,
        }
    }
}

impl InferenceSettings {
    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            do_sample: self.do_sample,
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            repetition_penalty: self.repetition_penalty,
            seed: self.seed,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ResourceLocation {
    Virtual(VirtualPath),
    Physical(PathBuf),
}

impl ResourceLocation {
    pub fn display_with(&self, fs: &impl VirtualFileSystem) -> Result<String> {
        match self {
            ResourceLocation::Virtual(path) => {
                fs.with_physical_path(path, |p| Ok(p.display().to_string()))
            }
            ResourceLocation::Physical(path) => Ok(path.display().to_string()),
        }
    }
}

pub struct ConfigDescriptor {
    pub location: ResourceLocation,
}

impl AppConfig {
    /// Read the config file, creating it with defaults when missing.
    pub fn load_or_init(
        fs: &impl VirtualFileSystem,
        override_path: Option<&Path>,
    ) -> Result<(Self, ConfigDescriptor)> {
        match override_path {
            Some(path) => load_physical_config(path),
            None => load_virtual_config(fs),
        }
    }

    pub fn load_with_overrides(
        fs: &impl VirtualFileSystem,
        overrides: ConfigOverrides,
    ) -> Result<(Self, ConfigDescriptor, ModelResources)> {
        let config_path_override = overrides.config_path.clone();
        let (mut config, descriptor) = Self::load_or_init(fs, config_path_override.as_deref())?;
        config += overrides;
        config.normalise();
        let resources = config.active_model_resources()?;
        Ok((config, descriptor, resources))
    }

    pub fn normalise(&mut self) {
        ensure_default_model_entries(&mut self.models.entries);
    }

    pub fn active_model_resources(&self) -> Result<ModelResources> {
        self.model_resources(&self.models.active)
    }

    pub fn model_resources(&self, model_id: &str) -> Result<ModelResources> {
        self.models
            .entries
            .get(model_id)
            .ok_or_else(|| anyhow!("model `{model_id}` not found in configuration"))?
            .resolved(model_id)
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(model_id) = overrides.model_id.as_ref() {
            self.models.active = model_id.clone();
        }
        if overrides.model_path.is_some() || overrides.model_repo.is_some() {
            let entry = self
                .models
                .entries
                .entry(self.models.active.clone())
                .or_default();
            if let Some(path) = overrides.model_path.as_ref() {
                entry.path = Some(path.clone());
            }
            if let Some(repo) = overrides.model_repo.as_ref() {
                entry.repo = Some(repo.clone());
                if overrides.model_path.is_none() {
                    entry.path = None;
                }
            }
        }

        let inference = &overrides.inference;
        if let Some(device) = inference.device {
            self.inference.device = device;
        }
        if inference.precision.is_some() {
            self.inference.precision = inference.precision;
        }
        if let Some(system_prompt) = inference.system_prompt.as_ref() {
            self.inference.system_prompt = Some(system_prompt.clone());
        }
        if let Some(max_new_tokens) = inference.max_new_tokens {
            self.inference.max_new_tokens = max_new_tokens;
        }
        if let Some(do_sample) = inference.do_sample {
            self.inference.do_sample = do_sample;
        }
        if let Some(temperature) = inference.temperature {
            self.inference.temperature = temperature;
        }
        if inference.top_p.is_some() {
            self.inference.top_p = inference.top_p;
        }
        if inference.top_k.is_some() {
            self.inference.top_k = inference.top_k;
        }
        if let Some(repetition_penalty) = inference.repetition_penalty {
            self.inference.repetition_penalty = repetition_penalty;
        }
        if inference.seed.is_some() {
            self.inference.seed = inference.seed;
        }
        if inference.min_pixels.is_some() {
            self.inference.min_pixels = inference.min_pixels;
        }
        if inference.max_pixels.is_some() {
            self.inference.max_pixels = inference.max_pixels;
        }
    }
}

fn load_virtual_config(fs: &impl VirtualFileSystem) -> Result<(AppConfig, ConfigDescriptor)> {
    let path = VirtualPath::config_file();
    let descriptor = ConfigDescriptor {
        location: ResourceLocation::Virtual(path.clone()),
    };
    if !fs.exists(&path)? {
        let cfg = AppConfig::default();
        fs.write(&path, toml::to_string_pretty(&cfg)?.as_bytes())?;
        return Ok((cfg, descriptor));
    }

    let bytes = fs.read(&path)?;
    let contents = String::from_utf8(bytes).context("configuration file is not valid UTF-8")?;
    let mut cfg: AppConfig =
        toml::from_str(&contents).context("failed to parse configuration file")?;
    cfg.normalise();
    Ok((cfg, descriptor))
}

fn load_physical_config(path: &Path) -> Result<(AppConfig, ConfigDescriptor)> {
    let descriptor = ConfigDescriptor {
        location: ResourceLocation::Physical(path.to_path_buf()),
    };
    if !path.exists() {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let cfg = AppConfig::default();
        fs::write(path, toml::to_string_pretty(&cfg)?)
            .with_context(|| format!("failed to write configuration to {}", path.display()))?;
        return Ok((cfg, descriptor));
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration from {}", path.display()))?;
    let mut cfg: AppConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse configuration at {}", path.display()))?;
    cfg.normalise();
    Ok((cfg, descriptor))
}

#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub model_id: Option<String>,
    pub model_path: Option<PathBuf>,
    pub model_repo: Option<String>,
    pub inference: InferenceOverride,
}

#[derive(Debug, Default, Clone)]
pub struct InferenceOverride {
    pub device: Option<DeviceKind>,
    pub precision: Option<Precision>,
    pub system_prompt: Option<String>,
    pub max_new_tokens: Option<usize>,
    pub do_sample: Option<bool>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<usize>,
    pub repetition_penalty: Option<f32>,
    pub seed: Option<u64>,
    pub min_pixels: Option<usize>,
    pub max_pixels: Option<usize>,
}

pub trait ConfigOverride {
    fn apply(self, config: &mut AppConfig);
}

impl ConfigOverride for ConfigOverrides {
    fn apply(self, config: &mut AppConfig) {
        config.apply_overrides(&self);
    }
}

impl<'a> ConfigOverride for &'a ConfigOverrides {
    fn apply(self, config: &mut AppConfig) {
        config.apply_overrides(self);
    }
}

impl<O: ConfigOverride> AddAssign<O> for AppConfig {
    fn add_assign(&mut self, rhs: O) {
        rhs.apply(self);
    }
}

pub fn save_config(
    fs: &impl VirtualFileSystem,
    descriptor: &ConfigDescriptor,
    config: &AppConfig,
) -> Result<()> {
    let serialized = toml::to_string_pretty(config)?;
    match &descriptor.location {
        ResourceLocation::Virtual(path) => fs.write(path, serialized.as_bytes()),
        ResourceLocation::Physical(path) => fs::write(path, serialized)
            .with_context(|| format!("failed to write configuration to {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFileSystem;

    fn temp_fs(dir: &Path) -> LocalFileSystem {
        LocalFileSystem::with_directories(dir.join("config"), dir.join("cache"))
    }

    #[test]
    fn first_load_writes_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let fs = temp_fs(dir.path());
        let (cfg, descriptor) = AppConfig::load_or_init(&fs, None)?;
        assert_eq!(cfg.models.active, DEFAULT_MODEL_ID);
        assert!(dir.path().join("config/config.toml").is_file());
        let shown = descriptor.location.display_with(&fs)?;
        assert!(shown.ends_with("config.toml"));
        let resources = cfg.active_model_resources()?;
        assert_eq!(resources.reference(), "Qwen/Qwen2.5-VL-3B-Instruct");
        Ok(())
    }

    #[test]
    fn file_values_survive_reload() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("custom.toml");
        fs::write(
            &path,
            r#"
[models]
active = "local"

[models.entries.local]
path = "/models/qwen2-vl"

[inference]
max_new_tokens = 64
do_sample = true
temperature = 0.7
"#,
        )?;
        let (cfg, _) = AppConfig::load_or_init(&temp_fs(dir.path()), Some(&path))?;
        assert_eq!(cfg.inference.max_new_tokens, 64);
        assert!(cfg.inference.sampling().do_sample);
        assert!(cfg.models.entries.contains_key("qwen2-vl-2b"));
        let resources = cfg.active_model_resources()?;
        assert_eq!(
            resources.source,
            ModelSource::Local(PathBuf::from("/models/qwen2-vl"))
        );
        Ok(())
    }

    #[test]
    fn overrides_take_precedence() -> Result<()> {
        let mut cfg = AppConfig::default();
        cfg += ConfigOverrides {
            model_id: Some("mine".into()),
            model_path: Some(PathBuf::from("/tmp/mine")),
            inference: InferenceOverride {
                max_new_tokens: Some(8),
                seed: Some(7),
                ..InferenceOverride::default()
            },
            ..ConfigOverrides::default()
        };
        assert_eq!(cfg.models.active, "mine");
        assert_eq!(cfg.inference.max_new_tokens, 8);
        assert_eq!(cfg.inference.sampling().seed, Some(7));
        assert_eq!(cfg.active_model_resources()?.reference(), "/tmp/mine");

        let repo_override = ConfigOverrides {
            model_repo: Some("Qwen/Qwen2-VL-7B-Instruct".into()),
            ..ConfigOverrides::default()
        };
        cfg += &repo_override;
        assert_eq!(
            cfg.active_model_resources()?.source,
            ModelSource::Hub("Qwen/Qwen2-VL-7B-Instruct".into())
        );
        Ok(())
    }

    #[test]
    fn unknown_model_without_source_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg += ConfigOverrides {
            model_id: Some("missing".into()),
            ..ConfigOverrides::default()
        };
        let err = cfg.active_model_resources().expect_err("no entry for `missing`");
        assert!(err.to_string().contains("not found"));
    }
}
