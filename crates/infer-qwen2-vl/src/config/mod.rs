//! `config.json` parsing into a tagged registry of supported model families.
//!
//! Every family has a fixed raw schema. Unknown keys are ignored, required keys are checked
//! while resolving and reported as [`VlmError::ConfigurationIncomplete`].

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use qwen_vl_core::{PlaceholderTokens, VlmError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CONFIG_FILE: &str = "config.json";
pub const GENERATION_CONFIG_FILE: &str = "generation_config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelFamily {
    #[serde(rename = "qwen2_vl")]
    Qwen2Vl,
    #[serde(rename = "qwen2_5_vl")]
    Qwen25Vl,
}

impl ModelFamily {
    pub fn model_type(&self) -> &'static str {
        match self {
            Self::Qwen2Vl => "qwen2_vl",
            Self::Qwen25Vl => "qwen2_5_vl",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub vocab_size: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f64,
    pub mrope_section: Vec<usize>,
    pub max_position_embeddings: usize,
    pub tie_word_embeddings: bool,
    pub hidden_act: String,
    pub torch_dtype: Option<String>,
}

impl TextConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisionConfig {
    pub depth: usize,
    /// Width of the vision transformer blocks.
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_heads: usize,
    /// Width of merged patch features, the language model's hidden size.
    pub out_hidden_size: usize,
    pub in_channels: usize,
    pub patch_size: usize,
    pub spatial_merge_size: usize,
    pub temporal_patch_size: usize,
    /// Window edge in pixels for windowed attention blocks (Qwen2.5-VL only).
    pub window_size: Option<usize>,
    pub fullatt_block_indexes: Vec<usize>,
    pub tokens_per_second: Option<f32>,
}

impl VisionConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    pub fn patch_dim(&self) -> usize {
        self.in_channels * self.temporal_patch_size * self.patch_size * self.patch_size
    }

    pub fn merge_unit(&self) -> usize {
        self.spatial_merge_size * self.spatial_merge_size
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub family: ModelFamily,
    pub image_token_id: i64,
    pub video_token_id: i64,
    pub vision_start_token_id: i64,
    pub vision_end_token_id: i64,
    pub vision_token_id: i64,
    pub ignore_index: i64,
    pub vocab_size: usize,
    pub eos_token_id: Vec<i64>,
    pub vision_feature_select_strategy: String,
    pub vision_feature_layer: i64,
    pub text: TextConfig,
    pub vision: VisionConfig,
}

impl ModelConfig {
    pub fn placeholders(&self) -> PlaceholderTokens {
        PlaceholderTokens {
            image: self.image_token_id,
            video: self.video_token_id,
        }
    }

    pub fn is_eos(&self, token: i64) -> bool {
        self.eos_token_id.contains(&token)
    }

    /// Parse a `config.json` document already loaded into memory.
    pub fn from_json(value: &Value) -> Result<Self> {
        let Some(model_type) = value.get("model_type") else {
            return Err(VlmError::missing_field("model", "model_type").into());
        };
        let family: RawFamily = serde_json::from_value(value.clone()).with_context(|| {
            format!("unsupported or malformed model family {model_type}")
        })?;
        let root: RawModelConfig =
            serde_json::from_value(value.clone()).context("failed to parse model config")?;
        let text_value = match value.get("text_config") {
            Some(text) if text.is_object() => text.clone(),
            _ => {
                let mut root_copy = value.clone();
                if let Some(map) = root_copy.as_object_mut() {
                    map.remove("vision_config");
                }
                root_copy
            }
        };
        let text: RawTextConfig =
            serde_json::from_value(text_value).context("failed to parse text config")?;
        let text = text.resolve(root.vocab_size)?;
        let (family, vision) = family.resolve(&text)?;

        Ok(Self {
            family,
            image_token_id: root.image_token_id,
            video_token_id: root.video_token_id,
            vision_start_token_id: root.vision_start_token_id,
            vision_end_token_id: root.vision_end_token_id,
            vision_token_id: root.vision_token_id,
            ignore_index: root.ignore_index,
            vocab_size: text.vocab_size,
            eos_token_id: root.eos_token_id.map(EosTokenIds::into_vec).unwrap_or_default(),
            vision_feature_select_strategy: root.vision_feature_select_strategy,
            vision_feature_layer: root.vision_feature_layer,
            text,
            vision,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum EosTokenIds {
    One(i64),
    Many(Vec<i64>),
}

impl EosTokenIds {
    fn into_vec(self) -> Vec<i64> {
        match self {
            Self::One(id) => vec![id],
            Self::Many(ids) => ids,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawModelConfig {
    #[serde(default = "default_image_token_id")]
    image_token_id: i64,
    #[serde(default = "default_video_token_id")]
    video_token_id: i64,
    #[serde(default = "default_vision_start_token_id")]
    vision_start_token_id: i64,
    #[serde(default = "default_vision_end_token_id")]
    vision_end_token_id: i64,
    #[serde(default = "default_vision_token_id")]
    vision_token_id: i64,
    #[serde(default = "default_ignore_index")]
    ignore_index: i64,
    #[serde(default)]
    vocab_size: Option<usize>,
    #[serde(default)]
    eos_token_id: Option<EosTokenIds>,
    #[serde(default = "default_feature_select_strategy")]
    vision_feature_select_strategy: String,
    #[serde(default = "default_vision_feature_layer")]
    vision_feature_layer: i64,
}

#[derive(Debug, Default, Deserialize)]
struct RawRopeScaling {
    #[serde(default)]
    mrope_section: Option<Vec<usize>>,
}

#[derive(Debug, Deserialize)]
struct RawTextConfig {
    hidden_size: Option<usize>,
    intermediate_size: Option<usize>,
    num_hidden_layers: Option<usize>,
    num_attention_heads: Option<usize>,
    #[serde(default)]
    num_key_value_heads: Option<usize>,
    #[serde(default)]
    vocab_size: Option<usize>,
    #[serde(default = "default_rms_norm_eps")]
    rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    rope_theta: f64,
    #[serde(default)]
    rope_scaling: Option<RawRopeScaling>,
    #[serde(default = "default_max_position_embeddings")]
    max_position_embeddings: usize,
    #[serde(default)]
    tie_word_embeddings: bool,
    #[serde(default = "default_hidden_act")]
    hidden_act: String,
    #[serde(default)]
    torch_dtype: Option<String>,
}

impl RawTextConfig {
    fn resolve(self, root_vocab: Option<usize>) -> Result<TextConfig> {
        let num_attention_heads = require("text", "num_attention_heads", self.num_attention_heads)?;
        Ok(TextConfig {
            hidden_size: require("text", "hidden_size", self.hidden_size)?,
            intermediate_size: require("text", "intermediate_size", self.intermediate_size)?,
            num_hidden_layers: require("text", "num_hidden_layers", self.num_hidden_layers)?,
            num_attention_heads,
            num_key_value_heads: self.num_key_value_heads.unwrap_or(num_attention_heads),
            vocab_size: require("text", "vocab_size", self.vocab_size.or(root_vocab))?,
            rms_norm_eps: self.rms_norm_eps,
            rope_theta: self.rope_theta,
            mrope_section: self
                .rope_scaling
                .and_then(|scaling| scaling.mrope_section)
                .unwrap_or_else(default_mrope_section),
            max_position_embeddings: self.max_position_embeddings,
            tie_word_embeddings: self.tie_word_embeddings,
            hidden_act: self.hidden_act,
            torch_dtype: self.torch_dtype,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "model_type")]
enum RawFamily {
    #[serde(rename = "qwen2_vl")]
    Qwen2Vl {
        #[serde(default)]
        vision_config: Option<RawQwen2VlVision>,
    },
    #[serde(rename = "qwen2_5_vl")]
    Qwen25Vl {
        #[serde(default)]
        vision_config: Option<RawQwen25VlVision>,
    },
}

impl RawFamily {
    fn resolve(self, text: &TextConfig) -> Result<(ModelFamily, VisionConfig)> {
        match self {
            Self::Qwen2Vl { vision_config } => {
                let raw = vision_config.ok_or(VlmError::missing_field("model", "vision_config"))?;
                Ok((ModelFamily::Qwen2Vl, raw.resolve(text)?))
            }
            Self::Qwen25Vl { vision_config } => {
                let raw = vision_config.ok_or(VlmError::missing_field("model", "vision_config"))?;
                Ok((ModelFamily::Qwen25Vl, raw.resolve(text)?))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawQwen2VlVision {
    depth: Option<usize>,
    embed_dim: Option<usize>,
    #[serde(default)]
    hidden_size: Option<usize>,
    num_heads: Option<usize>,
    #[serde(default = "default_mlp_ratio")]
    mlp_ratio: f64,
    #[serde(default = "default_in_channels", alias = "in_chans")]
    in_channels: usize,
    #[serde(default = "default_patch_size")]
    patch_size: usize,
    #[serde(default = "default_spatial_merge_size")]
    spatial_merge_size: usize,
    #[serde(default = "default_temporal_patch_size")]
    temporal_patch_size: usize,
}

impl RawQwen2VlVision {
    fn resolve(self, text: &TextConfig) -> Result<VisionConfig> {
        let embed_dim = require("vision", "embed_dim", self.embed_dim)?;
        Ok(VisionConfig {
            depth: require("vision", "depth", self.depth)?,
            hidden_size: embed_dim,
            intermediate_size: (embed_dim as f64 * self.mlp_ratio) as usize,
            num_heads: require("vision", "num_heads", self.num_heads)?,
            out_hidden_size: self.hidden_size.unwrap_or(text.hidden_size),
            in_channels: self.in_channels,
            patch_size: self.patch_size,
            spatial_merge_size: self.spatial_merge_size,
            temporal_patch_size: self.temporal_patch_size,
            window_size: None,
            fullatt_block_indexes: Vec::new(),
            tokens_per_second: None,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawQwen25VlVision {
    depth: Option<usize>,
    hidden_size: Option<usize>,
    intermediate_size: Option<usize>,
    num_heads: Option<usize>,
    #[serde(default)]
    out_hidden_size: Option<usize>,
    #[serde(default = "default_in_channels", alias = "in_chans")]
    in_channels: usize,
    #[serde(default = "default_patch_size")]
    patch_size: usize,
    #[serde(default = "default_spatial_merge_size")]
    spatial_merge_size: usize,
    #[serde(default = "default_temporal_patch_size")]
    temporal_patch_size: usize,
    #[serde(default = "default_window_size")]
    window_size: usize,
    #[serde(default)]
    fullatt_block_indexes: Vec<usize>,
    #[serde(default = "default_tokens_per_second")]
    tokens_per_second: f32,
}

impl RawQwen25VlVision {
    fn resolve(self, text: &TextConfig) -> Result<VisionConfig> {
        Ok(VisionConfig {
            depth: require("vision", "depth", self.depth)?,
            hidden_size: require("vision", "hidden_size", self.hidden_size)?,
            intermediate_size: require("vision", "intermediate_size", self.intermediate_size)?,
            num_heads: require("vision", "num_heads", self.num_heads)?,
            out_hidden_size: self.out_hidden_size.unwrap_or(text.hidden_size),
            in_channels: self.in_channels,
            patch_size: self.patch_size,
            spatial_merge_size: self.spatial_merge_size,
            temporal_patch_size: self.temporal_patch_size,
            window_size: Some(self.window_size),
            fullatt_block_indexes: self.fullatt_block_indexes,
            tokens_per_second: Some(self.tokens_per_second),
        })
    }
}

fn require<T>(section: &'static str, field: &'static str, value: Option<T>) -> Result<T> {
    value.ok_or_else(|| VlmError::missing_field(section, field).into())
}

const fn default_image_token_id() -> i64 {
    151655
}

const fn default_video_token_id() -> i64 {
    151656
}

const fn default_vision_start_token_id() -> i64 {
    151652
}

const fn default_vision_end_token_id() -> i64 {
    151653
}

const fn default_vision_token_id() -> i64 {
    151654
}

const fn default_ignore_index() -> i64 {
    -100
}

fn default_feature_select_strategy() -> String {
    "default".to_string()
}

const fn default_vision_feature_layer() -> i64 {
    -2
}

const fn default_rms_norm_eps() -> f64 {
    1e-6
}

const fn default_rope_theta() -> f64 {
    1_000_000.0
}

fn default_mrope_section() -> Vec<usize> {
    vec![16, 24, 24]
}

const fn default_max_position_embeddings() -> usize {
    32768
}

fn default_hidden_act() -> String {
    "silu".to_string()
}

const fn default_mlp_ratio() -> f64 {
    4.0
}

const fn default_in_channels() -> usize {
    3
}

const fn default_patch_size() -> usize {
    14
}

const fn default_spatial_merge_size() -> usize {
    2
}

const fn default_temporal_patch_size() -> usize {
    2
}

const fn default_window_size() -> usize {
    112
}

const fn default_tokens_per_second() -> f32 {
    2.0
}

#[derive(Debug, Default, Deserialize)]
struct GenerationOverrides {
    #[serde(default)]
    eos_token_id: Option<EosTokenIds>,
}

/// Config file resolved from a snapshot directory.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub value: ModelConfig,
    pub path: PathBuf,
}

/// Read `config.json` from `dir` (or the file itself), filling a missing `eos_token_id`
/// from a sibling `generation_config.json`.
pub fn load_config(path: impl AsRef<Path>) -> Result<LoadedConfig> {
    let path = path.as_ref();
    let resolved = if path.is_dir() {
        path.join(CONFIG_FILE)
    } else {
        path.to_path_buf()
    };
    if !resolved.is_file() {
        bail!("model config not found at {}", resolved.display());
    }
    let raw = fs::read_to_string(&resolved)
        .with_context(|| format!("failed to read config at {}", resolved.display()))?;
    let json: Value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config at {}", resolved.display()))?;
    let mut value = ModelConfig::from_json(&json)
        .with_context(|| format!("invalid model config at {}", resolved.display()))?;
    if value.eos_token_id.is_empty() {
        if let Some(overrides) = load_generation_overrides(&resolved)? {
            value.eos_token_id = overrides
                .eos_token_id
                .map(EosTokenIds::into_vec)
                .unwrap_or_default();
        }
    }
    Ok(LoadedConfig {
        value,
        path: resolved,
    })
}

fn load_generation_overrides(config_path: &Path) -> Result<Option<GenerationOverrides>> {
    let Some(parent) = config_path.parent() else {
        return Ok(None);
    };
    let candidate = parent.join(GENERATION_CONFIG_FILE);
    if !candidate.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&candidate).with_context(|| {
        format!(
            "failed to read generation config at {}",
            candidate.display()
        )
    })?;
    let overrides = serde_json::from_str(&raw).with_context(|| {
        format!(
            "failed to parse generation config at {}",
            candidate.display()
        )
    })?;
    Ok(Some(overrides))
}
