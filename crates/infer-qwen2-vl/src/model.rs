use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, ensure};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use image::DynamicImage;
use qwen_vl_core::{
    DecodeDriver, DecodeSession, DynamicCache, LanguageModel, VisualInput, WeightKeyMapper,
    weights::load_mapped_weights,
};
use tracing::{debug, info};

use crate::{
    config::{LoadedConfig, ModelConfig, ModelFamily, load_config},
    transformer::Qwen2Decoder,
    vision::{ImageProcessorConfig, VisionTower, preprocess_frames, preprocess_image},
};

impl LanguageModel for Qwen2Decoder {
    fn embed(&self, token_ids: &Tensor) -> Result<Tensor> {
        Qwen2Decoder::embed(self, token_ids)
    }

    fn forward(
        &self,
        embeddings: &Tensor,
        position_ids: &Tensor,
        cache: Option<&mut DynamicCache>,
    ) -> Result<Tensor> {
        Qwen2Decoder::forward(self, embeddings, position_ids, cache)
    }

    fn new_cache(&self) -> DynamicCache {
        Qwen2Decoder::new_cache(self)
    }

    fn hidden_size(&self) -> usize {
        self.config().hidden_size
    }

    fn dtype(&self) -> DType {
        Qwen2Decoder::dtype(self)
    }

    fn device(&self) -> &Device {
        Qwen2Decoder::device(self)
    }
}

/// A Qwen2-VL / Qwen2.5-VL checkpoint: vision tower plus text decoder behind the shared
/// decode driver.
pub struct QwenVlModel {
    config: Arc<ModelConfig>,
    model_dir: Option<PathBuf>,
    image_processor: ImageProcessorConfig,
    driver: DecodeDriver<VisionTower, Qwen2Decoder>,
}

impl QwenVlModel {
    /// Build the graph from weights already namespaced under `vision_tower` and
    /// `language_model`.
    pub fn new(config: ModelConfig, vb: &VarBuilder) -> Result<Self> {
        let vision = VisionTower::load(
            Arc::new(config.vision.clone()),
            config.family,
            &vb.pp("vision_tower"),
        )
        .context("failed to load vision tower")?;
        let language = Qwen2Decoder::load(Arc::new(config.text.clone()), &vb.pp("language_model"))
            .context("failed to load language model")?;
        let tokens_per_second = match config.family {
            ModelFamily::Qwen25Vl => config.vision.tokens_per_second,
            ModelFamily::Qwen2Vl => None,
        };
        let driver = DecodeDriver::new(
            vision,
            language,
            config.placeholders(),
            config.vision.spatial_merge_size,
            tokens_per_second,
        );
        Ok(Self {
            image_processor: ImageProcessorConfig::from_vision_config(&config.vision),
            config: Arc::new(config),
            model_dir: None,
            driver,
        })
    }

    /// Resolve a local directory or Hugging Face repo id and load it.
    pub fn load_pretrained(path_or_repo: &str, device: &Device, dtype: DType) -> Result<Self> {
        let dir = qwen_vl_assets::resolve_snapshot(path_or_repo)
            .with_context(|| format!("failed to resolve model {path_or_repo}"))?;
        Self::load_from_dir(&dir, device, dtype)
    }

    pub fn load_from_dir(dir: &Path, device: &Device, dtype: DType) -> Result<Self> {
        let LoadedConfig { value, path } = load_config(dir)?;
        info!(
            config = %path.display(),
            model_type = value.family.model_type(),
            "parsed model config"
        );
        let weights = load_mapped_weights(dir, device, &WeightKeyMapper::default())?;
        let tensor_count = weights.len();
        let vb = VarBuilder::from_tensors(weights, dtype, device);
        let mut model = Self::new(value, &vb)?;
        model.image_processor = model
            .image_processor
            .clone()
            .with_snapshot_overrides(dir)?;
        model.model_dir = Some(dir.to_path_buf());
        info!(
            dir = %dir.display(),
            tensors = tensor_count,
            ?dtype,
            "loaded pretrained model"
        );
        Ok(model)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn model_dir(&self) -> Option<&Path> {
        self.model_dir.as_deref()
    }

    pub fn device(&self) -> &Device {
        self.driver.language().device()
    }

    pub fn dtype(&self) -> DType {
        self.driver.language().dtype()
    }

    pub fn image_processor(&self) -> &ImageProcessorConfig {
        &self.image_processor
    }

    pub fn set_image_processor(&mut self, config: ImageProcessorConfig) {
        self.image_processor = config;
    }

    pub fn driver(&self) -> &DecodeDriver<VisionTower, Qwen2Decoder> {
        &self.driver
    }

    pub fn new_session(&self) -> DecodeSession {
        self.driver.new_session()
    }

    pub fn step(
        &self,
        token_ids: &[i64],
        visual: Option<&VisualInput>,
        session: Option<&mut DecodeSession>,
    ) -> Result<Tensor> {
        self.driver.step(token_ids, visual, session)
    }

    /// Preprocess still images into one batched pixel input, grids in image order.
    pub fn prepare_images(&self, images: &[DynamicImage]) -> Result<VisualInput> {
        ensure!(!images.is_empty(), "no images to prepare");
        let mut rows = Vec::with_capacity(images.len());
        let mut grids = Vec::with_capacity(images.len());
        for (idx, image) in images.iter().enumerate() {
            let patches = preprocess_image(image, self.device(), &self.image_processor)
                .with_context(|| format!("failed to preprocess image {idx}"))?;
            debug!(
                idx,
                height = patches.height,
                width = patches.width,
                grid = ?patches.grid,
                "preprocessed image"
            );
            rows.push(patches.pixel_values);
            grids.push(patches.grid);
        }
        Ok(VisualInput::new(Tensor::cat(&rows, 0)?, grids))
    }

    /// Preprocess sampled video frames taken at `fps` frames per second.
    pub fn prepare_video(&self, frames: &[DynamicImage], fps: f32) -> Result<VisualInput> {
        ensure!(fps > 0.0, "video fps must be positive (got {fps})");
        let patches = preprocess_frames(frames, self.device(), &self.image_processor)
            .context("failed to preprocess video frames")?;
        let seconds = self.image_processor.temporal_patch_size as f32 / fps;
        Ok(VisualInput {
            pixel_values: patches.pixel_values,
            grids: vec![patches.grid],
            seconds_per_grid: vec![seconds],
        })
    }
}
