use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, ops::rms_norm};
use qwen_vl_core::{cache::DynamicCache, tensor::gather_token_embeddings};
use tracing::trace;

use crate::config::TextConfig;

use super::{
    block::{build_causal_bias, decoder_layer_forward},
    rope::MultimodalRotaryEmbedding,
    weights::{LinearWeights, Qwen2ModelWeights},
};

/// Qwen2 text backbone driven by explicit three-axis rotary positions.
pub struct Qwen2Decoder {
    cfg: Arc<TextConfig>,
    weights: Qwen2ModelWeights,
    lm_head: LinearWeights,
    rotary: MultimodalRotaryEmbedding,
}

impl Qwen2Decoder {
    /// `vb` points at the `language_model` namespace. Tied checkpoints without an
    /// `lm_head.weight` reuse the embedding table as the output projection.
    pub fn load(cfg: Arc<TextConfig>, vb: &VarBuilder) -> Result<Self> {
        let weights = Qwen2ModelWeights::load(&vb.pp("model"), cfg.as_ref())
            .context("failed to load Qwen2 decoder weights")?;
        let head_vb = vb.pp("lm_head");
        let lm_head = if cfg.tie_word_embeddings && !head_vb.contains_tensor("weight") {
            LinearWeights::new(weights.embed_tokens.clone(), None)?
        } else {
            LinearWeights::load(head_vb, cfg.vocab_size, cfg.hidden_size, false)
                .context("failed to load lm_head weights")?
        };
        Self::from_parts(cfg, weights, lm_head)
    }

    pub fn from_parts(
        cfg: Arc<TextConfig>,
        weights: Qwen2ModelWeights,
        lm_head: LinearWeights,
    ) -> Result<Self> {
        let rotary = MultimodalRotaryEmbedding::new(cfg.as_ref())?;
        Ok(Self {
            cfg,
            weights,
            lm_head,
            rotary,
        })
    }

    pub fn config(&self) -> &TextConfig {
        self.cfg.as_ref()
    }

    pub fn embed_tokens(&self) -> &Tensor {
        &self.weights.embed_tokens
    }

    pub fn dtype(&self) -> DType {
        self.weights.embed_tokens.dtype()
    }

    pub fn device(&self) -> &Device {
        self.weights.embed_tokens.device()
    }

    pub fn new_cache(&self) -> DynamicCache {
        DynamicCache::with_num_layers(self.weights.layers.len())
    }

    pub fn embed(&self, token_ids: &Tensor) -> Result<Tensor> {
        gather_token_embeddings(&self.weights.embed_tokens, token_ids)
    }

    /// `embeddings` `[batch, seq, hidden]`, `position_ids` `[3, batch, seq]`; returns
    /// `[batch, seq, vocab]` logits.
    pub fn forward(
        &self,
        embeddings: &Tensor,
        position_ids: &Tensor,
        mut cache: Option<&mut DynamicCache>,
    ) -> Result<Tensor> {
        let (batch, seq_len, _) = embeddings.dims3()?;
        ensure!(
            position_ids.dims() == [3, batch, seq_len],
            "position ids {:?} do not match [3, {batch}, {seq_len}]",
            position_ids.dims()
        );
        let dtype = embeddings.dtype();
        let device = embeddings.device();
        let past_len = cache.as_deref().and_then(DynamicCache::seq_len).unwrap_or(0);
        let total_layers = self.weights.layers.len();
        if let Some(existing) = cache.as_deref_mut() {
            ensure!(
                existing.num_layers() <= total_layers,
                "cache tracks {} layers but decoder has {}",
                existing.num_layers(),
                total_layers
            );
            existing.ensure_layers(total_layers);
        }

        let attn_bias = build_causal_bias(seq_len, past_len, dtype, device)?;
        let (cos, sin) = self.rotary.cos_sin(position_ids, dtype)?;

        let mut hidden = embeddings.contiguous()?;
        let mut presents = Vec::with_capacity(total_layers);
        for (idx, layer) in self.weights.layers.iter().enumerate() {
            let past = cache.as_deref().and_then(|c| c.get(idx));
            let output = decoder_layer_forward(
                self.cfg.as_ref(),
                layer,
                &hidden,
                attn_bias.as_ref(),
                &cos,
                &sin,
                past,
            )
            .with_context(|| format!("decoder layer {idx} failed"))?;
            hidden = output.hidden_states;
            presents.push(output.present);
            trace!(layer = idx, "decoder layer done");
        }
        // Commit only once every layer has produced its keys/values.
        if let Some(cache) = cache.as_deref_mut() {
            for (idx, present) in presents.into_iter().enumerate() {
                cache.append(idx, present)?;
            }
        }

        let normed = rms_norm(
            &hidden,
            &self.weights.final_norm,
            self.cfg.rms_norm_eps as f32,
        )
        .context("final rms norm failed")?;
        let flat = normed.reshape((batch * seq_len, self.cfg.hidden_size))?;
        let logits = self.lm_head.matmul_2d(&flat)?;
        Ok(logits.reshape((batch, seq_len, self.cfg.vocab_size))?)
    }
}
