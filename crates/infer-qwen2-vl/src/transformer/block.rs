use anyhow::{Context, Result, bail};
use candle_core::{DType, Device, Tensor};
use candle_nn::ops::{rms_norm, silu};
use qwen_vl_core::cache::{KvCacheChunk, KvCacheEntry};

use crate::config::TextConfig;

use super::{
    attention::attention_forward,
    ops::apply_linear,
    weights::{DecoderLayerWeights, MlpWeights},
};

pub struct LayerOutput {
    pub hidden_states: Tensor,
    pub present: KvCacheChunk,
}

pub fn decoder_layer_forward(
    cfg: &TextConfig,
    layer: &DecoderLayerWeights,
    hidden_states: &Tensor,
    attn_bias: Option<&Tensor>,
    cos: &Tensor,
    sin: &Tensor,
    past: Option<&KvCacheEntry>,
) -> Result<LayerOutput> {
    let eps = cfg.rms_norm_eps as f32;
    let normed = rms_norm(hidden_states, &layer.input_layernorm, eps)
        .context("input rms norm failed")?;
    let (attn_out, present) =
        attention_forward(cfg, &normed, &layer.attention, cos, sin, attn_bias, past)?;
    let hidden_states = hidden_states
        .add(&attn_out)
        .context("attention residual add failed")?;

    let normed = rms_norm(&hidden_states, &layer.post_attention_layernorm, eps)
        .context("post-attention rms norm failed")?;
    let mlp_out = mlp_forward(&normed, &layer.mlp, cfg).context("mlp forward failed")?;
    let hidden_states = hidden_states
        .add(&mlp_out)
        .context("mlp residual add failed")?;
    Ok(LayerOutput {
        hidden_states,
        present,
    })
}

fn mlp_forward(input: &Tensor, mlp: &MlpWeights, cfg: &TextConfig) -> Result<Tensor> {
    let gate = apply_linear(input, &mlp.gate_proj)?;
    let up = apply_linear(input, &mlp.up_proj)?;
    let activated = match cfg.hidden_act.as_str() {
        "silu" | "swiglu" => silu(&gate)?,
        other => bail!("unsupported activation: {other}"),
    };
    apply_linear(&activated.mul(&up)?, &mlp.down_proj)
}

/// Additive causal mask `[1, 1, q_len, past_len + q_len]`; `None` for single-token steps.
pub fn build_causal_bias(
    q_len: usize,
    past_len: usize,
    dtype: DType,
    device: &Device,
) -> Result<Option<Tensor>> {
    if q_len <= 1 {
        return Ok(None);
    }
    let k_len = past_len + q_len;
    let fill = mask_fill_value(dtype);
    let values: Vec<f32> = (0..q_len)
        .flat_map(|row| {
            (0..k_len).map(move |col| if col > row + past_len { fill } else { 0.0 })
        })
        .collect();
    let bias = Tensor::from_vec(values, (1, 1, q_len, k_len), device)?.to_dtype(dtype)?;
    Ok(Some(bias))
}

fn mask_fill_value(dtype: DType) -> f32 {
    match dtype {
        DType::F16 | DType::BF16 => -1e4f32,
        _ => -1e9f32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn causal_bias_accounts_for_cached_prefix() -> Result<()> {
        let bias = build_causal_bias(2, 3, DType::F32, &Device::Cpu)?.expect("two new tokens");
        let rows = bias.squeeze(0)?.squeeze(0)?.to_vec2::<f32>()?;
        assert_eq!(rows[0], vec![0., 0., 0., 0., -1e9]);
        assert_eq!(rows[1], vec![0., 0., 0., 0., 0.]);
        assert!(build_causal_bias(1, 3, DType::F32, &Device::Cpu)?.is_none());
        Ok(())
    }
}
