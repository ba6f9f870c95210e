use anyhow::{Context, Result, ensure};
use candle_core::{Tensor, shape::D};
use candle_nn::ops::softmax;
use qwen_vl_core::cache::{KvCacheChunk, KvCacheEntry};

use crate::config::TextConfig;

use super::{ops::apply_linear, rope::apply_rotary, weights::AttentionWeights};

/// Grouped-query self attention over `[batch, seq, hidden]` input.
///
/// Keys/values for the new tokens are returned un-repeated (`num_key_value_heads`) so the
/// cache stores them compactly; cached state is prepended before the heads are repeated.
pub fn attention_forward(
    cfg: &TextConfig,
    hidden_states: &Tensor,
    weights: &AttentionWeights,
    cos: &Tensor,
    sin: &Tensor,
    attn_bias: Option<&Tensor>,
    past: Option<&KvCacheEntry>,
) -> Result<(Tensor, KvCacheChunk)> {
    let (batch, seq_len, hidden_size) = hidden_states.dims3()?;
    ensure!(
        hidden_size == cfg.hidden_size,
        "hidden size mismatch: cfg {} tensor {}",
        cfg.hidden_size,
        hidden_size
    );
    let head_dim = cfg.head_dim();
    let num_heads = cfg.num_attention_heads;
    let num_kv_heads = cfg.num_key_value_heads;
    ensure!(
        num_heads % num_kv_heads == 0,
        "num_attention_heads {num_heads} must be divisible by num_key_value_heads {num_kv_heads}"
    );

    let project = |linear, heads| -> Result<Tensor> {
        Ok(apply_linear(hidden_states, linear)?
            .reshape((batch, seq_len, heads, head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    };
    let q = apply_rotary(&project(&weights.q_proj, num_heads)?, cos, sin)?;
    let k = apply_rotary(&project(&weights.k_proj, num_kv_heads)?, cos, sin)?;
    let v = project(&weights.v_proj, num_kv_heads)?;
    let k_t = k.transpose(2, 3)?.contiguous()?;
    let present = KvCacheChunk::new(k_t.clone(), v.clone())?;

    let (all_k_t, all_v) = match past {
        Some(entry) if entry.seq_len() > 0 => {
            let cached_k = entry.key_view()?;
            let cached_v = entry.value_view()?;
            ensure!(
                cached_k.dim(1)? == num_kv_heads && cached_k.dim(2)? == head_dim,
                "cached keys {:?} do not match {num_kv_heads} heads of {head_dim}",
                cached_k.dims()
            );
            (
                Tensor::cat(&[&cached_k, &k_t], D::Minus1)?,
                Tensor::cat(&[&cached_v, &v], D::Minus2)?,
            )
        }
        _ => (k_t, v),
    };
    let repeats = num_heads / num_kv_heads;
    let all_k_t = repeat_kv(&all_k_t, repeats)?;
    let all_v = repeat_kv(&all_v, repeats)?;

    let scale = (head_dim as f64).sqrt();
    let mut scores = (q.matmul(&all_k_t)? / scale)?;
    if let Some(bias) = attn_bias {
        scores = scores.broadcast_add(bias)?;
    }
    let probs = softmax(&scores, D::Minus1).context("attention softmax failed")?;
    let context = probs
        .matmul(&all_v)?
        .transpose(1, 2)?
        .reshape((batch, seq_len, num_heads * head_dim))?;
    let output = apply_linear(&context, &weights.o_proj)?;
    Ok((output, present))
}

/// Repeat axis 1 (`heads`) of a rank-4 tensor `repeats` times, keeping groups adjacent.
pub(crate) fn repeat_kv(tensor: &Tensor, repeats: usize) -> Result<Tensor> {
    if repeats == 1 {
        return Ok(tensor.clone());
    }
    let (batch, heads, a, b) = tensor.dims4()?;
    Ok(tensor
        .unsqueeze(2)?
        .expand((batch, heads, repeats, a, b))?
        .reshape((batch, heads * repeats, a, b))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn repeat_kv_keeps_groups_adjacent() -> Result<()> {
        let t = Tensor::arange(0f32, 4., &Device::Cpu)?.reshape((1, 2, 1, 2))?;
        let repeated = repeat_kv(&t, 2)?;
        assert_eq!(repeated.dims(), &[1, 4, 1, 2]);
        let rows = repeated.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(rows, vec![0., 1., 0., 1., 2., 3., 2., 3.]);
        Ok(())
    }
}
