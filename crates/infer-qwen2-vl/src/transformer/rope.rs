use anyhow::{Result, ensure};
use candle_core::{DType, IndexOp, Tensor, shape::D};

use crate::config::TextConfig;

/// Rotary tables for the three position axes. Each frequency band is driven by one axis,
/// chosen by the `mrope_section` split of the (doubled) head dimension.
#[derive(Debug, Clone)]
pub struct MultimodalRotaryEmbedding {
    inv_freq: Vec<f32>,
    doubled_sections: Vec<usize>,
}

impl MultimodalRotaryEmbedding {
    pub fn new(cfg: &TextConfig) -> Result<Self> {
        let head_dim = cfg.head_dim();
        ensure!(
            head_dim % 2 == 0,
            "rope head dim must be even (got {head_dim})"
        );
        ensure!(
            cfg.mrope_section.len() == 3,
            "expected 3 mrope sections, got {}",
            cfg.mrope_section.len()
        );
        let half = head_dim / 2;
        let theta = cfg.rope_theta as f32;
        let inv_freq = (0..half)
            .map(|i| theta.powf(-(i as f32) / half as f32))
            .collect();
        let doubled_sections: Vec<usize> = cfg
            .mrope_section
            .iter()
            .chain(cfg.mrope_section.iter())
            .copied()
            .collect();
        let total: usize = doubled_sections.iter().sum();
        ensure!(
            total == head_dim,
            "doubled mrope sections cover {total} dims but head_dim is {head_dim}"
        );
        Ok(Self {
            inv_freq,
            doubled_sections,
        })
    }

    /// `position_ids` is `[3, batch, seq]`; returns cos/sin as `[batch, seq, head_dim]` with
    /// every band already taken from its axis.
    pub fn cos_sin(&self, position_ids: &Tensor, dtype: DType) -> Result<(Tensor, Tensor)> {
        let (axes, batch, seq_len) = position_ids.dims3()?;
        ensure!(axes == 3, "position ids must have shape [3, batch, seq]");
        let half = self.inv_freq.len();
        let pos = position_ids
            .to_dtype(DType::F32)?
            .reshape((axes, batch, seq_len, 1))?;
        let inv = Tensor::from_vec(self.inv_freq.clone(), (1, 1, 1, half), position_ids.device())?;
        let angles = pos.broadcast_mul(&inv)?;
        let angles = Tensor::cat(&[&angles, &angles], D::Minus1)?;
        let cos = self.select_sections(&angles.cos()?)?;
        let sin = self.select_sections(&angles.sin()?)?;
        Ok((cos.to_dtype(dtype)?, sin.to_dtype(dtype)?))
    }

    fn select_sections(&self, table: &Tensor) -> Result<Tensor> {
        let mut offset = 0usize;
        let mut bands = Vec::with_capacity(self.doubled_sections.len());
        for (idx, &width) in self.doubled_sections.iter().enumerate() {
            bands.push(table.narrow(D::Minus1, offset, width)?.i(idx % 3)?);
            offset += width;
        }
        Ok(Tensor::cat(&bands, D::Minus1)?.contiguous()?)
    }
}

/// Rotate `[batch, heads, seq, head_dim]` queries/keys by `[batch, seq, head_dim]` tables.
pub fn apply_rotary(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let cos = cos.unsqueeze(1)?;
    let sin = sin.unsqueeze(1)?;
    let rotated = super::ops::rotate_half(x)?;
    Ok(x.broadcast_mul(&cos)?.add(&rotated.broadcast_mul(&sin)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn text_config() -> TextConfig {
        TextConfig {
            hidden_size: 16,
            intermediate_size: 32,
            num_hidden_layers: 1,
            num_attention_heads: 2,
            num_key_value_heads: 2,
            vocab_size: 8,
            rms_norm_eps: 1e-6,
            rope_theta: 10000.0,
            mrope_section: vec![2, 1, 1],
            max_position_embeddings: 64,
            tie_word_embeddings: false,
            hidden_act: "silu".into(),
            torch_dtype: None,
        }
    }

    #[test]
    fn equal_axes_reduce_to_plain_rope() -> Result<()> {
        let rope = MultimodalRotaryEmbedding::new(&text_config())?;
        let positions = Tensor::new(&[[[3i64]], [[3]], [[3]]], &Device::Cpu)?;
        let (cos, _) = rope.cos_sin(&positions, DType::F32)?;
        let cos = cos.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(cos.len(), 8);
        for (i, value) in cos.iter().enumerate() {
            let freq = 10000f32.powf(-((i % 4) as f32) / 4.0);
            assert!((value - (3.0 * freq).cos()).abs() < 1e-5, "dim {i}");
        }
        Ok(())
    }

    #[test]
    fn bands_follow_their_axis() -> Result<()> {
        let rope = MultimodalRotaryEmbedding::new(&text_config())?;
        // temporal 0, row 1, column 2
        let positions = Tensor::new(&[[[0i64]], [[1]], [[2]]], &Device::Cpu)?;
        let (_, sin) = rope.cos_sin(&positions, DType::F32)?;
        let sin = sin.flatten_all()?.to_vec1::<f32>()?;
        // Sections [2, 1, 1] doubled: dims 0-1 temporal, 2 row, 3 column, 4-5 temporal, ...
        assert_eq!(sin[0], 0.0);
        assert_eq!(sin[1], 0.0);
        assert!(sin[2] != 0.0 && sin[3] != 0.0);
        assert_eq!(sin[4], 0.0);
        Ok(())
    }

    #[test]
    fn sections_must_cover_the_head() {
        let mut cfg = text_config();
        cfg.mrope_section = vec![1, 1, 1];
        assert!(MultimodalRotaryEmbedding::new(&cfg).is_err());
    }
}
