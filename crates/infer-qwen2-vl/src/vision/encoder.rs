use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use candle_core::{DType, Device, IndexOp, Tensor, shape::D};
use candle_nn::{
    VarBuilder,
    ops::{rms_norm, sigmoid, silu, softmax},
};
use qwen_vl_core::{GridSpec, VisionEncoder, VlmError, tensor::cast};
use tracing::trace;

use crate::{
    config::{ModelFamily, VisionConfig},
    transformer::{LinearWeights, apply_linear, rotate_half},
};

const VISION_NORM_EPS: f64 = 1e-6;
const VISION_ROPE_THETA: f32 = 10_000.0;

/// Patch-level vision transformer shared by Qwen2-VL and Qwen2.5-VL, ending in the
/// patch merger that emits one language-width vector per merged grid cell.
pub struct VisionTower {
    cfg: Arc<VisionConfig>,
    family: ModelFamily,
    patch_embed: LinearWeights,
    blocks: Vec<VisionBlock>,
    merger: PatchMerger,
    inv_freq: Vec<f32>,
    dtype: DType,
    device: Device,
}

impl VisionTower {
    /// `vb` must point at the `vision_tower` prefix.
    pub fn load(cfg: Arc<VisionConfig>, family: ModelFamily, vb: &VarBuilder) -> Result<Self> {
        ensure!(
            cfg.hidden_size % cfg.num_heads == 0,
            "vision hidden size {} not divisible by {} heads",
            cfg.hidden_size,
            cfg.num_heads
        );
        let head_dim = cfg.head_dim();
        ensure!(
            head_dim % 4 == 0,
            "vision head dim must be a multiple of 4 (got {head_dim})"
        );
        let conv = vb
            .get(
                (
                    cfg.hidden_size,
                    cfg.in_channels,
                    cfg.temporal_patch_size,
                    cfg.patch_size,
                    cfg.patch_size,
                ),
                "patch_embed.proj.weight",
            )
            .with_context(|| format!("missing {}.patch_embed.proj.weight", vb.prefix()))?;
        let patch_embed =
            LinearWeights::new(conv.reshape((cfg.hidden_size, cfg.patch_dim()))?, None)?;

        let blocks_vb = vb.pp("blocks");
        let blocks = (0..cfg.depth)
            .map(|idx| VisionBlock::load(&blocks_vb.pp(idx), &cfg, family))
            .collect::<Result<Vec<_>>>()?;
        let merger = PatchMerger::load(&vb.pp("merger"), &cfg, family)?;

        let rotary_dim = head_dim / 2;
        let inv_freq = (0..rotary_dim / 2)
            .map(|i| VISION_ROPE_THETA.powf(-((2 * i) as f32) / rotary_dim as f32))
            .collect();
        Ok(Self {
            family,
            patch_embed,
            blocks,
            merger,
            inv_freq,
            dtype: vb.dtype(),
            device: vb.device().clone(),
            cfg,
        })
    }

    pub fn config(&self) -> &VisionConfig {
        &self.cfg
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Rotary angles per patch, `[patches, head_dim / 2]`: row frequencies then column
    /// frequencies, patches in merge-block order.
    fn rotary_angles(&self, grids: &[GridSpec]) -> Result<Tensor> {
        let merge = self.cfg.spatial_merge_size;
        let freqs = self.inv_freq.len();
        let total: usize = grids.iter().map(GridSpec::patch_count).sum();
        let mut data = Vec::with_capacity(total * freqs * 2);
        for grid in grids {
            for _ in 0..grid.t {
                for bh in 0..grid.h / merge {
                    for bw in 0..grid.w / merge {
                        for mh in 0..merge {
                            for mw in 0..merge {
                                let row = (bh * merge + mh) as f32;
                                let col = (bw * merge + mw) as f32;
                                data.extend(self.inv_freq.iter().map(|f| row * f));
                                data.extend(self.inv_freq.iter().map(|f| col * f));
                            }
                        }
                    }
                }
            }
        }
        Ok(Tensor::from_vec(data, (total, freqs * 2), &self.device)?)
    }

    fn window_size_in_units(&self) -> Option<usize> {
        let window = self.cfg.window_size?;
        let units = window / self.cfg.spatial_merge_size / self.cfg.patch_size;
        (self.family == ModelFamily::Qwen25Vl && units > 0).then_some(units)
    }

    fn uses_full_attention(&self, block_idx: usize) -> bool {
        self.window_size_in_units().is_none() || self.cfg.fullatt_block_indexes.contains(&block_idx)
    }
}

impl VisionEncoder for VisionTower {
    fn encode(&self, pixel_values: &Tensor, grids: &[GridSpec]) -> Result<Tensor> {
        let merge = self.cfg.spatial_merge_size;
        for grid in grids {
            ensure!(
                grid.h % merge == 0 && grid.w % merge == 0,
                "grid {}x{} not divisible by merge size {merge}",
                grid.h,
                grid.w
            );
        }
        let expected_rows: usize = grids.iter().map(GridSpec::patch_count).sum();
        let dims = pixel_values.dims();
        if dims != [expected_rows, self.cfg.patch_dim()] {
            return Err(VlmError::shape_mismatch(
                "vision patches",
                format!("[{expected_rows}, {}]", self.cfg.patch_dim()),
                format!("{dims:?}"),
            )
            .into());
        }

        let pixels = cast(&pixel_values.to_device(&self.device)?, self.dtype)?;
        let mut hidden = apply_linear(&pixels, &self.patch_embed)?;
        let angles = self.rotary_angles(grids)?;
        let full_segments: Vec<usize> = grids
            .iter()
            .flat_map(|grid| std::iter::repeat_n(grid.h * grid.w, grid.t))
            .collect();

        let unit = self.cfg.merge_unit();
        let windows = self
            .window_size_in_units()
            .map(|units| window_layout(grids, merge, units));
        let angles = match &windows {
            Some(layout) => {
                let order = Tensor::from_slice(&layout.order, layout.order.len(), &self.device)?;
                hidden = reorder_units(&hidden, &order, unit)?;
                reorder_units(&angles, &order, unit)?
            }
            None => angles,
        };
        let emb = Tensor::cat(&[&angles, &angles], D::Minus1)?;
        let (cos, sin) = (emb.cos()?, emb.sin()?);

        for (idx, block) in self.blocks.iter().enumerate() {
            let segments = match (&windows, self.uses_full_attention(idx)) {
                (Some(layout), false) => layout.segments.as_slice(),
                _ => full_segments.as_slice(),
            };
            hidden = block.forward(&hidden, &cos, &sin, segments)?;
        }

        let mut merged = self.merger.forward(&hidden, unit)?;
        if let Some(layout) = &windows {
            let mut reverse = vec![0u32; layout.order.len()];
            for (position, &unit_idx) in layout.order.iter().enumerate() {
                reverse[unit_idx as usize] = position as u32;
            }
            let reverse = Tensor::from_vec(reverse, layout.order.len(), &self.device)?;
            merged = merged.index_select(&reverse, 0)?;
        }
        trace!(
            patches = expected_rows,
            merged = merged.dim(0)?,
            "vision tower encoded grids"
        );
        Ok(merged)
    }
}

/// Merge-unit permutation that makes every attention window contiguous, plus the window
/// lengths in patches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WindowLayout {
    pub order: Vec<u32>,
    pub segments: Vec<usize>,
}

pub(crate) fn window_layout(grids: &[GridSpec], merge: usize, window: usize) -> WindowLayout {
    let unit = merge * merge;
    let mut order = Vec::new();
    let mut segments = Vec::new();
    let mut base = 0usize;
    for grid in grids {
        let (rows, cols) = (grid.h / merge, grid.w / merge);
        for t in 0..grid.t {
            let frame_base = base + t * rows * cols;
            for wy in 0..rows.div_ceil(window) {
                for wx in 0..cols.div_ceil(window) {
                    let before = order.len();
                    for y in wy * window..((wy + 1) * window).min(rows) {
                        for x in wx * window..((wx + 1) * window).min(cols) {
                            order.push((frame_base + y * cols + x) as u32);
                        }
                    }
                    segments.push((order.len() - before) * unit);
                }
            }
        }
        base += grid.t * rows * cols;
    }
    WindowLayout { order, segments }
}

fn reorder_units(rows: &Tensor, order: &Tensor, unit: usize) -> Result<Tensor> {
    let (count, width) = rows.dims2()?;
    let grouped = rows.reshape((count / unit, unit, width))?;
    Ok(grouped.index_select(order, 0)?.reshape((count, width))?)
}

enum VisionNorm {
    Layer { weight: Tensor, bias: Tensor },
    Rms { weight: Tensor },
}

impl VisionNorm {
    fn load(vb: &VarBuilder, size: usize, family: ModelFamily) -> Result<Self> {
        let weight = vb
            .get(size, "weight")
            .with_context(|| format!("missing {}.weight", vb.prefix()))?;
        match family {
            ModelFamily::Qwen2Vl => {
                let bias = vb
                    .get(size, "bias")
                    .with_context(|| format!("missing {}.bias", vb.prefix()))?;
                Ok(Self::Layer { weight, bias })
            }
            ModelFamily::Qwen25Vl => Ok(Self::Rms { weight }),
        }
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        match self {
            Self::Rms { weight } => {
                Ok(rms_norm(&input.contiguous()?, weight, VISION_NORM_EPS as f32)?)
            }
            Self::Layer { weight, bias } => {
                let dtype = input.dtype();
                let x = input.to_dtype(DType::F32)?;
                let width = x.dim(D::Minus1)? as f64;
                let mean = (x.sum_keepdim(D::Minus1)? / width)?;
                let centered = x.broadcast_sub(&mean)?;
                let var = (centered.sqr()?.sum_keepdim(D::Minus1)? / width)?;
                let normed = centered.broadcast_div(&(var + VISION_NORM_EPS)?.sqrt()?)?;
                let out = normed
                    .broadcast_mul(&weight.to_dtype(DType::F32)?)?
                    .broadcast_add(&bias.to_dtype(DType::F32)?)?;
                Ok(out.to_dtype(dtype)?)
            }
        }
    }
}

enum VisionMlp {
    QuickGelu {
        fc1: LinearWeights,
        fc2: LinearWeights,
    },
    Gated {
        gate_proj: LinearWeights,
        up_proj: LinearWeights,
        down_proj: LinearWeights,
    },
}

impl VisionMlp {
    fn load(vb: &VarBuilder, cfg: &VisionConfig, family: ModelFamily) -> Result<Self> {
        let (hidden, inner) = (cfg.hidden_size, cfg.intermediate_size);
        Ok(match family {
            ModelFamily::Qwen2Vl => Self::QuickGelu {
                fc1: LinearWeights::load(vb.pp("fc1"), inner, hidden, true)?,
                fc2: LinearWeights::load(vb.pp("fc2"), hidden, inner, true)?,
            },
            ModelFamily::Qwen25Vl => Self::Gated {
                gate_proj: LinearWeights::load(vb.pp("gate_proj"), inner, hidden, true)?,
                up_proj: LinearWeights::load(vb.pp("up_proj"), inner, hidden, true)?,
                down_proj: LinearWeights::load(vb.pp("down_proj"), hidden, inner, true)?,
            },
        })
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        match self {
            Self::QuickGelu { fc1, fc2 } => {
                let x = apply_linear(input, fc1)?;
                let activated = x.mul(&sigmoid(&(&x * 1.702)?)?)?;
                apply_linear(&activated, fc2)
            }
            Self::Gated {
                gate_proj,
                up_proj,
                down_proj,
            } => {
                let gate = silu(&apply_linear(input, gate_proj)?)?;
                let up = apply_linear(input, up_proj)?;
                apply_linear(&gate.mul(&up)?, down_proj)
            }
        }
    }
}

struct VisionAttention {
    qkv: LinearWeights,
    proj: LinearWeights,
    num_heads: usize,
    head_dim: usize,
}

impl VisionAttention {
    fn load(vb: &VarBuilder, cfg: &VisionConfig) -> Result<Self> {
        let hidden = cfg.hidden_size;
        Ok(Self {
            qkv: LinearWeights::load(vb.pp("qkv"), 3 * hidden, hidden, true)?,
            proj: LinearWeights::load(vb.pp("proj"), hidden, hidden, true)?,
            num_heads: cfg.num_heads,
            head_dim: cfg.head_dim(),
        })
    }

    /// Attention restricted to contiguous `segments` of the patch sequence.
    fn forward(
        &self,
        hidden: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        segments: &[usize],
    ) -> Result<Tensor> {
        let (seq_len, width) = hidden.dims2()?;
        let dtype = hidden.dtype();
        let qkv = apply_linear(hidden, &self.qkv)?.reshape((
            seq_len,
            3,
            self.num_heads,
            self.head_dim,
        ))?;
        let rotate = |x: Tensor| -> Result<Tensor> {
            let x = x.to_dtype(DType::F32)?;
            let cos = cos.unsqueeze(1)?;
            let sin = sin.unsqueeze(1)?;
            Ok(x.broadcast_mul(&cos)?.add(&rotate_half(&x)?.broadcast_mul(&sin)?)?)
        };
        let q = rotate(qkv.i((.., 0))?)?.transpose(0, 1)?.contiguous()?;
        let k = rotate(qkv.i((.., 1))?)?.transpose(0, 1)?.contiguous()?;
        let v = qkv.i((.., 2))?.to_dtype(DType::F32)?.transpose(0, 1)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let mut outputs = Vec::with_capacity(segments.len());
        let mut offset = 0usize;
        for &len in segments.iter().filter(|len| **len > 0) {
            let q = q.narrow(1, offset, len)?.contiguous()?;
            let k = k.narrow(1, offset, len)?.contiguous()?;
            let v = v.narrow(1, offset, len)?.contiguous()?;
            let scores = (q.matmul(&k.t()?)? * scale)?;
            let probs = softmax(&scores, D::Minus1)?;
            outputs.push(probs.matmul(&v)?);
            offset += len;
        }
        ensure!(
            offset == seq_len,
            "attention segments cover {offset} patches but sequence has {seq_len}"
        );
        let context = Tensor::cat(&outputs, 1)?
            .transpose(0, 1)?
            .contiguous()?
            .reshape((seq_len, width))?
            .to_dtype(dtype)?;
        apply_linear(&context, &self.proj)
    }
}

struct VisionBlock {
    norm1: VisionNorm,
    norm2: VisionNorm,
    attn: VisionAttention,
    mlp: VisionMlp,
}

impl VisionBlock {
    fn load(vb: &VarBuilder, cfg: &VisionConfig, family: ModelFamily) -> Result<Self> {
        Ok(Self {
            norm1: VisionNorm::load(&vb.pp("norm1"), cfg.hidden_size, family)?,
            norm2: VisionNorm::load(&vb.pp("norm2"), cfg.hidden_size, family)?,
            attn: VisionAttention::load(&vb.pp("attn"), cfg)?,
            mlp: VisionMlp::load(&vb.pp("mlp"), cfg, family)?,
        })
    }

    fn forward(
        &self,
        hidden: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        segments: &[usize],
    ) -> Result<Tensor> {
        let attn = self.attn.forward(&self.norm1.forward(hidden)?, cos, sin, segments)?;
        let hidden = hidden.add(&attn)?;
        let mlp = self.mlp.forward(&self.norm2.forward(&hidden)?)?;
        Ok(hidden.add(&mlp)?)
    }
}

struct PatchMerger {
    ln_q: VisionNorm,
    fc1: LinearWeights,
    fc2: LinearWeights,
}

impl PatchMerger {
    fn load(vb: &VarBuilder, cfg: &VisionConfig, family: ModelFamily) -> Result<Self> {
        let merged = cfg.hidden_size * cfg.merge_unit();
        let mlp = vb.pp("mlp");
        Ok(Self {
            ln_q: VisionNorm::load(&vb.pp("ln_q"), cfg.hidden_size, family)?,
            fc1: LinearWeights::load(mlp.pp("0"), merged, merged, true)?,
            fc2: LinearWeights::load(mlp.pp("2"), cfg.out_hidden_size, merged, true)?,
        })
    }

    /// `[patches, hidden]` -> `[patches / unit, out_hidden]`.
    fn forward(&self, hidden: &Tensor, unit: usize) -> Result<Tensor> {
        let (patches, width) = hidden.dims2()?;
        let normed = self.ln_q.forward(hidden)?.reshape((patches / unit, width * unit))?;
        let x = apply_linear(&normed, &self.fc1)?.gelu_erf()?;
        apply_linear(&x, &self.fc2)
    }
}
