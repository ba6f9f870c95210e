use anyhow::{Context, Result, ensure};
use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::config::TextConfig;

#[derive(Debug, Clone)]
pub struct LinearWeights {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    pub out_dim: usize,
    pub in_dim: usize,
}

impl LinearWeights {
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let (out_dim, in_dim) = weight.dims2().context("linear weight must be 2D")?;
        if let Some(bias) = &bias {
            ensure!(
                bias.dims() == [out_dim],
                "linear bias {:?} does not match {out_dim} outputs",
                bias.dims()
            );
        }
        Ok(Self {
            weight: weight.contiguous()?,
            bias,
            out_dim,
            in_dim,
        })
    }

    pub fn load(vb: VarBuilder, out_dim: usize, in_dim: usize, with_bias: bool) -> Result<Self> {
        let weight = vb
            .get((out_dim, in_dim), "weight")
            .with_context(|| format!("missing {}.weight", vb.prefix()))?;
        let bias = if with_bias {
            Some(
                vb.get(out_dim, "bias")
                    .with_context(|| format!("missing {}.bias", vb.prefix()))?,
            )
        } else {
            None
        };
        Self::new(weight, bias)
    }

    /// `[rows, in_dim]` -> `[rows, out_dim]`.
    pub fn matmul_2d(&self, input: &Tensor) -> Result<Tensor> {
        let out = input.matmul(&self.weight.t()?)?;
        match &self.bias {
            Some(bias) => Ok(out.broadcast_add(bias)?),
            None => Ok(out),
        }
    }
}

#[derive(Debug)]
pub struct AttentionWeights {
    pub q_proj: LinearWeights,
    pub k_proj: LinearWeights,
    pub v_proj: LinearWeights,
    pub o_proj: LinearWeights,
}

impl AttentionWeights {
    pub fn load(vb: &VarBuilder, cfg: &TextConfig) -> Result<Self> {
        let head_dim = cfg.head_dim();
        let q_dim = cfg.num_attention_heads * head_dim;
        let kv_dim = cfg.num_key_value_heads * head_dim;
        let attn_vb = vb.pp("self_attn");
        Ok(Self {
            q_proj: LinearWeights::load(attn_vb.pp("q_proj"), q_dim, cfg.hidden_size, true)?,
            k_proj: LinearWeights::load(attn_vb.pp("k_proj"), kv_dim, cfg.hidden_size, true)?,
            v_proj: LinearWeights::load(attn_vb.pp("v_proj"), kv_dim, cfg.hidden_size, true)?,
            o_proj: LinearWeights::load(attn_vb.pp("o_proj"), cfg.hidden_size, q_dim, false)?,
        })
    }
}

#[derive(Debug)]
pub struct MlpWeights {
    pub gate_proj: LinearWeights,
    pub up_proj: LinearWeights,
    pub down_proj: LinearWeights,
}

impl MlpWeights {
    pub fn load(vb: &VarBuilder, cfg: &TextConfig) -> Result<Self> {
        let mlp_vb = vb.pp("mlp");
        let (hidden, inner) = (cfg.hidden_size, cfg.intermediate_size);
        Ok(Self {
            gate_proj: LinearWeights::load(mlp_vb.pp("gate_proj"), inner, hidden, false)?,
            up_proj: LinearWeights::load(mlp_vb.pp("up_proj"), inner, hidden, false)?,
            down_proj: LinearWeights::load(mlp_vb.pp("down_proj"), hidden, inner, false)?,
        })
    }
}

#[derive(Debug)]
pub struct DecoderLayerWeights {
    pub attention: AttentionWeights,
    pub mlp: MlpWeights,
    pub input_layernorm: Tensor,
    pub post_attention_layernorm: Tensor,
}

impl DecoderLayerWeights {
    pub fn load(vb: &VarBuilder, cfg: &TextConfig) -> Result<Self> {
        let attention = AttentionWeights::load(vb, cfg)?;
        let mlp = MlpWeights::load(vb, cfg)?;
        let input_layernorm = vb
            .pp("input_layernorm")
            .get(cfg.hidden_size, "weight")
            .context("missing input_layernorm.weight")?;
        let post_attention_layernorm = vb
            .pp("post_attention_layernorm")
            .get(cfg.hidden_size, "weight")
            .context("missing post_attention_layernorm.weight")?;
        Ok(Self {
            attention,
            mlp,
            input_layernorm,
            post_attention_layernorm,
        })
    }
}

#[derive(Debug)]
pub struct Qwen2ModelWeights {
    pub embed_tokens: Tensor,
    pub layers: Vec<DecoderLayerWeights>,
    pub final_norm: Tensor,
}

impl Qwen2ModelWeights {
    /// `vb` points at `language_model.model`.
    pub fn load(vb: &VarBuilder, cfg: &TextConfig) -> Result<Self> {
        let embed_tokens = vb
            .pp("embed_tokens")
            .get((cfg.vocab_size, cfg.hidden_size), "weight")
            .context("missing embed_tokens.weight")?;
        let layers = (0..cfg.num_hidden_layers)
            .map(|idx| {
                DecoderLayerWeights::load(&vb.pp(format!("layers.{idx}")), cfg)
                    .with_context(|| format!("failed to load decoder layer {idx}"))
            })
            .collect::<Result<Vec<_>>>()?;
        let final_norm = vb
            .pp("norm")
            .get(cfg.hidden_size, "weight")
            .context("missing norm.weight")?;
        Ok(Self {
            embed_tokens,
            layers,
            final_norm,
        })
    }
}
