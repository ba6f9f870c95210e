mod attention;
mod block;
mod model;
mod ops;
mod rope;
mod weights;

pub use model::Qwen2Decoder;
pub use ops::{apply_linear, rotate_half};
pub use rope::MultimodalRotaryEmbedding;
pub use weights::{
    AttentionWeights, DecoderLayerWeights, LinearWeights, MlpWeights, Qwen2ModelWeights,
};
