pub mod adapter;
pub mod cache;
pub mod driver;
pub mod error;
pub mod fusion;
pub mod position;
pub mod runtime;
pub mod sampling;
pub mod tensor;
pub mod weight_keys;
pub mod weights;

pub use adapter::VisionFeatureAdapter;
pub use cache::{DynamicCache, KvCacheChunk, KvCacheEntry};
pub use driver::{
    DecodeDriver, DecodeSession, LanguageModel, SessionState, VisionEncoder, VisualInput,
};
pub use error::VlmError;
pub use fusion::{MediaKind, PlaceholderScan, PlaceholderTokens, find_placeholder_positions, fuse};
pub use position::{GridSpec, PositionIndex, PositionIndexer};
pub use weight_keys::WeightKeyMapper;
