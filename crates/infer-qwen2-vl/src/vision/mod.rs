pub mod encoder;
pub mod preprocess;

pub use encoder::VisionTower;
pub use preprocess::{
    ImageProcessorConfig, PixelPatches, preprocess_frames, preprocess_image, smart_resize,
};
