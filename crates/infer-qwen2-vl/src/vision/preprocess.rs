use std::{fs, path::Path};

use anyhow::{Context, Result, anyhow, ensure};
use candle_core::{Device, Tensor};
use fast_image_resize as fir;
use image::{DynamicImage, ImageBuffer, RgbImage};
use qwen_vl_core::GridSpec;
use serde::Deserialize;

use crate::config::VisionConfig;

pub const PREPROCESSOR_CONFIG_FILE: &str = "preprocessor_config.json";
pub const DEFAULT_MIN_PIXELS: usize = 56 * 56;
pub const DEFAULT_MAX_PIXELS: usize = 28 * 28 * 16384;
pub const CLIP_IMAGE_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
pub const CLIP_IMAGE_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_1];

#[derive(Debug, Clone, PartialEq)]
pub struct ImageProcessorConfig {
    pub patch_size: usize,
    pub merge_size: usize,
    pub temporal_patch_size: usize,
    pub min_pixels: usize,
    pub max_pixels: usize,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
    pub rescale_factor: f32,
}

#[derive(Debug, Default, Deserialize)]
struct RawProcessorConfig {
    #[serde(default)]
    min_pixels: Option<usize>,
    #[serde(default)]
    max_pixels: Option<usize>,
    #[serde(default)]
    image_mean: Option<[f32; 3]>,
    #[serde(default)]
    image_std: Option<[f32; 3]>,
    #[serde(default)]
    rescale_factor: Option<f32>,
}

impl ImageProcessorConfig {
    pub fn from_vision_config(cfg: &VisionConfig) -> Self {
        Self {
            patch_size: cfg.patch_size,
            merge_size: cfg.spatial_merge_size,
            temporal_patch_size: cfg.temporal_patch_size,
            min_pixels: DEFAULT_MIN_PIXELS,
            max_pixels: DEFAULT_MAX_PIXELS,
            image_mean: CLIP_IMAGE_MEAN,
            image_std: CLIP_IMAGE_STD,
            rescale_factor: 1.0 / 255.0,
        }
    }

    /// Overlay `preprocessor_config.json` from a snapshot directory when present.
    pub fn with_snapshot_overrides(mut self, dir: &Path) -> Result<Self> {
        let path = dir.join(PREPROCESSOR_CONFIG_FILE);
        if !path.is_file() {
            return Ok(self);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let overrides: RawProcessorConfig = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        if let Some(min_pixels) = overrides.min_pixels {
            self.min_pixels = min_pixels;
        }
        if let Some(max_pixels) = overrides.max_pixels {
            self.max_pixels = max_pixels;
        }
        if let Some(mean) = overrides.image_mean {
            self.image_mean = mean;
        }
        if let Some(std) = overrides.image_std {
            self.image_std = std;
        }
        if let Some(rescale) = overrides.rescale_factor {
            self.rescale_factor = rescale;
        }
        Ok(self)
    }

    pub fn with_pixel_bounds(mut self, min_pixels: usize, max_pixels: usize) -> Self {
        self.min_pixels = min_pixels;
        self.max_pixels = max_pixels;
        self
    }

    fn factor(&self) -> u32 {
        (self.patch_size * self.merge_size) as u32
    }

    fn patch_dim(&self) -> usize {
        3 * self.temporal_patch_size * self.patch_size * self.patch_size
    }
}

/// Flattened patches for one image or video, ready for the vision tower.
#[derive(Debug, Clone)]
pub struct PixelPatches {
    /// `[t * h * w, channels * temporal_patch * patch * patch]`, merge blocks contiguous.
    pub pixel_values: Tensor,
    pub grid: GridSpec,
    pub height: usize,
    pub width: usize,
}

pub fn preprocess_image(
    image: &DynamicImage,
    device: &Device,
    config: &ImageProcessorConfig,
) -> Result<PixelPatches> {
    let frames = vec![image.clone(); config.temporal_patch_size.max(1)];
    preprocess_frames(&frames, device, config)
}

/// Frames are resized to the first frame's target size and padded with the last frame to
/// a multiple of the temporal patch size.
pub fn preprocess_frames(
    frames: &[DynamicImage],
    device: &Device,
    config: &ImageProcessorConfig,
) -> Result<PixelPatches> {
    let first = frames
        .first()
        .ok_or_else(|| anyhow!("at least one frame is required"))?;
    let (height, width) = smart_resize(
        first.height(),
        first.width(),
        config.factor(),
        config.min_pixels as u32,
        config.max_pixels as u32,
    )?;
    let temporal = config.temporal_patch_size.max(1);
    let padded_len = frames.len().div_ceil(temporal) * temporal;
    let mut normalised = Vec::with_capacity(padded_len);
    for frame in frames {
        let rgb = frame.to_rgb8();
        let resized = if rgb.dimensions() == (width, height) {
            rgb
        } else {
            resize_rgb_image(&rgb, width, height)?
        };
        normalised.push(normalise_rgb(&resized, config)?);
    }
    while normalised.len() < padded_len {
        let last = normalised
            .last()
            .cloned()
            .ok_or_else(|| anyhow!("no frame to pad with"))?;
        normalised.push(last);
    }

    let patch = config.patch_size;
    let grid = GridSpec::new(
        padded_len / temporal,
        height as usize / patch,
        width as usize / patch,
    );
    let data = flatten_patches(&normalised, width as usize, grid, config)?;
    let pixel_values =
        Tensor::from_vec(data, (grid.patch_count(), config.patch_dim()), device)?;
    Ok(PixelPatches {
        pixel_values,
        grid,
        height: height as usize,
        width: width as usize,
    })
}

fn normalise_rgb(image: &RgbImage, config: &ImageProcessorConfig) -> Result<Vec<f32>> {
    let mean = config.image_mean;
    let std = config.image_std;
    ensure!(
        mean.iter().all(|m| m.is_finite()) && std.iter().all(|s| s.is_finite() && *s > 0.0),
        "invalid mean/std for normalisation"
    );
    let mut data = Vec::with_capacity((image.width() * image.height() * 3) as usize);
    for pixel in image.pixels() {
        for (channel, &value) in pixel.0.iter().enumerate() {
            data.push((value as f32 * config.rescale_factor - mean[channel]) / std[channel]);
        }
    }
    Ok(data)
}

/// Patch order: temporal group, merge-block row, merge-block column, row within block,
/// column within block. Each patch is laid out channel, frame, y, x.
fn flatten_patches(
    frames: &[Vec<f32>],
    width: usize,
    grid: GridSpec,
    config: &ImageProcessorConfig,
) -> Result<Vec<f32>> {
    let (patch, merge, temporal) = (
        config.patch_size,
        config.merge_size,
        config.temporal_patch_size.max(1),
    );
    ensure!(
        grid.h % merge == 0 && grid.w % merge == 0,
        "patch grid {}x{} not divisible by merge size {merge}",
        grid.h,
        grid.w
    );
    let row_stride = width * 3;
    let mut out = Vec::with_capacity(grid.patch_count() * config.patch_dim());
    for gt in 0..grid.t {
        for bh in 0..grid.h / merge {
            for bw in 0..grid.w / merge {
                for mh in 0..merge {
                    for mw in 0..merge {
                        let (row, col) = (bh * merge + mh, bw * merge + mw);
                        for channel in 0..3 {
                            for t in 0..temporal {
                                let frame = &frames[gt * temporal + t];
                                for py in 0..patch {
                                    let y = row * patch + py;
                                    for px in 0..patch {
                                        let x = col * patch + px;
                                        out.push(frame[y * row_stride + x * 3 + channel]);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(out)
}

fn resize_rgb_image(image: &RgbImage, width: u32, height: u32) -> Result<RgbImage> {
    ensure!(width > 0 && height > 0, "target dimensions must be positive");
    let mut owned = image.clone().into_raw();
    let src = fir::images::Image::from_slice_u8(
        image.width(),
        image.height(),
        owned.as_mut_slice(),
        fir::PixelType::U8x3,
    )
    .context("failed to build fast_image_resize source image")?;
    let mut dst = fir::images::Image::new(width, height, fir::PixelType::U8x3);
    let options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::CatmullRom));
    fir::Resizer::new()
        .resize(&src, &mut dst, &options)
        .map_err(|err| anyhow!("fast_image_resize failed: {err}"))?;
    ImageBuffer::from_raw(width, height, dst.into_vec())
        .ok_or_else(|| anyhow!("failed to convert resized buffer into image"))
}

/// Round `(height, width)` to multiples of `factor` while keeping the pixel count within
/// `[min_pixels, max_pixels]` and the aspect ratio roughly intact.
pub fn smart_resize(
    height: u32,
    width: u32,
    factor: u32,
    min_pixels: u32,
    max_pixels: u32,
) -> Result<(u32, u32)> {
    let factor = factor.max(1) as f64;
    let (h, w) = (height.max(1) as f64, width.max(1) as f64);
    let aspect = h.max(w) / h.min(w);
    ensure!(aspect <= 200.0, "aspect ratio exceeds limit ({aspect})");
    let mut h_bar = ((h / factor).round() * factor).max(factor);
    let mut w_bar = ((w / factor).round() * factor).max(factor);
    let (min_pixels, max_pixels) = (min_pixels.max(1) as f64, max_pixels.max(1) as f64);
    if h_bar * w_bar > max_pixels {
        let beta = ((h * w) / max_pixels).sqrt();
        h_bar = (((h / beta) / factor).floor() * factor).max(factor);
        w_bar = (((w / beta) / factor).floor() * factor).max(factor);
    } else if h_bar * w_bar < min_pixels {
        let beta = (min_pixels / (h * w)).sqrt();
        h_bar = ((h * beta) / factor).ceil() * factor;
        w_bar = ((w * beta) / factor).ceil() * factor;
    }
    Ok((h_bar as u32, w_bar as u32))
}
