//! Three-axis (temporal, row, column) rotary positions for mixed text/visual sequences.

use anyhow::{Result, ensure};
use candle_core::{Device, Tensor};

use crate::{
    error::VlmError,
    fusion::{MediaKind, PlaceholderTokens, find_placeholder_positions},
};

/// Patch grid an image or video was encoded with, before spatial merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridSpec {
    pub t: usize,
    pub h: usize,
    pub w: usize,
}

impl GridSpec {
    pub const fn new(t: usize, h: usize, w: usize) -> Self {
        Self { t, h, w }
    }

    /// Grid seen by the language model once `merge x merge` patches collapse into one token.
    pub fn merged(&self, merge: usize) -> Result<Self> {
        ensure!(merge > 0, "spatial merge size must be positive");
        ensure!(
            self.h % merge == 0 && self.w % merge == 0,
            "grid {}x{} is not divisible by merge size {merge}",
            self.h,
            self.w
        );
        Ok(Self::new(self.t, self.h / merge, self.w / merge))
    }

    pub fn token_count(&self, merge: usize) -> Result<usize> {
        let merged = self.merged(merge)?;
        Ok(merged.t * merged.h * merged.w)
    }

    pub fn patch_count(&self) -> usize {
        self.t * self.h * self.w
    }
}

/// Per-token coordinates along the three rotary axes, plus the first free index after them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PositionIndex {
    pub temporal: Vec<i64>,
    pub height: Vec<i64>,
    pub width: Vec<i64>,
    pub next: i64,
}

impl PositionIndex {
    /// Plain text positions `start..start + len` broadcast over all axes.
    pub fn text(start: i64, len: usize) -> Self {
        let mut index = Self {
            next: start,
            ..Self::default()
        };
        index.push_text(len);
        index
    }

    pub fn len(&self) -> usize {
        self.temporal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.temporal.is_empty()
    }

    fn push_text(&mut self, len: usize) {
        for offset in 0..len as i64 {
            let value = self.next + offset;
            self.temporal.push(value);
            self.height.push(value);
            self.width.push(value);
        }
        self.next += len as i64;
    }

    fn push_grid(&mut self, grid: GridSpec, temporal_stride: Option<f32>) {
        let base = self.next;
        let plane = grid.h * grid.w;
        let mut max_coord = 0i64;
        for i in 0..grid.t * plane {
            let frame = (i / plane) as i64;
            let t = match temporal_stride {
                Some(stride) => (frame as f32 * stride).floor() as i64,
                None => frame,
            };
            let h = ((i % plane) / grid.w) as i64;
            let w = ((i % plane) % grid.w) as i64;
            self.temporal.push(base + t);
            self.height.push(base + h);
            self.width.push(base + w);
            max_coord = max_coord.max(t).max(h).max(w);
        }
        self.next = base + max_coord + 1;
    }

    /// `[3, 1, L]` i64 tensor in axis order temporal, row, column.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let len = self.len();
        let mut flat = Vec::with_capacity(3 * len);
        flat.extend_from_slice(&self.temporal);
        flat.extend_from_slice(&self.height);
        flat.extend_from_slice(&self.width);
        Ok(Tensor::from_vec(flat, (3, 1, len), device)?)
    }
}

/// Computes [`PositionIndex`] for sequences whose placeholder runs are described by grids.
#[derive(Debug, Clone)]
pub struct PositionIndexer {
    placeholders: PlaceholderTokens,
    spatial_merge_size: usize,
    tokens_per_second: Option<f32>,
}

impl PositionIndexer {
    /// `tokens_per_second` enables temporal scaling of video segments by their real-world
    /// frame spacing; without it every grid step advances the temporal axis by one.
    pub fn new(
        placeholders: PlaceholderTokens,
        spatial_merge_size: usize,
        tokens_per_second: Option<f32>,
    ) -> Self {
        Self {
            placeholders,
            spatial_merge_size,
            tokens_per_second,
        }
    }

    pub fn spatial_merge_size(&self) -> usize {
        self.spatial_merge_size
    }

    /// Walk `token_ids` once, starting the running index at `start`.
    ///
    /// Each grid consumes the next `T * (H/m) * (W/m)` placeholder tokens, so grids may sit
    /// back to back inside one run. Vision start/end markers are ordinary text.
    /// `seconds_per_grid` gives the temporal spacing per video grid (1.0 when absent).
    pub fn index(
        &self,
        start: i64,
        token_ids: &[i64],
        grids: &[GridSpec],
        seconds_per_grid: &[f32],
    ) -> Result<PositionIndex> {
        let kind = find_placeholder_positions(token_ids, self.placeholders).kind;
        let placeholder = self.placeholders.id_for(kind);
        let mut index = PositionIndex {
            next: start,
            ..PositionIndex::default()
        };
        index.temporal.reserve(token_ids.len());
        index.height.reserve(token_ids.len());
        index.width.reserve(token_ids.len());

        let mut grid_iter = grids.iter().enumerate();
        let mut cursor = 0usize;
        while cursor < token_ids.len() {
            let Some(offset) = token_ids[cursor..].iter().position(|&id| id == placeholder)
            else {
                index.push_text(token_ids.len() - cursor);
                break;
            };
            index.push_text(offset);
            let span_start = cursor + offset;
            let Some((grid_idx, grid)) = grid_iter.next() else {
                return Err(VlmError::shape_mismatch(
                    "position index",
                    format!("a grid for the placeholder run at token {span_start}"),
                    format!("{} grids", grids.len()),
                )
                .into());
            };
            let merged = grid.merged(self.spatial_merge_size)?;
            let span = merged.t * merged.h * merged.w;
            let run = token_ids[span_start..]
                .iter()
                .take_while(|&&id| id == placeholder)
                .count();
            if run < span {
                return Err(VlmError::shape_mismatch(
                    "position index",
                    format!(
                        "{span} placeholder tokens for grid {}x{}x{}",
                        grid.t, grid.h, grid.w
                    ),
                    format!("{run} placeholder tokens at {span_start}"),
                )
                .into());
            }
            index.push_grid(merged, self.temporal_stride(kind, seconds_per_grid, grid_idx));
            cursor = span_start + span;
        }

        let unused = grid_iter.len();
        if unused != 0 {
            return Err(VlmError::shape_mismatch(
                "position index",
                format!("{} grids for the placeholder runs", grids.len() - unused),
                format!("{} grids supplied", grids.len()),
            )
            .into());
        }
        Ok(index)
    }

    fn temporal_stride(
        &self,
        kind: MediaKind,
        seconds_per_grid: &[f32],
        grid_idx: usize,
    ) -> Option<f32> {
        match (kind, self.tokens_per_second) {
            (MediaKind::Video, Some(tokens_per_second)) => {
                let seconds = seconds_per_grid.get(grid_idx).copied().unwrap_or(1.0);
                Some(seconds * tokens_per_second)
            }
            _ => None,
        }
    }
}
