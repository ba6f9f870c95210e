//! Placeholder lookup and visual feature scattering for a single sequence.

use anyhow::{Context, Result, ensure};
use candle_core::Tensor;
use tracing::debug;

use crate::error::VlmError;

/// Token ids reserved for visual placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaceholderTokens {
    pub image: i64,
    pub video: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl PlaceholderTokens {
    pub fn id_for(&self, kind: MediaKind) -> i64 {
        match kind {
            MediaKind::Image => self.image,
            MediaKind::Video => self.video,
        }
    }
}

/// Placeholder positions found in a token sequence, in ascending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderScan {
    pub kind: MediaKind,
    pub positions: Vec<usize>,
}

impl PlaceholderScan {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Find image placeholders; only when there are none, fall back to video placeholders.
///
/// Sequences mixing both kinds are scanned as image sequences and the video ids stay text.
pub fn find_placeholder_positions(token_ids: &[i64], tokens: PlaceholderTokens) -> PlaceholderScan {
    let scan = |id: i64| -> Vec<usize> {
        token_ids
            .iter()
            .enumerate()
            .filter_map(|(idx, &token)| (token == id).then_some(idx))
            .collect()
    };
    let image = scan(tokens.image);
    if !image.is_empty() {
        return PlaceholderScan {
            kind: MediaKind::Image,
            positions: image,
        };
    }
    let video = scan(tokens.video);
    if !video.is_empty() {
        return PlaceholderScan {
            kind: MediaKind::Video,
            positions: video,
        };
    }
    PlaceholderScan {
        kind: MediaKind::Image,
        positions: Vec::new(),
    }
}

/// Overwrite rows of `text` (`[1, L, D]`) at `positions` with the rows of `features`
/// (`[1, N, D]`), in order. All other rows are copied through untouched.
pub fn scatter_visual_features(
    text: &Tensor,
    positions: &[usize],
    features: &Tensor,
) -> Result<Tensor> {
    let (batch, seq_len, hidden) = text
        .dims3()
        .context("text embeddings must have shape [1, seq, hidden]")?;
    ensure!(batch == 1, "fusion handles a single sequence, got batch {batch}");
    let (feature_batch, feature_count, feature_hidden) = features
        .dims3()
        .context("visual features must have shape [1, N, hidden]")?;
    ensure!(
        feature_batch == 1,
        "visual features must carry a single batch row, got {feature_batch}"
    );
    if positions.len() != feature_count {
        return Err(VlmError::shape_mismatch(
            "placeholder fusion",
            format!("{} visual features", positions.len()),
            format!("{feature_count} visual features"),
        )
        .into());
    }
    if feature_hidden != hidden {
        return Err(
            VlmError::shape_mismatch("placeholder fusion width", hidden, feature_hidden).into(),
        );
    }
    ensure!(
        features.dtype() == text.dtype(),
        "visual features are {:?} but text embeddings are {:?}",
        features.dtype(),
        text.dtype()
    );
    ensure!(
        positions.windows(2).all(|pair| pair[0] < pair[1]),
        "placeholder positions must be strictly increasing"
    );
    if let Some(&last) = positions.last() {
        ensure!(
            last < seq_len,
            "placeholder position {last} outside sequence of {seq_len}"
        );
    }
    if positions.is_empty() {
        return Ok(text.clone());
    }

    let row = text.squeeze(0)?;
    let replacements = features.squeeze(0)?;
    let mut segments = Vec::new();
    let mut cursor = 0usize;
    let mut consumed = 0usize;
    let mut idx = 0usize;
    while idx < positions.len() {
        let start = positions[idx];
        let mut end = start + 1;
        idx += 1;
        while idx < positions.len() && positions[idx] == end {
            end += 1;
            idx += 1;
        }
        if start > cursor {
            segments.push(row.narrow(0, cursor, start - cursor)?);
        }
        let run = end - start;
        segments.push(replacements.narrow(0, consumed, run)?);
        consumed += run;
        cursor = end;
    }
    if cursor < seq_len {
        segments.push(row.narrow(0, cursor, seq_len - cursor)?);
    }
    let refs: Vec<&Tensor> = segments.iter().collect();
    Ok(Tensor::cat(&refs, 0)?.unsqueeze(0)?)
}

/// Find positions, validate the count, then scatter.
pub fn fuse(
    token_ids: &[i64],
    text: &Tensor,
    features: &Tensor,
    tokens: PlaceholderTokens,
) -> Result<Tensor> {
    let scan = find_placeholder_positions(token_ids, tokens);
    let feature_count = match features.dims() {
        &[_, count, _] => count,
        dims => {
            return Err(VlmError::shape_mismatch(
                "placeholder fusion",
                "visual features of rank 3 [1, N, hidden]",
                format!("rank {} {dims:?}", dims.len()),
            )
            .into());
        }
    };
    if scan.len() != feature_count {
        return Err(VlmError::shape_mismatch(
            "placeholder fusion",
            format!(
                "{} visual features ({} placeholders)",
                scan.len(),
                placeholder_name(scan.kind)
            ),
            format!("{feature_count} visual features"),
        )
        .into());
    }
    debug!(kind = ?scan.kind, count = scan.len(), "scattering visual features");
    scatter_visual_features(text, &scan.positions, features)
}

fn placeholder_name(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "image",
        MediaKind::Video => "video",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    const TOKENS: PlaceholderTokens = PlaceholderTokens { image: 9, video: 8 };

    fn text_embeddings(seq_len: usize, hidden: usize) -> Result<Tensor> {
        let values: Vec<f32> = (0..seq_len * hidden).map(|v| v as f32 * 0.5).collect();
        Ok(Tensor::from_vec(values, (1, seq_len, hidden), &Device::Cpu)?)
    }

    fn features(count: usize, hidden: usize) -> Result<Tensor> {
        let values: Vec<f32> = (0..count * hidden).map(|v| -(v as f32) - 1.0).collect();
        Ok(Tensor::from_vec(values, (1, count, hidden), &Device::Cpu)?)
    }

    fn assert_shape_mismatch(err: anyhow::Error) {
        assert!(
            err.downcast_ref::<VlmError>()
                .is_some_and(VlmError::is_shape_mismatch),
            "expected shape mismatch, got {err}"
        );
    }

    #[test]
    fn image_rows_land_in_placeholder_order() -> Result<()> {
        let ids = [1, 2, 9, 9, 9, 3];
        let text = text_embeddings(6, 2)?;
        let visual = features(3, 2)?;
        let fused = fuse(&ids, &text, &visual, TOKENS)?.to_vec3::<f32>()?;
        let text_rows = text.to_vec3::<f32>()?;
        let visual_rows = visual.to_vec3::<f32>()?;
        assert_eq!(fused[0][0], text_rows[0][0]);
        assert_eq!(fused[0][1], text_rows[0][1]);
        assert_eq!(fused[0][2], visual_rows[0][0]);
        assert_eq!(fused[0][3], visual_rows[0][1]);
        assert_eq!(fused[0][4], visual_rows[0][2]);
        assert_eq!(fused[0][5], text_rows[0][5]);
        Ok(())
    }

    #[test]
    fn text_rows_are_bit_identical_around_split_runs() -> Result<()> {
        let ids = [9, 1, 9, 9, 2, 3, 9];
        let text = text_embeddings(7, 3)?;
        let fused = fuse(&ids, &text, &features(4, 3)?, TOKENS)?.to_vec3::<f32>()?;
        let text_rows = text.to_vec3::<f32>()?;
        for idx in [1usize, 4, 5] {
            let expected: Vec<u32> = text_rows[0][idx].iter().map(|v| v.to_bits()).collect();
            let actual: Vec<u32> = fused[0][idx].iter().map(|v| v.to_bits()).collect();
            assert_eq!(actual, expected, "row {idx}");
        }
        assert_eq!(fused[0][6], vec![-10.0, -11.0, -12.0]);
        Ok(())
    }

    #[test]
    fn features_without_placeholders_are_rejected() -> Result<()> {
        let err = fuse(&[1, 2, 3], &text_embeddings(3, 2)?, &features(3, 2)?, TOKENS)
            .expect_err("no placeholders for three features");
        let message = err.to_string();
        assert!(message.contains("0 visual features"), "{message}");
        assert!(message.contains("3 visual features"), "{message}");
        assert_shape_mismatch(err);
        Ok(())
    }

    #[test]
    fn placeholders_without_features_are_rejected() -> Result<()> {
        let empty = Tensor::zeros((1, 0, 2), DType::F32, &Device::Cpu)?;
        let err = fuse(&[1, 9, 9], &text_embeddings(3, 2)?, &empty, TOKENS)
            .expect_err("two placeholders, no features");
        assert_shape_mismatch(err);
        Ok(())
    }

    #[test]
    fn count_mismatch_in_either_direction_is_rejected() -> Result<()> {
        let ids = [9, 9, 1];
        let text = text_embeddings(3, 2)?;
        for count in [1usize, 3] {
            let err = fuse(&ids, &text, &features(count, 2)?, TOKENS)
                .expect_err("count mismatch");
            assert_shape_mismatch(err);
        }
        Ok(())
    }

    #[test]
    fn unbatched_features_are_rejected_by_rank() -> Result<()> {
        let flat = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
        let err = fuse(&[1, 9, 9], &text_embeddings(3, 3)?, &flat, TOKENS)
            .expect_err("rank-2 features need the adapter first");
        let message = err.to_string();
        assert!(message.contains("rank 2 [2, 3]"), "{message}");
        assert_shape_mismatch(err);
        Ok(())
    }

    #[test]
    fn video_placeholders_are_used_when_no_image_placeholder_exists() -> Result<()> {
        let scan = find_placeholder_positions(&[1, 8, 8, 2], TOKENS);
        assert_eq!(scan.kind, MediaKind::Video);
        assert_eq!(scan.positions, vec![1, 2]);

        let mixed = find_placeholder_positions(&[9, 8, 8], TOKENS);
        assert_eq!(mixed.kind, MediaKind::Image);
        assert_eq!(mixed.positions, vec![0]);

        let fused = fuse(&[1, 8, 8, 2], &text_embeddings(4, 2)?, &features(2, 2)?, TOKENS)?;
        assert_eq!(fused.to_vec3::<f32>()?[0][2], vec![-3.0, -4.0]);
        Ok(())
    }

    #[test]
    fn empty_features_with_text_only_input_are_a_no_op() -> Result<()> {
        let text = text_embeddings(2, 2)?;
        let empty = Tensor::zeros((1, 0, 2), DType::F32, &Device::Cpu)?;
        let fused = fuse(&[1, 2], &text, &empty, TOKENS)?;
        assert_eq!(fused.to_vec3::<f32>()?, text.to_vec3::<f32>()?);
        Ok(())
    }
}
