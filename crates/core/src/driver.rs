use anyhow::{Result, bail, ensure};
use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::{
    adapter::VisionFeatureAdapter,
    cache::DynamicCache,
    fusion::{PlaceholderTokens, fuse},
    position::{GridSpec, PositionIndex, PositionIndexer},
    tensor::token_ids_tensor,
};

/// Produces visual feature vectors for pixel inputs, one row per merged grid cell, in grid
/// order then raster order.
pub trait VisionEncoder {
    fn encode(&self, pixel_values: &Tensor, grids: &[GridSpec]) -> Result<Tensor>;
}

/// Language backbone driven by [`DecodeDriver`].
pub trait LanguageModel {
    /// `[1, L]` ids to `[1, L, hidden]` embeddings.
    fn embed(&self, token_ids: &Tensor) -> Result<Tensor>;

    /// Run the decoder over `embeddings` with explicit `[3, 1, L]` rotary positions and
    /// return `[1, L, vocab]` logits. When a cache is given the new keys/values are
    /// appended to it.
    fn forward(
        &self,
        embeddings: &Tensor,
        position_ids: &Tensor,
        cache: Option<&mut DynamicCache>,
    ) -> Result<Tensor>;

    fn new_cache(&self) -> DynamicCache;
    fn hidden_size(&self) -> usize;
    fn dtype(&self) -> DType;
    fn device(&self) -> &Device;
}

/// Pixel input for one step: preprocessed patches plus the grid of every image or video.
#[derive(Debug, Clone)]
pub struct VisualInput {
    pub pixel_values: Tensor,
    pub grids: Vec<GridSpec>,
    /// Seconds between temporal grid steps, one entry per video grid.
    pub seconds_per_grid: Vec<f32>,
}

impl VisualInput {
    pub fn new(pixel_values: Tensor, grids: Vec<GridSpec>) -> Self {
        Self {
            pixel_values,
            grids,
            seconds_per_grid: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NoCache,
    Primed,
    Done,
}

/// One generation session: its key/value cache and the rotary offset left behind by visual
/// segments, whose positions advance by grid extent rather than token count.
#[derive(Debug, Clone)]
pub struct DecodeSession {
    cache: DynamicCache,
    rope_delta: i64,
    done: bool,
}

impl DecodeSession {
    pub fn new(cache: DynamicCache) -> Self {
        Self {
            cache,
            rope_delta: 0,
            done: false,
        }
    }

    pub fn state(&self) -> SessionState {
        if self.done {
            SessionState::Done
        } else if self.cache.is_empty() {
            SessionState::NoCache
        } else {
            SessionState::Primed
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.seq_len().unwrap_or(0)
    }

    pub fn rope_delta(&self) -> i64 {
        self.rope_delta
    }

    pub fn cache(&self) -> &DynamicCache {
        &self.cache
    }

    /// Mark the session finished; further steps are rejected until [`reset`](Self::reset).
    pub fn finish(&mut self) {
        self.done = true;
    }

    pub fn reset(&mut self) {
        self.cache.clear();
        self.rope_delta = 0;
        self.done = false;
    }
}

/// Turns token ids and optional pixels into logits: embed, encode, adapt, fuse, index
/// positions, then run the language backbone.
pub struct DecodeDriver<V, L> {
    vision: V,
    language: L,
    placeholders: PlaceholderTokens,
    indexer: PositionIndexer,
    adapter: VisionFeatureAdapter,
}

impl<V: VisionEncoder, L: LanguageModel> DecodeDriver<V, L> {
    pub fn new(
        vision: V,
        language: L,
        placeholders: PlaceholderTokens,
        spatial_merge_size: usize,
        tokens_per_second: Option<f32>,
    ) -> Self {
        let adapter = VisionFeatureAdapter::new(
            language.hidden_size(),
            language.dtype(),
            language.device().clone(),
        );
        let indexer = PositionIndexer::new(placeholders, spatial_merge_size, tokens_per_second);
        Self {
            vision,
            language,
            placeholders,
            indexer,
            adapter,
        }
    }

    pub fn vision(&self) -> &V {
        &self.vision
    }

    pub fn language(&self) -> &L {
        &self.language
    }

    pub fn placeholders(&self) -> PlaceholderTokens {
        self.placeholders
    }

    pub fn indexer(&self) -> &PositionIndexer {
        &self.indexer
    }

    pub fn new_session(&self) -> DecodeSession {
        DecodeSession::new(self.language.new_cache())
    }

    /// Run one step. Without a session the forward pass is uncached and positions start at 0.
    pub fn step(
        &self,
        token_ids: &[i64],
        visual: Option<&VisualInput>,
        mut session: Option<&mut DecodeSession>,
    ) -> Result<Tensor> {
        ensure!(!token_ids.is_empty(), "step requires at least one token");
        let (cached_len, rope_delta) = match session.as_deref() {
            Some(session) if session.done => {
                bail!("decode session is finished; reset it before stepping again")
            }
            Some(session) => (session.cached_len(), session.rope_delta),
            None => (0, 0),
        };
        let start = cached_len as i64 + rope_delta;
        let seq_len = token_ids.len();

        let ids = token_ids_tensor(token_ids, self.language.device())?;
        let text = self.language.embed(&ids)?;
        let (embeddings, index) = match visual {
            Some(visual) => {
                let features = self.vision.encode(&visual.pixel_values, &visual.grids)?;
                let features = self.adapter.adapt(&features)?;
                let fused = fuse(token_ids, &text, &features, self.placeholders)?;
                let index = self.indexer.index(
                    start,
                    token_ids,
                    &visual.grids,
                    &visual.seconds_per_grid,
                )?;
                (fused, index)
            }
            None => (text, PositionIndex::text(start, seq_len)),
        };
        let position_ids = index.to_tensor(self.language.device())?;
        debug!(
            seq_len,
            cached_len,
            start,
            next = index.next,
            visual = visual.is_some(),
            "decode step"
        );

        let logits = self.language.forward(
            &embeddings,
            &position_ids,
            session.as_deref_mut().map(|session| &mut session.cache),
        )?;
        if let Some(session) = session {
            session.rope_delta = index.next - (cached_len + seq_len) as i64;
        }
        Ok(logits)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::{cache::KvCacheChunk, error::VlmError};

    const TOKENS: PlaceholderTokens = PlaceholderTokens { image: 9, video: 8 };
    const HIDDEN: usize = 2;
    const VOCAB: usize = 10;

    struct PassthroughVision;

    impl VisionEncoder for PassthroughVision {
        fn encode(&self, pixel_values: &Tensor, _grids: &[GridSpec]) -> Result<Tensor> {
            Ok(pixel_values.clone())
        }
    }

    struct RecordingLm {
        table: Tensor,
        device: Device,
        seen_embeddings: RefCell<Vec<Tensor>>,
        seen_positions: RefCell<Vec<Vec<Vec<i64>>>>,
    }

    impl RecordingLm {
        fn new() -> Result<Self> {
            let device = Device::Cpu;
            let values: Vec<f32> = (0..VOCAB * HIDDEN).map(|v| v as f32).collect();
            Ok(Self {
                table: Tensor::from_vec(values, (VOCAB, HIDDEN), &device)?,
                device,
                seen_embeddings: RefCell::new(Vec::new()),
                seen_positions: RefCell::new(Vec::new()),
            })
        }
    }

    impl LanguageModel for RecordingLm {
        fn embed(&self, token_ids: &Tensor) -> Result<Tensor> {
            crate::tensor::gather_token_embeddings(&self.table, token_ids)
        }

        fn forward(
            &self,
            embeddings: &Tensor,
            position_ids: &Tensor,
            cache: Option<&mut DynamicCache>,
        ) -> Result<Tensor> {
            let (_, seq_len, _) = embeddings.dims3()?;
            if let Some(cache) = cache {
                let key_t = Tensor::zeros((1, 1, HIDDEN, seq_len), DType::F32, &self.device)?;
                let value = Tensor::zeros((1, 1, seq_len, HIDDEN), DType::F32, &self.device)?;
                cache.append(0, KvCacheChunk::new(key_t, value)?)?;
            }
            self.seen_embeddings.borrow_mut().push(embeddings.clone());
            let positions = position_ids.squeeze(1)?.to_vec2::<i64>()?;
            self.seen_positions.borrow_mut().push(positions);
            Ok(embeddings
                .squeeze(0)?
                .matmul(&self.table.t()?)?
                .unsqueeze(0)?)
        }

        fn new_cache(&self) -> DynamicCache {
            DynamicCache::with_num_layers(1)
        }

        fn hidden_size(&self) -> usize {
            HIDDEN
        }

        fn dtype(&self) -> DType {
            DType::F32
        }

        fn device(&self) -> &Device {
            &self.device
        }
    }

    fn driver() -> Result<DecodeDriver<PassthroughVision, RecordingLm>> {
        Ok(DecodeDriver::new(
            PassthroughVision,
            RecordingLm::new()?,
            TOKENS,
            1,
            None,
        ))
    }

    fn visual_rows(rows: usize, grid: GridSpec) -> Result<VisualInput> {
        let values: Vec<f32> = (0..rows * HIDDEN).map(|v| 100.0 + v as f32).collect();
        let pixels = Tensor::from_vec(values, (rows, HIDDEN), &Device::Cpu)?;
        Ok(VisualInput::new(pixels, vec![grid]))
    }

    #[test]
    fn image_features_replace_placeholders_before_the_backbone() -> Result<()> {
        let driver = driver()?;
        let visual = visual_rows(3, GridSpec::new(1, 1, 3))?;
        let logits = driver.step(&[1, 2, 9, 9, 9, 3], Some(&visual), None)?;
        assert_eq!(logits.dims(), &[1, 6, VOCAB]);

        let fused = driver.language().seen_embeddings.borrow()[0].to_vec3::<f32>()?;
        assert_eq!(fused[0][0], vec![2.0, 3.0]);
        assert_eq!(fused[0][1], vec![4.0, 5.0]);
        assert_eq!(fused[0][2], vec![100.0, 101.0]);
        assert_eq!(fused[0][3], vec![102.0, 103.0]);
        assert_eq!(fused[0][4], vec![104.0, 105.0]);
        assert_eq!(fused[0][5], vec![6.0, 7.0]);
        Ok(())
    }

    #[test]
    fn pixels_without_placeholders_are_a_shape_mismatch() -> Result<()> {
        let driver = driver()?;
        let visual = visual_rows(3, GridSpec::new(1, 1, 3))?;
        let err = driver
            .step(&[1, 2, 3], Some(&visual), None)
            .expect_err("three features, zero placeholders");
        assert!(
            err.downcast_ref::<VlmError>()
                .is_some_and(VlmError::is_shape_mismatch)
        );
        assert!(driver.language().seen_embeddings.borrow().is_empty());
        Ok(())
    }

    #[test]
    fn cache_grows_by_the_tokens_of_each_step() -> Result<()> {
        let driver = driver()?;
        let mut session = driver.new_session();
        assert_eq!(session.state(), SessionState::NoCache);

        driver.step(&[1, 2, 3, 4], None, Some(&mut session))?;
        assert_eq!(session.cached_len(), 4);
        assert_eq!(session.state(), SessionState::Primed);

        driver.step(&[5, 6], None, Some(&mut session))?;
        assert_eq!(session.cached_len(), 6);

        let positions = driver.language().seen_positions.borrow();
        assert_eq!(positions[1][0], vec![4, 5]);
        Ok(())
    }

    #[test]
    fn decode_positions_continue_after_a_visual_segment() -> Result<()> {
        let driver = driver()?;
        let mut session = driver.new_session();
        let visual = visual_rows(4, GridSpec::new(1, 2, 2))?;
        driver.step(&[1, 2, 9, 9, 9, 9, 3], Some(&visual), Some(&mut session))?;
        // Text 0,1; grid rows/cols 2..=3; trailing text at 4.
        assert_eq!(session.rope_delta(), -2);

        driver.step(&[4], None, Some(&mut session))?;
        let positions = driver.language().seen_positions.borrow();
        assert_eq!(positions[0][1], vec![0, 1, 2, 2, 3, 3, 4]);
        assert_eq!(positions[0][2], vec![0, 1, 2, 3, 2, 3, 4]);
        assert_eq!(positions[1], vec![vec![5], vec![5], vec![5]]);
        assert_eq!(session.cached_len(), 8);
        Ok(())
    }

    #[test]
    fn finished_sessions_reject_steps_until_reset() -> Result<()> {
        let driver = driver()?;
        let mut session = driver.new_session();
        driver.step(&[1], None, Some(&mut session))?;
        session.finish();
        assert_eq!(session.state(), SessionState::Done);
        let err = driver
            .step(&[2], None, Some(&mut session))
            .expect_err("finished session");
        assert!(err.to_string().contains("finished"));

        session.reset();
        assert_eq!(session.state(), SessionState::NoCache);
        driver.step(&[2], None, Some(&mut session))?;
        assert_eq!(session.cached_len(), 1);
        Ok(())
    }
}
