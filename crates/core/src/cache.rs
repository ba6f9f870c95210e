use anyhow::{Context, Result, ensure};
use candle_core::{Tensor, shape::D};

/// Keys and values produced by one attention layer for the tokens of a single step.
///
/// Keys are kept transposed as `[batch, heads, head_dim, seq]` so attention can multiply
/// queries against them without another transpose; values are `[batch, heads, seq, head_dim]`.
#[derive(Debug, Clone)]
pub struct KvCacheChunk {
    pub key_t: Tensor,
    pub value: Tensor,
}

impl KvCacheChunk {
    pub fn new(key_t: Tensor, value: Tensor) -> Result<Self> {
        let (kb, kh, kd, ks) = key_t
            .dims4()
            .context("key chunk must be [batch, heads, head_dim, seq]")?;
        let (vb, vh, vs, vd) = value
            .dims4()
            .context("value chunk must be [batch, heads, seq, head_dim]")?;
        ensure!(
            (kb, kh, ks, kd) == (vb, vh, vs, vd),
            "key chunk {:?} and value chunk {:?} disagree",
            key_t.dims(),
            value.dims()
        );
        Ok(Self { key_t, value })
    }

    pub fn seq_len(&self) -> usize {
        self.value.dims()[2]
    }
}

/// Growable per-layer storage. Capacity doubles so appends copy only the new rows.
#[derive(Debug, Clone)]
pub struct KvCacheEntry {
    key_t: Tensor,
    value: Tensor,
    len: usize,
}

impl KvCacheEntry {
    fn from_chunk(chunk: KvCacheChunk) -> Result<Self> {
        let len = chunk.seq_len();
        Ok(Self {
            key_t: chunk.key_t.contiguous()?,
            value: chunk.value.contiguous()?,
            len,
        })
    }

    fn capacity(&self) -> usize {
        self.value.dims()[2]
    }

    fn grow(&mut self, required: usize) -> Result<()> {
        let capacity = self.capacity();
        if required <= capacity {
            return Ok(());
        }
        let mut target = capacity.max(1);
        while target < required {
            target *= 2;
        }
        let (batch, heads, _, head_dim) = self.value.dims4()?;
        let dtype = self.value.dtype();
        let device = self.value.device().clone();
        let key_t = Tensor::zeros((batch, heads, head_dim, target), dtype, &device)?;
        let value = Tensor::zeros((batch, heads, target, head_dim), dtype, &device)?;
        key_t.slice_set(&self.key_view()?.contiguous()?, D::Minus1, 0)?;
        value.slice_set(&self.value_view()?.contiguous()?, D::Minus2, 0)?;
        self.key_t = key_t;
        self.value = value;
        Ok(())
    }

    fn append(&mut self, chunk: &KvCacheChunk) -> Result<()> {
        let (batch, heads, _, head_dim) = self.value.dims4()?;
        let (cb, ch, _, cd) = chunk.value.dims4()?;
        ensure!(
            (cb, ch, cd) == (batch, heads, head_dim),
            "chunk heads/dims ({cb}, {ch}, {cd}) do not match cache ({batch}, {heads}, {head_dim})"
        );
        ensure!(
            chunk.value.dtype() == self.value.dtype(),
            "chunk dtype {:?} does not match cache dtype {:?}",
            chunk.value.dtype(),
            self.value.dtype()
        );
        let added = chunk.seq_len();
        if added == 0 {
            return Ok(());
        }
        self.grow(self.len + added)?;
        self.key_t
            .slice_set(&chunk.key_t.contiguous()?, D::Minus1, self.len)?;
        self.value
            .slice_set(&chunk.value.contiguous()?, D::Minus2, self.len)?;
        self.len += added;
        Ok(())
    }

    /// Cached keys, `[batch, heads, head_dim, len]`.
    pub fn key_view(&self) -> Result<Tensor> {
        Ok(self.key_t.narrow(D::Minus1, 0, self.len)?)
    }

    /// Cached values, `[batch, heads, len, head_dim]`.
    pub fn value_view(&self) -> Result<Tensor> {
        Ok(self.value.narrow(D::Minus2, 0, self.len)?)
    }

    pub fn seq_len(&self) -> usize {
        self.len
    }
}

/// Key/value cache for every layer of one decoding session.
///
/// The cache only grows: all layers must agree on the cached length once a step completes,
/// and a layer can never fall behind the longest one by more than the step in flight.
#[derive(Debug, Clone, Default)]
pub struct DynamicCache {
    layers: Vec<Option<KvCacheEntry>>,
    seq_len: Option<usize>,
}

impl DynamicCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_num_layers(num_layers: usize) -> Self {
        Self {
            layers: vec![None; num_layers],
            seq_len: None,
        }
    }

    pub fn get(&self, layer_idx: usize) -> Option<&KvCacheEntry> {
        self.layers.get(layer_idx).and_then(Option::as_ref)
    }

    /// Append a chunk to `layer_idx`, creating the layer slot when needed.
    pub fn append(&mut self, layer_idx: usize, chunk: KvCacheChunk) -> Result<()> {
        if layer_idx >= self.layers.len() {
            self.layers.resize_with(layer_idx + 1, || None);
        }
        let current = self.get(layer_idx).map(KvCacheEntry::seq_len).unwrap_or(0);
        let new_len = current + chunk.seq_len();
        if let Some(prev) = self.seq_len {
            ensure!(
                new_len >= prev,
                "cache seq_len decreased for layer {layer_idx}: {new_len} < {prev}"
            );
        }
        match self.layers[layer_idx].as_mut() {
            Some(entry) => entry.append(&chunk)?,
            None => self.layers[layer_idx] = Some(KvCacheEntry::from_chunk(chunk)?),
        }
        self.seq_len = Some(self.seq_len.map_or(new_len, |prev| prev.max(new_len)));
        Ok(())
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn ensure_layers(&mut self, total_layers: usize) {
        if self.layers.len() < total_layers {
            self.layers.resize_with(total_layers, || None);
        }
    }

    /// Number of cached tokens, `None` before the first append.
    pub fn seq_len(&self) -> Option<usize> {
        self.seq_len
    }

    pub fn is_empty(&self) -> bool {
        self.seq_len.unwrap_or(0) == 0
    }

    pub fn clear(&mut self) {
        self.layers.iter_mut().for_each(|entry| *entry = None);
        self.seq_len = None;
    }
}
