use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use qwen_vl_core::cache::{DynamicCache, KvCacheChunk};

fn make_chunk(device: &Device, heads: usize, seq: usize, dim: usize) -> Result<KvCacheChunk> {
    let key_t = Tensor::zeros((1, heads, dim, seq), DType::F32, device)?;
    let value = Tensor::zeros((1, heads, seq, dim), DType::F32, device)?;
    KvCacheChunk::new(key_t, value)
}

fn filled_chunk(device: &Device, seq: usize, start: f32) -> Result<KvCacheChunk> {
    let values: Vec<f32> = (0..seq * 2).map(|v| start + v as f32).collect();
    let value = Tensor::from_vec(values, (1, 1, seq, 2), device)?;
    let key_t = value.transpose(2, 3)?.contiguous()?;
    KvCacheChunk::new(key_t, value)
}

#[test]
fn layers_are_created_on_demand() -> Result<()> {
    let device = Device::Cpu;
    let mut cache = DynamicCache::new();
    cache.append(1, make_chunk(&device, 2, 3, 4)?)?;
    assert_eq!(cache.num_layers(), 2);
    assert!(cache.get(0).is_none());
    let entry = cache.get(1).expect("layer 1 populated");
    assert_eq!(entry.seq_len(), 3);
    assert_eq!(cache.seq_len(), Some(3));
    Ok(())
}

#[test]
fn incompatible_heads_are_rejected() -> Result<()> {
    let device = Device::Cpu;
    let mut cache = DynamicCache::with_num_layers(1);
    cache.append(0, make_chunk(&device, 2, 3, 4)?)?;
    let err = cache
        .append(0, make_chunk(&device, 3, 1, 4)?)
        .expect_err("head count differs");
    assert!(err.to_string().contains("chunk heads"));
    Ok(())
}

#[test]
fn mismatched_key_and_value_chunks_are_rejected() -> Result<()> {
    let device = Device::Cpu;
    let key_t = Tensor::zeros((1, 2, 4, 3), DType::F32, &device)?;
    let value = Tensor::zeros((1, 2, 5, 4), DType::F32, &device)?;
    assert!(KvCacheChunk::new(key_t, value).is_err());
    Ok(())
}

#[test]
fn sequence_length_tracks_prefill_and_decode() -> Result<()> {
    let device = Device::Cpu;
    let mut cache = DynamicCache::with_num_layers(3);
    let prefill = make_chunk(&device, 2, 3, 4)?;
    cache.append(0, prefill.clone())?;
    cache.append(1, prefill)?;
    assert_eq!(cache.seq_len(), Some(3));

    let step = make_chunk(&device, 2, 1, 4)?;
    cache.append(0, step.clone())?;
    assert_eq!(cache.seq_len(), Some(4));

    let err = cache
        .append(2, make_chunk(&device, 2, 2, 4)?)
        .expect_err("layer 2 would fall behind");
    assert!(err.to_string().contains("seq_len decreased"));

    cache.append(1, step)?;
    assert_eq!(cache.seq_len(), Some(4));
    Ok(())
}

#[test]
fn appended_rows_survive_capacity_growth() -> Result<()> {
    let device = Device::Cpu;
    let mut cache = DynamicCache::with_num_layers(1);
    cache.append(0, filled_chunk(&device, 2, 0.0)?)?;
    cache.append(0, filled_chunk(&device, 1, 10.0)?)?;
    cache.append(0, filled_chunk(&device, 3, 20.0)?)?;

    let entry = cache.get(0).expect("layer 0 populated");
    assert_eq!(entry.seq_len(), 6);
    let values = entry.value_view()?.squeeze(0)?.squeeze(0)?.to_vec2::<f32>()?;
    assert_eq!(values[0], vec![0.0, 1.0]);
    assert_eq!(values[1], vec![2.0, 3.0]);
    assert_eq!(values[2], vec![10.0, 11.0]);
    assert_eq!(values[5], vec![24.0, 25.0]);
    let keys = entry.key_view()?;
    assert_eq!(keys.dims(), &[1, 1, 2, 6]);
    let keys = keys.squeeze(0)?.squeeze(0)?.to_vec2::<f32>()?;
    assert_eq!(keys[1][2], 11.0);
    Ok(())
}

#[test]
fn clear_empties_every_layer() -> Result<()> {
    let device = Device::Cpu;
    let mut cache = DynamicCache::with_num_layers(2);
    cache.append(0, make_chunk(&device, 1, 2, 2)?)?;
    assert!(!cache.is_empty());
    cache.clear();
    assert!(cache.is_empty());
    assert!(cache.seq_len().is_none());
    assert!(cache.get(0).is_none());
    Ok(())
}
