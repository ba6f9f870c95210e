use anyhow::{Result, ensure};
use candle_core::{DType, Device, Tensor};

/// Look up rows of an embedding table.
///
/// `table` is `[vocab, hidden]` and `ids` is `[batch, seq]` (any integer dtype). Returns
/// `[batch, seq, hidden]` in the table's dtype.
pub fn gather_token_embeddings(table: &Tensor, ids: &Tensor) -> Result<Tensor> {
    ensure!(
        ids.rank() == 2,
        "token ids must have shape [batch, seq], got rank {}",
        ids.rank()
    );
    let (vocab, hidden) = table.dims2()?;
    let (batch, seq_len) = ids.dims2()?;
    let flat = cast(ids, DType::U32)?.reshape(batch * seq_len)?;
    if batch * seq_len > 0 {
        let max_id = flat.max(0)?.to_scalar::<u32>()? as usize;
        ensure!(
            max_id < vocab,
            "token id {max_id} out of range for vocabulary of {vocab}"
        );
    }
    let rows = table.index_select(&flat, 0)?;
    Ok(rows.reshape((batch, seq_len, hidden))?)
}

/// Build a `[1, seq]` id tensor from host token ids.
pub fn token_ids_tensor(ids: &[i64], device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_slice(ids, (1, ids.len()), device)?)
}

/// Cast only when the dtype differs, avoiding a copy otherwise.
pub fn cast(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        Ok(tensor.to_dtype(dtype)?)
    }
}

/// Move to `device` only when the tensor lives elsewhere.
pub fn to_device(tensor: &Tensor, device: &Device) -> Result<Tensor> {
    if tensor.device().same_device(device) {
        Ok(tensor.clone())
    } else {
        Ok(tensor.to_device(device)?)
    }
}
