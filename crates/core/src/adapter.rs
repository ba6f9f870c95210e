use anyhow::Result;
use candle_core::{DType, Device, Tensor};

use crate::{
    error::VlmError,
    tensor::{cast, to_device},
};

/// Brings vision-encoder output into the layout fusion expects: `[1, N, D]` in the
/// language model's dtype and on its device.
#[derive(Debug, Clone)]
pub struct VisionFeatureAdapter {
    hidden_size: usize,
    dtype: DType,
    device: Device,
}

impl VisionFeatureAdapter {
    pub fn new(hidden_size: usize, dtype: DType, device: Device) -> Self {
        Self {
            hidden_size,
            dtype,
            device,
        }
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Accepts `[N, D]` or `[1, N, D]`; any other rank is a shape mismatch, as is a feature
    /// width that differs from the language hidden size.
    pub fn adapt(&self, features: &Tensor) -> Result<Tensor> {
        let features = match features.rank() {
            2 => features.unsqueeze(0)?,
            3 if features.dim(0)? == 1 => features.clone(),
            _ => {
                return Err(VlmError::shape_mismatch(
                    "vision feature adapter",
                    "[N, D] or [1, N, D]",
                    format!("{:?}", features.dims()),
                )
                .into());
            }
        };
        let width = features.dim(2)?;
        if width != self.hidden_size {
            return Err(VlmError::shape_mismatch(
                "vision feature width",
                self.hidden_size,
                width,
            )
            .into());
        }
        let features = to_device(&features, &self.device)?;
        cast(&features, self.dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_two_features_gain_a_batch_axis_and_target_dtype() -> Result<()> {
        let adapter = VisionFeatureAdapter::new(4, DType::F16, Device::Cpu);
        let features = Tensor::ones((3, 4), DType::F32, &Device::Cpu)?;
        let adapted = adapter.adapt(&features)?;
        assert_eq!(adapted.dims(), &[1, 3, 4]);
        assert_eq!(adapted.dtype(), DType::F16);
        Ok(())
    }

    #[test]
    fn batched_rank_three_features_pass_through() -> Result<()> {
        let adapter = VisionFeatureAdapter::new(4, DType::F32, Device::Cpu);
        let features = Tensor::ones((1, 5, 4), DType::F32, &Device::Cpu)?;
        assert_eq!(adapter.adapt(&features)?.dims(), &[1, 5, 4]);
        Ok(())
    }

    #[test]
    fn unsupported_ranks_and_widths_are_shape_mismatches() -> Result<()> {
        let adapter = VisionFeatureAdapter::new(4, DType::F32, Device::Cpu);
        for dims in [vec![12], vec![2, 3, 4], vec![1, 1, 3, 4], vec![3, 8]] {
            let features = Tensor::zeros(dims.as_slice(), DType::F32, &Device::Cpu)?;
            let err = adapter.adapt(&features).expect_err("shape must be rejected");
            assert!(
                err.downcast_ref::<VlmError>()
                    .is_some_and(VlmError::is_shape_mismatch),
                "unexpected error for {dims:?}: {err}"
            );
        }
        Ok(())
    }
}
