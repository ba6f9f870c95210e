use anyhow::{Result, ensure};
use candle_core::{Tensor, shape::D};

use super::LinearWeights;

/// `x W^T + b` over the last axis of a tensor of any rank >= 2.
pub fn apply_linear(input: &Tensor, weights: &LinearWeights) -> Result<Tensor> {
    let dims = input.dims().to_vec();
    let in_dim = *dims.last().unwrap_or(&0);
    ensure!(
        in_dim == weights.in_dim,
        "linear weight expects input dim {} got {}",
        weights.in_dim,
        in_dim
    );
    let rows: usize = dims[..dims.len() - 1].iter().product();
    let flat = input.reshape((rows, in_dim))?;
    let out = weights.matmul_2d(&flat)?;
    let mut out_dims = dims;
    if let Some(last) = out_dims.last_mut() {
        *last = weights.out_dim;
    }
    Ok(out.reshape(out_dims)?)
}

pub fn rotate_half(tensor: &Tensor) -> Result<Tensor> {
    let last = tensor.dim(D::Minus1)?;
    ensure!(
        last % 2 == 0,
        "rotate_half expects even hidden size, got {last}"
    );
    let half = last / 2;
    let first = tensor.narrow(D::Minus1, 0, half)?;
    let second = tensor.narrow(D::Minus1, half, half)?;
    Ok(Tensor::cat(&[second.neg()?, first], D::Minus1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn rotate_half_swaps_and_negates() -> Result<()> {
        let x = Tensor::new(&[[1f32, 2., 3., 4.]], &Device::Cpu)?;
        assert_eq!(rotate_half(&x)?.to_vec2::<f32>()?, vec![vec![-3., -4., 1., 2.]]);
        Ok(())
    }

    #[test]
    fn linear_keeps_leading_axes() -> Result<()> {
        let device = Device::Cpu;
        let weights = LinearWeights::new(
            Tensor::new(&[[1f32, 0.], [0., 2.], [1., 1.]], &device)?,
            Some(Tensor::new(&[0f32, 0., 10.], &device)?),
        )?;
        let input = Tensor::new(&[[[1f32, 2.], [3., 4.]]], &device)?;
        let out = apply_linear(&input, &weights)?;
        assert_eq!(out.dims(), &[1, 2, 3]);
        assert_eq!(out.to_vec3::<f32>()?[0][1], vec![3., 8., 17.]);
        Ok(())
    }
}
