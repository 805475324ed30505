//! Weight initialization for the 3D ViT.
//!
//! The policy is applied once, after construction, over every variable in
//! the model's `VarMap`:
//!
//! - classification token, positional table and every linear weight:
//!   truncated normal, std 0.02, resampled beyond two standard deviations;
//! - every bias: zero;
//! - every normalization scale: one.
//!
//! Training stability of the ViT depends on this exact scheme, so it is kept
//! separate from candle's per-layer default initializers and overwrites them.

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::VarMap;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// Standard deviation shared by every randomly initialized tensor.
pub const INIT_STD: f64 = 0.02;

/// Sample a tensor from a normal truncated at `±2 * std` by rejection.
pub fn trunc_normal(
    shape: &[usize],
    std: f64,
    rng: &mut StdRng,
    device: &Device,
) -> Result<Tensor> {
    let normal = Normal::new(0f32, std as f32)
        .map_err(|e| candle_core::Error::Msg(format!("trunc_normal: {e}")))?;
    let bound = 2.0 * std as f32;
    let n: usize = shape.iter().product();
    let mut values = Vec::with_capacity(n);
    while values.len() < n {
        let sample = normal.sample(rng);
        if sample.abs() <= bound {
            values.push(sample);
        }
    }
    Tensor::from_vec(values, shape, device)
}

/// Overwrite every variable in `varmap` according to the init policy.
///
/// Deterministic for a given `seed`: variables are visited in name order.
pub fn reset_parameters(varmap: &mut VarMap, seed: u64) -> Result<()> {
    let mut entries: Vec<(String, Vec<usize>, DType, Device)> = {
        let data = varmap.data().lock().unwrap();
        data.iter()
            .map(|(name, var)| {
                (
                    name.clone(),
                    var.dims().to_vec(),
                    var.dtype(),
                    var.device().clone(),
                )
            })
            .collect()
    };
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut rng = StdRng::seed_from_u64(seed);
    for (name, dims, dtype, device) in entries {
        let is_norm_scale = name.contains("norm") && name.ends_with(".weight");
        let value = if name.ends_with(".bias") {
            Tensor::zeros(dims.as_slice(), dtype, &device)?
        } else if is_norm_scale {
            Tensor::ones(dims.as_slice(), dtype, &device)?
        } else {
            trunc_normal(&dims, INIT_STD, &mut rng, &device)?.to_dtype(dtype)?
        };
        varmap.set_one(&name, &value)?;
    }
    Ok(())
}
