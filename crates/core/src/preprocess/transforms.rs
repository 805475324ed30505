//! Pure `Volume → Volume` transform steps.
//!
//! Each step returns a new volume; the chain in
//! [`Preprocessor`](super::Preprocessor) owns their order. Axis convention
//! throughout: `data` axes `[0, 1, 2]` are (depth, height, width) for the
//! purposes of target shapes, i.e. the voxel axes in storage order after
//! reorientation.

use ndarray::{Array3, Axis};

use crate::preprocess::PreprocessError;
use crate::volume::{self, Volume};

/// Permute and flip voxel axes so the volume matches `target` axis codes
/// (e.g. "LPS"), updating the affine and spacing to stay consistent.
pub fn reorient(vol: &Volume, target: &str) -> Result<Volume, PreprocessError> {
    let current = volume::dominant_axes(&vol.affine).ok_or_else(|| {
        PreprocessError::Orientation {
            reason: "degenerate affine, cannot determine axis directions".to_string(),
        }
    })?;
    let wanted = volume::parse_axcodes(target).ok_or_else(|| PreprocessError::Orientation {
        reason: format!("invalid target orientation code {target:?}"),
    })?;

    let mut perm = [0usize; 3];
    let mut flip = [false; 3];
    for (slot, (world_axis, sign)) in wanted.iter().enumerate() {
        // dominant_axes guarantees each world axis is claimed exactly once.
        let j = (0..3)
            .find(|&j| current[j].0 == *world_axis)
            .ok_or_else(|| PreprocessError::Orientation {
                reason: format!("no voxel axis maps to world axis {world_axis}"),
            })?;
        perm[slot] = j;
        flip[slot] = current[j].1 != *sign;
    }

    let mut data = vol.data.clone();
    let mut affine = vol.affine;
    for slot in 0..3 {
        if flip[slot] {
            let j = perm[slot];
            data.invert_axis(Axis(j));
            let extent = vol.data.shape()[j] as f32;
            for row in 0..3 {
                affine[row][3] += affine[row][j] * (extent - 1.0);
                affine[row][j] = -affine[row][j];
            }
        }
    }

    let data = data.permuted_axes(perm).as_standard_layout().to_owned();
    let mut out_affine = [[0.0f32; 4]; 4];
    out_affine[3][3] = 1.0;
    let mut out_spacing = [0.0f32; 3];
    for slot in 0..3 {
        let j = perm[slot];
        for row in 0..3 {
            out_affine[row][slot] = affine[row][j];
        }
        out_spacing[slot] = vol.spacing[j];
    }
    for row in 0..3 {
        out_affine[row][3] = affine[row][3];
    }

    Ok(Volume::new(data, out_spacing, out_affine))
}

fn src_coord(o: usize, n_out: usize, n_in: usize) -> f32 {
    // Corner-aligned sampling: first and last output samples coincide with
    // the first and last input samples.
    if n_out <= 1 || n_in <= 1 {
        0.0
    } else {
        o as f32 * (n_in - 1) as f32 / (n_out - 1) as f32
    }
}

/// Trilinear interpolation onto a new grid, corner-aligned.
pub fn resample_trilinear(data: &Array3<f32>, n_out: [usize; 3]) -> Array3<f32> {
    let (nx, ny, nz) = data.dim();
    Array3::from_shape_fn((n_out[0], n_out[1], n_out[2]), |(ox, oy, oz)| {
        let fx = src_coord(ox, n_out[0], nx);
        let fy = src_coord(oy, n_out[1], ny);
        let fz = src_coord(oz, n_out[2], nz);
        let (x0, y0, z0) = (fx.floor() as usize, fy.floor() as usize, fz.floor() as usize);
        let (x1, y1, z1) = ((x0 + 1).min(nx - 1), (y0 + 1).min(ny - 1), (z0 + 1).min(nz - 1));
        let (tx, ty, tz) = (fx - x0 as f32, fy - y0 as f32, fz - z0 as f32);

        let lerp = |a: f32, b: f32, t: f32| a + (b - a) * t;
        let c00 = lerp(data[[x0, y0, z0]], data[[x1, y0, z0]], tx);
        let c10 = lerp(data[[x0, y1, z0]], data[[x1, y1, z0]], tx);
        let c01 = lerp(data[[x0, y0, z1]], data[[x1, y0, z1]], tx);
        let c11 = lerp(data[[x0, y1, z1]], data[[x1, y1, z1]], tx);
        lerp(lerp(c00, c10, ty), lerp(c01, c11, ty), tz)
    })
}

/// Interpolate the volume onto `target` voxel spacing (mm). The new extent
/// per axis is `round(n * spacing / target)`, at least 1.
pub fn resample_to_spacing(vol: &Volume, target: [f32; 3]) -> Volume {
    let (nx, ny, nz) = vol.shape();
    let n_in = [nx, ny, nz];
    let mut n_out = [0usize; 3];
    for a in 0..3 {
        n_out[a] = (n_in[a] as f32 * vol.spacing[a] / target[a]).round().max(1.0) as usize;
    }
    let data = resample_trilinear(&vol.data, n_out);

    let mut affine = vol.affine;
    for col in 0..3 {
        let scale = target[col] / vol.spacing[col];
        for row in 0..3 {
            affine[row][col] *= scale;
        }
    }
    Volume::new(data, target, affine)
}

/// True when every axis already matches the target spacing to within `tol`.
pub fn spacing_matches(vol: &Volume, target: [f32; 3], tol: f32) -> bool {
    vol.spacing
        .iter()
        .zip(target.iter())
        .all(|(s, t)| (s - t).abs() < tol)
}

/// Clamp intensities to `[min, max]` and rescale that range to `[0, 1]`.
pub fn clip_rescale(vol: &Volume, min: f32, max: f32) -> Volume {
    let range = max - min;
    let data = vol.data.mapv(|v| (v.clamp(min, max) - min) / range);
    Volume::new(data, vol.spacing, vol.affine)
}

/// Area-average resize to an exact voxel grid.
///
/// Every output voxel averages its (floor/ceil-bounded) source box, which
/// preserves mean intensity under downsampling; a no-op when the shape
/// already matches.
pub fn resize_area(vol: &Volume, target: (usize, usize, usize)) -> Volume {
    if vol.shape() == target {
        return vol.clone();
    }
    let (nx, ny, nz) = vol.shape();
    let n_in = [nx, ny, nz];
    let n_out = [target.0, target.1, target.2];

    let bounds = |o: usize, axis: usize| -> (usize, usize) {
        let start = o * n_in[axis] / n_out[axis];
        let end = ((o + 1) * n_in[axis]).div_ceil(n_out[axis]);
        (start, end.max(start + 1).min(n_in[axis]))
    };

    let data = Array3::from_shape_fn(target, |(ox, oy, oz)| {
        let (x0, x1) = bounds(ox, 0);
        let (y0, y1) = bounds(oy, 1);
        let (z0, z1) = bounds(oz, 2);
        let mut sum = 0.0f32;
        for x in x0..x1 {
            for y in y0..y1 {
                for z in z0..z1 {
                    sum += vol.data[[x, y, z]];
                }
            }
        }
        sum / ((x1 - x0) * (y1 - y0) * (z1 - z0)) as f32
    });

    let mut spacing = vol.spacing;
    let mut affine = vol.affine;
    for axis in 0..3 {
        let scale = n_in[axis] as f32 / n_out[axis] as f32;
        spacing[axis] *= scale;
        for row in 0..3 {
            affine[row][axis] *= scale;
        }
    }
    Volume::new(data, spacing, affine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn clip_rescale_hounsfield_bounds() {
        let data = Array3::from_shape_vec(
            (1, 1, 4),
            vec![-1000.0, 400.0, -1600.0, -300.0],
        )
        .unwrap();
        let vol = Volume::with_spacing(data, [1.0; 3]);
        let out = clip_rescale(&vol, -1000.0, 400.0);
        let values: Vec<f32> = out.data.iter().copied().collect();
        assert_eq!(values[0], 0.0);
        assert_eq!(values[1], 1.0);
        // Below the lower bound clips to 0.
        assert_eq!(values[2], 0.0);
        assert!((values[3] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn resize_is_identity_at_target_shape() {
        let data = Array3::from_shape_fn((4, 5, 6), |(i, j, k)| (i + 10 * j + 100 * k) as f32);
        let vol = Volume::with_spacing(data.clone(), [1.0; 3]);
        let out = resize_area(&vol, (4, 5, 6));
        assert_eq!(out.data, data);
        assert_eq!(out.spacing, vol.spacing);
    }

    #[test]
    fn resize_halving_averages_blocks() {
        let data = Array3::from_shape_vec(
            (2, 2, 2),
            vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0, 12.0, 14.0],
        )
        .unwrap();
        let vol = Volume::with_spacing(data, [1.0; 3]);
        let out = resize_area(&vol, (1, 1, 1));
        assert_eq!(out.shape(), (1, 1, 1));
        assert!((out.data[[0, 0, 0]] - 7.0).abs() < 1e-6);
        assert_eq!(out.spacing, [2.0, 2.0, 2.0]);
    }

    #[test]
    fn trilinear_preserves_corner_samples() {
        let data = Array3::from_shape_fn((3, 3, 3), |(i, j, k)| (i * 9 + j * 3 + k) as f32);
        let out = resample_trilinear(&data, [5, 5, 5]);
        assert_eq!(out[[0, 0, 0]], data[[0, 0, 0]]);
        assert_eq!(out[[4, 4, 4]], data[[2, 2, 2]]);
        // Midpoint along one axis interpolates linearly.
        let expected = (data[[0, 0, 0]] + data[[1, 0, 0]]) / 2.0;
        assert!((out[[1, 0, 0]] - expected).abs() < 1e-5);
    }

    #[test]
    fn spacing_resample_updates_extent_and_metadata() {
        let data = Array3::from_shape_fn((10, 10, 10), |(i, _, _)| i as f32);
        let vol = Volume::with_spacing(data, [2.0, 2.0, 2.0]);
        let out = resample_to_spacing(&vol, [1.0, 1.0, 1.0]);
        assert_eq!(out.shape(), (20, 20, 20));
        assert_eq!(out.spacing, [1.0, 1.0, 1.0]);
        assert!((out.affine[0][0] - 1.0).abs() < 1e-6);
        // Corner alignment keeps endpoints.
        assert_eq!(out.data[[0, 0, 0]], 0.0);
        assert_eq!(out.data[[19, 0, 0]], 9.0);
    }

    #[test]
    fn reorient_ras_to_lps_flips_first_two_axes() {
        let data = Array3::from_shape_fn((2, 3, 4), |(i, j, k)| (i * 100 + j * 10 + k) as f32);
        let vol = Volume::with_spacing(data.clone(), [1.0; 3]);
        assert_eq!(volume::axcodes(&vol.affine), Some(['R', 'A', 'S']));

        let out = reorient(&vol, "LPS").unwrap();
        assert_eq!(volume::axcodes(&out.affine), Some(['L', 'P', 'S']));
        assert_eq!(out.shape(), (2, 3, 4));
        // x and y run backwards, z is untouched.
        assert_eq!(out.data[[0, 0, 0]], data[[1, 2, 0]]);
        assert_eq!(out.data[[1, 2, 3]], data[[0, 0, 3]]);

        // Already-correct orientation is an identity.
        let again = reorient(&out, "LPS").unwrap();
        assert_eq!(again.data, out.data);
        assert_eq!(again.affine, out.affine);
    }

    #[test]
    fn reorient_permutes_axes() {
        // Affine sending voxel axes (i, j, k) to world (S, L, P): code "SLP".
        let data = Array3::from_shape_fn((2, 3, 4), |(i, j, k)| (i * 100 + j * 10 + k) as f32);
        let mut affine = [[0.0f32; 4]; 4];
        affine[2][0] = 1.0; // i → +z (S)
        affine[0][1] = -1.0; // j → -x (L)
        affine[1][2] = -1.0; // k → -y (P)
        affine[3][3] = 1.0;
        let vol = Volume::new(data, [1.0, 1.0, 1.0], affine);
        assert_eq!(volume::axcodes(&vol.affine), Some(['S', 'L', 'P']));

        let out = reorient(&vol, "LPS").unwrap();
        assert_eq!(volume::axcodes(&out.affine), Some(['L', 'P', 'S']));
        // Axes land as (j, k, i) of the source.
        assert_eq!(out.shape(), (3, 4, 2));
        assert_eq!(out.data[[1, 2, 0]], vol.data[[0, 1, 2]]);
    }
}
