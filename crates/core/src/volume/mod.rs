//! In-memory representation of a scalar 3D scan plus its spatial metadata.

pub mod nifti;

use ndarray::Array3;

/// A 3D scalar volume with voxel spacing and a voxel→world affine.
///
/// `data` is indexed `[i, j, k]` in voxel axes; `affine` maps voxel indices
/// to world millimetres in the RAS+ convention (+x right, +y anterior,
/// +z superior). Transform steps consume a `Volume` and produce a new one;
/// nothing mutates a volume in place.
#[derive(Debug, Clone)]
pub struct Volume {
    pub data: Array3<f32>,
    /// Millimetres per step along each voxel axis.
    pub spacing: [f32; 3],
    /// Voxel→world affine, row-major `[row][col]`.
    pub affine: [[f32; 4]; 4],
}

impl Volume {
    pub fn new(data: Array3<f32>, spacing: [f32; 3], affine: [[f32; 4]; 4]) -> Self {
        Self {
            data,
            spacing,
            affine,
        }
    }

    /// A volume with an axis-aligned RAS affine scaled by `spacing`.
    pub fn with_spacing(data: Array3<f32>, spacing: [f32; 3]) -> Self {
        let mut affine = [[0.0f32; 4]; 4];
        for i in 0..3 {
            affine[i][i] = spacing[i];
        }
        affine[3][3] = 1.0;
        Self {
            data,
            spacing,
            affine,
        }
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        self.data.dim()
    }
}

/// Positive / negative world-direction labels per world axis.
const AXIS_LABELS: [[char; 2]; 3] = [['R', 'L'], ['A', 'P'], ['S', 'I']];

/// Parse a three-letter orientation code into `(world_axis, sign)` per voxel
/// axis. Returns `None` unless exactly one letter addresses each world axis.
pub fn parse_axcodes(code: &str) -> Option<[(usize, f32); 3]> {
    let chars: Vec<char> = code.chars().collect();
    if chars.len() != 3 {
        return None;
    }
    let mut out = [(0usize, 0.0f32); 3];
    let mut seen = [false; 3];
    for (slot, ch) in chars.iter().enumerate() {
        let ch = ch.to_ascii_uppercase();
        let mut found = None;
        for (axis, labels) in AXIS_LABELS.iter().enumerate() {
            if ch == labels[0] {
                found = Some((axis, 1.0));
            } else if ch == labels[1] {
                found = Some((axis, -1.0));
            }
        }
        let (axis, sign) = found?;
        if seen[axis] {
            return None;
        }
        seen[axis] = true;
        out[slot] = (axis, sign);
    }
    Some(out)
}

/// Dominant world axis and sign for each voxel axis of an affine.
///
/// Returns `None` for degenerate affines (zero column, or two voxel axes
/// collapsing onto the same world axis), which oblique-but-valid scans never
/// produce.
pub fn dominant_axes(affine: &[[f32; 4]; 4]) -> Option<[(usize, f32); 3]> {
    let mut out = [(0usize, 0.0f32); 3];
    let mut taken = [false; 3];
    for j in 0..3 {
        let col = [affine[0][j], affine[1][j], affine[2][j]];
        let mut best = 0usize;
        for axis in 1..3 {
            if col[axis].abs() > col[best].abs() {
                best = axis;
            }
        }
        if col[best] == 0.0 || taken[best] {
            return None;
        }
        taken[best] = true;
        out[j] = (best, col[best].signum());
    }
    Some(out)
}

/// Three-letter orientation code of an affine, e.g. `['L', 'P', 'S']`.
pub fn axcodes(affine: &[[f32; 4]; 4]) -> Option<[char; 3]> {
    let axes = dominant_axes(affine)?;
    let mut out = ['?'; 3];
    for (j, (axis, sign)) in axes.iter().enumerate() {
        out[j] = if *sign > 0.0 {
            AXIS_LABELS[*axis][0]
        } else {
            AXIS_LABELS[*axis][1]
        };
    }
    Some(out)
}
