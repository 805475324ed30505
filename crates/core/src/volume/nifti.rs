//! Minimal NIfTI-1 reader and writer.
//!
//! Covers what CT classification needs: single-file `.nii` / `.nii.gz`,
//! scalar voxel types (u8, i8, i16, u16, i32, f32, f64) with
//! `scl_slope`/`scl_inter` rescaling, little- or big-endian headers, and the
//! sform → qform → pixdim fallback chain for the voxel→world affine.
//! Detached `.hdr`/`.img` pairs and extension blocks are rejected rather
//! than half-supported.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use flate2::bufread::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{Array3, ShapeBuilder};

use crate::preprocess::PreprocessError;
use crate::volume::Volume;

const HEADER_SIZE: usize = 348;
/// Header plus the 4-byte extension flag that precedes voxel data.
const DATA_OFFSET: usize = 352;

const DT_UINT8: i16 = 2;
const DT_INT16: i16 = 4;
const DT_INT32: i16 = 8;
const DT_FLOAT32: i16 = 16;
const DT_FLOAT64: i16 = 64;
const DT_INT8: i16 = 256;
const DT_UINT16: i16 = 512;

fn invalid(path: &Path, reason: impl Into<String>) -> PreprocessError {
    PreprocessError::InvalidFormat {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Byte-order-aware field access into a raw header.
struct HeaderView<'a> {
    bytes: &'a [u8],
    swap: bool,
}

impl<'a> HeaderView<'a> {
    fn i16_at(&self, offset: usize) -> i16 {
        let b = [self.bytes[offset], self.bytes[offset + 1]];
        if self.swap {
            i16::from_be_bytes(b)
        } else {
            i16::from_le_bytes(b)
        }
    }

    fn f32_at(&self, offset: usize) -> f32 {
        let b: [u8; 4] = self.bytes[offset..offset + 4].try_into().unwrap();
        if self.swap {
            f32::from_be_bytes(b)
        } else {
            f32::from_le_bytes(b)
        }
    }
}

/// Load a NIfTI-1 volume from `.nii` or `.nii.gz`.
pub fn load(path: &Path) -> Result<Volume, PreprocessError> {
    let raw = std::fs::read(path).map_err(|source| PreprocessError::Load {
        path: path.to_path_buf(),
        source,
    })?;

    // Sniff gzip by magic rather than extension.
    let bytes = if raw.len() >= 2 && raw[0] == 0x1f && raw[1] == 0x8b {
        let mut decoded = Vec::new();
        MultiGzDecoder::new(raw.as_slice())
            .read_to_end(&mut decoded)
            .map_err(|e| invalid(path, format!("gzip decode failed: {e}")))?;
        decoded
    } else {
        raw
    };

    if bytes.len() < DATA_OFFSET {
        return Err(invalid(
            path,
            format!("{} bytes is too short for a NIfTI-1 header", bytes.len()),
        ));
    }

    let le_size = i32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let swap = match le_size {
        s if s == HEADER_SIZE as i32 => false,
        _ if i32::from_be_bytes(bytes[0..4].try_into().unwrap()) == HEADER_SIZE as i32 => true,
        other => {
            return Err(invalid(path, format!("bad sizeof_hdr {other}")));
        }
    };
    let hdr = HeaderView {
        bytes: &bytes,
        swap,
    };

    match &bytes[344..348] {
        b"n+1\0" => {}
        b"ni1\0" => {
            return Err(invalid(path, "detached .hdr/.img pairs are not supported"));
        }
        other => {
            return Err(invalid(path, format!("bad magic {other:?}")));
        }
    }

    let ndim = hdr.i16_at(40);
    if !(1..=7).contains(&ndim) {
        return Err(invalid(path, format!("bad dim[0] = {ndim}")));
    }
    let mut dims = [1usize; 7];
    for (i, dim) in dims.iter_mut().enumerate().take(ndim as usize) {
        let d = hdr.i16_at(40 + 2 * (i + 1));
        *dim = d.max(1) as usize;
    }
    // Trailing singleton dims (time, channel) are squeezed; anything with a
    // real fourth extent is not a scalar volume.
    if dims[3..].iter().any(|&d| d > 1) {
        return Err(invalid(
            path,
            format!("expected a 3D scalar volume, got dims {dims:?}"),
        ));
    }
    let (nx, ny, nz) = (dims[0], dims[1], dims[2]);

    let datatype = hdr.i16_at(70);
    let elem_size = match datatype {
        DT_UINT8 | DT_INT8 => 1,
        DT_INT16 | DT_UINT16 => 2,
        DT_INT32 | DT_FLOAT32 => 4,
        DT_FLOAT64 => 8,
        other => {
            return Err(invalid(path, format!("unsupported datatype {other}")));
        }
    };

    let mut pixdim = [0.0f32; 8];
    for (i, p) in pixdim.iter_mut().enumerate() {
        *p = hdr.f32_at(76 + 4 * i);
    }
    let spacing = [
        non_degenerate(pixdim[1]),
        non_degenerate(pixdim[2]),
        non_degenerate(pixdim[3]),
    ];

    let vox_offset = hdr.f32_at(108);
    if !vox_offset.is_finite() || vox_offset < HEADER_SIZE as f32 {
        return Err(invalid(path, format!("bad vox_offset {vox_offset}")));
    }
    let vox_offset = vox_offset as usize;

    let mut slope = hdr.f32_at(112);
    let mut inter = hdr.f32_at(116);
    if slope == 0.0 || !slope.is_finite() {
        slope = 1.0;
    }
    if !inter.is_finite() {
        inter = 0.0;
    }

    let affine = read_affine(&hdr, spacing, pixdim[0]);

    let n = nx * ny * nz;
    let end = vox_offset + n * elem_size;
    if bytes.len() < end {
        return Err(invalid(
            path,
            format!("voxel data truncated: need {end} bytes, have {}", bytes.len()),
        ));
    }
    let data = &bytes[vox_offset..end];
    let mut values = Vec::with_capacity(n);
    for i in 0..n {
        let offset = i * elem_size;
        let raw = match datatype {
            DT_UINT8 => data[offset] as f32,
            DT_INT8 => data[offset] as i8 as f32,
            DT_INT16 => scalar_i16(&data[offset..offset + 2], swap) as f32,
            DT_UINT16 => scalar_i16(&data[offset..offset + 2], swap) as u16 as f32,
            DT_INT32 => scalar_i32(&data[offset..offset + 4], swap) as f32,
            DT_FLOAT32 => scalar_f32(&data[offset..offset + 4], swap),
            DT_FLOAT64 => scalar_f64(&data[offset..offset + 8], swap) as f32,
            _ => unreachable!("datatype validated above"),
        };
        values.push(raw * slope + inter);
    }

    // NIfTI stores voxels Fortran-order: x fastest.
    let data = Array3::from_shape_vec((nx, ny, nz).f(), values)
        .map_err(|e| invalid(path, format!("shape error: {e}")))?;

    Ok(Volume::new(data, spacing, affine))
}

fn non_degenerate(s: f32) -> f32 {
    if s.is_finite() && s.abs() > 0.0 {
        s.abs()
    } else {
        1.0
    }
}

fn scalar_i16(b: &[u8], swap: bool) -> i16 {
    let b: [u8; 2] = b.try_into().unwrap();
    if swap {
        i16::from_be_bytes(b)
    } else {
        i16::from_le_bytes(b)
    }
}

fn scalar_i32(b: &[u8], swap: bool) -> i32 {
    let b: [u8; 4] = b.try_into().unwrap();
    if swap {
        i32::from_be_bytes(b)
    } else {
        i32::from_le_bytes(b)
    }
}

fn scalar_f32(b: &[u8], swap: bool) -> f32 {
    let b: [u8; 4] = b.try_into().unwrap();
    if swap {
        f32::from_be_bytes(b)
    } else {
        f32::from_le_bytes(b)
    }
}

fn scalar_f64(b: &[u8], swap: bool) -> f64 {
    let b: [u8; 8] = b.try_into().unwrap();
    if swap {
        f64::from_be_bytes(b)
    } else {
        f64::from_le_bytes(b)
    }
}

fn read_affine(hdr: &HeaderView<'_>, spacing: [f32; 3], pixdim0: f32) -> [[f32; 4]; 4] {
    let mut affine = [[0.0f32; 4]; 4];
    affine[3][3] = 1.0;

    let sform_code = hdr.i16_at(254);
    if sform_code > 0 {
        for (row, base) in [(0usize, 280usize), (1, 296), (2, 312)] {
            for col in 0..4 {
                affine[row][col] = hdr.f32_at(base + 4 * col);
            }
        }
        return affine;
    }

    let qform_code = hdr.i16_at(252);
    if qform_code > 0 {
        let b = hdr.f32_at(256);
        let c = hdr.f32_at(260);
        let d = hdr.f32_at(264);
        let a = (1.0 - b * b - c * c - d * d).max(0.0).sqrt();
        let qfac = if pixdim0 < 0.0 { -1.0 } else { 1.0 };
        let rot = [
            [
                a * a + b * b - c * c - d * d,
                2.0 * (b * c - a * d),
                2.0 * (b * d + a * c),
            ],
            [
                2.0 * (b * c + a * d),
                a * a + c * c - b * b - d * d,
                2.0 * (c * d - a * b),
            ],
            [
                2.0 * (b * d - a * c),
                2.0 * (c * d + a * b),
                a * a + d * d - b * b - c * c,
            ],
        ];
        for row in 0..3 {
            for col in 0..3 {
                let scale = if col == 2 {
                    spacing[col] * qfac
                } else {
                    spacing[col]
                };
                affine[row][col] = rot[row][col] * scale;
            }
            affine[row][3] = hdr.f32_at(268 + 4 * row);
        }
        return affine;
    }

    // No orientation info at all: assume axis-aligned RAS.
    for i in 0..3 {
        affine[i][i] = spacing[i];
    }
    affine
}

/// Write `volume` as a float32 single-file NIfTI-1, gzipped when the path
/// ends in `.gz`. The affine goes out as the sform.
pub fn save(volume: &Volume, path: &Path) -> Result<(), PreprocessError> {
    let (nx, ny, nz) = volume.shape();
    let mut header = vec![0u8; DATA_OFFSET];

    header[0..4].copy_from_slice(&(HEADER_SIZE as i32).to_le_bytes());
    let dims: [i16; 8] = [3, nx as i16, ny as i16, nz as i16, 1, 1, 1, 1];
    for (i, d) in dims.iter().enumerate() {
        header[40 + 2 * i..42 + 2 * i].copy_from_slice(&d.to_le_bytes());
    }
    header[70..72].copy_from_slice(&DT_FLOAT32.to_le_bytes());
    header[72..74].copy_from_slice(&32i16.to_le_bytes());
    let pixdim: [f32; 8] = [
        1.0,
        volume.spacing[0],
        volume.spacing[1],
        volume.spacing[2],
        0.0,
        0.0,
        0.0,
        0.0,
    ];
    for (i, p) in pixdim.iter().enumerate() {
        header[76 + 4 * i..80 + 4 * i].copy_from_slice(&p.to_le_bytes());
    }
    header[108..112].copy_from_slice(&(DATA_OFFSET as f32).to_le_bytes());
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    // xyzt_units: millimetres.
    header[123] = 2;
    header[254..256].copy_from_slice(&1i16.to_le_bytes());
    for (row, base) in [(0usize, 280usize), (1, 296), (2, 312)] {
        for col in 0..4 {
            header[base + 4 * col..base + 4 * col + 4]
                .copy_from_slice(&volume.affine[row][col].to_le_bytes());
        }
    }
    header[344..348].copy_from_slice(b"n+1\0");

    // Fortran order to match the on-disk convention.
    let mut payload = header;
    payload.reserve(nx * ny * nz * 4);
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                payload.extend_from_slice(&volume.data[[i, j, k]].to_le_bytes());
            }
        }
    }

    let gz = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("gz"))
        .unwrap_or(false);
    let save_err = |source: std::io::Error| PreprocessError::Save {
        path: path.to_path_buf(),
        source,
    };
    if gz {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload).map_err(save_err)?;
        let compressed = encoder.finish().map_err(save_err)?;
        std::fs::write(path, compressed).map_err(save_err)?;
    } else {
        std::fs::write(path, payload).map_err(save_err)?;
    }
    Ok(())
}

/// Read just enough of a file to confirm it looks like NIfTI-1; used by
/// tests and tooling, not the pipeline itself.
pub fn sniff(path: &Path) -> Result<bool, PreprocessError> {
    let file = File::open(path).map_err(|source| PreprocessError::Load {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    let mut start = [0u8; 4];
    if reader.read_exact(&mut start).is_err() {
        return Ok(false);
    }
    if start[0] == 0x1f && start[1] == 0x8b {
        return Ok(true);
    }
    Ok(i32::from_le_bytes(start) == HEADER_SIZE as i32
        || i32::from_be_bytes(start) == HEADER_SIZE as i32)
}
