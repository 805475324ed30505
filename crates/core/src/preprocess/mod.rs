//! CT preprocessing pipeline: raw NIfTI path in, fixed-shape tensor out.
//!
//! The chain is deterministic and stateless per call: load → reorient →
//! resample to target spacing → clip/rescale intensity → area-resize to the
//! target grid → (optionally persist) → tensor cast. The public
//! [`Preprocessor::process`] entry point is fail-soft: any error anywhere in
//! the chain is logged with the offending path and replaced by an all-zero
//! tensor of the target shape, so one corrupt scan cannot abort a dataset
//! pass. [`Preprocessor::try_process`] is the strict variant.

pub mod transforms;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use candle_core::{Device, Tensor};
use thiserror::Error;
use tracing::{debug, error};

use crate::config::{ConfigError, PreprocessConfig};
use crate::volume::nifti;

/// Spacings closer than this (mm) are considered already on target.
const SPACING_TOL: f32 = 1e-3;

/// Failures the transform chain can produce. Only [`Preprocessor::new`]
/// misconfiguration escapes to callers; everything else is absorbed by the
/// fail-soft boundary.
#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("failed to read {path}: {source}")]
    Load {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Save {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path} is not a usable volume: {reason}")]
    InvalidFormat { path: PathBuf, reason: String },
    #[error("orientation failure: {reason}")]
    Orientation { reason: String },
    #[error("post-transform shape {actual:?} does not match target {expected:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Executes the transform chain for one volume at a time.
///
/// Re-entrant: `process` takes `&self` and keeps no per-call state beyond an
/// atomic failure counter, so distinct volumes may be preprocessed from
/// concurrent workers.
pub struct Preprocessor {
    config: PreprocessConfig,
    device: Device,
    failures: AtomicUsize,
}

impl Preprocessor {
    /// Validates the config and creates the persistence directory if one is
    /// configured. Misconfiguration is fatal here, never later.
    pub fn new(config: PreprocessConfig, device: Device) -> Result<Self, ConfigError> {
        config.validate()?;
        if let Some(dir) = &config.save_dir {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::OutputDir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(Self {
            config,
            device,
            failures: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Number of volumes substituted with zeros so far. A nonzero count at
    /// the end of a dataset pass means some inputs never reached the model.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    fn expected_dims(&self) -> [usize; 4] {
        let (d, h, w) = self.config.target_shape;
        [1, d, h, w]
    }

    /// Run the full chain, propagating errors. Output is guaranteed to be
    /// `(1, depth, height, width)` in `[0, 1]`.
    pub fn try_process(&self, path: &Path) -> Result<Tensor, PreprocessError> {
        let vol = nifti::load(path)?;
        let vol = transforms::reorient(&vol, &self.config.orientation)?;
        let vol = if transforms::spacing_matches(&vol, self.config.target_spacing, SPACING_TOL) {
            vol
        } else {
            transforms::resample_to_spacing(&vol, self.config.target_spacing)
        };
        let vol = transforms::clip_rescale(&vol, self.config.clip_min, self.config.clip_max);
        let vol = transforms::resize_area(&vol, self.config.target_shape);

        if let Some(dir) = &self.config.save_dir {
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("volume");
            let stem = name.strip_suffix(".nii").unwrap_or(name);
            let out = dir.join(format!("{stem}_transformed.nii.gz"));
            nifti::save(&vol, &out)?;
            debug!(path = %out.display(), "persisted transformed volume");
        }

        let (d, h, w) = vol.shape();
        let expected = self.expected_dims();
        if [1, d, h, w] != expected {
            return Err(PreprocessError::ShapeMismatch {
                expected: expected.to_vec(),
                actual: vec![1, d, h, w],
            });
        }
        let values: Vec<f32> = vol.data.iter().copied().collect();
        Ok(Tensor::from_vec(values, (1, d, h, w), &self.device)?)
    }

    /// Fail-soft entry point: errors are logged and replaced by an all-zero
    /// tensor of the target shape. The only error this can return is a
    /// failure to allocate the substitute tensor itself.
    pub fn process(&self, path: &Path) -> candle_core::Result<Tensor> {
        match self.try_process(path) {
            Ok(tensor) => Ok(tensor),
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    path = %path.display(),
                    error = %err,
                    "preprocessing failed; substituting zero volume"
                );
                let dims = self.expected_dims();
                Tensor::zeros(
                    (dims[0], dims[1], dims[2], dims[3]),
                    candle_core::DType::F32,
                    &self.device,
                )
            }
        }
    }
}
