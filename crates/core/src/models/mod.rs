pub mod init;
pub mod vit3d;

pub use vit3d::{
    vit_base_3d, vit_large_3d, vit_small_3d, vit_tiny_3d, PatchEmbed3d, VisionTransformer3d,
};

use candle_nn::VarMap;
use thiserror::Error;

use crate::config::ConfigError;

/// Model construction failures.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid model configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Total learned parameters held by a model's `VarMap`.
pub fn parameter_count(varmap: &VarMap) -> usize {
    varmap.all_vars().iter().map(|v| v.elem_count()).sum()
}
