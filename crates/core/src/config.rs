//! Model and preprocessing configuration.
//!
//! Configs are plain serde-deserializable structs. Presets are ordinary
//! constructors returning a fully populated [`Vit3dConfig`]; callers override
//! individual fields with struct-update syntax, so override precedence is
//! visible at the call site rather than buried in a merge.

use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

/// Construction-time misconfiguration. Always fatal: a config that fails
/// validation must never reach model or pipeline construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("volume {axis} extent {volume} is not divisible by patch extent {patch}")]
    PatchSize {
        axis: &'static str,
        volume: usize,
        patch: usize,
    },
    #[error("embed_dim {embed_dim} is not divisible by num_heads {num_heads}")]
    HeadSplit { embed_dim: usize, num_heads: usize },
    #[error("{field} must be nonzero")]
    Zero { field: &'static str },
    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: f32 },
    #[error("dropout rate {field} must lie in [0, 1], got {value}")]
    DropRange { field: &'static str, value: f32 },
    #[error("intensity clip range is empty: min {min} >= max {max}")]
    ClipRange { min: f32, max: f32 },
    #[error("invalid orientation code {code:?}: expected three of L/R, P/A, S/I, one per axis")]
    Orientation { code: String },
    #[error("cannot create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

// ─── Model config ────────────────────────────────────────────────────────────

/// Configuration for [`VisionTransformer3d`](crate::models::VisionTransformer3d).
///
/// Defaults match the base variant on `(96, 224, 224)` CT volumes with
/// `16^3` patches.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Vit3dConfig {
    /// Input volume extents as (depth, height, width) voxels.
    pub volume_size: (usize, usize, usize),
    /// Cubic patch extents; each must evenly divide the matching volume extent.
    pub patch_size: (usize, usize, usize),
    /// Intensity channels per voxel (1 for CT).
    pub in_channels: usize,
    /// Number of pathology logits (multi-label, no mutual exclusivity).
    pub num_classes: usize,
    /// Token embedding width.
    pub embed_dim: usize,
    /// Number of encoder blocks.
    pub depth: usize,
    /// Attention heads per block; must divide `embed_dim`.
    pub num_heads: usize,
    /// MLP hidden width as a multiple of `embed_dim`.
    pub mlp_ratio: f64,
    /// Bias on the fused QKV projection.
    pub qkv_bias: bool,
    /// Dropout on positional embeddings, attention output and MLP layers.
    pub drop_rate: f32,
    /// Dropout on the attention probability matrix.
    pub attn_drop_rate: f32,
    /// Request gradient checkpointing during training. Carried for config
    /// compatibility with training harnesses; candle's autograd offers no
    /// activation-recompute hook, so the forward path is unchanged today.
    pub use_checkpointing: bool,
}

impl Default for Vit3dConfig {
    fn default() -> Self {
        Self {
            volume_size: (96, 224, 224),
            patch_size: (16, 16, 16),
            in_channels: 1,
            num_classes: 18,
            embed_dim: 768,
            depth: 12,
            num_heads: 12,
            mlp_ratio: 4.0,
            qkv_bias: true,
            drop_rate: 0.0,
            attn_drop_rate: 0.0,
            use_checkpointing: false,
        }
    }
}

impl Vit3dConfig {
    /// Tiny variant: fastest to train, least memory.
    pub fn tiny() -> Self {
        Self {
            embed_dim: 192,
            depth: 12,
            num_heads: 3,
            mlp_ratio: 4.0,
            ..Self::default()
        }
    }

    /// Small variant.
    pub fn small() -> Self {
        Self {
            embed_dim: 384,
            depth: 12,
            num_heads: 6,
            mlp_ratio: 4.0,
            ..Self::default()
        }
    }

    /// Base variant.
    pub fn base() -> Self {
        Self {
            embed_dim: 768,
            depth: 12,
            num_heads: 12,
            mlp_ratio: 4.0,
            ..Self::default()
        }
    }

    /// Large variant: requires significant memory.
    pub fn large() -> Self {
        Self {
            embed_dim: 1024,
            depth: 24,
            num_heads: 16,
            mlp_ratio: 4.0,
            ..Self::default()
        }
    }

    /// Number of patches the volume partitions into.
    pub fn n_patches(&self) -> usize {
        (self.volume_size.0 / self.patch_size.0)
            * (self.volume_size.1 / self.patch_size.1)
            * (self.volume_size.2 / self.patch_size.2)
    }

    /// Token sequence length: patches plus the classification token.
    pub fn seq_len(&self) -> usize {
        self.n_patches() + 1
    }

    /// MLP hidden width.
    pub fn mlp_hidden_dim(&self) -> usize {
        (self.embed_dim as f64 * self.mlp_ratio) as usize
    }

    /// Voxels per flattened patch, including channels.
    pub fn patch_dim(&self) -> usize {
        self.in_channels * self.patch_size.0 * self.patch_size.1 * self.patch_size.2
    }

    /// Total learned parameters a model built from this config will own.
    ///
    /// Counted analytically so preset comparisons do not require allocating
    /// the (potentially multi-hundred-million parameter) models themselves.
    pub fn parameter_count(&self) -> usize {
        let d = self.embed_dim;
        let hidden = self.mlp_hidden_dim();
        let qkv_bias = if self.qkv_bias { 3 * d } else { 0 };

        let patch_embed = self.patch_dim() * d + d;
        let tokens = d + self.seq_len() * d;
        // Per block: norm1 + qkv + proj + norm2 + fc1 + fc2.
        let block = (2 * d)
            + (d * 3 * d + qkv_bias)
            + (d * d + d)
            + (2 * d)
            + (d * hidden + hidden)
            + (hidden * d + d);
        let final_norm = 2 * d;
        let head = (d * 256 + 256) + (256 * self.num_classes + self.num_classes);

        patch_embed + tokens + self.depth * block + final_norm + head
    }

    /// Reject configs that would only fail later as opaque shape errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let axes = [
            ("depth", self.volume_size.0, self.patch_size.0),
            ("height", self.volume_size.1, self.patch_size.1),
            ("width", self.volume_size.2, self.patch_size.2),
        ];
        for (axis, volume, patch) in axes {
            if patch == 0 {
                return Err(ConfigError::Zero { field: "patch_size" });
            }
            if volume == 0 {
                return Err(ConfigError::Zero {
                    field: "volume_size",
                });
            }
            if volume % patch != 0 {
                return Err(ConfigError::PatchSize {
                    axis,
                    volume,
                    patch,
                });
            }
        }
        for (field, value) in [
            ("in_channels", self.in_channels),
            ("num_classes", self.num_classes),
            ("embed_dim", self.embed_dim),
            ("depth", self.depth),
            ("num_heads", self.num_heads),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.embed_dim % self.num_heads != 0 {
            return Err(ConfigError::HeadSplit {
                embed_dim: self.embed_dim,
                num_heads: self.num_heads,
            });
        }
        if self.mlp_ratio <= 0.0 {
            return Err(ConfigError::NonPositive {
                field: "mlp_ratio",
                value: self.mlp_ratio as f32,
            });
        }
        for (field, value) in [
            ("drop_rate", self.drop_rate),
            ("attn_drop_rate", self.attn_drop_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::DropRange { field, value });
            }
        }
        Ok(())
    }
}

// ─── Preprocessing config ────────────────────────────────────────────────────

fn default_orientation() -> String {
    "LPS".to_string()
}

/// Configuration for the CT preprocessing pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct PreprocessConfig {
    /// Target voxel spacing in millimetres, one entry per spatial axis.
    pub target_spacing: [f32; 3],
    /// Target voxel grid as (depth, height, width).
    pub target_shape: (usize, usize, usize),
    /// Lower intensity clip bound (Hounsfield units for CT).
    pub clip_min: f32,
    /// Upper intensity clip bound.
    pub clip_max: f32,
    /// Anatomical axis convention the volume is reoriented to.
    #[serde(default = "default_orientation")]
    pub orientation: String,
    /// When set, transformed volumes are also written here (metadata intact)
    /// before the final tensor cast.
    #[serde(default)]
    pub save_dir: Option<PathBuf>,
}

impl PreprocessConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for &s in &self.target_spacing {
            if !(s > 0.0) {
                return Err(ConfigError::NonPositive {
                    field: "target_spacing",
                    value: s,
                });
            }
        }
        let (d, h, w) = self.target_shape;
        if d == 0 || h == 0 || w == 0 {
            return Err(ConfigError::Zero {
                field: "target_shape",
            });
        }
        if self.clip_min >= self.clip_max {
            return Err(ConfigError::ClipRange {
                min: self.clip_min,
                max: self.clip_max,
            });
        }
        crate::volume::parse_axcodes(&self.orientation).ok_or_else(|| {
            ConfigError::Orientation {
                code: self.orientation.clone(),
            }
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_dimensions() {
        let tiny = Vit3dConfig::tiny();
        assert_eq!(
            (tiny.embed_dim, tiny.depth, tiny.num_heads, tiny.mlp_ratio),
            (192, 12, 3, 4.0)
        );
        let small = Vit3dConfig::small();
        assert_eq!((small.embed_dim, small.num_heads), (384, 6));
        let base = Vit3dConfig::base();
        assert_eq!((base.embed_dim, base.num_heads), (768, 12));
        let large = Vit3dConfig::large();
        assert_eq!((large.embed_dim, large.depth, large.num_heads), (1024, 24, 16));
    }

    #[test]
    fn preset_override_wins() {
        let cfg = Vit3dConfig {
            num_classes: 5,
            use_checkpointing: true,
            ..Vit3dConfig::tiny()
        };
        assert_eq!(cfg.num_classes, 5);
        assert!(cfg.use_checkpointing);
        assert_eq!(cfg.embed_dim, 192);
    }

    #[test]
    fn patch_count_and_seq_len() {
        let cfg = Vit3dConfig {
            volume_size: (32, 32, 32),
            patch_size: (16, 16, 16),
            ..Vit3dConfig::tiny()
        };
        assert_eq!(cfg.n_patches(), 8);
        assert_eq!(cfg.seq_len(), 9);

        let default = Vit3dConfig::default();
        assert_eq!(default.n_patches(), 6 * 14 * 14);
    }

    #[test]
    fn patch_count_matches_axis_ratios() {
        for (volume, patch) in [
            ((96, 224, 224), (16, 16, 16)),
            ((64, 64, 64), (8, 16, 32)),
            ((16, 16, 16), (16, 16, 16)),
        ] {
            let cfg = Vit3dConfig {
                volume_size: volume,
                patch_size: patch,
                ..Vit3dConfig::tiny()
            };
            cfg.validate().unwrap();
            let expected =
                (volume.0 / patch.0) * (volume.1 / patch.1) * (volume.2 / patch.2);
            assert_eq!(cfg.n_patches(), expected);
        }
    }

    #[test]
    fn indivisible_patch_rejected() {
        let cfg = Vit3dConfig {
            volume_size: (96, 224, 224),
            patch_size: (16, 15, 16),
            ..Vit3dConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::PatchSize { axis: "height", .. })
        ));
    }

    #[test]
    fn head_split_rejected() {
        let cfg = Vit3dConfig {
            embed_dim: 100,
            num_heads: 3,
            ..Vit3dConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::HeadSplit { .. })));
    }

    #[test]
    fn parse_from_json() {
        let cfg: Vit3dConfig = serde_json::from_str(
            r#"{
                "volume_size": [32, 64, 64],
                "patch_size": [16, 16, 16],
                "num_classes": 4,
                "embed_dim": 192,
                "num_heads": 3
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.volume_size, (32, 64, 64));
        assert_eq!(cfg.num_classes, 4);
        // Unlisted fields fall back to defaults.
        assert_eq!(cfg.depth, 12);
        assert!(cfg.qkv_bias);
        cfg.validate().unwrap();
    }

    #[test]
    fn preprocess_config_validation() {
        let good = PreprocessConfig {
            target_spacing: [1.5, 1.5, 2.0],
            target_shape: (96, 224, 224),
            clip_min: -1000.0,
            clip_max: 400.0,
            orientation: "LPS".to_string(),
            save_dir: None,
        };
        good.validate().unwrap();

        let bad_clip = PreprocessConfig {
            clip_min: 400.0,
            clip_max: -1000.0,
            ..good.clone()
        };
        assert!(matches!(
            bad_clip.validate(),
            Err(ConfigError::ClipRange { .. })
        ));

        let bad_code = PreprocessConfig {
            orientation: "LLS".to_string(),
            ..good.clone()
        };
        assert!(matches!(
            bad_code.validate(),
            Err(ConfigError::Orientation { .. })
        ));

        let bad_spacing = PreprocessConfig {
            target_spacing: [0.0, 1.0, 1.0],
            ..good
        };
        assert!(bad_spacing.validate().is_err());
    }

    #[test]
    fn preset_parameter_counts_strictly_increase() {
        let classes = 18;
        let counts: Vec<usize> = [
            Vit3dConfig::tiny(),
            Vit3dConfig::small(),
            Vit3dConfig::base(),
            Vit3dConfig::large(),
        ]
        .into_iter()
        .map(|cfg| {
            Vit3dConfig {
                num_classes: classes,
                ..cfg
            }
            .parameter_count()
        })
        .collect();
        assert!(counts.windows(2).all(|w| w[0] < w[1]), "{counts:?}");
    }
}
