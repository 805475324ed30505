//! 3D Vision Transformer for CT volume classification.
//!
//! A volume is cut into non-overlapping cubic patches, each linearly
//! projected into an embedding; a learned classification token is prepended
//! and the sequence runs through a stack of pre-norm encoder blocks. Only
//! the classification token's final state feeds the multi-label head.
//!
//! The model performs no input normalization of its own: callers are
//! expected to have run volumes through
//! [`Preprocessor`](crate::preprocess::Preprocessor) first. Shape or dtype
//! mismatches at `forward` are caller defects and surface as candle errors.

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{layer_norm, linear, Dropout, LayerNorm, Linear, VarBuilder, VarMap};

use crate::config::Vit3dConfig;
use crate::layers::{Mlp, MultiHeadSelfAttention};
use crate::models::{init, ModelError};

const LAYER_NORM_EPS: f64 = 1e-5;
const HEAD_HIDDEN: usize = 256;
const HEAD_DROP: f32 = 0.5;
const DEFAULT_INIT_SEED: u64 = 42;

// ─── Patch embedding ─────────────────────────────────────────────────────────

/// Partitions a volume into cubic patches and projects each one into an
/// embedding vector.
///
/// The projection is a single linear layer over the flattened patch, which
/// is the strided-Conv3d patchify expressed without a 3D convolution: no
/// information crosses a patch boundary at this stage.
pub struct PatchEmbed3d {
    proj: Linear,
    patch_size: (usize, usize, usize),
    n_patches: usize,
}

impl PatchEmbed3d {
    pub fn new(cfg: &Vit3dConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            proj: linear(cfg.patch_dim(), cfg.embed_dim, vb.pp("proj"))?,
            patch_size: cfg.patch_size,
            n_patches: cfg.n_patches(),
        })
    }

    pub fn n_patches(&self) -> usize {
        self.n_patches
    }

    /// `x`: `[B, C, D, H, W]` → `[B, n_patches, embed_dim]`.
    ///
    /// Patches are emitted in raster order: depth-major, then height, then
    /// width, matching the positional-embedding table. Extents that are not
    /// divisible by the patch size fail here with a shape error; valid
    /// configs rule that out at construction.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, c, d, h, w) = x.dims5()?;
        let (pd, ph, pw) = self.patch_size;
        let (gd, gh, gw) = (d / pd, h / ph, w / pw);
        let x = x
            .reshape(vec![b, c, gd, pd, gh, ph, gw, pw])?
            .permute(vec![0, 2, 4, 6, 1, 3, 5, 7])?
            .contiguous()?
            .reshape((b, gd * gh * gw, c * pd * ph * pw))?;
        self.proj.forward(&x)
    }
}

// ─── Encoder block ───────────────────────────────────────────────────────────

/// Pre-norm transformer block: `x + attn(norm1(x))`, then `x + mlp(norm2(x))`.
struct EncoderBlock {
    norm1: LayerNorm,
    attn: MultiHeadSelfAttention,
    norm2: LayerNorm,
    mlp: Mlp,
}

impl EncoderBlock {
    fn new(cfg: &Vit3dConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm1: layer_norm(cfg.embed_dim, LAYER_NORM_EPS, vb.pp("norm1"))?,
            attn: MultiHeadSelfAttention::new(
                cfg.embed_dim,
                cfg.num_heads,
                cfg.qkv_bias,
                cfg.attn_drop_rate,
                cfg.drop_rate,
                vb.pp("attn"),
            )?,
            norm2: layer_norm(cfg.embed_dim, LAYER_NORM_EPS, vb.pp("norm2"))?,
            mlp: Mlp::new(
                cfg.embed_dim,
                cfg.mlp_hidden_dim(),
                cfg.drop_rate,
                vb.pp("mlp"),
            )?,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let residual = x;
        let x = self.attn.forward(&self.norm1.forward(x)?, train)?;
        let x = (residual + x)?;
        let residual = &x;
        let x = self.mlp.forward(&self.norm2.forward(&x)?, train)?;
        residual + x
    }
}

// ─── Model assembly ──────────────────────────────────────────────────────────

/// 3D ViT: patch embedding, classification token, positional table, encoder
/// stack, final norm and multi-label head.
///
/// Sequence length is fixed at construction; volumes producing a different
/// patch count cannot be processed without rebuilding the model.
pub struct VisionTransformer3d {
    patch_embed: PatchEmbed3d,
    cls_token: Tensor,
    pos_embed: Tensor,
    pos_drop: Dropout,
    blocks: Vec<EncoderBlock>,
    norm: LayerNorm,
    head_fc1: Linear,
    head_fc2: Linear,
    head_drop: Dropout,
    embed_dim: usize,
    num_classes: usize,
    use_checkpointing: bool,
}

impl VisionTransformer3d {
    /// Build the model's layers from `vb`. Fails fast on an invalid config.
    pub fn new(cfg: &Vit3dConfig, vb: VarBuilder) -> std::result::Result<Self, ModelError> {
        cfg.validate()?;

        let patch_embed = PatchEmbed3d::new(cfg, vb.pp("patch_embed"))?;
        let cls_token = vb.get_with_hints(
            (1, 1, cfg.embed_dim),
            "cls_token",
            candle_nn::Init::Const(0.0),
        )?;
        let pos_embed = vb.get_with_hints(
            (1, cfg.seq_len(), cfg.embed_dim),
            "pos_embed",
            candle_nn::Init::Const(0.0),
        )?;
        let blocks = (0..cfg.depth)
            .map(|i| EncoderBlock::new(cfg, vb.pp("blocks").pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let norm = layer_norm(cfg.embed_dim, LAYER_NORM_EPS, vb.pp("norm"))?;
        let head_fc1 = linear(cfg.embed_dim, HEAD_HIDDEN, vb.pp("head").pp("fc1"))?;
        let head_fc2 = linear(HEAD_HIDDEN, cfg.num_classes, vb.pp("head").pp("fc2"))?;

        Ok(Self {
            patch_embed,
            cls_token,
            pos_embed,
            pos_drop: Dropout::new(cfg.drop_rate),
            blocks,
            norm,
            head_fc1,
            head_fc2,
            head_drop: Dropout::new(HEAD_DROP),
            embed_dim: cfg.embed_dim,
            num_classes: cfg.num_classes,
            use_checkpointing: cfg.use_checkpointing,
        })
    }

    /// Build with fresh trainable parameters (truncated-normal policy) and
    /// return the `VarMap` the external optimizer updates.
    pub fn with_random_init(
        cfg: &Vit3dConfig,
        device: &Device,
        seed: u64,
    ) -> std::result::Result<(Self, VarMap), ModelError> {
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Self::new(cfg, vb)?;
        init::reset_parameters(&mut varmap, seed)?;
        Ok((model, varmap))
    }

    pub fn n_patches(&self) -> usize {
        self.patch_embed.n_patches()
    }

    /// Sequence length including the classification token.
    pub fn seq_len(&self) -> usize {
        self.patch_embed.n_patches() + 1
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Whether the caller asked for gradient checkpointing. Candle's
    /// autograd exposes no activation-recompute hook, so the request is
    /// recorded but the forward path is identical either way; it is only
    /// meaningful while gradients are tracked.
    pub fn checkpointing_requested(&self) -> bool {
        self.use_checkpointing
    }

    /// Encode a batch of volumes and return the classification token's
    /// final representation: `[B, C, D, H, W]` → `[B, embed_dim]`.
    pub fn forward_features(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let b = x.dim(0)?;
        let tokens = self.patch_embed.forward(x)?;

        let cls = self
            .cls_token
            .broadcast_as((b, 1, self.embed_dim))?
            .contiguous()?;
        let x = Tensor::cat(&[&cls, &tokens], 1)?;
        let x = x.broadcast_add(&self.pos_embed)?;
        let mut x = self.pos_drop.forward(&x, train)?;

        for block in &self.blocks {
            x = block.forward(&x, train)?;
        }

        let x = self.norm.forward(&x)?;
        // Patch tokens are discarded: position 0 stands in for the volume.
        x.narrow(1, 0, 1)?.squeeze(1)
    }

    /// `[B, C, D, H, W]` → `[B, num_classes]` raw multi-label logits.
    /// Sigmoid/thresholding is the caller's concern.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let features = self.forward_features(x, train)?;
        let x = self.head_fc1.forward(&features)?.relu()?;
        let x = self.head_drop.forward(&x, train)?;
        self.head_fc2.forward(&x)
    }
}

// ─── Preset factories ────────────────────────────────────────────────────────

fn build_preset(
    preset: Vit3dConfig,
    num_classes: usize,
    use_checkpointing: bool,
    device: &Device,
) -> std::result::Result<(VisionTransformer3d, VarMap), ModelError> {
    let cfg = Vit3dConfig {
        num_classes,
        use_checkpointing,
        ..preset
    };
    VisionTransformer3d::with_random_init(&cfg, device, DEFAULT_INIT_SEED)
}

/// Tiny 3D ViT (faster training, less memory).
pub fn vit_tiny_3d(
    num_classes: usize,
    use_checkpointing: bool,
    device: &Device,
) -> std::result::Result<(VisionTransformer3d, VarMap), ModelError> {
    build_preset(Vit3dConfig::tiny(), num_classes, use_checkpointing, device)
}

/// Small 3D ViT.
pub fn vit_small_3d(
    num_classes: usize,
    use_checkpointing: bool,
    device: &Device,
) -> std::result::Result<(VisionTransformer3d, VarMap), ModelError> {
    build_preset(Vit3dConfig::small(), num_classes, use_checkpointing, device)
}

/// Base 3D ViT.
pub fn vit_base_3d(
    num_classes: usize,
    use_checkpointing: bool,
    device: &Device,
) -> std::result::Result<(VisionTransformer3d, VarMap), ModelError> {
    build_preset(Vit3dConfig::base(), num_classes, use_checkpointing, device)
}

/// Large 3D ViT (requires significant memory).
pub fn vit_large_3d(
    num_classes: usize,
    use_checkpointing: bool,
    device: &Device,
) -> std::result::Result<(VisionTransformer3d, VarMap), ModelError> {
    build_preset(Vit3dConfig::large(), num_classes, use_checkpointing, device)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parameter_count;

    fn tiny_cfg() -> Vit3dConfig {
        Vit3dConfig {
            volume_size: (8, 8, 8),
            patch_size: (4, 4, 4),
            in_channels: 1,
            num_classes: 3,
            embed_dim: 16,
            depth: 2,
            num_heads: 2,
            mlp_ratio: 2.0,
            ..Vit3dConfig::default()
        }
    }

    #[test]
    fn cube_32_with_16_patches_gives_9_tokens() {
        let cfg = Vit3dConfig {
            volume_size: (32, 32, 32),
            patch_size: (16, 16, 16),
            num_classes: 4,
            embed_dim: 16,
            depth: 1,
            num_heads: 2,
            ..Vit3dConfig::default()
        };
        let (model, _vars) =
            VisionTransformer3d::with_random_init(&cfg, &Device::Cpu, 0).unwrap();
        assert_eq!(model.n_patches(), 8);
        assert_eq!(model.seq_len(), 9);

        let x = Tensor::zeros((1, 1, 32, 32, 32), DType::F32, &Device::Cpu).unwrap();
        let logits = model.forward(&x, false).unwrap();
        assert_eq!(logits.dims(), &[1, 4]);
    }

    #[test]
    fn output_shape_invariant_across_batch_sizes() {
        let cfg = tiny_cfg();
        let (model, _vars) =
            VisionTransformer3d::with_random_init(&cfg, &Device::Cpu, 0).unwrap();
        for batch in [1usize, 2, 8] {
            let x = Tensor::randn(0.0f32, 1.0, (batch, 1, 8, 8, 8), &Device::Cpu).unwrap();
            let logits = model.forward(&x, false).unwrap();
            assert_eq!(logits.dims(), &[batch, 3]);
        }
    }

    #[test]
    fn features_have_embed_width() {
        let cfg = tiny_cfg();
        let (model, _vars) =
            VisionTransformer3d::with_random_init(&cfg, &Device::Cpu, 0).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (2, 1, 8, 8, 8), &Device::Cpu).unwrap();
        let features = model.forward_features(&x, false).unwrap();
        assert_eq!(features.dims(), &[2, 16]);
    }

    #[test]
    fn training_forward_with_dropout_keeps_shape() {
        let cfg = Vit3dConfig {
            drop_rate: 0.2,
            attn_drop_rate: 0.1,
            ..tiny_cfg()
        };
        let (model, _vars) =
            VisionTransformer3d::with_random_init(&cfg, &Device::Cpu, 0).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (2, 1, 8, 8, 8), &Device::Cpu).unwrap();
        let logits = model.forward(&x, true).unwrap();
        assert_eq!(logits.dims(), &[2, 3]);
        let values: Vec<f32> = logits.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn varmap_matches_analytic_parameter_count() {
        let cfg = tiny_cfg();
        let (_model, vars) =
            VisionTransformer3d::with_random_init(&cfg, &Device::Cpu, 0).unwrap();
        assert_eq!(parameter_count(&vars), cfg.parameter_count());
    }

    #[test]
    fn init_policy_applied() {
        let cfg = tiny_cfg();
        let (_model, vars) =
            VisionTransformer3d::with_random_init(&cfg, &Device::Cpu, 0).unwrap();
        let bound = (2.0 * init::INIT_STD) as f32;

        let data = vars.data().lock().unwrap();
        for (name, var) in data.iter() {
            let values: Vec<f32> = var
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap();
            if name.ends_with(".bias") {
                assert!(values.iter().all(|v| *v == 0.0), "{name} has nonzero bias");
            } else if name.contains("norm") && name.ends_with(".weight") {
                assert!(values.iter().all(|v| *v == 1.0), "{name} scale != 1");
            } else {
                assert!(
                    values.iter().all(|v| v.abs() <= bound),
                    "{name} exceeds truncation bound"
                );
                assert!(
                    values.iter().any(|v| v.abs() > 1e-5),
                    "{name} was left at zero"
                );
            }
        }
    }

    #[test]
    fn invalid_config_aborts_construction() {
        let cfg = Vit3dConfig {
            volume_size: (30, 32, 32),
            patch_size: (16, 16, 16),
            ..tiny_cfg()
        };
        let result = VisionTransformer3d::with_random_init(&cfg, &Device::Cpu, 0);
        assert!(matches!(result, Err(ModelError::Config(_))));
    }

    #[test]
    fn patch_raster_order_is_depth_major() {
        // Mean-pooling projection: every embedding channel averages its
        // patch, so token values reveal which patch landed where.
        let cfg = Vit3dConfig {
            volume_size: (4, 4, 4),
            patch_size: (2, 2, 2),
            embed_dim: 4,
            depth: 1,
            num_heads: 1,
            ..Vit3dConfig::default()
        };
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let embed = PatchEmbed3d::new(&cfg, vb).unwrap();

        let patch_dim = cfg.patch_dim();
        let weight = Tensor::full(
            1.0f32 / patch_dim as f32,
            (cfg.embed_dim, patch_dim),
            &Device::Cpu,
        )
        .unwrap();
        varmap.set_one("proj.weight", &weight).unwrap();
        varmap
            .set_one(
                "proj.bias",
                &Tensor::zeros(cfg.embed_dim, DType::F32, &Device::Cpu).unwrap(),
            )
            .unwrap();

        // Fill each voxel with its patch's raster index.
        let mut data = vec![0.0f32; 64];
        for d in 0..4 {
            for h in 0..4 {
                for w in 0..4 {
                    let id = ((d / 2) * 2 + (h / 2)) * 2 + (w / 2);
                    data[(d * 4 + h) * 4 + w] = id as f32;
                }
            }
        }
        let x = Tensor::from_vec(data, (1, 1, 4, 4, 4), &Device::Cpu).unwrap();
        let tokens = embed.forward(&x).unwrap();
        assert_eq!(tokens.dims(), &[1, 8, 4]);

        let values: Vec<f32> = tokens.flatten_all().unwrap().to_vec1().unwrap();
        for patch in 0..8 {
            for channel in 0..4 {
                let v = values[patch * 4 + channel];
                assert!(
                    (v - patch as f32).abs() < 1e-5,
                    "patch {patch} channel {channel}: {v}"
                );
            }
        }
    }

    #[test]
    fn checkpointing_flag_is_carried() {
        let cfg = Vit3dConfig {
            use_checkpointing: true,
            ..tiny_cfg()
        };
        let (model, _vars) =
            VisionTransformer3d::with_random_init(&cfg, &Device::Cpu, 0).unwrap();
        assert!(model.checkpointing_requested());
        // Flag or not, inference output is identical for identical weights.
        let (plain, _vars) = VisionTransformer3d::with_random_init(
            &Vit3dConfig {
                use_checkpointing: false,
                ..tiny_cfg()
            },
            &Device::Cpu,
            0,
        )
        .unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (1, 1, 8, 8, 8), &Device::Cpu).unwrap();
        let a: Vec<f32> = model
            .forward(&x, false)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let b: Vec<f32> = plain
            .forward(&x, false)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn tiny_factory_builds() {
        let (model, vars) = vit_tiny_3d(5, false, &Device::Cpu).unwrap();
        assert_eq!(model.num_classes(), 5);
        assert_eq!(
            parameter_count(&vars),
            Vit3dConfig {
                num_classes: 5,
                ..Vit3dConfig::tiny()
            }
            .parameter_count()
        );
    }
}
