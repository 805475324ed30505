use candle_core::{IndexOp, Module, Result, Tensor};
use candle_nn::{linear, linear_no_bias, ops::softmax_last_dim, Dropout, Linear, VarBuilder};

/// Bidirectional multi-head self-attention over a token sequence.
///
/// A single fused linear projects the input into Q, K and V for all heads.
/// Every token attends to every other token (no mask): this is how global
/// volume context reaches the classification token even though the patch
/// embedding itself is strictly patch-local.
pub struct MultiHeadSelfAttention {
    qkv: Linear,
    proj: Linear,
    attn_drop: Dropout,
    proj_drop: Dropout,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl MultiHeadSelfAttention {
    pub fn new(
        dim: usize,
        num_heads: usize,
        qkv_bias: bool,
        attn_drop: f32,
        proj_drop: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let qkv = if qkv_bias {
            linear(dim, dim * 3, vb.pp("qkv"))?
        } else {
            linear_no_bias(dim, dim * 3, vb.pp("qkv"))?
        };
        let head_dim = dim / num_heads;
        Ok(Self {
            qkv,
            proj: linear(dim, dim, vb.pp("proj"))?,
            attn_drop: Dropout::new(attn_drop),
            proj_drop: Dropout::new(proj_drop),
            num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    /// Split `[B, N, 3D]` QKV output into per-head Q, K, V of `[B, H, N, d]`.
    fn qkv_heads(&self, x: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (b, n, _d) = x.dims3()?;
        let qkv = self
            .qkv
            .forward(x)?
            .reshape((b, n, 3, self.num_heads, self.head_dim))?
            .permute((2, 0, 3, 1, 4))?;
        let q = qkv.i(0)?.contiguous()?;
        let k = qkv.i(1)?.contiguous()?;
        let v = qkv.i(2)?.contiguous()?;
        Ok((q, k, v))
    }

    /// Attention probabilities `[B, H, N, N]` (post-softmax, pre-dropout).
    ///
    /// Each row is a distribution over key positions and sums to 1.
    pub fn attention_weights(&self, x: &Tensor) -> Result<Tensor> {
        let (q, k, _v) = self.qkv_heads(x)?;
        let scores = (q.matmul(&k.transpose(2, 3)?)? * self.scale)?;
        softmax_last_dim(&scores)
    }

    /// `x`: `[B, N, D]` → `[B, N, D]`. Dropout is identity when `train` is false.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (b, n, _d) = x.dims3()?;
        let (q, k, v) = self.qkv_heads(x)?;

        let scores = (q.matmul(&k.transpose(2, 3)?)? * self.scale)?;
        let attn = softmax_last_dim(&scores)?;
        let attn = self.attn_drop.forward(&attn, train)?;

        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, n, self.num_heads * self.head_dim))?;
        let out = self.proj.forward(&out)?;
        self.proj_drop.forward(&out, train)
    }
}
