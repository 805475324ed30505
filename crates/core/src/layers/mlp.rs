use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Dropout, Linear, VarBuilder};

/// Position-wise feed-forward block: expand, GELU, project back.
pub struct Mlp {
    fc1: Linear,
    fc2: Linear,
    drop: Dropout,
}

impl Mlp {
    pub fn new(dim: usize, hidden_dim: usize, drop: f32, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(dim, hidden_dim, vb.pp("fc1"))?,
            fc2: linear(hidden_dim, dim, vb.pp("fc2"))?,
            drop: Dropout::new(drop),
        })
    }

    /// Applied independently per token position; shape-preserving on `[B, N, D]`.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.fc1.forward(x)?.gelu_erf()?;
        let x = self.drop.forward(&x, train)?;
        let x = self.fc2.forward(&x)?;
        self.drop.forward(&x, train)
    }
}
