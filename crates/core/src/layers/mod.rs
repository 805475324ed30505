pub mod attention;
pub mod mlp;

pub use attention::MultiHeadSelfAttention;
pub use mlp::Mlp;
