//! Core library for CT pathology classification with a 3D Vision Transformer.
//!
//! Two subsystems carry the weight here:
//!
//! - [`preprocess`]: a deterministic chain that turns a raw NIfTI volume into
//!   a fixed-shape, `[0, 1]`-normalized tensor (orientation, spacing, HU
//!   clipping, resize), with a fail-soft boundary that substitutes a zero
//!   tensor for unreadable or malformed inputs.
//! - [`models`]: the patch-based 3D transformer (patch embedding, pre-norm
//!   encoder stack, classification head) built on `candle`.
//!
//! Dataset indexing, the training loop, and report generation are external
//! collaborators; the narrow types they exchange with this crate live in
//! [`history`].

pub mod config;
pub mod history;
pub mod layers;
pub mod models;
pub mod preprocess;
pub mod volume;
