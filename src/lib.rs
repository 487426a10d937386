//! fashion-encoder: masked outfit transformer training with Fill-In-The-Blank evaluation

pub mod fashion;

pub use fashion::error::{EncoderError, Result};
pub use fashion::settings::{HyperParams, Preset};

/// Test utilities for backend-aware tensor construction and synthetic outfits
///
/// Provides helpers for building tensors with Burn 0.18's `TensorData` API and
/// for generating small, deterministic outfit/FITB datasets.
pub mod test_utils;
