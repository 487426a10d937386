// Test utilities for tensor construction and synthetic outfit data
//
// Tensor helpers follow the Vec + TensorData pattern used with Burn 0.18;
// the synthetic generators are seeded with ChaCha8 so every test sees the
// same outfits and FITB questions.

use burn::tensor::{backend::Backend, Bool, Tensor, TensorData};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::path::Path;

use crate::fashion::data::record::{FitbRecord, OutfitRecord};
use crate::fashion::settings::{CategoryMerge, HyperParams};

/// Create f32 tensor from data slice with specified shape
pub fn tensor_from_f32_vec<B: Backend, const D: usize>(
    data: &[f32],
    shape: [usize; D],
    device: &B::Device,
) -> Tensor<B, D> {
    let expected_size: usize = shape.iter().product();
    assert_eq!(data.len(), expected_size,
        "Data length {} doesn't match shape {:?} (expected {})",
        data.len(), shape, expected_size);

    Tensor::from_data(TensorData::new(data.to_vec(), shape), device)
}

/// Create bool tensor from data slice with specified shape
pub fn tensor_from_bool_vec<B: Backend, const D: usize>(
    data: &[bool],
    shape: [usize; D],
    device: &B::Device,
) -> Tensor<B, D, Bool> {
    let expected_size: usize = shape.iter().product();
    assert_eq!(data.len(), expected_size,
        "Data length {} doesn't match shape {:?} (expected {})",
        data.len(), shape, expected_size);

    Tensor::from_data(TensorData::new(data.to_vec(), shape), device)
}

/// Small, fast configuration writing into `checkpoint_dir`.
///
/// Categories stay ungrouped; ids must be below 8.
pub fn tiny_params(feature_dim: usize, checkpoint_dir: &Path) -> HyperParams {
    HyperParams {
        feature_dim,
        hidden_size: 8,
        num_hidden_layers: 1,
        num_heads: 2,
        filter_size: 16,
        dropout: 0.0,
        learning_rate: 1e-3,
        category_dim: 8,
        categories_count: 8,
        category_merge: CategoryMerge::Add,
        with_category_grouping: false,
        categorywise_train: false,
        batch_size: 2,
        epoch_count: 4,
        validation_frequency: 2,
        early_stop: false,
        checkpoint_dir: Some(checkpoint_dir.to_path_buf()),
        ..HyperParams::default()
    }
}

fn random_item(rng: &mut ChaCha8Rng, feature_dim: usize) -> Vec<f32> {
    (0..feature_dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

/// Outfits of `min_len..=max_len` items with categories in `2..categories_count`.
pub fn synthetic_outfits(
    count: usize,
    min_len: usize,
    max_len: usize,
    feature_dim: usize,
    categories_count: i64,
    seed: u64,
) -> Vec<OutfitRecord> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut next_id = 0i64;

    (0..count)
        .map(|_| {
            let len = rng.gen_range(min_len..=max_len);
            let ids = (0..len)
                .map(|_| {
                    next_id += 1;
                    next_id
                })
                .collect();
            let categories = (0..len).map(|_| rng.gen_range(2..categories_count)).collect();
            let features = (0..len).map(|_| random_item(&mut rng, feature_dim)).collect();
            OutfitRecord::with_features(ids, categories, features)
        })
        .collect()
}

/// FITB questions with `context_len` context items and `candidates` answers each.
pub fn synthetic_fitb(
    count: usize,
    context_len: usize,
    candidates: usize,
    feature_dim: usize,
    categories_count: i64,
    seed: u64,
) -> Vec<FitbRecord> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    (0..count)
        .map(|_| FitbRecord {
            inputs: (0..context_len).map(|_| random_item(&mut rng, feature_dim)).collect(),
            input_categories: (0..context_len).map(|_| rng.gen_range(2..categories_count)).collect(),
            targets: (0..candidates).map(|_| random_item(&mut rng, feature_dim)).collect(),
            target_categories: (0..candidates).map(|_| rng.gen_range(2..categories_count)).collect(),
            target_position: rng.gen_range(0..candidates),
        })
        .collect()
}
