//! Mask-position sampling and FITB mask-token synthesis.

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::fashion::error::{EncoderError, Result};

/// Category id given to the FITB mask token when the true category is not used.
pub const MASK_PLACEHOLDER_CATEGORY: i64 = 1;

/// Fill value of every component of the FITB mask token.
pub const MASK_TOKEN_FILL: f32 = 1.0;

/// Seeded source of uniform training mask positions.
#[derive(Debug, Clone)]
pub struct MaskSampler {
    rng: StdRng,
}

impl MaskSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Independent stream for one epoch, so positions are re-drawn every epoch
    /// while staying reproducible for a given `(seed, epoch)`.
    pub fn for_epoch(seed: u64, epoch: usize) -> Self {
        Self::new(epoch_seed(seed, epoch))
    }

    /// Uniform position in `[0, len)`.
    pub fn sample(&mut self, len: usize) -> Result<usize> {
        if len == 0 {
            return Err(EncoderError::EmptySequence);
        }
        Ok(self.rng.gen_range(0..len))
    }

    /// One position per sequence length.
    pub fn sample_batch(&mut self, lengths: &[usize]) -> Result<Vec<usize>> {
        lengths.iter().map(|&len| self.sample(len)).collect()
    }
}

/// Mix an epoch index into the run seed.
pub fn epoch_seed(seed: u64, epoch: usize) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(epoch as u64)
        .rotate_left(17)
}

/// A FITB context with the mask token prepended at position 0.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedContext {
    pub inputs: Vec<Vec<f32>>,
    pub categories: Vec<i64>,
}

impl MaskedContext {
    /// Position of the mask token.
    pub const MASK_POSITION: usize = 0;
}

/// Prepend the mask token to a FITB context.
///
/// The token copies the width of the first candidate and is filled with
/// [`MASK_TOKEN_FILL`]; its category is `true_category` when given, otherwise
/// [`MASK_PLACEHOLDER_CATEGORY`].
pub fn insert_mask_token(
    inputs: &[Vec<f32>],
    categories: &[i64],
    item_width: usize,
    true_category: Option<i64>,
) -> MaskedContext {
    let mut masked_inputs = Vec::with_capacity(inputs.len() + 1);
    masked_inputs.push(vec![MASK_TOKEN_FILL; item_width]);
    masked_inputs.extend(inputs.iter().cloned());

    let mut masked_categories = Vec::with_capacity(categories.len() + 1);
    masked_categories.push(true_category.unwrap_or(MASK_PLACEHOLDER_CATEGORY));
    masked_categories.extend_from_slice(categories);

    MaskedContext {
        inputs: masked_inputs,
        categories: masked_categories,
    }
}
