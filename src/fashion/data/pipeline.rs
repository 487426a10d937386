//! Record parsing, category remapping, mask assignment, padding and batching.
//!
//! Parsed outfits are cached once per dataset, before any mask position is
//! assigned. Every epoch draws a fresh shuffle and fresh mask positions from
//! `(seed, epoch)`, so training sees a different masked item per outfit each
//! epoch while the run stays reproducible.

use burn::tensor::{backend::Backend, Bool, Int, Tensor, TensorData};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::path::PathBuf;

use super::category::{apply_grouping, CategoryLookup};
use super::masking::{epoch_seed, insert_mask_token, MaskSampler, MaskedContext};
use super::record::{read_records, FitbRecord, ItemContent, OutfitRecord};
use crate::fashion::error::{EncoderError, Result};
use crate::fashion::settings::HyperParams;

/// Keeps the mask stream independent of the shuffle stream.
const MASK_STREAM: u64 = 0x6d61_736b;

/// A parsed outfit with categories already remapped.
#[derive(Debug, Clone, PartialEq)]
pub struct Outfit {
    pub ids: Vec<i64>,
    pub categories: Vec<i64>,
    pub features: Vec<Vec<f32>>,
}

impl Outfit {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Padded model input for a batch of sequences.
#[derive(Debug, Clone)]
pub struct SequenceBatch<B: Backend> {
    /// `[batch, seq_len, feature_dim]`, zero padded
    pub items: Tensor<B, 3>,
    /// `[batch, seq_len]`, zero padded
    pub categories: Tensor<B, 2, Int>,
    /// `[batch, seq_len]`, `true` at padding
    pub pad_mask: Tensor<B, 2, Bool>,
    /// Masked position of each row; empty when nothing is masked
    pub mask_positions: Vec<usize>,
    /// Category of the masked item of each row
    pub mask_categories: Vec<i64>,
}

impl<B: Backend> SequenceBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.items.dims()[0]
    }
}

/// Pad sequences of `(features, categories)` to the longest one.
pub fn pad_sequences<B: Backend>(
    sequences: &[(&[Vec<f32>], &[i64])],
    feature_dim: usize,
    device: &B::Device,
) -> (Tensor<B, 3>, Tensor<B, 2, Int>, Tensor<B, 2, Bool>) {
    let batch = sequences.len();
    let max_len = sequences.iter().map(|(items, _)| items.len()).max().unwrap_or(0);

    let mut items = vec![0.0f32; batch * max_len * feature_dim];
    let mut categories = vec![0i64; batch * max_len];
    let mut padding = vec![true; batch * max_len];

    for (row, (features, cats)) in sequences.iter().enumerate() {
        for (pos, (feature, &category)) in features.iter().zip(cats.iter()).enumerate() {
            let offset = (row * max_len + pos) * feature_dim;
            items[offset..offset + feature_dim].copy_from_slice(feature);
            categories[row * max_len + pos] = category;
            padding[row * max_len + pos] = false;
        }
    }

    (
        Tensor::from_data(TensorData::new(items, [batch, max_len, feature_dim]), device),
        Tensor::from_data(TensorData::new(categories, [batch, max_len]), device),
        Tensor::from_data(TensorData::new(padding, [batch, max_len]), device),
    )
}

/// Order and mask positions of one pass over an [`OutfitDataset`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochPlan {
    /// `(outfit index, mask position)` per batch row
    pub batches: Vec<Vec<(usize, usize)>>,
}

impl EpochPlan {
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

/// Cached training or masking-validation outfits.
#[derive(Debug, Clone)]
pub struct OutfitDataset {
    outfits: Vec<Outfit>,
    feature_dim: usize,
}

impl OutfitDataset {
    pub fn from_files(
        paths: &[PathBuf],
        lookup: Option<&CategoryLookup>,
        params: &HyperParams,
    ) -> Result<Self> {
        let mut records = Vec::new();
        for path in paths {
            records.extend(read_records::<OutfitRecord>(path)?);
        }
        let dataset = Self::from_records(records, lookup, params)?;
        log::info!("loaded {} outfits from {} shard(s)", dataset.len(), paths.len());
        Ok(dataset)
    }

    pub fn from_records(
        records: Vec<OutfitRecord>,
        lookup: Option<&CategoryLookup>,
        params: &HyperParams,
    ) -> Result<Self> {
        let outfits = records
            .into_iter()
            .enumerate()
            .map(|(index, record)| parse_outfit(index, record, lookup, params))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            outfits,
            feature_dim: params.feature_dim,
        })
    }

    pub fn len(&self) -> usize {
        self.outfits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outfits.is_empty()
    }

    pub fn outfits(&self) -> &[Outfit] {
        &self.outfits
    }

    /// Full batches per training epoch; the trailing partial batch is dropped.
    pub fn batches_per_epoch(&self, batch_size: usize) -> usize {
        self.outfits.len() / batch_size.max(1)
    }

    /// Shuffled order and freshly sampled mask positions for one training epoch.
    pub fn plan_epoch(&self, epoch: usize, batch_size: usize, seed: u64) -> Result<EpochPlan> {
        let mut order: Vec<usize> = (0..self.outfits.len()).collect();
        order.shuffle(&mut StdRng::seed_from_u64(epoch_seed(seed, epoch)));

        let mut sampler = MaskSampler::for_epoch(seed ^ MASK_STREAM, epoch);
        let rows = self.assign_masks(&order, &mut sampler)?;

        Ok(EpochPlan {
            batches: rows
                .chunks_exact(batch_size.max(1))
                .map(|chunk| chunk.to_vec())
                .collect(),
        })
    }

    /// Dataset order with fixed mask positions, keeping the trailing partial batch.
    pub fn plan_evaluation(&self, batch_size: usize, seed: u64) -> Result<EpochPlan> {
        let order: Vec<usize> = (0..self.outfits.len()).collect();
        let mut sampler = MaskSampler::new(seed ^ MASK_STREAM);
        let rows = self.assign_masks(&order, &mut sampler)?;

        Ok(EpochPlan {
            batches: rows
                .chunks(batch_size.max(1))
                .map(|chunk| chunk.to_vec())
                .collect(),
        })
    }

    /// Build the padded tensors for one planned batch.
    pub fn assemble<B: Backend>(&self, rows: &[(usize, usize)], device: &B::Device) -> SequenceBatch<B> {
        let sequences: Vec<(&[Vec<f32>], &[i64])> = rows
            .iter()
            .map(|&(idx, _)| {
                let outfit = &self.outfits[idx];
                (outfit.features.as_slice(), outfit.categories.as_slice())
            })
            .collect();
        let (items, categories, pad_mask) = pad_sequences::<B>(&sequences, self.feature_dim, device);

        SequenceBatch {
            items,
            categories,
            pad_mask,
            mask_positions: rows.iter().map(|&(_, pos)| pos).collect(),
            mask_categories: rows
                .iter()
                .map(|&(idx, pos)| self.outfits[idx].categories[pos])
                .collect(),
        }
    }

    /// Plan and assemble a whole training epoch.
    pub fn epoch_batches<B: Backend>(
        &self,
        epoch: usize,
        batch_size: usize,
        seed: u64,
        device: &B::Device,
    ) -> Result<Vec<SequenceBatch<B>>> {
        let plan = self.plan_epoch(epoch, batch_size, seed)?;
        Ok(plan
            .batches
            .iter()
            .map(|rows| self.assemble(rows, device))
            .collect())
    }

    fn assign_masks(&self, order: &[usize], sampler: &mut MaskSampler) -> Result<Vec<(usize, usize)>> {
        let lengths: Vec<usize> = order.iter().map(|&idx| self.outfits[idx].len()).collect();
        let positions = sampler.sample_batch(&lengths)?;
        Ok(order.iter().copied().zip(positions).collect())
    }
}

fn parse_outfit(
    index: usize,
    record: OutfitRecord,
    lookup: Option<&CategoryLookup>,
    params: &HyperParams,
) -> Result<Outfit> {
    record.validate(index)?;
    if record.is_empty() {
        return Err(EncoderError::EmptySequence);
    }

    let features = match record.content {
        ItemContent::Features { features } => features,
        ItemContent::Images { .. } => {
            return Err(EncoderError::malformed(
                index,
                "image records need a visual feature extractor; provide extracted features",
            ))
        }
    };
    check_feature_width(index, &features, params.feature_dim)?;

    let categories = apply_grouping(lookup, &record.categories)?;
    check_category_range(index, &categories, params.categories_count)?;

    Ok(Outfit {
        ids: record.ids,
        categories,
        features,
    })
}

fn check_feature_width(index: usize, features: &[Vec<f32>], feature_dim: usize) -> Result<()> {
    match features.iter().position(|f| f.len() != feature_dim) {
        Some(pos) => Err(EncoderError::malformed(
            index,
            format!(
                "item {} has {} features, expected {}",
                pos,
                features[pos].len(),
                feature_dim
            ),
        )),
        None => Ok(()),
    }
}

fn check_category_range(index: usize, categories: &[i64], categories_count: usize) -> Result<()> {
    match categories
        .iter()
        .find(|&&c| c < 0 || c as usize >= categories_count)
    {
        Some(c) => Err(EncoderError::malformed(
            index,
            format!("category {} outside [0, {})", c, categories_count),
        )),
        None => Ok(()),
    }
}

/// One FITB question ready for evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct FitbSample {
    /// Context with the mask token at position 0
    pub context: MaskedContext,
    pub targets: Vec<Vec<f32>>,
    pub target_categories: Vec<i64>,
    pub target_position: usize,
}

/// Tensors for one FITB question.
#[derive(Debug, Clone)]
pub struct FitbBatch<B: Backend> {
    /// Batch of one with the mask token at position 0
    pub context: SequenceBatch<B>,
    /// Candidate answers as a batch of one unmasked sequence
    pub candidates: SequenceBatch<B>,
    pub answer: usize,
}

impl FitbSample {
    pub fn to_batch<B: Backend>(&self, feature_dim: usize, device: &B::Device) -> FitbBatch<B> {
        let (items, categories, pad_mask) = pad_sequences::<B>(
            &[(self.context.inputs.as_slice(), self.context.categories.as_slice())],
            feature_dim,
            device,
        );
        let context = SequenceBatch {
            items,
            categories,
            pad_mask,
            mask_positions: vec![MaskedContext::MASK_POSITION],
            mask_categories: vec![self.context.categories[MaskedContext::MASK_POSITION]],
        };

        let (items, categories, pad_mask) = pad_sequences::<B>(
            &[(self.targets.as_slice(), self.target_categories.as_slice())],
            feature_dim,
            device,
        );
        let candidates = SequenceBatch {
            items,
            categories,
            pad_mask,
            mask_positions: Vec::new(),
            mask_categories: Vec::new(),
        };

        FitbBatch {
            context,
            candidates,
            answer: self.target_position,
        }
    }
}

/// Cached FITB questions; evaluated one at a time and never dropped.
#[derive(Debug, Clone)]
pub struct FitbDataset {
    samples: Vec<FitbSample>,
    feature_dim: usize,
}

impl FitbDataset {
    pub fn from_files(
        paths: &[PathBuf],
        lookup: Option<&CategoryLookup>,
        use_mask_category: bool,
        params: &HyperParams,
    ) -> Result<Self> {
        let mut records = Vec::new();
        for path in paths {
            records.extend(read_records::<FitbRecord>(path)?);
        }
        let dataset = Self::from_records(records, lookup, use_mask_category, params)?;
        log::info!("loaded {} FITB questions", dataset.len());
        Ok(dataset)
    }

    pub fn from_records(
        records: Vec<FitbRecord>,
        lookup: Option<&CategoryLookup>,
        use_mask_category: bool,
        params: &HyperParams,
    ) -> Result<Self> {
        let samples = records
            .into_iter()
            .enumerate()
            .map(|(index, record)| parse_fitb(index, record, lookup, use_mask_category, params))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            samples,
            feature_dim: params.feature_dim,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[FitbSample] {
        &self.samples
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn batches<'a, B: Backend>(
        &'a self,
        device: &'a B::Device,
    ) -> impl Iterator<Item = FitbBatch<B>> + 'a {
        self.samples
            .iter()
            .map(move |sample| sample.to_batch(self.feature_dim, device))
    }
}

fn parse_fitb(
    index: usize,
    record: FitbRecord,
    lookup: Option<&CategoryLookup>,
    use_mask_category: bool,
    params: &HyperParams,
) -> Result<FitbSample> {
    record.validate(index)?;
    check_feature_width(index, &record.inputs, params.feature_dim)?;
    check_feature_width(index, &record.targets, params.feature_dim)?;

    let input_categories = apply_grouping(lookup, &record.input_categories)?;
    let target_categories = apply_grouping(lookup, &record.target_categories)?;
    check_category_range(index, &input_categories, params.categories_count)?;
    check_category_range(index, &target_categories, params.categories_count)?;

    let true_category = use_mask_category.then(|| target_categories[record.target_position]);
    let context = insert_mask_token(
        &record.inputs,
        &input_categories,
        params.feature_dim,
        true_category,
    );

    Ok(FitbSample {
        context,
        targets: record.targets,
        target_categories,
        target_position: record.target_position,
    })
}
