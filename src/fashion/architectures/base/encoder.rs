//! Model boundary and the reference outfit encoder.
//!
//! The training loop and the FITB evaluator only talk to models through
//! [`OutfitModel`]: a forward pass over a padded [`SequenceBatch`] that yields
//! per-position outputs and per-position target embeddings, and a
//! preprocessor pass that embeds raw items the same way the forward pass
//! embeds its inputs.

use burn::{
    config::Config,
    module::{Ignored, Module, Param},
    nn::{
        transformer::{TransformerEncoder, TransformerEncoderConfig, TransformerEncoderInput},
        Dropout, DropoutConfig, Embedding, EmbeddingConfig, Linear, LinearConfig,
    },
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::{backend::Backend, Distribution, Int, Tensor},
};
use std::path::Path;

use super::loss_utils::mask_one_hot;
use crate::fashion::data::pipeline::SequenceBatch;
use crate::fashion::settings::{CategoryMerge, HyperParams};

/// File stem of the preprocessor artifact.
pub const PREPROCESSOR_ARTIFACT: &str = "preprocessor";
/// File stem of the sequence-encoder artifact.
pub const ENCODER_ARTIFACT: &str = "encoder";

/// Outputs of one forward pass, both `[batch, seq_len, hidden]`.
#[derive(Debug, Clone)]
pub struct ModelOutput<B: Backend> {
    /// Contextual predictions at every position
    pub outputs: Tensor<B, 3>,
    /// Embeddings of the unmasked inputs at every position
    pub targets: Tensor<B, 3>,
}

/// Contract between the training loop and a trainable outfit model.
pub trait OutfitModel<B: Backend> {
    /// Forward pass with the items at `batch.mask_positions` hidden.
    fn forward(&self, batch: &SequenceBatch<B>) -> ModelOutput<B>;

    /// Embed items without masking or context, `[batch, seq_len, hidden]`.
    fn preprocess(&self, batch: &SequenceBatch<B>) -> Tensor<B, 3>;

    /// Model-intrinsic penalty added to the loss, if any.
    fn regularization(&self) -> Option<Tensor<B, 1>>;

    /// Persist sub-component weights as separate artifacts in `dir`.
    fn save_components(&self, dir: &Path) -> crate::fashion::error::Result<()>;
}

#[derive(Config, Debug)]
pub struct FashionEncoderConfig {
    pub feature_dim: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_heads: usize,
    pub filter_size: usize,
    pub categories_count: usize,
    pub category_dim: usize,
    pub category_merge: CategoryMerge,
    #[config(default = true)]
    pub category_embedding: bool,
    #[config(default = true)]
    pub with_mask_category_embedding: bool,
    #[config(default = 0.1)]
    pub dropout: f64,
    #[config(default = 0.0)]
    pub l2_regularization: f64,
}

impl FashionEncoderConfig {
    pub fn from_params(params: &HyperParams) -> Self {
        Self::new(
            params.feature_dim,
            params.hidden_size,
            params.num_hidden_layers,
            params.num_heads,
            params.filter_size,
            params.categories_count,
            params.category_dim,
            params.category_merge,
        )
        .with_category_embedding(params.category_embedding)
        .with_with_mask_category_embedding(params.with_mask_category_embedding)
        .with_dropout(params.dropout)
        .with_l2_regularization(params.l2_regularization)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> FashionEncoder<B> {
        let preprocessor = Preprocessor {
            feature_projection: LinearConfig::new(self.feature_dim, self.hidden_size).init(device),
            category_embedding: self
                .category_embedding
                .then(|| EmbeddingConfig::new(self.categories_count, self.category_dim).init(device)),
            merge_projection: (self.category_embedding && self.category_merge == CategoryMerge::Concat)
                .then(|| LinearConfig::new(self.hidden_size + self.category_dim, self.hidden_size).init(device)),
            merge: Ignored(self.category_merge),
        };

        let mask_token = Tensor::random([self.hidden_size], Distribution::Normal(0.0, 0.02), device);

        FashionEncoder {
            preprocessor,
            mask_token: Param::from_tensor(mask_token),
            encoder: TransformerEncoderConfig::new(
                self.hidden_size,
                self.filter_size,
                self.num_heads,
                self.num_hidden_layers,
            )
            .with_dropout(self.dropout)
            .init(device),
            output: LinearConfig::new(self.hidden_size, self.hidden_size).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            with_mask_category_embedding: self.with_mask_category_embedding,
            l2_regularization: self.l2_regularization,
        }
    }
}

/// Projects item features into the hidden space and merges in the category embedding.
#[derive(Module, Debug)]
pub struct Preprocessor<B: Backend> {
    feature_projection: Linear<B>,
    category_embedding: Option<Embedding<B>>,
    /// Only present for [`CategoryMerge::Concat`]
    merge_projection: Option<Linear<B>>,
    merge: Ignored<CategoryMerge>,
}

impl<B: Backend> Preprocessor<B> {
    pub fn forward(&self, items: Tensor<B, 3>, categories: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let projected = self.feature_projection.forward(items);
        let Some(embedding) = &self.category_embedding else {
            return projected;
        };
        let embedded = embedding.forward(categories);

        match (*self.merge, &self.merge_projection) {
            (CategoryMerge::Multiply, _) => projected * embedded,
            (CategoryMerge::Concat, Some(projection)) => {
                projection.forward(Tensor::cat(vec![projected, embedded], 2))
            }
            _ => projected + embedded,
        }
    }

    /// Category embedding in the hidden space; `None` when it has a different width.
    pub fn hidden_category_embedding(&self, categories: Tensor<B, 2, Int>) -> Option<Tensor<B, 3>> {
        match (*self.merge, &self.category_embedding) {
            (CategoryMerge::Concat, _) | (_, None) => None,
            (_, Some(embedding)) => Some(embedding.forward(categories)),
        }
    }
}

/// Transformer over preprocessed outfit items with a learned mask token.
///
/// There is no positional encoding: item order only fixes the mask position.
#[derive(Module, Debug)]
pub struct FashionEncoder<B: Backend> {
    preprocessor: Preprocessor<B>,
    mask_token: Param<Tensor<B, 1>>,
    encoder: TransformerEncoder<B>,
    output: Linear<B>,
    dropout: Dropout,
    with_mask_category_embedding: bool,
    l2_regularization: f64,
}

impl<B: Backend> FashionEncoder<B> {
    pub fn preprocessor(&self) -> &Preprocessor<B> {
        &self.preprocessor
    }

    /// Replace the embeddings at the mask positions with the mask token.
    fn mask_inputs(&self, embedded: Tensor<B, 3>, batch: &SequenceBatch<B>) -> Tensor<B, 3> {
        if batch.mask_positions.is_empty() {
            return embedded;
        }
        let [batch_size, seq_len, hidden] = embedded.dims();
        let device = embedded.device();

        let selector = mask_one_hot::<B>(&batch.mask_positions, seq_len, &device).repeat_dim(2, hidden);
        let keep = selector.clone().neg().add_scalar(1.0);

        let mut token = self
            .mask_token
            .val()
            .reshape([1, 1, hidden])
            .repeat_dim(0, batch_size)
            .repeat_dim(1, seq_len);
        if self.with_mask_category_embedding {
            if let Some(category) = self
                .preprocessor
                .hidden_category_embedding(batch.categories.clone())
            {
                token = token + category;
            }
        }

        embedded * keep + token * selector
    }
}

impl<B: Backend> OutfitModel<B> for FashionEncoder<B> {
    fn forward(&self, batch: &SequenceBatch<B>) -> ModelOutput<B> {
        let targets = self.preprocess(batch);
        let inputs = self.dropout.forward(self.mask_inputs(targets.clone(), batch));

        let hidden = self
            .encoder
            .forward(TransformerEncoderInput::new(inputs).mask_pad(batch.pad_mask.clone()));

        ModelOutput {
            outputs: self.output.forward(hidden),
            targets,
        }
    }

    fn preprocess(&self, batch: &SequenceBatch<B>) -> Tensor<B, 3> {
        self.preprocessor
            .forward(batch.items.clone(), batch.categories.clone())
    }

    fn regularization(&self) -> Option<Tensor<B, 1>> {
        (self.l2_regularization > 0.0).then(|| {
            self.output
                .weight
                .val()
                .powf_scalar(2.0)
                .sum()
                .mul_scalar(self.l2_regularization)
        })
    }

    fn save_components(&self, dir: &Path) -> crate::fashion::error::Result<()> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.preprocessor
            .clone()
            .save_file(dir.join(PREPROCESSOR_ARTIFACT), &recorder)?;
        self.encoder
            .clone()
            .save_file(dir.join(ENCODER_ARTIFACT), &recorder)?;
        Ok(())
    }
}
