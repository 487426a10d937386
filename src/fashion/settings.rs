//! Hyperparameter presets and layered settings resolution.
//!
//! A run's configuration is a named preset merged with an optional config file,
//! `FASHION_ENCODER__*` environment variables and explicit `key=value`
//! overrides, in that order. The merged result is deserialized into the
//! strongly typed [`HyperParams`] and validated once, before any component is
//! constructed.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::architectures::base::loss_utils::LossKind;
use super::error::{EncoderError, Result};

/// How the category embedding is merged with the projected visual features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryMerge {
    Add,
    Multiply,
    Concat,
}

impl Default for CategoryMerge {
    fn default() -> Self {
        Self::Add
    }
}

/// Which protocol scores the evaluation copy every validation round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Fill-In-The-Blank over the FITB file.
    Fitb,
    /// Training-style masked prediction over held-out outfits, without gradients.
    Masking,
}

impl Default for ValidationMode {
    fn default() -> Self {
        Self::Fitb
    }
}

/// Named hyperparameter presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    /// Cross-entropy objective.
    Base,
    /// `Base` with the margin-based distance objective.
    DistanceBase,
}

impl Preset {
    /// Look a preset up by name (case-insensitive, `-` and `_` interchangeable).
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().replace('-', "_").as_str() {
            "base" => Ok(Self::Base),
            "distance_base" => Ok(Self::DistanceBase),
            _ => Err(EncoderError::UnknownPreset(name.to_string())),
        }
    }

    pub fn params(self) -> HyperParams {
        match self {
            Self::Base => HyperParams::default(),
            Self::DistanceBase => HyperParams {
                loss: "distance".to_string(),
                margin: 0.5,
                ..HyperParams::default()
            },
        }
    }
}

/// Immutable per-run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperParams {
    /// Width of one item's visual feature vector
    pub feature_dim: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_heads: usize,
    /// Feed-forward width inside each transformer layer
    pub filter_size: usize,
    pub dropout: f64,
    pub learning_rate: f64,

    pub category_dim: usize,
    /// Size of the category embedding table; ids must be below this value
    pub categories_count: usize,
    pub category_merge: CategoryMerge,
    pub category_embedding: bool,
    /// FITB mask token takes the true answer's category instead of the placeholder id
    pub use_mask_category: bool,
    pub with_category_grouping: bool,
    /// Masked positions keep their category embedding on top of the mask token
    pub with_mask_category_embedding: bool,
    /// Only items sharing the masked item's category act as negatives
    pub categorywise_train: bool,

    pub batch_size: usize,
    pub epoch_count: usize,
    /// Validate (and checkpoint) every this many epochs
    pub validation_frequency: usize,
    pub validation_mode: ValidationMode,

    pub early_stop: bool,
    pub early_stop_patience: usize,
    pub early_stop_delta: f64,
    pub early_stop_warmup: usize,

    /// Best validation score from which targets receive gradient; `-1` keeps them detached
    pub target_gradient_from: f64,
    /// `cross` or `distance`
    pub loss: String,
    pub margin: f64,
    pub temperature: f64,
    pub l2_regularization: f64,

    pub seed: u64,
    pub max_checkpoints: usize,

    #[serde(default)]
    pub dataset_files: Vec<PathBuf>,
    #[serde(default)]
    pub valid_files: Vec<PathBuf>,
    #[serde(default)]
    pub fitb_file: Option<PathBuf>,
    #[serde(default)]
    pub test_fitb_file: Option<PathBuf>,
    #[serde(default)]
    pub category_file: Option<PathBuf>,
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for HyperParams {
    fn default() -> Self {
        Self {
            feature_dim: 2048,
            hidden_size: 1024,
            num_hidden_layers: 1,
            num_heads: 16,
            filter_size: 1024,
            dropout: 0.1,
            learning_rate: 0.0005,
            category_dim: 1024,
            categories_count: 50,
            category_merge: CategoryMerge::Add,
            category_embedding: true,
            use_mask_category: true,
            with_category_grouping: true,
            with_mask_category_embedding: true,
            categorywise_train: true,
            batch_size: 128,
            epoch_count: 200,
            validation_frequency: 2,
            validation_mode: ValidationMode::Fitb,
            early_stop: true,
            early_stop_patience: 8,
            early_stop_delta: 0.002,
            early_stop_warmup: 20,
            target_gradient_from: 0.0,
            loss: "cross".to_string(),
            margin: 0.5,
            temperature: 0.1,
            l2_regularization: 0.0,
            seed: 1,
            max_checkpoints: 3,
            dataset_files: Vec::new(),
            valid_files: Vec::new(),
            fitb_file: None,
            test_fitb_file: None,
            category_file: None,
            checkpoint_dir: None,
            log_dir: None,
        }
    }
}

impl HyperParams {
    /// Resolve a preset by name and layer the optional file, the environment and
    /// the explicit overrides on top of it.
    pub fn resolve(
        preset: &str,
        config_file: Option<&Path>,
        overrides: &[(String, String)],
    ) -> Result<Self> {
        let base = Preset::from_name(preset)?.params();
        let mut builder = Config::builder().add_source(Config::try_from(&base)?);

        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("FASHION_ENCODER")
                .separator("__")
                .try_parsing(true),
        );

        for (key, value) in overrides {
            builder = builder.set_override(key.as_str(), value.as_str())?;
        }

        let params: HyperParams = builder.build()?.try_deserialize()?;
        params.validate()?;
        Ok(params)
    }

    /// Check the structural constraints every component relies on.
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: String) -> Result<()> {
            Err(EncoderError::InvalidConfig(msg))
        }

        if self.feature_dim == 0 || self.hidden_size == 0 {
            return invalid("feature_dim and hidden_size must be positive".to_string());
        }
        if self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            return invalid(format!(
                "hidden_size {} must be divisible by num_heads {}",
                self.hidden_size, self.num_heads
            ));
        }
        if self.batch_size == 0 || self.epoch_count == 0 {
            return invalid("batch_size and epoch_count must be positive".to_string());
        }
        if self.validation_frequency == 0 {
            return invalid("validation_frequency must be positive".to_string());
        }
        if self.categories_count < 2 {
            return invalid(format!(
                "categories_count {} leaves no room for the placeholder id 1",
                self.categories_count
            ));
        }
        if self.category_embedding
            && self.category_merge != CategoryMerge::Concat
            && self.category_dim != self.hidden_size
        {
            return invalid(format!(
                "category_merge {:?} needs category_dim ({}) == hidden_size ({})",
                self.category_merge, self.category_dim, self.hidden_size
            ));
        }

        let loss = LossKind::parse(&self.loss)?;
        if loss == LossKind::Distance && !(self.margin.is_finite() && self.margin > 0.0) {
            return invalid(format!("distance margin must be a positive number, got {}", self.margin));
        }
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return invalid(format!("temperature must be positive, got {}", self.temperature));
        }
        if self.early_stop && self.early_stop_patience == 0 {
            return invalid("early_stop_patience must be positive when early_stop is set".to_string());
        }
        if self.with_category_grouping && self.category_file.is_none() {
            return invalid("with_category_grouping requires category_file".to_string());
        }
        if self.max_checkpoints == 0 {
            return invalid("max_checkpoints must be at least 1".to_string());
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return invalid(format!("dropout must lie in [0, 1), got {}", self.dropout));
        }
        Ok(())
    }

    pub fn loss_kind(&self) -> Result<LossKind> {
        LossKind::parse(&self.loss)
    }
}

/// Split a `key=value` override, as passed on the command line.
pub fn parse_override(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(EncoderError::InvalidConfig(format!(
            "override `{}` is not of the form key=value",
            raw
        ))),
    }
}
