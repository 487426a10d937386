//! Objectives and accuracy rules for masked-item prediction.
//!
//! Both objectives compare the model's prediction at the mask position with the
//! embedded targets. During training the comparison is in-batch: row `i` of
//! the prediction matrix has its positive in column `i` of the target matrix
//! and every other (allowed) column acts as a negative. During FITB a single
//! prediction is compared with the candidate answers of one question.

use burn::tensor::{activation, backend::Backend, Tensor, TensorData};

use crate::fashion::error::{EncoderError, Result};
use crate::fashion::settings::HyperParams;

/// Logit offset that removes a disallowed candidate from the softmax.
const EXCLUDED_LOGIT: f32 = -1.0e4;

/// Guards the norm/sqrt against zero vectors.
const NORM_EPS: f32 = 1.0e-12;

/// Loss selector as written in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossKind {
    CrossEntropy,
    Distance,
}

impl LossKind {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "cross" => Ok(Self::CrossEntropy),
            "distance" => Ok(Self::Distance),
            other => Err(EncoderError::UnsupportedLoss(other.to_string())),
        }
    }
}

/// Running correct/total counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccuracyCounter {
    pub correct: usize,
    pub total: usize,
}

impl AccuracyCounter {
    pub fn record(&mut self, correct: bool) {
        self.total += 1;
        if correct {
            self.correct += 1;
        }
    }

    pub fn merge(&mut self, other: AccuracyCounter) {
        self.correct += other.correct;
        self.total += other.total;
    }

    /// Fraction correct, `0.0` before anything was recorded.
    pub fn value(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }
}

/// A loss together with the accuracy rule that goes with it.
pub trait Objective<B: Backend> {
    /// Pairwise closeness of predictions `[N, H]` to candidates `[C, H]`,
    /// as an `[N, C]` matrix where larger means closer.
    fn similarity(&self, outputs: Tensor<B, 2>, candidates: Tensor<B, 2>) -> Tensor<B, 2>;

    /// Scalar in-batch loss; `categories[i]` is the category of row `i`'s target.
    fn loss(&self, outputs: Tensor<B, 2>, targets: Tensor<B, 2>, categories: &[i64]) -> Tensor<B, 1>;

    /// Whether negatives are restricted to the masked item's category.
    fn categorywise_only(&self) -> bool;

    /// In-batch accuracy: row `i` is correct when column `i` wins among its allowed candidates.
    fn batch_accuracy(
        &self,
        outputs: Tensor<B, 2>,
        targets: Tensor<B, 2>,
        categories: &[i64],
    ) -> Result<AccuracyCounter> {
        let n = outputs.dims()[0];
        let scores = host_values(self.similarity(outputs, targets))?;
        let allowed = candidate_mask(categories, self.categorywise_only());

        let mut counter = AccuracyCounter::default();
        for row in 0..n {
            let range = row * n..(row + 1) * n;
            let best = argmax_with_tie_break_smallest(&scores[range.clone()], Some(&allowed[range]));
            counter.record(best == Some(row));
        }
        Ok(counter)
    }

    /// FITB rule: one prediction `[1, H]` against `C` candidates `[C, H]`.
    fn is_correct(
        &self,
        prediction: Tensor<B, 2>,
        candidates: Tensor<B, 2>,
        answer: usize,
    ) -> Result<bool> {
        let scores = host_values(self.similarity(prediction, candidates))?;
        Ok(argmax_with_tie_break_smallest(&scores, None) == Some(answer))
    }
}

/// Softmax cross entropy over cosine-similarity logits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrossEntropyObjective {
    pub categorywise_only: bool,
    pub temperature: f32,
}

impl<B: Backend> Objective<B> for CrossEntropyObjective {
    fn similarity(&self, outputs: Tensor<B, 2>, candidates: Tensor<B, 2>) -> Tensor<B, 2> {
        l2_normalize(outputs)
            .matmul(l2_normalize(candidates).transpose())
            .div_scalar(self.temperature)
    }

    fn loss(&self, outputs: Tensor<B, 2>, targets: Tensor<B, 2>, categories: &[i64]) -> Tensor<B, 1> {
        let n = outputs.dims()[0];
        let device = outputs.device();

        let penalty: Vec<f32> = candidate_mask(categories, self.categorywise_only)
            .into_iter()
            .map(|allowed| if allowed { 0.0 } else { EXCLUDED_LOGIT })
            .collect();
        let penalty = Tensor::<B, 2>::from_data(TensorData::new(penalty, [n, n]), &device);

        let logits = Objective::<B>::similarity(self, outputs, targets) + penalty;
        let log_probs = activation::log_softmax(logits, 1);

        (log_probs * identity::<B>(n, &device))
            .sum()
            .neg()
            .div_scalar(n.max(1) as f32)
    }

    fn categorywise_only(&self) -> bool {
        self.categorywise_only
    }
}

/// Margin ranking loss over squared Euclidean distances.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceObjective {
    pub margin: f32,
    pub categorywise_only: bool,
}

impl<B: Backend> Objective<B> for DistanceObjective {
    fn similarity(&self, outputs: Tensor<B, 2>, candidates: Tensor<B, 2>) -> Tensor<B, 2> {
        squared_distances(outputs, candidates).neg()
    }

    fn loss(&self, outputs: Tensor<B, 2>, targets: Tensor<B, 2>, categories: &[i64]) -> Tensor<B, 1> {
        let n = outputs.dims()[0];
        let device = outputs.device();

        let negatives: Vec<f32> = candidate_mask(categories, self.categorywise_only)
            .into_iter()
            .enumerate()
            .map(|(idx, allowed)| if allowed && idx / n != idx % n { 1.0 } else { 0.0 })
            .collect();
        let count: f32 = negatives.iter().sum();
        let negatives = Tensor::<B, 2>::from_data(TensorData::new(negatives, [n, n]), &device);

        let distances = squared_distances(outputs, targets);
        let positive = (distances.clone() * identity::<B>(n, &device))
            .sum_dim(1)
            .repeat_dim(1, n);
        let hinge = activation::relu((positive - distances).add_scalar(self.margin));

        (hinge * negatives).sum().div_scalar(count.max(1.0))
    }

    fn categorywise_only(&self) -> bool {
        self.categorywise_only
    }
}

/// The objective selected for a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ObjectiveFn {
    CrossEntropy(CrossEntropyObjective),
    Distance(DistanceObjective),
}

impl ObjectiveFn {
    pub fn from_params(params: &HyperParams) -> Result<Self> {
        Ok(match params.loss_kind()? {
            LossKind::CrossEntropy => Self::CrossEntropy(CrossEntropyObjective {
                categorywise_only: params.categorywise_train,
                temperature: params.temperature as f32,
            }),
            LossKind::Distance => Self::Distance(DistanceObjective {
                margin: params.margin as f32,
                categorywise_only: params.categorywise_train,
            }),
        })
    }

    pub fn kind(&self) -> LossKind {
        match self {
            Self::CrossEntropy(_) => LossKind::CrossEntropy,
            Self::Distance(_) => LossKind::Distance,
        }
    }
}

impl<B: Backend> Objective<B> for ObjectiveFn {
    fn similarity(&self, outputs: Tensor<B, 2>, candidates: Tensor<B, 2>) -> Tensor<B, 2> {
        match self {
            Self::CrossEntropy(objective) => objective.similarity(outputs, candidates),
            Self::Distance(objective) => objective.similarity(outputs, candidates),
        }
    }

    fn loss(&self, outputs: Tensor<B, 2>, targets: Tensor<B, 2>, categories: &[i64]) -> Tensor<B, 1> {
        match self {
            Self::CrossEntropy(objective) => objective.loss(outputs, targets, categories),
            Self::Distance(objective) => objective.loss(outputs, targets, categories),
        }
    }

    fn categorywise_only(&self) -> bool {
        match self {
            Self::CrossEntropy(objective) => objective.categorywise_only,
            Self::Distance(objective) => objective.categorywise_only,
        }
    }
}

/// Pick row `positions[b]` out of each sequence: `[B, S, H] -> [B, H]`.
pub fn gather_mask_positions<B: Backend>(sequence: Tensor<B, 3>, positions: &[usize]) -> Tensor<B, 2> {
    let [batch, seq_len, hidden] = sequence.dims();
    let device = sequence.device();
    let one_hot = mask_one_hot::<B>(positions, seq_len, &device).repeat_dim(2, hidden);

    (sequence * one_hot).sum_dim(1).reshape([batch, hidden])
}

/// `[B, S, 1]` indicator of each sequence's mask position.
pub fn mask_one_hot<B: Backend>(positions: &[usize], seq_len: usize, device: &B::Device) -> Tensor<B, 3> {
    let mut values = vec![0.0f32; positions.len() * seq_len];
    for (row, &position) in positions.iter().enumerate() {
        values[row * seq_len + position] = 1.0;
    }
    Tensor::from_data(TensorData::new(values, [positions.len(), seq_len, 1]), device)
}

/// Row-major `[N, N]` matrix of candidates each row may be compared with.
///
/// The diagonal is always allowed; off-diagonal entries are allowed unless
/// `categorywise` is set and the categories differ.
pub fn candidate_mask(categories: &[i64], categorywise: bool) -> Vec<bool> {
    let n = categories.len();
    let mut allowed = Vec::with_capacity(n * n);
    for i in 0..n {
        for j in 0..n {
            allowed.push(i == j || !categorywise || categories[i] == categories[j]);
        }
    }
    allowed
}

/// Index of the largest allowed score; ties resolve to the smallest index and NaN never wins.
pub fn argmax_with_tie_break_smallest(scores: &[f32], allowed: Option<&[bool]>) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &score) in scores.iter().enumerate() {
        if score.is_nan() || allowed.is_some_and(|mask| !mask[idx]) {
            continue;
        }
        match best {
            Some((_, current)) if score <= current => {}
            _ => best = Some((idx, score)),
        }
    }
    best.map(|(idx, _)| idx)
}

fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let hidden = x.dims()[1];
    let norm = x
        .clone()
        .powf_scalar(2.0)
        .sum_dim(1)
        .add_scalar(NORM_EPS)
        .sqrt()
        .repeat_dim(1, hidden);
    x / norm
}

fn squared_distances<B: Backend>(a: Tensor<B, 2>, b: Tensor<B, 2>) -> Tensor<B, 2> {
    let n = a.dims()[0];
    let c = b.dims()[0];
    let a_sq = a.clone().powf_scalar(2.0).sum_dim(1).repeat_dim(1, c);
    let b_sq = b.clone().powf_scalar(2.0).sum_dim(1).transpose().repeat_dim(0, n);
    let cross = a.matmul(b.transpose()).mul_scalar(2.0);

    (a_sq + b_sq - cross).clamp_min(0.0)
}

fn identity<B: Backend>(n: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut values = vec![0.0f32; n * n];
    for i in 0..n {
        values[i * n + i] = 1.0;
    }
    Tensor::from_data(TensorData::new(values, [n, n]), device)
}

fn host_values<B: Backend>(tensor: Tensor<B, 2>) -> Result<Vec<f32>> {
    Ok(tensor.into_data().convert::<f32>().to_vec::<f32>()?)
}
