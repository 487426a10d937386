//! Outfit encoder: data pipeline, model boundary, training and evaluation

pub mod architectures;
pub mod data;
pub mod error;
pub mod settings;
pub mod task;
