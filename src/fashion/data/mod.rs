//! Outfit records, category grouping, masking and batching

pub mod category;
pub mod masking;
pub mod pipeline;
pub mod record;
