//! Model architectures and the training/evaluation machinery around them

pub mod base;
