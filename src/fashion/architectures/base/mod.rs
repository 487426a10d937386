//! Base architecture modules

pub mod checkpoint;
pub mod early_stopping;
pub mod encoder;
pub mod gradient_policy;
pub mod loss_utils;
pub mod telemetry;
pub mod train;
pub mod validation;
