//! Error taxonomy.
//!
//! Only genuinely malformed input is an error on the decision path; a
//! missing policy is a fail-closed deny and a missing signal degrades to
//! a neutral default, so neither appears here.

use thiserror::Error;

/// Request evaluation errors. A `Validation` rejection is recorded to the
/// audit trail before it is returned; no confidence is computed for it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid request: missing {field}")]
    Validation { field: &'static str },
}

/// Policy store errors.
#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("policy weights must sum to 1.0, got {sum}")]
    WeightsNotNormalized { sum: f64 },
    #[error("policy {0} not found")]
    PolicyNotFound(String),
    #[error("evolution record for policy {0} could not be appended; change abandoned")]
    EvolutionWriteFailed(String),
}

/// Optimizer errors.
#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error("illegal optimizer transition {from} -> {to}")]
    IllegalTransition {
        from: &'static str,
        to: &'static str,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}
