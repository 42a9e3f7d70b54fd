//! Error types for mesowall.

use glam::DVec3;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    /// Invalid parameters detected while building walls, integrators or a simulation.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Malformed sampled-field file.
    #[error("Format error: {0}")]
    Format(String),

    #[error("Query point {point} lies outside the sampled grid")]
    OutOfDomain { point: DVec3 },

    #[error("Interaction '{name}' is not a membrane interaction")]
    InteractionType { name: String },

    /// Particles whose position or velocity became non-finite during a step.
    #[error("{count} particle(s) of '{vector}' diverged at step {step} (first index {first})")]
    NumericalDivergence {
        vector: String,
        step: u64,
        count: usize,
        first: usize,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SimError>;

/// Shorthand for building a configuration error.
pub(crate) fn config_err<T>(msg: impl Into<String>) -> Result<T> {
    Err(SimError::Configuration(msg.into()))
}
