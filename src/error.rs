//! Error taxonomy for the stochastic halo sampler.
//!
//! Every failure here is fatal for the calling catalog build: there is no
//! local recovery or retry, a single bad cell or halo unwinds the whole call.
//! Variants carry the offending inputs so the failure site can be diagnosed
//! from the error alone.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SampleError {
    /// Out-of-domain input: invalid overdensity, negative radicand,
    /// non-finite interpolation result and the like.
    #[error("{context}: invalid value {value:.6e}")]
    InvalidValue { context: &'static str, value: f64 },

    /// Adaptive quadrature failed to converge within its subdivision budget.
    #[error("quadrature did not converge on [{lower:.4e}, {upper:.4e}] (estimate {estimate:.4e})")]
    Integration {
        lower: f64,
        upper: f64,
        estimate: f64,
    },

    /// Root finder hit a NaN or ran out of iterations while building the
    /// inverse-CDF table.
    #[error("table generation failed at condition {condition:.6e}, log-probability {log_prob:.4e}")]
    TableGeneration { condition: f64, log_prob: f64 },

    /// A sampling loop (rejection or mass-budget) exceeded its draw bound.
    #[error("sampling loop exceeded {limit} draws ({context})")]
    Sampling { context: &'static str, limit: u64 },

    /// The configuration asks for an unsupported switch combination.
    #[error("unsupported configuration: {context}")]
    Config { context: &'static str },
}

pub type Result<T> = std::result::Result<T, SampleError>;
