//! Error taxonomy for the quantisation pipeline.
//!
//! Every error here is local, synchronous and non-retriable: the caller has
//! to fix its inputs. Tensor-level failures from candle are wrapped as
//! [`QuantError::Candle`] so `?` works across the substrate boundary.

use thiserror::Error;

/// Errors raised by the quantise primitive, the decomposition quantizer and
/// the call-site shims.
#[derive(Debug, Error)]
pub enum QuantError {
    /// A scale factor was exactly zero.
    #[error("zero is given as a scale factor")]
    ZeroScale,

    /// The input had no rows to split into chunks.
    #[error("input has no rows to chunk")]
    EmptyInput,

    /// Band masks did not partition the channel/chunk entries.
    #[error("band masks assigned {assigned} channel-chunk entries, expected {expected}")]
    BandCoverage { assigned: usize, expected: usize },

    /// A tensor's layout did not match what the operation expects.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The quantiser configuration is unusable.
    #[error("invalid quantisation config: {0}")]
    InvalidConfig(String),

    /// Failure inside the tensor substrate.
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Result alias used across the library crates.
pub type Result<T> = std::result::Result<T, QuantError>;
