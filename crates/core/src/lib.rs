//! # tender-core — The Numeric Engine
//!
//! Simulated low-bit quantisation of LLaMA-style activations by chunked
//! magnitude decomposition, plus the shims that place it in a forward pass:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`quantize`] | symmetric quantise / dequantise, ties-to-even rounding, bf16 reduction |
//! | [`decompose`] | `DecompositionQuantizer`, the band decomposition itself |
//! | [`calibration`] | `Calibration` (recomputed / supplied), `CalibrationRecord` |
//! | [`site`] | `ActivationSite`: one quantised activation with captured calibration |
//! | [`linear`] | `QuantLinear`, `TenderLinear` |
//! | [`mlp`] | `TenderMlp` (SwiGLU) |
//! | [`attention`] | `TenderAttention` (Q·Kᵀ and S·V paths) |
//! | [`lm_head`] | `TenderLmHead` |
//! | [`metrics`] | `reconstruction_error` |
//!
//! ## Design principles
//!
//! 1. **Pure Rust hot path.** Everything goes through `candle-core`/`candle-nn`.
//! 2. **Immutable configuration.** Quantisers are built once from a
//!    [`tender_common::TenderConfig`]; nothing flips during a forward pass.
//! 3. **`Send + Sync`-safe.** Captured calibration uses `parking_lot::Mutex`.
//! 4. **Deterministic.** Same inputs and calibration give the same output.

pub mod attention;
pub mod calibration;
pub mod decompose;
pub mod linear;
pub mod lm_head;
pub mod metrics;
pub mod mlp;
pub mod quantize;
pub mod site;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use attention::{AttentionCalibration, TenderAttention};
pub use calibration::{Calibration, CalibrationRecord};
pub use decompose::{Decomposition, DecompositionQuantizer, DecompositionStats};
pub use linear::{QuantLinear, TenderLinear};
pub use lm_head::TenderLmHead;
pub use metrics::{reconstruction_error, ErrorStats};
pub use mlp::TenderMlp;
pub use quantize::{
    dequantize, fake_quantize, fake_quantize_along, fake_quantize_rows, quantize,
    quantize_unsigned, quantize_with_range, round_half_even, round_to_bf16, symmetric_scale,
    Scale, MIN_SCALE,
};
pub use site::ActivationSite;
