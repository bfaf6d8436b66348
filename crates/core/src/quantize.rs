//! Symmetric quantise / dequantise primitives.
//!
//! Everything here is simulated ("fake") quantisation: values are mapped to
//! an integer grid and straight back to floats so the rest of the forward
//! pass sees the quantisation error without any integer kernels.
//!
//! # Rounding
//!
//! Rounding is round-to-nearest, ties-to-even. candle's `round` rounds half
//! away from zero, so [`round_half_even`] adds and subtracts `1.5 · 2^23` in
//! f32, which makes the FPU perform the tie-breaking. Inputs are clamped to
//! `±2^22` first. Quantisation accepts at most 16 bits and clamps to that
//! far narrower integer range afterwards, so the pre-clamp never changes a
//! quantised result.

use candle_core::shape::Dim;
use candle_core::{DType, Tensor, D};

use tender_common::{QuantError, QuantRange, Result};

/// Smallest scale magnitude used as a divisor.
pub const MIN_SCALE: f64 = 1e-9;

/// `1.5 · 2^23`: adding this to an f32 in `[-2^22, 2^22]` leaves an integer.
const ROUND_MAGIC: f64 = 12_582_912.0;
const ROUND_LIMIT: f64 = 4_194_304.0;

/// Quantisation step: a single value or a broadcastable tensor (e.g. a
/// per-row `(rows, 1)` column).
#[derive(Debug, Clone, Copy)]
pub enum Scale<'a> {
    Scalar(f64),
    Tensor(&'a Tensor),
}

impl From<f64> for Scale<'_> {
    fn from(s: f64) -> Self {
        Self::Scalar(s)
    }
}

impl<'a> From<&'a Tensor> for Scale<'a> {
    fn from(t: &'a Tensor) -> Self {
        Self::Tensor(t)
    }
}

// ── Rounding ────────────────────────────────────────────────────────────────

/// Round to the nearest integer, ties to even. Output is F32.
pub fn round_half_even(x: &Tensor) -> Result<Tensor> {
    let x = x.to_dtype(DType::F32)?.clamp(-ROUND_LIMIT, ROUND_LIMIT)?;
    let shifted = x.affine(1.0, ROUND_MAGIC)?;
    Ok(shifted.affine(1.0, -ROUND_MAGIC)?)
}

/// Reduce F32 values to bfloat16 precision (round to nearest even) and back.
pub fn round_to_bf16(x: &Tensor) -> Result<Tensor> {
    let dtype = x.dtype();
    let reduced = x.to_dtype(DType::F32)?.to_dtype(DType::BF16)?;
    Ok(reduced.to_dtype(dtype)?)
}

// ── Quantise / dequantise ───────────────────────────────────────────────────

/// Divide `x` by `scale`, rejecting exactly-zero scales and clamping the
/// remaining magnitudes to [`MIN_SCALE`].
fn divide_by_scale(x: &Tensor, scale: Scale<'_>) -> Result<Tensor> {
    match scale {
        Scale::Scalar(s) => {
            if s == 0.0 {
                return Err(QuantError::ZeroScale);
            }
            Ok(x.affine(1.0 / s.abs().max(MIN_SCALE), 0.0)?)
        }
        Scale::Tensor(s) => {
            let s = s.to_dtype(DType::F32)?;
            let zeros = s.eq(0f32)?.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?;
            if zeros > 0.0 {
                return Err(QuantError::ZeroScale);
            }
            let s = s.abs()?.maximum(MIN_SCALE)?;
            Ok(x.broadcast_div(&s)?)
        }
    }
}

/// Quantise onto the integer grid of `range` at `bits` precision.
///
/// Returns integer-valued F32. Fails with [`QuantError::ZeroScale`] when any
/// scale is exactly zero and with [`QuantError::InvalidConfig`] when `bits`
/// is outside the range's supported widths.
pub fn quantize_with_range(
    x: &Tensor,
    scale: Scale<'_>,
    bits: u32,
    range: QuantRange,
) -> Result<Tensor> {
    range.check_bits(bits)?;
    let (q_min, q_max) = range.bounds(bits);
    let x = x.to_dtype(DType::F32)?;
    let scaled = divide_by_scale(&x, scale)?;
    Ok(round_half_even(&scaled)?.clamp(q_min, q_max)?)
}

/// Signed symmetric quantisation to `[-(2^(bits-1)), 2^(bits-1) - 1]`.
pub fn quantize<'a>(x: &Tensor, scale: impl Into<Scale<'a>>, bits: u32) -> Result<Tensor> {
    quantize_with_range(x, scale.into(), bits, QuantRange::Signed)
}

/// Unsigned quantisation to `[0, 2^bits - 1]`.
pub fn quantize_unsigned<'a>(
    x: &Tensor,
    scale: impl Into<Scale<'a>>,
    bits: u32,
) -> Result<Tensor> {
    quantize_with_range(x, scale.into(), bits, QuantRange::Unsigned)
}

/// `q · scale`, cast to `dtype`.
pub fn dequantize<'a>(q: &Tensor, scale: impl Into<Scale<'a>>, dtype: DType) -> Result<Tensor> {
    let out = match scale.into() {
        Scale::Scalar(s) => q.affine(s, 0.0)?,
        Scale::Tensor(s) => q.broadcast_mul(&s.to_dtype(q.dtype())?)?,
    };
    Ok(out.to_dtype(dtype)?)
}

/// Signed quantise-then-dequantise, keeping `x`'s dtype.
///
/// A projection: values already on the grid of `scale` come back unchanged.
pub fn fake_quantize<'a>(x: &Tensor, scale: impl Into<Scale<'a>>, bits: u32) -> Result<Tensor> {
    let scale = scale.into();
    let q = quantize(x, scale, bits)?;
    dequantize(&q, scale, x.dtype())
}

/// Signed symmetric scale `max|x| / q_max` reduced along `dim` (keepdim),
/// F32, floored at [`MIN_SCALE`].
pub fn symmetric_scale<Dm: Dim>(x: &Tensor, dim: Dm, bits: u32) -> Result<Tensor> {
    QuantRange::Signed.check_bits(bits)?;
    let q_max = QuantRange::Signed.q_max(bits);
    Ok(x
        .to_dtype(DType::F32)?
        .abs()?
        .max_keepdim(dim)?
        .affine(1.0 / q_max, 0.0)?
        .maximum(MIN_SCALE)?)
}

/// Signed fake quantisation with a [`symmetric_scale`] along `dim`. Returns
/// the dequantised tensor and the scale that was used.
///
/// All-zero slices get [`MIN_SCALE`] and come back as zeros.
pub fn fake_quantize_along<Dm: Dim>(
    x: &Tensor,
    dim: Dm,
    bits: u32,
) -> Result<(Tensor, Tensor)> {
    let scale = symmetric_scale(x, dim, bits)?;
    let out = fake_quantize(x, &scale, bits)?;
    Ok((out, scale))
}

/// Per-row (output channel) symmetric weight quantisation.
pub fn fake_quantize_rows(w: &Tensor, bits: u32) -> Result<Tensor> {
    Ok(fake_quantize_along(w, D::Minus1, bits)?.0)
}

// ── Tests ───────────────────────────────────────────────────────────────────
