//! Reconstruction error between a tensor and its quantised approximation.

use candle_core::{DType, Device, Tensor};

use tender_common::{QuantError, Result};

/// Error summary of one approximation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorStats {
    pub mse: f64,
    pub max_abs_err: f64,
    /// `10 · log10(signal power / noise power)`; infinite for an exact match.
    pub sqnr_db: f64,
}

pub fn reconstruction_error(original: &Tensor, approx: &Tensor) -> Result<ErrorStats> {
    if original.dims() != approx.dims() {
        return Err(QuantError::ShapeMismatch(format!(
            "cannot compare {:?} with {:?}",
            original.dims(),
            approx.dims()
        )));
    }
    let n = original.elem_count();
    if n == 0 {
        return Err(QuantError::EmptyInput);
    }
    // Accumulated in F64 on the host; not every accelerator has F64.
    let x = original.to_device(&Device::Cpu)?.to_dtype(DType::F64)?;
    let diff = (&x - approx.to_device(&Device::Cpu)?.to_dtype(DType::F64)?)?;
    let noise = diff.sqr()?.sum_all()?.to_scalar::<f64>()?;
    let signal = x.sqr()?.sum_all()?.to_scalar::<f64>()?;
    let max_abs_err = diff.abs()?.flatten_all()?.max(0)?.to_scalar::<f64>()?;

    let sqnr_db = if noise == 0.0 {
        f64::INFINITY
    } else {
        10.0 * (signal / noise).log10()
    };
    Ok(ErrorStats {
        mse: noise / n as f64,
        max_abs_err,
        sqnr_db,
    })
}
