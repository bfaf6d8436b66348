//! Projections with fake-quantised weights.
//!
//! [`QuantLinear`] keeps both the raw weight and its per-row fake-quantised
//! copy. Decomposed activations multiply the quantised copy; the channel
//! bias removed by the decomposition goes through the raw weight, so the
//! bias term costs no quantisation error:
//!
//! ```text
//! y = residual · Ŵᵀ + bias · Wᵀ
//! ```
//!
//! [`TenderLinear`] pairs a `QuantLinear` with the [`ActivationSite`] that
//! decomposes its input.

use candle_core::{Tensor, D};
use candle_nn::{Linear, Module, VarBuilder};

use tender_common::{QuantError, Result};

use crate::decompose::Decomposition;
use crate::quantize::{fake_quantize_rows, round_to_bf16};
use crate::site::ActivationSite;

// ── QuantLinear ─────────────────────────────────────────────────────────────

/// Bias-free linear layer, `(out, in)` weight.
pub struct QuantLinear {
    raw: Linear,
    quantized: Linear,
    in_features: usize,
    out_features: usize,
}

impl QuantLinear {
    /// Load `weight` of shape `(out_dim, in_dim)` from `vb`. With `bits`
    /// the weight is fake-quantised per output row once, here.
    pub fn new(in_dim: usize, out_dim: usize, vb: VarBuilder, bits: Option<u32>) -> Result<Self> {
        let w = vb.get((out_dim, in_dim), "weight")?;
        Self::from_weight(w, bits)
    }

    pub fn from_weight(weight: Tensor, bits: Option<u32>) -> Result<Self> {
        let (out_features, in_features) = weight.dims2()?;
        let quantized = match bits {
            Some(b) => fake_quantize_rows(&weight, b)?,
            None => weight.clone(),
        };
        Ok(Self {
            raw: Linear::new(weight, None),
            quantized: Linear::new(quantized, None),
            in_features,
            out_features,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn weight(&self) -> &Tensor {
        self.raw.weight()
    }

    pub fn quantized_weight(&self) -> &Tensor {
        self.quantized.weight()
    }

    fn check_input(&self, x: &Tensor) -> Result<()> {
        let last = x.dim(D::Minus1)?;
        if last != self.in_features {
            return Err(QuantError::ShapeMismatch(format!(
                "linear expects {} input features, got {:?}",
                self.in_features,
                x.dims()
            )));
        }
        Ok(())
    }

    /// Full-precision projection with the raw weight.
    pub fn forward_full(&self, x: &Tensor) -> Result<Tensor> {
        self.check_input(x)?;
        Ok(self.raw.forward(x)?)
    }

    /// Projection with the quantised weight and untouched activations.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.check_input(x)?;
        Ok(self.quantized.forward(x)?)
    }

    /// Project a decomposition: `residual · Ŵᵀ` plus the chunk bias through
    /// the raw weight. Output keeps the decomposition's row layout.
    pub fn forward_decomposed(&self, d: &Decomposition) -> Result<Tensor> {
        let residual = d.residual()?;
        self.check_input(&residual)?;
        let out = self.quantized.forward(&residual)?;
        match d.chunk_bias() {
            Some(bias) => {
                let w = self.raw.weight().to_dtype(bias.dtype())?;
                let projected = bias.broadcast_matmul(&w.t()?)?;
                let rows = d.expand_chunks(&projected)?.to_dtype(out.dtype())?;
                Ok((out + rows)?)
            }
            None => Ok(out),
        }
    }
}

// ── TenderLinear ────────────────────────────────────────────────────────────

/// A projection whose input activations run through a decomposition site.
pub struct TenderLinear {
    site: ActivationSite,
    proj: QuantLinear,
    reduce_output_precision: bool,
}

impl TenderLinear {
    pub fn new(site: ActivationSite, proj: QuantLinear, reduce_output_precision: bool) -> Self {
        Self {
            site,
            proj,
            reduce_output_precision,
        }
    }

    pub fn site(&self) -> &ActivationSite {
        &self.site
    }

    pub fn site_mut(&mut self) -> &mut ActivationSite {
        &mut self.site
    }

    pub fn proj(&self) -> &QuantLinear {
        &self.proj
    }

    /// `(.., in)` → `(.., out)`. A disabled site falls back to the raw
    /// weight in full precision.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.proj.check_input(x)?;
        let Some(d) = self.site.decompose(x)? else {
            return self.proj.forward_full(x);
        };
        let mut out = self.proj.forward_decomposed(&d)?;
        if self.reduce_output_precision {
            out = round_to_bf16(&out)?;
        }
        let mut dims = x.dims().to_vec();
        if let Some(last) = dims.last_mut() {
            *last = self.proj.out_features;
        }
        Ok(out.reshape(dims)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;
    use std::collections::HashMap;
    use tender_common::{CallSite, TenderConfig};

    fn weight() -> Tensor {
        Tensor::arange(0f32, 12.0, &Device::Cpu)
            .unwrap()
            .affine(0.3, -1.7)
            .unwrap()
            .sin()
            .unwrap()
            .reshape((3, 4))
            .unwrap()
    }

    fn input() -> Tensor {
        Tensor::arange(0f32, 40.0, &Device::Cpu)
            .unwrap()
            .affine(0.21, 0.4)
            .unwrap()
            .cos()
            .unwrap()
            .affine(2.0, 5.0)
            .unwrap()
            .reshape((2, 5, 4))
            .unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn loads_weight_through_var_builder() {
        let mut tensors = HashMap::new();
        tensors.insert("proj.weight".to_string(), weight());
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &Device::Cpu);
        let lin = QuantLinear::new(4, 3, vb.pp("proj"), Some(4)).unwrap();
        assert_eq!((lin.in_features(), lin.out_features()), (4, 3));
        assert_eq!(lin.quantized_weight().dims(), &[3, 4]);
    }

    #[test]
    fn wrong_input_width_is_a_shape_error() {
        let lin = QuantLinear::from_weight(weight(), Some(4)).unwrap();
        let x = Tensor::zeros((2, 5), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(lin.forward(&x), Err(QuantError::ShapeMismatch(_))));
    }

    #[test]
    fn decomposed_projection_tracks_full_precision() {
        let config = TenderConfig {
            bits: 8,
            chunk_size: 10,
            ..Default::default()
        };
        let site = ActivationSite::new(config.site(CallSite::Mlp)).unwrap();
        let lin = TenderLinear::new(site, QuantLinear::from_weight(weight(), Some(8)).unwrap(), false);
        let x = input();
        let out = lin.forward(&x).unwrap();
        assert_eq!(out.dims(), &[2, 5, 3]);

        let full = lin.proj().forward_full(&x).unwrap();
        assert!(max_abs_diff(&out, &full) < 0.25);
        assert!(lin.site().last_calibration().is_some());
    }

    #[test]
    fn bias_term_uses_raw_weight() {
        // Constant input: after bias removal the residual is zero, so the
        // output is exactly bias · Wᵀ with the unquantised weight. The chunk
        // holds exactly the three rows so no padding enters the bias.
        let x = Tensor::ones((3, 4), DType::F32, &Device::Cpu).unwrap();
        let config = tender_common::DecompositionConfig {
            chunk_size: 3,
            ..TenderConfig::default().site(CallSite::Mlp)
        };
        let site = ActivationSite::new(config).unwrap();
        let lin = TenderLinear::new(site, QuantLinear::from_weight(weight(), Some(2)).unwrap(), false);
        let out = lin.forward(&x).unwrap();
        let full = lin.proj().forward_full(&x).unwrap();
        assert!(max_abs_diff(&out, &full) < 1e-5);
    }

    #[test]
    fn disabled_site_uses_raw_weight() {
        let lin = TenderLinear::new(
            ActivationSite::disabled(),
            QuantLinear::from_weight(weight(), Some(2)).unwrap(),
            false,
        );
        let x = input();
        let out = lin.forward(&x).unwrap();
        let full = lin.proj().forward_full(&x).unwrap();
        assert_eq!(max_abs_diff(&out, &full), 0.0);
    }

    #[test]
    fn bf16_reduction_is_applied() {
        let site = ActivationSite::new(TenderConfig::default().site(CallSite::Mlp)).unwrap();
        let lin = TenderLinear::new(site, QuantLinear::from_weight(weight(), Some(4)).unwrap(), true);
        let out = lin.forward(&input()).unwrap();
        let again = round_to_bf16(&out).unwrap();
        assert_eq!(max_abs_diff(&out, &again), 0.0);
    }
}
