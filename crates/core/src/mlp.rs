//! SwiGLU feed-forward block with decomposed activations.
//!
//! ```text
//! x̂    = decompose_fc1(x)                      shared by gate and up
//! gate = SiLU( x̂ · Ŵ_gateᵀ + b_x · W_gateᵀ )
//! up   =       x̂ · Ŵ_upᵀ   + b_x · W_upᵀ
//! ĥ    = decompose_fc2(gate ⊙ up)
//! out  = ĥ · Ŵ_downᵀ + b_h · W_downᵀ
//! ```
//!
//! Weights are fake-quantised per output row at load time. With
//! `quant_mlp = false` the block is a plain full-precision SwiGLU.

use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;

use tender_common::{CalibrationStore, CallSite, Result, TenderConfig};

use crate::linear::QuantLinear;
use crate::quantize::round_to_bf16;
use crate::site::ActivationSite;

pub struct TenderMlp {
    gate_proj: QuantLinear,
    up_proj: QuantLinear,
    down_proj: QuantLinear,
    fc1: ActivationSite,
    fc2: ActivationSite,
    reduce_output_precision: bool,
}

impl TenderMlp {
    /// Load `gate_proj`, `up_proj` and `down_proj` weights from `vb`.
    pub fn new(
        config: &TenderConfig,
        hidden_size: usize,
        intermediate_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let bits = config.quant_mlp.then_some(config.bits);
        let gate_proj = QuantLinear::new(hidden_size, intermediate_size, vb.pp("gate_proj"), bits)?;
        let up_proj = QuantLinear::new(hidden_size, intermediate_size, vb.pp("up_proj"), bits)?;
        let down_proj = QuantLinear::new(intermediate_size, hidden_size, vb.pp("down_proj"), bits)?;
        Self::from_parts(config, gate_proj, up_proj, down_proj)
    }

    pub fn from_parts(
        config: &TenderConfig,
        gate_proj: QuantLinear,
        up_proj: QuantLinear,
        down_proj: QuantLinear,
    ) -> Result<Self> {
        let site = config.site(CallSite::Mlp);
        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
            fc1: ActivationSite::from_flag(config.quant_mlp, site)?,
            fc2: ActivationSite::from_flag(config.quant_mlp, site)?,
            reduce_output_precision: config.reduce_output_precision,
        })
    }

    pub fn fc1(&self) -> &ActivationSite {
        &self.fc1
    }

    pub fn fc2(&self) -> &ActivationSite {
        &self.fc2
    }

    fn reduce(&self, t: Tensor) -> Result<Tensor> {
        if self.reduce_output_precision {
            round_to_bf16(&t)
        } else {
            Ok(t)
        }
    }

    /// `(.., hidden)` → `(.., hidden)`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let Some(d1) = self.fc1.decompose(x)? else {
            let gate = candle_nn::ops::silu(&self.gate_proj.forward_full(x)?)?;
            let up = self.up_proj.forward_full(x)?;
            return self.down_proj.forward_full(&(gate * up)?);
        };

        let gate = self.reduce(self.gate_proj.forward_decomposed(&d1)?)?;
        let up = self.reduce(self.up_proj.forward_decomposed(&d1)?)?;
        let h = (candle_nn::ops::silu(&gate)? * up)?;

        let down = match self.fc2.decompose(&h)? {
            Some(d2) => self.down_proj.forward_decomposed(&d2)?,
            None => self.down_proj.forward(&h)?,
        };
        let down = self.reduce(down)?;

        let mut dims = x.dims().to_vec();
        if let Some(last) = dims.last_mut() {
            *last = self.down_proj.out_features();
        }
        Ok(down.reshape(dims)?)
    }

    /// Load `{prefix}.fc1` and `{prefix}.fc2`. Returns how many were found.
    pub fn load_calibration(
        &mut self,
        store: &CalibrationStore,
        prefix: &str,
        device: &Device,
    ) -> Result<usize> {
        let fc1 = self.fc1.load_calibration(store, &format!("{prefix}.fc1"), device)?;
        let fc2 = self.fc2.load_calibration(store, &format!("{prefix}.fc2"), device)?;
        Ok(fc1 as usize + fc2 as usize)
    }

    /// Persist the records captured by the last forward pass.
    pub fn export_calibration(&self, store: &mut CalibrationStore, prefix: &str) -> Result<usize> {
        let fc1 = self.fc1.export_calibration(store, &format!("{prefix}.fc1"))?;
        let fc2 = self.fc2.export_calibration(store, &format!("{prefix}.fc2"))?;
        Ok(fc1 as usize + fc2 as usize)
    }
}
