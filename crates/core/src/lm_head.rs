//! Vocabulary projection with decomposed hidden states.
//!
//! The LM head sees the widest activation range of the model, so it gets
//! the finest ladder (factor 14 by default) and an open-topped last band.

use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;

use tender_common::{CalibrationStore, CallSite, QuantError, Result, TenderConfig};

use crate::linear::{QuantLinear, TenderLinear};
use crate::site::ActivationSite;

pub struct TenderLmHead {
    inner: TenderLinear,
}

impl TenderLmHead {
    /// Load `weight` of shape `(vocab_size, hidden_size)` from `vb`.
    pub fn new(
        config: &TenderConfig,
        hidden_size: usize,
        vocab_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get((vocab_size, hidden_size), "weight")?;
        Self::from_weight(config, weight)
    }

    /// Build from an existing weight, e.g. tied input embeddings.
    pub fn from_weight(config: &TenderConfig, weight: Tensor) -> Result<Self> {
        let bits = config.quant_lm_head.then_some(config.bits);
        let proj = QuantLinear::from_weight(weight, bits)?;
        let site = ActivationSite::from_flag(config.quant_lm_head, config.site(CallSite::LmHead))?;
        Ok(Self {
            inner: TenderLinear::new(site, proj, config.reduce_output_precision),
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.proj().out_features()
    }

    pub fn site(&self) -> &ActivationSite {
        self.inner.site()
    }

    /// `(batch, seq, hidden)` → `(batch, seq, vocab)` logits.
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        if hidden.rank() != 3 {
            return Err(QuantError::ShapeMismatch(format!(
                "lm head expects (batch, seq, hidden), got {:?}",
                hidden.dims()
            )));
        }
        self.inner.forward(hidden)
    }

    pub fn load_calibration(
        &mut self,
        store: &CalibrationStore,
        key: &str,
        device: &Device,
    ) -> Result<bool> {
        self.inner.site_mut().load_calibration(store, key, device)
    }

    pub fn export_calibration(&self, store: &mut CalibrationStore, key: &str) -> Result<bool> {
        self.inner.site().export_calibration(store, key)
    }
}
