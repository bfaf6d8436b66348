//! One quantised activation site inside a layer.
//!
//! An [`ActivationSite`] owns the decomposition settings of a single call
//! site (e.g. the MLP input), the optional calibration record supplied for
//! it, and the record captured by the most recent forward pass so offline
//! profiling can persist it.
//!
//! # Thread safety
//!
//! The captured record sits behind a [`parking_lot::Mutex`], so layers stay
//! `Send + Sync` and can be shared across threads.

use candle_core::{Device, Tensor};
use parking_lot::Mutex;

use tender_common::{CalibrationStore, DecompositionConfig, QuantError, Result};

use crate::calibration::{Calibration, CalibrationRecord};
use crate::decompose::{Decomposition, DecompositionQuantizer};

pub struct ActivationSite {
    quantizer: Option<DecompositionQuantizer>,
    calibration: Option<CalibrationRecord>,
    captured: Mutex<Option<CalibrationRecord>>,
}

impl ActivationSite {
    pub fn new(config: DecompositionConfig) -> Result<Self> {
        Ok(Self {
            quantizer: Some(DecompositionQuantizer::new(config)?),
            calibration: None,
            captured: Mutex::new(None),
        })
    }

    /// A site that passes activations through in full precision.
    pub fn disabled() -> Self {
        Self {
            quantizer: None,
            calibration: None,
            captured: Mutex::new(None),
        }
    }

    /// Build an enabled site from `config` when `enabled`, else a disabled one.
    pub fn from_flag(enabled: bool, config: DecompositionConfig) -> Result<Self> {
        if enabled {
            Self::new(config)
        } else {
            Ok(Self::disabled())
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.quantizer.is_some()
    }

    pub fn quantizer(&self) -> Option<&DecompositionQuantizer> {
        self.quantizer.as_ref()
    }

    /// Use `record` instead of on-the-fly statistics from now on.
    pub fn with_calibration(mut self, record: CalibrationRecord) -> Self {
        self.set_calibration(Some(record));
        self
    }

    pub fn set_calibration(&mut self, record: Option<CalibrationRecord>) {
        self.calibration = record.filter(|r| !r.is_empty());
    }

    pub fn calibration(&self) -> Option<&CalibrationRecord> {
        self.calibration.as_ref()
    }

    /// Decompose `(.., channels)` activations flattened to rows.
    ///
    /// Returns `None` on a disabled site. The statistics used are kept as
    /// the site's captured calibration.
    pub fn decompose(&self, x: &Tensor) -> Result<Option<Decomposition>> {
        let Some(quantizer) = &self.quantizer else {
            return Ok(None);
        };
        let rows = flatten_rows(x)?;
        let calibration = Calibration::from_option(self.calibration.as_ref());
        let d = quantizer.decompose(&rows, calibration)?;
        self.captured.lock().replace(d.calibration().clone());
        Ok(Some(d))
    }

    /// Decompose and reconstruct in the input's shape; identity when disabled.
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        match self.decompose(x)? {
            Some(d) => Ok(d.reconstruct()?.reshape(x.shape())?),
            None => Ok(x.clone()),
        }
    }

    /// Record captured by the most recent forward pass.
    pub fn last_calibration(&self) -> Option<CalibrationRecord> {
        self.captured.lock().clone()
    }

    pub fn clear_captured(&self) {
        self.captured.lock().take();
    }

    /// Load the record stored under `key`, if any. Returns whether one was found.
    pub fn load_calibration(
        &mut self,
        store: &CalibrationStore,
        key: &str,
        device: &Device,
    ) -> Result<bool> {
        match store.get(key) {
            Some(stored) => {
                self.set_calibration(Some(CalibrationRecord::from_stored(stored, device)?));
                Ok(self.calibration.is_some())
            }
            None => Ok(false),
        }
    }

    /// Store the captured record under `key`. Returns whether one existed.
    pub fn export_calibration(&self, store: &mut CalibrationStore, key: &str) -> Result<bool> {
        match self.last_calibration() {
            Some(record) => {
                store.insert(key, record.to_stored()?);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// `(.., c)` → `(rows, c)`.
pub(crate) fn flatten_rows(x: &Tensor) -> Result<Tensor> {
    if x.rank() < 2 {
        return Err(QuantError::ShapeMismatch(format!(
            "expected (.., rows, channels), got {:?}",
            x.dims()
        )));
    }
    let channels = x.dim(candle_core::D::Minus1)?;
    let rows = x.elem_count() / channels.max(1);
    Ok(x.reshape((rows, channels))?)
}
