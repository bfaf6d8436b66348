//! Attention core with decomposed query and probability activations.
//!
//! Operates on already projected, position-encoded `q, k, v` of shape
//! `(batch, heads, seq, head_dim)`. Every `batch × head` pair is one
//! decomposition group with its own statistics.
//!
//! Quantised path:
//!
//! * **Key**: per-channel bias `k_b = (max + min) / 2` over the key
//!   sequence is removed, then each row is quantised symmetrically.
//! * **Query**: scaled by `1/√d`, decomposed with the `attention_query`
//!   site (bias `q_b` per chunk). The bias terms of
//!
//!   ```text
//!   Q Kᵀ = Q̂ K̂ᵀ + q_b Kᵀ + Q k_bᵀ − q_b k_bᵀ
//!   ```
//!
//!   use the unquantised `Q` and `K`.
//! * **Probabilities**: softmax in F32, decomposed with the
//!   `attention_score` site (unsigned grid, open-topped last band).
//! * **Value**: per-channel symmetric quantisation over the sequence.

use candle_core::{DType, Device, Tensor, D};
use parking_lot::Mutex;

use tender_common::{CalibrationStore, CallSite, QuantError, Result, StoredRecord, TenderConfig};

use crate::calibration::{from_stored_tensor, to_stored_tensor, Calibration, CalibrationRecord};
use crate::decompose::DecompositionQuantizer;
use crate::quantize::{fake_quantize, round_to_bf16, symmetric_scale};

/// Supplied or captured statistics of every attention path.
#[derive(Debug, Clone, Default)]
pub struct AttentionCalibration {
    pub query: Option<CalibrationRecord>,
    pub score: Option<CalibrationRecord>,
    /// `(groups, 1, head_dim)`.
    pub key_bias: Option<Tensor>,
    /// `(groups, key_len, 1)`; may cover more positions than a call needs.
    pub key_scale: Option<Tensor>,
    /// `(groups, 1, head_dim)`.
    pub value_scale: Option<Tensor>,
}

impl AttentionCalibration {
    pub fn is_empty(&self) -> bool {
        self.query.is_none()
            && self.score.is_none()
            && self.key_bias.is_none()
            && self.key_scale.is_none()
            && self.value_scale.is_none()
    }

    /// Write `{prefix}.query`, `{prefix}.score`, `{prefix}.key` and
    /// `{prefix}.value` records.
    pub fn export(&self, store: &mut CalibrationStore, prefix: &str) -> Result<()> {
        if let Some(q) = &self.query {
            store.insert(format!("{prefix}.query"), q.to_stored()?);
        }
        if let Some(s) = &self.score {
            store.insert(format!("{prefix}.score"), s.to_stored()?);
        }
        if self.key_bias.is_some() || self.key_scale.is_some() {
            let key = StoredRecord {
                bias: self.key_bias.as_ref().map(to_stored_tensor).transpose()?,
                scale: self.key_scale.as_ref().map(to_stored_tensor).transpose()?,
                ..Default::default()
            };
            store.insert(format!("{prefix}.key"), key);
        }
        if let Some(v) = &self.value_scale {
            let value = StoredRecord {
                scale: Some(to_stored_tensor(v)?),
                ..Default::default()
            };
            store.insert(format!("{prefix}.value"), value);
        }
        Ok(())
    }

    /// Inverse of [`export`](Self::export); missing records stay `None`.
    pub fn load(store: &CalibrationStore, prefix: &str, device: &Device) -> Result<Self> {
        let record = |name: &str| -> Result<Option<CalibrationRecord>> {
            store
                .get(&format!("{prefix}.{name}"))
                .map(|r| CalibrationRecord::from_stored(r, device))
                .transpose()
        };
        let key = store.get(&format!("{prefix}.key"));
        let value = store.get(&format!("{prefix}.value"));
        Ok(Self {
            query: record("query")?,
            score: record("score")?,
            key_bias: key
                .and_then(|r| r.bias.as_ref())
                .map(|t| from_stored_tensor(t, device))
                .transpose()?,
            key_scale: key
                .and_then(|r| r.scale.as_ref())
                .map(|t| from_stored_tensor(t, device))
                .transpose()?,
            value_scale: value
                .and_then(|r| r.scale.as_ref())
                .map(|t| from_stored_tensor(t, device))
                .transpose()?,
        })
    }
}

pub struct TenderAttention {
    head_dim: usize,
    scale: f64,
    bits: u32,
    query: Option<DecompositionQuantizer>,
    score: Option<DecompositionQuantizer>,
    reduce_output_precision: bool,
    calibration: AttentionCalibration,
    captured: Mutex<Option<AttentionCalibration>>,
}

impl TenderAttention {
    pub fn new(config: &TenderConfig, head_dim: usize) -> Result<Self> {
        let (query, score) = if config.quant_attention {
            (
                Some(DecompositionQuantizer::new(config.site(CallSite::AttentionQuery))?),
                Some(DecompositionQuantizer::new(config.site(CallSite::AttentionScore))?),
            )
        } else {
            (None, None)
        };
        Ok(Self {
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
            bits: config.bits,
            query,
            score,
            reduce_output_precision: config.reduce_output_precision,
            calibration: AttentionCalibration::default(),
            captured: Mutex::new(None),
        })
    }

    pub fn with_calibration(mut self, calibration: AttentionCalibration) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn is_quantized(&self) -> bool {
        self.query.is_some()
    }

    /// Statistics used by the most recent quantised forward pass.
    pub fn last_calibration(&self) -> Option<AttentionCalibration> {
        self.captured.lock().clone()
    }

    pub fn clear_captured(&self) {
        self.captured.lock().take();
    }

    /// `q: (b, h, t, d)`, `k, v: (b, h, s, d)`, additive `mask: (b, 1, t, s)`.
    /// Returns `(b, h, t, d)` in `q`'s dtype.
    pub fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (b, h, t, d) = q.dims4()?;
        let (kb, kh, s, kd) = k.dims4()?;
        if (kb, kh, kd) != (b, h, d) || d != self.head_dim {
            return Err(QuantError::ShapeMismatch(format!(
                "query {:?} and key {:?} disagree (head_dim {})",
                q.dims(),
                k.dims(),
                self.head_dim
            )));
        }
        if v.dims() != k.dims() {
            return Err(QuantError::ShapeMismatch(format!(
                "value {:?} must match key {:?}",
                v.dims(),
                k.dims()
            )));
        }
        if let Some(m) = mask {
            if m.dims() != [b, 1, t, s] {
                return Err(QuantError::ShapeMismatch(format!(
                    "attention mask should be {:?}, got {:?}",
                    [b, 1, t, s],
                    m.dims()
                )));
            }
        }

        let (Some(query), Some(score)) = (&self.query, &self.score) else {
            return self.forward_plain(q, k, v, mask);
        };

        let dtype = q.dtype();
        let groups = b * h;
        let q3 = q
            .to_dtype(DType::F32)?
            .reshape((groups, t, d))?
            .affine(self.scale, 0.0)?;
        let k3 = k.to_dtype(DType::F32)?.reshape((groups, s, d))?;
        let v3 = v.to_dtype(DType::F32)?.reshape((groups, s, d))?;
        let cal = &self.calibration;

        // Key: channel bias over the sequence, then per-row scale.
        let key_bias = match &cal.key_bias {
            Some(kb) => expect_dims(kb, &[groups, 1, d], "key bias")?.to_dtype(DType::F32)?,
            None => ((k3.max_keepdim(1)? + k3.min_keepdim(1)?)? * 0.5)?,
        };
        let k_centered = k3.broadcast_sub(&key_bias)?;
        let key_scale = match &cal.key_scale {
            Some(ks) => leading_positions(ks, groups, s, "key scale")?,
            None => symmetric_scale(&k_centered, 2, self.bits)?,
        };
        let k_hat = fake_quantize(&k_centered, &key_scale, self.bits)?;

        // Query decomposition and bias correction.
        let dq = query.decompose(&q3, Calibration::from_option(cal.query.as_ref()))?;
        let mut scores = dq.residual()?.matmul(&k_hat.t()?)?;
        let q_k_bias = q3.matmul(&key_bias.t()?)?;
        scores = scores.broadcast_add(&q_k_bias)?;
        if let Some(q_bias) = dq.chunk_bias() {
            let o1 = q_bias.matmul(&k3.t()?)?;
            let o3 = q_bias.matmul(&key_bias.t()?)?;
            let correction = dq.expand_chunks(&o1)?.broadcast_sub(&dq.expand_chunks(&o3)?)?;
            scores = (scores + correction)?;
        }

        let mut scores = scores.reshape((b, h, t, s))?;
        if let Some(m) = mask {
            scores = scores.broadcast_add(&m.to_dtype(DType::F32)?)?;
        }
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?.reshape((groups, t, s))?;

        // Probabilities × quantised values.
        let ds = score.decompose(&probs, Calibration::from_option(cal.score.as_ref()))?;
        let value_scale = match &cal.value_scale {
            Some(vs) => expect_dims(vs, &[groups, 1, d], "value scale")?.to_dtype(DType::F32)?,
            None => symmetric_scale(&v3, 1, self.bits)?,
        };
        let v_hat = fake_quantize(&v3, &value_scale, self.bits)?;
        let mut out = ds.reconstruct()?.matmul(&v_hat)?.reshape((b, h, t, d))?;
        if self.reduce_output_precision {
            out = round_to_bf16(&out)?;
        }

        tracing::trace!(
            groups,
            query_len = t,
            key_len = s,
            query_bands = ?dq.stats().band_counts,
            score_bands = ?ds.stats().band_counts,
            "attention decomposed"
        );
        self.captured.lock().replace(AttentionCalibration {
            query: Some(dq.into_calibration()),
            score: Some(ds.into_calibration()),
            key_bias: Some(key_bias),
            key_scale: Some(key_scale),
            value_scale: Some(value_scale),
        });

        Ok(out.to_dtype(dtype)?)
    }

    /// Full-precision scaled dot-product attention.
    fn forward_plain(&self, q: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let dtype = q.dtype();
        let q = q.to_dtype(DType::F32)?;
        let k = k.to_dtype(DType::F32)?;
        let v = v.to_dtype(DType::F32)?;
        let mut scores = (q.matmul(&k.t()?)? * self.scale)?;
        if let Some(m) = mask {
            scores = scores.broadcast_add(&m.to_dtype(DType::F32)?)?;
        }
        let att = candle_nn::ops::softmax(&scores, D::Minus1)?;
        Ok(att.matmul(&v)?.to_dtype(dtype)?)
    }
}

fn expect_dims(t: &Tensor, dims: &[usize], name: &str) -> Result<Tensor> {
    if t.dims() != dims {
        return Err(QuantError::ShapeMismatch(format!(
            "calibrated {name} has shape {:?}, expected {dims:?}",
            t.dims()
        )));
    }
    Ok(t.clone())
}

/// `(groups, n, 1)` with `n >= positions`, narrowed to the first `positions`.
fn leading_positions(t: &Tensor, groups: usize, positions: usize, name: &str) -> Result<Tensor> {
    match t.dims() {
        &[g, n, 1] if g == groups && n >= positions => {
            Ok(t.narrow(1, 0, positions)?.to_dtype(DType::F32)?)
        }
        dims => Err(QuantError::ShapeMismatch(format!(
            "calibrated {name} has shape {dims:?}, expected ({groups}, >={positions}, 1)"
        ))),
    }
}
