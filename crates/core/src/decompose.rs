//! Chunked magnitude-decomposition quantiser.
//!
//! Approximates a `(rows, channels)` activation by a sum of
//! `decomposition_factor` independently quantised magnitude bands:
//!
//! 1. rows are cut into `chunk_size` chunks, the last one zero-padded;
//! 2. per chunk, an optional channel bias `(max + min) / 2` is subtracted;
//! 3. the chunk's absolute maximum `tmax` spans a geometric threshold ladder
//!    `t[i] = tmax / 2^(f-1-i)`;
//! 4. each channel joins the band whose interval holds its chunk maximum;
//! 5. every band is quantised with scale `t[i] / q_max`, dequantised and the
//!    bands are summed;
//! 6. the bias is re-added and the padding trimmed.
//!
//! Low-magnitude channels thereby get a finer step than the outliers sharing
//! their chunk, which is the point of the scheme.
//!
//! Rank-3 inputs `(groups, rows, channels)` run every group independently
//! with its own statistics (attention uses `batch × heads` groups).

use candle_core::{DType, Tensor};

use tender_common::{BandPolicy, DecompositionConfig, QuantError, Result};

use crate::calibration::{slice_chunks, Calibration, CalibrationRecord};
use crate::quantize::{dequantize, quantize_with_range, Scale, MIN_SCALE};

// ── Quantiser ───────────────────────────────────────────────────────────────

/// A configured decomposition quantiser. Stateless between calls.
#[derive(Debug, Clone, Copy)]
pub struct DecompositionQuantizer {
    config: DecompositionConfig,
}

impl DecompositionQuantizer {
    pub fn new(config: DecompositionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &DecompositionConfig {
        &self.config
    }

    /// Decompose and reconstruct with statistics computed from `x`.
    pub fn quantize(&self, x: &Tensor) -> Result<Tensor> {
        self.decompose(x, Calibration::Recomputed)?.reconstruct()
    }

    /// Run the decomposition on a rank-2 or rank-3 tensor.
    ///
    /// Supplied calibration fields replace the matching statistic and are
    /// sliced to the chunks this input needs; absent fields are computed.
    pub fn decompose(&self, x: &Tensor, calibration: Calibration<'_>) -> Result<Decomposition> {
        let cfg = &self.config;
        let dtype = x.dtype();
        let (x, squeezed) = match x.rank() {
            2 => (x.unsqueeze(0)?, true),
            3 => (x.clone(), false),
            r => {
                return Err(QuantError::ShapeMismatch(format!(
                    "decomposition expects (rows, channels) or (groups, rows, channels), got rank {r}"
                )))
            }
        };
        let (groups, rows, channels) = x.dims3()?;
        if rows == 0 || groups == 0 {
            return Err(QuantError::EmptyInput);
        }
        if channels == 0 {
            return Err(QuantError::ShapeMismatch(
                "decomposition input has no channels".into(),
            ));
        }

        let cs = cfg.chunk_size;
        let chunks = rows.div_ceil(cs);
        let padded_rows = chunks * cs;
        let supplied = calibration.record();

        let x = x
            .to_dtype(DType::F32)?
            .pad_with_zeros(1, 0, padded_rows - rows)?
            .reshape((groups, chunks, cs, channels))?;

        // Channel bias.
        let bias = if cfg.bias_removal {
            let bias = match supplied.and_then(|r| r.bias.as_ref()) {
                Some(b) => slice_chunks(b, "bias", groups, chunks, Some(channels))?
                    .to_dtype(DType::F32)?,
                None => {
                    let hi = x.max_keepdim(2)?;
                    let lo = x.min_keepdim(2)?;
                    (hi + lo)?.affine(0.5, 0.0)?.squeeze(2)?
                }
            };
            Some(bias)
        } else {
            None
        };
        let x = match &bias {
            Some(b) => x.broadcast_sub(&b.unsqueeze(2)?)?,
            None => x,
        };

        // Threshold ladder.
        let tensor_max = match supplied.and_then(|r| r.tensor_max.as_ref()) {
            Some(t) => slice_chunks(t, "tensor_max", groups, chunks, None)?.to_dtype(DType::F32)?,
            None => x.abs()?.max(3)?.max(2)?,
        };
        let f = cfg.decomposition_factor;
        let thresholds = (0..f)
            .map(|i| {
                let div = 2f64.powi((f - 1 - i) as i32);
                Ok(tensor_max.affine(1.0 / div, 0.0)?.unsqueeze(2)?)
            })
            .collect::<Result<Vec<_>>>()?;

        // Band assignment source.
        let assignment = match supplied.and_then(|r| r.group_index.as_ref()) {
            Some(gi) => Assignment::Supplied(
                slice_chunks(gi, "group_index", groups, chunks, Some(channels))?
                    .to_dtype(DType::U32)?,
            ),
            None => Assignment::ChannelMax(x.abs()?.max(2)?),
        };

        let q_max = cfg.q_max();
        let mut result = x.zeros_like()?;
        let mut group_index = Tensor::zeros((groups, chunks, channels), DType::F32, x.device())?;
        let mut band_counts = Vec::with_capacity(f);

        for i in 0..f {
            let mask = match &assignment {
                Assignment::Supplied(gi) => gi.eq(i as u32)?.to_dtype(DType::F32)?,
                Assignment::ChannelMax(cmax) => {
                    band_mask(cmax, &thresholds, i, cfg.band_policy)?
                }
            };
            let count = mask.to_dtype(DType::U32)?.sum_all()?.to_scalar::<u32>()? as usize;
            band_counts.push(count);
            if count == 0 {
                continue;
            }
            group_index = (group_index + mask.affine(i as f64, 0.0)?)?;

            let scale = thresholds[i]
                .affine(1.0 / q_max, 0.0)?
                .maximum(MIN_SCALE)?
                .unsqueeze(3)?;
            let band = x.broadcast_mul(&mask.unsqueeze(2)?)?;
            let q = quantize_with_range(&band, Scale::Tensor(&scale), cfg.bits, cfg.range)?;
            result = (result + dequantize(&q, &scale, DType::F32)?)?;
        }

        let stats = DecompositionStats {
            groups,
            chunks,
            channels,
            padded_rows,
            band_counts,
        };
        if stats.assigned() != stats.expected() {
            return Err(QuantError::BandCoverage {
                assigned: stats.assigned(),
                expected: stats.expected(),
            });
        }
        tracing::debug!(
            groups,
            chunks,
            channels,
            bands = ?stats.band_counts,
            "decomposed"
        );

        let group_index = match assignment {
            Assignment::Supplied(gi) => gi,
            Assignment::ChannelMax(_) => group_index.to_dtype(DType::U32)?,
        };
        let record = CalibrationRecord {
            bias: bias.clone(),
            tensor_max: Some(tensor_max),
            group_index: Some(group_index),
        };
        let residual = result
            .reshape((groups, padded_rows, channels))?
            .narrow(1, 0, rows)?;

        Ok(Decomposition {
            residual,
            bias,
            record,
            stats,
            chunk_size: cs,
            rows,
            squeezed,
            dtype,
        })
    }
}

enum Assignment {
    Supplied(Tensor),
    ChannelMax(Tensor),
}

/// F32 0/1 mask of channels in band `i`, shape `(groups, chunks, channels)`.
fn band_mask(cmax: &Tensor, t: &[Tensor], i: usize, policy: BandPolicy) -> Result<Tensor> {
    let last = t.len() - 1;
    let mask = match (policy, i) {
        (BandPolicy::ClosedTop, 0) if last == 0 => cmax.ones_like()?,
        (_, 0) => cmax.broadcast_le(&t[0])?,
        (BandPolicy::ClosedTop, i) if i == last => cmax.broadcast_gt(&t[i - 1])?,
        (_, i) => (cmax.broadcast_gt(&t[i - 1])? * cmax.broadcast_le(&t[i])?)?,
    };
    Ok(mask.to_dtype(DType::F32)?)
}

// ── Result ──────────────────────────────────────────────────────────────────

/// Band counts and layout of one decomposition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecompositionStats {
    pub groups: usize,
    pub chunks: usize,
    pub channels: usize,
    pub padded_rows: usize,
    /// Channel-chunk entries assigned to each band.
    pub band_counts: Vec<usize>,
}

impl DecompositionStats {
    pub fn assigned(&self) -> usize {
        self.band_counts.iter().sum()
    }

    /// `groups × chunks × channels`: every entry lands in exactly one band.
    pub fn expected(&self) -> usize {
        self.groups * self.chunks * self.channels
    }

    /// Assigned elements counting every padded row of a chunk.
    pub fn assigned_elements(&self) -> usize {
        self.assigned() * (self.padded_rows / self.chunks)
    }
}

/// Output of [`DecompositionQuantizer::decompose`].
#[derive(Debug, Clone)]
pub struct Decomposition {
    /// Bias-free dequantised bands, `(groups, rows, channels)` F32.
    residual: Tensor,
    /// `(groups, chunks, channels)` F32.
    bias: Option<Tensor>,
    record: CalibrationRecord,
    stats: DecompositionStats,
    chunk_size: usize,
    rows: usize,
    squeezed: bool,
    dtype: DType,
}

impl Decomposition {
    fn finish(&self, t: Tensor) -> Result<Tensor> {
        let t = if self.squeezed { t.squeeze(0)? } else { t };
        Ok(t.to_dtype(self.dtype)?)
    }

    /// Dequantised bands without the channel bias, in the input's shape and
    /// dtype.
    pub fn residual(&self) -> Result<Tensor> {
        self.finish(self.residual.clone())
    }

    /// Per-chunk channel bias, `(groups, chunks, channels)` F32.
    pub fn chunk_bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// `(groups, chunks, k)` → `(groups, rows, k)`.
    fn repeat_rows(&self, t: &Tensor) -> Result<Tensor> {
        let (groups, chunks, k) = t.dims3()?;
        if groups != self.stats.groups || chunks != self.stats.chunks {
            return Err(QuantError::ShapeMismatch(format!(
                "per-chunk tensor {:?} does not match ({}, {}, _)",
                t.dims(),
                self.stats.groups,
                self.stats.chunks
            )));
        }
        Ok(t.unsqueeze(2)?
            .broadcast_as((groups, chunks, self.chunk_size, k))?
            .reshape((groups, chunks * self.chunk_size, k))?
            .narrow(1, 0, self.rows)?)
    }

    /// Repeat a per-chunk `(groups, chunks, k)` tensor over each chunk's
    /// rows and trim the padding: `(groups, rows, k)`, or `(rows, k)` for
    /// rank-2 input. Keeps the dtype of `t`.
    pub fn expand_chunks(&self, t: &Tensor) -> Result<Tensor> {
        let rows = self.repeat_rows(t)?;
        Ok(if self.squeezed { rows.squeeze(0)? } else { rows })
    }

    /// The channel bias repeated over the rows it was removed from.
    pub fn bias_rows(&self) -> Result<Option<Tensor>> {
        self.bias
            .as_ref()
            .map(|b| Ok(self.expand_chunks(b)?.to_dtype(self.dtype)?))
            .transpose()
    }

    /// Residual plus bias: the approximation of the original input.
    pub fn reconstruct(&self) -> Result<Tensor> {
        let out = match &self.bias {
            Some(b) => (&self.residual + self.repeat_rows(b)?)?,
            None => self.residual.clone(),
        };
        self.finish(out)
    }

    pub fn stats(&self) -> &DecompositionStats {
        &self.stats
    }

    /// Statistics actually used, suitable for persisting and supplying back.
    pub fn calibration(&self) -> &CalibrationRecord {
        &self.record
    }

    pub fn into_calibration(self) -> CalibrationRecord {
        self.record
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantize::fake_quantize;
    use candle_core::Device;
    use tender_common::{CallSite, QuantRange, TenderConfig};

    fn config(factor: usize, policy: BandPolicy, bias: bool) -> DecompositionConfig {
        DecompositionConfig {
            bits: 4,
            chunk_size: 256,
            decomposition_factor: factor,
            band_policy: policy,
            range: QuantRange::Signed,
            bias_removal: bias,
        }
    }

    /// Deterministic, irregular `(rows, channels)` data with per-channel
    /// magnitudes spread over several octaves.
    fn wavy(rows: usize, channels: usize) -> Tensor {
        let dev = Device::Cpu;
        let n = (rows * channels) as f32;
        let base = Tensor::arange(0f32, n, &dev)
            .unwrap()
            .affine(0.37, 0.11)
            .unwrap()
            .sin()
            .unwrap()
            .reshape((rows, channels))
            .unwrap();
        let gains: Vec<f32> = (0..channels).map(|c| 8.0 / 2f32.powi(c as i32)).collect();
        let gains = Tensor::new(gains.as_slice(), &dev).unwrap();
        base.broadcast_mul(&gains).unwrap()
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
    fn three_hundred_rows_two_chunks() {
        let x = wavy(300, 4);
        let q = DecompositionQuantizer::new(config(2, BandPolicy::Inclusive, false)).unwrap();
        let d = q.decompose(&x, Calibration::Recomputed).unwrap();

        let stats = d.stats();
        assert_eq!(stats.chunks, 2);
        assert_eq!(stats.padded_rows, 512);
        assert_eq!(stats.band_counts.len(), 2);
        assert_eq!(stats.assigned(), 8);
        assert_eq!(stats.assigned_elements(), 512 * 4);

        let out = d.reconstruct().unwrap();
        assert_eq!(out.dims(), &[300, 4]);
        // Coarsest step is tmax / 2 / 7 per half of the ladder.
        let bound = 8.0 / 14.0 + 1e-5;
        assert!(max_abs_diff(&x, &out) <= bound);
    }

    #[test]
    fn factor_one_matches_direct_fake_quant() {
        let x = wavy(40, 6);
        let q = DecompositionQuantizer::new(config(1, BandPolicy::Inclusive, false)).unwrap();
        let out = q.quantize(&x).unwrap();

        let scale = x
            .abs()
            .unwrap()
            .max_keepdim(0)
            .unwrap()
            .max_keepdim(1)
            .unwrap()
            .affine(1.0 / 7.0, 0.0)
            .unwrap();
        let direct = fake_quantize(&x, &scale, 4).unwrap();
        assert!(max_abs_diff(&out, &direct) < 1e-6);
    }

    #[test]
    fn rerun_with_own_thresholds_is_idempotent() {
        let x = wavy(300, 8);
        let q = DecompositionQuantizer::new(config(4, BandPolicy::Inclusive, false)).unwrap();
        let first = q.decompose(&x, Calibration::Recomputed).unwrap();
        let once = first.reconstruct().unwrap();

        let record = CalibrationRecord {
            bias: None,
            ..first.calibration().clone()
        };
        let twice = q
            .decompose(&once, Calibration::Supplied(&record))
            .unwrap()
            .reconstruct()
            .unwrap();
        assert!(max_abs_diff(&once, &twice) < 1e-6);
    }

    #[test]
    fn all_zero_input_reconstructs_to_zero() {
        let x = Tensor::zeros((300, 4), DType::F32, &Device::Cpu).unwrap();
        for bias in [false, true] {
            let q = DecompositionQuantizer::new(config(8, BandPolicy::Inclusive, bias)).unwrap();
            let out = q.quantize(&x).unwrap();
            assert_eq!(out.dims(), &[300, 4]);
            assert_eq!(out.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
        }
    }

    /// Channel maxima 1.0, 0.5, 0.1, 0.0 in one chunk.
    fn ladder_input() -> Tensor {
        Tensor::new(&[[1.0f32, -0.5, 0.1, 0.0], [0.2, 0.25, -0.05, 0.0]], &Device::Cpu).unwrap()
    }

    #[test]
    fn band_policies_agree_when_top_threshold_covers() {
        let x = ladder_input();
        for policy in [BandPolicy::Inclusive, BandPolicy::ClosedTop] {
            let q = DecompositionQuantizer::new(config(2, policy, false)).unwrap();
            let d = q.decompose(&x, Calibration::Recomputed).unwrap();
            assert_eq!(d.stats().band_counts, vec![3, 1]);
            let gi = d.calibration().group_index.as_ref().unwrap();
            assert_eq!(gi.to_vec3::<u32>().unwrap(), vec![vec![vec![1, 0, 0, 0]]]);
        }
    }

    #[test]
    fn closed_top_catches_values_above_supplied_max() {
        let x = ladder_input();
        let record = CalibrationRecord {
            tensor_max: Some(Tensor::new(&[[0.8f32]], &Device::Cpu).unwrap()),
            ..Default::default()
        };

        let closed = DecompositionQuantizer::new(config(2, BandPolicy::ClosedTop, false)).unwrap();
        let d = closed.decompose(&x, Calibration::Supplied(&record)).unwrap();
        assert_eq!(d.stats().band_counts, vec![2, 2]);

        let inclusive = DecompositionQuantizer::new(config(2, BandPolicy::Inclusive, false)).unwrap();
        let err = inclusive
            .decompose(&x, Calibration::Supplied(&record))
            .unwrap_err();
        assert!(matches!(
            err,
            QuantError::BandCoverage {
                assigned: 3,
                expected: 4
            }
        ));
    }

    #[test]
    fn closed_top_single_band_takes_everything() {
        let x = ladder_input();
        let record = CalibrationRecord {
            tensor_max: Some(Tensor::new(&[[0.01f32]], &Device::Cpu).unwrap()),
            ..Default::default()
        };
        let q = DecompositionQuantizer::new(config(1, BandPolicy::ClosedTop, false)).unwrap();
        let d = q.decompose(&x, Calibration::Supplied(&record)).unwrap();
        assert_eq!(d.stats().band_counts, vec![4]);
    }

    #[test]
    fn supplied_group_index_overrides_channel_maxima() {
        let x = ladder_input();
        let record = CalibrationRecord {
            group_index: Some(Tensor::new(&[[[0u32, 1, 1, 1]]], &Device::Cpu).unwrap()),
            ..Default::default()
        };
        let q = DecompositionQuantizer::new(config(2, BandPolicy::Inclusive, false)).unwrap();
        let d = q.decompose(&x, Calibration::Supplied(&record)).unwrap();
        assert_eq!(d.stats().band_counts, vec![1, 3]);
        // Channel 0 lands in the fine band and saturates at 7 · (0.5 / 7).
        let out: Vec<Vec<f32>> = d.reconstruct().unwrap().to_vec2().unwrap();
        assert!((out[0][0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn supplied_statistics_are_sliced_to_needed_chunks() {
        let x = wavy(300, 4);
        let q = DecompositionQuantizer::new(config(2, BandPolicy::Inclusive, false)).unwrap();
        let long = Tensor::new(&[[10.0f32, 10.0, 10.0]], &Device::Cpu).unwrap();
        let record = CalibrationRecord {
            tensor_max: Some(long),
            ..Default::default()
        };
        let d = q.decompose(&x, Calibration::Supplied(&record)).unwrap();
        assert_eq!(d.calibration().tensor_max.as_ref().unwrap().dims(), &[1, 2]);

        let short = CalibrationRecord {
            tensor_max: Some(Tensor::new(&[[10.0f32]], &Device::Cpu).unwrap()),
            ..Default::default()
        };
        let err = q.decompose(&x, Calibration::Supplied(&short)).unwrap_err();
        assert!(matches!(err, QuantError::ShapeMismatch(_)));
    }

    #[test]
    fn bias_removal_handles_constant_offsets() {
        // One full chunk: padding rows would otherwise pull the bias to ~50.
        let x = (wavy(64, 4).affine(0.125, 100.0)).unwrap();
        let cfg = |bias| DecompositionConfig {
            chunk_size: 64,
            ..config(8, BandPolicy::Inclusive, bias)
        };

        let with_bias = DecompositionQuantizer::new(cfg(true)).unwrap();
        let d = with_bias.decompose(&x, Calibration::Recomputed).unwrap();
        assert_eq!(d.chunk_bias().unwrap().dims(), &[1, 1, 4]);
        assert_eq!(d.bias_rows().unwrap().unwrap().dims(), &[64, 4]);
        let err_bias = max_abs_diff(&x, &d.reconstruct().unwrap());

        let without = DecompositionQuantizer::new(cfg(false)).unwrap();
        let err_plain = max_abs_diff(&x, &without.quantize(&x).unwrap());

        assert!(err_bias < 0.1, "bias-removed error {err_bias}");
        assert!(err_plain > err_bias);
    }

    #[test]
    fn groups_keep_independent_statistics() {
        let a = wavy(10, 4);
        let b = (wavy(10, 4) * 100.0).unwrap();
        let x = Tensor::stack(&[&a, &b], 0).unwrap();
        let q = DecompositionQuantizer::new(config(8, BandPolicy::Inclusive, false)).unwrap();
        let d = q.decompose(&x, Calibration::Recomputed).unwrap();
        assert_eq!(d.stats().assigned(), 2 * 4);
        assert_eq!(d.calibration().tensor_max.as_ref().unwrap().dims(), &[2, 1]);

        let out = d.reconstruct().unwrap();
        assert_eq!(out.dims(), &[2, 10, 4]);
        let small = out.narrow(0, 0, 1).unwrap().squeeze(0).unwrap();
        assert!(max_abs_diff(&a, &small) <= 8.0 / 14.0);
    }

    #[test]
    fn band_counts_are_exact_over_many_groups() {
        // Channel maxima 4, 2, 1 per group, so each band holds one channel
        // per group with factor 3.
        let row = Tensor::new(&[[4.0f32, -2.0, 1.0]], &Device::Cpu).unwrap();
        let x = row.broadcast_as((1000, 1, 3)).unwrap().contiguous().unwrap();
        let q = DecompositionQuantizer::new(config(3, BandPolicy::Inclusive, false)).unwrap();
        let d = q.decompose(&x, Calibration::Recomputed).unwrap();
        assert_eq!(d.stats().band_counts, vec![1000, 1000, 1000]);
        assert_eq!(d.stats().assigned(), d.stats().expected());
    }

    #[test]
    fn unsigned_score_site_stays_non_negative() {
        let logits = wavy(20, 16);
        let probs = candle_nn::ops::softmax(&logits, candle_core::D::Minus1).unwrap();
        let cfg = TenderConfig::default().site(CallSite::AttentionScore);
        let q = DecompositionQuantizer::new(cfg).unwrap();
        let out = q.quantize(&probs).unwrap();
        let min = out.flatten_all().unwrap().min(0).unwrap().to_scalar::<f32>().unwrap();
        assert!(min >= 0.0);
        assert!(max_abs_diff(&probs, &out) < 1.0 / 15.0);
    }

    #[test]
    fn output_keeps_input_dtype() {
        let x = wavy(12, 4).to_dtype(DType::F64).unwrap();
        let q = DecompositionQuantizer::new(config(8, BandPolicy::Inclusive, true)).unwrap();
        let d = q.decompose(&x, Calibration::Recomputed).unwrap();
        assert_eq!(d.reconstruct().unwrap().dtype(), DType::F64);
        assert_eq!(d.residual().unwrap().dtype(), DType::F64);
    }

    #[test]
    fn rejects_bad_shapes() {
        let dev = Device::Cpu;
        let q = DecompositionQuantizer::new(DecompositionConfig::default()).unwrap();

        let empty = Tensor::zeros((0, 4), DType::F32, &dev).unwrap();
        assert!(matches!(
            q.decompose(&empty, Calibration::Recomputed),
            Err(QuantError::EmptyInput)
        ));

        let flat = Tensor::zeros(4, DType::F32, &dev).unwrap();
        assert!(matches!(
            q.decompose(&flat, Calibration::Recomputed),
            Err(QuantError::ShapeMismatch(_))
        ));

        let bad = DecompositionConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            DecompositionQuantizer::new(bad),
            Err(QuantError::InvalidConfig(_))
        ));
    }
}
