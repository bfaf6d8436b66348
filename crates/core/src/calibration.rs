//! Calibration cache: supplied-or-recomputed decomposition statistics.
//!
//! A [`CalibrationRecord`] holds the three statistics the decomposition can
//! take from outside instead of computing them per call:
//!
//! | Field | Shape | Replaces |
//! |-------|-------|----------|
//! | `bias` | `(groups, chunks, channels)` | `(max + min) / 2` channel bias |
//! | `tensor_max` | `(groups, chunks)` | per-chunk `max |x|` |
//! | `group_index` | `(groups, chunks, channels)` U32 | band assignment from channel maxima |
//!
//! Records may cover more chunks than a given call needs (calibrated on a
//! longer sequence); they are sliced to the leading chunks. The quantiser
//! never mutates a supplied record.

use candle_core::{DType, Device, Tensor};

use tender_common::{QuantError, Result, StoredRecord, StoredTensor};

/// Where the decomposition statistics come from for one call.
#[derive(Debug, Clone, Copy, Default)]
pub enum Calibration<'a> {
    /// Compute everything from the input.
    #[default]
    Recomputed,
    /// Use the record's fields; absent fields are still computed.
    Supplied(&'a CalibrationRecord),
}

impl<'a> Calibration<'a> {
    pub fn from_option(record: Option<&'a CalibrationRecord>) -> Self {
        match record {
            Some(r) => Self::Supplied(r),
            None => Self::Recomputed,
        }
    }

    pub fn record(&self) -> Option<&'a CalibrationRecord> {
        match self {
            Self::Recomputed => None,
            Self::Supplied(r) => Some(r),
        }
    }
}

/// Decomposition statistics on tensors.
#[derive(Debug, Clone, Default)]
pub struct CalibrationRecord {
    pub bias: Option<Tensor>,
    pub tensor_max: Option<Tensor>,
    pub group_index: Option<Tensor>,
}

impl CalibrationRecord {
    pub fn is_empty(&self) -> bool {
        self.bias.is_none() && self.tensor_max.is_none() && self.group_index.is_none()
    }

    /// Convert to the plain-data form used for persistence.
    pub fn to_stored(&self) -> Result<StoredRecord> {
        Ok(StoredRecord {
            bias: self.bias.as_ref().map(to_stored_tensor).transpose()?,
            tensor_max: self.tensor_max.as_ref().map(to_stored_tensor).transpose()?,
            group_index: self.group_index.as_ref().map(to_stored_tensor).transpose()?,
            scale: None,
        })
    }

    /// Rebuild tensors from a persisted record. `group_index` comes back as U32.
    pub fn from_stored(stored: &StoredRecord, device: &Device) -> Result<Self> {
        let group_index = stored
            .group_index
            .as_ref()
            .map(|t| -> Result<Tensor> { Ok(from_stored_tensor(t, device)?.to_dtype(DType::U32)?) })
            .transpose()?;
        Ok(Self {
            bias: stored
                .bias
                .as_ref()
                .map(|t| from_stored_tensor(t, device))
                .transpose()?,
            tensor_max: stored
                .tensor_max
                .as_ref()
                .map(|t| from_stored_tensor(t, device))
                .transpose()?,
            group_index,
        })
    }
}

pub(crate) fn to_stored_tensor(t: &Tensor) -> Result<StoredTensor> {
    let shape = t.dims().to_vec();
    let data = t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    Ok(StoredTensor::new(shape, data))
}

pub(crate) fn from_stored_tensor(t: &StoredTensor, device: &Device) -> Result<Tensor> {
    if !t.is_consistent() {
        return Err(QuantError::ShapeMismatch(format!(
            "stored tensor of shape {:?} holds {} values",
            t.shape,
            t.data.len()
        )));
    }
    Ok(Tensor::from_vec(t.data.clone(), t.shape.as_slice(), device)?)
}

/// Slice a supplied per-chunk statistic to the first `chunks` chunks.
///
/// `stat` must be `(groups, n, m)` when `channels` is given, else
/// `(groups, n)`, with `n >= chunks` and `m >= channels`. Extra channels are
/// dropped too: the score path's channel axis is the key length, which grows
/// during decoding.
pub(crate) fn slice_chunks(
    stat: &Tensor,
    name: &str,
    groups: usize,
    chunks: usize,
    channels: Option<usize>,
) -> Result<Tensor> {
    let dims = stat.dims();
    let ok = match (channels, dims) {
        (Some(c), &[g, n, ch]) => g == groups && n >= chunks && ch >= c,
        (None, &[g, n]) => g == groups && n >= chunks,
        _ => false,
    };
    if !ok {
        let expected = match channels {
            Some(c) => format!("({groups}, >={chunks}, >={c})"),
            None => format!("({groups}, >={chunks})"),
        };
        return Err(QuantError::ShapeMismatch(format!(
            "calibrated {name} has shape {dims:?}, expected {expected}"
        )));
    }
    let stat = stat.narrow(1, 0, chunks)?;
    match channels {
        Some(c) => Ok(stat.narrow(2, 0, c)?),
        None => Ok(stat),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_round_trip_keeps_values_and_dtype() {
        let dev = Device::Cpu;
        let record = CalibrationRecord {
            bias: Some(Tensor::new(&[[[0.5f32, -0.25]]], &dev).unwrap()),
            tensor_max: Some(Tensor::new(&[[2.0f32, 4.0]], &dev).unwrap()),
            group_index: Some(Tensor::new(&[[[0u32, 3]]], &dev).unwrap()),
        };
        let stored = record.to_stored().unwrap();
        assert_eq!(stored.bias.as_ref().unwrap().shape, vec![1, 1, 2]);
        assert_eq!(stored.group_index.as_ref().unwrap().data, vec![0.0, 3.0]);

        let back = CalibrationRecord::from_stored(&stored, &dev).unwrap();
        let gi = back.group_index.unwrap();
        assert_eq!(gi.dtype(), DType::U32);
        assert_eq!(gi.to_vec3::<u32>().unwrap(), vec![vec![vec![0, 3]]]);
        assert_eq!(
            back.tensor_max.unwrap().to_vec2::<f32>().unwrap(),
            vec![vec![2.0, 4.0]]
        );
    }

    #[test]
    fn inconsistent_stored_tensor_is_a_shape_error() {
        let stored = StoredRecord {
            tensor_max: Some(StoredTensor::new(vec![1, 4], vec![1.0, 2.0])),
            ..Default::default()
        };
        let err = CalibrationRecord::from_stored(&stored, &Device::Cpu).unwrap_err();
        assert!(matches!(err, QuantError::ShapeMismatch(_)));
    }

    #[test]
    fn slicing_takes_leading_chunks() {
        let dev = Device::Cpu;
        let tmax = Tensor::new(&[[1.0f32, 2.0, 3.0]], &dev).unwrap();
        let s = slice_chunks(&tmax, "tensor_max", 1, 2, None).unwrap();
        assert_eq!(s.to_vec2::<f32>().unwrap(), vec![vec![1.0, 2.0]]);
    }

    #[test]
    fn slicing_rejects_short_or_mismatched_records() {
        let dev = Device::Cpu;
        let tmax = Tensor::new(&[[1.0f32]], &dev).unwrap();
        assert!(slice_chunks(&tmax, "tensor_max", 1, 2, None).is_err());

        let bias = Tensor::zeros((1, 2, 3), DType::F32, &dev).unwrap();
        assert!(slice_chunks(&bias, "bias", 1, 2, Some(4)).is_err());
        assert!(slice_chunks(&bias, "bias", 2, 2, Some(3)).is_err());
        assert!(slice_chunks(&bias, "bias", 1, 2, Some(3)).is_ok());

        let trimmed = slice_chunks(&bias, "group_index", 1, 1, Some(2)).unwrap();
        assert_eq!(trimmed.dims(), &[1, 1, 2]);
    }

    #[test]
    fn calibration_from_option() {
        let record = CalibrationRecord::default();
        assert!(Calibration::from_option(None).record().is_none());
        assert!(Calibration::from_option(Some(&record)).record().is_some());
        assert!(record.is_empty());
    }
}
