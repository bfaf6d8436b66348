//! Persisted calibration records.
//!
//! Offline profiling runs the decomposition once with on-the-fly statistics
//! and keeps what it computed (channel bias, per-chunk tensor max, per-channel
//! band assignment) so later forward passes can skip that work. This module
//! is the plain-data side: shapes and flat values keyed by layer identity,
//! written as JSON. Conversion to tensors lives in `tender-core`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// A dense tensor as row-major values plus shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl StoredTensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self { shape, data }
    }

    pub fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// True when `data` holds exactly `shape.product()` values.
    pub fn is_consistent(&self) -> bool {
        self.elem_count() == self.data.len()
    }
}

/// Calibration statistics for one quantised tensor site.
///
/// All fields are optional: a missing field means "recompute on the fly".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// `(groups, chunks, channels)` channel bias.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bias: Option<StoredTensor>,
    /// `(groups, chunks)` per-chunk absolute maximum.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tensor_max: Option<StoredTensor>,
    /// `(groups, chunks, channels)` band ids, stored as floats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_index: Option<StoredTensor>,
    /// Plain symmetric scale, used by the attention key and value paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<StoredTensor>,
}

impl StoredRecord {
    pub fn is_empty(&self) -> bool {
        self.bias.is_none()
            && self.tensor_max.is_none()
            && self.group_index.is_none()
            && self.scale.is_none()
    }
}

/// Layer id → calibration record, e.g. `layers.3.mlp.fc1`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStore {
    #[serde(default)]
    pub layers: BTreeMap<String, StoredRecord>,
}

impl CalibrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, layer: impl Into<String>, record: StoredRecord) {
        self.layers.insert(layer.into(), record);
    }

    pub fn get(&self, layer: &str) -> Option<&StoredRecord> {
        self.layers.get(layer)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Save store to a JSON file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load store from a JSON file, rejecting tensors whose data does not
    /// match their shape.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let store: Self = serde_json::from_str(&json)?;
        for (layer, record) in &store.layers {
            for (field, tensor) in [
                ("bias", &record.bias),
                ("tensor_max", &record.tensor_max),
                ("group_index", &record.group_index),
                ("scale", &record.scale),
            ] {
                if let Some(t) = tensor {
                    anyhow::ensure!(
                        t.is_consistent(),
                        "{layer}.{field}: shape {:?} needs {} values, found {}",
                        t.shape,
                        t.elem_count(),
                        t.data.len()
                    );
                }
            }
        }
        Ok(store)
    }
}
