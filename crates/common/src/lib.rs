//! # tender-common — Shared Primitives
//!
//! Types shared across every crate in the workspace:
//!
//! * **[`TenderConfig`]** — call-site quantisation settings (serialised as JSON).
//! * **[`DecompositionConfig`]** — the resolved, immutable config of one quantiser.
//! * **[`QuantError`]** — error taxonomy of the numeric pipeline.
//! * **[`CalibrationStore`]** — persisted per-layer calibration statistics.

pub mod calibration;
pub mod config;
pub mod error;

pub use calibration::{CalibrationStore, StoredRecord, StoredTensor};
pub use config::{
    BandPolicy, CallSite, DecompositionConfig, QuantRange, SiteConfig, TenderConfig,
    MAX_DECOMPOSITION_FACTOR,
};
pub use error::{QuantError, Result};
