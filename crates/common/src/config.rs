//! Quantisation configuration for tender-quant.
//!
//! Serialised as JSON. Every field has a sensible default so a minimal `{}`
//! JSON produces the standard 4-bit setup (factor 8 for the MLP and attention
//! paths, factor 14 for the LM head, 256-row chunks).
//!
//! The config is read once and then treated as immutable: call sites resolve
//! it into a [`DecompositionConfig`] at construction time and never flip
//! flags during a forward pass.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{QuantError, Result};

/// Largest supported decomposition factor. Thresholds are `max / 2^(f-1-i)`,
/// so beyond this the finest band falls under f32 resolution.
pub const MAX_DECOMPOSITION_FACTOR: usize = 32;

// ── Enums ───────────────────────────────────────────────────────────────────

/// How channel maxima are bucketed into magnitude bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandPolicy {
    /// Every band is `(t[i-1], t[i]]`, band 0 is `<= t[0]`. Values above the
    /// top threshold belong to no band.
    Inclusive,
    /// Like [`Inclusive`](Self::Inclusive), but the last band is open-topped:
    /// `> t[last-1]`.
    ClosedTop,
}

/// Integer grid used when quantising a band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantRange {
    /// `[-(2^(b-1)), 2^(b-1) - 1]`.
    Signed,
    /// `[0, 2^b - 1]`, for non-negative inputs such as attention probabilities.
    Unsigned,
}

impl QuantRange {
    /// Inclusive integer bounds `(q_min, q_max)` for `bits`.
    pub fn bounds(&self, bits: u32) -> (f64, f64) {
        match self {
            Self::Signed => {
                let half = 2f64.powi(bits as i32 - 1);
                (-half, half - 1.0)
            }
            Self::Unsigned => (0.0, 2f64.powi(bits as i32) - 1.0),
        }
    }

    /// Largest representable integer, the divisor for band scales.
    pub fn q_max(&self, bits: u32) -> f64 {
        self.bounds(bits).1
    }

    /// Supported bit-widths: `2..=16` signed, `1..=16` unsigned.
    pub fn check_bits(&self, bits: u32) -> Result<()> {
        let min_bits = match self {
            Self::Signed => 2,
            Self::Unsigned => 1,
        };
        if !(min_bits..=16).contains(&bits) {
            return Err(QuantError::InvalidConfig(format!(
                "bits must be in {min_bits}..=16 for a {self:?} range, got {bits}"
            )));
        }
        Ok(())
    }
}

/// The places in the forward pass that run the decomposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallSite {
    /// Feed-forward inputs (gate/up and down projections).
    Mlp,
    /// Query activations before `Q Kᵀ`.
    AttentionQuery,
    /// Softmax probabilities before `S V`.
    AttentionScore,
    /// Final hidden states before the vocabulary projection.
    LmHead,
}

impl CallSite {
    pub fn all() -> [Self; 4] {
        [
            Self::Mlp,
            Self::AttentionQuery,
            Self::AttentionScore,
            Self::LmHead,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mlp => "mlp",
            Self::AttentionQuery => "attention-query",
            Self::AttentionScore => "attention-score",
            Self::LmHead => "lm-head",
        }
    }
}

impl FromStr for CallSite {
    type Err = QuantError;

    fn from_str(s: &str) -> Result<Self> {
        Self::all()
            .into_iter()
            .find(|site| site.as_str() == s)
            .ok_or_else(|| QuantError::InvalidConfig(format!("unknown call site '{s}'")))
    }
}

// ── Per-site knobs ──────────────────────────────────────────────────────────

/// Decomposition parameters that differ between call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Number of magnitude bands.
    pub decomposition_factor: usize,
    /// Band boundary policy.
    pub band_policy: BandPolicy,
    /// Subtract the per-chunk channel bias `(max + min) / 2` first.
    pub bias_removal: bool,
}

impl SiteConfig {
    fn default_for(site: CallSite) -> Self {
        match site {
            CallSite::Mlp | CallSite::AttentionQuery => Self {
                decomposition_factor: 8,
                band_policy: BandPolicy::Inclusive,
                bias_removal: true,
            },
            CallSite::AttentionScore => Self {
                decomposition_factor: 8,
                band_policy: BandPolicy::ClosedTop,
                bias_removal: false,
            },
            CallSite::LmHead => Self {
                decomposition_factor: 14,
                band_policy: BandPolicy::ClosedTop,
                bias_removal: false,
            },
        }
    }
}

// ── Resolved quantiser config ───────────────────────────────────────────────

/// Fully resolved, immutable configuration of one decomposition quantiser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompositionConfig {
    pub bits: u32,
    pub chunk_size: usize,
    pub decomposition_factor: usize,
    pub band_policy: BandPolicy,
    pub range: QuantRange,
    pub bias_removal: bool,
}

impl Default for DecompositionConfig {
    fn default() -> Self {
        TenderConfig::default().site(CallSite::Mlp)
    }
}

impl DecompositionConfig {
    /// Reject configurations that would divide by zero or overflow the
    /// threshold ladder.
    pub fn validate(&self) -> Result<()> {
        self.range.check_bits(self.bits)?;
        if self.chunk_size == 0 {
            return Err(QuantError::InvalidConfig(
                "chunk_size must be positive".into(),
            ));
        }
        if !(1..=MAX_DECOMPOSITION_FACTOR).contains(&self.decomposition_factor) {
            return Err(QuantError::InvalidConfig(format!(
                "decomposition_factor must be in 1..={MAX_DECOMPOSITION_FACTOR}, got {}",
                self.decomposition_factor
            )));
        }
        Ok(())
    }

    /// Largest integer on this config's grid.
    pub fn q_max(&self) -> f64 {
        self.range.q_max(self.bits)
    }
}

// ── Top-level config ────────────────────────────────────────────────────────

/// Configuration for all quantised call sites of one model.
///
/// Backwards-compatible: missing fields fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenderConfig {
    /// Bit-width shared by all call sites.
    pub bits: u32,
    /// Rows per chunk for statistics collection.
    pub chunk_size: usize,

    // ── Call-site switches ──────────────────────────────────────────────────
    pub quant_mlp: bool,
    pub quant_attention: bool,
    pub quant_lm_head: bool,
    /// Round projection and attention outputs to bfloat16 precision.
    pub reduce_output_precision: bool,

    // ── Per-site decomposition ──────────────────────────────────────────────
    pub mlp: SiteConfig,
    pub attention_query: SiteConfig,
    pub attention_score: SiteConfig,
    pub lm_head: SiteConfig,
}

impl Default for TenderConfig {
    fn default() -> Self {
        Self {
            bits: 4,
            chunk_size: 256,
            quant_mlp: true,
            quant_attention: true,
            quant_lm_head: true,
            reduce_output_precision: false,
            mlp: SiteConfig::default_for(CallSite::Mlp),
            attention_query: SiteConfig::default_for(CallSite::AttentionQuery),
            attention_score: SiteConfig::default_for(CallSite::AttentionScore),
            lm_head: SiteConfig::default_for(CallSite::LmHead),
        }
    }
}

impl TenderConfig {
    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }

    pub fn site_config(&self, site: CallSite) -> &SiteConfig {
        match site {
            CallSite::Mlp => &self.mlp,
            CallSite::AttentionQuery => &self.attention_query,
            CallSite::AttentionScore => &self.attention_score,
            CallSite::LmHead => &self.lm_head,
        }
    }

    /// Resolve a call site into the quantiser configuration it runs with.
    pub fn site(&self, site: CallSite) -> DecompositionConfig {
        let s = self.site_config(site);
        let range = match site {
            CallSite::AttentionScore => QuantRange::Unsigned,
            _ => QuantRange::Signed,
        };
        DecompositionConfig {
            bits: self.bits,
            chunk_size: self.chunk_size,
            decomposition_factor: s.decomposition_factor,
            band_policy: s.band_policy,
            range,
            bias_removal: s.bias_removal,
        }
    }

    /// Validate every call site.
    pub fn validate(&self) -> Result<()> {
        for site in CallSite::all() {
            self.site(site).validate()?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
