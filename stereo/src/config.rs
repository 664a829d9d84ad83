use cv_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Highest number of recurrence levels the update cascade supports.
pub const MAX_GRU_LAYERS: usize = 3;

/// Correlation strategy, resolved once when the pyramid is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrImplementation {
    /// Precomputed f32 cost volume.
    #[default]
    Reg,
    /// Costs computed on demand for every tap.
    Alt,
    /// Costs computed on demand once per integer column of the window.
    AltFast,
    /// Precomputed cost volume stored in half precision.
    RegCuda,
    /// On-demand costs over half-precision feature maps.
    AltCuda,
}

impl CorrImplementation {
    pub const ALL: [CorrImplementation; 5] = [
        CorrImplementation::Reg,
        CorrImplementation::Alt,
        CorrImplementation::AltFast,
        CorrImplementation::RegCuda,
        CorrImplementation::AltCuda,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CorrImplementation::Reg => "reg",
            CorrImplementation::Alt => "alt",
            CorrImplementation::AltFast => "alt_fast",
            CorrImplementation::RegCuda => "reg_cuda",
            CorrImplementation::AltCuda => "alt_cuda",
        }
    }

    pub fn is_half_precision(&self) -> bool {
        matches!(self, CorrImplementation::RegCuda | CorrImplementation::AltCuda)
    }
}

impl FromStr for CorrImplementation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|imp| imp.as_str() == s)
            .ok_or_else(|| {
                Error::InvalidParameters(format!(
                    "Unknown correlation implementation '{}' (expected one of reg, alt, alt_fast, reg_cuda, alt_cuda)",
                    s
                ))
            })
    }
}

impl fmt::Display for CorrImplementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which refinement steps produce a full-resolution map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Only the final iteration is upsampled.
    #[default]
    Inference,
    /// Every iteration is upsampled and returned in order.
    Sequence,
}

/// Immutable model configuration handed to every component at construction.
///
/// `hidden_dims` is ordered coarse-to-fine: entry 0 is the coarsest recurrence
/// level and the last entry is the level that drives the flow head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StereoConfig {
    pub hidden_dims: Vec<usize>,
    pub corr_implementation: CorrImplementation,
    pub corr_levels: usize,
    pub corr_radius: usize,
    pub n_downsample: u32,
    pub n_gru_layers: usize,
    pub slow_fast_gru: bool,
    pub iters: usize,
    pub output_mode: OutputMode,
    /// Channel count of the matching feature maps.
    pub feature_dim: usize,
    /// Build the mask head and upsample convexly; otherwise upsample bilinearly.
    pub convex_upsample: bool,
}

impl Default for StereoConfig {
    fn default() -> Self {
        Self {
            hidden_dims: vec![128; 3],
            corr_implementation: CorrImplementation::Reg,
            corr_levels: 4,
            corr_radius: 4,
            n_downsample: 2,
            n_gru_layers: 3,
            slow_fast_gru: false,
            iters: 12,
            output_mode: OutputMode::Inference,
            feature_dim: 256,
            convex_upsample: true,
        }
    }
}

impl StereoConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hidden_dims(mut self, dims: Vec<usize>) -> Self {
        self.hidden_dims = dims;
        self
    }

    pub fn with_corr_implementation(mut self, implementation: CorrImplementation) -> Self {
        self.corr_implementation = implementation;
        self
    }

    pub fn with_corr(mut self, levels: usize, radius: usize) -> Self {
        self.corr_levels = levels;
        self.corr_radius = radius;
        self
    }

    pub fn with_n_downsample(mut self, n: u32) -> Self {
        self.n_downsample = n;
        self
    }

    /// Set the recurrence level count together with per-level hidden sizes.
    pub fn with_gru_layers(mut self, layers: usize, hidden: usize) -> Self {
        self.n_gru_layers = layers;
        self.hidden_dims = vec![hidden; layers];
        self
    }

    pub fn with_slow_fast_gru(mut self, enabled: bool) -> Self {
        self.slow_fast_gru = enabled;
        self
    }

    pub fn with_iters(mut self, iters: usize) -> Self {
        self.iters = iters;
        self
    }

    pub fn with_output_mode(mut self, mode: OutputMode) -> Self {
        self.output_mode = mode;
        self
    }

    pub fn with_feature_dim(mut self, dim: usize) -> Self {
        self.feature_dim = dim;
        self
    }

    pub fn with_convex_upsample(mut self, enabled: bool) -> Self {
        self.convex_upsample = enabled;
        self
    }

    /// Upsampling factor between the finest recurrence level and the input.
    pub fn downsample_factor(&self) -> usize {
        1usize << self.n_downsample
    }

    /// Channels of one correlation lookup, `levels · (2·radius + 1)`.
    pub fn corr_channels(&self) -> usize {
        self.corr_levels * (2 * self.corr_radius + 1)
    }

    /// Hidden size of the finest recurrence level.
    pub fn finest_hidden_dim(&self) -> usize {
        self.hidden_dims.last().copied().unwrap_or(0)
    }

    /// Reject inconsistent settings. Called by every constructor.
    pub fn validate(&self) -> Result<()> {
        if self.n_gru_layers == 0 || self.n_gru_layers > MAX_GRU_LAYERS {
            return Err(Error::InvalidParameters(format!(
                "n_gru_layers must be in 1..={}, got {}",
                MAX_GRU_LAYERS, self.n_gru_layers
            )));
        }
        if self.hidden_dims.len() != self.n_gru_layers {
            return Err(Error::InvalidParameters(format!(
                "hidden_dims has {} entries but n_gru_layers is {}",
                self.hidden_dims.len(),
                self.n_gru_layers
            )));
        }
        if self.hidden_dims.iter().any(|&d| d == 0) {
            return Err(Error::InvalidParameters(
                "hidden_dims entries must be positive".into(),
            ));
        }
        if self.corr_levels == 0 {
            return Err(Error::InvalidParameters(
                "corr_levels must be at least 1".into(),
            ));
        }
        if self.iters == 0 {
            return Err(Error::InvalidParameters("iters must be at least 1".into()));
        }
        if self.feature_dim == 0 {
            return Err(Error::InvalidParameters(
                "feature_dim must be positive".into(),
            ));
        }
        if self.n_downsample > 5 {
            return Err(Error::InvalidParameters(format!(
                "n_downsample must be at most 5, got {}",
                self.n_downsample
            )));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Self::from_json_str(&data).map_err(|e| match e {
            Error::Serialization(msg) => Error::Serialization(format!(
                "Failed to parse config {}: {}",
                path.display(),
                msg
            )),
            other => other,
        })
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}
