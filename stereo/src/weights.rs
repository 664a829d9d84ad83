//! Named parameter storage for the refinement network.
//!
//! Keys follow the dotted state-dict convention of the trained checkpoints
//! (`update_block.encoder.convc1.weight`, `context_zqr_convs.0.bias`, ...), so a
//! store can be filled from converted checkpoints or seeded deterministically.

use crate::config::StereoConfig;
use crate::update::{ContextProjector, UpdateCascade};
use cv_core::{Error, Result, Tensor, TensorShape};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Key of the correlation-encoder input layer, the only layer whose shape
/// depends on the correlation radius.
pub const CORR_ENCODER_KEY: &str = "update_block.encoder.convc1";

/// Shape of one convolution layer in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvSpec {
    pub name: String,
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
}

impl ConvSpec {
    pub fn new(name: impl Into<String>, in_channels: usize, out_channels: usize, kernel: usize) -> Self {
        Self {
            name: name.into(),
            in_channels,
            out_channels,
            kernel,
        }
    }

    pub fn weight_key(&self) -> String {
        format!("{}.weight", self.name)
    }

    pub fn bias_key(&self) -> String {
        format!("{}.bias", self.name)
    }

    pub fn weight_shape(&self) -> TensorShape {
        TensorShape::nchw(self.out_channels, self.in_channels, self.kernel, self.kernel)
    }

    pub fn fan_in(&self) -> usize {
        self.in_channels * self.kernel * self.kernel
    }
}

/// Every convolution the refinement core needs for `config`, backbone excluded.
pub fn model_conv_specs(config: &StereoConfig) -> Vec<ConvSpec> {
    let mut specs = ContextProjector::conv_specs(config);
    specs.extend(UpdateCascade::conv_specs(config));
    specs
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredTensor {
    dims: Vec<usize>,
    data: Vec<f32>,
}

/// Flat map from parameter name to tensor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamStore {
    tensors: BTreeMap<String, Tensor>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic weights for every layer of `config`.
    pub fn seeded(config: &StereoConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        Self::seeded_from_specs(&model_conv_specs(config), seed)
    }

    /// Uniform `±1/sqrt(fan_in)` weights and biases, the default convolution
    /// initialisation of the training framework the checkpoints come from.
    pub fn seeded_from_specs(specs: &[ConvSpec], seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut store = Self::new();
        for spec in specs {
            let bound = 1.0 / (spec.fan_in().max(1) as f32).sqrt();
            let shape = spec.weight_shape();
            let weight: Vec<f32> = (0..shape.len()).map(|_| rng.gen_range(-bound..bound)).collect();
            let bias: Vec<f32> = (0..spec.out_channels)
                .map(|_| rng.gen_range(-bound..bound))
                .collect();
            store.insert(spec.weight_key(), Tensor::from_vec(weight, shape)?);
            store.insert(
                spec.bias_key(),
                Tensor::from_vec(bias, TensorShape::new(&[spec.out_channels])?)?,
            );
        }
        debug!("Seeded {} parameter tensors (seed {})", store.len(), seed);
        Ok(store)
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(name.into(), tensor)
    }

    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| Error::MissingParameter(name.to_string()))
    }

    /// Look up `name` and require exactly `len` elements.
    pub fn get_with_len(&self, name: &str, len: usize) -> Result<&Tensor> {
        let tensor = self.get(name)?;
        if tensor.len() != len {
            return Err(Error::DimensionMismatch(format!(
                "Parameter {} has {} elements, expected {}",
                name,
                tensor.len(),
                len
            )));
        }
        Ok(tensor)
    }

    /// Weight and bias of a convolution, shape-checked against `spec`.
    pub fn conv(&self, spec: &ConvSpec) -> Result<(Tensor, Tensor)> {
        let weight = self.get(&spec.weight_key())?;
        if weight.shape() != spec.weight_shape() {
            return Err(Error::DimensionMismatch(format!(
                "Parameter {} has shape {:?}, expected {:?}",
                spec.weight_key(),
                weight.shape(),
                spec.weight_shape()
            )));
        }
        let bias = self
            .get_with_len(&spec.bias_key(), spec.out_channels)?
            .reshape(&[spec.out_channels])?;
        Ok((weight.clone(), bias))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn to_json_string(&self) -> Result<String> {
        let stored: BTreeMap<&str, StoredTensor> = self
            .tensors
            .iter()
            .map(|(k, t)| {
                (
                    k.as_str(),
                    StoredTensor {
                        dims: t.dims().to_vec(),
                        data: t.as_slice().to_vec(),
                    },
                )
            })
            .collect();
        serde_json::to_string(&stored).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let stored: BTreeMap<String, StoredTensor> =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        let mut tensors = BTreeMap::new();
        for (name, t) in stored {
            let shape = TensorShape::new(&t.dims)?;
            tensors.insert(name, Tensor::from_vec(t.data, shape)?);
        }
        Ok(Self { tensors })
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json_string()?)?;
        Ok(())
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }
}

/// Re-pack the correlation-encoder input layer from `from_radius` to a smaller
/// `to_radius`.
///
/// The input channels form `levels` groups of `2·from_radius + 1` taps each;
/// from every group only the `2·to_radius + 1` central taps are kept. All other
/// parameters are copied unchanged.
pub fn repack_correlation_encoder(
    store: &ParamStore,
    levels: usize,
    from_radius: usize,
    to_radius: usize,
) -> Result<ParamStore> {
    if to_radius > from_radius {
        return Err(Error::InvalidParameters(format!(
            "Cannot repack radius {} into larger radius {}",
            from_radius, to_radius
        )));
    }
    let key = format!("{}.weight", CORR_ENCODER_KEY);
    let weight = store.get(&key)?;
    let (out_c, in_c, _, _) = weight.shape().nchw_dims()?;
    let from_taps = 2 * from_radius + 1;
    let to_taps = 2 * to_radius + 1;
    if in_c != levels * from_taps {
        return Err(Error::DimensionMismatch(format!(
            "{} has {} input channels, expected {} levels x {} taps",
            key, in_c, levels, from_taps
        )));
    }

    let offset = from_radius - to_radius;
    let groups = (0..levels)
        .map(|g| weight.narrow(1, g * from_taps + offset, to_taps))
        .collect::<Result<Vec<_>>>()?;
    let refs: Vec<&Tensor> = groups.iter().collect();
    let repacked = Tensor::concat(&refs, 1)?;

    debug!(
        "Repacked {}: {} -> {} input channels ({} output channels)",
        key,
        in_c,
        repacked.dims()[1],
        out_c
    );

    let mut out = store.clone();
    out.insert(key, repacked);
    Ok(out)
}
