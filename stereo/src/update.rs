//! Multi-level convolutional GRU cascade.
//!
//! Recurrence levels are indexed coarse-to-fine: level 0 is the coarsest and
//! the last level is the one fed by the motion encoder and read by the heads.
//! Each level sees its finer neighbour through `pool2x` and its coarser
//! neighbour through an align-corners bilinear resize.

use crate::config::StereoConfig;
use crate::nn::Conv2d;
use crate::weights::{ConvSpec, ParamStore, CORR_ENCODER_KEY};
use cv_core::{Error, Result, Tensor};
use cv_imgproc::{pool2x, resize_bilinear};

/// Channels produced by the motion encoder (126 learned + the 2 flow channels).
pub const MOTION_DIM: usize = 128;
const CORR_DIM: usize = 64;
const FLOW_DIM: usize = 64;
const HEAD_DIM: usize = 256;
const MASK_SCALE: f32 = 0.25;

const LEVEL_NAMES: [&str; 3] = ["gru08", "gru16", "gru32"];

/// Checkpoint name of coarse-to-fine `level` in an `levels`-deep cascade.
fn level_name(levels: usize, level: usize) -> &'static str {
    LEVEL_NAMES[levels.saturating_sub(level + 1).min(LEVEL_NAMES.len() - 1)]
}

/// Checkpoint index (finest = 0) of coarse-to-fine `level`.
fn checkpoint_index(levels: usize, level: usize) -> usize {
    levels.saturating_sub(level + 1)
}

/// Input channels the GRU at `level` receives besides its own hidden state.
pub fn gru_input_dim(config: &StereoConfig, level: usize) -> usize {
    let n = config.n_gru_layers;
    let dims = &config.hidden_dims;
    let mut dim = 0;
    if level + 1 == n {
        dim += MOTION_DIM;
    }
    if level + 1 < n {
        dim += dims[level + 1];
    }
    if level > 0 {
        dim += dims[level - 1];
    }
    dim
}

/// Per-level gate biases derived once from the context features.
#[derive(Debug, Clone)]
pub struct ContextGates {
    pub z: Tensor,
    pub r: Tensor,
    pub q: Tensor,
}

/// `relu` then a 3×3 convolution to `3·hidden` channels, split into `(z, r, q)`.
#[derive(Debug, Clone)]
pub struct ContextProjector {
    convs: Vec<Conv2d>,
}

impl ContextProjector {
    pub fn conv_specs(config: &StereoConfig) -> Vec<ConvSpec> {
        let n = config.n_gru_layers;
        config
            .hidden_dims
            .iter()
            .enumerate()
            .map(|(level, &hidden)| {
                ConvSpec::new(
                    format!("context_zqr_convs.{}", checkpoint_index(n, level)),
                    hidden,
                    3 * hidden,
                    3,
                )
            })
            .collect()
    }

    pub fn from_store(config: &StereoConfig, store: &ParamStore) -> Result<Self> {
        let convs = Self::conv_specs(config)
            .iter()
            .map(|spec| Conv2d::from_store(store, spec))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { convs })
    }

    /// One gate triple per level, `contexts` ordered coarse-to-fine.
    pub fn project(&self, contexts: &[&Tensor]) -> Result<Vec<ContextGates>> {
        if contexts.len() != self.convs.len() {
            return Err(Error::DimensionMismatch(format!(
                "Expected {} context tensors, got {}",
                self.convs.len(),
                contexts.len()
            )));
        }
        contexts
            .iter()
            .zip(&self.convs)
            .map(|(context, conv)| {
                let gates = conv.forward(&context.relu())?;
                let mut parts = gates.chunk(3, 1)?.into_iter();
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(z), Some(r), Some(q)) => Ok(ContextGates { z, r, q }),
                    _ => Err(Error::RuntimeError("context split yielded too few parts".into())),
                }
            })
            .collect()
    }
}

/// Convolutional GRU with 3×3 gates.
#[derive(Debug, Clone)]
pub struct ConvGru {
    convz: Conv2d,
    convr: Conv2d,
    convq: Conv2d,
}

impl ConvGru {
    fn conv_specs(prefix: &str, hidden: usize, input: usize) -> Vec<ConvSpec> {
        ["convz", "convr", "convq"]
            .iter()
            .map(|gate| ConvSpec::new(format!("{}.{}", prefix, gate), hidden + input, hidden, 3))
            .collect()
    }

    fn from_store(store: &ParamStore, prefix: &str, hidden: usize, input: usize) -> Result<Self> {
        let specs = Self::conv_specs(prefix, hidden, input);
        Ok(Self {
            convz: Conv2d::from_store(store, &specs[0])?,
            convr: Conv2d::from_store(store, &specs[1])?,
            convq: Conv2d::from_store(store, &specs[2])?,
        })
    }

    /// `h' = (1 - z)·h + z·q` with
    /// `z = σ(Wz[h, x] + cz)`, `r = σ(Wr[h, x] + cr)`, `q = tanh(Wq[r·h, x] + cq)`.
    pub fn forward(&self, h: &Tensor, gates: &ContextGates, inputs: &[&Tensor]) -> Result<Tensor> {
        let x = Tensor::concat(inputs, 1)?;
        let hx = Tensor::concat(&[h, &x], 1)?;

        let z = self.convz.forward(&hx)?.add(&gates.z)?.sigmoid();
        let r = self.convr.forward(&hx)?.add(&gates.r)?.sigmoid();
        let rhx = Tensor::concat(&[&r.mul(h)?, &x], 1)?;
        let q = self.convq.forward(&rhx)?.add(&gates.q)?.tanh();

        h.add(&z.mul(&q.sub(h)?)?)
    }
}

/// Encodes the correlation lookup and current flow into motion features.
#[derive(Debug, Clone)]
pub struct MotionEncoder {
    convc1: Conv2d,
    convc2: Conv2d,
    convf1: Conv2d,
    convf2: Conv2d,
    conv: Conv2d,
}

impl MotionEncoder {
    fn conv_specs(config: &StereoConfig) -> Vec<ConvSpec> {
        let prefix = "update_block.encoder";
        vec![
            ConvSpec::new(CORR_ENCODER_KEY, config.corr_channels(), CORR_DIM, 1),
            ConvSpec::new(format!("{}.convc2", prefix), CORR_DIM, CORR_DIM, 3),
            ConvSpec::new(format!("{}.convf1", prefix), 2, FLOW_DIM, 7),
            ConvSpec::new(format!("{}.convf2", prefix), FLOW_DIM, FLOW_DIM, 3),
            ConvSpec::new(format!("{}.conv", prefix), CORR_DIM + FLOW_DIM, MOTION_DIM - 2, 3),
        ]
    }

    fn from_store(config: &StereoConfig, store: &ParamStore) -> Result<Self> {
        let specs = Self::conv_specs(config);
        Ok(Self {
            convc1: Conv2d::from_store(store, &specs[0])?,
            convc2: Conv2d::from_store(store, &specs[1])?,
            convf1: Conv2d::from_store(store, &specs[2])?,
            convf2: Conv2d::from_store(store, &specs[3])?,
            conv: Conv2d::from_store(store, &specs[4])?,
        })
    }

    /// Output of the correlation branch's first layer only.
    pub fn encode_correlation_input(&self, corr: &Tensor) -> Result<Tensor> {
        self.convc1.forward(corr)
    }

    /// `[relu(conv([c, f])), flow]`, `MOTION_DIM` channels.
    pub fn forward(&self, flow: &Tensor, corr: &Tensor) -> Result<Tensor> {
        let cor = self.convc2.forward_relu(&self.convc1.forward_relu(corr)?)?;
        let flo = self.convf2.forward_relu(&self.convf1.forward_relu(flow)?)?;
        let out = self.conv.forward_relu(&Tensor::concat(&[&cor, &flo], 1)?)?;
        Tensor::concat(&[&out, flow], 1)
    }
}

/// Two convolutions with a `relu` between them.
#[derive(Debug, Clone)]
struct Head {
    conv1: Conv2d,
    conv2: Conv2d,
    scale: f32,
}

impl Head {
    fn forward(&self, h: &Tensor) -> Result<Tensor> {
        let out = self.conv2.forward(&self.conv1.forward_relu(h)?)?;
        Ok(if self.scale == 1.0 {
            out
        } else {
            out.scale(self.scale)
        })
    }
}

/// Which levels a cascade step touches.
#[derive(Debug, Clone, Copy)]
pub enum CascadePass<'a> {
    /// Update only the `levels` coarsest levels; no head output.
    Coarse { levels: usize },
    /// Update every level, feeding motion features to the finest, and emit the head.
    Full { corr: &'a Tensor, flow: &'a Tensor },
}

/// Head output of a full pass.
#[derive(Debug, Clone)]
pub struct UpdateHead {
    /// Upsampling mask logits `[B, 9·f², H, W]`; absent without a mask head.
    pub mask: Option<Tensor>,
    /// Raw flow increment `[B, 2, H, W]`.
    pub delta: Tensor,
}

#[derive(Debug, Clone)]
pub struct CascadeOutput {
    pub hidden: Vec<Tensor>,
    pub head: Option<UpdateHead>,
}

/// The recurrent update block: one GRU per level plus the encoder and heads.
#[derive(Debug, Clone)]
pub struct UpdateCascade {
    grus: Vec<ConvGru>,
    encoder: MotionEncoder,
    flow_head: Head,
    mask_head: Option<Head>,
}

impl UpdateCascade {
    pub fn conv_specs(config: &StereoConfig) -> Vec<ConvSpec> {
        let n = config.n_gru_layers;
        let mut specs = MotionEncoder::conv_specs(config);
        for (level, &hidden) in config.hidden_dims.iter().enumerate() {
            let prefix = format!("update_block.{}", level_name(n, level));
            specs.extend(ConvGru::conv_specs(
                &prefix,
                hidden,
                gru_input_dim(config, level),
            ));
        }

        let fine = config.finest_hidden_dim();
        specs.push(ConvSpec::new("update_block.flow_head.conv1", fine, HEAD_DIM, 3));
        specs.push(ConvSpec::new("update_block.flow_head.conv2", HEAD_DIM, 2, 3));
        if config.convex_upsample {
            let f = config.downsample_factor();
            specs.push(ConvSpec::new("update_block.mask.0", fine, HEAD_DIM, 3));
            specs.push(ConvSpec::new("update_block.mask.2", HEAD_DIM, 9 * f * f, 1));
        }
        specs
    }

    pub fn from_store(config: &StereoConfig, store: &ParamStore) -> Result<Self> {
        config.validate()?;
        let n = config.n_gru_layers;
        let grus = config
            .hidden_dims
            .iter()
            .enumerate()
            .map(|(level, &hidden)| {
                let prefix = format!("update_block.{}", level_name(n, level));
                ConvGru::from_store(store, &prefix, hidden, gru_input_dim(config, level))
            })
            .collect::<Result<Vec<_>>>()?;

        let fine = config.finest_hidden_dim();
        let flow_head = Head {
            conv1: Conv2d::from_store(
                store,
                &ConvSpec::new("update_block.flow_head.conv1", fine, HEAD_DIM, 3),
            )?,
            conv2: Conv2d::from_store(
                store,
                &ConvSpec::new("update_block.flow_head.conv2", HEAD_DIM, 2, 3),
            )?,
            scale: 1.0,
        };
        let mask_head = if config.convex_upsample {
            let f = config.downsample_factor();
            Some(Head {
                conv1: Conv2d::from_store(
                    store,
                    &ConvSpec::new("update_block.mask.0", fine, HEAD_DIM, 3),
                )?,
                conv2: Conv2d::from_store(
                    store,
                    &ConvSpec::new("update_block.mask.2", HEAD_DIM, 9 * f * f, 1),
                )?,
                scale: MASK_SCALE,
            })
        } else {
            None
        };

        Ok(Self {
            grus,
            encoder: MotionEncoder::from_store(config, store)?,
            flow_head,
            mask_head,
        })
    }

    pub fn num_levels(&self) -> usize {
        self.grus.len()
    }

    pub fn encoder(&self) -> &MotionEncoder {
        &self.encoder
    }

    /// Head-less passes run before the full pass under the slow-fast schedule:
    /// the coarsest level alone, then the two coarsest, and so on.
    pub fn coarse_schedule(&self, slow_fast: bool) -> Vec<usize> {
        if slow_fast {
            (1..self.num_levels()).collect()
        } else {
            Vec::new()
        }
    }

    /// Advance the active levels, coarsest first. Levels outside the pass keep
    /// their previous state.
    pub fn step(
        &self,
        hidden: &[Tensor],
        gates: &[ContextGates],
        pass: CascadePass<'_>,
    ) -> Result<CascadeOutput> {
        let n = self.num_levels();
        if hidden.len() != n || gates.len() != n {
            return Err(Error::DimensionMismatch(format!(
                "Cascade has {} levels, got {} hidden states and {} gate sets",
                n,
                hidden.len(),
                gates.len()
            )));
        }
        let active = match pass {
            CascadePass::Coarse { levels } if levels == 0 || levels >= n => {
                return Err(Error::InvalidParameters(format!(
                    "A coarse pass must touch 1..{} levels, got {}",
                    n, levels
                )));
            }
            CascadePass::Coarse { levels } => levels,
            CascadePass::Full { .. } => n,
        };

        let mut next = hidden.to_vec();
        for level in 0..active {
            let mut inputs = Vec::with_capacity(3);
            if level + 1 == n {
                if let CascadePass::Full { corr, flow } = pass {
                    inputs.push(self.encoder.forward(flow, corr)?);
                }
            }
            if level + 1 < n {
                inputs.push(pool2x(&next[level + 1])?);
            }
            if level > 0 {
                let (h, w) = next[level].shape().hw()?;
                inputs.push(resize_bilinear(&next[level - 1], h, w, true)?);
            }
            let refs: Vec<&Tensor> = inputs.iter().collect();
            next[level] = self.grus[level].forward(&next[level], &gates[level], &refs)?;
        }

        let head = match pass {
            CascadePass::Coarse { .. } => None,
            CascadePass::Full { .. } => {
                let fine = &next[n - 1];
                let mask = match &self.mask_head {
                    Some(head) => Some(head.forward(fine)?),
                    None => None,
                };
                Some(UpdateHead {
                    mask,
                    delta: self.flow_head.forward(fine)?,
                })
            }
        };

        Ok(CascadeOutput { hidden: next, head })
    }
}
