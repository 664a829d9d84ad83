//! Iteration controller: `INIT → REFINE(×iters) → DONE`.

use crate::backbone::{Backbone, ContextFeatures, ProjectionBackbone};
use crate::config::{OutputMode, StereoConfig};
use crate::corr::CorrelationPyramid;
use crate::update::{CascadePass, ContextProjector, UpdateCascade};
use crate::upsample::{bilinear_upsample, convex_upsample};
use crate::weights::ParamStore;
use cv_core::{Error, Result, Tensor, TensorShape};
use tracing::{debug, trace};

/// Rebuild `delta [B, 2, H, W]` from its horizontal channel and a zero channel.
pub fn epipolar_delta(delta: &Tensor) -> Result<Tensor> {
    let horizontal = delta.narrow(1, 0, 1)?;
    let vertical = Tensor::zeros(horizontal.shape());
    Tensor::concat(&[&horizontal, &vertical], 1)
}

/// Reference grid and current estimate, both `[B, 2, H, W]` with channel 0 = x.
///
/// The vertical component of `coords1 - coords0` is zero at all times: every
/// displacement that enters the field goes through [`epipolar_delta`] first.
#[derive(Debug, Clone)]
pub struct CoordinateField {
    coords0: Tensor,
    coords1: Tensor,
}

impl CoordinateField {
    /// Identity pixel grid, `coords1 = coords0`.
    pub fn new(batch: usize, height: usize, width: usize) -> Self {
        let coords0 = Tensor::from_fn(TensorShape::nchw(batch, 2, height, width), |i| {
            if i[1] == 0 {
                i[3] as f32
            } else {
                i[2] as f32
            }
        });
        Self {
            coords1: coords0.clone(),
            coords0,
        }
    }

    /// Offset the estimate by an initial flow field; only its horizontal
    /// channel is used.
    pub fn with_initial_flow(self, flow: &Tensor) -> Result<Self> {
        if flow.shape() != self.coords0.shape() {
            return Err(Error::DimensionMismatch(format!(
                "Initial flow {:?} does not match coordinate grid {:?}",
                flow.shape(),
                self.coords0.shape()
            )));
        }
        self.advance(flow)
    }

    pub fn coords0(&self) -> &Tensor {
        &self.coords0
    }

    pub fn coords1(&self) -> &Tensor {
        &self.coords1
    }

    /// `coords1 - coords0`
    pub fn flow(&self) -> Result<Tensor> {
        self.coords1.sub(&self.coords0)
    }

    /// `coords1 ← coords1 + epipolar_delta(delta)`.
    pub fn advance(self, delta: &Tensor) -> Result<Self> {
        let coords1 = self.coords1.add(&epipolar_delta(delta)?)?;
        Ok(Self {
            coords0: self.coords0,
            coords1,
        })
    }
}

/// Result of one refinement call.
#[derive(Debug, Clone)]
pub struct StereoPrediction {
    /// Final low-resolution flow `coords1 - coords0`, `[B, 2, H/f, W/f]`.
    pub flow: Tensor,
    /// Full-resolution disparities `[B, 1, H, W]`: one per iteration in
    /// sequence mode, only the last one in inference mode.
    pub disparities: Vec<Tensor>,
}

impl StereoPrediction {
    pub fn final_disparity(&self) -> Option<&Tensor> {
        self.disparities.last()
    }
}

/// Multi-level recurrent stereo refinement around a pluggable encoder.
#[derive(Debug, Clone)]
pub struct RaftStereo<B: Backbone = ProjectionBackbone> {
    config: StereoConfig,
    backbone: B,
    context: ContextProjector,
    cascade: UpdateCascade,
}

impl RaftStereo<ProjectionBackbone> {
    /// Deterministically initialised model with the projection encoder.
    pub fn seeded(config: StereoConfig, seed: u64) -> Result<Self> {
        let store = ParamStore::seeded(&config, seed)?;
        let backbone = ProjectionBackbone::seeded(&config, seed.wrapping_add(1))?;
        Self::new(config, backbone, &store)
    }
}

impl<B: Backbone> RaftStereo<B> {
    pub fn new(config: StereoConfig, backbone: B, store: &ParamStore) -> Result<Self> {
        config.validate()?;
        let context = ContextProjector::from_store(&config, store)?;
        let cascade = UpdateCascade::from_store(&config, store)?;
        debug!(
            "RaftStereo: {} GRU levels {:?}, corr {} (levels {}, radius {}), factor {}, {} iterations{}",
            config.n_gru_layers,
            config.hidden_dims,
            config.corr_implementation,
            config.corr_levels,
            config.corr_radius,
            config.downsample_factor(),
            config.iters,
            if config.slow_fast_gru { ", slow-fast" } else { "" }
        );
        Ok(Self {
            config,
            backbone,
            context,
            cascade,
        })
    }

    pub fn config(&self) -> &StereoConfig {
        &self.config
    }

    pub fn backbone(&self) -> &B {
        &self.backbone
    }

    pub fn cascade(&self) -> &UpdateCascade {
        &self.cascade
    }

    /// Estimate disparity for two `[B, 3, H, W]` images with values in [0, 255].
    ///
    /// `flow_init`, if given, is `[B, 2, H/f, W/f]` and offsets the initial
    /// estimate.
    pub fn forward(
        &self,
        image1: &Tensor,
        image2: &Tensor,
        flow_init: Option<&Tensor>,
    ) -> Result<StereoPrediction> {
        self.run(image1, image2, flow_init, self.config.output_mode)
    }

    /// Single-output entry point: `[1, 3, H, W]` pair → `[1, 1, H, W]`
    /// disparity in pixels.
    pub fn forward_export(&self, image1: &Tensor, image2: &Tensor) -> Result<Tensor> {
        let (b, _, _, _) = image1.shape().nchw_dims()?;
        if b != 1 {
            return Err(Error::InvalidInput(format!(
                "Export expects a single image pair, got batch {}",
                b
            )));
        }
        let mut prediction = self.run(image1, image2, None, OutputMode::Inference)?;
        prediction
            .disparities
            .pop()
            .ok_or_else(|| Error::RuntimeError("refinement produced no output".into()))
    }

    fn run(
        &self,
        image1: &Tensor,
        image2: &Tensor,
        flow_init: Option<&Tensor>,
        mode: OutputMode,
    ) -> Result<StereoPrediction> {
        self.check_images(image1, image2)?;
        let image1 = normalize_image(image1);
        let image2 = normalize_image(image2);

        let contexts = self
            .backbone
            .encode_context(&image1, self.config.n_gru_layers)?;
        let (fmap1, fmap2) = self.backbone.encode_features(&image1, &image2)?;
        self.refine_with_mode(&fmap1, &fmap2, &contexts, flow_init, mode)
    }

    /// Refinement from encoder outputs, in the configured output mode.
    pub fn refine(
        &self,
        fmap1: &Tensor,
        fmap2: &Tensor,
        contexts: &[ContextFeatures],
        flow_init: Option<&Tensor>,
    ) -> Result<StereoPrediction> {
        self.refine_with_mode(fmap1, fmap2, contexts, flow_init, self.config.output_mode)
    }

    fn refine_with_mode(
        &self,
        fmap1: &Tensor,
        fmap2: &Tensor,
        contexts: &[ContextFeatures],
        flow_init: Option<&Tensor>,
        mode: OutputMode,
    ) -> Result<StereoPrediction> {
        let config = &self.config;

        // INIT
        let (batch, height, width) = self.check_contexts(fmap1, contexts)?;
        let mut hidden: Vec<Tensor> = contexts.iter().map(|c| c.hidden.tanh()).collect();
        let context_refs: Vec<&Tensor> = contexts.iter().map(|c| &c.context).collect();
        let gates = self.context.project(&context_refs)?;

        let pyramid = CorrelationPyramid::build(
            fmap1,
            fmap2,
            config.corr_implementation,
            config.corr_radius,
            config.corr_levels,
        )?;

        let mut field = CoordinateField::new(batch, height, width);
        if let Some(flow) = flow_init {
            field = field.with_initial_flow(flow)?;
        }
        let coarse_schedule = self.cascade.coarse_schedule(config.slow_fast_gru);
        debug!(
            "Refinement INIT: batch {}, grid {}x{}, {} coarse passes per step, {:?} output",
            batch,
            height,
            width,
            coarse_schedule.len(),
            mode
        );

        // REFINE
        let mut disparities = Vec::new();
        for itr in 0..config.iters {
            let corr = pyramid.lookup(field.coords1())?;
            let flow = field.flow()?;

            for &levels in &coarse_schedule {
                hidden = self
                    .cascade
                    .step(&hidden, &gates, CascadePass::Coarse { levels })?
                    .hidden;
            }
            let out = self.cascade.step(
                &hidden,
                &gates,
                CascadePass::Full {
                    corr: &corr,
                    flow: &flow,
                },
            )?;
            hidden = out.hidden;
            let head = out
                .head
                .ok_or_else(|| Error::RuntimeError("full cascade pass emitted no head".into()))?;

            field = field.advance(&head.delta)?;
            trace!(
                "Refinement step {}/{}: max |delta| {:.4}",
                itr + 1,
                config.iters,
                head.delta.narrow(1, 0, 1)?.max_abs()
            );

            if mode == OutputMode::Inference && itr + 1 < config.iters {
                continue;
            }
            disparities.push(self.upsample(&field.flow()?, head.mask.as_ref())?);
        }

        // DONE
        Ok(StereoPrediction {
            flow: field.flow()?,
            disparities,
        })
    }

    /// Full-resolution horizontal channel of `flow`.
    fn upsample(&self, flow: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let factor = self.config.downsample_factor();
        let up = match mask {
            Some(mask) => convex_upsample(flow, mask, factor)?,
            None => bilinear_upsample(flow, factor)?,
        };
        up.narrow(1, 0, 1)
    }

    fn check_images(&self, image1: &Tensor, image2: &Tensor) -> Result<()> {
        let (_, c, h, w) = cv_imgproc::validate_nchw(image1)?;
        if image1.shape() != image2.shape() {
            return Err(Error::DimensionMismatch(format!(
                "Left and right images differ in shape: {:?} vs {:?}",
                image1.shape(),
                image2.shape()
            )));
        }
        if c != 3 {
            return Err(Error::InvalidInput(format!(
                "Expected 3-channel images, got {}",
                c
            )));
        }
        let factor = self.config.downsample_factor();
        if h % factor != 0 || w % factor != 0 {
            return Err(Error::InvalidInput(format!(
                "Image size {}x{} is not divisible by the downsample factor {}",
                h, w, factor
            )));
        }
        Ok(())
    }

    /// Validate encoder outputs against the configuration; returns the
    /// finest grid `(batch, height, width)`.
    fn check_contexts(
        &self,
        fmap1: &Tensor,
        contexts: &[ContextFeatures],
    ) -> Result<(usize, usize, usize)> {
        let config = &self.config;
        if contexts.len() != config.n_gru_layers {
            return Err(Error::InvalidParameters(format!(
                "Encoder returned {} context levels, configuration has {}",
                contexts.len(),
                config.n_gru_layers
            )));
        }
        let (batch, _, height, width) = cv_imgproc::validate_nchw(fmap1)?;

        let mut expected = (height, width);
        for (level, ctx) in contexts.iter().enumerate().rev() {
            let dim = config.hidden_dims[level];
            let want = TensorShape::nchw(batch, dim, expected.0, expected.1);
            if ctx.hidden.shape() != want || ctx.context.shape() != want {
                return Err(Error::DimensionMismatch(format!(
                    "Context level {} is {:?}/{:?}, expected {:?}",
                    level,
                    ctx.hidden.shape(),
                    ctx.context.shape(),
                    want
                )));
            }
            expected = ((expected.0 + 1) / 2, (expected.1 + 1) / 2);
        }
        Ok((batch, height, width))
    }
}

/// `[0, 255]` → `[-1, 1]`
fn normalize_image(image: &Tensor) -> Tensor {
    image.map(|v| 2.0 * (v / 255.0) - 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> StereoConfig {
        StereoConfig::default()
            .with_gru_layers(2, 8)
            .with_feature_dim(8)
            .with_corr(2, 2)
            .with_n_downsample(1)
            .with_iters(3)
    }

    fn ramp(h: usize, w: usize, shift: usize) -> Tensor {
        Tensor::from_fn(TensorShape::nchw(1, 3, h, w), |i| {
            (((i[3] + shift) * 13 + i[2] * 7 + i[1] * 5) % 256) as f32
        })
    }

    #[test]
    fn test_epipolar_delta_zeroes_vertical() {
        let delta = Tensor::from_fn(TensorShape::nchw(1, 2, 2, 3), |i| i[1] as f32 + 0.5);
        let fixed = epipolar_delta(&delta).unwrap();
        assert_eq!(fixed.narrow(1, 1, 1).unwrap().max_abs(), 0.0);
        assert_eq!(fixed.narrow(1, 0, 1).unwrap(), delta.narrow(1, 0, 1).unwrap());
    }

    #[test]
    fn test_coordinate_field_keeps_vertical_fixed() {
        let field = CoordinateField::new(1, 3, 4);
        assert_eq!(field.coords0().get(&[0, 0, 1, 2]).unwrap(), 2.0);
        assert_eq!(field.coords0().get(&[0, 1, 1, 2]).unwrap(), 1.0);

        let delta = Tensor::full(TensorShape::nchw(1, 2, 3, 4), 0.75f32);
        let field = field.advance(&delta).unwrap().advance(&delta).unwrap();
        let flow = field.flow().unwrap();
        assert!(flow.narrow(1, 1, 1).unwrap().as_slice().iter().all(|&v| v == 0.0));
        assert!(flow.narrow(1, 0, 1).unwrap().as_slice().iter().all(|&v| v == 1.5));

        let wrong = Tensor::zeros(TensorShape::nchw(1, 2, 3, 5));
        assert!(CoordinateField::new(1, 3, 4).with_initial_flow(&wrong).is_err());
    }

    #[test]
    fn test_output_count_per_mode() {
        let config = tiny_config();
        let (left, right) = (ramp(8, 16, 0), ramp(8, 16, 2));

        let model = RaftStereo::seeded(config.clone(), 4).unwrap();
        let single = model.forward(&left, &right, None).unwrap();
        assert_eq!(single.disparities.len(), 1);
        assert_eq!(single.final_disparity().unwrap().dims(), &[1, 1, 8, 16]);
        assert_eq!(single.flow.dims(), &[1, 2, 4, 8]);

        let model = RaftStereo::seeded(config.with_output_mode(OutputMode::Sequence), 4).unwrap();
        let sequence = model.forward(&left, &right, None).unwrap();
        assert_eq!(sequence.disparities.len(), 3);
        // The last map of a sequence run is the inference-mode output.
        assert_eq!(sequence.disparities[2], single.disparities[0]);
    }

    #[test]
    fn test_image_checks() {
        let model = RaftStereo::seeded(tiny_config(), 0).unwrap();
        let left = ramp(8, 16, 0);
        assert!(matches!(
            model.forward(&left, &ramp(8, 14, 0), None),
            Err(Error::DimensionMismatch(_))
        ));
        let odd = ramp(7, 16, 0);
        assert!(model.forward(&odd, &odd, None).is_err());
    }

    #[test]
    fn test_initial_flow_vertical_is_ignored() {
        let model = RaftStereo::seeded(tiny_config().with_iters(1), 8).unwrap();
        let (left, right) = (ramp(8, 16, 0), ramp(8, 16, 1));
        let init = Tensor::from_fn(TensorShape::nchw(1, 2, 4, 8), |i| {
            if i[1] == 0 {
                -1.0
            } else {
                3.0
            }
        });
        let out = model.forward(&left, &right, Some(&init)).unwrap();
        assert!(out.flow.narrow(1, 1, 1).unwrap().as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_forward_export_matches_forward() {
        let model = RaftStereo::seeded(tiny_config(), 12).unwrap();
        let (left, right) = (ramp(8, 16, 0), ramp(8, 16, 3));
        let exported = model.forward_export(&left, &right).unwrap();
        let forward = model.forward(&left, &right, None).unwrap();
        assert_eq!(&exported, forward.final_disparity().unwrap());
    }
}
