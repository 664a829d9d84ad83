//! Iterative stereo disparity refinement
//!
//! This crate provides the refinement core of a recurrent stereo network: a
//! multi-level 1-D correlation pyramid, a multi-resolution ConvGRU cascade,
//! rank-bounded convex upsampling and the controller that runs them for a fixed
//! number of steps.

use image::{GrayImage, RgbImage};

pub mod backbone;
pub mod config;
pub mod corr;
pub mod model;
pub mod nn;
pub mod update;
pub mod upsample;
pub mod weights;

pub use backbone::{Backbone, ContextFeatures, ProjectionBackbone};
pub use config::{CorrImplementation, OutputMode, StereoConfig, MAX_GRU_LAYERS};
pub use corr::CorrelationPyramid;
pub use model::{epipolar_delta, CoordinateField, RaftStereo, StereoPrediction};
pub use update::{CascadeOutput, CascadePass, ContextGates, UpdateCascade, UpdateHead};
pub use upsample::{bilinear_upsample, convex_upsample, normalize_mask};
pub use weights::{model_conv_specs, repack_correlation_encoder, ConvSpec, ParamStore};

pub use cv_core::{Error, Result};

use cv_core::{Tensor, TensorShape};

/// Stereo matching algorithm trait
pub trait StereoMatcher {
    fn compute(&self, left: &RgbImage, right: &RgbImage) -> Result<DisparityMap>;
}

impl<B: Backbone> StereoMatcher for RaftStereo<B> {
    fn compute(&self, left: &RgbImage, right: &RgbImage) -> Result<DisparityMap> {
        let (w, h) = left.dimensions();
        if right.dimensions() != (w, h) {
            return Err(Error::DimensionMismatch(format!(
                "Left image is {}x{}, right image is {}x{}",
                w,
                h,
                right.width(),
                right.height()
            )));
        }
        let image1 = Tensor::from_rgb_pixels(left.as_raw(), w as usize, h as usize)?;
        let image2 = Tensor::from_rgb_pixels(right.as_raw(), w as usize, h as usize)?;
        DisparityMap::from_tensor(&self.forward_export(&image1, &image2)?)
    }
}

/// Disparity map representation
#[derive(Debug, Clone, PartialEq)]
pub struct DisparityMap {
    pub data: Vec<f32>,
    pub width: u32,
    pub height: u32,
}

impl DisparityMap {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            data: vec![0.0; (width * height) as usize],
            width,
            height,
        }
    }

    /// Build from a `[1, 1, H, W]` disparity tensor.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let (b, c, h, w) = cv_imgproc::validate_nchw(tensor)?;
        if b != 1 || c != 1 {
            return Err(Error::DimensionMismatch(format!(
                "Disparity tensor must be [1, 1, H, W], got {:?}",
                tensor.dims()
            )));
        }
        Ok(Self {
            data: tensor.as_slice().to_vec(),
            width: w as u32,
            height: h as u32,
        })
    }

    /// `[1, 1, H, W]`
    pub fn to_tensor(&self) -> Result<Tensor> {
        Tensor::from_vec(
            self.data.clone(),
            TensorShape::nchw(1, 1, self.height as usize, self.width as usize),
        )
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        let idx = (y * self.width + x) as usize;
        self.data.get(idx).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, x: u32, y: u32, value: f32) {
        let idx = (y * self.width + x) as usize;
        if let Some(cell) = self.data.get_mut(idx) {
            *cell = value;
        }
    }

    pub fn is_valid(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height
    }

    /// Map back to a `width × height` display resolution: bilinear resize, then
    /// scale values by `width / self.width` so they stay in display pixels.
    pub fn rescale_to(&self, width: u32, height: u32) -> Result<Self> {
        let resized = cv_imgproc::resize_bilinear(
            &self.to_tensor()?,
            height as usize,
            width as usize,
            false,
        )?
        .scale(width as f32 / self.width as f32);
        Self::from_tensor(&resized)
    }

    /// Element-wise `|d|`.
    pub fn abs(&self) -> Self {
        Self {
            data: self.data.iter().map(|d| d.abs()).collect(),
            width: self.width,
            height: self.height,
        }
    }

    /// Convert to a grayscale image for visualization
    pub fn to_image(&self) -> GrayImage {
        cv_imgproc::apply_gray(&self.data, self.width, self.height)
            .unwrap_or_else(|| GrayImage::new(self.width, self.height))
    }

    /// Min/max-normalised JET rendering of `|d|`.
    pub fn to_color_image(&self) -> RgbImage {
        cv_imgproc::apply_jet(&self.abs().data, self.width, self.height)
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }
}
