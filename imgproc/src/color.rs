use image::{GrayImage, RgbImage};
use rayon::prelude::*;

/// JET colour for a value in `[0, 1]` (blue → cyan → yellow → red).
#[inline]
pub fn jet(value: f32) -> [u8; 3] {
    let v = if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let channel = |centre: f32| {
        let c = (1.5 - (4.0 * v - centre).abs()).clamp(0.0, 1.0);
        (c * 255.0).round() as u8
    };
    [channel(3.0), channel(2.0), channel(1.0)]
}

/// Min/max normalise `values` to `[0, 1]`. A constant field maps to zeros.
pub fn normalize_min_max(values: &[f32]) -> Vec<f32> {
    let (min, max) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = max - min;
    if !range.is_finite() || range <= f32::EPSILON {
        return vec![0.0; values.len()];
    }
    values.par_iter().map(|&v| (v - min) / range).collect()
}

/// Colour-map a row-major scalar field. Returns `None` when the buffer does
/// not match `width × height`.
pub fn apply_jet(values: &[f32], width: u32, height: u32) -> Option<RgbImage> {
    if values.len() != (width * height) as usize {
        return None;
    }
    let normalized = normalize_min_max(values);
    let mut rgb = vec![0u8; normalized.len() * 3];
    rgb.par_chunks_mut(3)
        .zip(normalized.par_iter())
        .for_each(|(pixel, &v)| pixel.copy_from_slice(&jet(v)));
    RgbImage::from_raw(width, height, rgb)
}

/// Min/max normalise a scalar field into an 8-bit grey image.
pub fn apply_gray(values: &[f32], width: u32, height: u32) -> Option<GrayImage> {
    if values.len() != (width * height) as usize {
        return None;
    }
    let data = normalize_min_max(values)
        .into_iter()
        .map(|v| (v * 255.0).round() as u8)
        .collect();
    GrayImage::from_raw(width, height, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jet_endpoints() {
        assert_eq!(jet(0.0), [0, 0, 128]);
        assert_eq!(jet(1.0), [128, 0, 0]);
        assert_eq!(jet(0.5), [128, 255, 128]);
    }

    #[test]
    fn constant_field_normalizes_to_zero() {
        assert_eq!(normalize_min_max(&[3.0, 3.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn apply_jet_checks_size() {
        assert!(apply_jet(&[0.0; 5], 2, 2).is_none());
        let img = apply_jet(&[0.0, 1.0, 2.0, 3.0], 2, 2).unwrap();
        assert_eq!(img.get_pixel(0, 0).0, [0, 0, 128]);
        assert_eq!(img.get_pixel(1, 1).0, [128, 0, 0]);
    }
}
