use cv_core::{Tensor, TensorShape};
use cv_imgproc::*;

fn ramp(dims: (usize, usize, usize, usize), scale: f32) -> Tensor {
    Tensor::from_fn(TensorShape::nchw(dims.0, dims.1, dims.2, dims.3), |i| {
        ((i[0] * 7 + i[1] * 5 + i[2] * 3 + i[3]) % 11) as f32 * scale - 1.0
    })
}

fn naive_conv(input: &Tensor, weight: &Tensor, bias: &Tensor, pad: usize) -> Vec<f32> {
    let (n, c, h, w) = input.shape().nchw_dims().unwrap();
    let (o, _, kh, kw) = weight.shape().nchw_dims().unwrap();
    let ho = h + 2 * pad - kh + 1;
    let wo = w + 2 * pad - kw + 1;
    let mut out = Vec::new();
    for b in 0..n {
        for oc in 0..o {
            for y in 0..ho {
                for x in 0..wo {
                    let mut acc = bias.as_slice()[oc];
                    for ic in 0..c {
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let sy = y as isize + ky as isize - pad as isize;
                                let sx = x as isize + kx as isize - pad as isize;
                                if sy < 0 || sx < 0 || sy >= h as isize || sx >= w as isize {
                                    continue;
                                }
                                acc += input
                                    .get(&[b, ic, sy as usize, sx as usize])
                                    .unwrap()
                                    * weight.get(&[oc, ic, ky, kx]).unwrap();
                            }
                        }
                    }
                    out.push(acc);
                }
            }
        }
    }
    out
}

#[test]
fn test_conv2d_matches_reference() {
    for &(k, pad) in &[(1usize, 0usize), (3, 1), (7, 3)] {
        let input = ramp((2, 3, 9, 13), 0.25);
        let weight = ramp((4, 3, k, k), 0.1);
        let bias = Tensor::from_vec(vec![0.5, -0.5, 0.0, 1.0], TensorShape::new(&[4]).unwrap())
            .unwrap();

        let out = conv2d(&input, &weight, Some(&bias), pad).unwrap();
        let expected = naive_conv(&input, &weight, &bias, pad);
        assert_eq!(out.len(), expected.len());
        for (a, b) in out.as_slice().iter().zip(&expected) {
            assert!((a - b).abs() < 1e-4, "kernel {}: {} vs {}", k, a, b);
        }
    }
}

#[test]
fn test_pool2x_chain_matches_pyramid_sizes() {
    let mut t = Tensor::zeros(TensorShape::nchw(1, 4, 40, 90));
    let mut sizes = Vec::new();
    for _ in 0..2 {
        t = pool2x(&t).unwrap();
        sizes.push(t.shape().hw().unwrap());
    }
    assert_eq!(sizes, vec![(20, 45), (10, 23)]);
}

#[test]
fn test_resize_then_colormap() {
    let field = ramp((1, 1, 4, 6), 1.0);
    let up = resize_bilinear(&field, 8, 12, false).unwrap();
    let img = apply_jet(up.as_slice(), 12, 8).unwrap();
    assert_eq!(img.dimensions(), (12, 8));
    let gray = apply_gray(up.as_slice(), 12, 8).unwrap();
    assert!(gray.pixels().any(|p| p[0] == 255));
    assert!(gray.pixels().any(|p| p[0] == 0));
}

#[test]
fn test_validate_nchw_rejects_empty_axes() {
    let ok = Tensor::zeros(TensorShape::nchw(1, 1, 2, 2));
    assert!(validate_nchw(&ok).is_ok());
    let empty = Tensor::zeros(TensorShape::nchw(1, 0, 2, 2));
    assert!(validate_nchw(&empty).is_err());
    let flat = Tensor::zeros(TensorShape::new(&[4]).unwrap());
    assert!(validate_nchw(&flat).is_err());
}
