use cv_core::{Tensor, TensorShape};
use cv_stereo::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_tensor(shape: TensorShape, seed: u64, range: f32) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    let data = (0..shape.len()).map(|_| rng.gen_range(-range..range)).collect();
    Tensor::from_vec(data, shape).unwrap()
}

/// Pixel grid shifted left by a per-pixel amount, with some samples pushed
/// outside the valid column range.
fn sample_coords(b: usize, h: usize, w: usize, seed: u64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    let offsets: Vec<f32> = (0..b * h * w).map(|_| rng.gen_range(-6.0..4.0)).collect();
    Tensor::from_fn(TensorShape::nchw(b, 2, h, w), |i| {
        if i[1] == 0 {
            i[3] as f32 + offsets[(i[0] * h + i[2]) * w + i[3]]
        } else {
            i[2] as f32
        }
    })
}

#[test]
fn test_lookup_length_for_every_strategy() {
    let fmap1 = random_tensor(TensorShape::nchw(2, 8, 3, 16), 1, 1.0);
    let fmap2 = random_tensor(TensorShape::nchw(2, 8, 3, 16), 2, 1.0);
    let coords = sample_coords(2, 3, 16, 3);

    for implementation in CorrImplementation::ALL {
        for radius in [0usize, 1, 4] {
            for levels in [1usize, 2, 4] {
                let pyramid =
                    CorrelationPyramid::build(&fmap1, &fmap2, implementation, radius, levels)
                        .unwrap();
                let out = pyramid.lookup(&coords).unwrap();
                assert_eq!(out.dims(), &[2, levels * (2 * radius + 1), 3, 16]);
                assert_eq!(pyramid.channels(), levels * (2 * radius + 1));
                assert!(out.all_finite());
            }
        }
    }
}

#[test]
fn test_correlation_strategies_agree() {
    let fmap1 = random_tensor(TensorShape::nchw(1, 16, 4, 24), 10, 1.0);
    let fmap2 = random_tensor(TensorShape::nchw(1, 16, 4, 24), 11, 1.0);
    let coords = sample_coords(1, 4, 24, 12);

    let reference = CorrelationPyramid::build(&fmap1, &fmap2, CorrImplementation::Reg, 3, 3)
        .unwrap()
        .lookup(&coords)
        .unwrap();

    for implementation in CorrImplementation::ALL {
        let out = CorrelationPyramid::build(&fmap1, &fmap2, implementation, 3, 3)
            .unwrap()
            .lookup(&coords)
            .unwrap();
        let tol = if implementation.is_half_precision() {
            1e-2
        } else {
            1e-4
        };
        for (a, b) in out.as_slice().iter().zip(reference.as_slice()) {
            assert!(
                (a - b).abs() <= tol,
                "{} differs from reg: {} vs {}",
                implementation,
                a,
                b
            );
        }
    }
}

#[test]
fn test_lookup_clamps_out_of_range_columns() {
    let fmap1 = random_tensor(TensorShape::nchw(1, 4, 1, 6), 20, 1.0);
    let fmap2 = random_tensor(TensorShape::nchw(1, 4, 1, 6), 21, 1.0);
    let pyramid = CorrelationPyramid::build(&fmap1, &fmap2, CorrImplementation::Reg, 0, 1).unwrap();

    let far_left = Tensor::from_fn(TensorShape::nchw(1, 2, 1, 6), |i| {
        if i[1] == 0 {
            -100.0
        } else {
            0.0
        }
    });
    let at_zero = Tensor::zeros(TensorShape::nchw(1, 2, 1, 6));
    assert_eq!(
        pyramid.lookup(&far_left).unwrap(),
        pyramid.lookup(&at_zero).unwrap()
    );

    let wrong = Tensor::zeros(TensorShape::nchw(1, 2, 2, 6));
    assert!(pyramid.lookup(&wrong).is_err());
}

#[test]
fn test_strip_lookup_just_below_integer_column() {
    let fmap1 = random_tensor(TensorShape::nchw(1, 8, 1, 16), 30, 1.0);
    let fmap2 = random_tensor(TensorShape::nchw(1, 8, 1, 16), 31, 1.0);
    // (x + 8) - 4 rounds up to 8.0 while x + 4 stays below it.
    let x = 4.0f32 - 2.0f32.powi(-21);
    let coords = Tensor::from_fn(TensorShape::nchw(1, 2, 1, 16), |i| {
        if i[1] == 0 {
            x
        } else {
            0.0
        }
    });

    let reference = CorrelationPyramid::build(&fmap1, &fmap2, CorrImplementation::Reg, 4, 1)
        .unwrap()
        .lookup(&coords)
        .unwrap();
    let strip = CorrelationPyramid::build(&fmap1, &fmap2, CorrImplementation::AltFast, 4, 1)
        .unwrap()
        .lookup(&coords)
        .unwrap();
    assert_eq!(strip.dims(), &[1, 9, 1, 16]);
    for (a, b) in strip.as_slice().iter().zip(reference.as_slice()) {
        assert!((a - b).abs() <= 1e-4, "{} vs {}", a, b);
    }
}

#[test]
fn test_unknown_correlation_key_rejected() {
    assert_eq!(
        "alt_fast".parse::<CorrImplementation>().unwrap(),
        CorrImplementation::AltFast
    );
    assert!(matches!(
        "sparse".parse::<CorrImplementation>(),
        Err(Error::InvalidParameters(_))
    ));
    assert!(StereoConfig::from_json_str(r#"{"corr_implementation": "sparse"}"#).is_err());
}

#[test]
fn test_mask_head_weights_sum_to_one() {
    let config = StereoConfig::default()
        .with_gru_layers(1, 8)
        .with_corr(1, 1)
        .with_n_downsample(2);
    let store = ParamStore::seeded(&config, 31).unwrap();
    let cascade = UpdateCascade::from_store(&config, &store).unwrap();

    let hidden = vec![random_tensor(TensorShape::nchw(1, 8, 3, 5), 32, 1.0)];
    let gates = vec![ContextGates {
        z: random_tensor(TensorShape::nchw(1, 8, 3, 5), 33, 1.0),
        r: random_tensor(TensorShape::nchw(1, 8, 3, 5), 34, 1.0),
        q: random_tensor(TensorShape::nchw(1, 8, 3, 5), 35, 1.0),
    }];
    let corr = random_tensor(TensorShape::nchw(1, 3, 3, 5), 36, 1.0);
    let flow = random_tensor(TensorShape::nchw(1, 2, 3, 5), 37, 2.0);

    let out = cascade
        .step(&hidden, &gates, CascadePass::Full { corr: &corr, flow: &flow })
        .unwrap();
    let mask = out.head.unwrap().mask.unwrap();
    assert_eq!(mask.dims(), &[1, 9 * 16, 3, 5]);

    let sums = normalize_mask(&mask, 4).unwrap().sum_axis(1).unwrap();
    assert_eq!(sums.dims(), &[1, 16, 15]);
    for &s in sums.as_slice() {
        assert!((s - 1.0).abs() < 1e-5);
    }
}

#[test]
fn test_upsample_shape_law_and_constant_field() {
    for (n, d, h, w, factor) in [(1, 2, 3, 4, 2), (2, 1, 5, 3, 4), (1, 2, 4, 6, 8)] {
        let flow = Tensor::full(TensorShape::nchw(n, d, h, w), 0.5f32);
        let mask = random_tensor(TensorShape::nchw(n, 9 * factor * factor, h, w), 40, 3.0);
        let up = convex_upsample(&flow, &mask, factor).unwrap();
        assert_eq!(up.dims(), &[n, d, factor * h, factor * w]);

        // Away from the zero-padded border every neighbourhood is constant.
        for y in factor..factor * (h - 1) {
            for x in factor..factor * (w - 1) {
                let v = up.get(&[n - 1, d - 1, y, x]).unwrap();
                assert!((v - 0.5 * factor as f32).abs() < 1e-4);
            }
        }
    }
}

#[test]
fn test_slow_fast_passes_never_touch_finest_level() {
    let config = StereoConfig::default()
        .with_gru_layers(3, 4)
        .with_corr(1, 1)
        .with_slow_fast_gru(true);
    let store = ParamStore::seeded(&config, 50).unwrap();
    let cascade = UpdateCascade::from_store(&config, &store).unwrap();

    let sizes = [(2, 3), (3, 5), (5, 9)];
    let hidden: Vec<Tensor> = sizes
        .iter()
        .enumerate()
        .map(|(i, &(h, w))| random_tensor(TensorShape::nchw(1, 4, h, w), 51 + i as u64, 0.5))
        .collect();
    let gates: Vec<ContextGates> = hidden
        .iter()
        .map(|h| ContextGates {
            z: h.clone(),
            r: h.scale(2.0),
            q: h.scale(-1.0),
        })
        .collect();

    let mut state = hidden.clone();
    for levels in cascade.coarse_schedule(config.slow_fast_gru) {
        state = cascade
            .step(&state, &gates, CascadePass::Coarse { levels })
            .unwrap()
            .hidden;
        assert_eq!(state[2], hidden[2]);
    }
    assert_ne!(state[0], hidden[0]);
    assert_ne!(state[1], hidden[1]);
}

#[test]
fn test_repacked_encoder_matches_central_taps() {
    let config4 = StereoConfig::default().with_gru_layers(1, 8).with_corr(4, 4);
    let config1 = config4.clone().with_corr(4, 1);
    let store4 = ParamStore::seeded(&config4, 60).unwrap();
    let repacked = repack_correlation_encoder(&store4, 4, 4, 1).unwrap();
    assert_eq!(
        repacked.get("update_block.encoder.convc1.weight").unwrap().dims(),
        &[64, 12, 1, 1]
    );

    let cascade4 = UpdateCascade::from_store(&config4, &store4).unwrap();
    let cascade1 = UpdateCascade::from_store(&config1, &repacked).unwrap();
    // The original layer cannot be built for the smaller radius.
    assert!(UpdateCascade::from_store(&config1, &store4).is_err());

    let corr1 = random_tensor(TensorShape::nchw(1, 12, 3, 4), 61, 1.0);
    // Radius-1 taps placed at the central offsets of each 9-tap group.
    let embedded = Tensor::from_fn(TensorShape::nchw(1, 36, 3, 4), |i| {
        let (group, tap) = (i[1] / 9, i[1] % 9);
        if (3..6).contains(&tap) {
            corr1.get(&[0, group * 3 + tap - 3, i[2], i[3]]).unwrap()
        } else {
            0.0
        }
    });

    let out1 = cascade1.encoder().encode_correlation_input(&corr1).unwrap();
    let out4 = cascade4.encoder().encode_correlation_input(&embedded).unwrap();
    assert_eq!(out1.dims(), out4.dims());
    for (a, b) in out1.as_slice().iter().zip(out4.as_slice()) {
        assert!((a - b).abs() < 1e-4);
    }
}

#[test]
fn test_refinement_keeps_vertical_flow_zero() {
    let config = StereoConfig::default()
        .with_gru_layers(2, 8)
        .with_feature_dim(8)
        .with_corr(2, 2)
        .with_n_downsample(1)
        .with_iters(4)
        .with_output_mode(OutputMode::Sequence)
        .with_corr_implementation(CorrImplementation::AltFast);
    let model = RaftStereo::seeded(config, 70).unwrap();
    let left = random_tensor(TensorShape::nchw(1, 3, 8, 12), 71, 1.0).map(|v| 127.5 + 127.5 * v);
    let right = random_tensor(TensorShape::nchw(1, 3, 8, 12), 72, 1.0).map(|v| 127.5 + 127.5 * v);

    let out = model.forward(&left, &right, None).unwrap();
    assert_eq!(out.disparities.len(), 4);
    assert!(out.disparities.iter().all(|d| d.dims() == &[1, 1, 8, 12]));
    assert!(out.flow.narrow(1, 1, 1).unwrap().as_slice().iter().all(|&v| v == 0.0));
}

#[test]
fn test_bilinear_fallback_without_mask_head() {
    let config = StereoConfig::default()
        .with_gru_layers(1, 8)
        .with_feature_dim(8)
        .with_corr(1, 1)
        .with_n_downsample(2)
        .with_iters(2)
        .with_convex_upsample(false);
    let model = RaftStereo::seeded(config, 80).unwrap();
    let image = Tensor::full(TensorShape::nchw(1, 3, 8, 8), 100.0f32);
    let disparity = model.forward_export(&image, &image).unwrap();
    assert_eq!(disparity.dims(), &[1, 1, 8, 8]);
    assert!(disparity.all_finite());
}

#[test]
fn test_stereo_matcher_on_rgb_images() {
    let config = StereoConfig::default()
        .with_gru_layers(1, 8)
        .with_feature_dim(8)
        .with_corr(2, 1)
        .with_n_downsample(2)
        .with_iters(2);
    let model = RaftStereo::seeded(config, 90).unwrap();
    let left = image::RgbImage::from_fn(16, 8, |x, y| image::Rgb([(x * 16) as u8, (y * 30) as u8, 90]));
    let right = image::RgbImage::from_fn(16, 8, |x, y| {
        image::Rgb([(x * 16 + 32).min(255) as u8, (y * 30) as u8, 90])
    });

    let map = model.compute(&left, &right).unwrap();
    assert_eq!((map.width, map.height), (16, 8));
    assert!(map.data.iter().all(|d| d.is_finite()));

    let display = map.rescale_to(32, 16).unwrap();
    assert_eq!(display.to_color_image().dimensions(), (32, 16));

    let small = image::RgbImage::new(8, 8);
    assert!(model.compute(&left, &small).is_err());
}

#[test]
fn test_config_json_file_roundtrip() {
    let config = StereoConfig::default()
        .with_hidden_dims(vec![64, 96, 128])
        .with_corr_implementation(CorrImplementation::RegCuda)
        .with_slow_fast_gru(true)
        .with_iters(7);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stereo.json");
    std::fs::write(&path, config.to_json_string().unwrap()).unwrap();

    let loaded = StereoConfig::from_json_file(&path).unwrap();
    assert_eq!(loaded, config);
    assert!(std::fs::read_to_string(&path).unwrap().contains("\"reg_cuda\""));

    std::fs::write(&path, r#"{"n_gru_layers": 2}"#).unwrap();
    assert!(matches!(
        StereoConfig::from_json_file(&path),
        Err(Error::InvalidParameters(_))
    ));
}

#[test]
fn test_param_store_file_roundtrip() {
    let config = StereoConfig::default().with_gru_layers(1, 4).with_corr(1, 0);
    let store = ParamStore::seeded(&config, 99).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weights.json");
    store.save_json(&path).unwrap();
    let loaded = ParamStore::load_json(&path).unwrap();
    assert_eq!(loaded, store);
    assert_eq!(loaded.len(), 2 * model_conv_specs(&config).len());
}
