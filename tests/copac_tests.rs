use ::copac::{copac, Copac, CopacConfig, CopacError, Metric, NeighborAlgorithm, NOISE};
use ndarray::{Array2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn uniform_data(n_samples: usize, n_features: usize, seed: u64) -> Array2<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    Array2::from_shape_fn((n_samples, n_features), |_| rng.gen_range(0.0..1.0))
}

/// 50 points along the x-axis followed by 50 along the y-axis, both over [-2, 2], with a little
/// jitter orthogonal to the line.
fn two_crossing_lines(seed: u64) -> (Array2<f64>, Vec<f64>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let ts: Vec<f64> = (0..50).map(|i| -2.0 + 4.0 * i as f64 / 49.0).collect();
    let mut data = Array2::<f64>::zeros((100, 2));
    for (i, &t) in ts.iter().enumerate() {
        data[[i, 0]] = t;
        data[[i, 1]] = rng.gen_range(-0.005..0.005);
        data[[50 + i, 0]] = rng.gen_range(-0.005..0.005);
        data[[50 + i, 1]] = t;
    }
    (data, ts)
}

fn crossing_lines_config(scale: f64) -> CopacConfig {
    CopacConfig {
        k: 10,
        mu: 5,
        eps: 0.1 * scale,
        alpha: 0.85,
        ..Default::default()
    }
}

#[test]
fn test_two_crossing_lines_are_separated() {
    for seed in [1, 7, 42, 99, 123] {
        let (data, ts) = two_crossing_lines(seed);
        let output = Copac::new(crossing_lines_config(1.0)).fit(data.view()).unwrap();

        // One cluster per line from the λ = 1 partition, plus the points around the crossing
        // whose neighborhoods mix both lines: they get λ = 2 = d, a zero projector, and share
        // one cluster.
        assert_eq!(output.num_clusters, 3, "seed {}", seed);
        assert_eq!(output.num_noise(), 0, "seed {}", seed);

        let away_from_crossing: Vec<usize> = (0..50).filter(|&i| ts[i].abs() > 0.5).collect();
        let x_label = output.labels[away_from_crossing[0]];
        let y_label = output.labels[50 + away_from_crossing[0]];
        assert_ne!(x_label, y_label);

        let crossing: Vec<usize> = (0..100).filter(|&i| output.correlation_dimensions[i] == 2).collect();
        assert!(!crossing.is_empty(), "seed {}", seed);
        let crossing_label = output.labels[crossing[0]];
        assert!(crossing_label != x_label && crossing_label != y_label);

        for i in 0..100 {
            let label = output.labels[i];
            match output.correlation_dimensions[i] {
                1 if i < 50 => assert_eq!(label, x_label, "seed {}: x-axis point {} (t = {})", seed, i, ts[i]),
                1 => assert_eq!(label, y_label, "seed {}: y-axis point {} (t = {})", seed, i, ts[i - 50]),
                2 => {
                    assert_eq!(label, crossing_label, "seed {}: point {}", seed, i);
                    let norm = data.row(i).dot(&data.row(i)).sqrt();
                    assert!(norm < 0.25, "seed {}: λ = 2 point {} at distance {} from the crossing", seed, i, norm);
                }
                other => panic!("seed {}: point {} has correlation dimension {}", seed, i, other),
            }
        }
        for &i in &away_from_crossing {
            assert_eq!(output.correlation_dimensions[i], 1);
            assert_eq!(output.correlation_dimensions[50 + i], 1);
        }
    }
}

#[test]
fn test_clustering_does_not_depend_on_units() {
    // 2^-43 is about 1.1e-13 and scales every coordinate exactly.
    let scale = 2f64.powi(-43);
    let (data, _) = two_crossing_lines(42);
    let scaled = &data * scale;

    let reference = Copac::new(crossing_lines_config(1.0)).fit(data.view()).unwrap();
    let tiny = Copac::new(crossing_lines_config(scale)).fit(scaled.view()).unwrap();
    assert_eq!(tiny.correlation_dimensions, reference.correlation_dimensions);
    assert_eq!(tiny.labels, reference.labels);
    assert_eq!(tiny.num_clusters, 3);
}

#[test]
fn test_identical_points_form_one_cluster() {
    let data = Array2::<f64>::from_elem((20, 3), -4.25);
    let config = CopacConfig {
        k: 5,
        mu: 3,
        ..Default::default()
    };
    let output = Copac::new(config).fit(data.view()).unwrap();
    assert_eq!(output.labels, vec![0; 20]);
    assert_eq!(output.num_clusters, 1);
    assert!(output.correlation_dimensions.iter().all(|&d| d == 1));
}

#[test]
fn test_uniform_noise_is_mostly_noise() {
    let data = uniform_data(200, 10, 7);
    let config = CopacConfig {
        k: 10,
        mu: 5,
        eps: 0.01,
        ..Default::default()
    };
    let output = Copac::new(config).fit(data.view()).unwrap();
    assert!(
        output.num_noise() as f64 >= 0.9 * 200.0,
        "only {} of 200 points are noise",
        output.num_noise()
    );
}

#[test]
fn test_correlation_dimension_is_monotone_in_alpha() {
    let data = uniform_data(80, 5, 11);
    let dimensions_for = |alpha: f64| {
        let config = CopacConfig {
            k: 12,
            mu: 4,
            alpha,
            ..Default::default()
        };
        Copac::new(config).fit(data.view()).unwrap().correlation_dimensions
    };

    let low = dimensions_for(0.5);
    let mid = dimensions_for(0.75);
    let high = dimensions_for(0.95);
    for i in 0..80 {
        assert!(low[i] <= mid[i] && mid[i] <= high[i], "point {}: {} {} {}", i, low[i], mid[i], high[i]);
    }
}

#[test]
fn test_labels_have_valid_range() {
    let data = uniform_data(150, 3, 3);
    let config = CopacConfig {
        k: 9,
        mu: 4,
        eps: 0.2,
        ..Default::default()
    };
    let output = Copac::new(config).fit(data.view()).unwrap();
    assert_eq!(output.labels.len(), 150);
    let max_label = output.labels.iter().copied().max().unwrap_or(NOISE);
    assert_eq!(max_label + 1, output.num_clusters as i64);
    assert!(output.labels.iter().all(|&l| l >= NOISE));
    for id in 0..output.num_clusters as i64 {
        assert!(output.labels.contains(&id));
    }
}

#[test]
fn test_kd_tree_and_brute_force_agree() {
    let data = uniform_data(300, 3, 19);
    let base = CopacConfig {
        k: 8,
        mu: 4,
        eps: 0.15,
        ..Default::default()
    };
    let brute = Copac::new(CopacConfig {
        algorithm: NeighborAlgorithm::BruteForce,
        ..base.clone()
    })
    .fit(data.view())
    .unwrap();
    let tree = Copac::new(CopacConfig {
        algorithm: NeighborAlgorithm::KdTree,
        ..base.clone()
    })
    .fit(data.view())
    .unwrap();
    let auto = Copac::new(base).fit(data.view()).unwrap();
    assert_eq!(brute, tree);
    assert_eq!(brute, auto);
}

#[test]
fn test_other_metrics_run() {
    let data = uniform_data(60, 3, 23);
    for metric in [
        Metric::Manhattan,
        Metric::Chebyshev,
        Metric::Minkowski { p: 3.0 },
        Metric::Cosine,
    ] {
        let config = CopacConfig {
            k: 8,
            mu: 3,
            eps: 0.2,
            metric,
            ..Default::default()
        };
        let labels = copac(data.view(), &config).unwrap();
        assert_eq!(labels.len(), 60, "{:?}", metric);
    }
}

#[test]
fn test_precomputed_distances() {
    let points = uniform_data(40, 2, 29);
    let distances = Array2::from_shape_fn((40, 40), |(i, j)| {
        let diff = &points.row(i) - &points.row(j);
        diff.dot(&diff).sqrt()
    });
    let config = CopacConfig {
        k: 6,
        mu: 3,
        eps: 0.3,
        metric: Metric::Precomputed,
        ..Default::default()
    };
    let output = Copac::new(config.clone()).fit(distances.view()).unwrap();
    assert_eq!(output.labels.len(), 40);
    assert!(output.correlation_dimensions.iter().all(|&d| (1..=40).contains(&d)));

    let not_square = distances.select(Axis(1), &(0..39).collect::<Vec<_>>());
    assert!(matches!(
        Copac::new(config).fit(not_square.view()),
        Err(CopacError::InputShape(_))
    ));
}

#[test]
fn test_invalid_input_is_rejected() {
    let data = uniform_data(20, 3, 31);

    let mu_above_k = CopacConfig { k: 4, mu: 5, ..Default::default() };
    assert!(matches!(
        copac(data.view(), &mu_above_k),
        Err(CopacError::InvalidParameter { name: "mu", .. })
    ));

    let k_too_large = CopacConfig { k: 20, mu: 5, ..Default::default() };
    assert!(matches!(copac(data.view(), &k_too_large), Err(CopacError::InputShape(_))));

    let mut with_nan = data.clone();
    with_nan[[7, 2]] = f64::NAN;
    assert!(matches!(
        copac(with_nan.view(), &CopacConfig::default()),
        Err(CopacError::NonFiniteInput { row: 7, col: 2 })
    ));

    let cosine_tree = CopacConfig {
        metric: Metric::Cosine,
        algorithm: NeighborAlgorithm::KdTree,
        ..Default::default()
    };
    assert!(matches!(copac(data.view(), &cosine_tree), Err(CopacError::NeighborhoodFailure(_))));
}
