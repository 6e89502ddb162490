//! Synthetic line-transect surveys shared by the integration tests
#![allow(dead_code)]

use dsm_rust::prelude::*;
use ndarray::Array1;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Poisson};

pub const WIDTH: f64 = 1.0;

pub struct Survey {
    pub segments: Segments,
    pub detection: DetectionModel,
    pub grid: PredictionGrid,
}

fn hazard_g(x: f64, sigma: f64, shape: f64) -> f64 {
    1.0 - (-(x / sigma).powf(-shape)).exp()
}

fn halfnormal_g(x: f64, sigma: f64) -> f64 {
    (-x * x / (2.0 * sigma * sigma)).exp()
}

/// Rejection sampling of observed distances within the truncation width
pub fn sample_distances<G: Fn(f64) -> f64>(rng: &mut ChaCha8Rng, n: usize, g: G) -> Array1<f64> {
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        let x: f64 = rng.gen::<f64>() * WIDTH;
        if rng.gen::<f64>() < g(x) {
            out.push(x);
        }
    }
    Array1::from_vec(out)
}

/// True density surface
pub fn density(x: f64, y: f64) -> f64 {
    4.0 * (0.8 * (3.0 * x).sin() + 0.6 * y - 0.3).exp()
}

/// Segment centres on a regular lattice covering the unit square
pub fn lattice(side: usize) -> (Array1<f64>, Array1<f64>) {
    let mut xs = Vec::with_capacity(side * side);
    let mut ys = Vec::with_capacity(side * side);
    for i in 0..side {
        for j in 0..side {
            xs.push(i as f64 / (side - 1) as f64);
            ys.push(j as f64 / (side - 1) as f64);
        }
    }
    (Array1::from_vec(xs), Array1::from_vec(ys))
}

/// 10 x 10 prediction grid of unit-area cells over the unit square
pub fn prediction_grid() -> PredictionGrid {
    let mut xs = Vec::with_capacity(100);
    let mut ys = Vec::with_capacity(100);
    for i in 0..10 {
        for j in 0..10 {
            xs.push((i as f64 + 0.5) / 10.0);
            ys.push((j as f64 + 0.5) / 10.0);
        }
    }
    let data = Frame::new()
        .with_column("x", Array1::from_vec(xs)).unwrap()
        .with_column("y", Array1::from_vec(ys)).unwrap();
    PredictionGrid::new(data, Array1::ones(100)).unwrap()
}

fn poisson_counts(rng: &mut ChaCha8Rng, means: &[f64]) -> Array1<f64> {
    means
        .iter()
        .map(|&m| Poisson::new(m).unwrap().sample(rng))
        .collect()
}

/// Hazard-rate detection without covariates; counts on a 12 x 12 lattice
pub fn hazard_rate_survey(seed: u64) -> Survey {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let distances = sample_distances(&mut rng, 250, |x| hazard_g(x, 0.4, 3.0));
    let ddf = DetectionFunction::fit(
        KeyFunction::HazardRate,
        Transect::Line,
        WIDTH,
        distances,
        Frame::new(),
        vec![],
    )
    .unwrap();

    let (x, y) = lattice(12);
    let p = 0.55;
    let means: Vec<f64> = x.iter().zip(y.iter()).map(|(&a, &b)| p * density(a, b)).collect();
    let counts = poisson_counts(&mut rng, &means);
    let data = Frame::new()
        .with_column("x", x).unwrap()
        .with_column("y", y).unwrap();
    let segments = Segments::new(data, Array1::ones(counts.len()), counts).unwrap();

    Survey {
        segments,
        detection: DetectionModel::Single(ddf),
        grid: prediction_grid(),
    }
}

/// Half-normal detection with a continuous (sea state) and a factor
/// (observer) scale covariate; segments carry both covariates.
pub fn covariate_survey(seed: u64) -> Survey {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let sigma = |beaufort: f64, observer: f64| (-0.9 - 0.15 * beaufort + if observer == 2.0 { 0.3 } else { 0.0 }).exp();

    let n_obs = 300;
    let mut distances = Vec::with_capacity(n_obs);
    let mut beaufort = Vec::with_capacity(n_obs);
    let mut observer = Vec::with_capacity(n_obs);
    while distances.len() < n_obs {
        let b = (rng.gen::<f64>() * 4.0).floor();
        let o = if rng.gen::<bool>() { 2.0 } else { 1.0 };
        let s = sigma(b, o);
        let x = rng.gen::<f64>() * WIDTH;
        if rng.gen::<f64>() < halfnormal_g(x, s) {
            distances.push(x);
            beaufort.push(b);
            observer.push(o);
        }
    }
    let observations = Frame::new()
        .with_column("beaufort", Array1::from_vec(beaufort)).unwrap()
        .with_column("observer", Array1::from_vec(observer)).unwrap();
    let ddf = DetectionFunction::fit(
        KeyFunction::HalfNormal,
        Transect::Line,
        WIDTH,
        Array1::from_vec(distances),
        observations,
        vec![
            Covariate::Continuous("beaufort".to_string()),
            Covariate::Factor { name: "observer".to_string(), levels: vec![1.0, 2.0] },
        ],
    )
    .unwrap();

    let (x, y) = lattice(12);
    let n = x.len();
    let seg_beaufort = Array1::from_iter((0..n).map(|i| (i % 4) as f64));
    let seg_observer = Array1::from_iter((0..n).map(|i| if (i / 4) % 2 == 0 { 1.0 } else { 2.0 }));
    let means: Vec<f64> = (0..n)
        .map(|i| {
            let s = sigma(seg_beaufort[i], seg_observer[i]);
            let p = (s * (std::f64::consts::PI / 2.0).sqrt()).min(1.0);
            p * density(x[i], y[i])
        })
        .collect();
    let counts = poisson_counts(&mut rng, &means);
    let data = Frame::new()
        .with_column("x", x).unwrap()
        .with_column("y", y).unwrap()
        .with_column("beaufort", seg_beaufort).unwrap()
        .with_column("observer", seg_observer).unwrap();
    let segments = Segments::new(data, Array1::ones(n), counts).unwrap();

    Survey {
        segments,
        detection: DetectionModel::Single(ddf),
        grid: prediction_grid(),
    }
}

/// Two half-normal strata with different scales
pub fn stratified_survey(seed: u64) -> Survey {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let fit = |rng: &mut ChaCha8Rng, sigma: f64| {
        let d = sample_distances(rng, 150, |x| halfnormal_g(x, sigma));
        DetectionFunction::fit(KeyFunction::HalfNormal, Transect::Line, WIDTH, d, Frame::new(), vec![]).unwrap()
    };
    let first = fit(&mut rng, 0.3);
    let second = fit(&mut rng, 0.6);

    let (x, y) = lattice(12);
    let n = x.len();
    let strata: Vec<usize> = (0..n).map(|i| if x[i] < 0.5 { 0 } else { 1 }).collect();
    let means: Vec<f64> = (0..n)
        .map(|i| {
            let p = if strata[i] == 0 { 0.37 } else { 0.65 };
            p * density(x[i], y[i])
        })
        .collect();
    let counts = poisson_counts(&mut rng, &means);
    let data = Frame::new()
        .with_column("x", x).unwrap()
        .with_column("y", y).unwrap();
    let segments = Segments::new(data, Array1::ones(n), counts)
        .unwrap()
        .with_strata(strata)
        .unwrap();

    Survey {
        segments,
        detection: DetectionModel::Stratified(vec![first, second]),
        grid: prediction_grid(),
    }
}

/// `te(x, y)` spatial model fitted by REML
pub fn fit_spatial(survey: &Survey, family: Family) -> FittedSpatialModel {
    let mut spec = SpatialModel::new(family);
    spec.add_smooth(SmoothTerm::tensor("x", "y", 4, 4).unwrap());
    spec.fit(survey.segments.clone(), survey.detection.clone(), &FitOptions::default())
        .unwrap()
}
