use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use eki_core::{EnsembleKalmanInversion, FreeParameters, InverseProblem};
use eki_types::config::{
    CalibrationConfig, NamedPrior, NoiseCovariance, Prior, PseudoStepping, Resampler,
};
use ndarray::{Array1, Array2};
use std::hint::black_box;

const N_PARAMS: usize = 8;
const N_OBS: usize = 64;

type Map = Box<dyn Fn(&Array2<f64>) -> Array2<f64>>;

fn config(pseudo_stepping: Option<PseudoStepping>) -> CalibrationConfig {
    CalibrationConfig {
        parameters: (0..N_PARAMS)
            .map(|i| NamedPrior {
                name: format!("p{i}"),
                prior: Prior::Normal { mean: 0.0, std: 1.0 },
            })
            .collect(),
        ensemble_size: 100,
        pseudo_step: 1.0,
        max_pseudo_step: None,
        process: Default::default(),
        pseudo_stepping,
        resampler: Resampler::default(),
        failure_criterion: Default::default(),
        tikhonov: false,
        noise: NoiseCovariance::Scalar { variance: 0.01 },
        seed: Some(0),
    }
}

fn engine(cfg: &CalibrationConfig) -> EnsembleKalmanInversion<Map> {
    let a = Array2::from_shape_fn((N_OBS, N_PARAMS), |(i, j)| ((i * 3 + j * 5) as f64).sin());
    let y = a.dot(&Array1::from_elem(N_PARAMS, 0.3));
    let map: Map = Box::new(move |x: &Array2<f64>| a.dot(x));
    let params = FreeParameters::new(cfg.parameters.clone()).expect("valid parameters");
    let problem = InverseProblem::new(y, params, map).expect("valid problem");
    EnsembleKalmanInversion::new(problem, cfg).expect("valid engine")
}

fn bench_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("eki_step_64obs_100ens");
    group.sample_size(20);

    for (label, policy) in [
        ("fixed", None),
        (
            "kovachki",
            Some(PseudoStepping::Kovachki2018 {
                initial_step_size: 1.0,
            }),
        ),
        (
            "constant_convergence",
            Some(PseudoStepping::ConstantConvergence {
                convergence_ratio: 0.7,
            }),
        ),
    ] {
        let cfg = config(policy);
        group.bench_function(label, |b| {
            b.iter_batched(
                || engine(&cfg),
                |mut eki| black_box(eki.step()),
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_step);
criterion_main!(benches);
