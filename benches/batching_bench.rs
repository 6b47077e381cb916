use autobatch::{BatchEngine, Tensor, Variable};
use criterion::{criterion_group, criterion_main, Criterion};
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

fn layer_inputs(rng: &mut StdRng, n: usize, ways: usize) -> (ArrayD<f32>, ArrayD<f32>, Vec<ArrayD<f32>>) {
    let w = ArrayD::from_shape_fn(IxDyn(&[n, n]), |_| rng.random_range(-0.5..0.5f32));
    let b = ArrayD::from_shape_fn(IxDyn(&[n]), |_| rng.random_range(-0.5..0.5f32));
    let xs = (0..ways)
        .map(|_| ArrayD::from_shape_fn(IxDyn(&[n]), |_| rng.random_range(-1.0..1.0f32)))
        .collect();
    (w, b, xs)
}

fn build_layer(w: &ArrayD<f32>, b: &ArrayD<f32>, xs: &[ArrayD<f32>]) -> (Variable, Vec<Variable>, Variable) {
    let weight = Variable::parameter(w);
    let bias = Variable::parameter(b);
    let ys: Vec<Variable> = xs
        .iter()
        .map(|x| {
            weight
                .times(&Variable::constant(x))
                .unwrap()
                .add(&bias)
                .unwrap()
                .tanh()
                .unwrap()
        })
        .collect();
    (weight, ys, bias)
}

fn bench_forward(c: &mut Criterion) {
    let _ = env_logger::try_init();
    let mut group = c.benchmark_group("forward");
    let ci_bench = std::env::var("CI_BENCH").is_ok();
    if ci_bench {
        group.measurement_time(std::time::Duration::from_millis(250));
        group.sample_size(10);
        group.warm_up_time(std::time::Duration::from_millis(50));
    } else {
        group.measurement_time(std::time::Duration::from_secs(2));
        group.sample_size(50);
        group.warm_up_time(std::time::Duration::from_millis(200));
    }

    for &ways in [8usize, 32, 128].iter() {
        let mut rng = StdRng::seed_from_u64(42);
        let (w, b, xs) = layer_inputs(&mut rng, 64, ways);

        // one root over all samples: the engine discovers the batch
        group.bench_function(format!("batched_{}x64", ways), |bencher| {
            bencher.iter(|| {
                let (_, ys, _) = build_layer(&w, &b, &xs);
                let root = Variable::splice(&ys).unwrap().sum().unwrap();
                let mut engine = BatchEngine::new();
                std::hint::black_box(engine.value(&root).unwrap());
            })
        });

        // evaluating sample by sample leaves nothing to batch
        group.bench_function(format!("unbatched_{}x64", ways), |bencher| {
            bencher.iter(|| {
                let (_, ys, _) = build_layer(&w, &b, &xs);
                for y in ys.iter() {
                    let mut engine = BatchEngine::new();
                    std::hint::black_box(engine.value(y).unwrap());
                }
            })
        });
    }

    group.finish();
}

fn bench_backward(c: &mut Criterion) {
    let _ = env_logger::try_init();
    let mut group = c.benchmark_group("backward");
    let ci_bench = std::env::var("CI_BENCH").is_ok();
    if ci_bench {
        group.measurement_time(std::time::Duration::from_millis(250));
        group.sample_size(10);
        group.warm_up_time(std::time::Duration::from_millis(50));
    } else {
        group.measurement_time(std::time::Duration::from_secs(2));
        group.sample_size(50);
        group.warm_up_time(std::time::Duration::from_millis(200));
    }

    let mut rng = StdRng::seed_from_u64(42);
    let (w, b, xs) = layer_inputs(&mut rng, 64, 32);

    group.bench_function("layer_32x64_forward_backward", |bencher| {
        bencher.iter(|| {
            let (weight, ys, bias) = build_layer(&w, &b, &xs);
            let root = Variable::splice(&ys).unwrap().sum().unwrap();
            let mut engine = BatchEngine::new();
            let mut grads: HashMap<Variable, Option<Tensor>> = HashMap::new();
            grads.insert(weight, None);
            grads.insert(bias, None);
            engine.backward(&root, &mut grads).unwrap();
            std::hint::black_box(())
        })
    });

    group.finish();
}

criterion_group!(benches, bench_forward, bench_backward);
criterion_main!(benches);
