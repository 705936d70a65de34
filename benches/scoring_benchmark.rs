// ========================================================================================
//
//                     REPURCHASE SCORING AND SEGMENTATION BENCHMARK
//
// ========================================================================================
//
// Measures batch scoring throughput and the cost of the two segmentation trees on a
// random population whose event times follow a proportional-hazards model.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp};
use repurchase::config::PipelineConfig;
use repurchase::pipeline::train;
use repurchase::segment::{fit_buyer_thresholds, fit_client_groups};
use repurchase::types::{CovariateValue, Covariates, Record};

/// Number of buyers the models are trained on.
const TRAINING_SIZE: usize = 5_000;
/// Batch sizes for the scoring benchmark.
const BATCH_SIZES: [usize; 3] = [1_000, 10_000, 50_000];
const CHANNELS: [&str; 3] = ["organic", "paid", "referral"];
const GROUPS: [&str; 3] = ["guest", "loyalty", "newsletter"];

fn random_records(n: usize, seed: u64) -> Vec<Record> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            let channel = rng.gen_range(0..CHANNELS.len());
            let group = rng.gen_range(0..GROUPS.len());
            let quarter = rng.gen_range(1..=4);
            let lag = rng.gen_range(0.0..60.0_f64).floor();
            let rate = 0.004 * [1.0, 2.0, 1.4][channel] * (-0.01 * lag).exp();
            let latent = Exp::new(rate).map_or(365.0, |dist| dist.sample(&mut rng)).ceil() as i64;

            let mut covariates = Covariates::new();
            covariates.insert(
                "acquisition_channel".into(),
                CovariateValue::Level(CHANNELS[channel].into()),
            );
            covariates.insert(
                "acquisition_quarter".into(),
                CovariateValue::Level(format!("2023Q{quarter}")),
            );
            covariates.insert("user_group".into(), CovariateValue::Level(GROUPS[group].into()));
            covariates.insert("reg_to_purchase_days".into(), CovariateValue::Numeric(lag));

            Record {
                customer_id: format!("bench-{seed}-{i}"),
                client_id: format!("client-{}", rng.gen_range(0..40)),
                covariates,
                outcome_time: Some(latent.min(180)),
                event_observed: latent <= 180,
                net_margin_realized: Some(rng.gen_range(5.0..60.0)),
            }
        })
        .collect()
}

fn scoring_benchmark(c: &mut Criterion) {
    let config = PipelineConfig::default();
    let training = random_records(TRAINING_SIZE, 7);
    let Ok(models) = train(&training, &config) else {
        eprintln!("training failed; skipping scoring benchmark");
        return;
    };
    let engine = models.engine();

    let mut group = c.benchmark_group("score_batch");
    for &size in &BATCH_SIZES {
        let batch = random_records(size, size as u64);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &batch, |b, batch| {
            b.iter(|| engine.score_batch(black_box(batch)));
        });
    }
    group.finish();

    let scored = engine.score_batch(&random_records(10_000, 99)).scored;
    let mut group = c.benchmark_group("segmentation");
    group.bench_function("buyer_thresholds", |b| {
        b.iter(|| fit_buyer_thresholds(black_box(&scored), &config.buyer))
    });
    group.bench_function("client_groups", |b| {
        b.iter(|| fit_client_groups(black_box(&scored), &config.client))
    });
    group.finish();
}

criterion_group!(benches, scoring_benchmark);
criterion_main!(benches);
