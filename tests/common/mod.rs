// Deterministic synthetic first-time buyers shared by the integration tests.
//
// Event times are exponential with a baseline daily rate for organic buyers and twice
// that rate for paid buyers. Instead of sampling, each channel receives the exact
// quantiles F^-1((k + 0.5) / m) in a scrambled order, so every run sees the same data
// and the hazard ratio is recoverable without sampling noise.

use repurchase::config::PipelineConfig;
use repurchase::types::{CovariateValue, Covariates, Record};

pub const BASE_RATE: f64 = 0.003;
pub const PAID_HAZARD_RATIO: f64 = 2.0;
pub const CENSOR_DAY: i64 = 180;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn quarter(j: usize) -> String {
    format!("2023Q{}", j % 4 + 1)
}

fn user_group(j: usize) -> &'static str {
    ["newsletter", "loyalty", "guest"][(j / 4) % 3]
}

fn lag_days(j: usize) -> f64 {
    ((j / 12) % 10) as f64 * 3.0
}

/// `n` records, alternating organic and paid. Every record carries a realized margin.
pub fn synthetic_records(n: usize) -> Vec<Record> {
    let per_channel = n.div_ceil(2);
    // Coprime with typical sizes, so quantile order is unrelated to the other covariates.
    let stride = 263;
    (0..n)
        .map(|i| {
            let paid = i % 2 == 1;
            let j = i / 2;
            let rank = (j * stride) % per_channel;
            let u = (rank as f64 + 0.5) / per_channel as f64;
            let rate = BASE_RATE * if paid { PAID_HAZARD_RATIO } else { 1.0 };
            let latent = (-(1.0 - u).ln() / rate).ceil() as i64;
            let event_observed = latent <= CENSOR_DAY;

            let mut covariates = Covariates::new();
            covariates.insert(
                "acquisition_channel".into(),
                CovariateValue::Level(if paid { "paid" } else { "organic" }.into()),
            );
            covariates.insert("acquisition_quarter".into(), CovariateValue::Level(quarter(j)));
            covariates.insert(
                "user_group".into(),
                CovariateValue::Level(user_group(j).into()),
            );
            covariates.insert(
                "reg_to_purchase_days".into(),
                CovariateValue::Numeric(lag_days(j)),
            );

            let noise = ((i * 37) % 11) as f64 - 5.0;
            let margin = 20.0 + if paid { 15.0 } else { 0.0 } - 0.2 * lag_days(j) + 0.5 * noise;

            Record {
                customer_id: format!("cust-{i:05}"),
                client_id: format!("client-{}", j % 3 + if paid { 3 } else { 0 }),
                covariates,
                outcome_time: Some(latent.min(CENSOR_DAY)),
                event_observed,
                net_margin_realized: Some(margin),
            }
        })
        .collect()
}

/// Defaults with tree controls small enough for the synthetic populations.
pub fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.client.tree.min_split = 10;
    config.client.tree.min_bucket = 5;
    config
}
