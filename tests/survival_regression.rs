mod common;

use approx::assert_relative_eq;
use common::{CENSOR_DAY, PAID_HAZARD_RATIO, config, init_logging, synthetic_records};
use repurchase::survival::{
    CoxOptions, CurveError, CurveOptions, TieMethod, derive_curve, fit_hazard_model,
};

#[test]
fn recovers_hazard_ratio_within_tolerance() {
    init_logging();
    let records = synthetic_records(1000);
    let config = config();
    let fit = fit_hazard_model(&records, &config.covariates, &config.hazard).expect("fit");

    assert!(fit.converged(), "Newton-Raphson did not converge");
    let ratio = fit
        .hazard_ratio("acquisition_channel[paid]")
        .expect("paid column");
    assert!(
        (ratio - PAID_HAZARD_RATIO).abs() <= 0.15 * PAID_HAZARD_RATIO,
        "recovered hazard ratio {ratio:.4}, expected {PAID_HAZARD_RATIO} +/- 15%"
    );

    // Covariates without an effect stay near a ratio of one.
    for column in ["acquisition_quarter[2023Q2]", "user_group[loyalty]"] {
        let null_ratio = fit.hazard_ratio(column).expect("column");
        assert!(
            (0.75..1.33).contains(&null_ratio),
            "{column} has ratio {null_ratio:.4}"
        );
    }
    assert!(fit.log_likelihood() > fit.null_log_likelihood());
}

#[test]
fn breslow_and_efron_agree_closely_on_discretized_times() {
    let records = synthetic_records(1000);
    let config = config();
    let efron = fit_hazard_model(&records, &config.covariates, &config.hazard).expect("efron");
    let breslow_options = CoxOptions {
        ties: TieMethod::Breslow,
        ..CoxOptions::default()
    };
    let breslow =
        fit_hazard_model(&records, &config.covariates, &breslow_options).expect("breslow");
    let column = "acquisition_channel[paid]";
    let efron_ratio = efron.hazard_ratio(column).expect("efron ratio");
    let breslow_ratio = breslow.hazard_ratio(column).expect("breslow ratio");
    assert_relative_eq!(breslow_ratio, efron_ratio, max_relative = 0.1);
    assert_eq!(breslow.ties(), TieMethod::Breslow);
}

#[test]
fn baseline_is_dense_monotone_and_bounded() {
    init_logging();
    let records = synthetic_records(1000);
    let config = config();
    let fit = fit_hazard_model(&records, &config.covariates, &config.hazard).expect("fit");
    let curve = derive_curve(&fit, &records, &config.curve).expect("curve");

    assert_eq!(i64::from(curve.max_day()), CENSOR_DAY);
    assert_eq!(curve.rows().len(), CENSOR_DAY as usize + 1);
    for (day, row) in curve.rows().iter().enumerate() {
        assert_eq!(row.day as usize, day);
        assert!(row.incremental_hazard >= 0.0);
    }
    for pair in curve.rows().windows(2) {
        assert!(pair[1].cumulative_hazard >= pair[0].cumulative_hazard);
        assert_relative_eq!(
            pair[1].incremental_hazard,
            pair[1].cumulative_hazard - pair[0].cumulative_hazard,
            epsilon = 1e-12
        );
    }

    for day in 0..=CENSOR_DAY {
        let p = curve.lookup(day);
        assert!((0.0..=1.0).contains(&p), "lookup({day}) = {p}");
        for &horizon in curve.horizons() {
            let windowed = curve.conversion(day, horizon).expect("tabulated horizon");
            assert!((0.0..=1.0).contains(&windowed));
        }
    }
    // Longer windows never convert less from the same starting day.
    let thirty = curve.conversion(10, 30).expect("30");
    let sixty = curve.conversion(10, 60).expect("60");
    let ninety = curve.conversion(10, 90).expect("90");
    assert!(thirty <= sixty && sixty <= ninety);
    assert_eq!(curve.lookup(10), ninety);

    assert_eq!(
        curve.conversion(10, 45).unwrap_err(),
        CurveError::UnknownHorizon(45)
    );
}

#[test]
fn lookups_outside_the_table_return_the_fallback_exactly() {
    let records = synthetic_records(400);
    let config = config();
    let fit = fit_hazard_model(&records, &config.covariates, &config.hazard).expect("fit");
    let curve = derive_curve(&fit, &records, &config.curve).expect("curve");

    assert_eq!(curve.lookup(1500), 0.007422);
    assert_eq!(curve.lookup(-3), 0.007422);
    // The 90-day window starting at the last tabulated day runs off the table.
    assert_eq!(curve.lookup(CENSOR_DAY), 0.007422);
    assert_ne!(curve.lookup(0), 0.007422);

    let custom = CurveOptions {
        fallback_probability: 0.02,
        ..CurveOptions::default()
    };
    let custom_curve = derive_curve(&fit, &records, &custom).expect("custom curve");
    assert_eq!(custom_curve.lookup(1500), 0.02);
}

#[test]
fn fitting_and_derivation_are_deterministic() {
    let records = synthetic_records(600);
    let config = config();
    let first = fit_hazard_model(&records, &config.covariates, &config.hazard).expect("first");
    let second = fit_hazard_model(&records, &config.covariates, &config.hazard).expect("second");
    assert_eq!(first, second);

    let curve_a = derive_curve(&first, &records, &config.curve).expect("curve a");
    let curve_b = derive_curve(&second, &records, &config.curve).expect("curve b");
    assert_eq!(curve_a, curve_b);
}

#[test]
fn unknown_level_is_rejected_unless_mapped_to_reference() {
    let records = synthetic_records(400);
    let mut config = config();
    let fit = fit_hazard_model(&records, &config.covariates, &config.hazard).expect("fit");

    let mut unseen = records[0].covariates.clone();
    unseen.insert(
        "acquisition_channel".into(),
        repurchase::types::CovariateValue::Level("billboard".into()),
    );
    assert!(fit.predict_risk(&unseen).is_err());

    config.hazard.unseen_levels = repurchase::survival::UnseenLevelPolicy::Reference;
    let lenient = fit_hazard_model(&records, &config.covariates, &config.hazard).expect("fit");
    let mut reference = records[0].covariates.clone();
    reference.insert(
        "acquisition_channel".into(),
        repurchase::types::CovariateValue::Level("organic".into()),
    );
    assert_eq!(
        lenient.predict_risk(&unseen).expect("mapped"),
        lenient.predict_risk(&reference).expect("reference")
    );
}
