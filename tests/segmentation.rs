mod common;

use common::{config, init_logging, synthetic_records};
use repurchase::pipeline::train;
use repurchase::segment::{
    BuyerOptions, SegmentError, fit_buyer_thresholds, fit_client_groups,
};
use repurchase::types::{BuyerSegment, ScoredRecord};
use std::collections::BTreeMap;

fn scored_population(n: usize) -> Vec<ScoredRecord> {
    let records = synthetic_records(n);
    let config = config();
    let models = train(&records, &config).expect("train");
    let batch = models.engine().score_batch(&records);
    assert!(batch.rejected.is_empty(), "rejections: {:?}", batch.rejected);
    batch.scored
}

#[test]
fn buyer_thresholds_split_expected_value_into_three_ordered_segments() {
    init_logging();
    let scored = scored_population(1000);
    let thresholds = fit_buyer_thresholds(&scored, &BuyerOptions::default()).expect("thresholds");

    let edges = thresholds.edges();
    assert_eq!(edges.len(), 2);
    assert!(edges[0] < edges[1]);

    let mut counts: BTreeMap<BuyerSegment, usize> = BTreeMap::new();
    for record in &scored {
        let segment = thresholds
            .assign(record.expected_value)
            .expect("finite expected value");
        assert!((1..=3).contains(&segment.0));
        let expected = 1 + edges.iter().filter(|&&edge| edge <= record.expected_value).count();
        assert_eq!(usize::from(segment.0), expected);
        *counts.entry(segment).or_default() += 1;
    }
    assert_eq!(counts.len(), 3, "every segment is populated: {counts:?}");

    // Every threshold is an observed expected value.
    for edge in edges {
        assert!(scored.iter().any(|record| record.expected_value == *edge));
    }
}

#[test]
fn segments_are_monotone_in_expected_value() {
    let scored = scored_population(600);
    let thresholds = fit_buyer_thresholds(&scored, &BuyerOptions::default()).expect("thresholds");

    let mut ordered: Vec<&ScoredRecord> = scored.iter().collect();
    ordered.sort_by(|a, b| a.expected_value.total_cmp(&b.expected_value));
    let segments: Vec<u8> = ordered
        .iter()
        .map(|record| thresholds.assign(record.expected_value).expect("segment").0)
        .collect();
    assert!(segments.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[test]
fn refitting_on_the_same_population_is_stable() {
    let scored = scored_population(600);
    let first = fit_buyer_thresholds(&scored, &BuyerOptions::default()).expect("first");
    let second = fit_buyer_thresholds(&scored, &BuyerOptions::default()).expect("second");
    assert_eq!(first, second);
}

#[test]
fn records_of_one_client_share_a_group() {
    init_logging();
    let scored = scored_population(1000);
    let config = config();
    let groups = fit_client_groups(&scored, &config.client).expect("client groups");

    assert_eq!(groups.client_count(), 6);
    let mut by_client: BTreeMap<&str, f64> = BTreeMap::new();
    for record in &scored {
        let group = groups
            .group_for(&record.record.client_id)
            .expect("known client");
        let first = by_client.entry(record.record.client_id.as_str()).or_insert(group);
        assert_eq!(*first, group);
    }

    let leaves = groups.leaves();
    let clients: usize = leaves.iter().map(|leaf| leaf.clients.len()).sum();
    assert_eq!(clients, 6);
    // Paid buyers convert faster, so paid clients never share a leaf with organic ones.
    for leaf in &leaves {
        let paid = leaf
            .clients
            .iter()
            .filter(|client| ["client-3", "client-4", "client-5"].contains(&client.as_str()))
            .count();
        assert!(paid == 0 || paid == leaf.clients.len(), "mixed leaf {leaf:?}");
    }
}

#[test]
fn too_small_a_population_cannot_be_segmented() {
    let scored = scored_population(1000);
    let few: Vec<ScoredRecord> = scored.into_iter().take(10).collect();
    let err = fit_buyer_thresholds(&few, &BuyerOptions::default()).unwrap_err();
    assert!(matches!(
        err,
        SegmentError::InsufficientData {
            required: 21,
            found: 10,
            ..
        }
    ));
}
