use std::collections::BTreeSet;

use common::interval::{
    End,
    Interval,
    StartIncluded,
};
use proptest::prelude::*;

use crate::IntervalMap;

fn interval(start: Vec<u8>, end: Option<Vec<u8>>) -> Interval {
    Interval {
        start: StartIncluded(start.into()),
        end: match end {
            Some(end) => End::Excluded(end.into()),
            None => End::Unbounded,
        },
    }
}

fn query_set(map: &IntervalMap<usize>, point: &[u8]) -> BTreeSet<usize> {
    let mut hits = BTreeSet::new();
    map.query(point, |owner| {
        hits.insert(owner);
    });
    hits
}

fn naive_query(owners: &[Vec<Interval>], point: &[u8]) -> BTreeSet<usize> {
    owners
        .iter()
        .enumerate()
        .filter(|(_, intervals)| intervals.iter().any(|i| i.contains(point)))
        .map(|(owner, _)| owner)
        .collect()
}

#[test]
fn test_basic_stabbing() {
    let mut map = IntervalMap::new();
    map.insert(0usize, [interval(vec![2], Some(vec![5]))]).unwrap();
    map.insert(1usize, [interval(vec![4], None)]).unwrap();
    map.check_invariants();

    assert_eq!(query_set(&map, &[1]), BTreeSet::new());
    assert_eq!(query_set(&map, &[2]), BTreeSet::from([0]));
    assert_eq!(query_set(&map, &[4]), BTreeSet::from([0, 1]));
    assert_eq!(query_set(&map, &[5]), BTreeSet::from([1]));
    assert_eq!(query_set(&map, &[255, 255]), BTreeSet::from([1]));

    map.remove(0);
    map.check_invariants();
    assert_eq!(query_set(&map, &[4]), BTreeSet::from([1]));
}

#[test]
fn test_half_open_bounds() {
    let mut map = IntervalMap::new();
    map.insert(7usize, [interval(vec![3], Some(vec![4]))]).unwrap();
    // Lower bound is inside, upper bound is outside.
    assert_eq!(query_set(&map, &[3]), BTreeSet::from([7]));
    assert_eq!(query_set(&map, &[3, 0]), BTreeSet::from([7]));
    assert_eq!(query_set(&map, &[4]), BTreeSet::new());
}

#[test]
fn test_empty_interval_never_matches() {
    let mut map = IntervalMap::new();
    map.insert(0usize, [interval(vec![3], Some(vec![3]))]).unwrap();
    assert_eq!(query_set(&map, &[3]), BTreeSet::new());
}

#[test]
fn test_owner_with_many_intervals_removed_once() {
    let mut map = IntervalMap::new();
    let intervals: Vec<_> = (0u8..20)
        .map(|i| interval(vec![i], Some(vec![i, 1])))
        .collect();
    map.insert(9usize, intervals).unwrap();
    map.check_invariants();
    assert_eq!(query_set(&map, &[10]), BTreeSet::from([9]));
    map.remove(9);
    map.check_invariants();
    assert!(map.is_empty());
    assert_eq!(query_set(&map, &[10]), BTreeSet::new());
}

#[test]
#[should_panic(expected = "double-inserted owner")]
fn test_double_insert_panics() {
    let mut map = IntervalMap::new();
    map.insert(0usize, []).unwrap();
    map.insert(0usize, []).unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 256, failure_persistence: None, ..ProptestConfig::default() })]

    #[test]
    fn proptest_matches_naive(
        owners in prop::collection::vec(
            prop::collection::vec(
                (
                    prop::collection::vec(any::<u8>(), 0..3),
                    prop::option::of(prop::collection::vec(any::<u8>(), 0..3)),
                ),
                0..4,
            ),
            0..8,
        ),
        queries in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..4), 0..8),
    ) {
        let owners: Vec<Vec<Interval>> = owners
            .into_iter()
            .map(|intervals| {
                intervals
                    .into_iter()
                    .map(|(start, end)| interval(start, end))
                    .collect()
            })
            .collect();
        let mut map = IntervalMap::new();
        for (owner, intervals) in owners.iter().enumerate() {
            map.insert(owner, intervals.clone()).unwrap();
        }
        map.check_invariants();
        for query in &queries {
            prop_assert_eq!(query_set(&map, query), naive_query(&owners, query));
        }
    }

    #[test]
    fn proptest_remove_interleaved(
        owners in prop::collection::vec(
            prop::collection::vec(
                (
                    prop::collection::vec(any::<u8>(), 0..3),
                    prop::option::of(prop::collection::vec(any::<u8>(), 0..3)),
                ),
                0..4,
            ),
            1..8,
        ),
        remove_mask in prop::collection::vec(any::<bool>(), 1..8),
        query in prop::collection::vec(any::<u8>(), 0..4),
    ) {
        let owners: Vec<Vec<Interval>> = owners
            .into_iter()
            .map(|intervals| {
                intervals
                    .into_iter()
                    .map(|(start, end)| interval(start, end))
                    .collect()
            })
            .collect();
        let mut map = IntervalMap::new();
        for (owner, intervals) in owners.iter().enumerate() {
            map.insert(owner, intervals.clone()).unwrap();
        }
        let mut live: Vec<Vec<Interval>> = owners.clone();
        for (owner, remove) in remove_mask.iter().enumerate().take(owners.len()) {
            if *remove {
                map.remove(owner);
                live[owner] = Vec::new();
            }
        }
        map.check_invariants();
        prop_assert_eq!(query_set(&map, &query), naive_query(&live, &query));
    }
}
