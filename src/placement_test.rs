use std::collections::{HashMap, HashSet};

use anyhow::Result;
use rand::rngs::mock::StepRng;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::ControllerError;
use crate::placement::{RandomReplicaPlacer, ReplicaPlacementPolicy, UsableBroker};

fn brokers(racks: &[Option<&str>]) -> Vec<UsableBroker> {
    racks
        .iter()
        .enumerate()
        .map(|(id, rack)| UsableBroker {
            id: id as i32,
            rack: rack.map(String::from),
        })
        .collect()
}

fn assert_distinct_and_in_range(assignment: &[i32], replication_factor: usize, usable: &[UsableBroker]) {
    let ids: HashSet<i32> = usable.iter().map(|broker| broker.id).collect();
    let seen: HashSet<i32> = assignment.iter().copied().collect();
    assert_eq!(assignment.len(), replication_factor, "expected {} replicas, got {:?}", replication_factor, assignment);
    assert_eq!(seen.len(), assignment.len(), "expected distinct replicas, got {:?}", assignment);
    assert!(seen.is_subset(&ids), "expected replicas {:?} to be drawn from {:?}", assignment, ids);
}

#[test]
fn uniform_placement_yields_distinct_replicas() -> Result<()> {
    for num_brokers in [3usize, 10] {
        let usable = brokers(&vec![None; num_brokers]);
        let mut placer = RandomReplicaPlacer::new(StdRng::seed_from_u64(num_brokers as u64));
        for _ in 0..100 {
            let placement = placer.create_placement(4, 3, &usable)?;
            assert_eq!(placement.len(), 4, "expected one assignment per partition, got {:?}", placement);
            for assignment in placement.iter() {
                assert_distinct_and_in_range(assignment, 3, &usable);
            }
        }
    }
    Ok(())
}

#[test]
fn placement_with_stepping_random_source_stays_distinct() -> Result<()> {
    let usable = brokers(&[None, None, None, None, None]);
    let mut placer = RandomReplicaPlacer::new(StepRng::new(0, 1));
    for _ in 0..100 {
        let placement = placer.create_placement(1, 5, &usable)?;
        assert_distinct_and_in_range(&placement[0], 5, &usable);
    }
    Ok(())
}

#[test]
fn placement_is_deterministic_for_a_given_seed() -> Result<()> {
    let usable = brokers(&[Some("a"), Some("a"), Some("b"), Some("b"), Some("c"), None]);
    let first = RandomReplicaPlacer::new(StdRng::seed_from_u64(7)).create_placement(10, 3, &usable)?;
    let second = RandomReplicaPlacer::new(StdRng::seed_from_u64(7)).create_placement(10, 3, &usable)?;
    assert_eq!(first, second, "expected identical placements for identical random sources");
    Ok(())
}

#[test]
fn rack_aware_placement_spreads_across_racks() -> Result<()> {
    let usable = brokers(&[Some("a"), Some("a"), Some("b"), Some("b"), Some("c"), Some("c")]);
    let racks: HashMap<i32, String> = usable.iter().filter_map(|b| b.rack.clone().map(|rack| (b.id, rack))).collect();
    let mut placer = RandomReplicaPlacer::new(StdRng::seed_from_u64(42));

    for assignment in placer.create_placement(200, 3, &usable)? {
        assert_distinct_and_in_range(&assignment, 3, &usable);
        let used: HashSet<&String> = assignment.iter().filter_map(|id| racks.get(id)).collect();
        assert_eq!(used.len(), 3, "expected replicas {:?} to cover all 3 racks", assignment);
    }
    Ok(())
}

#[test]
fn rack_aware_placement_fills_beyond_rack_count() -> Result<()> {
    let usable = brokers(&[Some("a"), Some("a"), Some("a"), Some("b"), Some("b")]);
    let mut placer = RandomReplicaPlacer::new(StdRng::seed_from_u64(3));

    for assignment in placer.create_placement(50, 4, &usable)? {
        assert_distinct_and_in_range(&assignment, 4, &usable);
        let num_b = assignment.iter().filter(|id| **id >= 3).count();
        assert_eq!(num_b, 2, "expected both rack b brokers to be used before a third rack a replica, got {:?}", assignment);
    }
    Ok(())
}

#[test]
fn partially_racked_brokers_use_uniform_placement() -> Result<()> {
    let usable = brokers(&[Some("a"), None, None, None]);
    let mut placer = RandomReplicaPlacer::new(StdRng::seed_from_u64(11));
    for assignment in placer.create_placement(100, 4, &usable)? {
        assert_distinct_and_in_range(&assignment, 4, &usable);
    }
    Ok(())
}

#[test]
fn placement_fails_with_too_few_brokers() {
    let usable = brokers(&[None, None]);
    let mut placer = RandomReplicaPlacer::new(StdRng::seed_from_u64(0));

    let res = placer.create_placement(1, 3, &usable);

    assert!(
        matches!(res, Err(ControllerError::NotEnoughReplicas { requested: 3, available: 2 })),
        "expected NotEnoughReplicas error, got {:?}",
        res
    );
}

#[test]
fn placement_fails_with_zero_replication_factor() {
    let usable = brokers(&[None]);
    let mut placer = RandomReplicaPlacer::new(StdRng::seed_from_u64(0));

    let res = placer.create_placement(1, 0, &usable);

    assert!(matches!(res, Err(ControllerError::InvalidReplicationFactor(0))), "expected InvalidReplicationFactor error, got {:?}", res);
}
