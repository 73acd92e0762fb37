//! Choosing the lattice index this node applies for

use heapless::Vec;
use nalgebra::Vector3;

use super::neighbors::NeighborTable;
use crate::{
    beacon::BeaconEvent,
    config::LocConfig,
    lattice::{self, NUM_INDICES, VECTORS},
};

/// Beacon events for a node that knows its position
///
/// The node applies for the index of its nearest lattice point, unless the
/// current holder is clearly closer to it. A region without any prime gets
/// one first, at the nearest prime point that has enough beacons around it.
pub fn optimize_beacons(pos: &Vector3<f32>, table: &NeighborTable, config: &LocConfig) -> Vec<BeaconEvent, 2> {
    let r = config.lattice_r;
    let ideal = lattice::quantize_to_grid(pos, r);
    let candidate = lattice::index_from_point(&ideal, r);
    let mut events = Vec::new();

    let primes_heard = (0..lattice::NUM_PRIMES).any(|index| table.get(index).is_some());
    if !lattice::is_prime(candidate) && !primes_heard {
        if let Some((index, distance)) = nearest_prime(pos, &ideal, table, r) {
            let _ = events.push(BeaconEvent::Start { index, distance });
            return events;
        }
    }

    let distance = (pos - ideal).norm();
    let incumbent = table
        .get(candidate)
        .map(|neighbor| neighbor.position().map_or(f32::INFINITY, |p| (p - ideal).norm()));
    match incumbent {
        Some(theirs) if distance > config.promote_ratio * theirs => {
            let _ = events.push(BeaconEvent::Stop);
            let _ = events.push(BeaconEvent::SetIndex(candidate));
        }
        _ => {
            let _ = events.push(BeaconEvent::Start {
                index: candidate,
                distance,
            });
        }
    }
    events
}

/// Closest prime lattice point next to `ideal` with at least three heard
/// beacons around it
fn nearest_prime(pos: &Vector3<f32>, ideal: &Vector3<f32>, table: &NeighborTable, r: f32) -> Option<(u8, f32)> {
    (1..VECTORS.len() as u8)
        .filter_map(|k| {
            let point = lattice::quantize_to_grid(&(ideal + lattice::vector(k, r)), r);
            let index = lattice::index_from_point(&point, r);
            let around = (lattice::neighbor_mask(index) & table.all_mask()).count_ones();
            if lattice::is_prime(index) && around >= 3 {
                Some((index, (pos - point).norm()))
            } else {
                None
            }
        })
        .fold(None, |best: Option<(u8, f32)>, (index, distance)| match best {
            Some((_, nearest)) if nearest <= distance => best,
            _ => Some((index, distance)),
        })
}

/// Beacon event for a node that doesn't know its position yet
///
/// Candidates are the indices that are neither heard nor heard by any
/// neighbor, and that neighbor every beacon we hear. Each located neighbor
/// predicts where the candidate would sit; the candidate on whose position
/// most neighbors agree wins.
pub fn join_beacons(table: &NeighborTable, config: &LocConfig) -> Option<BeaconEvent> {
    let heard = table.all_mask();
    if heard == 0 {
        return None;
    }
    let r = config.lattice_r;
    let taken = table.iter().fold(heard, |taken, (_, neighbor)| taken | neighbor.nbrhood);

    let mut best: Option<(u8, u32)> = None;
    for candidate in 0..NUM_INDICES as u8 {
        if taken & 1 << candidate != 0 || heard & !lattice::neighbor_mask(candidate) != 0 {
            continue;
        }
        let score = agreement(candidate, table, r);
        if best.map_or(true, |(_, top)| score > top) {
            best = Some((candidate, score));
        }
    }
    best.map(|(index, _)| BeaconEvent::Start {
        index,
        distance: r / 2.0,
    })
}

/// Pairs of located neighbors that agree on the position of `candidate`
/// within half a lattice spacing
fn agreement(candidate: u8, table: &NeighborTable, r: f32) -> u32 {
    let mut predictions: Vec<Vector3<f32>, NUM_INDICES> = Vec::new();
    for (index, neighbor) in table.iter() {
        let predicted = neighbor
            .position()
            .and_then(|p| Some(lattice::quantize_to_grid(&p, r) + lattice::relative_position(index, candidate, r)?));
        if let Some(p) = predicted {
            let _ = predictions.push(p);
        }
    }
    let mut score = 0;
    for (i, a) in predictions.iter().enumerate() {
        for b in predictions.iter().skip(i + 1) {
            if (a - b).norm() < r / 2.0 {
                score += 1;
            }
        }
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::location::neighbors::Neighbor;

    const R: f32 = 2.5;

    fn config() -> LocConfig {
        LocConfig::default()
    }

    fn at(addr: u64, p: Vector3<f32>) -> Neighbor {
        Neighbor {
            addr,
            pos: [p.x, p.y, p.z],
            ..Neighbor::default()
        }
    }

    #[test]
    fn applies_for_the_nearest_point() {
        let mut table = NeighborTable::new(6);
        table.update(0, at(1, Vector3::zeros()), true);
        let pos = lattice::vector(1, R) + Vector3::new(0.1, 0.0, 0.0);
        let events = optimize_beacons(&pos, &table, &config());
        match events.as_slice() {
            [BeaconEvent::Start { index: 4, distance }] => assert!((distance - 0.1).abs() < 1e-5),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn defers_to_a_closer_incumbent() {
        let mut table = NeighborTable::new(6);
        let ideal = lattice::vector(1, R);
        table.update(0, at(1, Vector3::zeros()), true);
        table.update(4, at(2, ideal + Vector3::new(0.0, 0.2, 0.0)), true);

        let far = ideal + Vector3::new(0.0, 0.5, 0.0);
        assert_eq!(
            optimize_beacons(&far, &table, &config()).as_slice(),
            &[BeaconEvent::Stop, BeaconEvent::SetIndex(4)]
        );

        let close = ideal + Vector3::new(0.0, 0.1, 0.0);
        assert!(matches!(
            optimize_beacons(&close, &table, &config()).as_slice(),
            [BeaconEvent::Start { index: 4, .. }]
        ));
    }

    #[test]
    fn founds_a_prime_where_none_is_heard() {
        // Beacons around (2.5, 0, 0) but no prime in sight
        let mut table = NeighborTable::new(6);
        let origin = Vector3::zeros();
        for k in [3u8, 4, 9].iter() {
            let p = origin + lattice::vector(*k, R);
            let index = lattice::index_from_point(&lattice::quantize_to_grid(&p, R), R);
            table.update(index, at(*k as u64, p), true);
        }
        let pos = lattice::vector(1, R);
        let events = optimize_beacons(&pos, &table, &config());
        match events.as_slice() {
            [BeaconEvent::Start { index, distance }] => {
                assert!(lattice::is_prime(*index));
                assert_eq!(*index, 0);
                assert!((distance - R).abs() < 1e-5);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn joins_where_neighbors_agree() {
        let mut table = NeighborTable::new(6);
        table.update(0, at(1, Vector3::zeros()), true);
        table.update(4, at(2, lattice::vector(1, R)), true);
        let event = join_beacons(&table, &config());
        match event {
            Some(BeaconEvent::Start { index, distance }) => {
                assert_ne!(index, 0);
                assert_ne!(index, 4);
                assert_ne!(lattice::neighbor_mask(index) & 1 << 0, 0);
                assert_ne!(lattice::neighbor_mask(index) & 1 << 4, 0);
                assert_eq!(distance, R / 2.0);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn avoids_indices_neighbors_hear() {
        let mut table = NeighborTable::new(6);
        let mut root = at(1, Vector3::zeros());
        root.nbrhood = lattice::neighbor_mask(0);
        table.update(0, root, true);
        assert_eq!(join_beacons(&table, &config()), None);
        assert_eq!(join_beacons(&NeighborTable::new(6), &config()), None);
    }
}
