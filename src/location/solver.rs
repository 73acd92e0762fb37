//! Position solvers
//!
//! Which solver runs depends on what the cell measured:
//!
//! 1. A joined beacon that knows where it is nudges its position with a
//!    spring-damper step.
//! 2. With four or more beacons around it, not all in one lattice sheet, a
//!    node that transmitted multilaterates from distances (TOA).
//! 3. A node that only listened solves from pseudoranges to the prime (TDOA).
//! 4. With three beacons and distances to them, three spheres are
//!    intersected; the lattice tells which of the two intersections is ours.
//! 5. While the network is still forming, the first few beacons are placed
//!    along the x axis and in the xy plane around index 0.

use nalgebra::{Matrix3, SMatrix, SVector, Vector3};

use super::update::{LocUpdate, SELF_COL};
use crate::{
    config::SpringConfig,
    debug,
    lattice::{self, CELL_PARTICIPANTS, NOT_NEIGHBORS, RELPOS, VECTORS},
};

/// Result of a location update
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SolverStatus {
    Updated,
    NotUpdated,
    SkipNumBeacons,
    SkipInaccurate,
    SkipInvalidDirSlot,
    SkipBindexNotSet,
    ToaNonfinite,
    TdoaNonfinite,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Method {
    Spring,
    Toa,
    Tdoa,
    ThreeSphere,
    Bootstrap,
}

impl Method {
    /// Status reported when the method yields no finite position
    pub fn nonfinite(self) -> SolverStatus {
        match self {
            Method::Tdoa => SolverStatus::TdoaNonfinite,
            _ => SolverStatus::ToaNonfinite,
        }
    }
}

/// What solver selection looks at
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Selection {
    /// Joined beacon with a location and at least three distances
    pub spring: bool,
    /// Ranges are distances rather than pseudoranges: we transmitted, or the
    /// prime distance was measured after an inaccurate TDOA fix
    pub distances: bool,
    /// Beacons usable for solving, plus ourselves
    pub mutual: usize,
    pub coplanar: bool,
    pub has_prime: bool,
    pub has_bindex: bool,
    /// The network is small enough to place us by our index alone
    pub bootstrap: bool,
}

/// Picks the solver for a cell
///
/// A listener whose pending update got its prime distance from ranging has
/// distances too, which is what lets it leave MEASURE_DIST through TOA or the
/// three-sphere solver.
pub fn select(selection: &Selection) -> Result<Method, SolverStatus> {
    let Selection {
        spring,
        distances,
        mutual,
        coplanar,
        has_prime,
        has_bindex,
        bootstrap,
    } = *selection;

    if spring {
        Ok(Method::Spring)
    } else if mutual >= 5 && !coplanar && distances {
        Ok(Method::Toa)
    } else if mutual >= 5 && !coplanar && has_prime {
        Ok(Method::Tdoa)
    } else if mutual >= 4 && distances {
        if has_bindex {
            Ok(Method::ThreeSphere)
        } else {
            Err(SolverStatus::SkipBindexNotSet)
        }
    } else if bootstrap {
        Ok(Method::Bootstrap)
    } else {
        Err(SolverStatus::SkipNumBeacons)
    }
}

/// A beacon with a known position and a range to us
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Anchor {
    pub offset: usize,
    pub index: u8,
    pub pos: Vector3<f32>,
    /// Distance in meters, or distance minus our distance to the prime
    pub range: f32,
}

/// Beacons that can take part in solving
///
/// For pseudoranges the prime comes first, with range 0.
pub fn anchors(update: &LocUpdate) -> heapless::Vec<Anchor, CELL_PARTICIPANTS> {
    let me = update.me();
    let distances = update.shouldtx || update.measured;
    let mut anchors = heapless::Vec::new();
    for i in 0..CELL_PARTICIPANTS {
        if !update.heard(i) {
            continue;
        }
        let pos = match update.new_nbrs[i].position() {
            Some(pos) => pos,
            None => continue,
        };
        let range = if distances {
            if !update.is_adj(i, me) {
                continue;
            }
            update.distance_m(i, me)
        } else if i == 0 {
            if !update.synced {
                continue;
            }
            0.0
        } else {
            if !update.is_adj(i, SELF_COL) {
                continue;
            }
            update.distance_m(i, SELF_COL)
        };
        let _ = anchors.push(Anchor {
            offset: i,
            index: update.indices[i],
            pos,
            range,
        });
    }
    anchors
}

/// Whether the beacons around the prime lie in too few lattice sheets
///
/// Positions are taken from the ideal lattice relative to the prime, which
/// sits in the middle sheet.
pub fn coplanar(prime: u8, indices: impl Iterator<Item = u8>) -> bool {
    let (mut total, mut above, mut below) = (0, 0, 0);
    for index in indices {
        let k = RELPOS[prime as usize % RELPOS.len()][index as usize % RELPOS.len()];
        if k == NOT_NEIGHBORS {
            continue;
        }
        total += 1;
        let z = VECTORS[k as usize][2];
        if z > 0.0 {
            above += 1;
        } else if z < 0.0 {
            below += 1;
        }
    }
    total <= 3 || above == 0 || above + below == 0
}

/// Least squares solutions of `A x = b` through one QR decomposition
struct LeastSquares {
    q: SMatrix<f32, 6, 3>,
    r: Matrix3<f32>,
}

impl LeastSquares {
    /// Unused rows of `a` must be zero
    fn new(a: SMatrix<f32, 6, 3>) -> Self {
        let qr = a.qr();
        LeastSquares { q: qr.q(), r: qr.r() }
    }

    fn solve(&self, b: &SVector<f32, 6>) -> Option<Vector3<f32>> {
        let x = self.r.solve_upper_triangular(&(self.q.transpose() * b))?;
        if x.iter().all(|c| c.is_finite()) {
            Some(x)
        } else {
            None
        }
    }
}

fn finite(p: Vector3<f32>) -> Option<Vector3<f32>> {
    if p.iter().all(|c| c.is_finite()) {
        Some(p)
    } else {
        None
    }
}

/// Multilateration from distances, linearized against the first anchor
pub fn toa(anchors: &[Anchor]) -> Result<Vector3<f32>, SolverStatus> {
    let (reference, rest) = anchors.split_first().ok_or(SolverStatus::SkipNumBeacons)?;
    if rest.len() < 3 {
        return Err(SolverStatus::SkipNumBeacons);
    }
    let mut a = SMatrix::<f32, 6, 3>::zeros();
    let mut b = SVector::<f32, 6>::zeros();
    let p0 = reference.pos;
    for (row, anchor) in rest.iter().enumerate() {
        let p = anchor.pos;
        a.set_row(row, &(2.0 * (p - p0)).transpose());
        b[row] = p.norm_squared() - p0.norm_squared() - anchor.range * anchor.range
            + reference.range * reference.range;
    }
    LeastSquares::new(a).solve(&b).ok_or(SolverStatus::ToaNonfinite)
}

/// Multilateration from pseudoranges relative to the prime
///
/// The first anchor must be the prime. Solving for `x = u + v·d0` leaves a
/// quadratic in our distance `d0` to the prime; the positive root that
/// explains the measurements best wins.
pub fn tdoa(anchors: &[Anchor], threshold: f32) -> Result<Vector3<f32>, SolverStatus> {
    let (prime, rest) = anchors.split_first().ok_or(SolverStatus::SkipNumBeacons)?;
    if prime.offset != 0 {
        return Err(SolverStatus::SkipNumBeacons);
    }
    if rest.len() < 3 {
        return Err(SolverStatus::SkipNumBeacons);
    }
    let mut a = SMatrix::<f32, 6, 3>::zeros();
    let mut b1 = SVector::<f32, 6>::zeros();
    let mut b2 = SVector::<f32, 6>::zeros();
    let p0 = prime.pos;
    for (row, anchor) in rest.iter().enumerate() {
        let p = anchor.pos;
        a.set_row(row, &(2.0 * (p - p0)).transpose());
        b1[row] = p.norm_squared() - p0.norm_squared() - anchor.range * anchor.range;
        b2[row] = -2.0 * anchor.range;
    }
    let solver = LeastSquares::new(a);
    let u = solver.solve(&b1).ok_or(SolverStatus::TdoaNonfinite)?;
    let v = solver.solve(&b2).ok_or(SolverStatus::TdoaNonfinite)?;

    let w = u - p0;
    let qa = v.norm_squared() - 1.0;
    let qb = 2.0 * w.dot(&v);
    let qc = w.norm_squared();
    let mut roots = [f32::NAN; 2];
    if libm::fabsf(qa) < 1e-6 {
        roots[0] = -qc / qb;
    } else {
        let disc = qb * qb - 4.0 * qa * qc;
        if disc >= 0.0 {
            let sqrt = libm::sqrtf(disc);
            roots = [(-qb + sqrt) / (2.0 * qa), (-qb - sqrt) / (2.0 * qa)];
        }
    }

    let residual = |x: &Vector3<f32>, d0: f32| {
        anchors
            .iter()
            .map(|anchor| libm::fabsf((x - anchor.pos).norm() - (d0 + anchor.range)))
            .fold(0.0f32, f32::max)
    };
    let best = roots
        .iter()
        .filter(|&&d0| d0.is_finite() && d0 > 0.0)
        .filter_map(|&d0| finite(u + v * d0).map(|x| (x, residual(&x, d0))))
        .fold(None, |best: Option<(Vector3<f32>, f32)>, (x, error)| match best {
            Some((_, best_error)) if best_error <= error => best,
            _ => Some((x, error)),
        });

    match best {
        Some((x, error)) if error <= threshold => Ok(x),
        Some((_, error)) => {
            debug!("tdoa residual {} m", error);
            Err(SolverStatus::SkipInaccurate)
        }
        None => Err(SolverStatus::TdoaNonfinite),
    }
}

fn ideal(from: u8, to: u8) -> Option<Vector3<f32>> {
    lattice::relative_position(from, to, 1.0)
}

fn triple(a: &Vector3<f32>, b: &Vector3<f32>, c: &Vector3<f32>) -> f32 {
    c.dot(&a.cross(b))
}

/// Intersection of three spheres
///
/// Of the two intersections, the one seeing the beacons in the same
/// orientation as the lattice does from index `bindex` is returned.
pub fn three_sphere(anchors: &[Anchor], bindex: u8, threshold: f32) -> Result<Vector3<f32>, SolverStatus> {
    let mut best: Option<([&Anchor; 3], f32)> = None;
    for (a, first) in anchors.iter().enumerate() {
        for (b, second) in anchors.iter().enumerate().skip(a + 1) {
            for third in anchors.iter().skip(b + 1) {
                let ideals = (ideal(bindex, first.index), ideal(bindex, second.index), ideal(bindex, third.index));
                let orientation = match ideals {
                    (Some(v1), Some(v2), Some(v3)) => triple(&v1, &v2, &v3),
                    _ => continue,
                };
                let better = match best {
                    Some((_, current)) => libm::fabsf(orientation) > libm::fabsf(current),
                    None => orientation != 0.0,
                };
                if better {
                    best = Some(([first, second, third], orientation));
                }
            }
        }
    }
    let ([s1, s2, s3], orientation) = best.ok_or(SolverStatus::SkipNumBeacons)?;

    let (p1, p2, p3) = (s1.pos, s2.pos, s3.pos);
    let (r1, r2, r3) = (s1.range, s2.range, s3.range);
    let d = (p2 - p1).norm();
    let ex = (p2 - p1) / d;
    let i = ex.dot(&(p3 - p1));
    let ey = (p3 - p1 - ex * i).normalize();
    let ez = ex.cross(&ey);
    let j = ey.dot(&(p3 - p1));

    let x = (r1 * r1 - r2 * r2 + d * d) / (2.0 * d);
    let y = (r1 * r1 - r3 * r3 + i * i + j * j) / (2.0 * j) - i * x / j;
    let mut z2 = r1 * r1 - x * x - y * y;
    if z2 < 0.0 && z2 > -2.0 * threshold * r1 {
        z2 = 0.0;
    }
    if !(z2 >= 0.0) {
        return Err(SolverStatus::ToaNonfinite);
    }
    let z = libm::sqrtf(z2);
    let base = p1 + ex * x + ey * y;

    let plus = base + ez * z;
    let seen = triple(&(p1 - plus), &(p2 - plus), &(p3 - plus));
    let position = if (seen > 0.0) == (orientation > 0.0) {
        plus
    } else {
        base - ez * z
    };
    finite(position).ok_or(SolverStatus::ToaNonfinite)
}

/// Placement of the first beacons around index 0
///
/// Index 0 is the origin, index 4 lies on the axis from 0 toward the index
/// 4 beacon, indices 9 and 13 on the positive side of that axis in the
/// horizontal plane.
pub fn bootstrap(bindex: u8, anchors: &[Anchor]) -> Option<Vector3<f32>> {
    let find = |index: u8| anchors.iter().find(|anchor| anchor.index == index);
    match bindex {
        0 => Some(Vector3::zeros()),
        4 => {
            let origin = find(0)?;
            Some(origin.pos + Vector3::x() * origin.range)
        }
        9 | 13 => {
            let (origin, axis) = (find(0)?, find(4)?);
            let along = axis.pos - origin.pos;
            let span = along.norm();
            let ex = along / span;
            let ey = Vector3::z().cross(&ex);
            let x = (origin.range * origin.range - axis.range * axis.range + span * span) / (2.0 * span);
            let y = libm::sqrtf(origin.range * origin.range - x * x);
            finite(origin.pos + ex * x + ey * y)
        }
        _ => None,
    }
}

/// Whether [`bootstrap`] can place index `bindex`
pub fn can_bootstrap(bindex: u8, anchors: &[Anchor]) -> bool {
    let heard = |index: u8| anchors.iter().any(|anchor| anchor.index == index);
    match bindex {
        0 => true,
        4 => heard(0),
        9 | 13 => heard(0) && heard(4),
        _ => false,
    }
}

/// Spring-damper relaxation toward the measured distances
///
/// Every anchor pulls or pushes along the line to it, the nearest lattice
/// point attracts, and `velocity` carries over between cells.
pub fn spring(
    anchors: &[Anchor],
    start: Vector3<f32>,
    velocity: &mut Vector3<f32>,
    config: &SpringConfig,
    lattice_r: f32,
) -> Option<Vector3<f32>> {
    let mut x = start;
    let mut v = *velocity;
    for _ in 0..config.iterations {
        let mut force = Vector3::zeros();
        for anchor in anchors {
            let toward = anchor.pos - x;
            let length = toward.norm();
            if length > f32::EPSILON {
                force += toward / length * (config.ks * (length - anchor.range));
            }
        }
        force += (lattice::quantize_to_grid(&x, lattice_r) - x) * config.kg;
        force -= v * config.b;
        v += force / config.m * config.dt;
        x += v * config.dt;
    }
    let x = finite(x)?;
    *velocity = v;
    Some(x)
}

/// Drops measurements that disagree with the reported positions
///
/// Each usable distance between two nodes with known positions is checked.
/// Inconsistent pairs are cleared, and so is every pair of a node none of
/// whose distances checked out. Our own position takes part only when given.
pub fn verify_distances(update: &mut LocUpdate, own: Option<Vector3<f32>>, threshold: f32, tick_m: f32) {
    let me = update.me();
    let mut positions = [None; CELL_PARTICIPANTS + 1];
    for (i, position) in positions.iter_mut().enumerate().take(CELL_PARTICIPANTS) {
        if update.heard(i) {
            *position = update.new_nbrs[i].position();
        }
    }
    positions[me] = own;

    let mut checked = [0u8; CELL_PARTICIPANTS + 1];
    let mut bad = [0u8; CELL_PARTICIPANTS + 1];
    for j in 1..=CELL_PARTICIPANTS {
        for i in 0..j {
            if !update.is_adj(i, j) || !update.is_distance(i, j) {
                continue;
            }
            let (pi, pj) = match (positions[i], positions[j]) {
                (Some(pi), Some(pj)) => (pi, pj),
                _ => continue,
            };
            checked[i] += 1;
            checked[j] += 1;
            let measured = update.tstamp(i, j) as f32 * tick_m;
            if libm::fabsf((pi - pj).norm() - measured) > threshold {
                debug!("distance {}-{} off by {} m", i, j, (pi - pj).norm() - measured);
                bad[i] += 1;
                bad[j] += 1;
                update.set_adj(i, j, false);
            }
        }
    }

    for n in 0..=CELL_PARTICIPANTS {
        if n == me || checked[n] == 0 || bad[n] < checked[n] {
            continue;
        }
        for other in 0..=CELL_PARTICIPANTS {
            update.set_adj(n, other, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{location::update::RADIO_TICK_M, lattice::vector};

    const R: f32 = 2.5;

    fn anchor(offset: usize, index: u8, pos: Vector3<f32>, range: f32) -> Anchor {
        Anchor {
            offset,
            index,
            pos,
            range,
        }
    }

    fn near(a: &Vector3<f32>, b: &Vector3<f32>, tolerance: f32) -> bool {
        (a - b).norm() < tolerance
    }

    #[test]
    fn selection_order() {
        let base = Selection {
            mutual: 5,
            distances: true,
            has_prime: true,
            has_bindex: true,
            ..Selection::default()
        };
        assert_eq!(select(&Selection { spring: true, ..base }), Ok(Method::Spring));
        assert_eq!(select(&base), Ok(Method::Toa));
        assert_eq!(select(&Selection { distances: false, ..base }), Ok(Method::Tdoa));
        assert_eq!(select(&Selection { coplanar: true, ..base }), Ok(Method::ThreeSphere));
        assert_eq!(
            select(&Selection {
                coplanar: true,
                has_bindex: false,
                ..base
            }),
            Err(SolverStatus::SkipBindexNotSet)
        );
        assert_eq!(
            select(&Selection {
                coplanar: true,
                distances: false,
                ..base
            }),
            Err(SolverStatus::SkipNumBeacons)
        );
        assert_eq!(
            select(&Selection {
                mutual: 3,
                bootstrap: true,
                ..base
            }),
            Ok(Method::Bootstrap)
        );
        assert_eq!(select(&Selection { mutual: 3, ..base }), Err(SolverStatus::SkipNumBeacons));
    }

    #[test]
    fn prime_distance_turns_pseudoranges_into_distances() {
        let mut update = LocUpdate::new(0, 0, lattice::NO_OFFSET, [0, 4, 13, 9, 18, 19]);
        update.synced = true;
        update.new_nbrhood |= 0b11;
        update.new_nbrs[0].pos = [0.0; 3];
        update.new_nbrs[1].pos = [R, 0.0, 0.0];
        update.record(1, SELF_COL, 100);
        let listening = anchors(&update);
        assert_eq!(listening.len(), 2);
        assert_eq!(listening[0].range, 0.0);

        update.apply_prime_distance(400);
        let measured = anchors(&update);
        assert_eq!(measured.len(), 2);
        assert_eq!(measured[0].range, 400.0 * RADIO_TICK_M);
        assert_eq!(measured[1].range, 500.0 * RADIO_TICK_M);
    }

    #[test]
    fn coplanarity_from_the_lattice() {
        // Cell (0, 0): 18 sits above the prime, 19 below
        assert!(!coplanar(0, [0, 4, 13, 9, 18, 19].iter().copied()));
        assert!(coplanar(0, [0, 4, 13, 9, 19].iter().copied()));
        assert!(coplanar(0, [0, 18, 19].iter().copied()));
        assert!(!coplanar(0, [0, 4, 9, 18].iter().copied()));
    }

    fn beacons() -> [Vector3<f32>; 6] {
        [
            Vector3::zeros(),
            vector(1, R),
            vector(7, R),
            vector(3, R),
            vector(9, R),
            vector(15, R),
        ]
    }

    #[test]
    fn toa_finds_the_point() {
        let target = Vector3::new(0.4, 1.1, 0.3);
        let anchors: heapless::Vec<Anchor, 6> = beacons()
            .iter()
            .enumerate()
            .map(|(i, p)| anchor(i, i as u8, *p, (p - target).norm()))
            .collect();
        let x = toa(&anchors).unwrap();
        assert!(near(&x, &target, 1e-3), "{:?}", x);
        assert_eq!(toa(&anchors[..3]), Err(SolverStatus::SkipNumBeacons));
    }

    #[test]
    fn toa_reports_degenerate_geometry() {
        let anchors: heapless::Vec<Anchor, 6> = (0..4)
            .map(|i| anchor(i, i as u8, Vector3::new(i as f32, 0.0, 0.0), 1.0))
            .collect();
        assert_eq!(toa(&anchors), Err(SolverStatus::ToaNonfinite));
    }

    #[test]
    fn tdoa_finds_the_point() {
        let target = Vector3::new(-0.7, 0.9, -0.4);
        let d0 = target.norm();
        let anchors: heapless::Vec<Anchor, 6> = beacons()
            .iter()
            .enumerate()
            .map(|(i, p)| anchor(i, i as u8, *p, (p - target).norm() - d0))
            .collect();
        let x = tdoa(&anchors, 0.3).unwrap();
        assert!(near(&x, &target, 1e-2), "{:?}", x);
    }

    #[test]
    fn tdoa_rejects_inconsistent_ranges() {
        let target = Vector3::new(-0.7, 0.9, -0.4);
        let d0 = target.norm();
        let mut anchors: heapless::Vec<Anchor, 6> = beacons()
            .iter()
            .enumerate()
            .map(|(i, p)| anchor(i, i as u8, *p, (p - target).norm() - d0))
            .collect();
        anchors[2].range += 2.0;
        anchors[4].range -= 1.5;
        assert_eq!(tdoa(&anchors, 0.3), Err(SolverStatus::SkipInaccurate));
    }

    #[test]
    fn tdoa_needs_the_prime_first() {
        let anchors: heapless::Vec<Anchor, 6> = beacons()
            .iter()
            .enumerate()
            .skip(1)
            .map(|(i, p)| anchor(i, i as u8, *p, 0.0))
            .collect();
        assert_eq!(tdoa(&anchors, 0.3), Err(SolverStatus::SkipNumBeacons));
    }

    #[test]
    fn three_sphere_picks_the_lattice_side() {
        // Beacons 4, 9 and 18 seen from index 0; the lattice puts 18 above
        let target = Vector3::new(0.0, 0.0, 0.0);
        let positions = [vector(1, R), vector(3, R), vector(9, R)];
        let indices = [4u8, 9, 18];
        let anchors: heapless::Vec<Anchor, 6> = positions
            .iter()
            .zip(indices.iter())
            .enumerate()
            .map(|(k, (p, &index))| anchor(k + 1, index, *p, (p - target).norm()))
            .collect();
        let x = three_sphere(&anchors, 0, 0.3).unwrap();
        assert!(near(&x, &target, 1e-3), "{:?}", x);
    }

    #[test]
    fn three_sphere_takes_the_negative_root_when_the_lattice_says_so() {
        // Seen from index 0, beacons 4, 9 and 19 have a negative triple
        // product
        let ideal_triple = triple(&vector(1, 1.0), &vector(3, 1.0), &vector(15, 1.0));
        assert!(ideal_triple < 0.0);

        let target = Vector3::new(0.2, -0.1, 0.15);
        let positions = [vector(1, R), vector(3, R), vector(15, R)];
        let indices = [4u8, 9, 19];
        let anchors: heapless::Vec<Anchor, 6> = positions
            .iter()
            .zip(indices.iter())
            .enumerate()
            .map(|(k, (p, &index))| anchor(k + 1, index, *p, (p - target).norm()))
            .collect();
        let x = three_sphere(&anchors, 0, 0.3).unwrap();
        assert!(near(&x, &target, 1e-3), "{:?}", x);

        let seen = triple(&(positions[0] - x), &(positions[1] - x), &(positions[2] - x));
        assert!(seen < 0.0);
        assert!((lattice::quantize_to_grid(&x, R) - Vector3::zeros()).norm() <= libm::sqrtf(3.0) * R);
    }

    #[test]
    fn three_sphere_rejects_missing_intersection() {
        let positions = [vector(1, R), vector(3, R), vector(9, R)];
        let indices = [4u8, 9, 18];
        let anchors: heapless::Vec<Anchor, 6> = positions
            .iter()
            .zip(indices.iter())
            .enumerate()
            .map(|(k, (p, &index))| anchor(k + 1, index, *p, 0.2))
            .collect();
        assert_eq!(three_sphere(&anchors, 0, 0.3), Err(SolverStatus::ToaNonfinite));
    }

    #[test]
    fn two_circle_bootstrap() {
        let anchors = [
            anchor(0, 0, Vector3::zeros(), 3.0),
            anchor(1, 4, Vector3::new(5.0, 0.0, 0.0), 4.0),
        ];
        assert!(can_bootstrap(9, &anchors));
        let x = bootstrap(9, &anchors).unwrap();
        assert!(near(&x, &Vector3::new(1.8, 2.4, 0.0), 1e-3), "{:?}", x);
        assert_eq!(bootstrap(4, &anchors[..1]), Some(Vector3::new(3.0, 0.0, 0.0)));
        assert_eq!(bootstrap(0, &[]), Some(Vector3::zeros()));
        assert!(!can_bootstrap(13, &anchors[..1]));
        assert!(bootstrap(5, &anchors).is_none());
    }

    #[test]
    fn spring_settles_on_consistent_distances() {
        let target = vector(1, R);
        let anchors: heapless::Vec<Anchor, 6> = beacons()
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != 1)
            .map(|(i, p)| anchor(i, i as u8, *p, (p - target).norm()))
            .collect();
        let config = SpringConfig::default();
        let mut velocity = Vector3::zeros();
        let mut x = target + Vector3::new(0.2, -0.1, 0.1);
        let start_error = (x - target).norm();
        for _ in 0..100 {
            x = spring(&anchors, x, &mut velocity, &config, R).unwrap();
        }
        assert!((x - target).norm() < start_error / 4.0, "{:?}", x);
    }

    #[test]
    fn verify_clears_inconsistent_pairs() {
        let positions = beacons();
        let mut update = LocUpdate::new(0, 0, 6, [0, 4, 13, 9, 18, 19]);
        update.new_nbrhood = 0x7f;
        for (i, p) in positions.iter().enumerate() {
            update.new_nbrs[i].pos = [p.x, p.y, p.z];
        }
        for j in 1..CELL_PARTICIPANTS {
            for i in 0..j {
                let d = (positions[i] - positions[j]).norm();
                let skew = if j == 5 { 1.0 } else { 0.0 };
                update.record(i, j, libm::roundf((d + skew) / RADIO_TICK_M) as i64);
            }
        }
        // A pseudorange is never checked
        update.record(1, SELF_COL, 12345);
        verify_distances(&mut update, None, 0.3, RADIO_TICK_M);

        for i in 0..5 {
            assert!(!update.is_adj(i, 5));
        }
        assert!(update.is_adj(0, 1));
        assert!(update.is_adj(3, 4));
        assert!(update.is_adj(1, SELF_COL));
    }

    #[test]
    fn verify_drops_a_node_that_never_checks_out() {
        let positions = beacons();
        let mut update = LocUpdate::new(0, 0, 6, [0, 4, 13, 9, 18, 19]);
        update.new_nbrhood = 0x7f;
        for (i, p) in positions.iter().enumerate() {
            update.new_nbrs[i].pos = [p.x, p.y, p.z];
        }
        update.new_nbrs[2].pos = [f32::NAN; 3];
        for j in 1..CELL_PARTICIPANTS {
            for i in 0..j {
                let d = (positions[i] - positions[j]).norm();
                let skew = if i == 4 || j == 4 { 0.8 } else { 0.0 };
                update.record(i, j, libm::roundf((d + skew) / RADIO_TICK_M) as i64);
            }
        }
        verify_distances(&mut update, None, 0.3, RADIO_TICK_M);
        for i in 0..CELL_PARTICIPANTS {
            assert!(!update.is_adj(i, 4));
        }
        // Unverifiable pairs stay
        assert!(update.is_adj(1, 2));
        assert!(update.is_adj(0, 3));
    }
}
