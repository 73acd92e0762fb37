//! Cooperative self-localization
//!
//! [`Location`] is the per-node state machine. Once started it plans each
//! location cell ([`Location::plan_cell`]), the cell itself runs in
//! [`engine`], and the collected [`LocUpdate`] comes back as
//! [`LocEvent::CellDone`]. Every update refreshes the neighbor table, feeds the
//! beacon's back-off, may move our position estimate and may change the
//! lattice index we apply for.
//!
//! The state machine never touches the radio or the timeslot grid itself.
//! What it needs from them is returned as [`Command`]s.

pub mod beacons;
pub mod engine;
pub mod neighbors;
pub mod solver;
pub mod update;

#[cfg(test)]
mod sim;

use heapless::Vec;
use nalgebra::Vector3;
use rand_core::RngCore;

pub use self::{
    engine::{run_cell, CellPlan, CellRun, CellTiming},
    neighbors::{Neighbor, NeighborTable},
    solver::{Method, SolverStatus},
    update::LocUpdate,
};
use self::{
    solver::Selection,
    update::{NUM_POSITIONS, RADIO_TICK_M},
};
use crate::{
    beacon::{Beacon, BeaconEvent, BeaconState},
    config::LocConfig,
    debug,
    filter::PositionFilter,
    frame::BeaconPayload,
    info,
    lattice::{self, CELL_PARTICIPANTS, NO_OFFSET, NUM_DIRS},
    warn,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LocState {
    /// Not taking part, no location slots
    Init,
    /// Collecting neighbors
    SearchNbrhd,
    Search,
    /// Waiting for the distance to the prime
    MeasureDist,
    Joined,
}

#[derive(Clone, Debug)]
pub enum LocEvent {
    Start,
    /// Start as the origin of the network
    StartRoot,
    Stop,
    CellDone(LocUpdate),
    /// A location cell passed without us taking part
    CellSkip,
    /// Our location became known by other means
    Joined,
    /// Time of flight to `dest`, in radio ticks
    DistMeasured { dest: u64, tof: i32 },
}

/// What the state machine needs done outside of it
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    AddLocationSlots,
    RemoveLocationSlots,
    /// Start two-way ranging with `dest`
    StartRanging { dest: u64 },
    StopRanging,
}

pub type Commands = Vec<Command, 4>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Watchdog {
    MeasureDist,
    Update,
}

pub struct Location {
    config: LocConfig,
    state: LocState,
    class: u8,
    root: bool,
    beacon: Beacon,
    neighbors: NeighborTable,
    filter: PositionFilter,
    velocity: Vector3<f32>,
    /// Cells spent in `SearchNbrhd`
    search_count: u8,
    seq: u8,
    /// Update waiting for the distance to its prime
    pending: Option<LocUpdate>,
    /// Pending watchdog and its deadline in milliseconds
    timeout: Option<(Watchdog, u64)>,
    status: SolverStatus,
}

impl Location {
    pub fn new(config: LocConfig, class: u8) -> Self {
        Location {
            state: LocState::Init,
            class,
            root: false,
            beacon: Beacon::default(),
            neighbors: NeighborTable::new(config.nbr_drop_max),
            filter: PositionFilter::new(config.filter_alpha),
            velocity: Vector3::zeros(),
            search_count: 0,
            seq: 0,
            pending: None,
            timeout: None,
            status: SolverStatus::NotUpdated,
            config,
        }
    }

    pub fn config(&self) -> &LocConfig {
        &self.config
    }

    pub fn state(&self) -> LocState {
        self.state
    }

    pub fn is_root(&self) -> bool {
        self.root
    }

    /// Filtered position, `None` while unknown
    pub fn location(&self) -> Option<Vector3<f32>> {
        self.filter.value()
    }

    pub fn beacon(&self) -> &Beacon {
        &self.beacon
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    /// The update held while measuring the distance to its prime
    pub fn pending(&self) -> Option<&LocUpdate> {
        self.pending.as_ref()
    }

    /// Outcome of the last location update
    pub fn last_status(&self) -> SolverStatus {
        self.status
    }

    /// Deadline of the pending watchdog, in milliseconds
    pub fn deadline_ms(&self) -> Option<u64> {
        self.timeout.map(|(_, deadline)| deadline)
    }

    pub fn timing(&self) -> CellTiming {
        CellTiming::from(&self.config)
    }

    /// Passes an event straight to the beacon, e.g. to force an index
    pub fn beacon_event<G: RngCore>(&mut self, event: BeaconEvent, rng: &mut G) {
        self.beacon.handle(event, rng, self.config.lattice_r);
    }

    fn set_state(&mut self, state: LocState) {
        if state != self.state {
            info!("location {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    pub fn handle<G: RngCore>(&mut self, event: LocEvent, now_ms: u64, rng: &mut G) -> Commands {
        let mut commands = Commands::new();
        let r = self.config.lattice_r;
        match event {
            LocEvent::Start if self.state == LocState::Init => {
                let _ = commands.push(Command::AddLocationSlots);
                self.enter_search_nbrhd();
            }
            LocEvent::StartRoot if self.state == LocState::Init => {
                let _ = commands.push(Command::AddLocationSlots);
                self.root = true;
                self.filter.set(&Vector3::zeros());
                self.velocity = Vector3::zeros();
                self.beacon.handle(BeaconEvent::Start { index: 0, distance: 0.0 }, rng, r);
                self.beacon.handle(BeaconEvent::Joined, rng, r);
                self.enter_joined(now_ms);
            }
            LocEvent::Stop if self.state != LocState::Init => {
                if self.state == LocState::MeasureDist {
                    let _ = commands.push(Command::StopRanging);
                }
                let _ = commands.push(Command::RemoveLocationSlots);
                self.beacon.handle(BeaconEvent::Stop, rng, r);
                self.root = false;
                self.forget();
                self.pending = None;
                self.timeout = None;
                self.set_state(LocState::Init);
            }
            LocEvent::CellDone(update) if self.state != LocState::Init => {
                self.cell_done(update, now_ms, rng, &mut commands);
            }
            LocEvent::CellSkip if self.state == LocState::SearchNbrhd => self.count_search_cell(),
            LocEvent::Joined if self.state == LocState::SearchNbrhd => self.enter_joined(now_ms),
            LocEvent::DistMeasured { dest, tof } if self.state == LocState::MeasureDist => {
                self.dist_measured(dest, tof, now_ms, &mut commands);
            }
            _ => debug!("event ignored in {:?}", self.state),
        }
        commands
    }

    /// Fires the pending watchdog if `now_ms` is past its deadline
    pub fn poll_timeout<G: RngCore>(&mut self, now_ms: u64, rng: &mut G) -> Commands {
        let mut commands = Commands::new();
        match self.timeout {
            Some((Watchdog::MeasureDist, deadline)) if now_ms >= deadline => {
                info!("distance measurement timed out");
                let _ = commands.push(Command::StopRanging);
                self.enter_search();
            }
            Some((Watchdog::Update, deadline)) if now_ms >= deadline => {
                warn!("no location update for {} ms", self.config.update_timeout_ms);
                self.lose(rng);
            }
            _ => {}
        }
        commands
    }

    /// Prepares location slot `slot` at absolute slot number `asn`
    ///
    /// Returns `None` when we sit the cell out: not started yet, or joined
    /// and not one of its participants.
    pub fn plan_cell(&mut self, asn: u64, numslots: u16, slot: u8, address: u64) -> Option<CellPlan> {
        if self.state == LocState::Init {
            return None;
        }
        let dir = (asn.checked_div(numslots as u64)? % NUM_DIRS as u64) as u8;
        let indices = *lattice::participants(dir, slot)?;
        let offset = self
            .beacon
            .index()
            .map_or(NO_OFFSET, |index| lattice::offset_in_cell(index, dir, slot));
        if self.state == LocState::Joined && offset >= NO_OFFSET {
            return None;
        }

        let shouldtx = offset < NO_OFFSET && self.beacon.try_tx();
        self.seq = self.seq.wrapping_add(1);
        let pos = self.filter.value().map_or([f32::NAN; 3], |p| [p.x, p.y, p.z]);
        let neighbors = &self.neighbors;
        Some(CellPlan {
            dir,
            slot,
            offset,
            shouldtx,
            indices,
            address,
            seq: self.seq,
            payload: BeaconPayload {
                class: self.class,
                dir,
                slot,
                offset,
                pos,
                r: f32::NAN,
                t: f32::NAN,
                nbrhood: neighbors.all_mask(),
                entries: Vec::new(),
            },
            table: core::array::from_fn(|i| neighbors.address(indices[i])),
            transmitted_before: self.beacon.transmitted(slot, dir),
        })
    }

    fn enter_search_nbrhd(&mut self) {
        self.search_count = 0;
        self.pending = None;
        self.timeout = None;
        self.set_state(LocState::SearchNbrhd);
    }

    fn enter_search(&mut self) {
        self.pending = None;
        self.timeout = None;
        self.set_state(LocState::Search);
    }

    fn enter_joined(&mut self, now_ms: u64) {
        self.pending = None;
        self.timeout = if self.root {
            None
        } else {
            Some((Watchdog::Update, now_ms + self.config.update_timeout_ms as u64))
        };
        self.set_state(LocState::Joined);
    }

    fn enter_measure_dist(&mut self, update: LocUpdate, now_ms: u64, commands: &mut Commands) {
        let dest = update.new_nbrs[0].addr;
        info!("measuring the distance to prime {:x}", dest);
        self.pending = Some(update);
        self.timeout = Some((Watchdog::MeasureDist, now_ms + self.config.measure_dist_timeout_ms as u64));
        let _ = commands.push(Command::StartRanging { dest });
        self.set_state(LocState::MeasureDist);
    }

    fn count_search_cell(&mut self) {
        self.search_count = self.search_count.saturating_add(1);
        if self.search_count >= self.config.search_nbrhd_count {
            self.enter_search();
        }
    }

    /// Drops everything we learnt about our surroundings
    fn forget(&mut self) {
        self.neighbors.clear();
        self.filter.clear();
        self.velocity = Vector3::zeros();
        self.search_count = 0;
    }

    fn lose<G: RngCore>(&mut self, rng: &mut G) {
        warn!("location lost");
        self.beacon.handle(BeaconEvent::Stop, rng, self.config.lattice_r);
        self.forget();
        self.enter_search_nbrhd();
    }

    fn cell_done<G: RngCore>(&mut self, mut update: LocUpdate, now_ms: u64, rng: &mut G, commands: &mut Commands) {
        update.prepare_tstamps();
        let outliers = self.find_outliers(&update);
        self.update_neighbors(&update, outliers);
        exclude(&mut update, outliers);
        self.check_consistency(rng);
        self.update_backoff(&update, rng);

        match self.state {
            LocState::Init | LocState::MeasureDist => {}
            LocState::SearchNbrhd => {
                if self.update_location(&mut update) == SolverStatus::Updated {
                    self.enter_joined(now_ms);
                } else {
                    self.count_search_cell();
                }
            }
            LocState::Search => {
                let status = self.update_location(&mut update);
                self.update_beacon(rng);
                let inaccurate = matches!(status, SolverStatus::SkipInaccurate | SolverStatus::TdoaNonfinite);
                if status == SolverStatus::Updated {
                    self.enter_joined(now_ms);
                } else if inaccurate && update.heard(0) && update.same_prime_count() >= 3 {
                    self.enter_measure_dist(update, now_ms, commands);
                }
            }
            LocState::Joined => {
                if !self.root && self.update_location(&mut update) == SolverStatus::Updated {
                    self.enter_joined(now_ms);
                }
                self.update_beacon(rng);
                if !self.root && !self.filter.is_set() && self.neighbors.count_all() < 4 {
                    self.lose(rng);
                }
            }
        }
    }

    /// Participants whose reported position can't be right
    ///
    /// Reported positions are snapped to their lattice points first. A located
    /// node rejects those farther than the outlier radius from its own lattice
    /// point. Otherwise, if a strict majority of the snapped positions lie
    /// within the radius of one of them, the rest are rejected.
    fn find_outliers(&self, update: &LocUpdate) -> u8 {
        let (r, radius) = (self.config.lattice_r, self.config.outlier_radius());
        let mut positions = [None; CELL_PARTICIPANTS];
        for (i, position) in positions.iter_mut().enumerate() {
            if update.heard(i) {
                *position = update.new_nbrs[i].position().map(|p| lattice::quantize_to_grid(&p, r));
            }
        }
        let within = |center: &Vector3<f32>| {
            let mut mask = 0u8;
            for (i, position) in positions.iter().enumerate() {
                if let Some(p) = position {
                    if (p - center).norm() <= radius {
                        mask |= 1 << i;
                    }
                }
            }
            mask
        };
        let located = mask_of(&positions);

        let outliers = match self.filter.value() {
            Some(own) => located & !within(&lattice::quantize_to_grid(&own, r)),
            None => {
                let cluster = positions
                    .iter()
                    .flatten()
                    .map(|p| within(p))
                    .max_by_key(|mask| mask.count_ones())
                    .unwrap_or(0);
                if cluster.count_ones() * 2 > located.count_ones() {
                    located & !cluster
                } else {
                    0
                }
            }
        };
        if outliers != 0 {
            info!("outliers at offsets {:#b}", outliers);
        }
        outliers
    }

    fn update_neighbors(&mut self, update: &LocUpdate, outliers: u8) {
        for (i, &index) in update.indices.iter().enumerate() {
            if i == update.offset as usize {
                continue;
            }
            if update.heard(i) {
                self.neighbors.update(index, update.new_nbrs[i], outliers & 1 << i == 0);
            } else {
                self.neighbors.miss(index);
            }
        }
    }

    /// Starts over when most neighbors disagree with our position
    fn check_consistency<G: RngCore>(&mut self, rng: &mut G) {
        if self.root || !self.filter.is_set() {
            return;
        }
        if self.neighbors.count_local() * 2 < self.neighbors.count_all() {
            warn!(
                "position disagrees with {} of {} neighbors",
                self.neighbors.count_all() - self.neighbors.count_local(),
                self.neighbors.count_all()
            );
            self.beacon.handle(BeaconEvent::Stop, rng, self.config.lattice_r);
            self.forget();
        }
    }

    fn update_backoff<G: RngCore>(&mut self, update: &LocUpdate, rng: &mut G) {
        if update.offset >= NO_OFFSET {
            return;
        }
        if update.conflicts != 0 {
            self.beacon.fail(rng);
        } else if update.shouldtx {
            self.beacon.success();
            if self.beacon.state() == BeaconState::Joining && self.state == LocState::Joined {
                self.beacon.handle(BeaconEvent::Joined, rng, self.config.lattice_r);
            }
        }
        if update.shouldtx {
            self.beacon.record_tx(update.slot, update.dir);
        } else {
            self.beacon.clear_tx(update.slot, update.dir);
        }
    }

    fn update_beacon<G: RngCore>(&mut self, rng: &mut G) {
        if self.root {
            return;
        }
        let r = self.config.lattice_r;
        match self.filter.value() {
            Some(pos) => {
                for event in beacons::optimize_beacons(&pos, &self.neighbors, &self.config) {
                    self.beacon.handle(event, rng, r);
                }
            }
            None if !self.beacon.is_active() => {
                if let Some(event) = beacons::join_beacons(&self.neighbors, &self.config) {
                    self.beacon.handle(event, rng, r);
                }
            }
            None => {}
        }
    }

    fn update_location(&mut self, update: &mut LocUpdate) -> SolverStatus {
        let status = if lattice::participants(update.dir, update.slot).is_none() {
            SolverStatus::SkipInvalidDirSlot
        } else {
            let own = match self.state {
                LocState::Joined => self.filter.value(),
                _ => None,
            };
            solver::verify_distances(update, own, self.config.fixed_threshold, RADIO_TICK_M);
            self.solve(update)
        };
        debug!("location update: {:?}", status);
        self.status = status;
        status
    }

    fn solve(&mut self, update: &LocUpdate) -> SolverStatus {
        let anchors = solver::anchors(update);
        let distances = update.shouldtx || update.measured;
        let bindex = self.beacon.index();
        let located = self.filter.value();
        let beaconing = matches!(self.beacon.state(), BeaconState::Joined | BeaconState::Forced);
        let selection = Selection {
            spring: beaconing && located.is_some() && distances && anchors.len() >= 3,
            distances,
            mutual: 1 + anchors.len(),
            coplanar: solver::coplanar(update.indices[0], anchors.iter().map(|a| a.index).chain(bindex)),
            has_prime: anchors.iter().any(|a| a.offset == 0),
            has_bindex: bindex.is_some(),
            bootstrap: distances
                && self.neighbors.count_all() < 4
                && bindex.map_or(false, |index| solver::can_bootstrap(index, &anchors)),
        };
        let method = match solver::select(&selection) {
            Ok(method) => method,
            Err(status) => return status,
        };

        let threshold = self.config.fixed_threshold;
        let found = match (method, located, bindex) {
            (Method::Spring, Some(start), _) => solver::spring(
                &anchors,
                start,
                &mut self.velocity,
                &self.config.spring,
                self.config.lattice_r,
            )
            .ok_or_else(|| method.nonfinite()),
            (Method::Toa, _, _) => solver::toa(&anchors),
            (Method::Tdoa, _, _) => solver::tdoa(&anchors, threshold),
            (Method::ThreeSphere, _, Some(index)) => solver::three_sphere(&anchors, index, threshold),
            (Method::Bootstrap, _, Some(index)) => {
                solver::bootstrap(index, &anchors).ok_or_else(|| method.nonfinite())
            }
            _ => Err(SolverStatus::NotUpdated),
        };
        match found {
            Ok(candidate) => self.publish(&candidate, method),
            Err(status) => status,
        }
    }

    fn publish(&mut self, candidate: &Vector3<f32>, method: Method) -> SolverStatus {
        let snap = !self.filter.is_set();
        match self.filter.update(candidate) {
            Some(p) => {
                if snap {
                    self.velocity = Vector3::zeros();
                }
                debug!("{:?} fix ({}, {}, {})", method, p.x, p.y, p.z);
                SolverStatus::Updated
            }
            None => method.nonfinite(),
        }
    }

    fn dist_measured(&mut self, dest: u64, tof: i32, now_ms: u64, commands: &mut Commands) {
        let mut update = match self.pending.take() {
            Some(update) => update,
            None => return,
        };
        let prime = update.new_nbrs[0].addr;
        if dest != prime {
            warn!("distance to {:x} while measuring {:x}", dest, prime);
            self.pending = Some(update);
            return;
        }

        update.apply_prime_distance(tof);
        solver::verify_distances(&mut update, None, self.config.fixed_threshold, RADIO_TICK_M);
        let status = self.solve(&update);
        debug!("location update with prime distance: {:?}", status);
        self.status = status;
        let _ = commands.push(Command::StopRanging);
        if status == SolverStatus::Updated {
            self.enter_joined(now_ms);
        } else {
            self.enter_search();
        }
    }
}

fn mask_of(positions: &[Option<Vector3<f32>>; CELL_PARTICIPANTS]) -> u8 {
    positions
        .iter()
        .enumerate()
        .filter(|(_, p)| p.is_some())
        .fold(0, |mask, (i, _)| mask | 1 << i)
}

/// Keeps outliers out of solving
fn exclude(update: &mut LocUpdate, outliers: u8) {
    for i in 0..CELL_PARTICIPANTS {
        if outliers & 1 << i != 0 {
            update.new_nbrs[i].pos = [f32::NAN; 3];
            for other in 0..NUM_POSITIONS {
                update.set_adj(i, other, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::{rngs::SmallRng, SeedableRng};

    use crate::{
        lattice::vector,
        location::update::{SELF_COL, RADIO_TICK_M},
    };

    const R: f32 = 2.5;
    const CELL: [u8; CELL_PARTICIPANTS] = [0, 4, 13, 9, 18, 19];

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(7)
    }

    fn ticks(d: f32) -> i64 {
        libm::roundf(d / RADIO_TICK_M) as i64
    }

    /// Raw update of a node at `target` that listened to a full cell (0, 0)
    /// with its beacons on their ideal points; `skew` meters are added to the
    /// pseudorange through the last participant
    fn listener_cell(target: Vector3<f32>, skew: f32) -> LocUpdate {
        let positions: [Vector3<f32>; CELL_PARTICIPANTS] =
            core::array::from_fn(|i| lattice::relative_position(0, CELL[i], R).unwrap());
        let d = |i: usize, j: usize| (positions[i] - positions[j]).norm();
        let mut update = LocUpdate::new(0, 0, NO_OFFSET, CELL);
        update.synced = true;
        update.new_nbrhood |= 0x3f;
        update.same_prime = 0x3f;
        for (i, p) in positions.iter().enumerate() {
            update.new_nbrs[i] = Neighbor {
                addr: 0x100 + i as u64,
                pos: [p.x, p.y, p.z],
                ..Neighbor::default()
            };
        }
        for j in 1..CELL_PARTICIPANTS {
            update.record(0, j, ticks(2.0 * d(0, j)));
            for i in 1..j {
                update.record(i, j, ticks(d(i, j) + d(0, i) - d(0, j)));
            }
            let skew = if j == CELL_PARTICIPANTS - 1 { skew } else { 0.0 };
            let range = (positions[j] - target).norm() - target.norm();
            update.record(j, SELF_COL, ticks(d(0, j) + range + skew));
        }
        update
    }

    fn searching() -> Location {
        let mut location = Location::new(LocConfig::default(), 0);
        let mut rng = rng();
        location.handle(LocEvent::Start, 0, &mut rng);
        for _ in 0..16 {
            location.handle(LocEvent::CellSkip, 0, &mut rng);
        }
        assert_eq!(location.state(), LocState::Search);
        location
    }

    #[test]
    fn root_starts_joined_at_the_origin() {
        let mut location = Location::new(LocConfig::default(), 0);
        let commands = location.handle(LocEvent::StartRoot, 0, &mut rng());
        assert_eq!(commands.as_slice(), &[Command::AddLocationSlots]);
        assert_eq!(location.state(), LocState::Joined);
        assert!(location.is_root());
        assert_eq!(location.location(), Some(Vector3::zeros()));
        assert_eq!(location.beacon().state(), BeaconState::Joined);
        assert_eq!(location.beacon().index(), Some(0));
        assert_eq!(location.deadline_ms(), None);
    }

    #[test]
    fn start_and_stop() {
        let mut location = Location::new(LocConfig::default(), 0);
        let mut rng = rng();
        assert!(location.plan_cell(2, 40, 0, 0xa).is_none());
        assert_eq!(location.handle(LocEvent::Start, 0, &mut rng).as_slice(), &[Command::AddLocationSlots]);
        assert_eq!(location.state(), LocState::SearchNbrhd);
        assert!(location.handle(LocEvent::Start, 0, &mut rng).is_empty());
        assert_eq!(
            location.handle(LocEvent::Stop, 0, &mut rng).as_slice(),
            &[Command::RemoveLocationSlots]
        );
        assert_eq!(location.state(), LocState::Init);
        assert!(location.handle(LocEvent::Stop, 0, &mut rng).is_empty());
    }

    #[test]
    fn search_counts_skipped_and_done_cells() {
        let mut location = Location::new(LocConfig::default(), 0);
        let mut rng = rng();
        location.handle(LocEvent::Start, 0, &mut rng);
        for _ in 0..8 {
            location.handle(LocEvent::CellSkip, 0, &mut rng);
        }
        for _ in 0..7 {
            location.handle(LocEvent::CellDone(LocUpdate::new(0, 1, NO_OFFSET, [1, 5, 7, 8, 6, 17])), 0, &mut rng);
        }
        assert_eq!(location.state(), LocState::SearchNbrhd);
        location.handle(LocEvent::CellSkip, 0, &mut rng);
        assert_eq!(location.state(), LocState::Search);
    }

    #[test]
    fn plans_cells_by_direction_and_index() {
        let mut location = Location::new(LocConfig::default(), 3);
        let mut rng = rng();
        location.handle(LocEvent::Start, 0, &mut rng);
        location.beacon_event(BeaconEvent::ForceIndex(9), &mut rng);

        let plan = location.plan_cell(2, 40, 0, 0xa).unwrap();
        assert_eq!((plan.dir, plan.slot, plan.offset), (0, 0, 3));
        assert!(plan.shouldtx);
        assert_eq!(plan.indices, CELL);
        assert_eq!(plan.payload.class, 3);
        assert!(plan.payload.pos[0].is_nan());

        // Direction 1, slot 2: [2, 13, 4, 10, 18, 19]
        let plan = location.plan_cell(40 + 22, 40, 2, 0xa).unwrap();
        assert_eq!(plan.dir, 1);
        assert_eq!(plan.offset, NO_OFFSET);
        assert!(!plan.shouldtx);
        assert!(location.plan_cell(2, 0, 0, 0xa).is_none());

        location.handle(LocEvent::Joined, 0, &mut rng);
        assert!(location.plan_cell(40 + 22, 40, 2, 0xa).is_none());
        assert!(location.plan_cell(2, 40, 0, 0xa).is_some());
    }

    #[test]
    fn listener_fix_from_pseudoranges() {
        let mut location = searching();
        let target = Vector3::new(0.6, 1.3, 0.2);
        location.handle(LocEvent::CellDone(listener_cell(target, 0.0)), 100, &mut rng());
        assert_eq!(location.last_status(), SolverStatus::Updated);
        assert_eq!(location.state(), LocState::Joined);
        let fix = location.location().unwrap();
        assert!((fix - target).norm() < 0.05, "{:?}", fix);
        assert_eq!(location.deadline_ms(), Some(100 + 60_000));
    }

    #[test]
    fn inaccurate_tdoa_hands_over_to_ranging() {
        let mut location = searching();
        let mut rng = rng();
        let target = Vector3::new(0.6, 1.3, 0.2);

        let commands = location.handle(LocEvent::CellDone(listener_cell(target, 1.0)), 0, &mut rng);
        assert_eq!(location.last_status(), SolverStatus::SkipInaccurate);
        assert_eq!(location.state(), LocState::MeasureDist);
        assert_eq!(commands.as_slice(), &[Command::StartRanging { dest: 0x100 }]);
        let pseudorange = location.pending().unwrap().tstamp(1, SELF_COL);

        // Cells only refresh neighbors meanwhile
        location.handle(LocEvent::CellDone(listener_cell(target, 1.0)), 10, &mut rng);
        assert_eq!(location.state(), LocState::MeasureDist);

        let tof = ticks(target.norm()) as i32;
        let commands = location.handle(LocEvent::DistMeasured { dest: 0x101, tof }, 20, &mut rng);
        assert!(commands.is_empty());
        assert_eq!(location.state(), LocState::MeasureDist);
        assert_eq!(location.pending().unwrap().tstamp(1, SELF_COL), pseudorange);

        let commands = location.handle(LocEvent::DistMeasured { dest: 0x100, tof }, 30, &mut rng);
        assert_eq!(commands.as_slice(), &[Command::StopRanging]);
        assert_eq!(location.last_status(), SolverStatus::Updated);
        assert_eq!(location.state(), LocState::Joined);
        assert!(location.location().is_some());
    }

    #[test]
    fn distance_measurement_times_out() {
        let mut location = searching();
        let mut rng = rng();
        location.handle(
            LocEvent::CellDone(listener_cell(Vector3::new(0.6, 1.3, 0.2), 1.0)),
            1_000,
            &mut rng,
        );
        assert_eq!(location.state(), LocState::MeasureDist);
        assert!(location.poll_timeout(30_999, &mut rng).is_empty());
        assert_eq!(location.poll_timeout(31_000, &mut rng).as_slice(), &[Command::StopRanging]);
        assert_eq!(location.state(), LocState::Search);
        assert!(location.pending().is_none());
        assert_eq!(location.deadline_ms(), None);
    }

    #[test]
    fn watchdog_loses_a_silent_node() {
        let mut location = Location::new(LocConfig::default(), 0);
        let mut rng = rng();
        location.handle(LocEvent::Start, 0, &mut rng);
        location.handle(LocEvent::Joined, 500, &mut rng);
        assert_eq!(location.state(), LocState::Joined);
        assert!(location.poll_timeout(60_499, &mut rng).is_empty());
        assert_eq!(location.state(), LocState::Joined);
        location.poll_timeout(60_500, &mut rng);
        assert_eq!(location.state(), LocState::SearchNbrhd);
        assert_eq!(location.beacon().state(), BeaconState::Silent);
    }

    #[test]
    fn joined_without_location_or_neighbors_is_lost() {
        let mut location = Location::new(LocConfig::default(), 0);
        let mut rng = rng();
        location.handle(LocEvent::Start, 0, &mut rng);
        location.handle(LocEvent::Joined, 0, &mut rng);
        location.beacon_event(BeaconEvent::SetIndex(9), &mut rng);
        location.handle(LocEvent::CellDone(LocUpdate::new(0, 0, 3, CELL)), 0, &mut rng);
        assert_eq!(location.state(), LocState::SearchNbrhd);
    }

    #[test]
    fn neighbor_dropped_after_six_silent_cells() {
        // Index 7 transmits at offset 1 of cell (0, 3)
        let mut location = Location::new(LocConfig::default(), 0);
        let mut rng = rng();
        location.handle(LocEvent::Start, 0, &mut rng);
        let indices = [3, 7, 5, 11, 15, 16];
        for _ in 0..10 {
            let mut update = LocUpdate::new(0, 3, NO_OFFSET, indices);
            update.new_nbrhood |= 1 << 1;
            update.new_nbrs[1].addr = 0x77;
            location.handle(LocEvent::CellDone(update), 0, &mut rng);
        }
        assert_eq!(location.neighbors().find(0x77), Some(7));
        for miss in 1..6 {
            location.handle(LocEvent::CellDone(LocUpdate::new(0, 3, NO_OFFSET, indices)), 0, &mut rng);
            assert_eq!(location.neighbors().dropcount(7), miss);
            assert_ne!(location.neighbors().all_mask() & 1 << 7, 0);
        }
        location.handle(LocEvent::CellDone(LocUpdate::new(0, 3, NO_OFFSET, indices)), 0, &mut rng);
        assert_eq!(location.neighbors().dropcount(7), 6);
        assert_eq!(location.neighbors().all_mask() & 1 << 7, 0);
        assert_eq!(location.neighbors().local_mask() & 1 << 7, 0);
    }

    #[test]
    fn conflicts_back_off_and_clean_cells_recover() {
        let mut location = Location::new(LocConfig::default(), 0);
        let mut rng = rng();
        location.handle(LocEvent::Start, 0, &mut rng);
        location.beacon_event(BeaconEvent::ForceIndex(9), &mut rng);

        let mut update = LocUpdate::new(0, 0, 3, CELL);
        update.shouldtx = true;
        update.conflicts = 1;
        location.handle(LocEvent::CellDone(update.clone()), 0, &mut rng);
        assert_eq!(location.beacon().backoff().limit(), 2);
        assert!(location.beacon().transmitted(0, 0));

        update.conflicts = 0;
        location.handle(LocEvent::CellDone(update.clone()), 0, &mut rng);
        assert_eq!(location.beacon().backoff().limit(), 1);

        update.shouldtx = false;
        location.handle(LocEvent::CellDone(update), 0, &mut rng);
        assert!(!location.beacon().transmitted(0, 0));
    }

    #[test]
    fn outliers_are_kept_out_of_solving() {
        let mut location = searching();
        let mut update = listener_cell(Vector3::new(0.6, 1.3, 0.2), 0.0);
        let far = vector(1, R) * 6.0;
        update.new_nbrs[2].pos = [far.x, far.y, far.z];
        update.prepare_tstamps();
        let outliers = location.find_outliers(&update);
        assert_eq!(outliers, 1 << 2);

        location.update_neighbors(&update, outliers);
        assert_eq!(location.neighbors().local_mask() & 1 << 13, 0);
        assert_ne!(location.neighbors().all_mask() & 1 << 13, 0);

        exclude(&mut update, outliers);
        assert!(update.new_nbrs[2].position().is_none());
        assert!(!update.is_adj(2, SELF_COL));
        assert!(!update.is_adj(0, 2));

        // Seen from a located node only the distance to its lattice point
        // matters
        location.filter.set(&Vector3::new(0.1, 0.1, 0.0));
        assert_eq!(location.find_outliers(&listener_cell(Vector3::zeros(), 0.0)), 0);
        location.filter.set(&(vector(1, R) * 2.0));
        assert_eq!(location.find_outliers(&listener_cell(Vector3::zeros(), 0.0)), 0b11_1111 & !(1 << 1));
    }

    #[test]
    fn outliers_are_judged_by_lattice_point() {
        let mut location = searching();
        location.filter.set(&Vector3::zeros());
        let mut update = listener_cell(Vector3::zeros(), 0.0);
        // 3.9 m out, but its lattice point is two cells away
        update.new_nbrs[1].pos = [3.9, 0.0, 0.0];
        // 4.38 m out, snapping to the diagonal neighbor at 3.54 m
        update.new_nbrs[2].pos = [3.1, 3.1, 0.0];
        assert_eq!(location.find_outliers(&update), 1 << 1);

        // Without a position of our own the snapped cluster decides
        location.filter.clear();
        let mut update = listener_cell(Vector3::zeros(), 0.0);
        update.new_nbrs[2].pos = [3.1, 3.1, 0.0];
        assert_eq!(location.find_outliers(&update), 0);
        update.new_nbrs[2].pos = [9.9, 0.0, 0.0];
        assert_eq!(location.find_outliers(&update), 1 << 2);
    }

    /// Cell (0, 0) as index 9 transmitting at offset 3, 3 m from the prime at
    /// the origin and 4 m from index 4 on the x axis
    fn two_circle_cell() -> LocUpdate {
        let mut update = LocUpdate::new(0, 0, 3, CELL);
        update.shouldtx = true;
        update.synced = true;
        update.new_nbrhood |= 0b1011;
        update.same_prime = 0b1011;
        for &(i, x) in [(0, 0.0), (1, 5.0)].iter() {
            update.new_nbrs[i] = Neighbor {
                addr: 0x100 + i as u64,
                pos: [x, 0.0, 0.0],
                ..Neighbor::default()
            };
        }
        let (d0, d4, span) = (ticks(3.0), ticks(4.0), ticks(5.0));
        update.record(0, 1, 2 * span);
        update.record(0, 3, 2 * d0);
        update.record(1, SELF_COL, d4 + span - d0);
        update
    }

    #[test]
    fn two_circle_fix_settles_over_identical_cells() {
        let mut location = searching();
        let mut rng = rng();
        location.beacon_event(BeaconEvent::ForceIndex(9), &mut rng);

        location.handle(LocEvent::CellDone(two_circle_cell()), 0, &mut rng);
        assert_eq!(location.last_status(), SolverStatus::Updated);
        assert_eq!(location.state(), LocState::Joined);
        let fix = location.location().unwrap();
        assert!((fix.x - 1.8).abs() < 1e-2, "{:?}", fix);
        assert!((fix.y - 2.4).abs() < 1e-2, "{:?}", fix);
        assert_eq!(fix.z, 0.0);

        for now in 1..50 {
            location.handle(LocEvent::CellDone(two_circle_cell()), now * 10, &mut rng);
            assert_eq!(location.last_status(), SolverStatus::Updated);
        }
        // Both circles at tick resolution
        let d0 = ticks(3.0) as f32 * RADIO_TICK_M;
        let d4 = ticks(4.0) as f32 * RADIO_TICK_M;
        let x = (d0 * d0 - d4 * d4 + 25.0) / 10.0;
        let y = libm::sqrtf(d0 * d0 - x * x);
        let fix = location.location().unwrap();
        assert!((fix - Vector3::new(x, y, 0.0)).norm() < 1e-3, "{:?}", fix);
        assert_eq!(location.state(), LocState::Joined);
    }

    #[test]
    fn four_coplanar_beacons_cant_place_a_listener() {
        let mut location = searching();
        let mut update = listener_cell(Vector3::new(0.6, 1.3, 0.2), 0.0);
        // Only the z = 0 sheet is heard: indices 0, 4, 13 and 9
        update.new_nbrhood &= !0b11_0000;
        update.same_prime = 0b1111;
        location.handle(LocEvent::CellDone(update), 0, &mut rng());
        assert_eq!(location.last_status(), SolverStatus::SkipNumBeacons);
        assert_eq!(location.state(), LocState::Search);
        assert!(location.pending().is_none());
        assert!(location.location().is_none());
    }
}
