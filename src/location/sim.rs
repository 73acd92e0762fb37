//! Location cells over a simulated channel
//!
//! Every node has its own clock, `offset` ticks ahead of the shared one and
//! running `drift` fast, and its own radio. Frames arrive after the time of
//! flight between the true positions; two frames in one receive window
//! destroy each other.

use std::{cell::RefCell, rc::Rc, vec::Vec};

use dw1000::time::{Duration, Instant};
use nalgebra::Vector3;
use rand::{rngs::SmallRng, SeedableRng};

use super::*;
use crate::{
    frame::MAX_FRAME_LEN,
    location::{
        engine::MICRO_SLOTS,
        update::{NUM_POSITIONS, SELF_COL},
    },
    radio::{self, Radio, RadioError, RxInfo, Trx},
};

const ANTENNA_DELAY: u64 = 16_436;

/// Radio ticks per millisecond
const TICKS_PER_MS: i64 = 63_897_600;

/// Start-to-start distance of simulated cells
const CELL_SPACING: i64 = 10 * TICKS_PER_MS;

const NUMSLOTS: u16 = 40;

struct Emission {
    from: usize,
    /// RMARKER on the shared clock
    at: f64,
    data: Vec<u8>,
}

#[derive(Default)]
struct Air {
    positions: Vec<Vector3<f32>>,
    drifts: Vec<f64>,
    emissions: Vec<Emission>,
}

impl Air {
    fn tof(&self, a: usize, b: usize) -> f64 {
        let d = (self.positions[a] - self.positions[b]).norm() as f64;
        d / RADIO_TICK_M as f64
    }
}

enum Pending {
    Sent(Instant),
    Listen { from: i64, until: i64 },
}

struct SimRadio {
    id: usize,
    air: Rc<RefCell<Air>>,
    offset: i64,
    /// Rate error of the local clock
    drift: f64,
    /// Local clock
    now: i64,
    tx: [u8; MAX_FRAME_LEN],
    rx: Vec<u8>,
    /// Sender of the last frame received
    heard_from: Option<usize>,
    pending: Option<Pending>,
}

impl SimRadio {
    /// Local clock reading at shared time `t`
    fn local(&self, t: f64) -> i64 {
        libm::round(self.offset as f64 + t * (1.0 + self.drift)) as i64
    }

    /// Shared time of a local clock reading
    fn shared(&self, local: i64) -> f64 {
        (local - self.offset) as f64 / (1.0 + self.drift)
    }
}

impl Radio for SimRadio {
    type Error = ();

    fn sys_time(&mut self) -> Result<Instant, RadioError<()>> {
        Ok(Instant::wrapping(self.now as u64))
    }

    fn tx_antenna_delay(&self) -> Duration {
        Duration::new(ANTENNA_DELAY).unwrap()
    }

    fn write_tx(&mut self, data: &[u8], offset: usize) -> Result<(), RadioError<()>> {
        self.tx[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn schedule_tx(&mut self, at: Instant, len: usize) -> Result<(), RadioError<()>> {
        if (at.value() as i64) < self.now {
            return Err(RadioError::TxLate);
        }
        let mark = radio::tx_rmarker(at, self.tx_antenna_delay());
        self.now = mark.value() as i64;
        self.air.borrow_mut().emissions.push(Emission {
            from: self.id,
            at: self.shared(self.now),
            data: self.tx[..len].to_vec(),
        });
        self.pending = Some(Pending::Sent(mark));
        Ok(())
    }

    fn schedule_rx(&mut self, at: Instant, timeout: Duration) -> Result<(), RadioError<()>> {
        let from = at.value() as i64;
        self.pending = Some(Pending::Listen {
            from,
            until: from + timeout.value() as i64,
        });
        Ok(())
    }

    fn poll(&mut self) -> nb::Result<Trx, RadioError<()>> {
        let (from, until) = match self.pending.take() {
            Some(Pending::Sent(mark)) => return Ok(Trx::Sent(mark)),
            Some(Pending::Listen { from, until }) => (from, until),
            None => return Err(nb::Error::Other(RadioError::Timeout)),
        };
        let id = self.id;
        let heard: Vec<(usize, i64, Vec<u8>)> = {
            let air = self.air.borrow();
            air.emissions
                .iter()
                .filter(|e| e.from != id)
                .map(|e| (e.from, self.local(e.at + air.tof(e.from, id)), e.data.clone()))
                .filter(|&(_, t, _)| from <= t && t <= until)
                .collect()
        };
        match heard.as_slice() {
            [(sender, t, data)] => {
                self.now = *t;
                self.rx = data.clone();
                self.heard_from = Some(*sender);
                Ok(Trx::Received(RxInfo {
                    len: data.len(),
                    timestamp: Instant::wrapping(*t as u64),
                }))
            }
            [] => {
                self.now = until;
                Err(nb::Error::Other(RadioError::Timeout))
            }
            _ => {
                self.now = until;
                Err(nb::Error::Other(RadioError::Rx))
            }
        }
    }

    fn read_rx(&mut self, buf: &mut [u8], offset: usize) -> Result<(), RadioError<()>> {
        let src = self.rx.get(offset..offset + buf.len()).ok_or(RadioError::Rx)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn clock_offset_ratio(&mut self) -> Result<f32, RadioError<()>> {
        let sender = match self.heard_from {
            Some(sender) => self.air.borrow().drifts[sender],
            None => return Ok(0.0),
        };
        Ok(((sender - self.drift) / (1.0 + sender)) as f32)
    }

    fn abort(&mut self) -> Result<(), RadioError<()>> {
        self.pending = None;
        Ok(())
    }

    fn sleep(&mut self) -> Result<(), RadioError<()>> {
        Ok(())
    }

    fn wake(&mut self) -> Result<(), RadioError<()>> {
        Ok(())
    }
}

struct SimNode {
    address: u64,
    location: Location,
    radio: SimRadio,
    rng: SmallRng,
    /// Error of the node's idea of when a cell starts
    sync_error: i64,
    /// Local ticks the node loses right after starting a cell
    lag: i64,
    /// Why the node last abandoned a cell
    abandoned: Option<RadioError<()>>,
}

impl SimNode {
    /// Keeps the outcome of a cell step, or remembers why the cell failed
    fn step<T>(&mut self, result: Result<T, RadioError<()>>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                self.abandoned = Some(error);
                let _ = self.radio.abort();
                None
            }
        }
    }
}

struct Network {
    air: Rc<RefCell<Air>>,
    nodes: Vec<SimNode>,
    time: i64,
    asn: u64,
}

impl Network {
    fn new() -> Self {
        Network {
            air: Rc::new(RefCell::new(Air::default())),
            nodes: Vec::new(),
            time: 1_000 * TICKS_PER_MS,
            asn: 0,
        }
    }

    fn add(&mut self, pos: Vector3<f32>) -> usize {
        self.add_drifting(pos, 0.0)
    }

    /// Adds a node whose clock runs `ppm` parts per million fast
    fn add_drifting(&mut self, pos: Vector3<f32>, ppm: f64) -> usize {
        let id = self.nodes.len();
        let drift = ppm * 1e-6;
        {
            let mut air = self.air.borrow_mut();
            air.positions.push(pos);
            air.drifts.push(drift);
        }
        self.nodes.push(SimNode {
            address: 0x1000 + id as u64,
            location: Location::new(LocConfig::default(), 0),
            radio: SimRadio {
                id,
                air: self.air.clone(),
                offset: 7_777_777 * (id as i64 + 1),
                drift,
                now: 0,
                tx: [0; MAX_FRAME_LEN],
                rx: Vec::new(),
                heard_from: None,
                pending: None,
            },
            rng: SmallRng::seed_from_u64(id as u64),
            sync_error: 2_000 * id as i64,
            lag: 0,
            abandoned: None,
        });
        id
    }

    fn now_ms(&self) -> u64 {
        (self.time / TICKS_PER_MS) as u64
    }

    fn handle(&mut self, id: usize, event: LocEvent) -> Commands {
        let now_ms = self.now_ms();
        let node = &mut self.nodes[id];
        node.location.handle(event, now_ms, &mut node.rng)
    }

    /// Starts a node with a fixed index
    fn start(&mut self, id: usize, index: u8) {
        self.handle(id, LocEvent::Start);
        let node = &mut self.nodes[id];
        node.location.beacon_event(BeaconEvent::ForceIndex(index), &mut node.rng);
    }

    /// Makes a node a fixed beacon at its true position
    fn place(&mut self, id: usize, index: u8) {
        let pos = self.air.borrow().positions[id];
        self.start(id, index);
        let location = &mut self.nodes[id].location;
        location.root = true;
        location.filter.set(&pos);
        location.enter_joined(0);
    }

    fn location(&self, id: usize) -> &Location {
        &self.nodes[id].location
    }

    /// Runs location slot `slot` of the next slotframe with direction `dir`
    ///
    /// Returns the raw update of every node that took part. A node whose
    /// radio fails drops out of the cell and skips it.
    fn run_cell(&mut self, dir: u8, slot: u8) -> Vec<Option<LocUpdate>> {
        self.asn = (self.asn / NUMSLOTS as u64 + 1) * NUMSLOTS as u64;
        while (self.asn / NUMSLOTS as u64) % NUM_DIRS as u64 != dir as u64 {
            self.asn += NUMSLOTS as u64;
        }
        self.time += CELL_SPACING;
        self.air.borrow_mut().emissions.clear();

        let mut runs = Vec::new();
        for node in self.nodes.iter_mut() {
            node.radio.now = node.radio.local(self.time as f64) + node.sync_error;
            node.radio.pending = None;
            node.radio.heard_from = None;
            node.abandoned = None;
            let timing = node.location.timing();
            let run = match node.location.plan_cell(self.asn, NUMSLOTS, slot, node.address) {
                Some(plan) => {
                    let result = CellRun::begin(plan, timing, &mut node.radio);
                    node.step(result)
                }
                None => None,
            };
            node.radio.now += node.lag;
            runs.push(run);
        }
        for j in 0..MICRO_SLOTS {
            for (node, run) in self.nodes.iter_mut().zip(runs.iter_mut()) {
                if let Some(cell) = run {
                    let result = cell.start_slot(&mut node.radio, j);
                    if node.step(result).is_none() {
                        *run = None;
                    }
                }
            }
            for (node, run) in self.nodes.iter_mut().zip(runs.iter_mut()) {
                if let Some(cell) = run {
                    let result = cell.end_slot(&mut node.radio, j);
                    if node.step(result).is_none() {
                        *run = None;
                    }
                }
            }
        }

        let now_ms = self.now_ms();
        let mut updates = Vec::new();
        for (node, run) in self.nodes.iter_mut().zip(runs) {
            let update = match run {
                Some(run) => {
                    let result = run.finish(&mut node.radio);
                    node.step(result)
                }
                None => None,
            };
            let event = match &update {
                Some(update) => LocEvent::CellDone(update.clone()),
                None => LocEvent::CellSkip,
            };
            node.location.handle(event, now_ms, &mut node.rng);
            updates.push(update);
        }
        updates
    }
}

fn ticks_between(a: &Vector3<f32>, b: &Vector3<f32>) -> i32 {
    libm::roundf((a - b).norm() / RADIO_TICK_M) as i32
}

fn assert_adj_within_nbrhood(update: &LocUpdate) {
    for j in 1..NUM_POSITIONS {
        for i in 0..j {
            if update.is_adj(i, j) {
                assert_ne!(update.new_nbrhood & 1 << i, 0, "pair {}-{}", i, j);
                assert_ne!(update.new_nbrhood & 1 << j, 0, "pair {}-{}", i, j);
            }
        }
    }
}

#[test]
fn listener_measures_the_whole_cell() {
    let mut net = Network::new();
    let r = LocConfig::default().lattice_r;
    let beacons = [0u8, 4, 13, 9, 18];
    for &index in beacons.iter() {
        let id = net.add(lattice::relative_position(0, index, r).unwrap());
        net.place(id, index);
    }
    let target = Vector3::new(0.4, 0.9, 1.1);
    let listener = net.add(target);
    net.handle(listener, LocEvent::Start);

    let updates = net.run_cell(0, 0);
    for update in updates.iter().flatten() {
        assert_adj_within_nbrhood(update);
    }

    let mut update = updates[listener].clone().unwrap();
    assert!(update.synced);
    assert_eq!(update.new_nbrhood & 0x3f, 0b01_1111);
    update.prepare_tstamps();
    let positions: Vec<Vector3<f32>> = net.air.borrow().positions.clone();
    for j in 1..beacons.len() {
        assert!(update.is_adj(0, j));
        assert!((update.tstamp(0, j) - ticks_between(&positions[0], &positions[j])).abs() <= 2);
        for i in 1..j {
            assert!(update.is_adj(i, j), "pair {}-{}", i, j);
            assert!((update.tstamp(i, j) - ticks_between(&positions[i], &positions[j])).abs() <= 2);
        }
        let pseudorange = ticks_between(&positions[j], &target) - ticks_between(&positions[0], &target);
        assert!(update.is_adj(j, SELF_COL));
        assert!((update.tstamp(j, SELF_COL) - pseudorange).abs() <= 2);
    }

    let location = net.location(listener);
    assert_eq!(location.last_status(), SolverStatus::Updated);
    assert_eq!(location.state(), LocState::Joined);
    let fix = location.location().unwrap();
    assert!((fix - target).norm() < 0.05, "{:?}", fix);
}

#[test]
fn transmitters_measure_distances() {
    let mut net = Network::new();
    let r = LocConfig::default().lattice_r;
    for &index in [0u8, 4, 13].iter() {
        let id = net.add(lattice::relative_position(0, index, r).unwrap());
        net.place(id, index);
    }
    let updates = net.run_cell(0, 0);
    let positions: Vec<Vector3<f32>> = net.air.borrow().positions.clone();

    for (id, update) in updates.iter().enumerate() {
        let mut update = update.clone().unwrap();
        assert!(update.shouldtx);
        assert_eq!(update.conflicts, 0);
        assert_adj_within_nbrhood(&update);
        update.prepare_tstamps();
        let me = update.me();
        assert_eq!(me, id);
        for other in 0..3 {
            if other == me {
                continue;
            }
            assert!(update.is_adj(other, me), "{} at {}", other, me);
            let measured = update.tstamp(other.min(me), other.max(me));
            assert!((measured - ticks_between(&positions[other], &positions[me])).abs() <= 2);
        }
    }
    assert!(net.location(1).beacon().transmitted(0, 0));
}

#[test]
fn two_beacons_bootstrap_from_the_root() {
    let mut net = Network::new();
    let root = net.add(Vector3::zeros());
    net.handle(root, LocEvent::StartRoot);
    let axis = net.add(Vector3::new(5.0, 0.0, 0.0));
    net.start(axis, 4);
    let third = net.add(Vector3::new(1.8, 2.4, 0.0));
    net.start(third, 9);

    net.run_cell(0, 0);
    assert_eq!(net.location(axis).state(), LocState::Joined);
    let fix = net.location(axis).location().unwrap();
    assert!((fix - Vector3::new(5.0, 0.0, 0.0)).norm() < 0.02, "{:?}", fix);
    assert_eq!(net.location(third).state(), LocState::SearchNbrhd);

    net.run_cell(0, 0);
    assert_eq!(net.location(third).state(), LocState::Joined);
    let fix = net.location(third).location().unwrap();
    assert!((fix - Vector3::new(1.8, 2.4, 0.0)).norm() < 0.02, "{:?}", fix);
    assert!((net.location(axis).location().unwrap() - Vector3::new(5.0, 0.0, 0.0)).norm() < 0.02);
    assert_eq!(net.location(root).location(), Some(Vector3::zeros()));
}

#[test]
fn three_spheres_above_the_plane() {
    let mut net = Network::new();
    let r = LocConfig::default().lattice_r;
    for &index in [0u8, 4, 9].iter() {
        let id = net.add(lattice::relative_position(0, index, r).unwrap());
        net.place(id, index);
    }
    let ideal = lattice::relative_position(0, 18, r).unwrap();
    let target = ideal + Vector3::new(0.1, -0.1, 0.05);
    let node = net.add(target);
    net.start(node, 18);

    net.run_cell(0, 0);
    let location = net.location(node);
    assert_eq!(location.last_status(), SolverStatus::Updated);
    assert_eq!(location.state(), LocState::Joined);
    let fix = location.location().unwrap();
    assert!((fix - target).norm() < 0.05, "{:?}", fix);
    assert!(fix.z > 0.0);
    assert!((fix - ideal).norm() <= location.config().outlier_radius());
}

#[test]
fn joined_nodes_sit_out_foreign_cells() {
    let mut net = Network::new();
    let root = net.add(Vector3::zeros());
    net.handle(root, LocEvent::StartRoot);
    let listener = net.add(Vector3::new(1.0, 1.0, 0.0));
    net.handle(listener, LocEvent::Start);

    // Index 0 isn't in cell (0, 1)
    let updates = net.run_cell(0, 1);
    assert!(updates[root].is_none());
    let update = updates[listener].clone().unwrap();
    assert!(!update.synced);
    assert_eq!(update.new_nbrhood & 0x3f, 0);

    let updates = net.run_cell(0, 0);
    assert!(updates[root].is_some());
    assert!(updates[listener].as_ref().unwrap().heard(0));
    assert_eq!(net.location(listener).neighbors().find(net.nodes[root].address), Some(0));
}

#[test]
fn drifting_clocks_settle_on_the_two_circle_fix() {
    let mut net = Network::new();
    let root = net.add_drifting(Vector3::zeros(), 18.0);
    net.handle(root, LocEvent::StartRoot);
    let axis = net.add_drifting(Vector3::new(5.0, 0.0, 0.0), -12.0);
    net.start(axis, 4);
    let target = Vector3::new(1.8, 2.4, 0.0);
    let third = net.add_drifting(target, 25.0);
    net.start(third, 9);

    net.run_cell(0, 0);
    let updates = net.run_cell(0, 0);
    let mut update = updates[third].clone().unwrap();
    assert!(update.shouldtx);
    update.prepare_tstamps();
    assert_eq!(update.me(), 3);
    let ticks = |d: f32| libm::roundf(d / RADIO_TICK_M) as i32;
    assert!((update.tstamp(0, 3) - ticks(3.0)).abs() <= 3, "{}", update.tstamp(0, 3));
    assert!((update.tstamp(1, 3) - ticks(4.0)).abs() <= 3, "{}", update.tstamp(1, 3));

    assert_eq!(net.location(third).state(), LocState::Joined);
    let fix = net.location(third).location().unwrap();
    assert!((fix - target).norm() < 0.03, "{:?}", fix);

    for _ in 2..49 {
        net.run_cell(0, 0);
    }
    let last = net.location(third).location().unwrap();
    net.run_cell(0, 0);
    let fix = net.location(third).location().unwrap();
    assert_eq!(net.location(third).state(), LocState::Joined);
    assert!((fix - target).norm() < 0.03, "{:?}", fix);
    assert!((fix - last).norm() < 1e-3, "{:?} after {:?}", fix, last);
}

#[test]
fn late_prime_abandons_the_cell() {
    let mut net = Network::new();
    let root = net.add(Vector3::zeros());
    net.place(root, 0);
    let listener = net.add(Vector3::new(1.0, 1.0, 0.0));
    net.handle(listener, LocEvent::Start);

    net.nodes[root].lag = 2 * TICKS_PER_MS;
    let updates = net.run_cell(0, 0);
    assert!(updates[root].is_none());
    assert!(matches!(net.nodes[root].abandoned, Some(RadioError::TxLate)));
    assert_eq!(net.location(root).state(), LocState::Joined);
    let update = updates[listener].clone().unwrap();
    assert!(!update.synced);
    assert_eq!(update.new_nbrhood & 0x3f, 0);

    net.nodes[root].lag = 0;
    let updates = net.run_cell(0, 0);
    assert!(updates[root].is_some());
    assert!(net.nodes[root].abandoned.is_none());
    assert!(updates[listener].as_ref().unwrap().heard(0));
}
