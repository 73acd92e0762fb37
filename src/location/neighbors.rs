//! Beacons heard recently, one entry per lattice index

use nalgebra::Vector3;

use crate::{debug, frame::BeaconPayload, lattice::NUM_INDICES};

/// What a beacon last told about itself
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Neighbor {
    pub addr: u64,
    pub pos: [f32; 3],
    pub r: f32,
    pub t: f32,
    /// Indices the beacon hears
    pub nbrhood: u32,
    pub class: u8,
}

impl Default for Neighbor {
    fn default() -> Self {
        Neighbor {
            addr: 0,
            pos: [f32::NAN; 3],
            r: f32::NAN,
            t: f32::NAN,
            nbrhood: 0,
            class: 0,
        }
    }
}

impl Neighbor {
    pub fn from_payload(addr: u64, payload: &BeaconPayload) -> Self {
        Neighbor {
            addr,
            pos: payload.pos,
            r: payload.r,
            t: payload.t,
            nbrhood: payload.nbrhood,
            class: payload.class,
        }
    }

    /// Reported position, if the beacon knows it
    pub fn position(&self) -> Option<Vector3<f32>> {
        let p = Vector3::new(self.pos[0], self.pos[1], self.pos[2]);
        if p.iter().all(|c| c.is_finite()) {
            Some(p)
        } else {
            None
        }
    }
}

/// Neighbor table indexed by lattice index
///
/// `all` has a bit for every index heard within the last `drop_max` cells
/// it was expected in, `local` for those whose position is consistent with
/// ours. `local` is always a subset of `all`, and neither has a bit for an
/// index whose dropcount is at `drop_max`.
#[derive(Clone, Debug)]
pub struct NeighborTable {
    entries: [Neighbor; NUM_INDICES],
    dropcount: [u8; NUM_INDICES],
    all: u32,
    local: u32,
    drop_max: u8,
}

impl NeighborTable {
    pub fn new(drop_max: u8) -> Self {
        NeighborTable {
            entries: [Neighbor::default(); NUM_INDICES],
            dropcount: [0; NUM_INDICES],
            all: 0,
            local: 0,
            drop_max,
        }
    }

    pub fn all_mask(&self) -> u32 {
        self.all
    }

    pub fn local_mask(&self) -> u32 {
        self.local
    }

    pub fn count_all(&self) -> u32 {
        self.all.count_ones()
    }

    pub fn count_local(&self) -> u32 {
        self.local.count_ones()
    }

    pub fn dropcount(&self, index: u8) -> u8 {
        self.dropcount.get(index as usize).copied().unwrap_or(0)
    }

    pub fn get(&self, index: u8) -> Option<&Neighbor> {
        if (index as usize) < NUM_INDICES && self.all & 1 << index != 0 {
            Some(&self.entries[index as usize])
        } else {
            None
        }
    }

    /// Address of the beacon holding `index`, 0 if none is known
    pub fn address(&self, index: u8) -> u64 {
        self.get(index).map_or(0, |neighbor| neighbor.addr)
    }

    /// Index held by the beacon with address `addr`
    pub fn find(&self, addr: u64) -> Option<u8> {
        self.iter().find(|(_, neighbor)| neighbor.addr == addr).map(|(index, _)| index)
    }

    /// Valid entries in index order
    pub fn iter(&self) -> impl Iterator<Item = (u8, &Neighbor)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(move |(index, _)| self.all & 1 << index != 0)
            .map(|(index, neighbor)| (index as u8, neighbor))
    }

    /// Records a reception from `index`
    ///
    /// `local` tells whether the neighbor's position is consistent with ours.
    pub fn update(&mut self, index: u8, neighbor: Neighbor, local: bool) {
        if index as usize >= NUM_INDICES {
            return;
        }
        self.entries[index as usize] = neighbor;
        self.dropcount[index as usize] = 0;
        self.all |= 1 << index;
        if local {
            self.local |= 1 << index;
        } else {
            self.local &= !(1 << index);
        }
    }

    /// Records a cell in which `index` was expected but not heard
    ///
    /// The entry is dropped once its dropcount reaches `drop_max`; the count
    /// stays there until the index is heard again. Returns whether it was
    /// dropped.
    pub fn miss(&mut self, index: u8) -> bool {
        let i = index as usize;
        if i >= NUM_INDICES || self.all & 1 << index == 0 {
            return false;
        }
        self.dropcount[i] = self.dropcount[i].saturating_add(1);
        if self.dropcount[i] < self.drop_max {
            return false;
        }
        debug!("dropping neighbor {} ({:x})", index, self.entries[i].addr);
        self.all &= !(1 << index);
        self.local &= !(1 << index);
        self.entries[i] = Neighbor::default();
        true
    }

    pub fn remove(&mut self, index: u8) {
        if (index as usize) < NUM_INDICES {
            self.all &= !(1 << index);
            self.local &= !(1 << index);
            self.dropcount[index as usize] = 0;
            self.entries[index as usize] = Neighbor::default();
        }
    }

    pub fn clear(&mut self) {
        *self = NeighborTable::new(self.drop_max);
    }
}
