//! The beacon lattice
//!
//! Beacons sit on a face-centred cubic lattice with spacing `R`: square
//! sheets of side `R` stacked `R` apart, every other sheet shifted by half a
//! cell along x and y. Each lattice point carries one of 20 indices. The
//! labeling repeats throughout space, so any two points closer than two cells
//! carry different indices and the tables below can describe the neighborhood
//! of every beacon relative to its own index. The primes form a sublattice of
//! their own, and no two of them are neighbors.
//!
//! Indices 0 to 3 are the primes, which open every location cell.

use nalgebra::Vector3;

/// Number of distinct lattice indices
pub const NUM_INDICES: usize = 20;

/// Number of prime indices, which are `0..NUM_PRIMES`
pub const NUM_PRIMES: u8 = 4;

/// `RELPOS` entry for two indices that are not neighbors
pub const NOT_NEIGHBORS: u8 = 17;

/// Directions a location cell can have
pub const NUM_DIRS: usize = 8;

/// Location slots per slotframe
pub const NUM_SLOTS: usize = 4;

/// Beacons expected to transmit in one location cell
pub const CELL_PARTICIPANTS: usize = 6;

/// Offset of a node that doesn't participate in a cell
pub const NO_OFFSET: u8 = CELL_PARTICIPANTS as u8;

/// Neighbor offsets in lattice units, indexed by `RELPOS` entries
pub const VECTORS: [[f32; 3]; 17] = [
    [0.0, 0.0, 0.0],
    [1.0, 0.0, 0.0],
    [-1.0, 0.0, 0.0],
    [0.0, 1.0, 0.0],
    [0.0, -1.0, 0.0],
    [1.0, 1.0, 0.0],
    [1.0, -1.0, 0.0],
    [-1.0, 1.0, 0.0],
    [-1.0, -1.0, 0.0],
    [0.5, 0.5, 1.0],
    [-0.5, 0.5, 1.0],
    [0.5, -0.5, 1.0],
    [-0.5, -0.5, 1.0],
    [-0.5, -0.5, -1.0],
    [0.5, -0.5, -1.0],
    [-0.5, 0.5, -1.0],
    [0.5, 0.5, -1.0],
];

/// `RELPOS[i][j]` is the `VECTORS` entry leading from a beacon with index `i`
/// to its neighbor with index `j`, or `NOT_NEIGHBORS`
#[rustfmt::skip]
pub const RELPOS: [[u8; NUM_INDICES]; NUM_INDICES] = [
    [ 0, 17, 17, 17,  1, 13,  2, 12, 11,  3,  8, 14, 10,  7, 16,  6,  5,  4,  9, 15],
    [17,  0, 17, 17, 12,  1,  9,  7,  3, 14, 11,  8,  4, 13,  2, 16, 10, 15,  6,  5],
    [17, 17,  0, 17,  7, 12,  6, 13, 14,  8,  3, 11, 15,  1,  9,  2,  4,  5, 16, 10],
    [17, 17, 17,  0, 13,  7, 16,  1,  8, 11, 14,  3,  5, 12,  6,  9, 15, 10,  2,  4],
    [ 2, 16,  6,  9,  0, 17,  5, 17, 12,  7,  1, 13, 14, 17, 15,  4,  3,  8, 10, 11],
    [ 9,  2, 16,  6, 17,  0, 10, 17,  7, 13, 12,  1,  8, 17,  5, 15, 14, 11,  4,  3],
    [ 1, 13,  7, 12,  8, 14,  0, 11, 15,  5,  4, 10,  9,  3, 17, 17,  2,  6, 17, 16],
    [16,  6,  9,  2, 17, 17, 15,  0,  1, 12, 13,  7,  3, 17,  4, 10, 11, 14,  5,  8],
    [15,  4, 10,  5, 16,  6, 11,  2,  0, 17, 17, 17,  7,  9,  8, 14, 12, 13,  3,  1],
    [ 4, 10,  5, 15,  6,  9,  8, 16, 17,  0, 17, 17, 12,  2, 14,  3,  1,  7, 11, 13],
    [ 5, 15,  4, 10,  2, 16,  3,  9, 17, 17,  0, 17, 13,  6, 11,  8,  7,  1, 14, 12],
    [10,  5, 15,  4,  9,  2, 14,  6, 17, 17, 17,  0,  1, 16,  3, 11, 13, 12,  8,  7],
    [14,  3, 11,  8, 10,  5, 13,  4,  6, 16,  9,  2,  0, 15,  7, 12, 17, 17,  1, 17],
    [ 6,  9,  2, 16, 17, 17,  4, 17, 13,  1,  7, 12, 11,  0, 10,  5,  8,  3, 15, 14],
    [12,  1, 13,  7, 11,  8, 17,  3,  5, 10, 15,  4,  6, 14,  0, 17,  9, 16, 17,  2],
    [ 7, 12,  1, 13,  3, 11, 17, 14, 10,  4,  5, 15, 16,  8, 17,  0,  6,  2, 17,  9],
    [ 8, 14,  3, 11,  4, 10,  1, 15, 16,  2,  6,  9, 17,  5, 13,  7,  0, 17, 12, 17],
    [ 3, 11,  8, 14,  5, 15,  7, 10,  9,  6,  2, 16, 17,  4, 12,  1, 17,  0, 13, 17],
    [13,  7, 12,  1, 14,  3, 17,  8,  4, 15, 10,  5,  2, 11, 17, 17, 16,  9,  0,  6],
    [11,  8, 14,  3, 15,  4, 12,  5,  2,  9, 16,  6, 17, 10,  1, 13, 17, 17,  7,  0],
];

/// The six beacon indices taking part in the location cell with a given
/// direction and slot, ordered by transmit offset
#[rustfmt::skip]
pub const BEACON_ORDER: [[[u8; CELL_PARTICIPANTS]; NUM_SLOTS]; NUM_DIRS] = [
    [
        [0, 4, 13, 9, 18, 19],
        [1, 5, 7, 8, 6, 17],
        [2, 13, 4, 10, 14, 12],
        [3, 7, 5, 11, 15, 16],
    ],
    [
        [0, 4, 13, 9, 14, 12],
        [1, 5, 7, 8, 15, 16],
        [2, 13, 4, 10, 18, 19],
        [3, 7, 5, 11, 6, 17],
    ],
    [
        [0, 9, 10, 6, 12, 5],
        [1, 8, 11, 14, 16, 13],
        [2, 10, 9, 15, 19, 7],
        [3, 11, 8, 18, 17, 4],
    ],
    [
        [0, 9, 10, 6, 19, 7],
        [1, 8, 11, 14, 17, 4],
        [2, 10, 9, 15, 12, 5],
        [3, 11, 8, 18, 16, 13],
    ],
    [
        [0, 6, 15, 17, 7, 11],
        [1, 14, 18, 12, 4, 9],
        [2, 15, 6, 16, 5, 8],
        [3, 18, 14, 19, 13, 10],
    ],
    [
        [0, 6, 15, 17, 5, 8],
        [1, 14, 18, 12, 13, 10],
        [2, 15, 6, 16, 7, 11],
        [3, 18, 14, 19, 4, 9],
    ],
    [
        [0, 17, 16, 4, 8, 14],
        [1, 12, 19, 5, 10, 15],
        [2, 16, 17, 13, 11, 18],
        [3, 19, 12, 7, 9, 6],
    ],
    [
        [0, 17, 16, 4, 11, 18],
        [1, 12, 19, 5, 9, 6],
        [2, 16, 17, 13, 8, 14],
        [3, 19, 12, 7, 10, 15],
    ],
];

/// Index of each point of the two sheet types, by position along the sheet
#[rustfmt::skip]
const SHEETS: [[u8; 10]; 2] = [
    [ 0,  4, 10, 17, 15,  2, 13,  9, 16,  6],
    [ 7,  8, 19, 14,  1,  5, 11, 12, 18,  3],
];

/// Whether `index` is one of the primes
pub fn is_prime(index: u8) -> bool {
    index < NUM_PRIMES
}

/// Offset of neighbor vector `k`, scaled to the lattice spacing `r`
pub fn vector(k: u8, r: f32) -> Vector3<f32> {
    let v = VECTORS[k as usize];
    Vector3::new(v[0], v[1], v[2]) * r
}

/// Ideal position of index `to` relative to a neighboring index `from`
pub fn relative_position(from: u8, to: u8, r: f32) -> Option<Vector3<f32>> {
    match RELPOS[from as usize][to as usize] {
        NOT_NEIGHBORS => None,
        k => Some(vector(k, r)),
    }
}

/// Bitmask of the indices adjacent to `index`, not including itself
pub fn neighbor_mask(index: u8) -> u32 {
    RELPOS[index as usize]
        .iter()
        .enumerate()
        .filter(|&(j, &k)| j != index as usize && k != NOT_NEIGHBORS)
        .fold(0, |mask, (j, _)| mask | 1 << j)
}

/// Indices within two hops of any index in `mask`
pub fn two_hop_mask(mask: u32) -> u32 {
    (0..NUM_INDICES as u8)
        .filter(|&i| mask & 1 << i != 0)
        .fold(mask, |acc, i| acc | neighbor_mask(i))
}

/// Participants of the location cell `(dir, slot)`
pub fn participants(dir: u8, slot: u8) -> Option<&'static [u8; CELL_PARTICIPANTS]> {
    BEACON_ORDER.get(dir as usize)?.get(slot as usize)
}

/// Transmit offset of `index` in cell `(dir, slot)`, `NO_OFFSET` if it
/// doesn't take part
pub fn offset_in_cell(index: u8, dir: u8, slot: u8) -> u8 {
    participants(dir, slot)
        .and_then(|p| p.iter().position(|&i| i == index))
        .map_or(NO_OFFSET, |offset| offset as u8)
}

/// Nearest lattice point to `p`
pub fn quantize_to_grid(p: &Vector3<f32>, r: f32) -> Vector3<f32> {
    let z = libm::roundf(p.z / r) * r;
    let x = libm::roundf((p.x - z / 2.0) / r) * r;
    let y = libm::roundf((p.y - z / 2.0) / r) * r;
    Vector3::new(x + z / 2.0, y + z / 2.0, z)
}

/// Lattice index of the lattice point `q`
///
/// Sheets alternate between two types along z, and every second sheet of a
/// type is rotated by five positions. Within a sheet the position is
/// `x - 3y mod 10`, with `x` and `y` in lattice units rounded half up, which
/// is where the shifted sheets land on a half.
pub fn index_from_point(q: &Vector3<f32>, r: f32) -> u8 {
    let z = libm::roundf(q.z / r) as i32;
    let lift = (z + 1).div_euclid(2);
    let x = libm::roundf(q.x / r - z as f32 / 2.0) as i32 + lift;
    let y = libm::roundf(q.y / r - z as f32 / 2.0) as i32 + lift;
    let level = z.rem_euclid(4);
    let position = (x - 3 * y + level / 2 * 5).rem_euclid(10);
    SHEETS[(level % 2) as usize][position as usize]
}
