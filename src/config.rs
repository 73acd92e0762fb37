//! Tunables of the location protocol

use dw1000::time::Duration;

/// Spring-damper integrator used by joined beacons
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpringConfig {
    /// Spring constant per measured distance
    pub ks: f32,
    /// Pull toward the nearest lattice point
    pub kg: f32,
    /// Damping
    pub b: f32,
    /// Mass
    pub m: f32,
    /// Integration step in seconds
    pub dt: f32,
    /// Integration steps per location cell
    pub iterations: u8,
}

impl Default for SpringConfig {
    fn default() -> Self {
        SpringConfig {
            ks: 1.0,
            kg: 0.2,
            b: 2.0,
            m: 1.0,
            dt: 0.01,
            iterations: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LocConfig {
    /// Lattice spacing in meters
    pub lattice_r: f32,
    /// Largest accepted mismatch between a measured and a computed distance,
    /// in meters
    pub fixed_threshold: f32,
    /// Consecutive missed cells before a neighbor is dropped
    pub nbr_drop_max: u8,
    /// Length of one micro-slot
    pub grid_length_us: u32,
    /// Frame wait timeout of every receive
    pub rx_timeout_us: u32,
    /// How early the receiver is switched on before the expected RMARKER
    pub rx_guard_us: u32,
    /// Delay from the start of a location cell to the first RMARKER
    pub tx_start_us: u32,
    /// Per-axis low-pass coefficient
    pub filter_alpha: f32,
    pub spring: SpringConfig,
    /// Cells spent collecting neighbors before searching for a location
    pub search_nbrhd_count: u8,
    pub measure_dist_timeout_ms: u32,
    /// Longest time a joined node may go without a location update
    pub update_timeout_ms: u32,
    /// Slotframe holding the location cells
    pub slotframe_id: u16,
    pub slotframe_len: u16,
    /// Slotframe holding the ranging slot, as long as the location slotframe
    pub ranging_slotframe_id: u16,
    /// A node takes over an index when it is this much closer to the ideal
    /// point than the incumbent
    pub promote_ratio: f32,
}

impl Default for LocConfig {
    fn default() -> Self {
        LocConfig {
            lattice_r: 2.5,
            fixed_threshold: 0.3,
            nbr_drop_max: 6,
            grid_length_us: 400,
            rx_timeout_us: 360,
            rx_guard_us: 160,
            tx_start_us: 600,
            filter_alpha: 0.965,
            spring: SpringConfig::default(),
            search_nbrhd_count: 16,
            measure_dist_timeout_ms: 30_000,
            update_timeout_ms: 60_000,
            slotframe_id: 1,
            slotframe_len: 40,
            ranging_slotframe_id: 2,
            promote_ratio: 0.75,
        }
    }
}

impl LocConfig {
    pub fn grid_length(&self) -> Duration {
        Duration::from_micros(self.grid_length_us)
    }

    pub fn rx_timeout(&self) -> Duration {
        Duration::from_micros(self.rx_timeout_us)
    }

    pub fn rx_guard(&self) -> Duration {
        Duration::from_micros(self.rx_guard_us)
    }

    pub fn tx_start(&self) -> Duration {
        Duration::from_micros(self.tx_start_us)
    }

    /// Neighbors reporting a position farther than this from ours are outliers
    pub fn outlier_radius(&self) -> f32 {
        libm::sqrtf(3.0) * self.lattice_r
    }

    /// Indices of the four location slots in the location slotframe
    pub fn location_slots(&self) -> [u16; 4] {
        let quarter = self.slotframe_len / 4;
        [2, quarter + 2, 2 * quarter + 2, 3 * quarter + 2]
    }
}
