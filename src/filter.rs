//! Single-pole low-pass filters for the published location

use nalgebra::Vector3;

/// `y = α·y + (1 − α)·x`, starting from the first input
#[derive(Clone, Copy, Debug)]
pub struct Iir {
    alpha: f32,
    value: f32,
}

impl Iir {
    pub fn new(alpha: f32) -> Self {
        Iir {
            alpha,
            value: f32::NAN,
        }
    }

    /// Feeds one sample and returns the new output
    ///
    /// An unset filter snaps to its first input.
    pub fn filter(&mut self, x: f32) -> f32 {
        self.value = if self.value.is_nan() {
            x
        } else {
            self.alpha * self.value + (1.0 - self.alpha) * x
        };
        self.value
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn is_set(&self) -> bool {
        !self.value.is_nan()
    }

    pub fn set(&mut self, x: f32) {
        self.value = x;
    }

    pub fn clear(&mut self) {
        self.value = f32::NAN;
    }
}

/// One [`Iir`] per axis
#[derive(Clone, Copy, Debug)]
pub struct PositionFilter {
    axes: [Iir; 3],
}

impl PositionFilter {
    pub fn new(alpha: f32) -> Self {
        PositionFilter {
            axes: [Iir::new(alpha); 3],
        }
    }

    /// Filters a candidate position
    ///
    /// Candidates with a non-finite coordinate are rejected and leave the
    /// filter untouched.
    pub fn update(&mut self, candidate: &Vector3<f32>) -> Option<Vector3<f32>> {
        if !candidate.iter().all(|c| c.is_finite()) {
            return None;
        }
        let mut out = Vector3::zeros();
        for (axis, (iir, &x)) in self.axes.iter_mut().zip(candidate.iter()).enumerate() {
            out[axis] = iir.filter(x);
        }
        Some(out)
    }

    /// The filtered position, `None` while unset
    pub fn value(&self) -> Option<Vector3<f32>> {
        if self.is_set() {
            Some(Vector3::new(
                self.axes[0].value(),
                self.axes[1].value(),
                self.axes[2].value(),
            ))
        } else {
            None
        }
    }

    pub fn is_set(&self) -> bool {
        self.axes.iter().all(Iir::is_set)
    }

    /// Forces the output, e.g. for the root node
    pub fn set(&mut self, p: &Vector3<f32>) {
        for (iir, &x) in self.axes.iter_mut().zip(p.iter()) {
            iir.set(x);
        }
    }

    pub fn clear(&mut self) {
        for iir in self.axes.iter_mut() {
            iir.clear();
        }
    }
}
