//! Constant-velocity Kalman filter over box state
//!
//! State is `[cx, cy, w, h, vcx, vcy, vw, vh]`; the measurement is the first
//! four components. Process noise Q = 1e-2·I, measurement noise R = 1e-1·I,
//! initial covariance P₀ = I.

use ndarray::{s, Array1, Array2};
use visionguard_common::BBox;

const STATE_DIM: usize = 8;
const MEASUREMENT_DIM: usize = 4;

const PROCESS_NOISE: f32 = 1e-2;
const MEASUREMENT_NOISE: f32 = 1e-1;

/// Per-track Kalman filter.
#[derive(Debug, Clone)]
pub struct KalmanFilter {
    /// State estimate `[cx, cy, w, h, vcx, vcy, vw, vh]`
    state: Array1<f32>,
    /// State covariance
    covariance: Array2<f32>,
    /// Transition matrix: identity plus velocity coupling
    transition: Array2<f32>,
}

impl KalmanFilter {
    /// Initialize at a measured box with zero velocity.
    #[must_use]
    pub fn new(bbox: &BBox) -> Self {
        let center = bbox.center();
        let mut state = Array1::zeros(STATE_DIM);
        state[0] = center.x;
        state[1] = center.y;
        state[2] = bbox.width;
        state[3] = bbox.height;

        let mut transition = Array2::eye(STATE_DIM);
        for i in 0..MEASUREMENT_DIM {
            transition[[i, i + MEASUREMENT_DIM]] = 1.0;
        }

        Self {
            state,
            covariance: Array2::eye(STATE_DIM),
            transition,
        }
    }

    /// Advance one frame: `x ← F·x`, `P ← F·P·Fᵀ + Q`.
    pub fn predict(&mut self) {
        self.state = self.transition.dot(&self.state);
        self.covariance = self.transition.dot(&self.covariance).dot(&self.transition.t())
            + Array2::<f32>::eye(STATE_DIM) * PROCESS_NOISE;
    }

    /// Correct with a measured box.
    pub fn update(&mut self, bbox: &BBox) {
        let center = bbox.center();
        let measurement = [center.x, center.y, bbox.width, bbox.height];

        // H selects the first four state components, so H·P·Hᵀ is the
        // top-left 4x4 block and P·Hᵀ the first four columns.
        let mut innovation = Array1::zeros(MEASUREMENT_DIM);
        for i in 0..MEASUREMENT_DIM {
            innovation[i] = measurement[i] - self.state[i];
        }

        let innovation_cov = self
            .covariance
            .slice(s![..MEASUREMENT_DIM, ..MEASUREMENT_DIM])
            .to_owned()
            + Array2::<f32>::eye(MEASUREMENT_DIM) * MEASUREMENT_NOISE;
        let innovation_cov_inv = invert_4x4(&innovation_cov);

        let cross_cov = self.covariance.slice(s![.., ..MEASUREMENT_DIM]).to_owned();
        let gain = cross_cov.dot(&innovation_cov_inv);

        self.state = &self.state + &gain.dot(&innovation);

        // P ← (I - K·H)·P, with K·H filling only the first four columns
        let mut kh = Array2::zeros((STATE_DIM, STATE_DIM));
        kh.slice_mut(s![.., ..MEASUREMENT_DIM]).assign(&gain);
        let identity = Array2::<f32>::eye(STATE_DIM);
        self.covariance = (identity - kh).dot(&self.covariance);
    }

    /// Current box estimate.
    #[must_use]
    pub fn bbox(&self) -> BBox {
        let width = self.state[2].max(0.0);
        let height = self.state[3].max(0.0);
        BBox::new(
            self.state[0] - width / 2.0,
            self.state[1] - height / 2.0,
            width,
            height,
        )
    }

    /// Center velocity estimate `(vcx, vcy)` in pixels per frame.
    #[must_use]
    pub fn velocity(&self) -> (f32, f32) {
        (self.state[4], self.state[5])
    }
}

/// Gauss-Jordan inverse of a 4x4 matrix. The innovation covariance is
/// positive definite (diagonal R keeps pivots away from zero).
fn invert_4x4(matrix: &Array2<f32>) -> Array2<f32> {
    let n = MEASUREMENT_DIM;
    let mut augmented = Array2::<f32>::zeros((n, 2 * n));
    augmented.slice_mut(s![.., ..n]).assign(matrix);
    for i in 0..n {
        augmented[[i, n + i]] = 1.0;
    }

    for col in 0..n {
        // Partial pivot
        let mut pivot_row = col;
        let mut pivot_val = augmented[[col, col]].abs();
        for row in (col + 1)..n {
            let candidate = augmented[[row, col]].abs();
            if candidate > pivot_val {
                pivot_val = candidate;
                pivot_row = row;
            }
        }
        if pivot_row != col {
            for k in 0..2 * n {
                let tmp = augmented[[col, k]];
                augmented[[col, k]] = augmented[[pivot_row, k]];
                augmented[[pivot_row, k]] = tmp;
            }
        }

        let pivot = augmented[[col, col]];
        if pivot.abs() < 1e-12 {
            // Degenerate block; fall back to identity to avoid NaNs
            return Array2::eye(n);
        }
        for k in 0..2 * n {
            augmented[[col, k]] /= pivot;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = augmented[[row, col]];
            for k in 0..2 * n {
                augmented[[row, k]] -= factor * augmented[[col, k]];
            }
        }
    }

    augmented.slice(s![.., n..]).to_owned()
}
