//! Crate wide constants.

use crate::types::BlockId;

/// Sentinel block id for positions outside of the analysis domain.
pub const OUT_OF_BOUNDS_BLOCK: BlockId = -1;

/// Marks an unused slot of a request mailbox.
pub const EMPTY_SLOT: BlockId = -1;

/// Number of velocity components used by the interpolator and integrator.
pub const VECTOR_LENGTH: usize = 3;

/// Rank that collects the per-round rerun flags.
pub const RERUN_COORDINATOR: usize = 0;

/// Number of blocks in the 3x3x3 neighbourhood of a block (including itself).
pub const NNEIGHBOURHOOD: usize = 27;

/// Runge-Kutta-Gill weights applied to the accumulator `q`.
pub const GILL_CK: [f64; 4] = [2.0, 1.0, 1.0, 2.0];

/// Runge-Kutta-Gill weights applied to the stage increment when updating `q`.
pub const GILL_CQ: [f64; 4] = [
    0.5,
    1.0 - std::f64::consts::FRAC_1_SQRT_2,
    1.0 + std::f64::consts::FRAC_1_SQRT_2,
    0.5,
];

/// Runge-Kutta-Gill weights applied to the position update.
pub const GILL_CX: [f64; 4] = [
    0.5,
    1.0 - std::f64::consts::FRAC_1_SQRT_2,
    1.0 + std::f64::consts::FRAC_1_SQRT_2,
    1.0 / 6.0,
];
