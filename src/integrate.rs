//! Runge-Kutta-Gill time integration.

use crate::{
    block::Block,
    constants::{GILL_CK, GILL_CQ, GILL_CX},
    interpolate::interpolate,
    types::Vec3,
};

/// Advance a local index space position by one step of length `dt`.
///
/// Every stage interpolates the velocity at the current trial position and scales
/// it by `dt / pitch`, which turns physical velocities into index space increments.
pub fn advance(block: &Block, dt: f64, position: &mut Vec3) {
    let pitch = block.pitch();
    let scale = [dt / pitch[0], dt / pitch[1], dt / pitch[2]];
    let mut q = [0.0; 3];

    for stage in 0..4 {
        let velocity = interpolate(block, *position);
        for axis in 0..3 {
            let k = scale[axis] * velocity[axis];
            let r = GILL_CX[stage] * (k - GILL_CK[stage] * q[axis]);
            position[axis] += r;
            q[axis] += 3.0 * r - GILL_CQ[stage] * k;
        }
    }
}

#[cfg(test)]
mod test {
    use approx::assert_relative_eq;

    use super::advance;
    use crate::{
        block::{Block, BlockHeader},
        config::Decomposition,
        fluid::FluidField,
        spatial_index::SpatialIndex,
    };

    fn block_from<F: Fn([f64; 3]) -> [f64; 3]>(velocity: F) -> Block {
        let index = SpatialIndex::new(&Decomposition {
            domain_cells: [16, 16, 16],
            blocks_per_subdomain: [1, 1, 1],
            pitch: [0.5, 0.5, 0.5],
            ..Default::default()
        })
        .unwrap();
        let field = FluidField::from_fn(&index, 0, 3, 0.0, velocity);
        let geometry = index.block_geometry(0);
        let header = BlockHeader::new(&geometry, 1, index.pitch());
        Block::new(header, 1, 0.0, field.pack_block(&geometry))
    }

    #[test]
    fn test_zero_velocity() {
        let block = block_from(|_| [0.0, 0.0, 0.0]);
        let mut position = [3.3, 4.4, 5.5];
        advance(&block, 0.1, &mut position);
        assert_eq!(position, [3.3, 4.4, 5.5]);
    }

    #[test]
    fn test_uniform_velocity() {
        let block = block_from(|_| [1.0, -0.5, 0.25]);
        let mut position = [5.0, 5.0, 5.0];
        advance(&block, 0.2, &mut position);

        // Displacement of velocity * dt, divided by the pitch of 0.5.
        assert_relative_eq!(position[0], 5.0 + 0.4, epsilon = 1e-12);
        assert_relative_eq!(position[1], 5.0 - 0.2, epsilon = 1e-12);
        assert_relative_eq!(position[2], 5.0 + 0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_linear_shear() {
        // u = y, v = 0: x grows by y * t exactly.
        let block = block_from(|p| [p[1], 0.0, 0.0]);
        let mut position = [4.0, 6.0, 4.0];
        advance(&block, 0.25, &mut position);

        // y in physical space is (6 - 0.5) * 0.5 = 2.75, displacement in index space 2.75 * 0.25 / 0.5.
        assert_relative_eq!(position[0], 4.0 + 2.75 * 0.5, epsilon = 1e-10);
        assert_relative_eq!(position[1], 6.0, epsilon = 1e-12);
    }
}
