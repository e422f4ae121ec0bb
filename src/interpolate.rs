//! Trilinear interpolation inside a block.
//!
//! Positions inside a block are carried in local index space: the cell spacing is
//! one and cell centres sit at integer coordinates. The first interior cell has
//! index `halo`, so its centre is at `halo` and its lower corner at `halo - 0.5`.

use crate::{
    block::Block,
    constants::VECTOR_LENGTH,
    types::{flatten_index, Vec3},
};

/// Convert a physical position into the local index space of a block.
pub fn convert_global_to_local(global: Vec3, origin: Vec3, pitch: Vec3, halo: usize) -> Vec3 {
    let shift = halo as f64 - 0.5;
    [
        (global[0] - origin[0]) / pitch[0] + shift,
        (global[1] - origin[1]) / pitch[1] + shift,
        (global[2] - origin[2]) / pitch[2] + shift,
    ]
}

/// Convert a local index space position back into a physical position.
pub fn convert_local_to_global(local: Vec3, origin: Vec3, pitch: Vec3, halo: usize) -> Vec3 {
    let shift = halo as f64 - 0.5;
    [
        (local[0] - shift) * pitch[0] + origin[0],
        (local[1] - shift) * pitch[1] + origin[1],
        (local[2] - shift) * pitch[2] + origin[2],
    ]
}

/// Interpolate the first three components of a block's field at a local position.
///
/// Positions outside of the block are clamped onto its outermost cell centres.
pub fn interpolate(block: &Block, local: Vec3) -> Vec3 {
    let size = block.size();
    let ncells = size.iter().product::<usize>();
    let data = block.data();
    debug_assert!(data.len() >= VECTOR_LENGTH * ncells);

    let mut lower = [0; 3];
    let mut frac = [0.0; 3];
    for axis in 0..3 {
        let upper = (size[axis] - 1) as f64;
        let x = local[axis].clamp(0.0, upper);
        let cell = (x.floor() as usize).min(size[axis].saturating_sub(2));
        lower[axis] = cell;
        frac[axis] = (x - cell as f64).clamp(0.0, 1.0);
    }

    let [ip, jp, kp] = frac;
    let [im, jm, km] = [1.0 - ip, 1.0 - jp, 1.0 - kp];
    let upper = [
        (lower[0] + 1).min(size[0] - 1),
        (lower[1] + 1).min(size[1] - 1),
        (lower[2] + 1).min(size[2] - 1),
    ];

    let corner = |i: usize, j: usize, k: usize| flatten_index([i, j, k], size);
    let corners = [
        (corner(lower[0], lower[1], lower[2]), im * jm * km),
        (corner(upper[0], lower[1], lower[2]), ip * jm * km),
        (corner(lower[0], upper[1], lower[2]), im * jp * km),
        (corner(upper[0], upper[1], lower[2]), ip * jp * km),
        (corner(lower[0], lower[1], upper[2]), im * jm * kp),
        (corner(upper[0], lower[1], upper[2]), ip * jm * kp),
        (corner(lower[0], upper[1], upper[2]), im * jp * kp),
        (corner(upper[0], upper[1], upper[2]), ip * jp * kp),
    ];

    let mut result = [0.0; 3];
    for (component, value) in result.iter_mut().enumerate() {
        let field = &data[component * ncells..(component + 1) * ncells];
        *value = corners
            .iter()
            .map(|&(index, weight)| weight * field[index])
            .sum();
    }
    result
}

#[cfg(test)]
mod test {
    use approx::assert_relative_eq;
    use rand::Rng;

    use super::{convert_global_to_local, convert_local_to_global, interpolate};
    use crate::{
        block::{Block, BlockHeader},
        config::Decomposition,
        fluid::FluidField,
        spatial_index::SpatialIndex,
        tools::seeded_rng,
    };

    fn linear_block(block_id: i64) -> (SpatialIndex, Block) {
        let index = SpatialIndex::new(&Decomposition::default()).unwrap();
        let field = FluidField::from_fn(&index, 0, 3, 0.0, |p| {
            [1.0 + 2.0 * p[0], p[1] - p[2], 0.5 * p[2]]
        });
        let geometry = index.block_geometry(block_id);
        let header = BlockHeader::new(&geometry, 1, index.pitch());
        let block = Block::new(header, 1, 0.0, field.pack_block(&geometry));
        (index, block)
    }

    #[test]
    fn test_local_coordinates() {
        let origin = [1.0, 2.0, 3.0];
        let pitch = [0.5, 0.25, 2.0];

        // The centre of the first interior cell maps onto the halo index.
        let centre = [1.25, 2.125, 4.0];
        assert_eq!(convert_global_to_local(centre, origin, pitch, 2), [2.0, 2.0, 2.0]);

        let mut rng = seeded_rng(1);
        for _ in 0..100 {
            let global = [
                rng.gen_range(-5.0..5.0),
                rng.gen_range(-5.0..5.0),
                rng.gen_range(-5.0..5.0),
            ];
            let back = convert_local_to_global(
                convert_global_to_local(global, origin, pitch, 1),
                origin,
                pitch,
                1,
            );
            for axis in 0..3 {
                assert_relative_eq!(back[axis], global[axis], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_linear_field_is_reproduced() {
        let (index, block) = linear_block(3);
        let mut rng = seeded_rng(2);

        for _ in 0..100 {
            // Stay between the outermost cell centres of the block.
            let global = [
                block.origin()[0] - 0.5 + rng.gen_range(0.0..5.0),
                block.origin()[1] - 0.5 + rng.gen_range(0.0..5.0),
                block.origin()[2] - 0.5 + rng.gen_range(0.0..5.0),
            ];
            let local = convert_global_to_local(global, block.origin(), index.pitch(), 1);
            let value = interpolate(&block, local);

            assert_relative_eq!(value[0], 1.0 + 2.0 * global[0], epsilon = 1e-10);
            assert_relative_eq!(value[1], global[1] - global[2], epsilon = 1e-10);
            assert_relative_eq!(value[2], 0.5 * global[2], epsilon = 1e-10);
        }
    }

    #[test]
    fn test_cell_centre_values() {
        let (_, block) = linear_block(0);

        // Local (1, 1, 1) is the centre of global cell (0, 0, 0) at (0.5, 0.5, 0.5).
        let value = interpolate(&block, [1.0, 1.0, 1.0]);
        assert_relative_eq!(value[0], 2.0);
        assert_relative_eq!(value[1], 0.0);
        assert_relative_eq!(value[2], 0.25);

        // Clamped onto the outermost centres.
        let clamped = interpolate(&block, [-3.0, 1.0, 1.0]);
        let edge = interpolate(&block, [0.0, 1.0, 1.0]);
        assert_eq!(clamped, edge);
    }
}
