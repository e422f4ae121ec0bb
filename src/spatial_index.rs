//! Addressing of blocks and subdomains.
//!
//! The domain is cut into a grid of subdomains, each subdomain into a grid of blocks.
//! Along every axis the cells are distributed into nearly equal parts, the first
//! `length % parts` parts receiving one extra cell. Block ids are global: the 3d block
//! index over the whole domain flattened with `i + j * imax + k * imax * jmax`.

use itertools::{iproduct, Itertools};
use log::{debug, error};

use crate::{
    config::Decomposition,
    constants::OUT_OF_BOUNDS_BLOCK,
    error::{StagingError, StagingResult},
    geometry::{BoundsCheck, PhysicalBox},
    tools::{boundaries, split_lengths},
    transport::Transport,
    types::{flatten_index, unflatten_index, BlockId, SubDomainId, Vec3},
};

/// Geometry of a single block.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BlockGeometry {
    /// Global id of the block.
    pub block_id: BlockId,
    /// Subdomain owning the block.
    pub subdomain_id: SubDomainId,
    /// Global cell index of the first interior cell.
    pub origin_cell: [usize; 3],
    /// Number of interior cells.
    pub cells: [usize; 3],
    /// Physical position of the lower corner of the first interior cell.
    pub origin: Vec3,
    /// Cell offset of the block inside its subdomain.
    pub subdomain_offset: [usize; 3],
}

impl BlockGeometry {
    /// Number of cells including `halo` guard cells on every side.
    pub fn size_with_halo(&self, halo: usize) -> [usize; 3] {
        [
            self.cells[0] + 2 * halo,
            self.cells[1] + 2 * halo,
            self.cells[2] + 2 * halo,
        ]
    }
}

/// Maps coordinates to blocks and blocks to subdomains.
pub struct SpatialIndex {
    decomposition: Decomposition,
    domain_box: PhysicalBox,
    nblocks: [usize; 3],
    subdomain_bounds: [Vec<usize>; 3],
    block_bounds: [Vec<usize>; 3],
    block_coords: [Vec<f64>; 3],
}

impl SpatialIndex {
    /// Build the boundary tables of a decomposition.
    pub fn new(decomposition: &Decomposition) -> StagingResult<Self> {
        decomposition.validate()?;

        let mut nblocks = [0; 3];
        let mut subdomain_bounds: [Vec<usize>; 3] = Default::default();
        let mut block_bounds: [Vec<usize>; 3] = Default::default();
        let mut block_coords: [Vec<f64>; 3] = Default::default();

        for axis in 0..3 {
            let subdomain_lengths =
                split_lengths(decomposition.domain_cells[axis], decomposition.subdomains[axis]);

            // Every subdomain is split into its own blocks, so the block lengths are
            // the concatenation of the per subdomain splits.
            let block_lengths = subdomain_lengths
                .iter()
                .flat_map(|&length| split_lengths(length, decomposition.blocks_per_subdomain[axis]))
                .collect_vec();

            nblocks[axis] = block_lengths.len();
            subdomain_bounds[axis] = boundaries(&subdomain_lengths);
            block_bounds[axis] = boundaries(&block_lengths);
            block_coords[axis] = block_bounds[axis]
                .iter()
                .map(|&cell| decomposition.origin[axis] + cell as f64 * decomposition.pitch[axis])
                .collect_vec();
        }

        let extent = [
            decomposition.domain_cells[0] as f64 * decomposition.pitch[0],
            decomposition.domain_cells[1] as f64 * decomposition.pitch[1],
            decomposition.domain_cells[2] as f64 * decomposition.pitch[2],
        ];

        Ok(Self {
            decomposition: decomposition.clone(),
            domain_box: PhysicalBox::from_origin_and_extent(decomposition.origin, extent),
            nblocks,
            subdomain_bounds,
            block_bounds,
            block_coords,
        })
    }

    /// Build the index after checking that all ranks use the same decomposition.
    ///
    /// The parameters of rank 0 are broadcast and compared with the local ones.
    pub fn initialize<T: Transport>(
        decomposition: &Decomposition,
        transport: &mut T,
    ) -> StagingResult<Self> {
        let local = decomposition.to_params();
        let mut root = local.clone();
        transport.broadcast(&mut root)?;

        if root != local {
            error!(
                "rank {}: decomposition differs from rank 0 ({:?} vs {:?})",
                transport.rank(),
                local,
                root
            );
            return Err(StagingError::DecompositionMismatch {
                rank: transport.rank(),
                expected: root,
                found: local,
            });
        }

        let index = Self::new(decomposition)?;
        debug!(
            "Spatial index: {:?} blocks in {:?} subdomains, domain {}",
            index.nblocks, decomposition.subdomains, index.domain_box
        );
        Ok(index)
    }

    /// The decomposition the index was built from.
    pub fn decomposition(&self) -> &Decomposition {
        &self.decomposition
    }

    /// The physical domain.
    pub fn domain_box(&self) -> &PhysicalBox {
        &self.domain_box
    }

    /// Cell spacing.
    pub fn pitch(&self) -> Vec3 {
        self.decomposition.pitch
    }

    /// Guard cell width.
    pub fn halo(&self) -> usize {
        self.decomposition.halo
    }

    /// Number of blocks along each axis.
    pub fn blocks_per_axis(&self) -> [usize; 3] {
        self.nblocks
    }

    /// Total number of blocks.
    pub fn block_count(&self) -> usize {
        self.nblocks.iter().product()
    }

    /// Total number of subdomains.
    pub fn subdomain_count(&self) -> usize {
        self.decomposition.subdomain_count()
    }

    /// True if `block_id` addresses an existing block.
    pub fn is_valid_block(&self, block_id: BlockId) -> bool {
        block_id >= 0 && (block_id as usize) < self.block_count()
    }

    /// The 3d block index of a block id.
    pub fn block_index_3d(&self, block_id: BlockId) -> [usize; 3] {
        assert!(self.is_valid_block(block_id), "invalid block id {block_id}");
        unflatten_index(block_id as usize, self.nblocks)
    }

    /// The block id of a 3d block index.
    pub fn block_id_from_index(&self, index: [usize; 3]) -> BlockId {
        flatten_index(index, self.nblocks) as BlockId
    }

    /// Find the block containing `coord` by a linear scan of the boundary tables.
    ///
    /// Returns [OUT_OF_BOUNDS_BLOCK] if the coordinate is outside of the domain.
    pub fn find_block_id_by_coord_linear(&self, coord: Vec3) -> BlockId {
        if !self.check_bounds(coord).is_inside() {
            return OUT_OF_BOUNDS_BLOCK;
        }

        let mut index = [0; 3];
        for axis in 0..3 {
            let bounds = &self.block_coords[axis];
            // The upper face of the domain belongs to the last block.
            index[axis] = (0..self.nblocks[axis])
                .find(|&i| coord[axis] < bounds[i + 1])
                .unwrap_or(self.nblocks[axis] - 1);
        }

        self.block_id_from_index(index)
    }

    /// Find the block containing `coord` by a binary search of the boundary tables.
    ///
    /// Returns [OUT_OF_BOUNDS_BLOCK] if the coordinate is outside of the domain.
    pub fn find_block_id_by_coord_binary(&self, coord: Vec3) -> BlockId {
        if !self.check_bounds(coord).is_inside() {
            return OUT_OF_BOUNDS_BLOCK;
        }

        let mut index = [0; 3];
        for axis in 0..3 {
            let upper = &self.block_coords[axis][1..];
            index[axis] = upper
                .partition_point(|&bound| bound <= coord[axis])
                .min(self.nblocks[axis] - 1);
        }

        self.block_id_from_index(index)
    }

    /// Find the block containing `coord`.
    pub fn find_block_id_by_coord(&self, coord: Vec3) -> BlockId {
        self.find_block_id_by_coord_binary(coord)
    }

    /// Find the subdomain owning a block.
    pub fn find_subdomain_id_by_block(&self, block_id: BlockId) -> SubDomainId {
        let index = self.block_index_3d(block_id);
        let per_subdomain = self.decomposition.blocks_per_subdomain;
        let subdomain_index = [
            index[0] / per_subdomain[0],
            index[1] / per_subdomain[1],
            index[2] / per_subdomain[2],
        ];
        flatten_index(subdomain_index, self.decomposition.subdomains) as SubDomainId
    }

    /// All valid blocks of the 3x3x3 neighbourhood of a block, including the block itself.
    ///
    /// Ids are returned in ascending order.
    pub fn find_neighbor_block_ids(&self, block_id: BlockId) -> Vec<BlockId> {
        let center = self.block_index_3d(block_id);
        iproduct!(-1_i64..=1, -1_i64..=1, -1_i64..=1)
            .filter_map(|(dk, dj, di)| {
                let mut index = [0; 3];
                for (axis, offset) in [di, dj, dk].into_iter().enumerate() {
                    let value = center[axis] as i64 + offset;
                    if value < 0 || value >= self.nblocks[axis] as i64 {
                        return None;
                    }
                    index[axis] = value as usize;
                }
                Some(self.block_id_from_index(index))
            })
            .collect()
    }

    /// Check a position against the domain faces.
    pub fn check_bounds(&self, coord: Vec3) -> BoundsCheck {
        self.domain_box.check_bounds(coord)
    }

    /// First cell and number of cells of a subdomain.
    pub fn subdomain_cells(&self, subdomain_id: SubDomainId) -> ([usize; 3], [usize; 3]) {
        assert!(
            subdomain_id >= 0 && (subdomain_id as usize) < self.subdomain_count(),
            "invalid subdomain id {subdomain_id}"
        );
        let index = unflatten_index(subdomain_id as usize, self.decomposition.subdomains);

        let mut first = [0; 3];
        let mut cells = [0; 3];
        for axis in 0..3 {
            let bounds = &self.subdomain_bounds[axis];
            first[axis] = bounds[index[axis]];
            cells[axis] = bounds[index[axis] + 1] - bounds[index[axis]];
        }
        (first, cells)
    }

    /// Geometry of a block.
    pub fn block_geometry(&self, block_id: BlockId) -> BlockGeometry {
        let index = self.block_index_3d(block_id);
        let subdomain_id = self.find_subdomain_id_by_block(block_id);
        let (subdomain_first, _) = self.subdomain_cells(subdomain_id);

        let mut origin_cell = [0; 3];
        let mut cells = [0; 3];
        let mut origin = [0.0; 3];
        let mut subdomain_offset = [0; 3];
        for axis in 0..3 {
            let bounds = &self.block_bounds[axis];
            origin_cell[axis] = bounds[index[axis]];
            cells[axis] = bounds[index[axis] + 1] - bounds[index[axis]];
            origin[axis] = self.block_coords[axis][index[axis]];
            subdomain_offset[axis] = origin_cell[axis] - subdomain_first[axis];
        }

        BlockGeometry {
            block_id,
            subdomain_id,
            origin_cell,
            cells,
            origin,
            subdomain_offset,
        }
    }

    /// All blocks owned by a subdomain in ascending order.
    pub fn blocks_of_subdomain(&self, subdomain_id: SubDomainId) -> Vec<BlockId> {
        (0..self.block_count() as BlockId)
            .filter(|&block_id| self.find_subdomain_id_by_block(block_id) == subdomain_id)
            .collect()
    }

    /// Largest number of cells of any block, including the halo.
    pub fn max_block_cells(&self) -> usize {
        let halo = self.halo();
        (0..3)
            .map(|axis| {
                self.block_bounds[axis]
                    .iter()
                    .tuple_windows()
                    .map(|(a, b)| b - a)
                    .max()
                    .unwrap_or(0)
                    + 2 * halo
            })
            .product()
    }
}

#[cfg(test)]
mod test {
    use rand::Rng;

    use super::SpatialIndex;
    use crate::{
        config::Decomposition,
        constants::{NNEIGHBOURHOOD, OUT_OF_BOUNDS_BLOCK},
        tools::seeded_rng,
    };

    fn uneven_decomposition() -> Decomposition {
        Decomposition {
            domain_cells: [10, 7, 9],
            subdomains: [2, 1, 3],
            blocks_per_subdomain: [2, 3, 1],
            origin: [-1.0, 0.5, 2.0],
            pitch: [0.25, 0.5, 1.0],
            halo: 1,
        }
    }

    #[test]
    fn test_block_tables() {
        let index = SpatialIndex::new(&uneven_decomposition()).unwrap();

        // x: subdomains of 5 and 5 cells, blocks of [3, 2] and [3, 2].
        // y: one subdomain of 7 cells, blocks [3, 2, 2].
        // z: subdomains of 3 cells each, one block each.
        assert_eq!(index.blocks_per_axis(), [4, 3, 3]);
        assert_eq!(index.block_count(), 36);
        assert_eq!(index.subdomain_count(), 6);

        let geometry = index.block_geometry(index.block_id_from_index([2, 1, 2]));
        assert_eq!(geometry.origin_cell, [5, 3, 6]);
        assert_eq!(geometry.cells, [3, 2, 3]);
        assert_eq!(geometry.subdomain_offset, [0, 3, 0]);
        assert_eq!(geometry.origin, [0.25, 2.0, 8.0]);
        assert_eq!(geometry.subdomain_id, 1 + 2 * 2);

        assert_eq!(index.max_block_cells(), 5 * 5 * 5);
    }

    #[test]
    fn test_find_subdomain() {
        let index = SpatialIndex::new(&uneven_decomposition()).unwrap();

        for block_id in 0..index.block_count() as i64 {
            let geometry = index.block_geometry(block_id);
            let (first, cells) = index.subdomain_cells(geometry.subdomain_id);
            for axis in 0..3 {
                assert!(geometry.origin_cell[axis] >= first[axis]);
                assert!(
                    geometry.origin_cell[axis] + geometry.cells[axis] <= first[axis] + cells[axis]
                );
            }
        }

        let owned: usize = (0..6)
            .map(|subdomain| index.blocks_of_subdomain(subdomain).len())
            .sum();
        assert_eq!(owned, 36);
    }

    #[test]
    fn test_linear_and_binary_search_agree() {
        let index = SpatialIndex::new(&uneven_decomposition()).unwrap();
        let mut rng = seeded_rng(0);
        let lower = index.domain_box().lower();
        let upper = index.domain_box().upper();

        for _ in 0..1000 {
            let coord = [
                rng.gen_range(lower[0] - 0.5..upper[0] + 0.5),
                rng.gen_range(lower[1] - 0.5..upper[1] + 0.5),
                rng.gen_range(lower[2] - 0.5..upper[2] + 0.5),
            ];
            let linear = index.find_block_id_by_coord_linear(coord);
            assert_eq!(linear, index.find_block_id_by_coord_binary(coord));

            if linear != OUT_OF_BOUNDS_BLOCK {
                let geometry = index.block_geometry(linear);
                for axis in 0..3 {
                    assert!(coord[axis] >= geometry.origin[axis]);
                }
            }
        }

        // Block boundaries and the domain faces.
        for coord in [lower, upper, [0.25, 2.0, 8.0], [0.2499, 1.9999, 7.9999]] {
            assert_eq!(
                index.find_block_id_by_coord_linear(coord),
                index.find_block_id_by_coord_binary(coord)
            );
        }
        assert_eq!(
            index.find_block_id_by_coord(upper),
            index.block_count() as i64 - 1
        );
        assert_eq!(index.find_block_id_by_coord(lower), 0);
        assert_eq!(
            index.find_block_id_by_coord([0.25, 2.0, 8.0]),
            index.block_id_from_index([2, 1, 2])
        );
    }

    #[test]
    fn test_out_of_bounds() {
        let index = SpatialIndex::new(&Decomposition::default()).unwrap();

        assert_eq!(index.find_block_id_by_coord([-0.1, 1.0, 1.0]), OUT_OF_BOUNDS_BLOCK);
        assert_eq!(index.find_block_id_by_coord([1.0, 8.1, 1.0]), OUT_OF_BOUNDS_BLOCK);
        assert!(index.check_bounds([1.0, 8.1, 1.0]).above(1));
        assert_eq!(index.find_block_id_by_coord([8.0, 8.0, 8.0]), 7);
    }

    #[test]
    fn test_neighbours() {
        let index = SpatialIndex::new(&uneven_decomposition()).unwrap();

        // A corner block has 8 neighbours including itself.
        assert_eq!(index.find_neighbor_block_ids(0).len(), 8);

        // A block in the middle of x and y, but on the lower z face.
        let block = index.block_id_from_index([1, 1, 0]);
        let neighbours = index.find_neighbor_block_ids(block);
        assert_eq!(neighbours.len(), 18);
        assert!(neighbours.contains(&block));
        assert!(neighbours.windows(2).all(|pair| pair[0] < pair[1]));

        let center = index.block_id_from_index([1, 1, 1]);
        assert_eq!(index.find_neighbor_block_ids(center).len(), NNEIGHBOURHOOD);
    }

    #[test]
    fn test_default_decomposition() {
        let index = SpatialIndex::new(&Decomposition::default()).unwrap();

        assert_eq!(index.block_count(), 8);
        assert_eq!(index.find_block_id_by_coord([0.5, 0.5, 0.5]), 0);
        assert_eq!(index.find_block_id_by_coord([4.5, 0.5, 0.5]), 1);
        assert_eq!(index.find_block_id_by_coord([0.5, 4.5, 0.5]), 2);
        assert_eq!(index.find_block_id_by_coord([0.5, 0.5, 4.5]), 4);
        assert_eq!(index.find_subdomain_id_by_block(7), 0);
    }
}
