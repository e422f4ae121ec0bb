//! Fluid side velocity fields.
//!
//! A fluid rank holds the field of its subdomain padded by `halo` guard cells on
//! every side, so every block of the subdomain can be packed together with its own
//! halo without touching neighbouring ranks.

use crate::{
    spatial_index::{BlockGeometry, SpatialIndex},
    types::{flatten_index, SubDomainId, Vec3},
};

/// The field of one subdomain for one timestep.
pub struct FluidField {
    subdomain_id: SubDomainId,
    first_cell: [usize; 3],
    dims: [usize; 3],
    halo: usize,
    vector_length: usize,
    time: f64,
    data: Vec<f64>,
    mask: Vec<u8>,
}

impl FluidField {
    /// A zero field with all cells valid.
    pub fn zeros(
        index: &SpatialIndex,
        subdomain_id: SubDomainId,
        vector_length: usize,
        time: f64,
    ) -> Self {
        let (first_cell, cells) = index.subdomain_cells(subdomain_id);
        let halo = index.halo();
        let dims = cells.map(|n| n + 2 * halo);
        let ncells = dims.iter().product::<usize>();

        Self {
            subdomain_id,
            first_cell,
            dims,
            halo,
            vector_length,
            time,
            data: vec![0.0; ncells * vector_length],
            mask: vec![1; ncells],
        }
    }

    /// Sample `velocity` at the cell centres of the subdomain and its halo.
    ///
    /// Components beyond the third are zero.
    pub fn from_fn<F: Fn(Vec3) -> Vec3>(
        index: &SpatialIndex,
        subdomain_id: SubDomainId,
        vector_length: usize,
        time: f64,
        velocity: F,
    ) -> Self {
        let mut field = Self::zeros(index, subdomain_id, vector_length, time);
        let origin = index.decomposition().origin;
        let pitch = index.pitch();
        let ncells = field.cell_count();

        for k in 0..field.dims[2] {
            for j in 0..field.dims[1] {
                for i in 0..field.dims[0] {
                    let local = [i, j, k];
                    let mut position = [0.0; 3];
                    for axis in 0..3 {
                        // Global cell index, negative inside the lower halo.
                        let cell = (field.first_cell[axis] + local[axis]) as f64 - field.halo as f64;
                        position[axis] = origin[axis] + (cell + 0.5) * pitch[axis];
                    }
                    let value = velocity(position);
                    let flat = flatten_index(local, field.dims);
                    for (component, &v) in value.iter().enumerate() {
                        field.data[component * ncells + flat] = v;
                    }
                }
            }
        }
        field
    }

    /// Subdomain of the field.
    pub fn subdomain_id(&self) -> SubDomainId {
        self.subdomain_id
    }

    /// Number of cells including the halo.
    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    /// Number of cells including the halo.
    pub fn cell_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Number of components.
    pub fn vector_length(&self) -> usize {
        self.vector_length
    }

    /// Capture time of the field.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// The flattened field.
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Validity mask, one entry per cell.
    pub fn mask(&self) -> &[u8] {
        &self.mask
    }

    /// Mark the cell with halo-padded index `cell` as valid or invalid.
    pub fn set_valid(&mut self, cell: [usize; 3], valid: bool) {
        let flat = flatten_index(cell, self.dims);
        self.mask[flat] = u8::from(valid);
    }

    /// Copy one block of the subdomain including its halo.
    ///
    /// Every value is multiplied with the validity mask of its cell, so masked cells
    /// contribute zero.
    pub fn pack_block(&self, geometry: &BlockGeometry) -> Vec<f64> {
        assert_eq!(geometry.subdomain_id, self.subdomain_id);
        let size = geometry.size_with_halo(self.halo);
        let block_cells = size.iter().product::<usize>();
        let ncells = self.cell_count();
        let mut buffer = vec![0.0; block_cells * self.vector_length];

        for component in 0..self.vector_length {
            let source = &self.data[component * ncells..(component + 1) * ncells];
            let target = &mut buffer[component * block_cells..(component + 1) * block_cells];
            for k in 0..size[2] {
                for j in 0..size[1] {
                    for i in 0..size[0] {
                        // The block's halo offset cancels the subdomain's halo offset.
                        let cell = [
                            geometry.subdomain_offset[0] + i,
                            geometry.subdomain_offset[1] + j,
                            geometry.subdomain_offset[2] + k,
                        ];
                        let flat = flatten_index(cell, self.dims);
                        target[flatten_index([i, j, k], size)] =
                            source[flat] * f64::from(self.mask[flat]);
                    }
                }
            }
        }
        buffer
    }
}

#[cfg(test)]
mod test {
    use super::FluidField;
    use crate::{config::Decomposition, spatial_index::SpatialIndex, types::flatten_index};

    #[test]
    fn test_masked_block_is_zero() {
        let index = SpatialIndex::new(&Decomposition {
            domain_cells: [4, 4, 4],
            ..Default::default()
        })
        .unwrap();

        let mut field = FluidField::from_fn(&index, 0, 3, 0.0, |_| [1.0, 2.0, 3.0]);
        let dims = field.dims();
        for k in 0..dims[2] {
            for j in 0..dims[1] {
                for i in 0..dims[0] {
                    field.set_valid([i, j, k], false);
                }
            }
        }

        // Two interior cells and one halo cell on each side.
        let geometry = index.block_geometry(0);
        assert_eq!(geometry.size_with_halo(1), [4, 4, 4]);

        let packed = field.pack_block(&geometry);
        assert_eq!(packed.len(), 4 * 4 * 4 * 3);
        assert!(packed.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_pack_picks_block_cells() {
        let index = SpatialIndex::new(&Decomposition::default()).unwrap();
        // Encode the global x position in the first component.
        let field = FluidField::from_fn(&index, 0, 3, 0.0, |p| [p[0], p[1], -p[2]]);

        let geometry = index.block_geometry(1);
        let packed = field.pack_block(&geometry);
        let size = geometry.size_with_halo(1);
        let ncells = size.iter().product::<usize>();

        // The first halo cell of block 1 along x is global cell 3 with centre 3.5.
        assert_eq!(packed[flatten_index([0, 0, 0], size)], 3.5);
        assert_eq!(packed[flatten_index([1, 1, 1], size)], 4.5);
        assert_eq!(packed[ncells + flatten_index([1, 1, 1], size)], 0.5);
        assert_eq!(packed[2 * ncells + flatten_index([1, 2, 1], size)], -0.5);

        // A single invalid cell only zeroes that cell.
        let mut masked = FluidField::from_fn(&index, 0, 3, 0.0, |_| [1.0, 1.0, 1.0]);
        masked.set_valid([5, 1, 1], false);
        let packed = masked.pack_block(&geometry);
        assert_eq!(packed[flatten_index([1, 1, 1], size)], 0.0);
        assert_eq!(packed[flatten_index([2, 1, 1], size)], 1.0);
    }
}
