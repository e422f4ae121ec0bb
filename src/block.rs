//! Velocity blocks and their wire header.

use bytemuck::{Pod, Zeroable};

use crate::{
    spatial_index::BlockGeometry,
    types::{BlockId, SubDomainId, Vec3},
};

/// Header sent ahead of every block payload.
///
/// The layout is the in-memory layout of the process image and is sent as raw bytes,
/// so communicating ranks need the same endianness and word size.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct BlockHeader {
    /// Global block id.
    pub block_id: i64,
    /// Subdomain the block was packed on.
    pub subdomain_id: i32,
    _padding: i32,
    /// Physical position of the lower corner of the first interior cell.
    pub origin: [f64; 3],
    /// Global index of the first interior cell.
    pub origin_cell: [i32; 3],
    /// Number of cells including the halo.
    pub block_size: [i32; 3],
    /// Cell spacing.
    pub pitch: [f64; 3],
}

impl BlockHeader {
    /// Create the header of a block packed with `halo` guard cells.
    pub fn new(geometry: &BlockGeometry, halo: usize, pitch: Vec3) -> Self {
        let size = geometry.size_with_halo(halo);
        Self {
            block_id: geometry.block_id,
            subdomain_id: geometry.subdomain_id,
            _padding: 0,
            origin: geometry.origin,
            origin_cell: geometry.origin_cell.map(|v| v as i32),
            block_size: size.map(|v| v as i32),
            pitch,
        }
    }

    /// Number of cells including the halo.
    pub fn cell_count(&self) -> usize {
        self.block_size.iter().map(|&v| v as usize).product()
    }

    /// The header as raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Read a header from raw bytes.
    ///
    /// Returns `None` if the slice does not have the size of a header.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != std::mem::size_of::<BlockHeader>() {
            return None;
        }
        Some(bytemuck::pod_read_unaligned(bytes))
    }
}

/// A staged block of the velocity field.
///
/// `data` is stored component-major: all x components, then all y components and so on.
/// Within a component cells are ordered `i + j * nx + k * nx * ny`.
#[derive(Debug)]
pub struct Block {
    header: BlockHeader,
    halo: usize,
    time: f64,
    vector_length: usize,
    data: Vec<f64>,
}

impl Block {
    /// Create a block from a header and its payload.
    ///
    /// The payload is moved into the block.
    pub fn new(header: BlockHeader, halo: usize, time: f64, data: Vec<f64>) -> Self {
        let cells = header.cell_count();
        assert!(cells > 0 && data.len() % cells == 0, "payload does not match header");
        let vector_length = data.len() / cells;
        Self {
            header,
            halo,
            time,
            vector_length,
            data,
        }
    }

    /// Block id.
    pub fn id(&self) -> BlockId {
        self.header.block_id
    }

    /// Owning subdomain.
    pub fn subdomain_id(&self) -> SubDomainId {
        self.header.subdomain_id
    }

    /// The wire header.
    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    /// Origin of the first interior cell.
    pub fn origin(&self) -> Vec3 {
        self.header.origin
    }

    /// Cell spacing.
    pub fn pitch(&self) -> Vec3 {
        self.header.pitch
    }

    /// Number of cells including the halo.
    pub fn size(&self) -> [usize; 3] {
        self.header.block_size.map(|v| v as usize)
    }

    /// Guard cell width.
    pub fn halo(&self) -> usize {
        self.halo
    }

    /// Simulation time the field was captured at.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Number of components.
    pub fn vector_length(&self) -> usize {
        self.vector_length
    }

    /// The flattened field.
    pub fn data(&self) -> &[f64] {
        &self.data
    }
}
