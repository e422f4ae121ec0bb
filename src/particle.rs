//! Particles and the particle-by-block index.

use std::collections::BTreeMap;

use log::debug;

use crate::{
    constants::OUT_OF_BOUNDS_BLOCK,
    spatial_index::SpatialIndex,
    types::{BlockId, Vec3},
};

/// Identity of a particle: the emitter that created it and a sequence number.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParticleId {
    /// Emitter key.
    pub emitter: [i32; 2],
    /// Sequence number within the emitter.
    pub sequence: i64,
}

impl ParticleId {
    /// Create a new id.
    pub fn new(emitter: [i32; 2], sequence: i64) -> Self {
        Self { emitter, sequence }
    }
}

/// A tracked particle.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Particle {
    /// Identity.
    pub id: ParticleId,
    /// Position in global coordinates.
    pub position: Vec3,
    /// Fluid velocity at the position.
    pub velocity: Vec3,
    /// Time the particle was emitted.
    pub emission_time: f64,
    /// Maximum age.
    pub lifetime: f64,
    /// Time the position belongs to.
    pub time: f64,
    /// Last timestep the particle was advanced in, -1 if never.
    pub time_step: i64,
    /// Block containing the position.
    pub block_id: BlockId,
    /// Sub-steps of the running timestep already taken. Only non-zero while the
    /// particle waits for a block in the middle of a timestep.
    pub substeps_done: usize,
}

impl Particle {
    /// Create a particle at rest.
    ///
    /// The block id is unresolved until the particle is put into a [ParticleStore].
    pub fn new(id: ParticleId, position: Vec3, emission_time: f64, lifetime: f64) -> Self {
        Self {
            id,
            position,
            velocity: [0.0; 3],
            emission_time,
            lifetime,
            time: emission_time,
            time_step: -1,
            block_id: OUT_OF_BOUNDS_BLOCK,
            substeps_done: 0,
        }
    }

    /// Age at time `now`.
    pub fn age(&self, now: f64) -> f64 {
        now - self.emission_time
    }

    /// True if the particle outlived its lifetime at time `now`.
    pub fn is_expired(&self, now: f64) -> bool {
        self.age(now) > self.lifetime
    }
}

/// Particles of one rank grouped by the block containing them.
#[derive(Clone, Debug, Default)]
pub struct ParticleStore {
    blocks: BTreeMap<BlockId, Vec<Particle>>,
}

impl ParticleStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a particle under its current block id.
    pub fn insert(&mut self, particle: Particle) {
        self.blocks
            .entry(particle.block_id)
            .or_default()
            .push(particle);
    }

    /// Add a newly emitted particle.
    ///
    /// The block id is computed from the position. Particles outside of the domain are
    /// rejected and false is returned.
    pub fn emit(&mut self, index: &SpatialIndex, mut particle: Particle) -> bool {
        particle.block_id = index.find_block_id_by_coord(particle.position);
        particle.substeps_done = 0;
        if particle.block_id == OUT_OF_BOUNDS_BLOCK {
            debug!("not emitting particle {:?} outside of the domain", particle.id);
            return false;
        }
        self.insert(particle);
        true
    }

    /// Load particles from a restart.
    ///
    /// Stored block ids are not trusted and recomputed from the positions. Returns the
    /// number of particles dropped for being outside of the domain.
    pub fn restore<I: IntoIterator<Item = Particle>>(
        &mut self,
        index: &SpatialIndex,
        particles: I,
    ) -> usize {
        particles
            .into_iter()
            .filter(|&particle| !self.emit(index, particle))
            .count()
    }

    /// Remove particles older than their lifetime at time `now`.
    ///
    /// Returns the number of removed particles.
    pub fn expire(&mut self, now: f64) -> usize {
        let mut removed = 0;
        for particles in self.blocks.values_mut() {
            let before = particles.len();
            particles.retain(|particle| !particle.is_expired(now));
            removed += before - particles.len();
        }
        self.blocks.retain(|_, particles| !particles.is_empty());
        removed
    }

    /// Remove and return all particles grouped by block.
    pub fn take_all(&mut self) -> BTreeMap<BlockId, Vec<Particle>> {
        std::mem::take(&mut self.blocks)
    }

    /// Iterate over all particles in block order.
    pub fn iter(&self) -> impl Iterator<Item = &Particle> {
        self.blocks.values().flatten()
    }

    /// Ids of the blocks holding at least one particle, ascending.
    pub fn blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.keys().copied()
    }

    /// Particles of one block.
    pub fn particles_in(&self, block_id: BlockId) -> &[Particle] {
        self.blocks.get(&block_id).map_or(&[], Vec::as_slice)
    }

    /// Number of particles.
    pub fn len(&self) -> usize {
        self.blocks.values().map(Vec::len).sum()
    }

    /// True if the store holds no particle.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
