//! Advancing a single particle by one timestep.

use std::sync::Arc;

use log::{debug, trace};

use crate::{
    block::Block,
    cache::{BlockCache, LoadResult},
    constants::OUT_OF_BOUNDS_BLOCK,
    integrate::advance,
    interpolate::{convert_global_to_local, convert_local_to_global, interpolate},
    particle::Particle,
    spatial_index::SpatialIndex,
    types::{BlockId, Vec3},
};

/// Outcome of one attempt to advance a particle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// The particle was already advanced in this timestep. Nothing changed.
    AlreadyDone,
    /// Advanced, still inside the block it started in.
    Integrated,
    /// Advanced into another block. The particle has to be stored under its new block id.
    MovedBlock,
    /// Waits for a requested block that has not arrived. Nothing changed.
    DeferredRetry(BlockId),
    /// Waits for a block queued for the next request round. Nothing changed.
    DeferredNextRound(BlockId),
    /// Needs a block nobody fetches in this timestep. Frozen until the next timestep.
    Abandoned,
    /// Left the domain.
    OutOfBounds,
}

impl StepOutcome {
    /// The block a deferred particle waits for.
    pub fn waiting_for(&self) -> Option<BlockId> {
        match *self {
            StepOutcome::DeferredRetry(block_id) | StepOutcome::DeferredNextRound(block_id) => {
                Some(block_id)
            }
            _ => None,
        }
    }
}

/// Integrates particles with blocks taken from the cache.
///
/// The handle of the last used block is kept, so a run of particles in the same
/// block only looks the block up once.
pub struct TrajectoryStep<'a> {
    index: &'a SpatialIndex,
    cache: &'a BlockCache,
    delta_t: f64,
    substeps: usize,
    active: Option<Arc<Block>>,
}

impl<'a> TrajectoryStep<'a> {
    /// Create an integrator for timesteps of length `delta_t` split into `substeps`.
    pub fn new(index: &'a SpatialIndex, cache: &'a BlockCache, delta_t: f64, substeps: usize) -> Self {
        Self {
            index,
            cache,
            delta_t,
            substeps: substeps.max(1),
            active: None,
        }
    }

    /// Block of the handle currently held.
    pub fn active_block_id(&self) -> Option<BlockId> {
        self.active.as_ref().map(|block| block.id())
    }

    /// Make `block_id` the active block.
    ///
    /// Returns the outcome for the particle if the block is not available.
    fn acquire(&mut self, block_id: BlockId) -> Result<Arc<Block>, StepOutcome> {
        if let Some(block) = self.active.as_ref().filter(|block| block.id() == block_id) {
            return Ok(block.clone());
        }

        match self.cache.load(block_id) {
            LoadResult::Found(block) => {
                self.active = Some(block.clone());
                Ok(block)
            }
            LoadResult::NotYetArrived => Err(StepOutcome::DeferredRetry(block_id)),
            LoadResult::NotRequested => Err(StepOutcome::DeferredNextRound(block_id)),
            LoadResult::AbandonedThisStep => Err(StepOutcome::Abandoned),
        }
    }

    /// Advance `particle` to time `now`, timestep `now_step`.
    ///
    /// A particle deferred before its first sub-step is left untouched. A particle
    /// deferred in the middle of the timestep keeps the position reached and the number
    /// of sub-steps taken, and the next call continues from there in the awaited block.
    pub fn calc(&mut self, particle: &mut Particle, now: f64, now_step: i64) -> StepOutcome {
        if particle.time_step >= now_step {
            return StepOutcome::AlreadyDone;
        }

        let start_block = self.index.find_block_id_by_coord(particle.position);
        if start_block == OUT_OF_BOUNDS_BLOCK {
            particle.block_id = OUT_OF_BOUNDS_BLOCK;
            return StepOutcome::OutOfBounds;
        }

        let mut position = particle.position;
        let mut block = match self.acquire(start_block) {
            Ok(block) => block,
            Err(StepOutcome::Abandoned) => return self.abandon(particle, position, now, now_step),
            Err(outcome) => return outcome,
        };

        let dt = self.delta_t / self.substeps as f64;
        for substep in particle.substeps_done..self.substeps {
            let mut local =
                convert_global_to_local(position, block.origin(), block.pitch(), block.halo());
            advance(&block, dt, &mut local);
            position = convert_local_to_global(local, block.origin(), block.pitch(), block.halo());

            if !self.index.check_bounds(position).is_inside() {
                trace!("particle {:?} left the domain at {:?}", particle.id, position);
                particle.position = position;
                particle.block_id = OUT_OF_BOUNDS_BLOCK;
                particle.substeps_done = 0;
                return StepOutcome::OutOfBounds;
            }

            // The last block change is handled together with the velocity below.
            let block_id = self.index.find_block_id_by_coord(position);
            if block_id != block.id() && substep + 1 < self.substeps {
                block = match self.acquire(block_id) {
                    Ok(block) => block,
                    Err(StepOutcome::Abandoned) => {
                        return self.abandon(particle, position, now, now_step)
                    }
                    Err(outcome) => {
                        particle.position = position;
                        particle.substeps_done = substep + 1;
                        return outcome;
                    }
                };
            }
        }

        let final_block = self.index.find_block_id_by_coord(position);
        let velocity = self.velocity_at(position, final_block, &block);

        let started_in = particle.block_id;
        particle.position = position;
        if let Some(velocity) = velocity {
            particle.velocity = velocity;
        }
        particle.time = now;
        particle.time_step = now_step;
        particle.block_id = final_block;
        particle.substeps_done = 0;

        if final_block == started_in {
            StepOutcome::Integrated
        } else {
            StepOutcome::MovedBlock
        }
    }

    /// Velocity at the final position, if a block covering it is at hand.
    fn velocity_at(&mut self, position: Vec3, block_id: BlockId, current: &Arc<Block>) -> Option<Vec3> {
        let block = if block_id == current.id() {
            current.clone()
        } else {
            match self.acquire(block_id) {
                Ok(block) => block,
                Err(_) => {
                    debug!("block {block_id} unavailable, keeping the previous velocity");
                    return None;
                }
            }
        };
        let local = convert_global_to_local(position, block.origin(), block.pitch(), block.halo());
        Some(interpolate(&block, local))
    }

    fn abandon(&self, particle: &mut Particle, position: Vec3, now: f64, now_step: i64) -> StepOutcome {
        particle.position = position;
        particle.time = now;
        particle.time_step = now_step;
        particle.block_id = self.index.find_block_id_by_coord(position);
        particle.substeps_done = 0;
        StepOutcome::Abandoned
    }
}
