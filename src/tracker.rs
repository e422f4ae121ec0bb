//! The per-timestep transport loop.
//!
//! Every rank runs the same sequence of rounds. A round requests the blocks the local
//! particles wait for, serves the requests addressed to the local subdomain, and
//! integrates particles as their blocks arrive. Rounds repeat until no rank has
//! requests left over.

use std::collections::BTreeMap;

use itertools::Itertools;
use log::{debug, error, info, trace, warn};
use rayon::prelude::*;

use crate::{
    cache::{Arrival, BlockCache},
    config::StagingConfig,
    constants::OUT_OF_BOUNDS_BLOCK,
    error::{StagingError, StagingResult},
    fluid::FluidField,
    particle::{Particle, ParticleStore},
    spatial_index::SpatialIndex,
    trajectory::{StepOutcome, TrajectoryStep},
    transfer::{ArrivedBlock, TransferEngine},
    transport::Transport,
    types::{BlockId, SubDomainId},
};

/// Particles waiting for a block, keyed by the block.
type Waiting = BTreeMap<BlockId, Vec<Particle>>;

/// Summary of one request round on one rank.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RoundReport {
    /// Blocks requested from other ranks.
    pub submitted: usize,
    /// Blocks received.
    pub received: usize,
    /// Blocks sent to other ranks.
    pub served: usize,
    /// Received blocks dropped because the cache was full.
    pub dropped: usize,
    /// Global decision to run another round.
    pub rerun: bool,
}

/// Summary of one timestep on one rank.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TimestepReport {
    /// Index of the timestep.
    pub step: i64,
    /// Number of request rounds.
    pub rounds: usize,
    /// Particles advanced inside their block.
    pub integrated: usize,
    /// Particles advanced into another block.
    pub moved: usize,
    /// Particles frozen for this timestep.
    pub abandoned: usize,
    /// Particles that left the domain.
    pub out_of_bounds: usize,
    /// Particles removed for exceeding their lifetime.
    pub expired: usize,
    /// Particles found already advanced.
    pub already_done: usize,
}

impl TimestepReport {
    fn record(&mut self, outcome: StepOutcome) {
        match outcome {
            StepOutcome::AlreadyDone => self.already_done += 1,
            StepOutcome::Integrated => self.integrated += 1,
            StepOutcome::MovedBlock => self.moved += 1,
            StepOutcome::Abandoned => self.abandoned += 1,
            StepOutcome::OutOfBounds => self.out_of_bounds += 1,
            StepOutcome::DeferredRetry(_) | StepOutcome::DeferredNextRound(_) => {}
        }
    }
}

/// Everything a rank needs to stage blocks and move particles.
///
/// One context is created per process and owns the transport.
pub struct SimulationContext<T: Transport> {
    config: StagingConfig,
    index: SpatialIndex,
    cache: BlockCache,
    engine: TransferEngine,
    transport: T,
    time: f64,
    step: i64,
}

impl<T: Transport> SimulationContext<T> {
    /// Set up the staging engine.
    ///
    /// Collective: all ranks of the transport have to call this with the same
    /// decomposition.
    pub fn new(config: StagingConfig, mut transport: T) -> StagingResult<Self> {
        config.validate()?;
        if transport.size() < config.required_ranks() {
            return Err(StagingError::InvalidConfig(format!(
                "{} subdomains starting at rank {} need {} ranks, the transport has {}",
                config.decomposition.subdomain_count(),
                config.fluid_rank_offset,
                config.required_ranks(),
                transport.size()
            )));
        }
        if transport.mailbox_slots() < config.max_requests_per_destination {
            warn!(
                "request cap {} exceeds the {} mailbox slots, using the slot count",
                config.max_requests_per_destination,
                transport.mailbox_slots()
            );
        }

        let index = SpatialIndex::initialize(&config.decomposition, &mut transport)?;
        let cache = BlockCache::new(
            config.cache_capacity(),
            index.subdomain_count(),
            index.halo(),
        );
        let engine = TransferEngine::new(
            config.max_requests_per_destination,
            config.fluid_rank_offset,
            index.subdomain_count(),
            config.vector_length,
        );

        info!(
            "rank {} of {}: block cache of {} blocks, at most {} requests per rank and round",
            transport.rank(),
            transport.size(),
            cache.capacity(),
            config.max_requests_per_destination.min(transport.mailbox_slots())
        );

        Ok(Self {
            config,
            index,
            cache,
            engine,
            transport,
            time: 0.0,
            step: -1,
        })
    }

    /// The configuration.
    pub fn config(&self) -> &StagingConfig {
        &self.config
    }

    /// The spatial index.
    pub fn index(&self) -> &SpatialIndex {
        &self.index
    }

    /// The block cache.
    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable access to the transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Current simulation time.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Index of the last completed timestep, -1 before the first one.
    pub fn step(&self) -> i64 {
        self.step
    }

    /// Restart from time `time` after timestep `step`.
    pub fn set_time(&mut self, time: f64, step: i64) {
        self.time = time;
        self.step = step;
    }

    /// The subdomain this rank serves, if any.
    pub fn own_subdomain(&self) -> Option<SubDomainId> {
        self.engine.subdomain_of_rank(self.transport.rank())
    }

    /// Advance all particles of this rank by one timestep.
    ///
    /// Collective: every rank has to call this once per timestep, fluid ranks with
    /// the field of their subdomain.
    pub fn advance_timestep(
        &mut self,
        particles: &mut ParticleStore,
        field: Option<&FluidField>,
    ) -> StagingResult<TimestepReport> {
        let now = self.time + self.config.delta_t;
        let now_step = self.step + 1;
        let mut report = TimestepReport {
            step: now_step,
            ..Default::default()
        };

        report.expired = particles.expire(self.time);
        let mut waiting = particles.take_all();
        if let Some(lost) = waiting.remove(&OUT_OF_BOUNDS_BLOCK) {
            report.out_of_bounds += lost.len();
        }
        self.prefetch(&waiting);

        loop {
            report.rounds += 1;
            let round = self.run_round(&mut waiting, particles, field, &mut report, now, now_step)?;
            debug!(
                "rank {}: step {} round {}: {:?}",
                self.transport.rank(),
                now_step,
                report.rounds,
                round
            );
            if !round.rerun {
                break;
            }
        }

        // Whatever still waits cannot be served in this timestep.
        for (block_id, group) in std::mem::take(&mut waiting) {
            trace!("freezing {} particles waiting for block {block_id}", group.len());
            for mut particle in group {
                particle.time = now;
                particle.time_step = now_step;
                particle.block_id = block_id;
                particle.substeps_done = 0;
                report.abandoned += 1;
                particles.insert(particle);
            }
        }

        self.cache.purge_all();
        self.time = now;
        self.step = now_step;

        info!(
            "rank {}: step {} at t = {:.6}: {} particles in {} rounds ({} integrated, {} moved, {} abandoned, {} left, {} expired)",
            self.transport.rank(),
            now_step,
            now,
            particles.len(),
            report.rounds,
            report.integrated,
            report.moved,
            report.abandoned,
            report.out_of_bounds,
            report.expired
        );
        Ok(report)
    }

    /// Queue the blocks of all particles, then their neighbourhoods.
    fn prefetch(&mut self, waiting: &Waiting) {
        for &block_id in waiting.keys() {
            let subdomain = self.index.find_subdomain_id_by_block(block_id);
            self.cache.enqueue(subdomain, block_id);
        }

        if self.config.prefetch_neighbors {
            for &block_id in waiting.keys() {
                for neighbor in self.index.find_neighbor_block_ids(block_id) {
                    let subdomain = self.index.find_subdomain_id_by_block(neighbor);
                    self.cache.enqueue(subdomain, neighbor);
                }
            }
        }
    }

    fn run_round(
        &mut self,
        waiting: &mut Waiting,
        particles: &mut ParticleStore,
        field: Option<&FluidField>,
        report: &mut TimestepReport,
        now: f64,
        now_step: i64,
    ) -> StagingResult<RoundReport> {
        let mut round = RoundReport::default();

        self.process_ready(waiting, particles, report, now, now_step);
        for &block_id in waiting.keys() {
            let subdomain = self.index.find_subdomain_id_by_block(block_id);
            self.cache.enqueue(subdomain, block_id);
        }

        let submission = self
            .engine
            .submit_requests_and_post_receives(&mut self.transport, &mut self.cache)?;
        round.submitted = submission.submitted;
        let outstanding = self.cache.requested_len().min(self.cache.capacity());
        self.cache.evict_up_to(outstanding);

        // Requests of this round are visible to their owners after the fence.
        self.transport.fence()?;
        round.served = self
            .engine
            .pack_and_send(&mut self.transport, &self.index, field)?;

        let mut budget = self.config.poll_budget;
        while self.engine.pending_receives() > 0 {
            let arrived = self.engine.poll_arrivals(&mut self.transport, &mut budget)?;
            self.receive(arrived, waiting, particles, report, &mut round, now, now_step);
        }
        let late = self.engine.drain_and_free(&mut self.transport)?;
        self.receive(late, waiting, particles, report, &mut round, now, now_step);

        self.process_ready(waiting, particles, report, now, now_step);

        let local_rerun = submission.need_rerun || round.dropped > 0 || self.cache.backlog() > 0;
        round.rerun = self.transport.any(local_rerun)?;
        Ok(round)
    }

    /// Cache arrived blocks and integrate the particles waiting for them.
    #[allow(clippy::too_many_arguments)]
    fn receive(
        &mut self,
        arrived: Vec<ArrivedBlock>,
        waiting: &mut Waiting,
        particles: &mut ParticleStore,
        report: &mut TimestepReport,
        round: &mut RoundReport,
        now: f64,
        now_step: i64,
    ) {
        if arrived.is_empty() {
            return;
        }

        let mut groups = Vec::new();
        for block in arrived {
            round.received += 1;
            match self.cache.add_arrived(block, self.time) {
                Arrival::Cached(block_id) => {
                    if let Some(group) = waiting.remove(&block_id) {
                        groups.push((block_id, group));
                    }
                }
                Arrival::Dropped(_) => round.dropped += 1,
            }
        }

        let outcomes = integrate_groups(&self.index, &self.cache, &self.config, &mut groups, now, now_step);
        settle(groups, outcomes, waiting, particles, report);
    }

    /// Integrate waiting particles whose block is resident.
    fn process_ready(
        &mut self,
        waiting: &mut Waiting,
        particles: &mut ParticleStore,
        report: &mut TimestepReport,
        now: f64,
        now_step: i64,
    ) {
        let ready = waiting
            .keys()
            .copied()
            .filter(|&block_id| self.cache.is_cached(block_id))
            .collect_vec();
        if ready.is_empty() {
            return;
        }

        let mut groups = ready
            .into_iter()
            .filter_map(|block_id| waiting.remove(&block_id).map(|group| (block_id, group)))
            .collect_vec();
        let outcomes = integrate_groups(&self.index, &self.cache, &self.config, &mut groups, now, now_step);
        settle(groups, outcomes, waiting, particles, report);
    }
}

/// Run one task per block over the particles waiting for it.
fn integrate_groups(
    index: &SpatialIndex,
    cache: &BlockCache,
    config: &StagingConfig,
    groups: &mut [(BlockId, Vec<Particle>)],
    now: f64,
    now_step: i64,
) -> Vec<Vec<StepOutcome>> {
    let delta_t = config.delta_t;
    let substeps = config.substeps;
    groups
        .par_iter_mut()
        .map(|(block_id, group)| {
            trace!("integrating {} particles of block {block_id}", group.len());
            let mut step = TrajectoryStep::new(index, cache, delta_t, substeps);
            group
                .iter_mut()
                .map(|particle| step.calc(particle, now, now_step))
                .collect()
        })
        .collect()
}

/// Put integrated particles back into the store and deferred ones into the waiting lists.
fn settle(
    groups: Vec<(BlockId, Vec<Particle>)>,
    outcomes: Vec<Vec<StepOutcome>>,
    waiting: &mut Waiting,
    particles: &mut ParticleStore,
    report: &mut TimestepReport,
) {
    for ((_, group), outcomes) in groups.into_iter().zip(outcomes) {
        for (particle, outcome) in group.into_iter().zip(outcomes) {
            report.record(outcome);
            if let Some(block_id) = outcome.waiting_for() {
                waiting.entry(block_id).or_default().push(particle);
                continue;
            }
            match outcome {
                StepOutcome::OutOfBounds => {
                    trace!("particle {:?} left the domain", particle.id);
                }
                StepOutcome::AlreadyDone => {
                    error!(
                        "particle {:?} was already advanced in step {}",
                        particle.id, particle.time_step
                    );
                    particles.insert(particle);
                }
                _ => particles.insert(particle),
            }
        }
    }
}

/// Abort all ranks if `result` holds a fatal error.
///
/// Non fatal errors and successes are passed through.
pub fn abort_on_fatal<T: Transport, R>(transport: &T, result: StagingResult<R>) -> StagingResult<R> {
    match result {
        Err(err) if err.is_fatal() => {
            error!("rank {}: fatal error: {err}", transport.rank());
            transport.abort(1)
        }
        other => other,
    }
}

#[cfg(test)]
mod test {
    use approx::assert_relative_eq;

    use super::{abort_on_fatal, SimulationContext};
    use crate::{
        config::{Decomposition, StagingConfig},
        error::StagingError,
        fluid::FluidField,
        particle::{Particle, ParticleId, ParticleStore},
        transport::{local::LocalTransport, Transport},
    };

    fn single_rank(config: StagingConfig) -> SimulationContext<LocalTransport> {
        let transport = LocalTransport::group(1, config.max_requests_per_destination)
            .pop()
            .unwrap();
        SimulationContext::new(config, transport).unwrap()
    }

    #[test]
    fn test_zero_velocity_timestep() {
        let mut context = single_rank(StagingConfig::default());
        let field = FluidField::zeros(context.index(), 0, 3, 0.0);
        let mut particles = ParticleStore::new();
        particles.emit(
            context.index(),
            Particle::new(ParticleId::new([0, 0], 0), [0.5, 0.5, 0.5], 0.0, f64::INFINITY),
        );

        let report = context.advance_timestep(&mut particles, Some(&field)).unwrap();
        assert_eq!(report.step, 0);
        assert_eq!(report.rounds, 1);
        assert_eq!(report.integrated, 1);
        assert_eq!(report.abandoned, 0);

        let particle = particles.iter().next().unwrap();
        assert_eq!(particle.block_id, 0);
        assert_eq!(particle.time_step, 0);
        assert_relative_eq!(particle.position[0], 0.5, epsilon = 1e-12);
        assert!(context.cache().is_empty());
        assert_relative_eq!(context.time(), 0.1);
    }

    #[test]
    fn test_advection_across_blocks() {
        let config = StagingConfig {
            delta_t: 0.5,
            substeps: 2,
            ..Default::default()
        };
        let mut context = single_rank(config);
        let field = FluidField::from_fn(context.index(), 0, 3, 0.0, |_| [1.0, 0.0, 0.0]);
        let mut particles = ParticleStore::new();
        for (sequence, x) in [1.2, 3.7, 7.9].into_iter().enumerate() {
            particles.emit(
                context.index(),
                Particle::new(ParticleId::new([0, 0], sequence as i64), [x, 2.0, 2.0], 0.0, f64::INFINITY),
            );
        }

        let report = context.advance_timestep(&mut particles, Some(&field)).unwrap();
        assert_eq!(report.integrated, 1);
        assert_eq!(report.moved, 1);
        assert_eq!(report.out_of_bounds, 1);
        assert_eq!(particles.len(), 2);
        assert_eq!(particles.blocks().collect::<Vec<_>>(), vec![0, 1]);

        let report = context.advance_timestep(&mut particles, Some(&field)).unwrap();
        assert_eq!(report.step, 1);
        assert_eq!(report.integrated + report.moved, 2);
        let positions = particles.iter().map(|p| p.position[0]).collect::<Vec<_>>();
        assert_relative_eq!(positions[0], 2.2, epsilon = 1e-10);
        assert_relative_eq!(positions[1], 4.7, epsilon = 1e-10);
    }

    #[test]
    fn test_request_cap_needs_more_rounds() {
        let config = StagingConfig {
            decomposition: Decomposition {
                blocks_per_subdomain: [4, 1, 1],
                ..Default::default()
            },
            max_requests_per_destination: 1,
            prefetch_neighbors: false,
            ..Default::default()
        };
        let mut context = single_rank(config);
        let field = FluidField::zeros(context.index(), 0, 3, 0.0);
        let mut particles = ParticleStore::new();
        for (sequence, x) in [0.5, 2.5, 4.5].into_iter().enumerate() {
            particles.emit(
                context.index(),
                Particle::new(ParticleId::new([0, 0], sequence as i64), [x, 1.0, 1.0], 0.0, f64::INFINITY),
            );
        }

        let report = context.advance_timestep(&mut particles, Some(&field)).unwrap();
        assert_eq!(report.rounds, 3);
        assert_eq!(report.integrated, 3);
    }

    #[test]
    fn test_small_cache_does_not_freeze_block_crossing() {
        let mut config = StagingConfig {
            delta_t: 1.0,
            substeps: 2,
            ..Default::default()
        };
        config.cache_bytes = 3 * config.max_block_bytes();
        let mut context = single_rank(config);
        assert_eq!(context.cache().capacity(), 3);

        let field = FluidField::from_fn(context.index(), 0, 3, 0.0, |_| [0.0, 0.0, 1.0]);
        let mut particles = ParticleStore::new();
        particles.emit(
            context.index(),
            Particle::new(ParticleId::new([0, 0], 0), [1.0, 1.0, 3.6], 0.0, f64::INFINITY),
        );

        let report = context.advance_timestep(&mut particles, Some(&field)).unwrap();
        assert_eq!(report.moved, 1);
        assert_eq!(report.abandoned, 0);

        let particle = particles.iter().next().unwrap();
        assert_eq!(particle.block_id, 4);
        assert_eq!(particle.substeps_done, 0);
        assert_relative_eq!(particle.position[2], 4.6, epsilon = 1e-12);
    }

    #[test]
    fn test_expired_particles_are_removed() {
        let mut context = single_rank(StagingConfig::default());
        let field = FluidField::zeros(context.index(), 0, 3, 0.0);
        let mut particles = ParticleStore::new();
        particles.emit(
            context.index(),
            Particle::new(ParticleId::new([0, 0], 0), [1.0, 1.0, 1.0], 0.0, 0.05),
        );

        context.advance_timestep(&mut particles, Some(&field)).unwrap();
        let report = context.advance_timestep(&mut particles, Some(&field)).unwrap();
        assert_eq!(report.expired, 1);
        assert!(particles.is_empty());
    }

    #[test]
    fn test_non_fatal_errors_pass() {
        let transport = LocalTransport::group(1, 1).pop().unwrap();
        let result: Result<(), StagingError> = Err(StagingError::InvalidConfig("bad".into()));
        assert!(abort_on_fatal(&transport, result).is_err());
        assert_eq!(abort_on_fatal(&transport, Ok(3)).unwrap(), 3);
        assert_eq!(transport.rank(), 0);
    }
}
