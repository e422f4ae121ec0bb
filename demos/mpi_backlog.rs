//! Check that a request backlog larger than the per-round cap is served in
//! `ceil(backlog / cap)` rounds.

use lpt_staging::{
    config::StagingConfig,
    fluid::FluidField,
    particle::{Particle, ParticleId, ParticleStore},
    tracker::SimulationContext,
    transport::mpi::{attach_send_buffer, MpiTransport},
};
use mpi::traits::Communicator;

pub fn main() {
    // Initialise MPI
    let mut universe = mpi::initialize().unwrap();
    let size = universe.world().size() as usize;

    // The single subdomain lives on the last rank.
    let cap = 3;
    let config = StagingConfig {
        fluid_rank_offset: size - 1,
        max_requests_per_destination: cap,
        prefetch_neighbors: false,
        ..Default::default()
    };
    attach_send_buffer(&mut universe, &config, size);

    let comm = universe.world();
    let rank = comm.rank() as usize;

    let transport = MpiTransport::new(&comm, cap);
    let mut context = SimulationContext::new(config, transport).unwrap();
    let field = context
        .own_subdomain()
        .map(|subdomain| FluidField::zeros(context.index(), subdomain, 3, 0.0));

    // One particle in the centre of every block.
    let mut particles = ParticleStore::new();
    let nblocks = context.index().block_count();
    for block_id in 0..nblocks {
        let geometry = context.index().block_geometry(block_id as i64);
        let position = [0, 1, 2].map(|axis| {
            geometry.origin[axis] + 0.5 * geometry.cells[axis] as f64 * context.index().pitch()[axis]
        });
        particles.emit(
            context.index(),
            Particle::new(ParticleId::new([rank as i32, 0], block_id as i64), position, 0.0, 1.0),
        );
    }

    let report = context
        .advance_timestep(&mut particles, field.as_ref())
        .unwrap();

    assert_eq!(report.rounds, nblocks.div_ceil(cap));
    assert_eq!(report.integrated, nblocks);

    if rank == 0 {
        println!(
            "Backlog of {} blocks served in {} rounds.",
            nblocks, report.rounds
        );
    }
}
