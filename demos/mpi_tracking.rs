//! Track random particles through a shear flow, one subdomain per MPI rank.

use lpt_staging::{
    config::{Decomposition, StagingConfig},
    fluid::FluidField,
    logging::init_logging_for_rank,
    particle::ParticleStore,
    tools::{generate_random_particles, seeded_rng},
    tracker::{abort_on_fatal, SimulationContext},
    transport::mpi::{attach_send_buffer, MpiTransport},
};
use mpi::{
    collective::SystemOperation,
    traits::{Communicator, CommunicatorCollectives},
};

pub fn main() {
    // Initialise MPI
    let mut universe = mpi::initialize().unwrap();
    let size = universe.world().size() as usize;

    // Split the domain along x, one subdomain per rank.
    let config = StagingConfig {
        decomposition: Decomposition {
            domain_cells: [8 * size, 16, 16],
            subdomains: [size, 1, 1],
            blocks_per_subdomain: [2, 2, 2],
            ..Default::default()
        },
        delta_t: 0.5,
        substeps: 2,
        max_requests_per_destination: 32,
        ..Default::default()
    };

    attach_send_buffer(&mut universe, &config, size);

    // Get the world communicator
    let comm = universe.world();
    let rank = comm.rank() as usize;
    init_logging_for_rank(rank, config.log_level.as_deref());

    let transport = MpiTransport::new(&comm, config.max_requests_per_destination);
    let mut context = SimulationContext::new(config, transport).unwrap();

    let field = context.own_subdomain().map(|subdomain| {
        FluidField::from_fn(context.index(), subdomain, 3, 0.0, |p| [0.1 * p[1], 0.0, 0.0])
    });

    // Create `nparticles` per rank.
    let nparticles = 100;
    let mut rng = seeded_rng(rank);
    let mut particles = ParticleStore::new();
    for particle in generate_random_particles(nparticles, rank, context.index(), &mut rng) {
        particles.emit(context.index(), particle);
    }

    let mut abandoned = 0;
    for _ in 0..10 {
        let result = context.advance_timestep(&mut particles, field.as_ref());
        let report = abort_on_fatal(context.transport(), result).unwrap();
        abandoned += report.abandoned;
    }

    let local = [particles.len(), abandoned];
    let mut global = [0_usize; 2];
    comm.all_reduce_into(&local[..], &mut global[..], SystemOperation::sum());

    if rank == 0 {
        println!(
            "{} of {} particles inside the domain, {} frozen steps.",
            global[0],
            size * nparticles,
            global[1]
        );
    }
}
