//! Track random particles through a rotating flow with one thread per rank.
//!
//! Run with `cargo run --example local_ranks [config.json]`.

use lpt_staging::{
    config::{Decomposition, StagingConfig},
    fluid::FluidField,
    logging::init_logging,
    particle::ParticleStore,
    tools::{generate_random_particles, seeded_rng},
    tracker::{abort_on_fatal, SimulationContext},
    transport::{local::LocalTransport, Transport},
};

pub fn main() {
    let config = match std::env::args().nth(1) {
        Some(path) => StagingConfig::from_json_file(&path).unwrap(),
        None => StagingConfig {
            decomposition: Decomposition {
                domain_cells: [32, 32, 16],
                subdomains: [2, 2, 1],
                blocks_per_subdomain: [2, 2, 2],
                ..Default::default()
            },
            delta_t: 0.25,
            substeps: 2,
            max_requests_per_destination: 16,
            ..Default::default()
        },
    };
    init_logging(config.log_level.as_deref());

    // Every rank owns one subdomain and tracks its own particles.
    let nranks = config.required_ranks();
    let nparticles = 200;
    let nsteps = 20;

    let group = LocalTransport::group(nranks, config.max_requests_per_destination);
    let config = &config;

    let remaining = std::thread::scope(|s| {
        let handles = group
            .into_iter()
            .map(|transport| {
                s.spawn(move || {
                    let rank = transport.rank();
                    let context = SimulationContext::new(config.clone(), transport);
                    let mut context = match context {
                        Ok(context) => context,
                        Err(err) => panic!("rank {rank}: {err}"),
                    };

                    // Solid body rotation around the domain centre.
                    let centre = context.index().domain_box().lower().map(|v| v + 16.0);
                    let field = context.own_subdomain().map(|subdomain| {
                        FluidField::from_fn(context.index(), subdomain, 3, 0.0, |p| {
                            [-(p[1] - centre[1]) * 0.05, (p[0] - centre[0]) * 0.05, 0.0]
                        })
                    });

                    let mut rng = seeded_rng(rank);
                    let mut particles = ParticleStore::new();
                    for particle in generate_random_particles(nparticles, rank, context.index(), &mut rng) {
                        particles.emit(context.index(), particle);
                    }

                    for _ in 0..nsteps {
                        let result = context.advance_timestep(&mut particles, field.as_ref());
                        if let Err(err) = abort_on_fatal(context.transport(), result) {
                            panic!("rank {rank}: {err}");
                        }
                    }
                    particles.len()
                })
            })
            .collect::<Vec<_>>();

        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    });

    println!(
        "{} of {} particles still inside the domain after {} steps.",
        remaining.iter().sum::<usize>(),
        nranks * nparticles,
        nsteps
    );
}
