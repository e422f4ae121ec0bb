//! Data staging and transport core for distributed Lagrangian particle tracking.
//!
//! The fluid velocity field is decomposed into subdomains, each owned by one rank, and
//! every subdomain into blocks. Ranks tracking particles fetch the blocks their
//! particles need in request rounds, keep them in a bounded cache and integrate the
//! trajectories with a Runge-Kutta-Gill scheme on trilinearly interpolated velocities.
#![cfg_attr(feature = "strict", deny(warnings), deny(unused_crate_dependencies))]
#![warn(missing_docs)]

pub mod block;
pub mod cache;
pub mod config;
pub mod constants;
pub mod error;
pub mod fluid;
pub mod geometry;
pub mod integrate;
pub mod interpolate;
pub mod logging;
pub mod particle;
pub mod spatial_index;
pub mod tools;
pub mod tracker;
pub mod trajectory;
pub mod transfer;
pub mod transport;
pub mod types;

pub use config::{Decomposition, StagingConfig};
pub use error::{StagingError, StagingResult, TransportError};
pub use tracker::SimulationContext;
