//! Run configuration.
//!
//! Configurations are read from JSON. Every field has a default, so a file only needs
//! to list the values that differ, e.g.
//! ```json
//! {
//!     "decomposition": { "domain_cells": [64, 64, 64], "subdomains": [2, 2, 1] },
//!     "cache_bytes": 67108864,
//!     "max_requests_per_destination": 32
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    constants::VECTOR_LENGTH,
    error::{StagingError, StagingResult},
    types::Vec3,
};

/// Decomposition of the analysis domain into subdomains and blocks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Decomposition {
    /// Number of cells of the whole domain along each axis.
    pub domain_cells: [usize; 3],
    /// Number of subdomains along each axis.
    pub subdomains: [usize; 3],
    /// Number of blocks per subdomain along each axis.
    pub blocks_per_subdomain: [usize; 3],
    /// Physical position of the lower domain corner.
    pub origin: Vec3,
    /// Cell spacing.
    pub pitch: Vec3,
    /// Number of guard cells around each block and each subdomain.
    pub halo: usize,
}

impl Default for Decomposition {
    fn default() -> Self {
        Self {
            domain_cells: [8, 8, 8],
            subdomains: [1, 1, 1],
            blocks_per_subdomain: [2, 2, 2],
            origin: [0.0, 0.0, 0.0],
            pitch: [1.0, 1.0, 1.0],
            halo: 1,
        }
    }
}

impl Decomposition {
    /// Flatten all parameters into integers.
    ///
    /// Floating point values are stored through their bit patterns so that the
    /// comparison across ranks is exact.
    pub fn to_params(&self) -> Vec<i64> {
        let mut params = Vec::with_capacity(19);
        params.extend(self.domain_cells.iter().map(|&v| v as i64));
        params.extend(self.subdomains.iter().map(|&v| v as i64));
        params.extend(self.blocks_per_subdomain.iter().map(|&v| v as i64));
        params.extend(self.origin.iter().map(|v| v.to_bits() as i64));
        params.extend(self.pitch.iter().map(|v| v.to_bits() as i64));
        params.push(self.halo as i64);
        params
    }

    /// Number of subdomains.
    pub fn subdomain_count(&self) -> usize {
        self.subdomains.iter().product()
    }

    /// Check the parameters for consistency.
    pub fn validate(&self) -> StagingResult<()> {
        for axis in 0..3 {
            if self.subdomains[axis] == 0 || self.blocks_per_subdomain[axis] == 0 {
                return Err(StagingError::InvalidConfig(format!(
                    "axis {axis}: subdomain and block counts must be positive"
                )));
            }
            let blocks = self.subdomains[axis] * self.blocks_per_subdomain[axis];
            if self.domain_cells[axis] < blocks {
                return Err(StagingError::InvalidConfig(format!(
                    "axis {axis}: {} cells cannot hold {blocks} blocks",
                    self.domain_cells[axis]
                )));
            }
            if self.pitch[axis].is_nan() || self.pitch[axis] <= 0.0 || !self.origin[axis].is_finite() {
                return Err(StagingError::InvalidConfig(format!(
                    "axis {axis}: pitch must be positive and origin finite"
                )));
            }
        }
        if self.halo == 0 {
            return Err(StagingError::InvalidConfig(
                "a halo of at least one cell is required for interpolation".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration of the staging engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Domain decomposition shared by all ranks.
    pub decomposition: Decomposition,
    /// Memory budget of the block cache in bytes.
    pub cache_bytes: usize,
    /// Maximum number of block requests sent to one rank per round.
    pub max_requests_per_destination: usize,
    /// Number of non-blocking completion tests per round before falling back to blocking waits.
    pub poll_budget: usize,
    /// Length of one timestep.
    pub delta_t: f64,
    /// Number of Runge-Kutta sub-steps per timestep.
    pub substeps: usize,
    /// Request the 26 neighbours of every occupied block at the start of a timestep.
    pub prefetch_neighbors: bool,
    /// Rank of the fluid process owning subdomain 0. Subdomain `s` lives on rank `offset + s`.
    pub fluid_rank_offset: usize,
    /// Number of components of the staged field.
    pub vector_length: usize,
    /// Log level, `RUST_LOG` is used if absent.
    pub log_level: Option<String>,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            decomposition: Decomposition::default(),
            cache_bytes: 64 << 20,
            max_requests_per_destination: 64,
            poll_budget: 1024,
            delta_t: 0.1,
            substeps: 1,
            prefetch_neighbors: true,
            fluid_rank_offset: 0,
            vector_length: VECTOR_LENGTH,
            log_level: None,
        }
    }
}

impl StagingConfig {
    /// Parse a configuration from a JSON string and validate it.
    pub fn from_json_str(json: &str) -> StagingResult<Self> {
        let config: StagingConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a configuration from a JSON file and validate it.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> StagingResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Size in bytes of the largest block a fluid rank can send.
    pub fn max_block_bytes(&self) -> usize {
        let decomposition = &self.decomposition;
        let cells: usize = (0..3)
            .map(|axis| {
                let blocks = decomposition.subdomains[axis] * decomposition.blocks_per_subdomain[axis];
                decomposition.domain_cells[axis].div_ceil(blocks) + 2 * decomposition.halo
            })
            .product();
        cells * self.vector_length * std::mem::size_of::<f64>()
    }

    /// Number of blocks the cache can hold.
    pub fn cache_capacity(&self) -> usize {
        self.cache_bytes / self.max_block_bytes()
    }

    /// Number of ranks the transport group needs at least.
    pub fn required_ranks(&self) -> usize {
        self.fluid_rank_offset + self.decomposition.subdomain_count()
    }

    /// Check the configuration for consistency.
    pub fn validate(&self) -> StagingResult<()> {
        self.decomposition.validate()?;
        if self.vector_length < VECTOR_LENGTH {
            return Err(StagingError::InvalidConfig(format!(
                "vector length {} is below {VECTOR_LENGTH}",
                self.vector_length
            )));
        }
        if self.cache_capacity() == 0 {
            return Err(StagingError::InvalidConfig(format!(
                "cache budget of {} bytes cannot hold a single block of {} bytes",
                self.cache_bytes,
                self.max_block_bytes()
            )));
        }
        if self.max_requests_per_destination == 0 {
            return Err(StagingError::InvalidConfig(
                "at least one request per destination is needed".to_string(),
            ));
        }
        if self.substeps == 0 {
            return Err(StagingError::InvalidConfig(
                "at least one sub-step is needed".to_string(),
            ));
        }
        if !(self.delta_t.is_finite() && self.delta_t > 0.0) {
            return Err(StagingError::InvalidConfig(format!(
                "timestep {} must be positive",
                self.delta_t
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::StagingConfig;
    use crate::error::StagingError;

    #[test]
    fn test_default_is_valid() {
        let config = StagingConfig::default();
        config.validate().unwrap();

        // 8 cells in 2 blocks gives 4 interior cells and 6 with halo.
        assert_eq!(config.max_block_bytes(), 6 * 6 * 6 * 3 * 8);
    }

    #[test]
    fn test_partial_json() {
        let config = StagingConfig::from_json_str(
            r#"{ "cache_bytes": 20736, "decomposition": { "halo": 1, "domain_cells": [8, 8, 8] } }"#,
        )
        .unwrap();

        assert_eq!(config.cache_capacity(), 4);
        assert_eq!(config.max_requests_per_destination, 64);
        assert_eq!(config.decomposition.blocks_per_subdomain, [2, 2, 2]);
    }

    #[test]
    fn test_rejects_small_cache() {
        let result = StagingConfig::from_json_str(r#"{ "cache_bytes": 100 }"#);
        assert!(matches!(result, Err(StagingError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_halo() {
        let result = StagingConfig::from_json_str(r#"{ "decomposition": { "halo": 0 } }"#);
        assert!(matches!(result, Err(StagingError::InvalidConfig(_))));
    }

    #[test]
    fn test_params_differ_on_pitch() {
        let mut config = StagingConfig::default();
        let params = config.decomposition.to_params();
        config.decomposition.pitch[1] = 0.5;
        assert_ne!(params, config.decomposition.to_params());
        assert_eq!(params.len(), 19);
    }
}
