//! Error types.
//!
//! Only conditions that end the run are errors. States a particle or a cache lookup
//! can recover from are plain enums, see [crate::cache::LoadResult] and
//! [crate::trajectory::StepOutcome].

use thiserror::Error;

use crate::types::{BlockId, SubDomainId};

/// Result type of fallible staging operations.
pub type StagingResult<T> = Result<T, StagingError>;

/// Failure reported by a [crate::transport::Transport] backend.
#[derive(Error, Debug)]
pub enum TransportError {
    /// A message of the wrong kind arrived for a posted receive.
    #[error("expected a {expected} message from rank {source_rank} with tag {tag}")]
    UnexpectedMessage {
        /// Kind the receive was posted for.
        expected: &'static str,
        /// Sending rank.
        source_rank: usize,
        /// Message tag.
        tag: i32,
    },

    /// A rank outside of the transport group was addressed.
    #[error("rank {rank} is outside of a group of size {size}")]
    InvalidRank {
        /// Addressed rank.
        rank: usize,
        /// Group size.
        size: usize,
    },

    /// More block ids were put than a mailbox section holds.
    #[error("{count} requests exceed the {slots} mailbox slots per source")]
    MailboxOverflow {
        /// Number of ids in the put.
        count: usize,
        /// Slots per source section.
        slots: usize,
    },

    /// Failure inside the message passing layer.
    #[error("transport backend failure: {0}")]
    Backend(String),
}

/// Errors of the staging engine.
#[derive(Error, Debug)]
pub enum StagingError {
    /// Transport layer failure. Always fatal.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Ranks disagree about the domain decomposition.
    #[error("rank {rank}: decomposition parameters {found:?} differ from root parameters {expected:?}")]
    DecompositionMismatch {
        /// Rank detecting the mismatch.
        rank: usize,
        /// Parameters broadcast from the root.
        expected: Vec<i64>,
        /// Local parameters.
        found: Vec<i64>,
    },

    /// A configuration value is out of its admissible range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A block was requested from a rank that holds no fluid data.
    #[error("no fluid field available for subdomain {subdomain}")]
    MissingFluidField {
        /// Subdomain the request was addressed to.
        subdomain: SubDomainId,
    },

    /// A block was requested from a rank that does not own it.
    #[error("block {block} is not part of subdomain {subdomain}")]
    BlockOutsideSubdomain {
        /// Requested block.
        block: BlockId,
        /// Subdomain of the serving rank.
        subdomain: SubDomainId,
    },

    /// A served field has more components than the configured vector length.
    #[error("field of subdomain {subdomain} has {found} components, at most {expected} are configured")]
    FieldShape {
        /// Subdomain of the field.
        subdomain: SubDomainId,
        /// Components of the field.
        found: usize,
        /// Configured vector length.
        expected: usize,
    },

    /// Reading a configuration file failed.
    #[error("configuration i/o: {0}")]
    Io(#[from] std::io::Error),

    /// Parsing a configuration file failed.
    #[error("configuration parse: {0}")]
    Parse(#[from] serde_json::Error),
}

impl StagingError {
    /// Return true if the error must terminate the run.
    ///
    /// Configuration errors are detected before the transport loop starts and can be
    /// reported normally. Everything raised while ranks exchange data is fatal since
    /// the other ranks would otherwise block in the next collective.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            StagingError::InvalidConfig(_) | StagingError::Io(_) | StagingError::Parse(_)
        )
    }
}
