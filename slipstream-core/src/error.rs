//! Errors in the library.
use thiserror::Error;

/// Errors raised by the sampler and collation pipeline.
///
/// None of these are retried internally; they surface synchronously to the
/// immediate caller.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// Malformed hyperparameters or mismatched argument cardinality.
    /// The caller must fix its inputs; retrying does not help.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A batch was requested before any slot received a priority.
    /// Recoverable by waiting for the pool to grow.
    #[error("empty pool: no slot has a positive priority")]
    EmptyPool,

    /// The priority mass is zero or negative. The sampler state is corrupt
    /// and the instance should be discarded.
    #[error("degenerate priorities: {0}")]
    DegeneratePriorities(String),

    /// A stored transition has a non-positive horizon length, which means
    /// no valid transition was ever written to that slot.
    #[error("invalid record at slot {slot}: n_steps = {n_steps}")]
    InvalidRecord {
        /// Slot the record was gathered from.
        slot: usize,
        /// The offending horizon length.
        n_steps: i64,
    },
}
