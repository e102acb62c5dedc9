#![warn(missing_docs)]
//! Sampling core of a prioritized experience replay pipeline.
//!
//! This crate owns the backend-free half of batch preparation for
//! reinforcement learning:
//!
//! - [`DualSegmentTree`]: a sum/min indexed-priority structure with
//!   O(log N) point updates, range queries and inverse-CDF lookups.
//! - [`PrioritizedSampler`]: proportional prioritized sampling with
//!   importance weights and a serializable state snapshot.
//! - [`RingPool`]: fixed-capacity circular record storage sharing its slot
//!   index space with the sampler.
//!
//! Tensor collation and augmentation live in the companion `slipstream-tch`
//! crate.
pub mod error;
pub use error::ReplayError;

mod config;
pub use config::SamplerConfig;

mod segment_tree;
pub use segment_tree::DualSegmentTree;

mod sampler;
pub use sampler::{ExperienceSampler, PrioritizedSampler, SampledBatch, SamplerSnapshot};

mod pool;
pub use pool::{ExperiencePool, RingPool, Transition};
