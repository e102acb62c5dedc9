#![warn(missing_docs)]
//! Batch collation for prioritized experience replay, implemented with
//! [tch](https://crates.io/crates/tch).
//!
//! This crate turns transitions sampled by
//! [`slipstream-core`](slipstream_core) into augmented training tensors:
//! multi-step return truncation against the mini-episode window,
//! asynchronous device transfer with a completion event, shared-offset
//! cropping, and label-consistent horizontal flipping.
mod augment;
mod collate;
mod event;
mod loader;

pub use augment::FlipSchema;
pub use collate::{BatchCollator, BatchDraws, CollatedBatch, CollatorConfig};
pub use event::TransferEvent;
pub use loader::{ReplayLoader, ReplayLoaderConfig};
