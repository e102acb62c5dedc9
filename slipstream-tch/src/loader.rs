//! Facade wiring pool, sampler and collator behind one training-loop API.
use crate::collate::{BatchCollator, CollatedBatch, CollatorConfig};
use anyhow::Result;
use log::debug;
use serde::{Deserialize, Serialize};
use slipstream_core::{
    ExperiencePool, ExperienceSampler, PrioritizedSampler, ReplayError, RingPool, SampledBatch,
    SamplerConfig, SamplerSnapshot, Transition,
};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};
use tch::Device;

/// Configuration for [`ReplayLoader`]. The pool capacity is taken from the
/// sampler configuration; both sides share one slot space.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Default)]
pub struct ReplayLoaderConfig {
    /// Prioritized sampler hyperparameters.
    pub sampler: SamplerConfig,

    /// Collation and augmentation parameters.
    pub collator: CollatorConfig,
}

impl ReplayLoaderConfig {
    /// Loads the configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves the configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}

/// Prioritized replay front end for a training loop.
///
/// Owns the circular record pool, the prioritized sampler over the same
/// slot space, and the batch collator. The sampler math runs in `f32`,
/// matching the tensor pipeline it feeds.
pub struct ReplayLoader {
    pool: RingPool<Transition>,
    sampler: PrioritizedSampler<f32>,
    collator: BatchCollator,
}

impl ReplayLoader {
    /// Builds an empty loader issuing batches on `device`.
    pub fn build(config: &ReplayLoaderConfig, device: Device) -> Result<Self> {
        let sampler = PrioritizedSampler::build(&config.sampler)?;
        Ok(Self {
            pool: RingPool::new(config.sampler.capacity),
            sampler,
            collator: BatchCollator::build(&config.collator, device)?,
        })
    }

    /// Number of records currently stored.
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    /// True until the first record is pushed.
    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Stores a transition, overwriting the oldest slot once full, and
    /// refreshes that slot's priority optimistically so the fresh record is
    /// sampled promptly. Returns the slot written.
    pub fn push(&mut self, transition: Transition) -> usize {
        let slot = self.pool.push(transition);
        self.sampler.insert_default(slot);
        slot
    }

    /// Draws a prioritized batch of slot indices and importance weights.
    pub fn sample(&mut self, batch_size: usize) -> Result<SampledBatch<f32>> {
        self.sampler.sample(batch_size)
    }

    /// Gathers the given slots and collates them into training tensors.
    pub fn collate(
        &mut self,
        indices: &[usize],
        weights: Option<&[f32]>,
    ) -> Result<CollatedBatch> {
        let pool = &self.pool;
        let items = indices
            .iter()
            .map(|&slot| {
                pool.get(slot).map(|r| (slot, r)).ok_or_else(|| {
                    anyhow::Error::from(ReplayError::InvalidArgument(format!(
                        "slot {} holds no record",
                        slot
                    )))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.collator.collate(&items, weights)
    }

    /// One training-time step: sample, gather, collate. The returned batch
    /// carries the sampler's importance weights and the transfer event.
    pub fn sample_batch(&mut self, batch_size: usize) -> Result<CollatedBatch> {
        let sampled = self.sampler.sample(batch_size)?;
        self.collate(&sampled.indices, Some(&sampled.weights))
    }

    /// Feeds fresh learning errors back into the sampler.
    pub fn update_priority(&mut self, slots: &[usize], priorities: &[f32]) -> Result<()> {
        self.sampler.update_priority(slots, priorities)
    }

    /// Replaces the importance sampling exponent, for external annealing.
    pub fn set_beta(&mut self, beta: f32) -> Result<()> {
        self.sampler.set_beta(beta)
    }

    /// Serializable copy of the sampler state.
    pub fn snapshot(&self) -> SamplerSnapshot<f32> {
        self.sampler.snapshot()
    }

    /// Replaces the sampler state from a snapshot, e.g. after restart. The
    /// snapshot's slot count must match the pool capacity.
    pub fn restore_sampler(&mut self, snapshot: &SamplerSnapshot<f32>, seed: u64) -> Result<()> {
        if snapshot.sum_leaves.len() != self.pool.capacity() {
            return Err(ReplayError::InvalidArgument(format!(
                "snapshot covers {} slots but the pool has {}",
                snapshot.sum_leaves.len(),
                self.pool.capacity()
            ))
            .into());
        }
        self.sampler = PrioritizedSampler::restore(snapshot, seed)?;
        Ok(())
    }

    /// Drops all records and priorities, returning the loader to its
    /// freshly built state.
    pub fn reset(&mut self, config: &SamplerConfig) -> Result<()> {
        if config.capacity != self.pool.capacity() {
            return Err(ReplayError::InvalidArgument(format!(
                "reset capacity {} does not match pool capacity {}",
                config.capacity,
                self.pool.capacity()
            ))
            .into());
        }
        self.sampler = PrioritizedSampler::build(config)?;
        self.pool.clear();
        debug!("replay loader reset, {} slots cleared", config.capacity);
        Ok(())
    }
}
