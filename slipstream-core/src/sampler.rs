//! Prioritized sampling over the experience pool's slot space.
use crate::{DualSegmentTree, ReplayError, SamplerConfig};
use anyhow::Result;
use log::trace;
use num_traits::Float;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path};

/// One `sample` call's worth of slot indices and importance weights.
///
/// Weights are a stateless function of the priorities at sampling time and
/// are not persisted anywhere.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledBatch<F> {
    /// Sampled slot indices, each in `[0, capacity)`.
    pub indices: Vec<usize>,

    /// Importance weight per sampled slot, `(p_i / p_min)^(-beta)`.
    pub weights: Vec<F>,
}

/// Capability contract for priority-weighted slot sampling.
///
/// [`PrioritizedSampler`] is the only implementation here; the trait is the
/// seam a training loop programs against.
pub trait ExperienceSampler<F> {
    /// Gives `slot` the optimistic default priority so a freshly written
    /// record is sampled promptly.
    fn insert_default(&mut self, slot: usize);

    /// Writes new raw priorities for the given slots.
    fn update_priority(&mut self, slots: &[usize], priorities: &[F]) -> Result<()>;

    /// Draws a weighted-random batch of slot indices.
    fn sample(&mut self, batch_size: usize) -> Result<SampledBatch<F>>;

    /// Serializable copy of the sampler state.
    fn snapshot(&self) -> SamplerSnapshot<F>;
}

/// Serialized sampler state: hyperparameters plus the leaf arrays of both
/// tree aggregates. Internal aggregates are deliberately absent; restoring
/// rebuilds them from the leaves so the invariant holds regardless of where
/// the snapshot came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerSnapshot<F> {
    /// Priority exponent.
    pub alpha: F,
    /// Importance sampling exponent.
    pub beta: F,
    /// Priority floor.
    pub eps: F,
    /// Largest raw priority ever observed.
    pub max_priority_seen: F,
    /// Leaves of the sum aggregate, in slot order.
    pub sum_leaves: Vec<F>,
    /// Leaves of the min aggregate, in slot order.
    pub min_leaves: Vec<F>,
}

impl<F: Serialize + DeserializeOwned> SamplerSnapshot<F> {
    /// Writes the snapshot to a file with bincode.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path)?;
        bincode::serialize_into(file, self)?;
        Ok(())
    }

    /// Reads a snapshot written by [`Self::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let snapshot = bincode::deserialize_from(rdr)?;
        Ok(snapshot)
    }
}

/// Proportional prioritized sampler.
///
/// Owns the dual segment tree over the pool's slot space and tracks the
/// running maximum raw priority used for optimistic initialization. All
/// operations run synchronously on the calling thread; one instance serves
/// one training loop.
///
/// The float parameter fixes the precision of all priority arithmetic for
/// the lifetime of the instance.
#[derive(Debug)]
pub struct PrioritizedSampler<F: Float> {
    alpha: F,
    beta: F,
    eps: F,
    max_priority_seen: F,
    tree: DualSegmentTree<F>,
    rng: fastrand::Rng,
}

impl<F: Float + std::fmt::Debug> PrioritizedSampler<F> {
    /// Builds a sampler with all slots unwritten.
    ///
    /// Fails with [`ReplayError::InvalidArgument`] on `alpha <= 0`,
    /// `beta < 0`, a negative or non-finite `eps`, or zero capacity.
    pub fn build(config: &SamplerConfig) -> Result<Self> {
        let alpha = Self::float(config.alpha, "alpha")?;
        let beta = Self::float(config.beta, "beta")?;
        let eps = Self::float(config.eps, "eps")?;
        Self::validate(alpha, beta, eps)?;
        if config.capacity == 0 {
            return Err(ReplayError::InvalidArgument("capacity must be positive".into()).into());
        }

        Ok(Self {
            alpha,
            beta,
            eps,
            max_priority_seen: F::one(),
            tree: DualSegmentTree::new(config.capacity),
            rng: fastrand::Rng::with_seed(config.seed),
        })
    }

    /// Rebuilds a sampler from a snapshot, recomputing every internal tree
    /// aggregate from the serialized leaves.
    pub fn restore(snapshot: &SamplerSnapshot<F>, seed: u64) -> Result<Self> {
        Self::validate(snapshot.alpha, snapshot.beta, snapshot.eps)?;
        if snapshot.sum_leaves.is_empty() || snapshot.sum_leaves.len() != snapshot.min_leaves.len()
        {
            return Err(ReplayError::InvalidArgument(format!(
                "snapshot leaf arrays have lengths {} and {}",
                snapshot.sum_leaves.len(),
                snapshot.min_leaves.len(),
            ))
            .into());
        }

        Ok(Self {
            alpha: snapshot.alpha,
            beta: snapshot.beta,
            eps: snapshot.eps,
            max_priority_seen: snapshot.max_priority_seen,
            tree: DualSegmentTree::from_leaves(&snapshot.sum_leaves, &snapshot.min_leaves),
            rng: fastrand::Rng::with_seed(seed),
        })
    }

    fn float(v: f64, name: &str) -> Result<F> {
        F::from(v).ok_or_else(|| {
            ReplayError::InvalidArgument(format!("{} = {} is not representable", name, v)).into()
        })
    }

    fn validate(alpha: F, beta: F, eps: F) -> Result<()> {
        if !(alpha > F::zero() && alpha.is_finite()) {
            return Err(ReplayError::InvalidArgument(format!(
                "alpha must be positive and finite, got {:?}",
                alpha
            ))
            .into());
        }
        if !(beta >= F::zero() && beta.is_finite()) {
            return Err(ReplayError::InvalidArgument(format!(
                "beta must be non-negative and finite, got {:?}",
                beta
            ))
            .into());
        }
        if !(eps >= F::zero() && eps.is_finite()) {
            return Err(ReplayError::InvalidArgument(format!(
                "eps must be non-negative and finite, got {:?}",
                eps
            ))
            .into());
        }
        Ok(())
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.tree.capacity()
    }

    /// Current importance sampling exponent.
    pub fn beta(&self) -> F {
        self.beta
    }

    /// Replaces the importance sampling exponent, e.g. from an external
    /// annealing schedule.
    pub fn set_beta(&mut self, beta: F) -> Result<()> {
        if !(beta >= F::zero() && beta.is_finite()) {
            return Err(ReplayError::InvalidArgument(format!(
                "beta must be non-negative and finite, got {:?}",
                beta
            ))
            .into());
        }
        self.beta = beta;
        Ok(())
    }

    /// Largest raw priority observed so far. Never decreases.
    pub fn max_priority_seen(&self) -> F {
        self.max_priority_seen
    }

    /// Stored (exponentiated) priority of `slot`. Zero for unwritten slots.
    pub fn priority(&self, slot: usize) -> F {
        self.tree.leaf(slot)
    }

    /// Read access to the underlying tree, for range queries.
    pub fn tree(&self) -> &DualSegmentTree<F> {
        &self.tree
    }

    fn stored_priority(&self, raw: F) -> F {
        (raw + self.eps).powf(self.alpha)
    }

    fn sample_with_masses(&self, masses: &[F]) -> Result<SampledBatch<F>> {
        let n = self.tree.capacity();
        let total = self.tree.query_sum(0, n);
        if total == F::zero() {
            return Err(ReplayError::EmptyPool.into());
        }
        let p_min = self.tree.query_min(0, n);
        if total <= F::zero() || p_min <= F::zero() {
            return Err(ReplayError::DegeneratePriorities(format!(
                "sum = {:?}, min = {:?}",
                total, p_min
            ))
            .into());
        }

        let indices = self.tree.invert_cumulative_batch(masses);
        let weights = indices
            .iter()
            .map(|&ix| (self.tree.leaf(ix) / p_min).powf(-self.beta))
            .collect();

        Ok(SampledBatch { indices, weights })
    }
}

impl<F: Float + std::fmt::Debug> ExperienceSampler<F> for PrioritizedSampler<F> {
    fn insert_default(&mut self, slot: usize) {
        let p = self.stored_priority(self.max_priority_seen);
        self.tree.update(slot, p);
        trace!("slot {} inserted with default priority {:?}", slot, p);
    }

    fn update_priority(&mut self, slots: &[usize], priorities: &[F]) -> Result<()> {
        if slots.len() != priorities.len() {
            return Err(ReplayError::InvalidArgument(format!(
                "{} slots but {} priorities",
                slots.len(),
                priorities.len()
            ))
            .into());
        }
        // Checked before any write so a failed call leaves every priority
        // untouched.
        if let Some(&slot) = slots.iter().find(|&&s| s >= self.tree.capacity()) {
            return Err(ReplayError::InvalidArgument(format!(
                "slot {} out of range for capacity {}",
                slot,
                self.tree.capacity()
            ))
            .into());
        }

        for (&slot, &raw) in slots.iter().zip(priorities.iter()) {
            self.max_priority_seen = self.max_priority_seen.max(raw);
            self.tree.update(slot, self.stored_priority(raw));
        }
        Ok(())
    }

    /// Draws `batch_size` cumulative masses uniformly in `[0, total)` and
    /// inverts each through the sum aggregate. The weight of a sampled slot
    /// uses the global minimum stored priority as a fixed normalizer; this
    /// keeps weights bounded without a per-batch scan, at the cost of the
    /// rarest sample in a batch not reaching exactly 1.0.
    fn sample(&mut self, batch_size: usize) -> Result<SampledBatch<F>> {
        let n = self.tree.capacity();
        let total = self.tree.query_sum(0, n);
        let masses = (0..batch_size)
            .map(|_| {
                // Drawn even when the pool is empty so failure does not
                // desynchronize the RNG stream between runs.
                Self::float(self.rng.f64(), "mass").map(|u| u * total)
            })
            .collect::<Result<Vec<_>>>()?;
        self.sample_with_masses(&masses)
    }

    fn snapshot(&self) -> SamplerSnapshot<F> {
        let (sum_leaves, min_leaves) = self.tree.leaves();
        SamplerSnapshot {
            alpha: self.alpha,
            beta: self.beta,
            eps: self.eps,
            max_priority_seen: self.max_priority_seen,
            sum_leaves,
            min_leaves,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ExperienceSampler, PrioritizedSampler, SamplerSnapshot};
    use crate::SamplerConfig;

    fn config(capacity: usize) -> SamplerConfig {
        SamplerConfig::default()
            .alpha(1.0)
            .beta(0.0)
            .eps(0.0)
            .capacity(capacity)
            .seed(42)
    }

    #[test]
    fn rejects_bad_hyperparameters() {
        assert!(PrioritizedSampler::<f64>::build(&config(4).alpha(0.0)).is_err());
        assert!(PrioritizedSampler::<f64>::build(&config(4).alpha(-0.5)).is_err());
        assert!(PrioritizedSampler::<f64>::build(&config(4).beta(-0.1)).is_err());
        assert!(PrioritizedSampler::<f64>::build(&config(4).eps(-1e-9)).is_err());
        assert!(PrioritizedSampler::<f64>::build(&config(0)).is_err());
        assert!(PrioritizedSampler::<f64>::build(&config(4)).is_ok());
    }

    #[test]
    fn sampling_before_any_insert_fails() {
        let mut sampler = PrioritizedSampler::<f64>::build(&config(8)).unwrap();
        let err = sampler.sample(4).unwrap_err();
        assert!(err.to_string().contains("empty pool"));
    }

    #[test]
    fn negative_mass_is_degenerate() {
        let mut sampler = PrioritizedSampler::<f64>::build(&config(4)).unwrap();
        sampler.update_priority(&[0, 1], &[1.0, -3.0]).unwrap();
        let err = sampler.sample(2).unwrap_err();
        assert!(err.to_string().contains("degenerate"));
    }

    #[test]
    fn cardinality_mismatch_is_rejected() {
        let mut sampler = PrioritizedSampler::<f64>::build(&config(4)).unwrap();
        assert!(sampler.update_priority(&[0, 1], &[1.0]).is_err());
    }

    #[test]
    fn out_of_range_slot_is_rejected_without_side_effects() {
        let mut sampler = PrioritizedSampler::<f64>::build(&config(4)).unwrap();
        let err = sampler
            .update_priority(&[1, 4], &[1.0, 1.0])
            .unwrap_err();
        assert!(err.to_string().contains("out of range"));
        // The in-range slot of the failed call must not have been written.
        assert_eq!(sampler.priority(1), 0.0);
        assert!(sampler.sample(1).is_err());
    }

    #[test]
    fn uniform_priorities_give_unit_weights_and_even_coverage() {
        let mut sampler = PrioritizedSampler::<f64>::build(&config(4)).unwrap();
        sampler
            .update_priority(&[0, 1, 2, 3], &[1.0; 4])
            .unwrap();

        let mut counts = [0usize; 4];
        let draws = 40_000;
        let batch = sampler.sample(draws).unwrap();
        assert_eq!(batch.indices.len(), draws);
        assert_eq!(batch.weights.len(), draws);
        for (&ix, &w) in batch.indices.iter().zip(batch.weights.iter()) {
            assert!(ix < 4);
            assert_eq!(w, 1.0);
            counts[ix] += 1;
        }
        for &c in counts.iter() {
            let freq = c as f64 / draws as f64;
            assert!((freq - 0.25).abs() < 0.02, "freq = {}", freq);
        }
    }

    #[test]
    fn weights_are_invariant_to_uniform_rescaling() {
        let raws = [0.5f64, 1.5, 3.0, 0.25];
        let make = |scale: f64, seed: u64| {
            let mut s =
                PrioritizedSampler::<f64>::build(&config(4).beta(0.7).seed(seed)).unwrap();
            let scaled: Vec<_> = raws.iter().map(|&p| p * scale).collect();
            s.update_priority(&[0, 1, 2, 3], &scaled).unwrap();
            s
        };

        let mut a = make(1.0, 9);
        let mut b = make(100.0, 9);
        let batch_a = a.sample(64).unwrap();
        let batch_b = b.sample(64).unwrap();
        assert_eq!(batch_a.indices, batch_b.indices);
        for (wa, wb) in batch_a.weights.iter().zip(batch_b.weights.iter()) {
            assert!((wa - wb).abs() < 1e-9);
        }
    }

    #[test]
    fn skewed_priorities_are_sampled_proportionally() {
        let mut sampler = PrioritizedSampler::<f64>::build(&config(4).seed(3)).unwrap();
        sampler
            .update_priority(&[0, 1, 2, 3], &[1.0, 1.0, 1.0, 7.0])
            .unwrap();

        let draws = 40_000;
        let batch = sampler.sample(draws).unwrap();
        let hot = batch.indices.iter().filter(|&&ix| ix == 3).count();
        let freq = hot as f64 / draws as f64;
        assert!((freq - 0.7).abs() < 0.02, "freq = {}", freq);
    }

    #[test]
    fn max_priority_never_decreases() {
        let mut sampler = PrioritizedSampler::<f64>::build(&config(4)).unwrap();
        sampler.update_priority(&[0], &[5.0]).unwrap();
        assert_eq!(sampler.max_priority_seen(), 5.0);
        sampler.update_priority(&[0], &[0.1]).unwrap();
        assert_eq!(sampler.max_priority_seen(), 5.0);

        // Optimistic initialization seeds new slots from the running max.
        sampler.insert_default(2);
        assert_eq!(sampler.priority(2), 5.0);
    }

    #[test]
    fn restore_reproduces_sampling_and_queries() {
        let cfg = config(8).alpha(0.8).beta(0.4).eps(1e-6).seed(17);
        let mut original = PrioritizedSampler::<f64>::build(&cfg).unwrap();
        original
            .update_priority(&[0, 2, 3, 5], &[0.5, 2.0, 0.1, 4.0])
            .unwrap();

        let snapshot = original.snapshot();
        let mut restored = PrioritizedSampler::restore(&snapshot, cfg.seed).unwrap();

        let tree_a = original.tree();
        let tree_b = restored.tree();
        assert_eq!(tree_a.total(), tree_b.total());
        assert_eq!(tree_a.query_min(0, 8), tree_b.query_min(0, 8));

        let batch_a = original.sample(32).unwrap();
        let batch_b = restored.sample(32).unwrap();
        assert_eq!(batch_a, batch_b);
    }

    #[test]
    fn snapshot_file_round_trip() {
        let mut sampler = PrioritizedSampler::<f32>::build(&config(4)).unwrap();
        sampler.update_priority(&[0, 1], &[1.5, 0.5]).unwrap();
        let snapshot = sampler.snapshot();

        let dir = tempdir::TempDir::new("sampler_snapshot").unwrap();
        let path = dir.path().join("sampler.bin");
        snapshot.save(&path).unwrap();
        let loaded = SamplerSnapshot::<f32>::load(&path).unwrap();
        assert_eq!(loaded, snapshot);
    }
}
