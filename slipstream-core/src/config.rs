//! Configuration for the prioritized sampler.
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    default::Default,
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Configuration for [`PrioritizedSampler`](crate::PrioritizedSampler).
///
/// Hyperparameters are kept in `f64` here and converted to the sampler's
/// float precision when the sampler is built.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct SamplerConfig {
    /// Exponent applied to raw priorities (priority sharpness). Must be
    /// positive; sampling degenerates to uniform as it approaches zero.
    pub alpha: f64,

    /// Exponent of the importance sampling weights (bias-correction
    /// strength). Must be non-negative.
    pub beta: f64,

    /// Additive floor keeping stored priorities strictly positive for any
    /// non-negative raw priority.
    pub eps: f64,

    /// Number of slots, shared with the experience pool.
    pub capacity: usize,

    /// Seed of the random number generator drawing cumulative masses.
    pub seed: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            alpha: 0.6,
            beta: 0.4,
            eps: 1e-6,
            capacity: 10000,
            seed: 42,
        }
    }
}

impl SamplerConfig {
    /// Sets the priority exponent.
    pub fn alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    /// Sets the importance sampling exponent.
    pub fn beta(mut self, beta: f64) -> Self {
        self.beta = beta;
        self
    }

    /// Sets the priority floor.
    pub fn eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Sets the number of slots.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the random seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

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

#[cfg(test)]
mod tests {
    use super::SamplerConfig;
    use tempdir::TempDir;

    #[test]
    fn yaml_round_trip() {
        let config = SamplerConfig::default()
            .alpha(0.7)
            .beta(0.5)
            .capacity(4096)
            .seed(7);

        let dir = TempDir::new("sampler_config").unwrap();
        let path = dir.path().join("sampler.yaml");
        config.save(&path).unwrap();
        assert_eq!(SamplerConfig::load(&path).unwrap(), config);
    }
}
