//! Batch collation: raw transitions to augmented training tensors.
use crate::augment::{shared_crop, FlipPlan, FlipSchema};
use crate::event::TransferEvent;
use anyhow::Result;
use log::trace;
use serde::{Deserialize, Serialize};
use slipstream_core::{ReplayError, Transition};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};
use tch::{Device, Kind, Tensor};

/// Configuration for [`BatchCollator`].
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct CollatorConfig {
    /// Image payload shape `[C, H, W]`.
    pub img_shape: [i64; 3],

    /// Length of the numeric feature vector.
    pub n_features: usize,

    /// Length of the mini-episode window, in actions. Temporal offsets are
    /// drawn from `[0, mini_race_duration)` and multi-step returns are
    /// truncated against this boundary.
    pub mini_race_duration: i64,

    /// Edge-padding margin of the shared-crop augmentation. Zero disables
    /// cropping.
    pub crop_margin: i64,

    /// Per-record probability of the horizontal-flip augmentation. Requires
    /// `flip_schema` when positive.
    pub flip_probability: f64,

    /// Action/feature remapping applied together with image mirroring.
    pub flip_schema: Option<FlipSchema>,

    /// Seed of the random number generator drawing augmentation parameters
    /// and temporal offsets.
    pub seed: u64,
}

impl Default for CollatorConfig {
    fn default() -> Self {
        Self {
            img_shape: [1, 64, 64],
            n_features: 45,
            mini_race_duration: 100,
            crop_margin: 0,
            flip_probability: 0.0,
            flip_schema: None,
            seed: 42,
        }
    }
}

impl CollatorConfig {
    /// Sets the image payload shape.
    pub fn img_shape(mut self, img_shape: [i64; 3]) -> Self {
        self.img_shape = img_shape;
        self
    }

    /// Sets the feature vector length.
    pub fn n_features(mut self, n_features: usize) -> Self {
        self.n_features = n_features;
        self
    }

    /// Sets the mini-episode window length.
    pub fn mini_race_duration(mut self, mini_race_duration: i64) -> Self {
        self.mini_race_duration = mini_race_duration;
        self
    }

    /// Sets the crop augmentation margin.
    pub fn crop_margin(mut self, crop_margin: i64) -> Self {
        self.crop_margin = crop_margin;
        self
    }

    /// Sets the flip augmentation probability and schema.
    pub fn flip(mut self, probability: f64, schema: FlipSchema) -> Self {
        self.flip_probability = probability;
        self.flip_schema = Some(schema);
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

/// The randomness consumed by one collation call, drawn up front as plain
/// data so the transform itself is a pure function of records plus draws.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchDraws {
    /// Per-record temporal offset within the mini-episode window.
    pub t_curs: Vec<i64>,

    /// Per-record horizontal-flip flag.
    pub flip_flags: Vec<bool>,

    /// Crop offset in `[0, 2 * crop_margin]^2`, shared by the whole batch
    /// and by state/next-state images.
    pub crop_offset: (i64, i64),
}

/// Tensors ready for one training step, all resident on the collator's
/// device.
///
/// Consumers must call `event.wait()` before reading any tensor.
#[derive(Debug)]
pub struct CollatedBatch {
    /// Normalized state images, `[B, C, H, W]` float.
    pub state_img: Tensor,

    /// State feature vectors, `[B, F]` float, first feature refreshed with
    /// the drawn temporal offset.
    pub state_float: Tensor,

    /// Action ids, `[B]` int64, flip-remapped where flagged.
    pub action: Tensor,

    /// Effective n-step return per record, `[B]` float.
    pub reward: Tensor,

    /// Effective discount per record, `[B]` float, zero on terminal.
    pub gamma: Tensor,

    /// Normalized next-state images, `[B, C, H, W]` float.
    pub next_state_img: Tensor,

    /// Next-state feature vectors, `[B, F]` float.
    pub next_state_float: Tensor,

    /// Importance weights from the sampler, `[B]` float, when collating a
    /// prioritized batch.
    pub weight: Option<Tensor>,

    /// Completion handshake for the asynchronous transfers above.
    pub event: TransferEvent,
}

impl CollatedBatch {
    /// Number of records in the batch.
    pub fn len(&self) -> usize {
        self.reward.size()[0] as usize
    }

    /// True for the empty batch.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turns gathered transitions into augmented, bias-corrected training
/// tensors.
///
/// All tensor work is issued asynchronously with respect to the calling
/// thread; the returned [`TransferEvent`] is the only ordering handshake.
/// One collator serves one producer thread.
#[derive(Debug)]
pub struct BatchCollator {
    device: Device,
    img_shape: [i64; 3],
    n_features: usize,
    mini_race_duration: i64,
    crop_margin: i64,
    flip_probability: f64,
    flip_plan: Option<FlipPlan>,
    rng: fastrand::Rng,
}

impl BatchCollator {
    /// Builds a collator issuing work on `device`.
    pub fn build(config: &CollatorConfig, device: Device) -> Result<Self> {
        if config.img_shape.iter().any(|&d| d <= 0) {
            return Err(ReplayError::InvalidArgument(format!(
                "img_shape {:?} has a non-positive dimension",
                config.img_shape
            ))
            .into());
        }
        if config.n_features == 0 {
            return Err(ReplayError::InvalidArgument("n_features must be positive".into()).into());
        }
        if config.mini_race_duration <= 0 {
            return Err(ReplayError::InvalidArgument(format!(
                "mini_race_duration must be positive, got {}",
                config.mini_race_duration
            ))
            .into());
        }
        if config.crop_margin < 0 {
            return Err(ReplayError::InvalidArgument(format!(
                "crop_margin must be non-negative, got {}",
                config.crop_margin
            ))
            .into());
        }
        if !(0.0..=1.0).contains(&config.flip_probability) {
            return Err(ReplayError::InvalidArgument(format!(
                "flip_probability must be in [0, 1], got {}",
                config.flip_probability
            ))
            .into());
        }
        let flip_plan = match &config.flip_schema {
            Some(schema) => Some(FlipPlan::new(schema, config.n_features, device)?),
            None if config.flip_probability > 0.0 => {
                return Err(ReplayError::InvalidArgument(
                    "flip_probability > 0 requires a flip_schema".into(),
                )
                .into());
            }
            None => None,
        };

        Ok(Self {
            device,
            img_shape: config.img_shape,
            n_features: config.n_features,
            mini_race_duration: config.mini_race_duration,
            crop_margin: config.crop_margin,
            flip_probability: config.flip_probability,
            flip_plan,
            rng: fastrand::Rng::with_seed(config.seed),
        })
    }

    /// Device batches are issued on.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Draws the randomness vector for a batch of `batch_size` records.
    pub fn draws(&mut self, batch_size: usize) -> BatchDraws {
        let t_curs = (0..batch_size)
            .map(|_| self.rng.i64(0..self.mini_race_duration))
            .collect();
        let flip = self.flip_plan.is_some() && self.flip_probability > 0.0;
        let flip_flags = (0..batch_size)
            .map(|_| flip && self.rng.f64() < self.flip_probability)
            .collect();
        let crop_offset = match self.crop_margin {
            0 => (0, 0),
            m => (self.rng.i64(0..=2 * m), self.rng.i64(0..=2 * m)),
        };
        BatchDraws {
            t_curs,
            flip_flags,
            crop_offset,
        }
    }

    /// Collates a batch with freshly drawn randomness.
    ///
    /// `items` pairs each gathered record with the slot it came from, for
    /// error reporting. `weights` are the sampler's importance weights and
    /// must match the batch length when present.
    pub fn collate(
        &mut self,
        items: &[(usize, &Transition)],
        weights: Option<&[f32]>,
    ) -> Result<CollatedBatch> {
        let draws = self.draws(items.len());
        self.collate_with(items, weights, &draws)
    }

    /// Collates a batch from an explicit randomness vector. Pure with
    /// respect to the collator state.
    ///
    /// The whole batch either succeeds or the call fails; no partially
    /// populated batch is ever returned.
    pub fn collate_with(
        &self,
        items: &[(usize, &Transition)],
        weights: Option<&[f32]>,
        draws: &BatchDraws,
    ) -> Result<CollatedBatch> {
        let b = items.len();
        if draws.t_curs.len() != b || draws.flip_flags.len() != b {
            return Err(ReplayError::InvalidArgument(format!(
                "draws sized for {} records but batch has {}",
                draws.t_curs.len(),
                b
            ))
            .into());
        }
        if let Some(&t) = draws
            .t_curs
            .iter()
            .find(|&&t| !(0..self.mini_race_duration).contains(&t))
        {
            return Err(ReplayError::InvalidArgument(format!(
                "temporal offset {} outside the window [0, {})",
                t, self.mini_race_duration
            ))
            .into());
        }
        if let Some(ws) = weights {
            if ws.len() != b {
                return Err(ReplayError::InvalidArgument(format!(
                    "{} weights for {} records",
                    ws.len(),
                    b
                ))
                .into());
            }
        }
        for &(slot, record) in items.iter() {
            self.validate_record(slot, record)?;
        }
        if b == 0 {
            return Ok(self.empty_batch());
        }

        let [c, h, w] = self.img_shape;
        let px = (c * h * w) as usize;
        let mut state_img = Vec::with_capacity(b * px);
        let mut next_img = Vec::with_capacity(b * px);
        let mut state_float = Vec::with_capacity(b * self.n_features);
        let mut next_float = Vec::with_capacity(b * self.n_features);
        let mut actions = Vec::with_capacity(b);
        let mut rewards = Vec::with_capacity(b);
        let mut gammas = Vec::with_capacity(b);

        for (i, &(_, record)) in items.iter().enumerate() {
            let t_cur = draws.t_curs[i];
            let t_next = t_cur + record.n_steps;
            let overshoot = (t_next - self.mini_race_duration).max(0);
            let effective_steps = (record.n_steps - overshoot) as usize;
            let is_terminal =
                effective_steps as i64 >= record.terminal_actions || t_next >= self.mini_race_duration;

            rewards.push(record.rewards[effective_steps - 1]);
            gammas.push(if is_terminal {
                0.0
            } else {
                record.gammas[effective_steps - 1]
            });
            actions.push(record.action);

            state_img.extend_from_slice(&record.state_img);
            next_img.extend_from_slice(&record.next_state_img);

            // The time-in-window feature is a property of the drawn window,
            // not of the stored record.
            state_float.push(t_cur as f32);
            state_float.extend_from_slice(&record.state_float[1..]);
            next_float.push(t_next as f32);
            next_float.extend_from_slice(&record.next_state_float[1..]);
        }

        let n_features = self.n_features as i64;
        let state_img = self.upload_images(&state_img);
        let next_state_img = self.upload_images(&next_img);
        let state_float = Tensor::from_slice(&state_float)
            .view([b as i64, n_features])
            .to_device_(self.device, Kind::Float, true, false);
        let next_state_float = Tensor::from_slice(&next_float)
            .view([b as i64, n_features])
            .to_device_(self.device, Kind::Float, true, false);
        let action = Tensor::from_slice(&actions).to_device_(self.device, Kind::Int64, true, false);
        let reward = Tensor::from_slice(&rewards).to_device_(self.device, Kind::Float, true, false);
        let gamma = Tensor::from_slice(&gammas).to_device_(self.device, Kind::Float, true, false);
        let weight = weights
            .map(|ws| Tensor::from_slice(ws).to_device_(self.device, Kind::Float, true, false));

        // One offset for the whole batch and both image streams; an
        // inconsistent crop between state and next state would invalidate
        // the training target.
        let (state_img, next_state_img) = match self.crop_margin {
            0 => (state_img, next_state_img),
            m => (
                shared_crop(&state_img, m, draws.crop_offset),
                shared_crop(&next_state_img, m, draws.crop_offset),
            ),
        };

        let (state_img, state_float, action, next_state_img, next_state_float) = match &self
            .flip_plan
        {
            Some(plan) if draws.flip_flags.iter().any(|&f| f) => {
                let mask = Tensor::from_slice(&draws.flip_flags).to_device(self.device);
                (
                    plan.flip_images(&state_img, &mask),
                    plan.flip_feature_rows(&state_float, &mask),
                    plan.flip_actions(&action, &mask),
                    plan.flip_images(&next_state_img, &mask),
                    plan.flip_feature_rows(&next_state_float, &mask),
                )
            }
            _ => (state_img, state_float, action, next_state_img, next_state_float),
        };

        trace!("collated batch of {} records on {:?}", b, self.device);

        Ok(CollatedBatch {
            state_img,
            state_float,
            action,
            reward,
            gamma,
            next_state_img,
            next_state_float,
            weight,
            event: TransferEvent::record(self.device),
        })
    }

    /// Uploads raw pixel bytes and maps them to centered unit scale,
    /// `[0, 255] -> [-0.5, 0.5]`.
    fn upload_images(&self, bytes: &[u8]) -> Tensor {
        let [c, h, w] = self.img_shape;
        let b = bytes.len() as i64 / (c * h * w);
        let t = Tensor::from_slice(bytes)
            .view([b, c, h, w])
            .to_device_(self.device, Kind::Uint8, true, false);
        t.to_kind(Kind::Float) / 255.0 - 0.5
    }

    fn validate_record(&self, slot: usize, record: &Transition) -> Result<()> {
        if record.n_steps <= 0 {
            return Err(ReplayError::InvalidRecord {
                slot,
                n_steps: record.n_steps,
            }
            .into());
        }
        let n_steps = record.n_steps as usize;
        if record.rewards.len() < n_steps || record.gammas.len() < n_steps {
            return Err(ReplayError::InvalidArgument(format!(
                "slot {}: horizon arrays of lengths {}/{} cannot cover n_steps = {}",
                slot,
                record.rewards.len(),
                record.gammas.len(),
                n_steps
            ))
            .into());
        }
        let px = (self.img_shape[0] * self.img_shape[1] * self.img_shape[2]) as usize;
        if record.state_img.len() != px || record.next_state_img.len() != px {
            return Err(ReplayError::InvalidArgument(format!(
                "slot {}: image payloads of lengths {}/{} do not match shape {:?}",
                slot,
                record.state_img.len(),
                record.next_state_img.len(),
                self.img_shape
            ))
            .into());
        }
        if record.state_float.len() != self.n_features
            || record.next_state_float.len() != self.n_features
        {
            return Err(ReplayError::InvalidArgument(format!(
                "slot {}: feature vectors of lengths {}/{} do not match n_features = {}",
                slot,
                record.state_float.len(),
                record.next_state_float.len(),
                self.n_features
            ))
            .into());
        }
        Ok(())
    }

    fn empty_batch(&self) -> CollatedBatch {
        let [c, h, w] = self.img_shape;
        let opts = (Kind::Float, self.device);
        CollatedBatch {
            state_img: Tensor::zeros([0, c, h, w], opts),
            state_float: Tensor::zeros([0, self.n_features as i64], opts),
            action: Tensor::zeros([0], (Kind::Int64, self.device)),
            reward: Tensor::zeros([0], opts),
            gamma: Tensor::zeros([0], opts),
            next_state_img: Tensor::zeros([0, c, h, w], opts),
            next_state_float: Tensor::zeros([0, self.n_features as i64], opts),
            weight: None,
            event: TransferEvent::record(self.device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BatchCollator, BatchDraws, CollatorConfig};
    use crate::augment::FlipSchema;
    use slipstream_core::Transition;
    use std::convert::TryFrom;
    use tch::Device;

    const N_FEATURES: usize = 25;

    fn config() -> CollatorConfig {
        CollatorConfig::default()
            .img_shape([1, 4, 4])
            .n_features(N_FEATURES)
            .mini_race_duration(10)
    }

    fn record(n_steps: i64, terminal_actions: i64) -> Transition {
        let h = n_steps.max(1) as usize;
        Transition {
            state_img: vec![100u8; 16],
            state_float: (0..N_FEATURES).map(|i| i as f32).collect(),
            action: 1,
            rewards: (0..h).map(|k| (k + 1) as f32).collect(),
            gammas: vec![0.99; h],
            n_steps,
            terminal_actions,
            next_state_img: vec![200u8; 16],
            next_state_float: (0..N_FEATURES).map(|i| i as f32 + 0.5).collect(),
        }
    }

    fn draws(t_curs: Vec<i64>) -> BatchDraws {
        let n = t_curs.len();
        BatchDraws {
            t_curs,
            flip_flags: vec![false; n],
            crop_offset: (0, 0),
        }
    }

    fn to_vec(t: &tch::Tensor) -> Vec<f32> {
        Vec::try_from(t.view([-1])).unwrap()
    }

    #[test]
    fn yaml_round_trip() {
        let config = config()
            .crop_margin(3)
            .flip(0.5, FlipSchema::racing_layout(1))
            .seed(9);

        let dir = tempdir::TempDir::new("collator_config").unwrap();
        let path = dir.path().join("collator.yaml");
        config.save(&path).unwrap();
        assert_eq!(CollatorConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let mut collator = BatchCollator::build(&config(), Device::Cpu).unwrap();
        let batch = collator.collate(&[], None).unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.state_img.size(), vec![0, 1, 4, 4]);
        batch.event.wait();
    }

    #[test]
    fn zero_horizon_record_is_rejected() {
        let mut collator = BatchCollator::build(&config(), Device::Cpu).unwrap();
        let bad = record(0, 3);
        let err = collator.collate(&[(7, &bad)], None).unwrap_err();
        assert!(err.to_string().contains("slot 7"));
    }

    #[test]
    fn window_overrun_truncates_and_terminates() {
        let collator = BatchCollator::build(&config(), Device::Cpu).unwrap();
        let r = record(5, 3);
        let batch = collator
            .collate_with(&[(0, &r)], None, &draws(vec![8]))
            .unwrap();
        batch.event.wait();

        // t_next = 13: two steps fit before the window ends, and crossing
        // the boundary terminates even though terminal_actions is not hit.
        assert_eq!(to_vec(&batch.reward), vec![2.0]);
        assert_eq!(to_vec(&batch.gamma), vec![0.0]);
    }

    #[test]
    fn in_window_transition_keeps_its_discount() {
        let collator = BatchCollator::build(&config(), Device::Cpu).unwrap();
        let r = record(2, 5);
        let batch = collator
            .collate_with(&[(0, &r)], None, &draws(vec![0]))
            .unwrap();
        batch.event.wait();

        assert_eq!(to_vec(&batch.reward), vec![2.0]);
        assert_eq!(to_vec(&batch.gamma), vec![0.99]);
    }

    #[test]
    fn reaching_terminal_actions_zeroes_the_discount() {
        let collator = BatchCollator::build(&config(), Device::Cpu).unwrap();
        let r = record(3, 3);
        let batch = collator
            .collate_with(&[(0, &r)], None, &draws(vec![0]))
            .unwrap();
        batch.event.wait();

        assert_eq!(to_vec(&batch.gamma), vec![0.0]);
    }

    #[test]
    fn time_feature_is_refreshed_per_sample() {
        let collator = BatchCollator::build(&config(), Device::Cpu).unwrap();
        let r = record(2, 9);
        let batch = collator
            .collate_with(&[(0, &r)], None, &draws(vec![4]))
            .unwrap();
        batch.event.wait();

        let state = to_vec(&batch.state_float);
        let next = to_vec(&batch.next_state_float);
        assert_eq!(state[0], 4.0);
        assert_eq!(next[0], 6.0);
        // Remaining features come straight from storage.
        assert_eq!(state[1], 1.0);
        assert_eq!(next[1], 1.5);
    }

    #[test]
    fn pixels_are_centered_and_unit_scaled() {
        let collator = BatchCollator::build(&config(), Device::Cpu).unwrap();
        let mut r = record(1, 9);
        r.state_img = vec![0u8; 16];
        r.next_state_img = vec![255u8; 16];
        let batch = collator
            .collate_with(&[(0, &r)], None, &draws(vec![0]))
            .unwrap();
        batch.event.wait();

        assert_eq!(to_vec(&batch.state_img)[0], -0.5);
        assert_eq!(to_vec(&batch.next_state_img)[0], 0.5);
    }

    #[test]
    fn flip_remaps_action_features_and_image_together() {
        let cfg = config().flip(1.0, FlipSchema::racing_layout(1));
        let collator = BatchCollator::build(&cfg, Device::Cpu).unwrap();

        let mut r = record(1, 9);
        // An asymmetric image column so the mirror is observable.
        r.state_img[0] = 0;
        r.state_img[3] = 255;
        let d = BatchDraws {
            t_curs: vec![2],
            flip_flags: vec![true],
            crop_offset: (0, 0),
        };
        let batch = collator.collate_with(&[(0, &r)], None, &d).unwrap();
        batch.event.wait();

        // Action 1 (forward-left) becomes 2 (forward-right).
        let action: Vec<i64> = Vec::try_from(batch.action).unwrap();
        assert_eq!(action, vec![2]);

        // The mirrored first row has its bright pixel on the left.
        let img = to_vec(&batch.state_img);
        assert_eq!(img[0], 0.5);
        assert_eq!(img[3], -0.5);

        // Features follow the same flag: indices 3 and 4 swap, the time
        // feature at index 0 is still the drawn offset.
        let schema = FlipSchema::racing_layout(1);
        let mut expected: Vec<f32> = (0..N_FEATURES).map(|i| i as f32).collect();
        expected[0] = 2.0;
        schema.flip_features(&mut expected);
        assert_eq!(to_vec(&batch.state_float), expected);
    }

    #[test]
    fn unflagged_records_are_not_flipped() {
        let cfg = config().flip(1.0, FlipSchema::racing_layout(1));
        let collator = BatchCollator::build(&cfg, Device::Cpu).unwrap();
        let r = record(1, 9);
        let d = BatchDraws {
            t_curs: vec![2, 2],
            flip_flags: vec![true, false],
            crop_offset: (0, 0),
        };
        let batch = collator.collate_with(&[(0, &r), (1, &r)], None, &d).unwrap();
        batch.event.wait();

        let action: Vec<i64> = Vec::try_from(batch.action).unwrap();
        assert_eq!(action, vec![2, 1]);
    }

    #[test]
    fn out_of_window_offset_is_rejected() {
        let collator = BatchCollator::build(&config(), Device::Cpu).unwrap();
        let r = record(2, 9);
        let err = collator
            .collate_with(&[(0, &r)], None, &draws(vec![10]))
            .unwrap_err();
        assert!(err.to_string().contains("temporal offset"));
    }

    #[test]
    fn weights_ride_along() {
        let collator = BatchCollator::build(&config(), Device::Cpu).unwrap();
        let r = record(1, 9);
        let batch = collator
            .collate_with(&[(0, &r), (1, &r)], Some(&[0.5, 1.0]), &draws(vec![0, 1]))
            .unwrap();
        batch.event.wait();

        let ws = batch.weight.as_ref().map(to_vec).unwrap();
        assert_eq!(ws, vec![0.5, 1.0]);

        let err = collator
            .collate_with(&[(0, &r)], Some(&[0.5, 1.0]), &draws(vec![0]))
            .unwrap_err();
        assert!(err.to_string().contains("weights"));
    }

    #[test]
    fn drawn_offsets_stay_inside_the_window() {
        let mut collator = BatchCollator::build(&config().crop_margin(2), Device::Cpu).unwrap();
        for _ in 0..100 {
            let d = collator.draws(16);
            assert!(d.t_curs.iter().all(|&t| (0..10).contains(&t)));
            assert!(d.crop_offset.0 <= 4 && d.crop_offset.1 <= 4);
        }
    }
}
