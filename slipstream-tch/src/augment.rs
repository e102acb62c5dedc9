//! Label-consistent stochastic augmentations.
//!
//! A horizontal mirror of the observation is only valid if the action id
//! and every laterally signed feature are remapped with it. The mapping is
//! dataset-schema-specific, so it is injected as configuration data
//! ([`FlipSchema`]) instead of living here as constants: any change to the
//! upstream feature layout must update the schema in lockstep.
use anyhow::Result;
use serde::{Deserialize, Serialize};
use slipstream_core::ReplayError;
use tch::{Device, Tensor};

/// Index remapping applied alongside a horizontal image flip.
///
/// All three parts are involutions, so applying the schema twice restores
/// the original data exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlipSchema {
    /// Permutation over action ids swapping left/right action variants and
    /// fixing symmetric actions.
    pub action_map: Vec<i64>,

    /// Feature index pairs whose values are exchanged (e.g. left/right
    /// wheel-slip indicators).
    pub swap_pairs: Vec<(usize, usize)>,

    /// Feature indices whose values are negated (signed lateral and angular
    /// quantities).
    pub negate: Vec<usize>,
}

impl FlipSchema {
    /// Schema of the racing feature layout: previous-action and wheel-slip
    /// left/right indicator pairs, angular velocity y/z, lateral linear
    /// velocity, lateral map direction, and the x component of each of the
    /// `n_zone_centers` tracked zone-center positions. The 12-entry action
    /// table swaps the left/right variant of every action category.
    pub fn racing_layout(n_zone_centers: usize) -> Self {
        let mut negate = vec![13, 14, 15, 18];
        negate.extend((0..n_zone_centers).map(|i| 21 + 3 * i));
        Self {
            action_map: vec![0, 2, 1, 3, 5, 4, 6, 8, 7, 9, 11, 10],
            swap_pairs: vec![(3, 4), (5, 6), (7, 8)],
            negate,
        }
    }

    /// Checks internal consistency against the feature vector length:
    /// the action table must be an involutive permutation, and every swap
    /// or negate index must fall inside the feature vector, each at most
    /// once.
    pub fn validate(&self, n_features: usize) -> Result<()> {
        let n = self.action_map.len();
        for (i, &j) in self.action_map.iter().enumerate() {
            if j < 0 || j as usize >= n || self.action_map[j as usize] != i as i64 {
                return Err(ReplayError::InvalidArgument(format!(
                    "action_map is not an involutive permutation at id {}",
                    i
                ))
                .into());
            }
        }

        let mut seen = vec![false; n_features];
        let mut touch = |ix: usize| -> Result<()> {
            if ix >= n_features {
                return Err(ReplayError::InvalidArgument(format!(
                    "flip index {} out of range for {} features",
                    ix, n_features
                ))
                .into());
            }
            if seen[ix] {
                return Err(ReplayError::InvalidArgument(format!(
                    "flip index {} referenced twice",
                    ix
                ))
                .into());
            }
            seen[ix] = true;
            Ok(())
        };
        for &(a, b) in self.swap_pairs.iter() {
            touch(a)?;
            touch(b)?;
        }
        for &ix in self.negate.iter() {
            touch(ix)?;
        }
        Ok(())
    }

    /// Remaps an action id through the flip table.
    pub fn flip_action(&self, action: i64) -> i64 {
        debug_assert!((action as usize) < self.action_map.len());
        self.action_map[action as usize]
    }

    /// Applies the swap/negate remapping to a feature vector in place.
    pub fn flip_features(&self, features: &mut [f32]) {
        for &(a, b) in self.swap_pairs.iter() {
            features.swap(a, b);
        }
        for &ix in self.negate.iter() {
            features[ix] = -features[ix];
        }
    }

    /// Index-select permutation realizing the swaps over `n_features`.
    fn feature_permutation(&self, n_features: usize) -> Vec<i64> {
        let mut perm: Vec<i64> = (0..n_features as i64).collect();
        for &(a, b) in self.swap_pairs.iter() {
            perm.swap(a, b);
        }
        perm
    }

    /// Per-feature sign vector realizing the negations.
    fn feature_signs(&self, n_features: usize) -> Vec<f32> {
        let mut signs = vec![1f32; n_features];
        for &ix in self.negate.iter() {
            signs[ix] = -1.0;
        }
        signs
    }
}

/// Device-resident tensors realizing a [`FlipSchema`], built once per
/// collator so batch collation does not re-upload the tables.
#[derive(Debug)]
pub(crate) struct FlipPlan {
    action_table: Tensor,
    feature_perm: Tensor,
    feature_sign: Tensor,
}

impl FlipPlan {
    pub(crate) fn new(schema: &FlipSchema, n_features: usize, device: Device) -> Result<Self> {
        schema.validate(n_features)?;
        Ok(Self {
            action_table: Tensor::from_slice(&schema.action_map).to_device(device),
            feature_perm: Tensor::from_slice(&schema.feature_permutation(n_features))
                .to_device(device),
            feature_sign: Tensor::from_slice(&schema.feature_signs(n_features))
                .to_device(device),
        })
    }

    /// Mirrors images along the horizontal axis where `mask` is set.
    /// `images` is `[B, C, H, W]`, `mask` is `[B]` bool.
    pub(crate) fn flip_images(&self, images: &Tensor, mask: &Tensor) -> Tensor {
        let mask = mask.view([-1, 1, 1, 1]);
        images.flip([-1]).where_self(&mask, images)
    }

    /// Remaps `[B]` action ids through the flip table where `mask` is set.
    pub(crate) fn flip_actions(&self, actions: &Tensor, mask: &Tensor) -> Tensor {
        self.action_table
            .gather(0, actions, false)
            .where_self(mask, actions)
    }

    /// Applies the swap/negate remapping to `[B, F]` features where `mask`
    /// is set.
    pub(crate) fn flip_feature_rows(&self, features: &Tensor, mask: &Tensor) -> Tensor {
        let flipped = features.index_select(1, &self.feature_perm) * &self.feature_sign;
        let mask = mask.view([-1, 1]);
        flipped.where_self(&mask, features)
    }
}

/// Crops a `[B, C, H, W]` float batch back to its own size after
/// edge-padding by `margin`, shifted by the shared per-batch offset.
/// Offsets must lie in `[0, 2 * margin]` on both axes.
pub(crate) fn shared_crop(images: &Tensor, margin: i64, offset: (i64, i64)) -> Tensor {
    debug_assert!(offset.0 <= 2 * margin && offset.1 <= 2 * margin);
    let (h, w) = {
        let size = images.size();
        (size[2], size[3])
    };
    images
        .pad([margin, margin, margin, margin], "replicate", None)
        .narrow(2, offset.0, h)
        .narrow(3, offset.1, w)
}
