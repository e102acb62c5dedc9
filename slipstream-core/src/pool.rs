//! Fixed-capacity slot storage for experience records.
//!
//! The pool owns record content and slot recency; the sampler owns the
//! priorities. Both sides are keyed by the same integer slot index and
//! nothing else is shared. The pool never touches priorities: whoever
//! pushes a record is responsible for refreshing that slot's priority
//! before it becomes eligible for sampling again.
use serde::{Deserialize, Serialize};

/// One stored environment transition.
///
/// The sampler treats this as an opaque payload; only the collation
/// pipeline interprets the fields. Reward and discount arrays are indexed
/// by the number of elapsed steps minus one, for horizons `1..=H`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// Flattened `[C, H, W]` image of the current state, raw pixel bytes.
    pub state_img: Vec<u8>,

    /// Numeric feature vector of the current state. The first element is a
    /// placeholder for the time-in-window feature, refreshed at collation.
    pub state_float: Vec<f32>,

    /// Discrete action id taken at the current state.
    pub action: i64,

    /// Per-horizon accumulated rewards, `rewards[k]` for `k + 1` steps.
    pub rewards: Vec<f32>,

    /// Per-horizon discount factors, aligned with `rewards`.
    pub gammas: Vec<f32>,

    /// Number of valid horizon steps stored for this transition.
    pub n_steps: i64,

    /// Steps remaining until the underlying episode truly terminates.
    pub terminal_actions: i64,

    /// Flattened `[C, H, W]` image of the state `n_steps` later.
    pub next_state_img: Vec<u8>,

    /// Feature vector of the state `n_steps` later.
    pub next_state_float: Vec<f32>,
}

/// Read access to slot-indexed record storage.
pub trait ExperiencePool {
    /// The stored record type.
    type Record;

    /// Returns the record at `slot`, or `None` if the slot was never
    /// written.
    fn get(&self, slot: usize) -> Option<&Self::Record>;

    /// Total number of slots.
    fn capacity(&self) -> usize;

    /// Number of slots currently holding a record.
    fn len(&self) -> usize;

    /// True until the first record is written.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Circular array of records with fixed capacity.
///
/// Once full, each push overwrites the oldest slot. `push` returns the slot
/// index it wrote so the caller can refresh the matching priority entry.
#[derive(Debug)]
pub struct RingPool<R> {
    slots: Vec<Option<R>>,
    /// Next slot to write.
    head: usize,
    size: usize,
}

impl<R> RingPool<R> {
    /// Creates an empty pool with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "pool capacity must be positive");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            head: 0,
            size: 0,
        }
    }

    /// Writes `record` into the next slot, overwriting the oldest record
    /// once the pool has wrapped. Returns the slot index written.
    pub fn push(&mut self, record: R) -> usize {
        let slot = self.head;
        self.slots[slot] = Some(record);
        self.head = (self.head + 1) % self.slots.len();
        if self.size < self.slots.len() {
            self.size += 1;
        }
        slot
    }

    /// Drops all records and resets slot recency.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.head = 0;
        self.size = 0;
    }
}

impl<R> ExperiencePool for RingPool<R> {
    type Record = R;

    fn get(&self, slot: usize) -> Option<&R> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn len(&self) -> usize {
        self.size
    }
}
