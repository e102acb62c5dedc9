//! Indexed priority structure for weighted sampling.
//!
//! A single array-backed complete binary tree whose nodes carry a pair of
//! aggregates, the subtree sum and the subtree minimum. Both aggregates are
//! recomputed eagerly on every leaf write; there is no lazy propagation.
//! The sum aggregate drives inverse-CDF sampling, the min aggregate bounds
//! importance weights without a full scan.
use num_traits::Float;

/// Pair of aggregates held by every tree node.
#[derive(Clone, Copy, Debug)]
struct Node<F> {
    sum: F,
    min: F,
}

impl<F: Float> Node<F> {
    /// Identity element: contributes nothing to a sum, never wins a min.
    fn empty() -> Self {
        Self {
            sum: F::zero(),
            min: F::infinity(),
        }
    }

    fn leaf(value: F) -> Self {
        Self {
            sum: value,
            min: value,
        }
    }

    fn combine(l: &Self, r: &Self) -> Self {
        Self {
            sum: l.sum + r.sum,
            min: l.min.min(r.min),
        }
    }
}

/// Sum/min segment tree over a fixed number of slots.
///
/// Leaves of slots that were never written hold the identity pair
/// `(0, +inf)`, so they carry no sampling mass and do not disturb the
/// minimum until the external writer populates them.
#[derive(Debug)]
pub struct DualSegmentTree<F: Float> {
    /// Logical number of slots.
    capacity: usize,
    /// Leaf count rounded up to a power of two.
    n: usize,
    /// 1-based heap layout; `nodes[0]` is unused, leaves live in `[n, 2n)`.
    nodes: Vec<Node<F>>,
}

impl<F: Float> DualSegmentTree<F> {
    /// Creates a tree with all slots unwritten.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "tree capacity must be positive");
        let n = capacity.next_power_of_two();
        Self {
            capacity,
            n,
            nodes: vec![Node::empty(); 2 * n],
        }
    }

    /// Rebuilds a tree from leaf values, recomputing every internal
    /// aggregate. Both slices must have `capacity` elements.
    pub fn from_leaves(sum_leaves: &[F], min_leaves: &[F]) -> Self {
        debug_assert_eq!(sum_leaves.len(), min_leaves.len());
        let mut tree = Self::new(sum_leaves.len());
        for (i, (&s, &m)) in sum_leaves.iter().zip(min_leaves.iter()).enumerate() {
            tree.nodes[tree.n + i] = Node { sum: s, min: m };
        }
        for i in (1..tree.n).rev() {
            tree.nodes[i] = Node::combine(&tree.nodes[2 * i], &tree.nodes[2 * i + 1]);
        }
        tree
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Overwrites leaf `slot` with `value` and refreshes all ancestors.
    ///
    /// Panics if `slot >= capacity`: writing a padding leaf would add
    /// sampling mass that no stored record backs.
    pub fn update(&mut self, slot: usize, value: F) {
        assert!(
            slot < self.capacity,
            "slot {} out of range for capacity {}",
            slot,
            self.capacity
        );
        let mut i = self.n + slot;
        self.nodes[i] = Node::leaf(value);
        while i > 1 {
            i /= 2;
            self.nodes[i] = Node::combine(&self.nodes[2 * i], &self.nodes[2 * i + 1]);
        }
    }

    /// Stored value of leaf `slot`.
    pub fn leaf(&self, slot: usize) -> F {
        debug_assert!(slot < self.capacity);
        self.nodes[self.n + slot].sum
    }

    /// Sum over all slots.
    pub fn total(&self) -> F {
        self.nodes[1].sum
    }

    /// Sum over the half-open leaf range `[lo, hi)`.
    pub fn query_sum(&self, lo: usize, hi: usize) -> F {
        self.query(lo, hi, F::zero(), |acc, node| acc + node.sum)
    }

    /// Minimum over the half-open leaf range `[lo, hi)`. Unwritten slots
    /// are transparent; an all-unwritten range yields `+inf`.
    pub fn query_min(&self, lo: usize, hi: usize) -> F {
        self.query(lo, hi, F::infinity(), |acc, node| acc.min(node.min))
    }

    fn query(&self, lo: usize, hi: usize, identity: F, fold: impl Fn(F, &Node<F>) -> F) -> F {
        debug_assert!(lo <= hi && hi <= self.capacity);
        let mut acc = identity;
        let mut lo = lo + self.n;
        let mut hi = hi + self.n;
        while lo < hi {
            if lo & 1 == 1 {
                acc = fold(acc, &self.nodes[lo]);
                lo += 1;
            }
            if hi & 1 == 1 {
                hi -= 1;
                acc = fold(acc, &self.nodes[hi]);
            }
            lo /= 2;
            hi /= 2;
        }
        acc
    }

    /// Maps a cumulative mass in `[0, total)` to the smallest leaf index
    /// whose inclusive prefix sum exceeds it.
    ///
    /// Descends from the root, branching left while the mass is strictly
    /// below the left aggregate and subtracting it otherwise. A mass at or
    /// past the total (floating error) walks off the populated leaves and is
    /// clamped to the last slot.
    pub fn invert_cumulative(&self, mass: F) -> usize {
        let mut mass = mass;
        let mut i = 1;
        while i < self.n {
            let left = 2 * i;
            if mass < self.nodes[left].sum {
                i = left;
            } else {
                mass = mass - self.nodes[left].sum;
                i = left + 1;
            }
        }
        (i - self.n).min(self.capacity - 1)
    }

    /// Batched [`Self::invert_cumulative`]. Each descent is independent and
    /// read-only, so per-element results do not depend on ordering.
    pub fn invert_cumulative_batch(&self, masses: &[F]) -> Vec<usize> {
        masses.iter().map(|&m| self.invert_cumulative(m)).collect()
    }

    /// Leaf arrays `(sum, min)` in slot order, for serialization.
    pub fn leaves(&self) -> (Vec<F>, Vec<F>) {
        let slots = &self.nodes[self.n..self.n + self.capacity];
        (
            slots.iter().map(|n| n.sum).collect(),
            slots.iter().map(|n| n.min).collect(),
        )
    }
}
