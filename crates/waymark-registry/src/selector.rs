//! Smooth weighted round-robin selection
//!
//! TigerStyle: One exclusive critical section per selector, never held across
//! an await point.
//!
//! # Algorithm
//!
//! On every [`WeightedSelector::next`] call, across the current node list:
//!
//! ```text
//! for node in nodes:
//!     total += node.effective
//!     node.current += node.effective
//!     if node.effective < node.weight: node.effective += 1
//!     best = node with largest current (first wins ties)
//! best.current -= total
//! ```
//!
//! Over `k * sum(weights)` calls each address is returned `k * weight` times,
//! and heavy nodes are interleaved with light ones instead of picked in bursts.

use crate::record::normalize_weight;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use waymark_core::RebuildMode;

/// Selector-internal state for one candidate
#[derive(Debug, Clone, PartialEq, Eq)]
struct WeightNode {
    address: String,
    weight: i64,
    effective_weight: i64,
    current_weight: i64,
}

impl WeightNode {
    fn new(address: String, weight: u32) -> Self {
        let weight = i64::from(weight);
        Self {
            address,
            weight,
            effective_weight: weight,
            current_weight: 0,
        }
    }
}

/// Smooth weighted round-robin selector over `(address, weight)` candidates
#[derive(Debug)]
pub struct WeightedSelector {
    nodes: Mutex<Vec<WeightNode>>,
    mode: RebuildMode,
}

impl Default for WeightedSelector {
    fn default() -> Self {
        Self::new(RebuildMode::default())
    }
}

impl WeightedSelector {
    /// Create an empty selector
    pub fn new(mode: RebuildMode) -> Self {
        Self {
            nodes: Mutex::new(Vec::new()),
            mode,
        }
    }

    /// Create a selector with an initial candidate list
    pub fn with_candidates<I, A>(mode: RebuildMode, candidates: I) -> Self
    where
        I: IntoIterator<Item = (A, i64)>,
        A: Into<String>,
    {
        let selector = Self::new(mode);
        selector.rebuild(candidates);
        selector
    }

    /// Rebuild mode this selector was created with
    pub fn mode(&self) -> RebuildMode {
        self.mode
    }

    // A panic while holding the lock cannot leave the node list half-written:
    // every mutation is a plain field update or a wholesale swap.
    fn lock(&self) -> MutexGuard<'_, Vec<WeightNode>> {
        self.nodes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Atomically replace the candidate set
    ///
    /// Non-positive weights are coerced to 1. Order of `candidates` is the
    /// tie-break order used by [`next`](Self::next).
    pub fn rebuild<I, A>(&self, candidates: I)
    where
        I: IntoIterator<Item = (A, i64)>,
        A: Into<String>,
    {
        let mut fresh: Vec<WeightNode> = candidates
            .into_iter()
            .map(|(address, weight)| WeightNode::new(address.into(), normalize_weight(weight)))
            .collect();

        let mut nodes = self.lock();

        if self.mode == RebuildMode::Preserve {
            carry_over(&nodes, &mut fresh);
        }

        *nodes = fresh;

        debug_assert!(nodes.iter().all(|n| n.effective_weight <= n.weight));
    }

    /// Pick the next address, or `None` if there are no candidates
    #[allow(clippy::should_implement_trait)]
    pub fn next(&self) -> Option<String> {
        let mut nodes = self.lock();
        if nodes.is_empty() {
            return None;
        }

        let mut total: i64 = 0;
        let mut best_index = 0;
        let mut best_current = i64::MIN;

        for (index, node) in nodes.iter_mut().enumerate() {
            total += node.effective_weight;
            node.current_weight += node.effective_weight;

            if node.effective_weight < node.weight {
                node.effective_weight += 1;
            }

            // strict comparison: ties keep the first encountered
            if node.current_weight > best_current {
                best_index = index;
                best_current = node.current_weight;
            }
        }

        let winner = &mut nodes[best_index];
        winner.current_weight -= total;
        Some(winner.address.clone())
    }

    /// Lower a node's effective weight after a failure
    ///
    /// The node recovers by one step per [`next`](Self::next) call until its
    /// effective weight is back at its nominal weight. Returns `false` if no
    /// node has `address`.
    pub fn degrade(&self, address: &str, penalty: u32) -> bool {
        let mut nodes = self.lock();
        let mut found = false;
        for node in nodes.iter_mut().filter(|n| n.address == address) {
            node.effective_weight = (node.effective_weight - i64::from(penalty)).max(0);
            found = true;
        }
        found
    }

    /// Number of candidates
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether there are no candidates
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the current `(address, weight)` list in selection order
    pub fn candidates(&self) -> Vec<(String, u32)> {
        self.lock()
            .iter()
            .map(|n| (n.address.clone(), n.weight as u32))
            .collect()
    }
}

/// Copy accumulator state from `old` into `fresh` for surviving addresses
///
/// Duplicated addresses are matched in order of occurrence.
fn carry_over(old: &[WeightNode], fresh: &mut [WeightNode]) {
    let mut by_address: HashMap<&str, VecDeque<&WeightNode>> = HashMap::new();
    for node in old {
        by_address
            .entry(node.address.as_str())
            .or_default()
            .push_back(node);
    }

    for node in fresh.iter_mut() {
        if let Some(previous) = by_address
            .get_mut(node.address.as_str())
            .and_then(VecDeque::pop_front)
        {
            node.current_weight = previous.current_weight;
            node.effective_weight = previous.effective_weight.min(node.weight);
        }
    }
}
