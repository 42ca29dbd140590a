//! Node selection for resumable graph walks.
//!
//! Timer-driven modules that visit the graph a few nodes per step keep the
//! last visited id in their context and ask a [`NodeSelector`] for the next
//! one. Only nodes the selector's policy includes are ever returned.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use parking_lot::Mutex;

use crate::host::GraphAccess;
use crate::policy::NodePolicy;
use crate::types::NodeId;

/// Picks the next node for a walk.
pub trait NodeSelector: Send + Sync {
    /// Next node after `last`, or `None` when no node is included.
    fn select_next(&self, graph: &dyn GraphAccess, last: Option<NodeId>) -> Option<NodeId>;
}

fn included(policy: &NodePolicy, graph: &dyn GraphAccess, id: NodeId) -> bool {
    graph.node(id).map_or(false, |node| policy.include(&node))
}

/// Visits included nodes in id order, wrapping around after the highest.
///
/// Each step is one pass over the host's node ids with no allocation beyond
/// what [`GraphAccess::node_ids`] returns; the policy is only evaluated for
/// ids that would improve the current candidate. Nothing is cached between
/// steps, so nodes created or deleted in the meantime are seen at once.
#[derive(Clone, Debug)]
pub struct ContinuousNodeSelector {
    policy: NodePolicy,
}

impl ContinuousNodeSelector {
    /// Creates a selector over the nodes `policy` includes.
    pub fn new(policy: NodePolicy) -> Self {
        Self { policy }
    }
}

impl NodeSelector for ContinuousNodeSelector {
    fn select_next(&self, graph: &dyn GraphAccess, last: Option<NodeId>) -> Option<NodeId> {
        let mut first: Option<NodeId> = None;
        let mut next: Option<NodeId> = None;
        for id in graph.node_ids() {
            let after_last = matches!(last, Some(last) if id > last);
            let slot = if after_last { &mut next } else { &mut first };
            if slot.map_or(true, |best| id < best) && included(&self.policy, graph, id) {
                *slot = Some(id);
            }
        }
        next.or(first)
    }
}

/// Picks an included node uniformly at random.
///
/// Every step collects the included ids, so a step costs O(n) in the number
/// of nodes with one policy evaluation per node.
#[derive(Debug)]
pub struct RandomNodeSelector {
    policy: NodePolicy,
    rng: Mutex<StdRng>,
}

impl RandomNodeSelector {
    /// Creates a selector seeded from OS entropy.
    pub fn new(policy: NodePolicy) -> Self {
        Self {
            policy,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Creates a reproducible selector.
    pub fn with_seed(policy: NodePolicy, seed: u64) -> Self {
        Self {
            policy,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl NodeSelector for RandomNodeSelector {
    fn select_next(&self, graph: &dyn GraphAccess, _last: Option<NodeId>) -> Option<NodeId> {
        let ids: Vec<NodeId> = graph
            .node_ids()
            .into_iter()
            .filter(|id| included(&self.policy, graph, *id))
            .collect();
        ids.choose(&mut *self.rng.lock()).copied()
    }
}
