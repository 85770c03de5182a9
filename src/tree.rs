//! Leveled mixing trees built from targets.
//!
//! The root of a tree holds the target ratio; each level's factor partitions
//! a node's allocation into equal child allocations, down to the deepest
//! level which is fed purely by raw reagents.

use rayon::prelude::*;
use serde::Serialize;
use tracing::instrument;

use crate::errors::{PlanError, PlanResult};
use crate::target::{Concentration, NodeId, Target};

/// One mixing operation slot in a tree.
#[derive(Debug, Clone, Serialize)]
pub struct MixNode {
    pub id: NodeId,
    /// Nominal reagent breakdown if the node were built purely from raw
    /// reagents. Sums to `allocation`.
    pub composition: Vec<u64>,
    pub allocation: u64,
    /// Mixer size at this node's level.
    pub factor: u64,
    pub children: Vec<NodeId>,
}

impl MixNode {
    pub fn is_root(&self) -> bool {
        self.id.is_root()
    }

    /// A node buildable directly from raw reagents in a single fill.
    pub fn is_leaf_grade(&self) -> bool {
        self.allocation == self.factor
    }
}

/// All mixing nodes for one target, indexed by level then node index.
#[derive(Debug, Clone, Serialize)]
pub struct MixTree {
    pub target: Target,
    levels: Vec<Vec<MixNode>>,
}

impl MixTree {
    pub fn root(&self) -> &MixNode {
        &self.levels[0][0]
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, level: usize) -> &[MixNode] {
        &self.levels[level]
    }

    pub fn node(&self, id: NodeId) -> Option<&MixNode> {
        self.levels.get(id.level)?.get(id.index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MixNode> {
        self.levels.iter().flatten()
    }

    pub fn leaf_nodes(&self) -> impl Iterator<Item = &MixNode> {
        self.levels[self.depth() - 1].iter()
    }

    pub fn ratio_sum(&self) -> u64 {
        self.target.ratio_sum()
    }
}

/// Trees for all targets of a run, in target order.
#[derive(Debug, Clone, Serialize)]
pub struct MixForest {
    trees: Vec<MixTree>,
}

impl MixForest {
    pub fn trees(&self) -> &[MixTree] {
        &self.trees
    }

    pub fn tree(&self, target: usize) -> &MixTree {
        &self.trees[target]
    }

    pub fn node(&self, id: NodeId) -> Option<&MixNode> {
        self.trees.get(id.target)?.node(id)
    }

    pub fn iter_nodes(&self) -> impl Iterator<Item = &MixNode> {
        self.trees.iter().flat_map(|t| t.iter())
    }

    pub fn num_reagents(&self) -> usize {
        self.trees
            .first()
            .map(|t| t.target.ratio.len())
            .unwrap_or(0)
    }

    /// Concentration value of a node: `allocation / ratio_sum`.
    pub fn concentration(&self, node: &MixNode) -> Concentration {
        Concentration::new(node.allocation, self.trees[node.id.target].ratio_sum())
    }
}

/// Builds the forest of mixing trees for a set of targets.
#[derive(Debug)]
pub struct TreeBuilder {
    max_mixer_size: u64,
}

impl TreeBuilder {
    pub fn new(max_mixer_size: u64) -> Self {
        Self { max_mixer_size }
    }

    #[instrument(level = "debug", skip(self, targets))]
    pub fn build(&self, targets: &[Target]) -> PlanResult<MixForest> {
        for target in targets {
            target.validate(self.max_mixer_size)?;
        }

        // All targets draw from one shared reagent set.
        if let Some(first) = targets.first() {
            for target in &targets[1..] {
                if target.ratio.len() != first.ratio.len() {
                    return Err(PlanError::InvalidFactorization {
                        target: target.name.clone(),
                        reason: format!(
                            "ratio has {} entries but '{}' has {}",
                            target.ratio.len(),
                            first.name,
                            first.ratio.len()
                        ),
                    });
                }
            }
        }

        let trees = targets
            .par_iter()
            .enumerate()
            .map(|(idx, target)| build_tree(idx, target))
            .collect();

        Ok(MixForest { trees })
    }
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_MIXER_SIZE)
    }
}

fn build_tree(target_idx: usize, target: &Target) -> MixTree {
    let root = MixNode {
        id: NodeId::new(target_idx, 0, 0),
        composition: target.ratio.clone(),
        allocation: target.ratio_sum(),
        factor: target.factors[0],
        children: Vec::new(),
    };
    let mut levels = vec![vec![root]];

    for level in 1..target.factors.len() {
        let mut nodes = Vec::new();
        let parent_level = std::mem::take(&mut levels[level - 1]);
        let mut parents = Vec::with_capacity(parent_level.len());

        for mut parent in parent_level {
            let child_alloc = parent.allocation / parent.factor;
            let parts = partition_composition(&parent.composition, parent.factor, child_alloc);

            for part in parts {
                let id = NodeId::new(target_idx, level, nodes.len());
                parent.children.push(id);
                nodes.push(MixNode {
                    id,
                    composition: part,
                    allocation: child_alloc,
                    factor: target.factors[level],
                    children: Vec::new(),
                });
            }
            parents.push(parent);
        }

        levels[level - 1] = parents;
        levels.push(nodes);
    }

    MixTree {
        target: target.clone(),
        levels,
    }
}

/// Fixed-precedence partition: children are filled in index order, each
/// taking up to `each` units from the remaining composition in reagent-index
/// order. Child compositions sum componentwise to the parent's.
fn partition_composition(composition: &[u64], parts: u64, each: u64) -> Vec<Vec<u64>> {
    let mut remaining = composition.to_vec();
    let mut result = Vec::with_capacity(parts as usize);

    for _ in 0..parts {
        let mut part = vec![0; remaining.len()];
        let mut space = each;
        for (slot, rem) in part.iter_mut().zip(remaining.iter_mut()) {
            let take = space.min(*rem);
            *slot = take;
            *rem -= take;
            space -= take;
            if space == 0 {
                break;
            }
        }
        result.push(part);
    }

    debug_assert!(remaining.iter().all(|&r| r == 0));
    result
}
