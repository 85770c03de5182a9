//! Candidate reuse links between mixing nodes.
//!
//! The resolver enumerates, deterministically, every place a droplet could
//! flow outside the plain parent/child structure: intra-tree links,
//! inter-tree links, and 1:1 peer blends. Whether a candidate is actually
//! used is decided later by the solver; here only eligibility is computed.

use std::collections::BTreeMap;

use tracing::{debug, instrument};

use crate::config::{PeerLimit, PlanConfig};
use crate::target::NodeId;
use crate::tree::{MixForest, MixNode};

/// Where a candidate flow originates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Provider {
    Node(NodeId),
    Peer(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Intra,
    Inter,
    Peer,
}

/// One eligible provider → consumer flow.
#[derive(Debug, Clone)]
pub struct ShareLink {
    pub consumer: NodeId,
    pub provider: Provider,
    pub kind: LinkKind,
    /// Per-droplet scale of the consumer's composition constraint:
    /// `allocation(consumer) / allocation(provider)`.
    pub scale: u64,
}

impl ShareLink {
    /// Provider key used in flow variable names.
    pub fn key(&self) -> String {
        match self.provider {
            Provider::Node(id) => match self.kind {
                LinkKind::Intra => format!("l{}k{}", id.level, id.index),
                _ => format!("t{}_l{}k{}", id.target, id.level, id.index),
            },
            Provider::Peer(idx) => format!("R_idx{idx}"),
        }
    }
}

/// An unordered pair of compatible nodes whose equal-parts blend can supply
/// other nodes. Canonicalized so `a < b`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCandidate {
    pub a: NodeId,
    pub b: NodeId,
    /// Allocation of either member (equal by construction); the blend's
    /// droplets carry the same concentration.
    pub allocation: u64,
    pub effective_level: usize,
}

/// All candidate links and peer blends for a forest, in a fixed total order.
#[derive(Debug, Clone, Default)]
pub struct SharingPlan {
    links: Vec<ShareLink>,
    peers: Vec<PeerCandidate>,
    inbound: BTreeMap<NodeId, Vec<usize>>,
    outbound: BTreeMap<NodeId, Vec<usize>>,
    peer_outbound: Vec<Vec<usize>>,
}

impl SharingPlan {
    pub fn links(&self) -> &[ShareLink] {
        &self.links
    }

    pub fn peers(&self) -> &[PeerCandidate] {
        &self.peers
    }

    /// Indices into `links()` of all flows into `consumer`.
    pub fn inbound(&self, consumer: NodeId) -> &[usize] {
        self.inbound.get(&consumer).map_or(&[], Vec::as_slice)
    }

    /// Indices into `links()` of all flows drawn from a tree node.
    pub fn outbound(&self, provider: NodeId) -> &[usize] {
        self.outbound.get(&provider).map_or(&[], Vec::as_slice)
    }

    /// Indices into `links()` of all flows drawn from a peer blend.
    pub fn peer_links(&self, peer_idx: usize) -> &[usize] {
        self.peer_outbound.get(peer_idx).map_or(&[], Vec::as_slice)
    }

    /// Peer indices (with the side) in which a node participates as a source.
    pub fn peer_memberships(&self, node: NodeId) -> impl Iterator<Item = (usize, bool)> + '_ {
        self.peers.iter().enumerate().filter_map(move |(i, p)| {
            if p.a == node {
                Some((i, true))
            } else if p.b == node {
                Some((i, false))
            } else {
                None
            }
        })
    }

    fn push(&mut self, link: ShareLink) {
        let idx = self.links.len();
        self.inbound.entry(link.consumer).or_default().push(idx);
        match link.provider {
            Provider::Node(id) => self.outbound.entry(id).or_default().push(idx),
            Provider::Peer(p) => self.peer_outbound[p].push(idx),
        }
        self.links.push(link);
    }
}

/// Computes eligible sharing candidates for a forest.
#[derive(Debug)]
pub struct SharingResolver {
    max_level_diff: Option<usize>,
    enable_final_product_sharing: bool,
    peer_limit: PeerLimit,
}

impl SharingResolver {
    pub fn new(config: &PlanConfig) -> Self {
        Self {
            max_level_diff: config.max_level_diff,
            enable_final_product_sharing: config.enable_final_product_sharing,
            peer_limit: config.peer_limit,
        }
    }

    #[instrument(level = "debug", skip(self, forest))]
    pub fn resolve(&self, forest: &MixForest) -> SharingPlan {
        let peers = self.collect_peers(forest);

        let mut plan = SharingPlan {
            peer_outbound: vec![Vec::new(); peers.len()],
            peers,
            ..SharingPlan::default()
        };

        for consumer in forest.iter_nodes() {
            // A leaf-grade node is grounded in raw reagents; inbound flows
            // could never satisfy its composition constraint.
            if consumer.is_leaf_grade() {
                continue;
            }
            self.add_node_links(forest, consumer, &mut plan);
            self.add_peer_links(consumer, &mut plan);
        }

        debug!(
            links = plan.links.len(),
            peers = plan.peers.len(),
            "sharing candidates resolved"
        );
        plan
    }

    /// Eligibility of a provider level for a consumer: strictly deeper and
    /// within the configured level distance.
    fn level_eligible(&self, provider_level: usize, consumer_level: usize) -> bool {
        if provider_level <= consumer_level {
            return false;
        }
        match self.max_level_diff {
            Some(d) => provider_level - consumer_level <= d,
            None => true,
        }
    }

    fn add_node_links(&self, forest: &MixForest, consumer: &MixNode, plan: &mut SharingPlan) {
        // Intra-tree providers first, then inter-tree, each in id order.
        let same_tree = forest
            .tree(consumer.id.target)
            .iter()
            .map(|p| (p, LinkKind::Intra));
        let other_trees = forest
            .iter_nodes()
            .filter(|p| p.id.target != consumer.id.target)
            .map(|p| (p, LinkKind::Inter));

        for (provider, kind) in same_tree.chain(other_trees) {
            if provider.id == consumer.id {
                continue;
            }
            let eligible = if provider.is_root() {
                // Finished products are only shareable across trees, and
                // only when explicitly enabled.
                self.enable_final_product_sharing && kind == LinkKind::Inter
            } else {
                self.level_eligible(provider.id.level, consumer.id.level)
            };
            if !eligible {
                continue;
            }
            if let Some(scale) = flow_scale(consumer, provider.allocation) {
                plan.push(ShareLink {
                    consumer: consumer.id,
                    provider: Provider::Node(provider.id),
                    kind,
                    scale,
                });
            }
        }
    }

    fn add_peer_links(&self, consumer: &MixNode, plan: &mut SharingPlan) {
        for idx in 0..plan.peers.len() {
            let peer = &plan.peers[idx];
            if !self.level_eligible(peer.effective_level, consumer.id.level) {
                continue;
            }
            if let Some(scale) = flow_scale(consumer, peer.allocation) {
                plan.push(ShareLink {
                    consumer: consumer.id,
                    provider: Provider::Peer(idx),
                    kind: LinkKind::Peer,
                    scale,
                });
            }
        }
    }

    /// Pair up non-root, non-leaf-grade nodes of equal allocation, capped
    /// per group (or globally) by the configured peer limit.
    fn collect_peers(&self, forest: &MixForest) -> Vec<PeerCandidate> {
        let mut groups: BTreeMap<u64, Vec<NodeId>> = BTreeMap::new();
        for node in forest.iter_nodes() {
            if node.is_root() || node.is_leaf_grade() {
                continue;
            }
            groups.entry(node.allocation).or_default().push(node.id);
        }

        let mut peers = Vec::new();
        let mut global_budget = match self.peer_limit {
            PeerLimit::Global(n) => n,
            PeerLimit::HalfGroup => usize::MAX,
        };

        for (&allocation, members) in &groups {
            let group_cap = match self.peer_limit {
                // Half the group rounds down, except that three members
                // admit two blends.
                PeerLimit::HalfGroup if members.len() == 3 => 2,
                PeerLimit::HalfGroup => members.len() / 2,
                PeerLimit::Global(_) => usize::MAX,
            };

            let mut taken = 0;
            'group: for (i, &a) in members.iter().enumerate() {
                for &b in &members[i + 1..] {
                    if taken >= group_cap || global_budget == 0 {
                        break 'group;
                    }
                    peers.push(PeerCandidate {
                        a,
                        b,
                        allocation,
                        effective_level: a.level.max(b.level),
                    });
                    taken += 1;
                    global_budget = global_budget.saturating_sub(1);
                }
            }
        }
        peers
    }
}

/// Scale of a provider droplet in the consumer's composition constraint, if
/// the provider is compatible: `allocation(c) / allocation(p)` must be an
/// integer that is itself a multiple of the consumer's factor.
fn flow_scale(consumer: &MixNode, provider_allocation: u64) -> Option<u64> {
    if provider_allocation == 0 || consumer.allocation % provider_allocation != 0 {
        return None;
    }
    let scale = consumer.allocation / provider_allocation;
    (scale % consumer.factor == 0).then_some(scale)
}
