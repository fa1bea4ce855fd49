//! Trajectory mining over a pruned tree.

use serde::{Deserialize, Serialize};

use crate::tree::{NodeId, SearchTree};

/// What to do when no leaf reaches the value threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeafFallback {
    /// Terminal `stop` leaves first, then leaves scored exactly `fallback_score`.
    #[default]
    StopThenScore,
    /// Straight to leaves scored exactly `fallback_score`.
    ScoreOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    pub value_threshold: f64,
    pub fallback: LeafFallback,
    pub fallback_score: f64,
    /// Also emit root-to-leaf trajectories for the score tier.
    pub emit_valuable_on_score_fallback: bool,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            value_threshold: 4.75,
            fallback: LeafFallback::default(),
            fallback_score: 4.0,
            emit_valuable_on_score_fallback: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeafTier {
    Threshold,
    StopNodes,
    Score,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrajectoryKind {
    /// Root-to-leaf path, root first.
    Valuable,
    /// `[worst_sibling, parent, node]`.
    Traceable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trajectory {
    pub kind: TrajectoryKind,
    pub nodes: Vec<NodeId>,
}

#[derive(Debug, Clone, Default)]
pub struct Mined {
    pub tier: Option<LeafTier>,
    pub trajectories: Vec<Trajectory>,
}

impl Mined {
    pub fn is_empty(&self) -> bool {
        self.trajectories.is_empty()
    }

    pub fn of_kind(&self, kind: TrajectoryKind) -> impl Iterator<Item = &Trajectory> {
        self.trajectories.iter().filter(move |t| t.kind == kind)
    }
}

/// Sibling with the lowest value; the first one wins ties.
pub fn worst_sibling(tree: &SearchTree, node: NodeId) -> Option<NodeId> {
    let mut best: Option<NodeId> = None;
    for s in tree.siblings(node) {
        match best {
            Some(b) if tree.node(s).value.total_cmp(&tree.node(b).value).is_lt() => best = Some(s),
            None => best = Some(s),
            _ => {}
        }
    }
    best
}

fn select_leaves(tree: &SearchTree, cfg: &MinerConfig) -> Option<(LeafTier, Vec<NodeId>)> {
    let leaves = tree.leaves();

    let good: Vec<_> = leaves
        .iter()
        .copied()
        .filter(|&l| tree.node(l).value >= cfg.value_threshold)
        .collect();
    if !good.is_empty() {
        return Some((LeafTier::Threshold, good));
    }
    tracing::warn!(threshold = cfg.value_threshold, "no leaf reaches the value threshold");

    if cfg.fallback == LeafFallback::StopThenScore {
        let stops: Vec<_> = leaves
            .iter()
            .copied()
            .filter(|&l| {
                let n = tree.node(l);
                n.is_terminal && n.execute_action.contains("stop")
            })
            .collect();
        if !stops.is_empty() {
            return Some((LeafTier::StopNodes, stops));
        }
    }

    let scored: Vec<_> = leaves
        .iter()
        .copied()
        .filter(|&l| tree.node(l).value == cfg.fallback_score)
        .collect();
    if scored.is_empty() {
        None
    } else {
        Some((LeafTier::Score, scored))
    }
}

/// Valuable and traceable trajectories for every qualifying leaf.
///
/// Duplicate traceable triples across leaves sharing a prefix are kept.
pub fn extract_trajectories(tree: &SearchTree, cfg: &MinerConfig) -> Mined {
    let Some((tier, leaves)) = select_leaves(tree, cfg) else {
        return Mined::default();
    };
    let emit_valuable = match tier {
        LeafTier::Threshold | LeafTier::StopNodes => true,
        LeafTier::Score => cfg.emit_valuable_on_score_fallback,
    };

    let mut trajectories = Vec::new();
    for leaf in leaves {
        let path = tree.path_from_root(leaf);
        if emit_valuable {
            trajectories.push(Trajectory {
                kind: TrajectoryKind::Valuable,
                nodes: path.clone(),
            });
        }
        for &node in path.iter().skip(1) {
            let Some(parent) = tree.parent(node) else {
                continue;
            };
            let Some(worst) = worst_sibling(tree, node) else {
                continue;
            };
            trajectories.push(Trajectory {
                kind: TrajectoryKind::Traceable,
                nodes: vec![worst, parent, node],
            });
        }
    }
    tracing::debug!(?tier, count = trajectories.len(), "mined trajectories");
    Mined {
        tier: Some(tier),
        trajectories,
    }
}
