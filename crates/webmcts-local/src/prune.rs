//! In-place pruning of a search tree.
//!
//! Post-order per node: splice malformed children, recurse, collapse children
//! equivalent to the node itself, then collapse equivalent siblings. The
//! first-seen subtree always survives a merge. Repeats at each node until a
//! round performs no merge.

use futures_util::future::{FutureExt, LocalBoxFuture};
use serde::Serialize;
use std::cell::Cell;

use webmcts_core::canonicalize;

use crate::fuzzy::ActionMatcher;
use crate::tree::{NodeId, SearchTree};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PruneStats {
    pub nodes_before: usize,
    pub nodes_after: usize,
    pub spliced: usize,
    pub merged: usize,
}

struct Pruner<'m> {
    matcher: &'m ActionMatcher,
    spliced: Cell<usize>,
    merged: Cell<usize>,
}

/// Prune `tree` in place. Values and visit counts are never touched.
pub async fn prune(tree: &mut SearchTree, matcher: &ActionMatcher) -> PruneStats {
    let nodes_before = tree.node_count();
    let p = Pruner {
        matcher,
        spliced: Cell::new(0),
        merged: Cell::new(0),
    };
    let root = tree.root();
    p.prune_node(tree, root).await;
    let stats = PruneStats {
        nodes_before,
        nodes_after: tree.node_count(),
        spliced: p.spliced.get(),
        merged: p.merged.get(),
    };
    tracing::info!(
        before = stats.nodes_before,
        after = stats.nodes_after,
        spliced = stats.spliced,
        merged = stats.merged,
        "pruned tree"
    );
    stats
}

fn exec(tree: &SearchTree, id: NodeId) -> String {
    tree.node(id).execute_action.clone()
}

fn first_malformed(tree: &SearchTree, node: NodeId) -> Option<NodeId> {
    tree.children(node)
        .iter()
        .copied()
        .find(|&c| canonicalize(&tree.node(c).execute_action).is_err())
}

impl<'m> Pruner<'m> {
    fn prune_node<'a>(&'a self, tree: &'a mut SearchTree, node: NodeId) -> LocalBoxFuture<'a, ()> {
        async move {
            while let Some(bad) = first_malformed(tree, node) {
                self.splice(tree, bad).await;
            }

            loop {
                self.prune_children(tree, node).await;

                let own = exec(tree, node);
                let mut collapsed = false;
                for c in tree.children(node).to_vec() {
                    if tree.parent(c) != Some(node) {
                        continue;
                    }
                    if self.matcher.is_same_action(&exec(tree, c), &own).await {
                        tracing::debug!(node, child = %exec(tree, c), "collapsing child into parent");
                        self.merge_into(tree, node, c).await;
                        collapsed = true;
                    }
                }
                if collapsed {
                    self.prune_children(tree, node).await;
                }

                let merged = self.merge_sibling_duplicates(tree, node).await;
                if !collapsed && !merged {
                    break;
                }
            }
        }
        .boxed_local()
    }

    async fn prune_children(&self, tree: &mut SearchTree, node: NodeId) {
        for c in tree.children(node).to_vec() {
            if tree.parent(c) == Some(node) {
                self.prune_node(tree, c).await;
            }
        }
    }

    /// First child of `parent` (other than `skip`) equivalent to `action`.
    async fn find_equivalent(
        &self,
        tree: &SearchTree,
        parent: NodeId,
        skip: NodeId,
        action: &str,
    ) -> Option<NodeId> {
        for t in tree.children(parent).to_vec() {
            if t == skip || tree.node(t).is_detached() {
                continue;
            }
            if self.matcher.is_same_action(&exec(tree, t), action).await {
                return Some(t);
            }
        }
        None
    }

    /// Move `src`'s children under `target` (merging equivalent ones), then drop `src`.
    fn merge_into<'a>(
        &'a self,
        tree: &'a mut SearchTree,
        target: NodeId,
        src: NodeId,
    ) -> LocalBoxFuture<'a, ()> {
        async move {
            if target == src {
                return;
            }
            for gc in tree.children(src).to_vec() {
                let action = exec(tree, gc);
                match self.find_equivalent(tree, target, src, &action).await {
                    Some(same) => self.merge_into(tree, same, gc).await,
                    None => tree.reparent(gc, target),
                }
            }
            tracing::debug!(
                target = %exec(tree, target),
                src = %exec(tree, src),
                "merged subtree"
            );
            tree.detach(src);
            self.merged.set(self.merged.get() + 1);
        }
        .boxed_local()
    }

    async fn merge_sibling_duplicates(&self, tree: &mut SearchTree, node: NodeId) -> bool {
        let mut seen: Vec<NodeId> = Vec::new();
        let mut merged = false;
        for c in tree.children(node).to_vec() {
            if tree.parent(c) != Some(node) {
                continue;
            }
            let action = exec(tree, c);
            let mut found = None;
            for &s in &seen {
                if self.matcher.is_same_action(&exec(tree, s), &action).await {
                    found = Some(s);
                    break;
                }
            }
            match found {
                Some(rep) => {
                    self.merge_into(tree, rep, c).await;
                    merged = true;
                }
                None => seen.push(c),
            }
        }
        merged
    }

    /// Remove a malformed node, re-attaching its children to its parent.
    async fn splice(&self, tree: &mut SearchTree, bad: NodeId) {
        let Some(parent) = tree.parent(bad) else {
            return;
        };
        tracing::debug!(action = %exec(tree, bad), "splicing malformed node");
        for gc in tree.children(bad).to_vec() {
            let action = exec(tree, gc);
            match self.find_equivalent(tree, parent, bad, &action).await {
                Some(same) => self.merge_into(tree, same, gc).await,
                None => tree.reparent(gc, parent),
            }
        }
        tree.detach(bad);
        self.spliced.set(self.spliced.get() + 1);
    }
}
