//! Monte-Carlo tree search over simulated browser states.
//!
//! One search owns one [`SearchTree`]; oracle calls are awaited one at a time.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use webmcts_core::{
    clean_action, parse_action_thinking, Error, PolicyOracle, PolicyRequest, Result,
    RewardOracle, RewardRequest, WorldOracle,
};

use crate::a11y::{parse_observation, resolve_target};
use crate::fuzzy::ActionMatcher;
use crate::retry::{with_retries, ORACLE_RETRIES};
use crate::tree::{NodeId, SearchNode, SearchTree};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Wall-clock budget. Exclusive with `iteration_limit`.
    pub time_limit_ms: Option<u64>,
    pub iteration_limit: Option<u64>,
    /// Accepted children per expansion.
    pub branch: usize,
    /// A node whose own evaluation reaches this value ends the search.
    pub end_gate: f64,
    pub exploration_constant: f64,
    /// Weight of the best child's value in internal-node values.
    pub alpha: f64,
    pub low: f64,
    pub high: f64,
    /// Policy proposals per expansion before giving up on filling `branch`.
    pub max_proposal_attempts: usize,
    pub oracle_retries: usize,
    pub policy_temperature: f64,
    pub world_temperature: f64,
    pub reward_temperature: f64,
    pub max_tokens: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            time_limit_ms: Some(600_000),
            iteration_limit: None,
            branch: 2,
            end_gate: 4.75,
            exploration_constant: 0.7,
            alpha: 0.5,
            low: 0.0,
            high: 5.0,
            max_proposal_attempts: 6,
            oracle_retries: ORACLE_RETRIES,
            policy_temperature: 1.0,
            world_temperature: 0.7,
            reward_temperature: 0.7,
            max_tokens: 4096,
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Result<()> {
        match (self.time_limit_ms, self.iteration_limit) {
            (Some(_), Some(_)) => {
                return Err(Error::Config(
                    "cannot have both a time limit and an iteration limit".to_string(),
                ))
            }
            (None, None) => {
                return Err(Error::Config(
                    "must have either a time limit or an iteration limit".to_string(),
                ))
            }
            (None, Some(0)) => {
                return Err(Error::Config(
                    "iteration limit must be at least one".to_string(),
                ))
            }
            _ => {}
        }
        if self.branch == 0 {
            return Err(Error::Config("branch must be at least one".to_string()));
        }
        if self.low > self.high {
            return Err(Error::Config(format!(
                "value range is empty: low {} > high {}",
                self.low, self.high
            )));
        }
        Ok(())
    }
}

pub struct Oracles {
    /// Rotated round-robin per proposal.
    pub policies: Vec<Arc<dyn PolicyOracle>>,
    pub world: Arc<dyn WorldOracle>,
    pub reward: Arc<dyn RewardOracle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndGate,
    IterationLimit,
    TimeLimit,
    /// Every reachable node is terminal.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub tree: SearchTree,
    pub finishing_node: Option<NodeId>,
    pub stop_reason: StopReason,
    pub iterations: u64,
}

impl SearchOutcome {
    pub fn finished(&self) -> bool {
        self.finishing_node.is_some()
    }
}

pub struct Mcts<'a> {
    intent: String,
    cfg: SearchConfig,
    oracles: &'a Oracles,
    matcher: &'a ActionMatcher,
    policy_cursor: usize,
    deadline: Option<Instant>,
}

impl<'a> Mcts<'a> {
    /// Fails fast on contradictory budgets or a missing policy.
    pub fn new(
        intent: impl Into<String>,
        cfg: SearchConfig,
        oracles: &'a Oracles,
        matcher: &'a ActionMatcher,
    ) -> Result<Self> {
        cfg.validate()?;
        if oracles.policies.is_empty() {
            return Err(Error::Config("at least one policy oracle is required".to_string()));
        }
        Ok(Self {
            intent: intent.into(),
            cfg,
            oracles,
            matcher,
            policy_cursor: 0,
            deadline: None,
        })
    }

    pub async fn run(&mut self, root_state: impl Into<String>) -> Result<SearchOutcome> {
        let mut tree = SearchTree::new(root_state);
        let started = Instant::now();
        self.deadline = self
            .cfg
            .time_limit_ms
            .map(|ms| started + Duration::from_millis(ms));
        let mut iterations = 0u64;

        let stop_reason = loop {
            if let Some(limit) = self.cfg.iteration_limit {
                if iterations >= limit {
                    break StopReason::IterationLimit;
                }
            }
            if self.past_deadline() {
                break StopReason::TimeLimit;
            }
            if is_closed(&tree, tree.root()) {
                break StopReason::Exhausted;
            }

            iterations += 1;
            let leaf = self.select(&tree);
            tracing::debug!(
                iteration = iterations,
                node = leaf,
                depth = tree.node(leaf).depth,
                nodes = tree.node_count(),
                "selected node for expansion"
            );
            if let Some(done) = self.expand(&mut tree, leaf).await {
                tracing::info!(
                    iterations,
                    node = done,
                    value = tree.node(done).reward,
                    action = %tree.node(done).execute_action,
                    "search reached end gate"
                );
                return Ok(SearchOutcome {
                    tree,
                    finishing_node: Some(done),
                    stop_reason: StopReason::EndGate,
                    iterations,
                });
            }
        };

        tracing::info!(
            iterations,
            reason = ?stop_reason,
            nodes = tree.node_count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "search stopped"
        );
        Ok(SearchOutcome {
            tree,
            finishing_node: None,
            stop_reason,
            iterations,
        })
    }

    fn past_deadline(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn ucb(&self, tree: &SearchTree, parent: NodeId, child: NodeId) -> f64 {
        let c = tree.node(child);
        if c.num_visits == 0 {
            return f64::INFINITY;
        }
        let parent_visits = tree.node(parent).num_visits.max(1) as f64;
        let visits = c.num_visits as f64;
        c.value / visits + self.cfg.exploration_constant * (parent_visits.ln() / visits).sqrt()
    }

    /// Descend through fully expanded nodes by UCB; first child wins ties.
    fn select(&self, tree: &SearchTree) -> NodeId {
        let mut node = tree.root();
        loop {
            let n = tree.node(node);
            if n.is_terminal || !n.is_fully_expanded || n.is_leaf() {
                return node;
            }
            let mut best: Option<(NodeId, f64)> = None;
            for &c in n.children() {
                if is_closed(tree, c) {
                    continue;
                }
                let score = self.ucb(tree, node, c);
                if best.map_or(true, |(_, b)| score > b) {
                    best = Some((c, score));
                }
            }
            match best {
                Some((c, _)) => node = c,
                None => return node,
            }
        }
    }

    async fn propose(&mut self, tree: &SearchTree, node: NodeId) -> Option<String> {
        let policy = Arc::clone(&self.oracles.policies[self.policy_cursor % self.oracles.policies.len()]);
        self.policy_cursor = self.policy_cursor.wrapping_add(1);
        let n = tree.node(node);
        let req = PolicyRequest {
            intent: self.intent.clone(),
            trace: n.trace.clone(),
            observation: n.state.clone(),
        };
        with_retries("propose_action", self.cfg.oracle_retries, || async {
            let raw = policy.propose_action(&req).await?;
            if raw.trim().is_empty() {
                return Err(Error::OracleEmptyResponse(policy.name().to_string()));
            }
            Ok(raw)
        })
        .await
    }

    async fn predict(&self, state: &str, action: &str) -> Option<String> {
        let world = &self.oracles.world;
        with_retries("predict_next_state", self.cfg.oracle_retries, || async {
            let next = world.predict_next_state(state, action).await?;
            if next.trim().is_empty() {
                return Err(Error::OracleEmptyResponse(world.name().to_string()));
            }
            Ok(next)
        })
        .await
    }

    async fn evaluate(&self, tree: &SearchTree, node: NodeId) -> (f64, String) {
        let n = tree.node(node);
        let req = RewardRequest {
            intent: self.intent.clone(),
            trace: n.trace.clone(),
            state: n.state.clone(),
        };
        let reward = &self.oracles.reward;
        match with_retries("score_trajectory", self.cfg.oracle_retries, || {
            reward.score_trajectory(&req)
        })
        .await
        {
            Some(score) if score.value.is_finite() => (
                score.value.clamp(self.cfg.low, self.cfg.high),
                score.rationale,
            ),
            _ => (self.cfg.low, String::new()),
        }
    }

    /// Grow `node` by up to `branch` children. Returns a child that met the end gate.
    async fn expand(&mut self, tree: &mut SearchTree, node: NodeId) -> Option<NodeId> {
        let mut attempts = 0usize;
        while tree.children(node).len() < self.cfg.branch
            && attempts < self.cfg.max_proposal_attempts
        {
            // Partially expanded nodes stay open; the run loop reports the time limit.
            if self.past_deadline() {
                tracing::debug!(node, attempts, "time limit reached during expansion");
                return None;
            }
            attempts += 1;
            let Some(raw) = self.propose(tree, node).await else {
                tracing::debug!(node, attempts, "discarded candidate: policy exhausted retries");
                continue;
            };

            let (thinking, action_text) = parse_action_thinking(&raw);
            let action_text = if action_text.is_empty() {
                raw.trim().to_string()
            } else {
                action_text
            };
            let cleaned = match clean_action(&action_text) {
                Ok(c) => c,
                Err(e) => {
                    tracing::debug!(node, error = %e, "discarded candidate");
                    continue;
                }
            };
            let observation = parse_observation(&tree.node(node).state);
            let exec = match resolve_target(&cleaned.action, &observation) {
                Ok(resolved) => resolved.action,
                Err(e) => {
                    tracing::debug!(node, action = %cleaned.cleaned, error = %e, "discarded candidate");
                    continue;
                }
            };

            let mut duplicate = None;
            for &c in tree.children(node) {
                if self
                    .matcher
                    .is_same_action(&exec, &tree.node(c).execute_action)
                    .await
                {
                    duplicate = Some(c);
                    break;
                }
            }
            if let Some(existing) = duplicate {
                tracing::debug!(
                    node,
                    action = %exec,
                    existing = %tree.node(existing).execute_action,
                    "duplicate proposal merged into existing child"
                );
                let reward = tree.node(existing).reward;
                self.backpropagate(tree, existing, reward);
                continue;
            }

            let is_stop = cleaned.action.is_stop();
            let state = if is_stop {
                tree.node(node).state.clone()
            } else {
                let parent_state = tree.node(node).state.clone();
                match self.predict(&parent_state, &exec).await {
                    Some(s) => s,
                    None => {
                        tracing::debug!(node, action = %exec, "discarded candidate: world model failed");
                        continue;
                    }
                }
            };

            let mut child = SearchNode::new(exec, state);
            child.is_terminal = is_stop;
            child.thinking = Some(thinking).filter(|t| !t.is_empty());
            let id = tree.add_child(node, child);

            let (value, rationale) = self.evaluate(tree, id).await;
            {
                let c = tree.node_mut(id);
                c.reward = value;
                c.value_description = rationale;
            }
            self.backpropagate(tree, id, value);
            tracing::debug!(
                node,
                child = id,
                action = %tree.node(id).execute_action,
                value,
                "expanded child"
            );

            if value >= self.cfg.end_gate {
                return Some(id);
            }
        }

        let n = tree.node_mut(node);
        n.is_fully_expanded = true;
        if n.is_leaf() {
            tracing::debug!(node, attempts, "expansion produced no children; marking terminal");
            n.is_terminal = true;
        }
        None
    }

    /// Walk from `node` to the root: one visit each, values blended with the best child.
    fn backpropagate(&self, tree: &mut SearchTree, node: NodeId, reward: f64) {
        let alpha = self.cfg.alpha;
        let mut cur = Some(node);
        let mut first = true;
        while let Some(id) = cur {
            let best_child = tree
                .children(id)
                .iter()
                .map(|&c| tree.node(c).value)
                .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))));
            let n = tree.node_mut(id);
            n.num_visits += 1;
            let own = if first { reward } else { n.reward };
            n.value = match best_child {
                None => own,
                Some(best) => (1.0 - alpha) * own + alpha * best,
            };
            first = false;
            cur = n.parent();
        }
    }
}

/// Terminal, or fully expanded with every child closed.
fn is_closed(tree: &SearchTree, id: NodeId) -> bool {
    let n = tree.node(id);
    if n.is_terminal {
        return true;
    }
    n.is_fully_expanded && n.children().iter().all(|&c| is_closed(tree, c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use webmcts_core::Score;

    const PAGE: &str = "[1] RootWebArea 'Shop'\n\t[2] button 'A'\n\t[3] button 'B'\n\t[4] button 'C'";

    struct Scripted {
        responses: Mutex<VecDeque<String>>,
    }

    impl Scripted {
        fn new(rs: &[&str]) -> Self {
            Self {
                responses: Mutex::new(rs.iter().map(|s| s.to_string()).collect()),
            }
        }
    }

    #[async_trait::async_trait]
    impl PolicyOracle for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn propose_action(&self, _req: &PolicyRequest) -> Result<String> {
            Ok(self.responses.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    struct SamePage {
        calls: AtomicUsize,
        fail_on: Option<String>,
    }

    #[async_trait::async_trait]
    impl WorldOracle for SamePage {
        fn name(&self) -> &str {
            "same-page"
        }
        async fn predict_next_state(&self, state: &str, action: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on.as_deref() == Some(action) {
                return Ok(String::new());
            }
            Ok(state.to_string())
        }
    }

    struct ByAction(HashMap<String, f64>);

    #[async_trait::async_trait]
    impl RewardOracle for ByAction {
        fn name(&self) -> &str {
            "by-action"
        }
        async fn score_trajectory(&self, req: &RewardRequest) -> Result<Score> {
            let last = req
                .trace
                .rsplit("ACTION:\n")
                .next()
                .and_then(|s| s.lines().next())
                .unwrap_or("")
                .to_string();
            match self.0.get(&last) {
                Some(v) => Ok(Score {
                    value: *v,
                    rationale: format!("scored {last}"),
                }),
                None => Err(Error::OracleMalformedJson("no score".into())),
            }
        }
    }

    fn oracles(policy: &[&str], rewards: &[(&str, f64)], fail_on: Option<&str>) -> Oracles {
        Oracles {
            policies: vec![Arc::new(Scripted::new(policy))],
            world: Arc::new(SamePage {
                calls: AtomicUsize::new(0),
                fail_on: fail_on.map(str::to_string),
            }),
            reward: Arc::new(ByAction(
                rewards.iter().map(|(a, v)| (a.to_string(), *v)).collect(),
            )),
        }
    }

    fn iters(n: u64) -> SearchConfig {
        SearchConfig {
            time_limit_ms: None,
            iteration_limit: Some(n),
            oracle_retries: 1,
            ..SearchConfig::default()
        }
    }

    #[test]
    fn config_validation() {
        let both = SearchConfig {
            iteration_limit: Some(3),
            ..SearchConfig::default()
        };
        assert!(matches!(both.validate(), Err(Error::Config(_))));
        let neither = SearchConfig {
            time_limit_ms: None,
            ..SearchConfig::default()
        };
        assert!(matches!(neither.validate(), Err(Error::Config(_))));
        assert!(iters(0).validate().is_err());
        let no_branch = SearchConfig {
            branch: 0,
            ..iters(1)
        };
        assert!(no_branch.validate().is_err());
        assert!(SearchConfig::default().validate().is_ok());
    }

    #[test]
    fn search_without_policies_fails_fast() {
        let o = Oracles {
            policies: Vec::new(),
            ..oracles(&[], &[], None)
        };
        let m = ActionMatcher::offline();
        assert!(matches!(Mcts::new("x", iters(1), &o, &m), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn invalid_candidates_do_not_consume_slots() {
        let o = oracles(
            &["clikc [2]", "click [99]", "type [2] [] [1]", "click [2]", "click [3]"],
            &[("click [2]", 1.0), ("click [3]", 2.0)],
            None,
        );
        let m = ActionMatcher::offline();
        let mut mcts = Mcts::new("buy", iters(1), &o, &m).unwrap();
        let out = mcts.run(PAGE).await.unwrap();
        let t = &out.tree;
        let kids: Vec<_> = t
            .children(t.root())
            .iter()
            .map(|&c| t.node(c).execute_action.clone())
            .collect();
        assert_eq!(kids, vec!["click [2]", "click [3]"]);
        assert!(t.node(t.root()).is_fully_expanded);
        assert_eq!(out.stop_reason, StopReason::IterationLimit);
    }

    #[tokio::test]
    async fn backpropagation_blends_best_child() {
        let o = oracles(&["click [2]", "click [3]"], &[("click [2]", 3.0), ("click [3]", 1.0)], None);
        let m = ActionMatcher::offline();
        let mut mcts = Mcts::new("buy", iters(1), &o, &m).unwrap();
        let out = mcts.run(PAGE).await.unwrap();
        let t = &out.tree;
        let root = t.node(t.root());
        assert_eq!(root.num_visits, 2);
        assert!((root.value - 1.5).abs() < 1e-9, "{}", root.value);
        let a = t.node(t.children(t.root())[0]);
        assert_eq!(a.num_visits, 1);
        assert_eq!(a.value, 3.0);
        assert_eq!(a.value_description, "scored click [2]");
    }

    #[tokio::test]
    async fn duplicate_proposals_merge_into_existing_child() {
        let o = oracles(
            &["click [2]", "click  [2]", "click [3]"],
            &[("click [2]", 2.0), ("click [3]", 1.0)],
            None,
        );
        let m = ActionMatcher::offline();
        let mut mcts = Mcts::new("buy", iters(1), &o, &m).unwrap();
        let out = mcts.run(PAGE).await.unwrap();
        let t = &out.tree;
        assert_eq!(t.children(t.root()).len(), 2);
        let first = t.node(t.children(t.root())[0]);
        assert_eq!(first.num_visits, 2);
        assert_eq!(t.node(t.root()).num_visits, 3);
    }

    #[tokio::test]
    async fn stop_copies_state_and_is_terminal() {
        let o = oracles(
            &["Let's think step-by-step. Done. In summary, the next action I will perform is ```stop [42]```"],
            &[("stop [42]", 4.0)],
            None,
        );
        let m = ActionMatcher::offline();
        let cfg = SearchConfig {
            branch: 1,
            ..iters(5)
        };
        let mut mcts = Mcts::new("answer", cfg, &o, &m).unwrap();
        let out = mcts.run(PAGE).await.unwrap();
        let t = &out.tree;
        let stop = t.node(t.children(t.root())[0]);
        assert!(stop.is_terminal);
        assert_eq!(stop.state, PAGE);
        assert_eq!(stop.thinking.as_deref(), Some("Done."));
        assert_eq!(out.stop_reason, StopReason::Exhausted);
        assert_eq!(out.iterations, 1);
    }

    #[tokio::test]
    async fn end_gate_reports_finishing_node() {
        let o = oracles(
            &["click [2]", "stop [done]"],
            &[("click [2]", 2.0), ("stop [done]", 4.9)],
            None,
        );
        let m = ActionMatcher::offline();
        let cfg = SearchConfig {
            branch: 1,
            ..iters(10)
        };
        let mut mcts = Mcts::new("finish", cfg, &o, &m).unwrap();
        let out = mcts.run(PAGE).await.unwrap();
        assert!(out.finished());
        assert_eq!(out.stop_reason, StopReason::EndGate);
        let done = out.finishing_node.unwrap();
        assert_eq!(out.tree.node(done).execute_action, "stop [done]");
        assert_eq!(out.tree.node(done).depth, 2);
        assert_eq!(out.iterations, 2);
    }

    #[tokio::test]
    async fn oracle_failures_degrade_locally() {
        // world fails for click [2]; reward missing for click [3]
        let o = oracles(&["click [2]", "click [3]", "click [4]"], &[("click [4]", 9.0)], Some("click [2]"));
        let m = ActionMatcher::offline();
        let cfg = SearchConfig {
            end_gate: 10.0,
            ..iters(1)
        };
        let mut mcts = Mcts::new("x", cfg, &o, &m).unwrap();
        let out = mcts.run(PAGE).await.unwrap();
        let t = &out.tree;
        let kids: Vec<_> = t.children(t.root()).iter().map(|&c| t.node(c)).collect();
        assert_eq!(kids.len(), 2);
        assert_eq!(kids[0].execute_action, "click [3]");
        assert_eq!(kids[0].reward, 0.0);
        assert_eq!(kids[1].execute_action, "click [4]");
        assert_eq!(kids[1].reward, 5.0);
    }

    struct Slow {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PolicyOracle for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        async fn propose_action(&self, _req: &PolicyRequest) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(format!("click [{}]", 2 + n % 3))
        }
    }

    fn timed(ms: u64) -> SearchConfig {
        SearchConfig {
            time_limit_ms: Some(ms),
            iteration_limit: None,
            oracle_retries: 1,
            end_gate: 10.0,
            ..SearchConfig::default()
        }
    }

    #[tokio::test]
    async fn time_limit_stops_search() {
        let slow = Arc::new(Slow {
            delay: Duration::from_millis(30),
            calls: AtomicUsize::new(0),
        });
        let o = Oracles {
            policies: vec![slow.clone() as Arc<dyn PolicyOracle>],
            ..oracles(&[], &[("click [2]", 1.0), ("click [3]", 2.0), ("click [4]", 3.0)], None)
        };
        let m = ActionMatcher::offline();
        let mut mcts = Mcts::new("x", timed(200), &o, &m).unwrap();
        let out = mcts.run(PAGE).await.unwrap();
        assert_eq!(out.stop_reason, StopReason::TimeLimit);
        assert!(!out.finished());
        assert!(out.iterations >= 1);
    }

    #[tokio::test]
    async fn time_limit_interrupts_expansion() {
        let slow = Arc::new(Slow {
            delay: Duration::from_millis(80),
            calls: AtomicUsize::new(0),
        });
        let o = Oracles {
            policies: vec![slow.clone() as Arc<dyn PolicyOracle>],
            ..oracles(&[], &[("click [2]", 1.0), ("click [3]", 2.0), ("click [4]", 3.0)], None)
        };
        let m = ActionMatcher::offline();
        let cfg = SearchConfig {
            branch: 6,
            max_proposal_attempts: 6,
            ..timed(50)
        };
        let mut mcts = Mcts::new("x", cfg, &o, &m).unwrap();
        let out = mcts.run(PAGE).await.unwrap();
        assert_eq!(out.stop_reason, StopReason::TimeLimit);
        assert_eq!(out.iterations, 1);
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
        let root = out.tree.node(out.tree.root());
        assert!(!root.is_fully_expanded);
        assert!(!root.is_terminal);
    }

    #[tokio::test]
    async fn empty_expansion_marks_node_terminal() {
        let o = oracles(&[], &[], None);
        let m = ActionMatcher::offline();
        let mut mcts = Mcts::new("x", iters(3), &o, &m).unwrap();
        let out = mcts.run(PAGE).await.unwrap();
        assert!(out.tree.node(out.tree.root()).is_terminal);
        assert_eq!(out.stop_reason, StopReason::Exhausted);
        assert_eq!(out.iterations, 1);
    }
}
