//! Turns mined trajectories into training records.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use webmcts_core::{clean_action, format_response, ReflectionOracle, ReflectionRequest};

use crate::a11y::highlight;
use crate::prompts::{policy_input, ANSWER_PHRASE, POLICY_INTRO};
use crate::retry::with_retries;
use crate::tree::{step_block, NodeId, SearchNode, SearchTree};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingPair {
    pub input: String,
    pub output: String,
}

fn policy_prompt(intent: &str, trace: &str, observation: &str) -> String {
    format!("{POLICY_INTRO}{}", policy_input(intent, trace, observation))
}

fn node_action(n: &SearchNode) -> &str {
    n.action.as_deref().unwrap_or(&n.execute_action)
}

/// What the policy should have said to produce `n`.
fn node_output(n: &SearchNode) -> String {
    match n.thinking.as_deref().map(str::trim) {
        Some(t) if !t.is_empty() => format_response(t, node_action(n)),
        _ => node_action(n).to_string(),
    }
}

/// One pair per non-root node of a root-to-leaf path.
pub fn valuable_pairs(intent: &str, tree: &SearchTree, path: &[NodeId]) -> Vec<TrainingPair> {
    path.iter()
        .filter_map(|&id| {
            let parent = tree.node(tree.parent(id)?);
            Some(TrainingPair {
                input: policy_prompt(intent, &parent.trace, &parent.state),
                output: node_output(tree.node(id)),
            })
        })
        .collect()
}

fn node_record(n: &SearchNode) -> Value {
    json!({
        "action": n.action,
        "execute_action": n.execute_action,
        "state": n.state,
        "trace": n.trace,
        "depth": n.depth,
        "numVisits": n.num_visits,
        "V": n.value,
        "v_desc": n.value_description,
        "isFullyExpanded": n.is_fully_expanded,
        "isTerminal": n.is_terminal,
        "thinking": n.thinking,
        "reflection": n.reflection,
    })
}

/// `{intent, failure, parent, correct}` for a `[failure, parent, correct]` triple.
pub fn traceable_record(intent: &str, tree: &SearchTree, triple: &[NodeId; 3]) -> Value {
    let [failure, parent, correct] = *triple;
    json!({
        "intent": intent,
        "failure": node_record(tree.node(failure)),
        "parent": node_record(tree.node(parent)),
        "correct": node_record(tree.node(correct)),
    })
}

/// Backtracking pairs for a traceable triple: failure → `go_back` (with a
/// generated reflection), then parent → correct over the rewritten trace.
/// `None` when no reflection could be produced.
pub async fn reflection_pairs(
    intent: &str,
    tree: &SearchTree,
    triple: &[NodeId; 3],
    oracle: &dyn ReflectionOracle,
    attempts: usize,
) -> Option<Vec<TrainingPair>> {
    let [failure, parent, correct] = *triple;
    let (f, p, c) = (tree.node(failure), tree.node(parent), tree.node(correct));

    let req = ReflectionRequest {
        intent: intent.to_string(),
        failed_action: node_action(f).to_string(),
        last_state: p.state.clone(),
        current_state: f.state.clone(),
    };
    let reflection = with_retries("reflection", attempts, || oracle.generate_reflection(&req)).await?;
    tracing::debug!(failure = %f.execute_action, "generated reflection");

    let back = TrainingPair {
        input: policy_prompt(intent, &f.trace, &f.state),
        output: format!("{reflection} {ANSWER_PHRASE} ```go_back```."),
    };

    let observation = clean_action(&f.execute_action)
        .map(|a| highlight(&a.action, &f.state))
        .unwrap_or_default();
    let retrace = format!(
        "{}{}",
        f.trace,
        step_block(f.depth, &observation, &reflection, "go_back")
    );
    let forward = TrainingPair {
        input: policy_prompt(intent, &retrace, &p.state),
        output: node_output(c),
    };
    Some(vec![back, forward])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use webmcts_core::{Error, Result};

    fn tree() -> (SearchTree, [NodeId; 3]) {
        let mut t = SearchTree::new("[1] RootWebArea 'home'\n\t[2] link 'shoes'\n\t[3] link 'hats'");
        let root = t.root();
        let mut bad = SearchNode::new("click [3]", "[9] RootWebArea 'hats'");
        bad.value = 1.0;
        bad.thinking = Some("Hats might help.".into());
        let bad = t.add_child(root, bad);
        let mut good = SearchNode::new("click [2]", "[8] RootWebArea 'shoes'");
        good.value = 5.0;
        let good = t.add_child(root, good);
        (t, [bad, root, good])
    }

    #[test]
    fn valuable_pairs_skip_root_and_format_thinking() {
        let (t, [bad, root, good]) = tree();
        let pairs = valuable_pairs("buy shoes", &t, &[root, bad]);
        assert_eq!(pairs.len(), 1);
        assert!(pairs[0].input.starts_with(POLICY_INTRO));
        assert!(pairs[0].input.contains("OBJECTIVE:\nbuy shoes\n"));
        assert!(pairs[0].input.contains("[2] link 'shoes'"));
        assert_eq!(
            pairs[0].output,
            "Let's think step-by-step. Hats might help. In summary, the next action I will perform is ```click [3]```"
        );
        assert_eq!(valuable_pairs("x", &t, &[root, good])[0].output, "click [2]");
    }

    #[test]
    fn traceable_record_has_all_fields() {
        let (t, triple) = tree();
        let r = traceable_record("buy shoes", &t, &triple);
        assert_eq!(r["intent"], "buy shoes");
        assert_eq!(r["failure"]["execute_action"], "click [3]");
        assert_eq!(r["parent"]["action"], Value::Null);
        assert_eq!(r["correct"]["V"], 5.0);
        for key in [
            "action", "execute_action", "state", "trace", "depth", "numVisits", "V", "v_desc",
            "isFullyExpanded", "isTerminal", "thinking", "reflection",
        ] {
            assert!(r["correct"].get(key).is_some(), "missing {key}");
        }
    }

    struct Flaky {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ReflectionOracle for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn generate_reflection(&self, _req: &ReflectionRequest) -> Result<String> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(Error::Llm("timeout".into()));
            }
            Ok("Let's think step-by-step. Hats are off topic.".into())
        }
    }

    #[tokio::test]
    async fn reflection_pairs_backtrack_then_correct() {
        let (t, triple) = tree();
        let oracle = Flaky {
            calls: AtomicUsize::new(0),
        };
        let pairs = reflection_pairs("buy shoes", &t, &triple, &oracle, 2).await.unwrap();
        assert_eq!(pairs.len(), 2);
        assert!(pairs[0].output.ends_with("```go_back```."));
        assert!(pairs[0].input.contains("[9] RootWebArea 'hats'"));
        assert!(pairs[1].input.contains("ACTION:\ngo_back\n</step-1>"));
        assert!(pairs[1].input.contains("Hats are off topic."));
        assert_eq!(pairs[1].output, "click [2]");
    }

    #[tokio::test]
    async fn reflection_gives_up_after_attempts() {
        let (t, triple) = tree();
        let oracle = Flaky {
            calls: AtomicUsize::new(0),
        };
        assert!(reflection_pairs("x", &t, &triple, &oracle, 1).await.is_none());
    }
}
