//! Search tree arena shared by the search, prune, and mine stages.
//!
//! Nodes live in one `Vec`; parent/children are indices. Detached nodes stay
//! in the arena (flagged) and are unreachable from the root.

use serde_json::{Map, Value};
use webmcts_core::{clean_action, Error, Result};

use crate::a11y;

pub type NodeId = usize;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchNode {
    /// Canonical action that produced this node; `None` only at the root.
    pub action: Option<String>,
    /// Resolved action text; the child-mapping key under the parent.
    pub execute_action: String,
    pub state: String,
    pub trace: String,
    pub depth: usize,
    pub num_visits: u64,
    pub value: f64,
    pub value_description: String,
    /// The node's own clamped evaluation. Not persisted.
    pub reward: f64,
    pub is_terminal: bool,
    pub is_fully_expanded: bool,
    pub thinking: Option<String>,
    pub reflection: Option<String>,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
    detached: bool,
}

impl SearchNode {
    pub fn new(execute_action: impl Into<String>, state: impl Into<String>) -> Self {
        let execute_action = execute_action.into();
        Self {
            action: Some(execute_action.clone()),
            execute_action,
            state: state.into(),
            ..Self::default()
        }
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// One `<step-N>` block of a trace.
pub fn step_block(index: usize, observation: &str, reason: &str, action: &str) -> String {
    format!(
        "<step-{index}>\nOBSERVATION:\n{observation}\nREASON FOR ACTION:\n{reason}\nACTION:\n{action}\n</step-{index}>\n"
    )
}

#[derive(Debug, Clone)]
pub struct SearchTree {
    nodes: Vec<SearchNode>,
    root: NodeId,
}

impl SearchTree {
    pub fn new(root_state: impl Into<String>) -> Self {
        let root = SearchNode {
            state: root_state.into(),
            ..SearchNode::default()
        };
        Self {
            nodes: vec![root],
            root: 0,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &SearchNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut SearchNode {
        &mut self.nodes[id]
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    /// Trace step for `id` as seen from its parent.
    fn own_step(&self, id: NodeId, parent: NodeId) -> String {
        let n = &self.nodes[id];
        let observation = clean_action(&n.execute_action)
            .map(|c| a11y::highlight(&c.action, &self.nodes[parent].state))
            .unwrap_or_default();
        step_block(
            n.depth,
            &observation,
            n.thinking.as_deref().unwrap_or(""),
            &n.execute_action,
        )
    }

    /// Attach a fresh node under `parent`; depth and trace are derived from the parent.
    pub fn add_child(&mut self, parent: NodeId, mut node: SearchNode) -> NodeId {
        let id = self.nodes.len();
        node.parent = Some(parent);
        node.depth = self.nodes[parent].depth + 1;
        node.children.clear();
        node.detached = false;
        self.nodes.push(node);
        let step = self.own_step(id, parent);
        self.nodes[id].trace = format!("{}{}", self.nodes[parent].trace, step);
        self.nodes[parent].children.push(id);
        id
    }

    /// Remove `id` from its parent's children and mark its subtree detached.
    pub fn detach(&mut self, id: NodeId) {
        if let Some(p) = self.nodes[id].parent.take() {
            self.nodes[p].children.retain(|&c| c != id);
        }
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            self.nodes[n].detached = true;
            stack.extend(self.nodes[n].children.iter().copied());
        }
    }

    /// Move `id` (with its subtree) under `new_parent`, appended last.
    pub fn reparent(&mut self, id: NodeId, new_parent: NodeId) {
        if let Some(p) = self.nodes[id].parent.take() {
            self.nodes[p].children.retain(|&c| c != id);
        }
        self.nodes[id].parent = Some(new_parent);
        self.nodes[new_parent].children.push(id);
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            self.nodes[n].detached = false;
            stack.extend(self.nodes[n].children.iter().copied());
        }
        self.rehome(id);
    }

    /// Recompute depth and trace for the subtree rooted at `id`.
    pub fn rehome(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            if let Some(p) = self.nodes[n].parent {
                self.nodes[n].depth = self.nodes[p].depth + 1;
                let step = self.own_step(n, p);
                self.nodes[n].trace = format!("{}{}", self.nodes[p].trace, step);
            }
            stack.extend(self.nodes[n].children.iter().rev().copied());
        }
    }

    pub fn find_child(&self, parent: NodeId, execute_action: &str) -> Option<NodeId> {
        self.nodes[parent]
            .children
            .iter()
            .copied()
            .find(|&c| self.nodes[c].execute_action == execute_action)
    }

    /// Nodes reachable from the root, preorder, children in order.
    pub fn preorder(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![self.root];
        while let Some(n) = stack.pop() {
            out.push(n);
            stack.extend(self.nodes[n].children.iter().rev().copied());
        }
        out
    }

    pub fn node_count(&self) -> usize {
        self.preorder().len()
    }

    pub fn leaves(&self) -> Vec<NodeId> {
        self.preorder()
            .into_iter()
            .filter(|&n| self.nodes[n].children.is_empty())
            .collect()
    }

    /// Root-first path ending at `id`.
    pub fn path_from_root(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = vec![id];
        let mut cur = self.nodes[id].parent;
        while let Some(p) = cur {
            path.push(p);
            cur = self.nodes[p].parent;
        }
        path.reverse();
        path
    }

    pub fn siblings(&self, id: NodeId) -> Vec<NodeId> {
        match self.nodes[id].parent {
            Some(p) => self.nodes[p]
                .children
                .iter()
                .copied()
                .filter(|&c| c != id)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Persisted form: nested objects, children keyed by `execute_action`.
    pub fn to_json(&self) -> Result<Value> {
        self.node_to_json(self.root)
    }

    fn node_to_json(&self, id: NodeId) -> Result<Value> {
        let n = &self.nodes[id];
        let mut children = Map::new();
        for &c in &n.children {
            let key = self.nodes[c].execute_action.clone();
            if children.contains_key(&key) {
                return Err(Error::Tree(format!(
                    "duplicate child action {key:?} at depth {}",
                    n.depth
                )));
            }
            children.insert(key, self.node_to_json(c)?);
        }

        let mut obj = Map::new();
        obj.insert(
            "action".into(),
            n.action.clone().map(Value::String).unwrap_or(Value::Null),
        );
        obj.insert("state".into(), Value::String(n.state.clone()));
        obj.insert("trace".into(), Value::String(n.trace.clone()));
        obj.insert("numVisits".into(), Value::from(n.num_visits));
        obj.insert("V".into(), serde_json::json!(n.value));
        obj.insert("V_desc".into(), Value::String(n.value_description.clone()));
        obj.insert("depth".into(), Value::from(n.depth));
        obj.insert("isTerminal".into(), Value::Bool(n.is_terminal));
        obj.insert("isFullyExpanded".into(), Value::Bool(n.is_fully_expanded));
        if let Some(t) = &n.thinking {
            obj.insert("thinking".into(), Value::String(t.clone()));
        }
        if let Some(r) = &n.reflection {
            obj.insert("reflection".into(), Value::String(r.clone()));
        }
        obj.insert("children".into(), Value::Object(children));
        Ok(Value::Object(obj))
    }

    pub fn from_json(v: &Value) -> Result<Self> {
        let mut tree = Self {
            nodes: Vec::new(),
            root: 0,
        };
        // (json, key under parent, parent)
        let mut stack: Vec<(&Value, Option<String>, Option<NodeId>)> = vec![(v, None, None)];
        while let Some((obj, key, parent)) = stack.pop() {
            let Some(map) = obj.as_object() else {
                return Err(Error::Tree("tree node is not a JSON object".to_string()));
            };
            let str_field = |k: &str| {
                map.get(k)
                    .and_then(|x| x.as_str())
                    .unwrap_or("")
                    .to_string()
            };
            let opt_field = |k: &str| map.get(k).and_then(|x| x.as_str()).map(str::to_string);

            let id = tree.nodes.len();
            let execute_action = key.clone().unwrap_or_default();
            let action = match (&key, opt_field("action")) {
                (None, a) => a,
                (Some(_), Some(a)) => Some(a),
                (Some(k), None) => Some(k.clone()),
            };
            let value = map.get("V").and_then(|x| x.as_f64()).unwrap_or(0.0);
            tree.nodes.push(SearchNode {
                action,
                execute_action,
                state: str_field("state"),
                trace: str_field("trace"),
                depth: parent.map(|p| tree.nodes[p].depth + 1).unwrap_or(0),
                num_visits: map.get("numVisits").and_then(|x| x.as_u64()).unwrap_or(0),
                value,
                value_description: str_field("V_desc"),
                reward: value,
                is_terminal: map
                    .get("isTerminal")
                    .and_then(|x| x.as_bool())
                    .unwrap_or(false),
                is_fully_expanded: map
                    .get("isFullyExpanded")
                    .and_then(|x| x.as_bool())
                    .unwrap_or(false),
                thinking: opt_field("thinking"),
                reflection: opt_field("reflection"),
                children: Vec::new(),
                parent,
                detached: false,
            });
            if let Some(p) = parent {
                tree.nodes[p].children.push(id);
            }
            if let Some(children) = map.get("children").and_then(|c| c.as_object()) {
                for (k, child) in children.iter().rev() {
                    stack.push((child, Some(k.clone()), Some(id)));
                }
            }
        }
        if tree.nodes.is_empty() {
            return Err(Error::Tree("empty tree".to_string()));
        }
        Ok(tree)
    }
}
