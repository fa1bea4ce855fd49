//! Accessibility-tree observations.
//!
//! Observations are tab-indented `[id] role name` lines. This module parses
//! them into a small arena, resolves action targets, and renders the
//! action-focused excerpt used in step traces.

use regex::Regex;
use std::sync::OnceLock;
use webmcts_core::{Action, Error, Result};

/// Upper bound on rendered nodes (ancestors + descendants + siblings).
pub const MAX_POINT_NUM: usize = 20;
/// Sibling budget when ancestors and descendants already fill the excerpt.
pub const MAX_SIBLING_NUM: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObsNode {
    pub node_id: String,
    pub role: String,
    pub name: String,
    pub depth: usize,
    pub visible: bool,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct Observation {
    nodes: Vec<ObsNode>,
}

fn node_line() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\t*\[\d+\]").ok()).as_ref()
}

/// Keep the leading run of node lines; stop at the first commentary line after it.
fn trim_trailing_comments(text: &str) -> Vec<&str> {
    let mut kept = Vec::new();
    for line in text.lines() {
        if node_line().is_some_and(|re| re.is_match(line)) {
            kept.push(line);
        } else if !kept.is_empty() {
            break;
        }
    }
    kept
}

pub fn parse_observation(text: &str) -> Observation {
    let text = text.split("[END]").next().unwrap_or("");
    let mut obs = Observation::default();
    // stack[level] = node that children at `level` attach to
    let mut stack: Vec<usize> = Vec::new();
    let mut old_level = 0usize;

    for line in trim_trailing_comments(text) {
        let stripped = line.trim();
        if stripped.is_empty() {
            continue;
        }
        let mut parts = stripped.splitn(3, ' ');
        let id_tok = parts.next().unwrap_or("");
        let node_id = id_tok
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let role = parts.next().unwrap_or("").to_string();
        let name = parts.next().unwrap_or("").to_string();

        let mut level = line.chars().take_while(|c| *c == '\t').count();
        if !obs.nodes.is_empty() && level == 0 {
            // a second top-level line is re-homed under the previous level
            level = if old_level != 0 { old_level } else { 1 };
        }
        // clamp to the deepest open level so malformed indentation still attaches
        if !obs.nodes.is_empty() && level > stack.len() {
            level = stack.len();
        }

        let idx = obs.nodes.len();
        let parent = if obs.nodes.is_empty() {
            None
        } else {
            stack.get(level - 1).copied()
        };
        obs.nodes.push(ObsNode {
            node_id,
            role,
            name,
            depth: level,
            visible: true,
            parent,
            children: Vec::new(),
        });
        if let Some(p) = parent {
            obs.nodes[p].children.push(idx);
        }
        stack.truncate(level);
        stack.push(idx);
        old_level = level;
    }
    obs
}

impl Observation {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, idx: usize) -> &ObsNode {
        &self.nodes[idx]
    }

    /// Preorder lookup by element id.
    pub fn find(&self, id: &str) -> Option<usize> {
        if self.nodes.is_empty() {
            return None;
        }
        let mut stack = vec![0usize];
        while let Some(i) = stack.pop() {
            if self.nodes[i].node_id == id {
                return Some(i);
            }
            stack.extend(self.nodes[i].children.iter().rev().copied());
        }
        None
    }

    fn ancestors(&self, idx: usize) -> Vec<usize> {
        let mut out = vec![idx];
        let mut cur = self.nodes[idx].parent;
        while let Some(p) = cur {
            out.push(p);
            cur = self.nodes[p].parent;
        }
        out
    }

    fn descendants(&self, idx: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![idx];
        while let Some(i) = stack.pop() {
            out.push(i);
            stack.extend(self.nodes[i].children.iter().rev().copied());
        }
        out
    }

    fn siblings(&self, idx: usize) -> Vec<usize> {
        match self.nodes[idx].parent {
            Some(p) => self.nodes[p]
                .children
                .iter()
                .copied()
                .filter(|&c| c != idx)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Render visible nodes in the input line format, indentation relative to the root.
    pub fn render_visible(&self) -> String {
        let mut lines = Vec::new();
        if self.nodes.is_empty() {
            return String::new();
        }
        let mut stack = vec![(0usize, 0usize)];
        while let Some((i, depth)) = stack.pop() {
            let n = &self.nodes[i];
            if !n.visible {
                continue;
            }
            let mut line = format!("{}[{}] {}", "\t".repeat(depth), n.node_id, n.role);
            if !n.name.is_empty() {
                line.push(' ');
                line.push_str(&n.name);
            }
            lines.push(line);
            for &c in n.children.iter().rev() {
                stack.push((c, depth + 1));
            }
        }
        lines.join("\n")
    }
}

/// An action checked against the observation it will run on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// `None` for actions that address no element.
    pub node_id: Option<String>,
    /// Canonical action text.
    pub action: String,
}

/// Element addressed by `action`, checked against `obs`.
pub fn resolve_target(action: &Action, obs: &Observation) -> Result<ResolvedTarget> {
    let node_id = match action.element_id() {
        None => None,
        Some(id) => match obs.find(id) {
            Some(_) => Some(id.to_string()),
            None => return Err(Error::UnknownElement(id.to_string())),
        },
    };
    Ok(ResolvedTarget {
        node_id,
        action: action.to_string(),
    })
}

fn id_distance(a: &str, b: &str) -> u64 {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => x.abs_diff(y),
        _ => u64::MAX,
    }
}

/// Action-focused excerpt of an observation.
///
/// Keeps the target element's ancestors and descendants plus its nearest
/// named siblings by id distance. Empty for actions without a target or when
/// the target is not present.
pub fn highlight(action: &Action, observation: &str) -> String {
    let Some(target) = action.element_id() else {
        return String::new();
    };
    let mut obs = parse_observation(observation);
    let Some(idx) = obs.find(target) else {
        return String::new();
    };
    for n in obs.nodes.iter_mut() {
        n.visible = false;
    }

    let ancestors = obs.ancestors(idx);
    let descendants = obs.descendants(idx);
    for &i in ancestors.iter().chain(descendants.iter()) {
        obs.nodes[i].visible = true;
    }
    let shown = obs.nodes.iter().filter(|n| n.visible).count();

    let mut siblings: Vec<(usize, u64)> = obs
        .siblings(idx)
        .into_iter()
        .map(|s| (s, id_distance(&obs.nodes[idx].node_id, &obs.nodes[s].node_id)))
        .collect();
    let budget = if shown >= MAX_POINT_NUM {
        MAX_SIBLING_NUM
    } else {
        (MAX_POINT_NUM - shown).max(MAX_SIBLING_NUM)
    };
    siblings.sort_by_key(|&(_, d)| d);
    for (s, _) in siblings.into_iter().take(budget) {
        if !obs.nodes[s].name.is_empty() {
            obs.nodes[s].visible = true;
        }
    }

    obs.render_visible()
}

#[cfg(test)]
mod tests {
    use super::*;
    use webmcts_core::clean_action;

    const PAGE: &str = "[1] RootWebArea 'Shop'\n\t[2] link 'Home'\n\t[3] searchbox 'Search'\n\t[4] button 'Go'\n\t\t[5] StaticText 'Go'\n\t[9] link ''\n[END]\nsome commentary";

    fn act(s: &str) -> Action {
        clean_action(s).unwrap().action
    }

    #[test]
    fn parses_levels_and_drops_tail() {
        let obs = parse_observation(PAGE);
        assert_eq!(obs.len(), 6);
        let go = obs.find("5").unwrap();
        assert_eq!(obs.node(go).depth, 2);
        assert_eq!(obs.node(obs.node(go).parent.unwrap()).node_id, "4");
        assert_eq!(obs.node(0).name, "'Shop'");
    }

    #[test]
    fn second_root_line_is_rehomed() {
        let obs = parse_observation("[1] RootWebArea 'A'\n\t[2] link 'x'\n[3] link 'y'");
        let y = obs.find("3").unwrap();
        assert_eq!(obs.node(y).depth, 1);
        assert_eq!(obs.node(y).parent, Some(0));
    }

    #[test]
    fn commentary_after_nodes_is_ignored() {
        let obs = parse_observation("note first\n[1] RootWebArea 'A'\nthen text\n\t[2] link 'x'");
        assert_eq!(obs.len(), 1);
    }

    #[test]
    fn resolves_targets() {
        let obs = parse_observation(PAGE);
        let click = resolve_target(&act("click [3]"), &obs).unwrap();
        assert_eq!(click.node_id.as_deref(), Some("3"));
        assert_eq!(click.action, "click [3]");
        let typed = resolve_target(&act("type [3]  [shoes]"), &obs).unwrap();
        assert_eq!(typed.node_id.as_deref(), Some("3"));
        assert_eq!(typed.action, "type [3] [shoes] [1]");
        let scroll = resolve_target(&act("scroll [down]"), &obs).unwrap();
        assert_eq!(scroll.node_id, None);
        assert_eq!(scroll.action, "scroll [down]");
        assert_eq!(resolve_target(&act("stop [x]"), &obs).unwrap().node_id, None);
        let err = resolve_target(&act("click [77]"), &obs).unwrap_err();
        assert!(matches!(err, Error::UnknownElement(id) if id == "77"));
    }

    #[test]
    fn highlight_keeps_path_and_named_siblings() {
        let h = highlight(&act("click [4]"), PAGE);
        assert!(h.contains("[1] RootWebArea"), "{h}");
        assert!(h.contains("\t[4] button 'Go'"), "{h}");
        assert!(h.contains("\t\t[5] StaticText 'Go'"), "{h}");
        assert!(h.contains("[3] searchbox"), "{h}");
        assert!(h.contains("[9] link ''"), "{h}");
    }

    #[test]
    fn highlight_is_empty_without_target() {
        assert_eq!(highlight(&act("go_back"), PAGE), "");
        assert_eq!(highlight(&act("click [404]"), PAGE), "");
    }
}
