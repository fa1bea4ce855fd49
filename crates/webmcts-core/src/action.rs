//! Action normalization.
//!
//! Policy models emit actions in a loose bracket syntax (`click [12]`,
//! `type [5] [query] [1]`, `stop [answer]`, ...). Everything downstream (tree
//! keys, dedup, training targets) uses the canonical spelling produced here.

use crate::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

pub const STOP_PLACEHOLDER: &str = "N/A";

pub const ANSWER_PHRASE: &str = "In summary, the next action I will perform is";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatReason {
    CannotParse,
    TypeContentEmpty,
}

impl fmt::Display for FormatReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CannotParse => f.write_str("cannot_parse"),
            Self::TypeContentEmpty => f.write_str("type_content_empty"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    Hover,
    Type,
    Scroll,
    Goto,
    GoBack,
    Stop,
}

impl ActionKind {
    /// Kind named by the leading verb of `raw`, without validating the rest.
    pub fn of(raw: &str) -> Option<Self> {
        let s = raw.trim_start();
        let end = s
            .find(|c: char| c.is_whitespace() || c == '[' || c == '(')
            .unwrap_or(s.len());
        match s[..end].to_ascii_lowercase().as_str() {
            "click" => Some(Self::Click),
            "hover" => Some(Self::Hover),
            "type" => Some(Self::Type),
            "scroll" => Some(Self::Scroll),
            "goto" => Some(Self::Goto),
            "go_back" => Some(Self::GoBack),
            "stop" => Some(Self::Stop),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    Click { id: String },
    Hover { id: String },
    Type { id: String, content: String, press_enter: bool },
    Scroll { direction: ScrollDirection },
    Goto { url: String },
    GoBack,
    Stop { answer: String },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Click { .. } => ActionKind::Click,
            Self::Hover { .. } => ActionKind::Hover,
            Self::Type { .. } => ActionKind::Type,
            Self::Scroll { .. } => ActionKind::Scroll,
            Self::Goto { .. } => ActionKind::Goto,
            Self::GoBack => ActionKind::GoBack,
            Self::Stop { .. } => ActionKind::Stop,
        }
    }

    /// Element addressed by the action. `scroll`/`goto`/`go_back`/`stop` address none.
    pub fn element_id(&self) -> Option<&str> {
        match self {
            Self::Click { id } | Self::Hover { id } | Self::Type { id, .. } => Some(id),
            _ => None,
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Stop { .. })
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Click { id } => write!(f, "click [{id}]"),
            Self::Hover { id } => write!(f, "hover [{id}]"),
            Self::Type {
                id,
                content,
                press_enter,
            } => write!(
                f,
                "type [{id}] [{content}] [{}]",
                if *press_enter { 1 } else { 0 }
            ),
            Self::Scroll { direction } => match direction {
                ScrollDirection::Up => f.write_str("scroll [up]"),
                ScrollDirection::Down => f.write_str("scroll [down]"),
            },
            Self::Goto { url } => write!(f, "goto [{url}]"),
            Self::GoBack => f.write_str("go_back"),
            Self::Stop { answer } => write!(f, "stop [{answer}]"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanStatus {
    /// Input already was canonical.
    Ok,
    /// Input was accepted after spacing/bracket repair or defaulting.
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanedAction {
    pub raw: String,
    pub action: Action,
    pub cleaned: String,
    pub status: CleanStatus,
}

struct Patterns {
    click: Regex,
    hover: Regex,
    typ: Regex,
    scroll: Regex,
    goto: Regex,
    go_back: Regex,
    stop: Regex,
    whitespace: Regex,
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            let re = |p: &str| Regex::new(p).ok();
            Some(Patterns {
                click: re(r"(?i)^click\s*\[\s*([^\[\]]+?)\s*\]$")?,
                hover: re(r"(?i)^hover\s*\[\s*([^\[\]]+?)\s*\]$")?,
                typ: re(
                    r"(?i)^type\s*\[\s*([^\]]+?)\s*\]\s*\[([^\]]*?)\](?:\s*\[\s*(?:press_enter_after\s*=\s*)?([01])\s*\])?$",
                )?,
                scroll: re(r"(?i)^scroll\s*\[?\s*(?:direction\s*=\s*)?(up|down)\s*\]?$")?,
                goto: re(r"(?i)^goto\s*\[\s*(.+?)\s*\]$")?,
                go_back: re(r"(?i)^go_back(?:\s*\[\s*\])?$")?,
                stop: re(r"(?i)^stop(?:\s*\[(.*)\])?$")?,
                whitespace: re(r"\s+")?,
            })
        })
        .as_ref()
}

/// Replace parenthesis delimiters with brackets and collapse whitespace.
fn light_fix(s: &str) -> String {
    let s = s.trim().replace('(', "[").replace(')', "]");
    match patterns() {
        Some(p) => p.whitespace.replace_all(&s, " ").into_owned(),
        None => s,
    }
}

fn match_strict(s: &str) -> Result<Option<(Action, bool)>> {
    let Some(p) = patterns() else {
        return Ok(None);
    };
    if let Some(c) = p.click.captures(s) {
        return Ok(Some((Action::Click { id: c[1].trim().to_string() }, false)));
    }
    if let Some(c) = p.hover.captures(s) {
        return Ok(Some((Action::Hover { id: c[1].trim().to_string() }, false)));
    }
    if let Some(c) = p.typ.captures(s) {
        let content = c[2].trim();
        if content.is_empty() {
            return Err(Error::Format {
                raw: s.to_string(),
                reason: FormatReason::TypeContentEmpty,
            });
        }
        let enter = c.get(3).map(|m| m.as_str());
        let action = Action::Type {
            id: c[1].trim().to_string(),
            content: content.to_string(),
            press_enter: enter != Some("0"),
        };
        return Ok(Some((action, enter.is_none())));
    }
    if let Some(c) = p.scroll.captures(s) {
        let direction = if c[1].eq_ignore_ascii_case("up") {
            ScrollDirection::Up
        } else {
            ScrollDirection::Down
        };
        return Ok(Some((Action::Scroll { direction }, false)));
    }
    if let Some(c) = p.goto.captures(s) {
        return Ok(Some((Action::Goto { url: c[1].trim().to_string() }, false)));
    }
    if p.go_back.is_match(s) {
        return Ok(Some((Action::GoBack, false)));
    }
    if let Some(c) = p.stop.captures(s) {
        let answer = c.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        let answer = if answer.is_empty() {
            STOP_PLACEHOLDER
        } else {
            answer
        };
        return Ok(Some((Action::Stop { answer: answer.to_string() }, false)));
    }
    Ok(None)
}

/// Normalize one action string.
///
/// Strict matching first; if that fails, one light-fix pass (parentheses to
/// brackets, whitespace collapse) and a second strict attempt. Anything still
/// unmatched is a `bad_sample`.
pub fn clean_action(raw: &str) -> Result<CleanedAction> {
    let original = raw.trim_end_matches('\n');
    let trimmed = original.trim();

    let (action, defaulted) = match match_strict(trimmed)? {
        Some(hit) => hit,
        None => {
            let fixed = light_fix(original);
            match match_strict(&fixed)? {
                Some(hit) => hit,
                None => {
                    return Err(Error::Format {
                        raw: original.to_string(),
                        reason: FormatReason::CannotParse,
                    })
                }
            }
        }
    };

    let cleaned = action.to_string();
    let status = if !defaulted && cleaned == trimmed {
        CleanStatus::Ok
    } else {
        CleanStatus::Fixed
    };
    Ok(CleanedAction {
        raw: original.to_string(),
        action,
        cleaned,
        status,
    })
}

/// Canonical spelling of `raw`, or a `Format` error.
pub fn canonicalize(raw: &str) -> Result<String> {
    clean_action(raw).map(|c| c.cleaned)
}

fn thinking_patterns() -> Option<&'static (Regex, Regex, Regex)> {
    static PATTERNS: OnceLock<Option<(Regex, Regex, Regex)>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            let phrase = regex::escape(ANSWER_PHRASE);
            let re = |p: String| Regex::new(&p).ok();
            Some((
                re(format!(r"(?is)Let's think step-by-step\.\s*(.*?)\s*{phrase}"))?,
                re(format!(r"(?is){phrase}\s*```(.*?)```"))?,
                re(format!(r"(?i){phrase}\s*([A-Za-z_]+\s*\[[0-9]+\])"))?,
            ))
        })
        .as_ref()
}

/// Split a policy response into `(thinking, action)`.
///
/// Either part is empty when the response does not follow the expected
/// "Let's think step-by-step. ... In summary, the next action I will perform
/// is ```...```" shape.
pub fn parse_action_thinking(raw: &str) -> (String, String) {
    let Some((think, fenced, bare)) = thinking_patterns() else {
        return (String::new(), String::new());
    };
    let thinking = think
        .captures(raw)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_default();
    let action = fenced
        .captures(raw)
        .map(|c| c[1].trim().to_string())
        .or_else(|| bare.captures(raw).map(|c| c[1].trim().to_string()))
        .unwrap_or_default();
    (thinking, action)
}

/// Render a policy response in the trained output format.
pub fn format_response(thinking: &str, action: &str) -> String {
    format!("Let's think step-by-step. {thinking} {ANSWER_PHRASE} ```{action}```")
}
