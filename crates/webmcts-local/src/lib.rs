//! Local implementations for webmcts: the search tree and its three stages
//! (search, prune, mine), the fuzzy action matcher, chat-backed oracles and
//! the on-disk task store.

pub mod a11y;
pub mod compile;
pub mod fuzzy;
pub mod mcts;
pub mod mine;
pub mod ollama;
pub mod openai_compat;
pub mod oracles;
pub mod prompts;
pub mod prune;
pub mod registry;
pub mod retry;
pub mod store;
pub mod tree;
pub mod usage;

pub use fuzzy::{ActionMatcher, FuzzyCache};
pub use mcts::{Mcts, Oracles, SearchConfig, SearchOutcome, StopReason};
pub use mine::{extract_trajectories, LeafFallback, MinerConfig, Mined, Trajectory, TrajectoryKind};
pub use prune::{prune, PruneStats};
pub use registry::ModelRegistry;
pub use store::{TaskFile, TaskStore};
pub use tree::{NodeId, SearchNode, SearchTree};
pub use usage::{token_usage, TokenUsage};
