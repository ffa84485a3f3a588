//! Search core of a neural-network chess engine.
//!
//! Given a starting position and an evaluator that produces a policy prior
//! plus value/draw/moves-left estimates for a batch of positions, the crate
//! builds a search DAG by repeated rollouts guided by a PUCT-style selection
//! rule and returns a ranked move list with visit counts and win-loss, draw
//! and moves-left estimates.
//!
//! The chess rules engine and the neural evaluator are external
//! collaborators, reached through the [`chess::Rules`] and
//! [`neural::NetworkComputation`] traits.

pub mod chess;
pub mod mcts;
pub mod neural;
pub mod utils;

pub use crate::mcts::node::{Edge, LowNode, Node, Terminal};
pub use crate::mcts::params::{OptionsDict, OptionsError, SearchParams};
pub use crate::mcts::search::{Search, SearchStats};
pub use crate::mcts::tree::NodeTree;
pub use crate::neural::cache::{CachingComputation, NNCache};
pub use crate::neural::network::{NNEval, NetworkComputation};
