//! Abstraction over the neural network evaluator.

use thiserror::Error;

use crate::mcts::node::Edge;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("evaluator backend failed: {0}")]
    Backend(String),
    #[error("evaluator backend is gone")]
    Disconnected,
}

/// A position encoded into evaluator input planes. The layout is owned by
/// the rules side's encoder; the search treats it as opaque.
#[derive(Debug, Clone)]
pub struct EncodedPosition {
    pub planes: Vec<f32>,
}

/// One evaluated position: value head outputs plus the legal edges with
/// their softmaxed policy priors, sorted by policy descending.
#[derive(Debug)]
pub struct NNEval {
    pub q: f32,
    pub d: f32,
    pub m: f32,
    pub e: f32,
    pub edges: Box<[Edge]>,
}

impl NNEval {
    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }
}

/// One batched evaluator call: feed inputs with [`add_input`], run them all
/// with [`compute_blocking`], then read per-index outputs. Batch size is
/// whatever was accumulated; the caching computation forwards it as is.
///
/// [`add_input`]: NetworkComputation::add_input
/// [`compute_blocking`]: NetworkComputation::compute_blocking
pub trait NetworkComputation: Send {
    fn add_input(&mut self, input: EncodedPosition);
    /// Number of inputs added so far.
    fn batch_size(&self) -> usize;
    fn compute_blocking(&mut self) -> Result<(), EvalError>;

    /// Expected value in `[-1, 1]` for input `idx`.
    fn get_q(&self, idx: usize) -> f32;
    /// Draw probability in `[0, 1]`.
    fn get_d(&self, idx: usize) -> f32;
    /// Moves-left estimate in plies.
    fn get_m(&self, idx: usize) -> f32;
    /// Eval-uncertainty head.
    fn get_e(&self, idx: usize) -> f32;
    /// Raw policy logit for `policy_index` of input `idx`.
    fn get_p(&self, idx: usize, policy_index: usize) -> f32;
}
