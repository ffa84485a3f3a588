//! Neural evaluator interface, result cache and batching plumbing.

pub mod backend;
pub mod cache;
pub mod network;

pub use backend::{BatchingBackend, RawEval};
pub use cache::{CachedNNRequest, CachingComputation, NNCache, NNCacheLock};
pub use network::{EncodedPosition, EvalError, NNEval, NetworkComputation};
