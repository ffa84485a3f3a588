//! The search DAG and its concurrent MCTS engine.

pub mod node;
pub mod params;
pub mod search;
pub mod tree;

pub use node::{Edge, EdgeIterator, GcQueue, LowNode, Node, Terminal, VisitedNodeIter};
pub use params::{
    ContemptMode, FpuStrategy, OptionsDict, OptionsError, ReportedNodes, ScoreType, SearchParams,
};
pub use search::{PvInfo, Search, SearchError, SearchResult, SearchStats};
pub use tree::NodeTree;
