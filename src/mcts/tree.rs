//! The node tree: root anchors, move history, transposition table, non-TT
//! pool and the deferred GC that reclaims detached low nodes.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::ptr;
use std::sync::Arc;

use crate::chess::{Move, PositionHistory, Rules, RulesError};
use crate::mcts::node::{Edge, GcQueue, LowNode, Node};
use crate::mcts::params::SearchParams;

/// Root and current-head anchors plus the shared low-node stores.
///
/// The transposition table is the ownership root for shared low nodes; the
/// non-TT pool holds low nodes unfit for sharing (noise-perturbed clones
/// and positions expanded before evaluation). Low nodes whose last parent
/// goes away are detached by the maintenance sweeps and destroyed in small
/// steps through the GC queue.
pub struct NodeTree<R: Rules> {
    rules: Arc<R>,
    gamebegin_node: Option<Box<Node>>,
    current_head: *mut Node,
    starting_fen: String,
    history: PositionHistory<R::Position>,
    moves: Vec<Move>,
    tt: Mutex<FxHashMap<u64, Arc<LowNode>>>,
    non_tt: Mutex<Vec<Arc<LowNode>>>,
    gc_queue: GcQueue,
    hash_history_length: usize,
    move_rule_bucketing: bool,
}

// The raw head cursor is only written through `&mut self`; everything it
// points at has interior synchronization.
unsafe impl<R: Rules> Send for NodeTree<R> {}
unsafe impl<R: Rules> Sync for NodeTree<R> {}

impl<R: Rules> NodeTree<R> {
    /// Applies the search parameter snapshot (cache history length, move
    /// rule bucketing).
    pub fn new(rules: Arc<R>, params: &SearchParams) -> Self {
        Self::with_hash_history(
            rules,
            params.cache_history_length() as usize + 1,
            params.move_rule_bucketing(),
        )
    }

    /// When search parameters are not available.
    pub fn without_params(rules: Arc<R>) -> Self {
        Self::with_hash_history(rules, 1, false)
    }

    fn with_hash_history(rules: Arc<R>, hash_history_length: usize, bucketing: bool) -> Self {
        NodeTree {
            rules,
            gamebegin_node: None,
            current_head: ptr::null_mut(),
            starting_fen: String::new(),
            history: PositionHistory::new(),
            moves: Vec::new(),
            tt: Mutex::new(FxHashMap::default()),
            non_tt: Mutex::new(Vec::new()),
            gc_queue: GcQueue::default(),
            hash_history_length,
            move_rule_bucketing: bucketing,
        }
    }

    pub fn rules(&self) -> &Arc<R> {
        &self.rules
    }

    pub fn gc_queue(&self) -> &GcQueue {
        &self.gc_queue
    }

    pub fn hash_history_length(&self) -> usize {
        self.hash_history_length
    }

    /// The node search starts from. Valid after `reset_to_position`.
    pub fn current_head(&self) -> &Node {
        debug_assert!(!self.current_head.is_null(), "tree has no position yet");
        unsafe { &*self.current_head }
    }

    pub fn gamebegin_node(&self) -> Option<&Node> {
        self.gamebegin_node.as_deref()
    }

    pub fn history(&self) -> &PositionHistory<R::Position> {
        &self.history
    }

    pub fn moves(&self) -> &[Move] {
        &self.moves
    }

    pub fn ply_count(&self) -> usize {
        self.moves.len()
    }

    pub fn is_black_to_move(&self) -> bool {
        self.rules.is_black_to_move(self.history.last())
    }

    /// Fingerprint used for TT nodes and the NN cache: the recent history
    /// window, with the 50-move counter mixed in under move-rule
    /// bucketing.
    pub fn history_hash_of(&self, history: &PositionHistory<R::Position>) -> u64 {
        let r50 = self
            .move_rule_bucketing
            .then(|| self.rules.rule50_ply(history.last()));
        history.hash_last(self.hash_history_length, r50)
    }

    fn head_hash(&self) -> u64 {
        self.history_hash_of(&self.history)
    }

    /// Looks a low node up in the transposition table.
    pub fn tt_find(&self, hash: u64) -> Option<Arc<LowNode>> {
        self.tt.lock().get(&hash).cloned()
    }

    /// Gets the low node for `hash`, creating and inserting an unevaluated
    /// shell on miss. Returns whether an insertion happened.
    pub fn tt_get_or_create(&self, hash: u64) -> (Arc<LowNode>, bool) {
        let mut tt = self.tt.lock();
        if let Some(low) = tt.get(&hash) {
            return (Arc::clone(low), false);
        }
        let low = Arc::new(LowNode::new_shell(hash));
        tt.insert(hash, Arc::clone(&low));
        (low, true)
    }

    /// Inserts a clone of `proto` under a possibly different hash (chess
    /// side key rotations of one position).
    pub fn tt_get_or_create_clone(&self, proto: &LowNode, hash: u64) -> (Arc<LowNode>, bool) {
        let mut tt = self.tt.lock();
        if let Some(low) = tt.get(&hash) {
            return (Arc::clone(low), false);
        }
        let low = Arc::new(LowNode::clone_from(proto, hash));
        low.set_tt_flag();
        tt.insert(hash, Arc::clone(&low));
        (low, true)
    }

    /// Adds an unshared clone of `proto` to the non-TT pool.
    pub fn non_tt_add_clone(&self, proto: &LowNode) -> Arc<LowNode> {
        let low = Arc::new(LowNode::clone_from(proto, proto.hash()));
        self.non_tt.lock().push(Arc::clone(&low));
        low
    }

    /// Queues every TT low node without parents for collection.
    pub fn tt_maintenance(&self) {
        let tt = self.tt.lock();
        let mut queued = 0usize;
        for (hash, low) in tt.iter() {
            if low.num_parents() == 0 {
                self.gc_queue.push(*hash);
                queued += 1;
            }
        }
        if queued > 0 {
            log::debug!("tt maintenance queued {queued} low nodes for gc");
        }
    }

    /// Drops non-TT low nodes without parents.
    pub fn non_tt_maintenance(&self) {
        self.non_tt.lock().retain(|low| low.num_parents() > 0);
    }

    /// Clears the transposition table. Safe only after all non-TT
    /// references were dropped.
    pub fn tt_clear(&self) {
        let mut tt = self.tt.lock();
        for low in tt.values() {
            low.clear_tt_flag();
        }
        tt.clear();
    }

    /// Destroys up to `count` queued low nodes (0 means all). Returns true
    /// while work remains. A queued low node that re-acquired a parent in
    /// the meantime is skipped.
    pub fn tt_gc_some(&self, count: usize) -> bool {
        let limit = if count == 0 { usize::MAX } else { count };
        for _ in 0..limit {
            let hash = match self.gc_queue.pop() {
                Some(hash) => hash,
                None => return false,
            };
            let owned = {
                let mut tt = self.tt.lock();
                match tt.get(&hash) {
                    Some(low) if low.num_parents() == 0 => {
                        let owned = tt.remove(&hash).expect("entry present");
                        owned.clear_tt_flag();
                        Some(owned)
                    }
                    _ => None,
                }
            };
            // Dropping outside the lock; the cascade may orphan further
            // low nodes, which the next maintenance sweep picks up.
            drop(owned);
        }
        !self.gc_queue.is_empty()
    }

    pub fn allocated_node_count(&self) -> usize {
        self.tt.lock().len() + self.non_tt.lock().len()
    }

    /// Advances the head to the child node for `mv`, spawning it if
    /// needed, and extends the history and move list. Sibling subtrees
    /// stay reachable; maintenance reclaims them once nothing refers to
    /// them.
    pub fn make_move(&mut self, mv: Move) {
        let head = unsafe { &*self.current_head };

        let low = match head.low_node() {
            Some(low) if low.edges().is_some() => low,
            prior => {
                // Unevaluated head: build an edge array from the legal
                // move list on an unshared low node.
                let legal = self.rules.legal_moves(self.history.last());
                let index = legal
                    .iter()
                    .position(|&m| m == mv)
                    .expect("made move is legal") as u16;
                let hash = prior.map_or_else(|| self.head_hash(), |l| l.hash());
                let fresh = Arc::new(LowNode::new_from_moves(hash, &legal, index));
                self.non_tt.lock().push(Arc::clone(&fresh));
                head.replace_low_node(Arc::clone(&fresh));
                fresh
            }
        };

        let index = low
            .edges()
            .expect("head low node has edges")
            .iter()
            .position(|e| e.get_move() == mv)
            .expect("made move is among edges") as u16;
        let child = {
            let mut it = low.edge_iter();
            it.seek(index);
            it.get_or_spawn_node() as *const Node as *mut Node
        };

        let next = self.rules.apply_move(self.history.last(), mv);
        let hash = self.rules.hash(&next);
        self.history.push(next, hash);
        self.moves.push(mv);

        let child_ref = unsafe { &*child };
        if !child_ref.has_low_node() {
            let (child_low, _) = self.tt_get_or_create(self.head_hash());
            child_ref.set_low_node(child_low);
        }
        self.current_head = child;
    }

    /// Resets the head's incoming-visit statistics from the previous
    /// search while keeping its low-node binding and through it the DAG.
    pub fn trim_tree_at_head(&mut self) {
        self.current_head().trim();
    }

    /// Sets the tree to `starting_fen` plus `moves`, reusing the existing
    /// DAG when the new move list extends the previous one. Returns true
    /// on reuse; on false the old tree was torn down and rebuilt.
    pub fn reset_to_position(
        &mut self,
        starting_fen: &str,
        moves: &[Move],
    ) -> Result<bool, RulesError> {
        let same_game = self.gamebegin_node.is_some()
            && self.starting_fen == starting_fen
            && moves.len() >= self.moves.len()
            && moves[..self.moves.len()] == self.moves[..];

        if !same_game {
            // Parse before tearing anything down, so a bad position leaves
            // the existing tree untouched.
            let root = self.rules.position_from_fen(starting_fen)?;
            let hash = self.rules.hash(&root);
            self.deallocate_tree();
            self.starting_fen = starting_fen.to_string();
            self.history = PositionHistory::new();
            self.history.push(root, hash);
            self.moves.clear();

            let node = Box::new(Node::new(Edge::new(Move::null()), 0));
            let (low, _) = self.tt_get_or_create(self.head_hash());
            node.set_low_node(low);
            self.current_head = Box::as_ref(&node) as *const Node as *mut Node;
            self.gamebegin_node = Some(node);
        }

        let from = self.moves.len();
        for &mv in &moves[from..] {
            self.make_move(mv);
        }
        Ok(same_game)
    }

    fn deallocate_tree(&mut self) {
        self.current_head = ptr::null_mut();
        self.gamebegin_node = None;

        // Sweep-and-collect until the cascade of parent-count drops stops
        // making progress, then drop whatever is left outright.
        loop {
            let before = self.allocated_node_count();
            self.tt_maintenance();
            self.non_tt_maintenance();
            while self.tt_gc_some(0) {}
            if self.allocated_node_count() >= before {
                break;
            }
        }
        self.non_tt.lock().clear();
        self.tt_clear();
    }
}

impl<R: Rules> Drop for NodeTree<R> {
    fn drop(&mut self) {
        self.deallocate_tree();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcts::node::Terminal;
    use crate::chess::GameResult;

    // A two-branch toy game: every position offers moves "a1a2" and
    // "a1a3"; positions are the move sequences themselves.
    #[derive(Debug)]
    struct TwoChoice;

    #[derive(Debug, Clone, PartialEq)]
    struct Line(Vec<Move>);

    impl Rules for TwoChoice {
        type Position = Line;

        fn position_from_fen(&self, fen: &str) -> Result<Line, RulesError> {
            if fen == "start" {
                Ok(Line(Vec::new()))
            } else {
                Err(RulesError::InvalidPosition(fen.to_string()))
            }
        }

        fn apply_move(&self, pos: &Line, mv: Move) -> Line {
            let mut next = pos.0.clone();
            next.push(mv);
            Line(next)
        }

        fn legal_moves(&self, _pos: &Line) -> crate::chess::MoveList {
            ["a1a2", "a1a3"].iter().map(|s| s.parse().unwrap()).collect()
        }

        fn hash(&self, pos: &Line) -> u64 {
            pos.0
                .iter()
                .fold(0xabcdu64, |h, m| h.wrapping_mul(31).wrapping_add(m.raw() as u64 + 1))
        }

        fn is_black_to_move(&self, pos: &Line) -> bool {
            pos.0.len() % 2 == 1
        }

        fn game_result(&self, _pos: &Line) -> Option<GameResult> {
            None
        }

        fn policy_index(&self, mv: Move, _transform: u8) -> usize {
            (mv.raw() & 0xff) as usize
        }

        fn encode(
            &self,
            _history: &PositionHistory<Line>,
            _fill: crate::chess::FillEmptyHistory,
        ) -> crate::neural::network::EncodedPosition {
            crate::neural::network::EncodedPosition { planes: vec![] }
        }
    }

    fn mv(s: &str) -> Move {
        s.parse().unwrap()
    }

    #[test]
    fn reset_builds_root_with_tt_shell() {
        let mut tree = NodeTree::without_params(Arc::new(TwoChoice));
        assert!(!tree.reset_to_position("start", &[]).unwrap());
        let head = tree.current_head();
        assert!(head.has_low_node());
        assert_eq!(tree.allocated_node_count(), 1);
        assert!(head.low_node().unwrap().is_tt());
    }

    #[test]
    fn make_move_spawns_child_and_advances_head() {
        let mut tree = NodeTree::without_params(Arc::new(TwoChoice));
        tree.reset_to_position("start", &[]).unwrap();
        tree.make_move(mv("a1a2"));
        assert_eq!(tree.moves(), &[mv("a1a2")]);
        let head = tree.current_head();
        assert!(head.has_low_node());
        // Root shell, the bare-edged non-TT low that replaced it on the
        // root node, and the child shell.
        assert_eq!(tree.allocated_node_count(), 3);
    }

    #[test]
    fn reset_extension_reuses_tree() {
        let mut tree = NodeTree::without_params(Arc::new(TwoChoice));
        tree.reset_to_position("start", &[mv("a1a2")]).unwrap();
        let before = tree.allocated_node_count();
        let reused = tree
            .reset_to_position("start", &[mv("a1a2"), mv("a1a3")])
            .unwrap();
        assert!(reused);
        assert_eq!(tree.moves().len(), 2);
        assert!(tree.allocated_node_count() > before);
    }

    #[test]
    fn reset_divergence_rebuilds() {
        let mut tree = NodeTree::without_params(Arc::new(TwoChoice));
        tree.reset_to_position("start", &[mv("a1a2"), mv("a1a2")])
            .unwrap();
        let reused = tree.reset_to_position("start", &[mv("a1a3")]).unwrap();
        assert!(!reused);
        assert_eq!(tree.moves(), &[mv("a1a3")]);
        // Everything unreachable was swept during the rebuild.
        assert!(!tree.tt_gc_some(0));
    }

    #[test]
    fn tt_gc_skips_resurrected_entries() {
        let tree = NodeTree::without_params(Arc::new(TwoChoice));
        let (low, inserted) = tree.tt_get_or_create(42);
        assert!(inserted);
        tree.tt_maintenance();
        // Re-acquire a parent after the sweep queued the hash.
        let node = Node::new(Edge::new(mv("a1a2")), 0);
        node.set_low_node(Arc::clone(&low));
        tree.tt_gc_some(0);
        assert!(tree.tt_find(42).is_some());
        node.unset_low_node();
        tree.tt_maintenance();
        tree.tt_gc_some(0);
        assert!(tree.tt_find(42).is_none());
        assert!(!low.is_tt());
    }

    #[test]
    fn trim_resets_head_statistics_only() {
        let mut tree = NodeTree::without_params(Arc::new(TwoChoice));
        tree.reset_to_position("start", &[]).unwrap();
        let head = tree.current_head();
        assert!(head.try_start_score_update());
        head.finalize_score_update(1.0, 0.0, 0.0, 1.0, 1, 1.0);
        head.make_terminal(GameResult::WhiteWon, 0.0, Terminal::EndOfGame);
        tree.trim_tree_at_head();
        let head = tree.current_head();
        assert_eq!(head.n(), 0);
        assert!(!head.is_terminal());
        assert!(head.has_low_node());
    }
}
