//! Defines the node structures of the search DAG.
//!
//! Terminology:
//! * `Edge` — a potential move with its policy prior.
//! * `Node` — an existing edge with visit counts and evaluation.
//! * `LowNode` — per-position state with evaluation and the edge array.
//!
//! Potential edges live in a plain array inside the `LowNode`. Existing
//! edges form a singly linked list, starting at the `LowNode`'s `child`
//! slot and continuing through each `Node`'s `sibling` slot, kept in
//! strictly increasing edge index order. A `Node` carries a copy of its
//! potential edge, its index among the potential edges, and a reference to
//! the target `LowNode` for the position the move leads to.
//!
//! Because transpositions share `LowNode`s through the transposition
//! table, the structure is a DAG, not a tree. Liveness of a `LowNode` is
//! tracked by its parent count; destruction is deferred through a GC queue
//! so worker threads never stall on deallocation chains.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashSet, VecDeque};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use crate::chess::{GameResult, Move};
use crate::neural::network::NNEval;
use crate::utils::{pack_policy, unpack_policy, AtomicF32, AtomicF64};

/// Single-slot owner of a heap object with atomic load, store and
/// compare-and-swap of ownership. The sibling list is traversed without a
/// lock while other workers insert new siblings, so the link-field
/// mutation must be atomic and pair acquire loads with the releasing CAS.
#[derive(Debug)]
pub struct AtomicUniquePtr<T>(AtomicPtr<T>);

impl<T> AtomicUniquePtr<T> {
    pub fn null() -> Self {
        AtomicUniquePtr(AtomicPtr::new(ptr::null_mut()))
    }

    pub fn new(value: Box<T>) -> Self {
        AtomicUniquePtr(AtomicPtr::new(Box::into_raw(value)))
    }

    #[inline]
    pub fn load(&self) -> *mut T {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        unsafe { self.load().as_ref() }
    }

    pub fn is_null(&self) -> bool {
        self.load().is_null()
    }

    /// Replaces the managed pointer, deleting the old one.
    pub fn store(&self, value: Box<T>) {
        let old = self.0.swap(Box::into_raw(value), Ordering::AcqRel);
        if !old.is_null() {
            drop(unsafe { Box::from_raw(old) });
        }
    }

    /// Replaces the managed pointer without deleting anything and returns
    /// the previous one. The caller takes over both sides' ownership
    /// accounting.
    pub fn set_raw(&self, value: *mut T) -> *mut T {
        self.0.swap(value, Ordering::AcqRel)
    }

    /// Takes ownership out of the slot.
    pub fn take(&self) -> Option<Box<T>> {
        let p = self.set_raw(ptr::null_mut());
        if p.is_null() {
            None
        } else {
            Some(unsafe { Box::from_raw(p) })
        }
    }

    /// Returns the managed pointer and releases ownership of it.
    pub fn release(&self) -> *mut T {
        self.set_raw(ptr::null_mut())
    }

    /// Moves the managed pointer in from `source` iff the current pointer
    /// equals `expected`. On success `source` no longer owns its pointer.
    pub fn compare_exchange(&self, expected: *mut T, source: &AtomicUniquePtr<T>) -> bool {
        let incoming = source.0.load(Ordering::Relaxed);
        if self
            .0
            .compare_exchange(expected, incoming, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            source.0.store(ptr::null_mut(), Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

impl<T> Drop for AtomicUniquePtr<T> {
    fn drop(&mut self) {
        self.take();
    }
}

impl<T> Default for AtomicUniquePtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

unsafe impl<T: Send> Send for AtomicUniquePtr<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicUniquePtr<T> {}

/// Queue of position hashes detached from the transposition table and
/// awaiting actual destruction. Pushed at release points, drained in small
/// steps so tree operations return without stalling on deallocation.
#[derive(Debug, Default)]
pub struct GcQueue(Mutex<VecDeque<u64>>);

impl GcQueue {
    pub fn push(&self, hash: u64) {
        self.0.lock().push_back(hash);
    }

    pub fn pop(&self) -> Option<u64> {
        self.0.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// Why a node's result is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Terminal {
    NonTerminal = 0,
    EndOfGame = 1,
    Tablebase = 2,
}

impl Terminal {
    fn from_u8(v: u8) -> Terminal {
        match v {
            1 => Terminal::EndOfGame,
            2 => Terminal::Tablebase,
            _ => Terminal::NonTerminal,
        }
    }
}

#[inline]
fn result_to_u8(r: GameResult) -> u8 {
    match r {
        GameResult::BlackWon => 0,
        GameResult::Draw => 1,
        GameResult::WhiteWon => 2,
    }
}

#[inline]
fn result_from_u8(v: u8) -> GameResult {
    match v {
        0 => GameResult::BlackWon,
        1 => GameResult::Draw,
        _ => GameResult::WhiteWon,
    }
}

/// Provable result range, mover-relative: `(lower, upper)`.
pub type Bounds = (GameResult, GameResult);

/// A potential move with its policy prior. The move is immutable after
/// construction; the prior is compressed to 16 bits (5-bit exponent,
/// 11-bit significand) and may be rewritten by softmax, noise or boosting.
#[derive(Debug)]
pub struct Edge {
    mv: Move,
    p: AtomicU16,
}

impl Edge {
    pub fn new(mv: Move) -> Self {
        Edge {
            mv,
            p: AtomicU16::new(0),
        }
    }

    /// Builds an edge array from a legal-move list, policy initialized to 0.
    pub fn from_move_list(moves: &[Move]) -> Box<[Edge]> {
        moves.iter().map(|&mv| Edge::new(mv)).collect()
    }

    pub fn get_move(&self) -> Move {
        self.mv
    }

    #[inline]
    pub fn p(&self) -> f32 {
        unpack_policy(self.p.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_p(&self, p: f32) {
        self.p.store(pack_policy(p), Ordering::Relaxed);
    }

    /// Sorts by policy descending, stable for equal policies. Called
    /// exactly once per edge array, before any child node exists: the
    /// visited-node iterator relies on unvisited suffixes staying
    /// contiguous at the end.
    pub fn sort_edges(edges: &mut [Edge]) {
        // The compressed format is monotone, so raw comparison matches
        // float comparison.
        edges.sort_by_key(|e| std::cmp::Reverse(e.p.load(Ordering::Relaxed)));
    }
}

impl Clone for Edge {
    fn clone(&self) -> Self {
        Edge {
            mv: self.mv,
            p: AtomicU16::new(self.p.load(Ordering::Relaxed)),
        }
    }
}

const FLAG_TRANSPOSITION: u8 = 1;
const FLAG_TT: u8 = 2;
const FLAG_EVALUATED: u8 = 4;

/// Per-position state, shared by every path that reaches the position.
///
/// Accumulators hold sums over completed visits; `v` and `e` keep the raw
/// network outputs and are never averaged. Ownership lives in the
/// transposition table or the non-TT pool, liveness in `num_parents`.
#[derive(Debug)]
pub struct LowNode {
    hash: u64,
    edges: OnceLock<Box<[Edge]>>,
    child: AtomicUniquePtr<Node>,
    wl: AtomicF64,
    d: AtomicF64,
    m: AtomicF64,
    vs: AtomicF64,
    weight: AtomicF64,
    v: AtomicF32,
    e: AtomicF32,
    n: AtomicU32,
    num_parents: AtomicU16,
    terminal_type: AtomicU8,
    lower_bound: AtomicU8,
    upper_bound: AtomicU8,
    flags: AtomicU8,
}

impl LowNode {
    /// A TT shell: exists in the table before evaluation.
    pub fn new_shell(hash: u64) -> Self {
        LowNode {
            hash,
            edges: OnceLock::new(),
            child: AtomicUniquePtr::null(),
            wl: AtomicF64::default(),
            d: AtomicF64::default(),
            m: AtomicF64::default(),
            vs: AtomicF64::default(),
            weight: AtomicF64::default(),
            v: AtomicF32::default(),
            e: AtomicF32::default(),
            n: AtomicU32::new(0),
            num_parents: AtomicU16::new(0),
            terminal_type: AtomicU8::new(Terminal::NonTerminal as u8),
            lower_bound: AtomicU8::new(result_to_u8(GameResult::BlackWon)),
            upper_bound: AtomicU8::new(result_to_u8(GameResult::WhiteWon)),
            flags: AtomicU8::new(FLAG_TT),
        }
    }

    /// A non-TT low node carrying edges from a bare move list (policy 0)
    /// and its first child at `index`. Used when the head advances through
    /// a position that was never evaluated.
    pub fn new_from_moves(hash: u64, moves: &[Move], index: u16) -> Self {
        let node = LowNode::new_shell(hash);
        node.flags.store(0, Ordering::Relaxed);
        let edges = Edge::from_move_list(moves);
        let first = Box::new(Node::new(edges[index as usize].clone(), index));
        node.edges.set(edges).expect("fresh low node");
        node.child.store(first);
        node
    }

    /// An unshared clone of `proto` under a possibly different hash,
    /// carrying its evaluation but none of its visits or children. The
    /// clone may then be noise-perturbed without contaminating the shared
    /// entry; `e` is inherited from the prototype.
    pub fn clone_from(proto: &LowNode, hash: u64) -> Self {
        let node = LowNode::new_shell(hash);
        node.flags.store(
            proto.flags.load(Ordering::Relaxed) & FLAG_EVALUATED,
            Ordering::Relaxed,
        );
        if let Some(edges) = proto.edges() {
            let copy: Box<[Edge]> = edges.iter().cloned().collect();
            node.edges.set(copy).expect("fresh low node");
        }
        node.wl.store(proto.wl.load());
        node.d.store(proto.d.load());
        node.m.store(proto.m.load());
        node.vs.store(proto.vs.load());
        node.v.store(proto.v.load());
        node.e.store(proto.e.load());
        node
    }

    /// Installs a network evaluation into an empty shell: edges are copied
    /// with their (already softmaxed and sorted) policies, accumulators are
    /// seeded with the raw eval. The seed is converted into the first
    /// counted visit by `finalize_score_update`. Returns false when another
    /// worker installed an evaluation first.
    pub fn set_nn_eval(&self, eval: &NNEval) -> bool {
        let copy: Box<[Edge]> = eval.edges.iter().cloned().collect();
        if self.edges.set(copy).is_err() {
            return false;
        }
        debug_assert_eq!(self.n.load(Ordering::Acquire), 0);
        debug_assert!(self.child.is_null());

        let q = eval.q as f64;
        self.wl.store(q);
        self.v.store(eval.q);
        self.d.store(eval.d as f64);
        self.e.store(eval.e);
        self.m.store(eval.m as f64);
        self.vs.store(q * q);
        self.flags.fetch_or(FLAG_EVALUATED, Ordering::Release);

        debug_assert!(self.wldm_invariants_hold());
        true
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn edges(&self) -> Option<&[Edge]> {
        self.edges.get().map(|e| &**e)
    }

    pub fn edge_at(&self, index: u16) -> &Edge {
        &self.edges.get().expect("low node has edges")[index as usize]
    }

    pub fn num_edges(&self) -> usize {
        self.edges.get().map_or(0, |e| e.len())
    }

    pub fn has_children(&self) -> bool {
        self.num_edges() > 0
    }

    pub fn child(&self) -> &AtomicUniquePtr<Node> {
        &self.child
    }

    /// Whether a network evaluation (or a clone of one) was installed.
    pub fn is_evaluated(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_EVALUATED != 0
    }

    pub fn n(&self) -> u32 {
        self.n.load(Ordering::Acquire)
    }

    /// Completed visits that went through a child.
    pub fn children_visits(&self) -> u32 {
        self.n().saturating_sub(1)
    }

    pub fn wl(&self) -> f64 {
        self.wl.load()
    }

    pub fn d(&self) -> f64 {
        self.d.load()
    }

    pub fn m(&self) -> f64 {
        self.m.load()
    }

    pub fn vs(&self) -> f64 {
        self.vs.load()
    }

    pub fn weight(&self) -> f64 {
        self.weight.load()
    }

    pub fn v(&self) -> f32 {
        self.v.load()
    }

    pub fn e(&self) -> f32 {
        self.e.load()
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_type() != Terminal::NonTerminal
    }

    pub fn terminal_type(&self) -> Terminal {
        Terminal::from_u8(self.terminal_type.load(Ordering::Acquire))
    }

    pub fn bounds(&self) -> Bounds {
        (
            result_from_u8(self.lower_bound.load(Ordering::Relaxed)),
            result_from_u8(self.upper_bound.load(Ordering::Relaxed)),
        )
    }

    pub fn set_bounds(&self, lower: GameResult, upper: GameResult) {
        self.lower_bound.store(result_to_u8(lower), Ordering::Relaxed);
        self.upper_bound.store(result_to_u8(upper), Ordering::Relaxed);
    }

    /// Overrides the accumulators with the deterministic values of a
    /// decided position. With prior visits the per-visit values are scaled
    /// by the visit count so averages stay exact.
    pub fn make_terminal(&self, result: GameResult, plies_left: f32, terminal_type: Terminal) {
        let visits = self.n().max(1);
        let k = visits as f64;
        let wl = result.wl() as f64;
        self.wl.store(wl * k);
        self.d.store(if result == GameResult::Draw { k } else { 0.0 });
        self.m.store(plies_left as f64 * k);
        self.vs.store(wl * wl * k);
        self.weight.store(k);
        self.n.store(visits, Ordering::Release);
        self.set_bounds(result, result);
        self.terminal_type
            .store(terminal_type as u8, Ordering::Release);
    }

    /// Reverts a terminal back to a live position, restoring the sums from
    /// the incoming node's accumulators (the node view is mover-flipped and
    /// one ply closer to the end per visit).
    pub fn make_not_terminal(&self, incoming: &Node) {
        self.terminal_type
            .store(Terminal::NonTerminal as u8, Ordering::Release);
        self.set_bounds(GameResult::BlackWon, GameResult::WhiteWon);

        let n = incoming.n();
        self.n.store(n, Ordering::Release);
        if n > 0 {
            self.wl.store(-incoming.wl());
            self.d.store(incoming.d());
            self.m.store(incoming.m() - n as f64);
            self.vs.store(incoming.vs());
            self.weight.store(incoming.weight());
        }
    }

    /// Adds `multivisit` visits of value `v` (and friends) to the sums. A
    /// first visit absorbs the evaluation seed left by `set_nn_eval`
    /// instead of double-counting it.
    pub fn finalize_score_update(
        &self,
        v: f64,
        d: f64,
        m: f64,
        vs: f64,
        multivisit: u32,
        multiweight: f64,
    ) {
        let k = multivisit as f64;
        if self.n.load(Ordering::Acquire) == 0 {
            self.wl.store(v * k);
            self.d.store(d * k);
            self.m.store(m * k);
            self.vs.store(vs * k);
            self.weight.store(multiweight);
        } else {
            self.wl.add(v * k);
            self.d.add(d * k);
            self.m.add(m * k);
            self.vs.add(vs * k);
            self.weight.add(multiweight);
        }
        self.n.fetch_add(multivisit, Ordering::AcqRel);

        debug_assert!(self.wldm_invariants_hold());
    }

    /// Applies a delta against existing visits without changing `n`. Used
    /// to rewrite ancestor sums when a descendant turns terminal.
    pub fn adjust_for_terminal(
        &self,
        v: f64,
        d: f64,
        m: f64,
        vs: f64,
        multivisit: u32,
        multiweight: f64,
    ) {
        let k = multivisit as f64;
        self.wl.add(v * k);
        self.d.add(d * k);
        self.m.add(m * k);
        self.vs.add(vs * k);
        self.weight.add(multiweight);
    }

    /// Registers a new incoming node reference. Crossing one parent sets
    /// the permanent transposition bit.
    pub fn add_parent(&self) {
        let before = self.num_parents.fetch_add(1, Ordering::AcqRel);
        if before >= 1 {
            self.flags.fetch_or(FLAG_TRANSPOSITION, Ordering::Release);
        }
    }

    pub fn remove_parent(&self) {
        let before = self.num_parents.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(before > 0, "parent count underflow");
    }

    pub fn num_parents(&self) -> u16 {
        self.num_parents.load(Ordering::Acquire)
    }

    pub fn is_transposition(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_TRANSPOSITION != 0
    }

    pub fn is_tt(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_TT != 0
    }

    /// Marks the low node as no longer reachable through the TT. Always
    /// clears; a search boundary wants a definite state.
    pub fn clear_tt_flag(&self) {
        self.flags.fetch_and(!FLAG_TT, Ordering::Release);
    }

    /// Marks the low node as reachable through the TT again (clone
    /// insertion under a rotated key).
    pub fn set_tt_flag(&self) {
        self.flags.fetch_or(FLAG_TT, Ordering::Release);
    }

    /// Iterates (edge, existing node) pairs.
    pub fn edge_iter(&self) -> EdgeIterator<'_> {
        EdgeIterator::new(self)
    }

    /// Iterates existing child nodes with at least one completed visit.
    pub fn visited_iter(&self) -> VisitedNodeIter<'_> {
        VisitedNodeIter::new(self)
    }

    /// Deletes all children, unbinding their low nodes and queueing the
    /// hashes of any that lose their last parent.
    pub fn release_children(&self, gc_queue: &GcQueue) {
        if let Some(first) = self.child.take() {
            release_chain(first, gc_queue);
        }
    }

    /// Deletes all children except the one at `saved`. The kept node's
    /// ownership is moved into the head slot, so callers must rebind any
    /// pointer through the returned address.
    pub fn release_children_except_one(
        &self,
        saved: *const Node,
        gc_queue: &GcQueue,
    ) -> *const Node {
        let mut kept: Option<Box<Node>> = None;
        let mut cursor = self.child.take();
        while let Some(node) = cursor {
            cursor = node.sibling.take();
            if ptr::eq(&*node, saved) {
                kept = Some(node);
            } else {
                release_subtree(node, gc_queue);
            }
        }
        match kept {
            Some(node) => {
                let address = &*node as *const Node;
                self.child.store(node);
                address
            }
            None => ptr::null(),
        }
    }

    pub fn wldm_invariants_hold(&self) -> bool {
        let n = self.n() as f64;
        if n == 0.0 {
            return true;
        }
        let (wl, d, m, vs) = (self.wl(), self.d(), self.m(), self.vs());
        wl.is_finite()
            && d.is_finite()
            && m.is_finite()
            && vs.is_finite()
            && wl.abs() <= n + 1e-6
            && (-1e-6..=n + 1e-6).contains(&d)
    }
}

/// Per-incoming-edge state, localizing one move's arrival at a low node.
/// Owned by its parent low node through the child/sibling chain.
///
/// `wl` is from the mover's perspective — flipped relative to the low node
/// it points at. `n_in_flight` is the virtual-loss counter; it is the only
/// field other workers race on, and the release decrement in
/// `finalize_score_update` is what publishes the updated sums.
#[derive(Debug)]
pub struct Node {
    edge: Edge,
    index: u16,
    low_node: RwLock<Option<Arc<LowNode>>>,
    sibling: AtomicUniquePtr<Node>,
    wl: AtomicF64,
    d: AtomicF64,
    m: AtomicF64,
    vs: AtomicF64,
    weight: AtomicF64,
    n: AtomicU32,
    n_in_flight: AtomicU32,
    terminal_type: AtomicU8,
    lower_bound: AtomicU8,
    upper_bound: AtomicU8,
    repetition: AtomicU8,
}

impl Node {
    /// Takes its own copy of `edge` and its `index` in the parent.
    pub fn new(edge: Edge, index: u16) -> Self {
        Node {
            edge,
            index,
            low_node: RwLock::new(None),
            sibling: AtomicUniquePtr::null(),
            wl: AtomicF64::default(),
            d: AtomicF64::default(),
            m: AtomicF64::default(),
            vs: AtomicF64::default(),
            weight: AtomicF64::default(),
            n: AtomicU32::new(0),
            n_in_flight: AtomicU32::new(0),
            terminal_type: AtomicU8::new(Terminal::NonTerminal as u8),
            lower_bound: AtomicU8::new(result_to_u8(GameResult::BlackWon)),
            upper_bound: AtomicU8::new(result_to_u8(GameResult::WhiteWon)),
            repetition: AtomicU8::new(0),
        }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn get_move(&self) -> Move {
        self.edge.get_move()
    }

    /// Policy prior of this node's own edge copy; may diverge from the
    /// parent array once noise or boosting rewrote it.
    pub fn p(&self) -> f32 {
        self.edge.p()
    }

    pub fn set_p(&self, p: f32) {
        self.edge.set_p(p);
    }

    pub fn sibling(&self) -> &AtomicUniquePtr<Node> {
        &self.sibling
    }

    pub fn low_node(&self) -> Option<Arc<LowNode>> {
        self.low_node.read().clone()
    }

    pub fn has_low_node(&self) -> bool {
        self.low_node.read().is_some()
    }

    /// Binds this node to a shared low node, registering the parent
    /// reference. Returns false (binding nothing) when another worker got
    /// there first.
    pub fn set_low_node(&self, low: Arc<LowNode>) -> bool {
        let mut slot = self.low_node.write();
        if slot.is_some() {
            return false;
        }
        low.add_parent();
        *slot = Some(low);
        true
    }

    /// Rebinds to a different low node (noise clone at the root).
    pub fn replace_low_node(&self, low: Arc<LowNode>) {
        let mut slot = self.low_node.write();
        if let Some(old) = slot.take() {
            old.remove_parent();
        }
        low.add_parent();
        *slot = Some(low);
    }

    pub fn unset_low_node(&self) {
        if let Some(old) = self.low_node.write().take() {
            old.remove_parent();
        }
    }

    pub fn hash(&self) -> Option<u64> {
        self.low_node.read().as_ref().map(|l| l.hash())
    }

    pub fn is_tt(&self) -> bool {
        self.low_node.read().as_ref().map_or(false, |l| l.is_tt())
    }

    pub fn num_edges(&self) -> usize {
        self.low_node.read().as_ref().map_or(0, |l| l.num_edges())
    }

    pub fn n(&self) -> u32 {
        self.n.load(Ordering::Acquire)
    }

    pub fn n_in_flight(&self) -> u32 {
        self.n_in_flight.load(Ordering::Acquire)
    }

    /// Completed plus in-flight visits; the selection denominator.
    pub fn n_started(&self) -> u32 {
        self.n() + self.n_in_flight()
    }

    pub fn wl(&self) -> f64 {
        self.wl.load()
    }

    pub fn d(&self) -> f64 {
        self.d.load()
    }

    pub fn m(&self) -> f64 {
        self.m.load()
    }

    pub fn vs(&self) -> f64 {
        self.vs.load()
    }

    pub fn weight(&self) -> f64 {
        self.weight.load()
    }

    /// In-flight visits have no weight of their own, so estimate one each.
    pub fn weight_started(&self) -> f64 {
        self.weight() + self.n_in_flight() as f64
    }

    /// Average Q with the given draw score. Caller guards `n > 0`.
    pub fn q(&self, draw_score: f64) -> f64 {
        let n = self.n() as f64;
        (self.wl() + draw_score * self.d()) / n
    }

    /// Sum of policy priors of children with at least one completed visit.
    pub fn visited_policy(&self) -> f32 {
        match self.low_node() {
            Some(low) => low.visited_iter().map(|child| child.p()).sum(),
            None => 0.0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_type() != Terminal::NonTerminal
    }

    pub fn is_tb_terminal(&self) -> bool {
        self.terminal_type() == Terminal::Tablebase
    }

    pub fn terminal_type(&self) -> Terminal {
        Terminal::from_u8(self.terminal_type.load(Ordering::Acquire))
    }

    /// Mover-relative result when decided.
    pub fn terminal_result(&self) -> Option<GameResult> {
        if self.is_terminal() {
            Some(self.bounds().0)
        } else {
            None
        }
    }

    pub fn bounds(&self) -> Bounds {
        (
            result_from_u8(self.lower_bound.load(Ordering::Relaxed)),
            result_from_u8(self.upper_bound.load(Ordering::Relaxed)),
        )
    }

    pub fn set_bounds(&self, lower: GameResult, upper: GameResult) {
        self.lower_bound.store(result_to_u8(lower), Ordering::Relaxed);
        self.upper_bound.store(result_to_u8(upper), Ordering::Relaxed);
    }

    /// Marks the node decided without touching its accumulators; used when
    /// a node adopts a terminal discovered through its (shared) low node
    /// and the visit accounting happens separately.
    pub fn set_terminal_type(&self, terminal_type: Terminal) {
        self.terminal_type
            .store(terminal_type as u8, Ordering::Release);
    }

    pub fn set_repetition(&self) {
        self.repetition.store(1, Ordering::Relaxed);
    }

    pub fn is_repetition(&self) -> bool {
        self.repetition.load(Ordering::Relaxed) != 0
    }

    /// Marks the node decided with deterministic accumulator values; with
    /// prior visits the per-visit values are scaled so averages stay exact.
    pub fn make_terminal(&self, result: GameResult, plies_left: f32, terminal_type: Terminal) {
        let visits = self.n().max(1);
        let k = visits as f64;
        let wl = result.wl() as f64;
        self.wl.store(wl * k);
        self.d.store(if result == GameResult::Draw { k } else { 0.0 });
        self.m.store(plies_left as f64 * k);
        self.vs.store(wl * wl * k);
        self.weight.store(k);
        self.n.store(visits, Ordering::Release);
        self.set_bounds(result, result);
        self.terminal_type
            .store(terminal_type as u8, Ordering::Release);
    }

    /// Makes the node live again, restoring sums from its low node's
    /// (mover-flipped) averages. Reverts the low node too unless
    /// `also_low_node` is false.
    pub fn make_not_terminal(&self, also_low_node: bool) {
        if also_low_node {
            if let Some(low) = self.low_node() {
                if low.is_terminal() {
                    low.make_not_terminal(self);
                }
            }
        }
        self.terminal_type
            .store(Terminal::NonTerminal as u8, Ordering::Release);
        self.set_bounds(GameResult::BlackWon, GameResult::WhiteWon);

        if let Some(low) = self.low_node() {
            let n = self.n();
            if n > 0 && low.n() > 0 {
                let ln = low.n() as f64;
                let k = n as f64;
                self.wl.store(-(low.wl() / ln) * k);
                self.d.store((low.d() / ln) * k);
                self.m.store((low.m() / ln + 1.0) * k);
                self.vs.store((low.vs() / ln) * k);
                self.weight.store((low.weight() / ln) * k);
            }
        }
    }

    /// Claims a visit. Fails only when the node is fresh (`n == 0`) and
    /// another worker already has its single expansion visit in flight.
    pub fn try_start_score_update(&self) -> bool {
        if self.n.load(Ordering::Acquire) == 0 {
            self.n_in_flight
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        } else {
            self.n_in_flight.fetch_add(1, Ordering::AcqRel);
            true
        }
    }

    /// Returns `multivisit` claimed visits without producing a value.
    pub fn cancel_score_update(&self, multivisit: u32) {
        let before = self.n_in_flight.fetch_sub(multivisit, Ordering::Release);
        debug_assert!(before >= multivisit, "n_in_flight underflow");
    }

    /// Amplifies the current visit to `multivisit` virtual visits
    /// (collisions, or revisits of a known-terminal leaf).
    pub fn increment_n_in_flight(&self, multivisit: u32) {
        self.n_in_flight.fetch_add(multivisit, Ordering::AcqRel);
    }

    /// Lands a completed visit: sums first, then the release decrement of
    /// `n_in_flight` — the order is what lets other workers trust the sums
    /// once they observe the decrement.
    pub fn finalize_score_update(
        &self,
        v: f64,
        d: f64,
        m: f64,
        vs: f64,
        multivisit: u32,
        multiweight: f64,
    ) {
        let k = multivisit as f64;
        self.wl.add(v * k);
        self.d.add(d * k);
        self.m.add(m * k);
        self.vs.add(vs * k);
        self.weight.add(multiweight);
        self.n.fetch_add(multivisit, Ordering::AcqRel);
        let before = self.n_in_flight.fetch_sub(multivisit, Ordering::AcqRel);
        debug_assert!(before >= multivisit, "n_in_flight underflow");
        debug_assert!(self.wldm_invariants_hold());
    }

    /// Applies a delta against existing visits without changing `n`.
    pub fn adjust_for_terminal(
        &self,
        v: f64,
        d: f64,
        m: f64,
        vs: f64,
        multivisit: u32,
        multiweight: f64,
    ) {
        let k = multivisit as f64;
        self.wl.add(v * k);
        self.d.add(d * k);
        self.m.add(m * k);
        self.vs.add(vs * k);
        self.weight.add(multiweight);
    }

    /// Resets visit statistics and flags, keeping edge, index, sibling and
    /// the low-node binding (and through it the subtree).
    pub fn trim(&self) {
        debug_assert_eq!(self.n_in_flight(), 0);
        self.wl.store(0.0);
        self.d.store(0.0);
        self.m.store(0.0);
        self.vs.store(0.0);
        self.weight.store(0.0);
        self.n.store(0, Ordering::Release);
        self.terminal_type
            .store(Terminal::NonTerminal as u8, Ordering::Release);
        self.set_bounds(GameResult::BlackWon, GameResult::WhiteWon);
        self.repetition.store(0, Ordering::Relaxed);
    }

    /// Walks the reachable DAG and reports every node with a leftover
    /// in-flight visit. True when the graph is quiescent.
    pub fn zero_n_in_flight(&self) -> bool {
        let mut seen: HashSet<*const LowNode> = HashSet::new();
        let mut ok = true;
        self.walk_in_flight(&mut seen, &mut ok);
        ok
    }

    fn walk_in_flight(&self, seen: &mut HashSet<*const LowNode>, ok: &mut bool) {
        let in_flight = self.n_in_flight();
        if in_flight != 0 {
            *ok = false;
            log::error!(
                "node for {} (index {}) has n_in_flight {} at quiescence",
                self.get_move(),
                self.index,
                in_flight
            );
        }
        if let Some(low) = self.low_node() {
            if !seen.insert(Arc::as_ptr(&low)) {
                return;
            }
            let mut child = low.child().get();
            while let Some(node) = child {
                node.walk_in_flight(seen, ok);
                child = node.sibling().get();
            }
        }
    }

    pub fn wldm_invariants_hold(&self) -> bool {
        let n = self.n() as f64;
        if n == 0.0 {
            return true;
        }
        let (wl, d, m, vs) = (self.wl(), self.d(), self.m(), self.vs());
        wl.is_finite()
            && d.is_finite()
            && m.is_finite()
            && vs.is_finite()
            && wl.abs() <= n + 1e-6
            && (-1e-6..=n + 1e-6).contains(&d)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // Orphaned low nodes are swept by the next TT maintenance pass.
        self.unset_low_node();
    }
}

/// Tears down a whole sibling chain.
fn release_chain(first: Box<Node>, gc_queue: &GcQueue) {
    let mut cursor = Some(first);
    while let Some(node) = cursor {
        cursor = node.sibling.take();
        release_subtree(node, gc_queue);
    }
}

/// Releases one node, queueing its low node's hash if the parent count
/// drops to zero. The low node's own children are left to the GC pass that
/// destroys it.
fn release_subtree(node: Box<Node>, gc_queue: &GcQueue) {
    if let Some(low) = node.low_node.write().take() {
        low.remove_parent();
        if low.num_parents() == 0 {
            gc_queue.push(low.hash());
        }
    }
    drop(node);
}

/// Recomputes a parent low node's provable bounds from its child nodes and
/// terminalizes it when the range collapses. Child results are
/// mover-relative at the parent, so a winning child decides the parent
/// outright. Returns true when the parent became terminal.
pub fn update_parent_bounds(parent: &LowNode, sticky: bool) -> bool {
    let num_edges = parent.num_edges();
    if num_edges == 0 || parent.is_terminal() {
        return false;
    }

    let mut decided = 0usize;
    let mut best: Option<GameResult> = None;
    let mut best_plies = 0.0f32;
    let mut all_tablebase = true;
    let mut child = parent.child().get();
    while let Some(node) = child {
        if let Some(result) = node.terminal_result() {
            decided += 1;
            if node.terminal_type() != Terminal::Tablebase {
                all_tablebase = false;
            }
            let plies = if node.n() > 0 {
                (node.m() / node.n() as f64) as f32
            } else {
                0.0
            };
            if best.map_or(true, |b| result > b) {
                best = Some(result);
                best_plies = plies;
            }
        } else {
            all_tablebase = false;
        }
        child = node.sibling().get();
    }

    let lower = best.unwrap_or(GameResult::BlackWon);
    let all_decided = decided == num_edges;
    let upper = if all_decided {
        lower
    } else {
        GameResult::WhiteWon
    };

    let has_win = best == Some(GameResult::WhiteWon);
    if all_decided || (has_win && sticky) {
        let terminal_type = if all_tablebase && all_decided {
            Terminal::Tablebase
        } else {
            Terminal::EndOfGame
        };
        parent.make_terminal(lower, best_plies + 1.0, terminal_type);
        return true;
    }
    parent.set_bounds(lower, upper);
    false
}

unsafe fn node_ref<'a>(ptr: *mut Node) -> Option<&'a Node> {
    ptr.as_ref()
}

/// One (edge, existing node) pair seen by the edge iterator.
#[derive(Clone, Copy)]
pub struct EdgeAndNode<'a> {
    pub index: u16,
    pub edge: &'a Edge,
    pub node: Option<&'a Node>,
}

impl<'a> EdgeAndNode<'a> {
    /// Node policy when expanded (noise may have rewritten it), edge
    /// policy otherwise.
    pub fn p(&self) -> f32 {
        self.node.map_or_else(|| self.edge.p(), |n| n.p())
    }

    pub fn n(&self) -> u32 {
        self.node.map_or(0, |n| n.n())
    }

    pub fn n_started(&self) -> u32 {
        self.node.map_or(0, |n| n.n_started())
    }

    pub fn get_move(&self) -> Move {
        self.edge.get_move()
    }
}

/// Lazy traversal of the edge array paired with existing child nodes,
/// carrying the pointer-to-slot cursor that doubles as the attach point
/// for spawning.
///
/// Safe to interleave with concurrent spawns by other workers; not safe to
/// interleave with operations that remove or reorder siblings (those are
/// externally synchronized tree maintenance).
pub struct EdgeIterator<'a> {
    edges: &'a [Edge],
    current: usize,
    slot: &'a AtomicUniquePtr<Node>,
    node: Option<&'a Node>,
}

impl<'a> EdgeIterator<'a> {
    pub fn new(parent: &'a LowNode) -> Self {
        let mut it = EdgeIterator {
            edges: parent.edges().unwrap_or(&[]),
            current: 0,
            slot: parent.child(),
            node: None,
        };
        if !it.edges.is_empty() {
            it.actualize();
        }
        it
    }

    /// Moves the cursor as close as possible to the current index and
    /// returns the raw slot contents for use as the CAS expected value.
    fn actualize(&mut self) -> *mut Node {
        // Other workers may spawn between the slot and its target while we
        // are not looking, so this has to loop.
        let mut raw = self.slot.load();
        while let Some(node) = unsafe { node_ref(raw) } {
            if (node.index() as usize) < self.current {
                self.slot = node.sibling();
                raw = self.slot.load();
            } else {
                break;
            }
        }
        match unsafe { node_ref(raw) } {
            Some(node) if node.index() as usize == self.current => {
                self.node = Some(node);
                self.slot = node.sibling();
            }
            _ => self.node = None,
        }
        raw
    }

    /// Repositions the iterator at `index` (forward only).
    pub fn seek(&mut self, index: u16) {
        debug_assert!(index as usize >= self.current);
        self.current = index as usize;
        self.actualize();
    }

    pub fn current_index(&self) -> u16 {
        self.current as u16
    }

    /// Returns the node at the current index, spawning one with the
    /// lock-free insertion protocol if it does not exist yet. Losing the
    /// race releases the local allocation cleanly and returns the winner.
    pub fn get_or_spawn_node(&mut self) -> &'a Node {
        if let Some(node) = self.node {
            return node;
        }

        // Likely inserting: prepare the node up front.
        let fresh = AtomicUniquePtr::new(Box::new(Node::new(
            self.edges[self.current].clone(),
            self.current as u16,
        )));
        loop {
            let expected = self.actualize();
            if let Some(node) = self.node {
                // Another worker spawned it; `fresh` frees itself on drop.
                return node;
            }

            // Splice between the cursor slot and the expected successor:
            // point the fresh node's sibling at the successor, then CAS the
            // slot from the successor to the fresh node.
            let fresh_ref = unsafe { node_ref(fresh.load()).unwrap() };
            fresh_ref.sibling().set_raw(expected);
            if self.slot.compare_exchange(expected, &fresh) {
                break;
            }
            // Lost a race; drop the aliased successor pointer before
            // retrying so the local allocation cannot double-free it.
            fresh_ref.sibling().release();
        }
        self.actualize();
        self.node.expect("spawned node is reachable")
    }
}

impl<'a> Iterator for EdgeIterator<'a> {
    type Item = EdgeAndNode<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.edges.len() {
            return None;
        }
        let item = EdgeAndNode {
            index: self.current as u16,
            edge: &self.edges[self.current],
            node: self.node,
        };
        self.current += 1;
        if self.current < self.edges.len() {
            self.actualize();
        }
        Some(item)
    }
}

/// Iterates child nodes with `n > 0`. Sorted edges guarantee that once a
/// child with neither visits nor in-flight visits appears, everything
/// after it is unvisited too, so the iterator halts there.
pub struct VisitedNodeIter<'a> {
    node: Option<&'a Node>,
}

impl<'a> VisitedNodeIter<'a> {
    pub fn new(parent: &'a LowNode) -> Self {
        VisitedNodeIter {
            node: Self::skip_unvisited(parent.child().get()),
        }
    }

    fn skip_unvisited(mut node: Option<&'a Node>) -> Option<&'a Node> {
        while let Some(n) = node {
            if n.n() > 0 {
                return Some(n);
            }
            if n.n_in_flight() == 0 {
                // Sorted edges: the rest of the chain is unvisited too.
                return None;
            }
            node = n.sibling().get();
        }
        None
    }
}

impl<'a> Iterator for VisitedNodeIter<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.node?;
        self.node = Self::skip_unvisited(current.sibling().get());
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chess::Move;

    fn edges_for(count: u16) -> Box<[Edge]> {
        let moves: Vec<Move> = (0..count).map(|i| Move::from_raw(i + 1)).collect();
        Edge::from_move_list(&moves)
    }

    fn evaluated_low(count: u16, q: f32) -> LowNode {
        let low = LowNode::new_shell(0xfeed);
        let edges = edges_for(count);
        for (i, e) in edges.iter().enumerate() {
            e.set_p(1.0 / (i + 2) as f32);
        }
        let mut sortable: Vec<Edge> = edges.to_vec();
        Edge::sort_edges(&mut sortable);
        let eval = NNEval {
            q,
            d: 0.1,
            m: 12.0,
            e: 0.0,
            edges: sortable.into_boxed_slice(),
        };
        low.set_nn_eval(&eval);
        low
    }

    #[test]
    fn atomic_unique_ptr_owns_and_swaps() {
        let slot: AtomicUniquePtr<u32> = AtomicUniquePtr::null();
        assert!(slot.is_null());
        slot.store(Box::new(7));
        assert_eq!(slot.get().copied(), Some(7));
        let taken = slot.take().unwrap();
        assert_eq!(*taken, 7);
        assert!(slot.is_null());
    }

    #[test]
    fn atomic_unique_ptr_compare_exchange_moves_ownership() {
        let slot: AtomicUniquePtr<u32> = AtomicUniquePtr::null();
        let source = AtomicUniquePtr::new(Box::new(3));
        assert!(slot.compare_exchange(ptr::null_mut(), &source));
        assert!(source.is_null());
        assert_eq!(slot.get().copied(), Some(3));

        let source2 = AtomicUniquePtr::new(Box::new(4));
        assert!(!slot.compare_exchange(ptr::null_mut(), &source2));
        assert!(!source2.is_null());
    }

    #[test]
    fn edge_sort_is_descending_and_stable() {
        let moves: Vec<Move> = (0..4).map(|i| Move::from_raw(i + 10)).collect();
        let mut edges: Vec<Edge> = Edge::from_move_list(&moves).to_vec();
        edges[0].set_p(0.1);
        edges[1].set_p(0.6);
        edges[2].set_p(0.1);
        edges[3].set_p(0.2);
        Edge::sort_edges(&mut edges);
        assert_eq!(edges[0].get_move(), Move::from_raw(11));
        assert_eq!(edges[1].get_move(), Move::from_raw(13));
        // Equal policies keep move order.
        assert_eq!(edges[2].get_move(), Move::from_raw(10));
        assert_eq!(edges[3].get_move(), Move::from_raw(12));
    }

    #[test]
    fn set_nn_eval_seeds_accumulators() {
        let low = evaluated_low(3, 0.25);
        assert!(low.is_evaluated());
        assert_eq!(low.n(), 0);
        assert!((low.wl() - 0.25).abs() < 1e-6);
        assert!((low.v() - 0.25).abs() < 1e-6);
        assert!((low.vs() - 0.0625).abs() < 1e-6);
        assert_eq!(low.num_edges(), 3);
    }

    #[test]
    fn low_node_first_finalize_absorbs_seed() {
        let low = evaluated_low(3, 0.5);
        low.finalize_score_update(0.5, 0.1, 12.0, 0.25, 1, 1.0);
        assert_eq!(low.n(), 1);
        assert!((low.wl() - 0.5).abs() < 1e-6);
        assert!(low.wldm_invariants_hold());

        low.finalize_score_update(-0.5, 0.3, 10.0, 0.25, 1, 1.0);
        assert_eq!(low.n(), 2);
        assert!(low.wl().abs() < 1e-6);
        assert!((low.d() - 0.4).abs() < 1e-6);
    }

    #[test]
    fn node_finalize_is_delta_exact() {
        let node = Node::new(Edge::new(Move::from_raw(5)), 0);
        assert!(node.try_start_score_update());
        node.increment_n_in_flight(2);
        let before = (node.wl(), node.d(), node.m(), node.vs(), node.weight());
        node.finalize_score_update(0.5, 0.25, 7.0, 0.25, 3, 2.5);
        assert_eq!(node.n(), 3);
        assert_eq!(node.n_in_flight(), 0);
        assert!((node.wl() - before.0 - 1.5).abs() < 1e-9);
        assert!((node.d() - before.1 - 0.75).abs() < 1e-9);
        assert!((node.m() - before.2 - 21.0).abs() < 1e-9);
        assert!((node.vs() - before.3 - 0.75).abs() < 1e-9);
        assert!((node.weight() - before.4 - 2.5).abs() < 1e-9);
    }

    #[test]
    fn fresh_node_admits_single_in_flight_visit() {
        let node = Node::new(Edge::new(Move::from_raw(5)), 0);
        assert!(node.try_start_score_update());
        assert!(!node.try_start_score_update());
        node.cancel_score_update(1);
        assert_eq!(node.n_in_flight(), 0);
        assert!(node.try_start_score_update());
        node.finalize_score_update(1.0, 0.0, 0.0, 1.0, 1, 1.0);
        // Visited nodes admit parallel visits.
        assert!(node.try_start_score_update());
        assert!(node.try_start_score_update());
        node.cancel_score_update(2);
    }

    #[test]
    fn make_terminal_sets_deterministic_values() {
        let node = Node::new(Edge::new(Move::from_raw(5)), 0);
        node.make_terminal(GameResult::WhiteWon, 0.0, Terminal::EndOfGame);
        assert_eq!(node.n(), 1);
        assert!((node.wl() - 1.0).abs() < 1e-9);
        assert_eq!(node.d(), 0.0);
        assert_eq!(node.m(), 0.0);
        assert_eq!(node.bounds(), (GameResult::WhiteWon, GameResult::WhiteWon));
        assert_eq!(node.terminal_result(), Some(GameResult::WhiteWon));
    }

    #[test]
    fn transposition_bit_is_monotone() {
        let low = Arc::new(LowNode::new_shell(1));
        let a = Node::new(Edge::new(Move::from_raw(1)), 0);
        let b = Node::new(Edge::new(Move::from_raw(2)), 1);
        a.set_low_node(low.clone());
        assert!(!low.is_transposition());
        b.set_low_node(low.clone());
        assert!(low.is_transposition());
        b.unset_low_node();
        assert_eq!(low.num_parents(), 1);
        assert!(low.is_transposition());
    }

    #[test]
    fn spawn_keeps_sibling_order() {
        let low = evaluated_low(8, 0.0);
        for index in [3u16, 0, 5, 1] {
            let mut it = low.edge_iter();
            it.seek(index);
            it.get_or_spawn_node();
        }
        let mut seen = Vec::new();
        let mut child = low.child().get();
        while let Some(node) = child {
            seen.push(node.index());
            child = node.sibling().get();
        }
        assert_eq!(seen, vec![0, 1, 3, 5]);
    }

    #[test]
    fn spawn_returns_existing_node() {
        let low = evaluated_low(4, 0.0);
        let mut it = low.edge_iter();
        it.seek(2);
        let first = it.get_or_spawn_node() as *const Node;
        let mut it2 = low.edge_iter();
        it2.seek(2);
        let second = it2.get_or_spawn_node() as *const Node;
        assert_eq!(first, second);
    }

    #[test]
    fn edge_iterator_pairs_edges_with_nodes() {
        let low = evaluated_low(4, 0.0);
        let mut it = low.edge_iter();
        it.seek(1);
        it.get_or_spawn_node();
        let pairs: Vec<(u16, bool)> = low.edge_iter().map(|e| (e.index, e.node.is_some())).collect();
        assert_eq!(
            pairs,
            vec![(0, false), (1, true), (2, false), (3, false)]
        );
    }

    #[test]
    fn visited_iter_stops_at_unvisited_suffix() {
        let low = evaluated_low(6, 0.0);
        for index in 0..4u16 {
            let mut it = low.edge_iter();
            it.seek(index);
            let node = it.get_or_spawn_node();
            if index < 2 {
                assert!(node.try_start_score_update());
                node.finalize_score_update(0.0, 0.0, 0.0, 0.0, 1, 1.0);
            }
        }
        // Children 0 and 1 visited; 2 and 3 exist but unvisited.
        let visited: Vec<u16> = low.visited_iter().map(|n| n.index()).collect();
        assert_eq!(visited, vec![0, 1]);
    }

    #[test]
    fn release_children_except_one_rebinds_saved() {
        let low = evaluated_low(5, 0.0);
        let gc = GcQueue::default();
        let saved = {
            let mut it = low.edge_iter();
            it.seek(2);
            it.get_or_spawn_node() as *const Node
        };
        for index in [0u16, 4] {
            let mut it = low.edge_iter();
            it.seek(index);
            it.get_or_spawn_node();
        }
        let kept = low.release_children_except_one(saved, &gc);
        assert!(!kept.is_null());
        let head = low.child().get().unwrap();
        assert_eq!(head.index(), 2);
        assert!(head.sibling().is_null());
    }

    #[test]
    fn update_parent_bounds_on_winning_child() {
        let low = evaluated_low(3, 0.0);
        let mut it = low.edge_iter();
        it.seek(1);
        let child = it.get_or_spawn_node();
        child.make_terminal(GameResult::WhiteWon, 0.0, Terminal::EndOfGame);
        assert!(update_parent_bounds(&low, true));
        assert!(low.is_terminal());
        assert_eq!(low.bounds(), (GameResult::WhiteWon, GameResult::WhiteWon));
        assert!((low.m() - 1.0).abs() < 1e-6);
    }
}
