//! The concurrent rollout engine.
//!
//! Worker threads descend from the current head through
//! node → low node → (selected edge) → node…, incrementing `n_in_flight`
//! as virtual loss on the way down. At a leaf the worker enqueues a batch
//! entry — a cache hit or a position to evaluate — and once the batch
//! returns, walks the path back up converting virtual loss into real
//! visits with `finalize_score_update` on every node and low node.

use parking_lot::Mutex;
use rand::Rng;
use rand_distr::{Distribution, Gamma};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::hint;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::chess::{GameResult, Move, PositionHistory, Rules};
use crate::mcts::node::{update_parent_bounds, LowNode, Node, Terminal};
use crate::mcts::params::{ContemptMode, FpuStrategy, ScoreType, SearchParams};
use crate::mcts::tree::NodeTree;
use crate::neural::cache::{CachingComputation, NNCache};
use crate::neural::network::{EvalError, NetworkComputation};

/// Produces one network computation per batch.
pub type ComputationFactory = dyn Fn() -> Box<dyn NetworkComputation> + Send + Sync;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// Counters collected while searching.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SearchStats {
    pub rollouts: u64,
    pub batches: u64,
    pub nn_evals: u64,
    pub cache_hits: u64,
    pub tt_hits: u64,
    pub collisions: u64,
    pub terminal_visits: u64,
    pub out_of_order_evals: u64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Default)]
struct Counters {
    rollouts: AtomicU64,
    batches: AtomicU64,
    nn_evals: AtomicU64,
    cache_hits: AtomicU64,
    tt_hits: AtomicU64,
    collisions: AtomicU64,
    terminal_visits: AtomicU64,
    out_of_order_evals: AtomicU64,
}

impl Counters {
    fn snapshot(&self, elapsed: Duration) -> SearchStats {
        SearchStats {
            rollouts: self.rollouts.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            nn_evals: self.nn_evals.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            tt_hits: self.tt_hits.load(Ordering::Relaxed),
            collisions: self.collisions.load(Ordering::Relaxed),
            terminal_visits: self.terminal_visits.load(Ordering::Relaxed),
            out_of_order_evals: self.out_of_order_evals.load(Ordering::Relaxed),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

/// One ranked move at the root.
#[derive(Debug, Clone, Serialize)]
pub struct PvInfo {
    pub mv: String,
    pub n: u32,
    pub q: f64,
    pub d: f64,
    pub m: f64,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub best_move: Option<String>,
    pub infos: Vec<PvInfo>,
    pub stats: SearchStats,
}

enum RolloutOutcome<'a> {
    /// Position enqueued for the batched evaluation.
    Enqueued {
        path: Vec<&'a Node>,
        batch_idx: usize,
        low: Arc<LowNode>,
    },
    /// Backed up immediately (cache hit, transposition hit or terminal).
    Completed,
    /// Too many parallel descents landed on an in-flight node.
    Collision { path: Vec<&'a Node>, multivisit: u32 },
    /// Nothing useful to do right now.
    Blocked,
}

/// A search over a node tree: a frozen parameter snapshot, a cancellation
/// flag and the worker pool that drives rollouts until the visit target is
/// reached.
pub struct Search<'a, R: Rules> {
    tree: &'a NodeTree<R>,
    cache: &'a NNCache,
    factory: Arc<ComputationFactory>,
    params: SearchParams,
    target_rollouts: u64,
    stop: AtomicBool,
    counters: Counters,
    correction: Mutex<FxHashMap<u16, f32>>,
    started: Mutex<Option<Instant>>,
}

impl<'a, R: Rules> Search<'a, R> {
    pub fn new(
        tree: &'a NodeTree<R>,
        cache: &'a NNCache,
        factory: Arc<ComputationFactory>,
        params: SearchParams,
        target_rollouts: u64,
    ) -> Self {
        Search {
            tree,
            cache,
            factory,
            params,
            target_rollouts,
            stop: AtomicBool::new(false),
            counters: Counters::default(),
            correction: Mutex::new(FxHashMap::default()),
            started: Mutex::new(None),
        }
    }

    pub fn params(&self) -> &SearchParams {
        &self.params
    }

    /// Cooperative cancellation, polled at batch boundaries and inside the
    /// select loops.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
            || self.counters.rollouts.load(Ordering::Relaxed) >= self.target_rollouts
    }

    /// Runs the search with `num_workers` search workers and returns the
    /// ranked move list. Task workers are folded into the search workers;
    /// the minimum-work thresholds decide when a worker processes a
    /// partial batch instead of idling.
    pub fn run(&self, num_workers: usize) -> Result<SearchResult, SearchError> {
        let start = Instant::now();
        *self.started.lock() = Some(start);

        let head = self.tree.current_head();
        if self
            .tree
            .rules()
            .game_result(self.tree.history().last())
            .is_some()
        {
            // Nothing to search.
            return Ok(SearchResult {
                best_move: None,
                infos: Vec::new(),
                stats: self.counters.snapshot(start.elapsed()),
            });
        }

        if let Some(mv) = self.syzygy_fast_play() {
            let info = PvInfo {
                mv: mv.to_string(),
                n: 0,
                q: 1.0,
                d: 0.0,
                m: 0.0,
                score: self.convert_score(1.0, 0.0),
            };
            return Ok(SearchResult {
                best_move: Some(mv.to_string()),
                infos: vec![info],
                stats: self.counters.snapshot(start.elapsed()),
            });
        }

        // Evaluate the root synchronously so noise and boosting have edges
        // to work with before the workers start.
        if !head.low_node().map_or(false, |l| l.is_evaluated()) {
            self.gather_and_process_batch()?;
        }
        self.shape_root_policy();

        let workers = num_workers.max(1);
        log::debug!(
            "starting search: {} workers ({} task workers each folded in), target {} rollouts",
            workers,
            self.params.task_workers_per_search_worker(),
            self.target_rollouts
        );

        let error: Mutex<Option<SearchError>> = Mutex::new(None);
        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    if let Err(e) = self.worker_loop() {
                        self.stop();
                        let mut slot = error.lock();
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                    }
                });
            }
        });
        if let Some(e) = error.into_inner() {
            return Err(e);
        }

        self.tree.tt_maintenance();
        self.tree.non_tt_maintenance();

        let stats = self.counters.snapshot(start.elapsed());
        if self.params.log_live_stats() || self.params.verbose_stats() {
            log::info!(
                "search done: {} rollouts in {} batches, {} nn evals, {} cache hits",
                stats.rollouts,
                stats.batches,
                stats.nn_evals,
                stats.cache_hits
            );
        }

        let infos = self.best_move_infos();
        if self.params.verbose_stats() {
            for info in &infos {
                log::info!(
                    "{}: n {} q {:.4} d {:.3} m {:.1} score {:.1}",
                    info.mv,
                    info.n,
                    info.q,
                    info.d,
                    info.m,
                    info.score
                );
            }
        }
        let best_move = self.pick_move_with_temperature(&infos);
        Ok(SearchResult {
            best_move,
            infos,
            stats,
        })
    }

    fn worker_loop(&self) -> Result<(), SearchError> {
        let mut idle_spins = 0u32;
        while !self.stopped() {
            let did_work = self.gather_and_process_batch()?;
            if did_work {
                idle_spins = 0;
            } else {
                self.backoff(&mut idle_spins);
            }
            self.tree.tt_gc_some(4);
            self.throttle_nps();
        }
        Ok(())
    }

    fn backoff(&self, idle_spins: &mut u32) {
        if self.params.search_spin_backoff() {
            let spins = 1u32 << (*idle_spins).min(10);
            for _ in 0..spins {
                hint::spin_loop();
            }
            *idle_spins += 1;
        } else {
            thread::yield_now();
        }
    }

    fn throttle_nps(&self) {
        let limit = self.params.nps_limit();
        if limit <= 0.0 {
            return;
        }
        let start = match *self.started.lock() {
            Some(s) => s,
            None => return,
        };
        let rollouts = self.counters.rollouts.load(Ordering::Relaxed) as f64;
        let budget = Duration::from_secs_f64(rollouts / limit);
        let elapsed = start.elapsed();
        if budget > elapsed {
            thread::sleep((budget - elapsed).min(Duration::from_millis(50)));
        }
    }

    /// Collects one minibatch of rollouts, runs the evaluator once and
    /// backs everything up. Returns false when no work was possible.
    fn gather_and_process_batch(&self) -> Result<bool, SearchError> {
        let mut computation = CachingComputation::new(
            (self.factory)(),
            self.params.history_fill(),
            Arc::clone(self.tree.rules()),
            self.cache,
        );
        let minibatch = self.params.minibatch_size() as usize;
        computation.reserve(minibatch);

        let mut pending: Vec<(Vec<&Node>, usize, Arc<LowNode>)> = Vec::new();
        let mut collisions: Vec<(Vec<&Node>, u32)> = Vec::new();
        let mut collision_events = 0u32;
        let mut ooo_budget = self.params.max_out_of_order_evals();
        let mut completed = 0usize;

        while pending.len() + completed < minibatch && !self.stopped() {
            match self.try_rollout(&mut computation, &mut ooo_budget)? {
                RolloutOutcome::Enqueued {
                    path,
                    batch_idx,
                    low,
                } => pending.push((path, batch_idx, low)),
                RolloutOutcome::Completed => completed += 1,
                RolloutOutcome::Collision { path, multivisit } => {
                    collision_events += 1;
                    self.counters
                        .collisions
                        .fetch_add(multivisit as u64, Ordering::Relaxed);
                    collisions.push((path, multivisit));
                    if collision_events >= self.params.max_collision_events() {
                        break;
                    }
                }
                RolloutOutcome::Blocked => break,
            }
        }

        let gathered = pending.len() + completed + collisions.len();
        if gathered == 0 {
            return Ok(false);
        }
        if pending.len() < self.params.minimum_work_size_for_processing() as usize {
            log::trace!("processing partial batch of {}", pending.len());
        }

        let outcome = computation.compute_blocking(self.params.policy_softmax_temp());
        if let Err(e) = outcome {
            // Reverse every virtual loss before unwinding.
            for (path, _, _) in &pending {
                for node in path {
                    node.cancel_score_update(1);
                }
            }
            for (path, multivisit) in &collisions {
                for node in path {
                    node.cancel_score_update(*multivisit);
                }
            }
            return Err(e.into());
        }

        self.counters
            .nn_evals
            .fetch_add(computation.cache_misses() as u64, Ordering::Relaxed);

        for (path, batch_idx, low) in pending {
            let eval = computation.eval_of(batch_idx);
            if !low.is_evaluated() {
                low.set_nn_eval(&eval);
            }
            self.backup_eval(&path, &low);
        }
        for (path, multivisit) in collisions {
            for node in path {
                node.cancel_score_update(multivisit);
            }
        }

        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        if self.params.log_live_stats() {
            log::debug!(
                "batch done: {} rollouts total",
                self.counters.rollouts.load(Ordering::Relaxed)
            );
        }
        Ok(true)
    }

    /// One descent from the head. Either enqueues an evaluation, finishes
    /// the visit immediately, or reports a collision.
    fn try_rollout(
        &self,
        computation: &mut CachingComputation<'_, R>,
        ooo_budget: &mut u32,
    ) -> Result<RolloutOutcome<'a>, SearchError> {
        let head: &'a Node = self.tree.current_head();
        let mut history = self.tree.history().clone();

        if head.is_terminal() {
            return Ok(RolloutOutcome::Blocked);
        }
        if !head.try_start_score_update() {
            return Ok(RolloutOutcome::Blocked);
        }

        let mut path: Vec<&'a Node> = vec![head];
        let mut is_root = true;
        loop {
            let node = *path.last().expect("path is never empty");

            if node.is_terminal() {
                if is_root {
                    head.cancel_score_update(1);
                    return Ok(RolloutOutcome::Blocked);
                }
                return Ok(self.complete_terminal_revisit(path));
            }

            let low = match node.low_node() {
                Some(low) => low,
                None => {
                    // Only repetition draws stay unbound, and those are
                    // terminal; anything else is a programming error.
                    unreachable!("non-terminal path node without a low node")
                }
            };

            if low.is_terminal() && !node.is_terminal() {
                // Adopt a terminal discovered through another path.
                let result = low.bounds().0.invert();
                node.set_bounds(result, result);
                node.set_terminal_type(low.terminal_type());
                return Ok(self.complete_terminal_revisit(path));
            }

            if !low.is_evaluated() {
                return self.handle_leaf(path, low, history, computation, ooo_budget);
            }

            let best_index = match self.pick_child(node, &low, is_root) {
                Some(index) => index,
                None => {
                    log::warn!("evaluated low node without edges on the search path");
                    for n in &path {
                        n.cancel_score_update(1);
                    }
                    return Ok(RolloutOutcome::Blocked);
                }
            };

            let child: &'a Node = {
                let mut it = low.edge_iter();
                it.seek(best_index);
                let spawned = it.get_or_spawn_node() as *const Node;
                // The node lives in the chain owned by the low node, which
                // the TT keeps alive for the duration of the search.
                unsafe { &*spawned }
            };

            let mv = child.get_move();
            let next = self.tree.rules().apply_move(history.last(), mv);
            let hash = self.tree.rules().hash(&next);
            history.push(next, hash);

            if !child.has_low_node() && !child.is_terminal() {
                let repetitions = history.repetitions();
                let draw_by_repetition = repetitions >= 2
                    || (repetitions >= 1 && (self.params.two_fold_draws() || child.is_repetition()));
                if repetitions >= 1 {
                    child.set_repetition();
                }
                if draw_by_repetition {
                    if !child.try_start_score_update() {
                        return Ok(self.collide(path, child));
                    }
                    path.push(child);
                    child.set_bounds(GameResult::Draw, GameResult::Draw);
                    child.set_terminal_type(Terminal::EndOfGame);
                    self.backup(&path, 0.0, 1.0, 1.0, 0.0, 1, 1.0);
                    self.propagate_bounds(&path);
                    self.counters.terminal_visits.fetch_add(1, Ordering::Relaxed);
                    return Ok(RolloutOutcome::Completed);
                }
                let hash = self.tree.history_hash_of(&history);
                let (child_low, _) = self.tree.tt_get_or_create(hash);
                child.set_low_node(child_low);
            }

            if !child.try_start_score_update() {
                return Ok(self.collide(path, child));
            }
            path.push(child);
            is_root = false;
        }
    }

    /// Collision bookkeeping: amplify the virtual loss along the path so
    /// other workers steer away, and remember how much to cancel after the
    /// batch.
    fn collide(&self, mut path: Vec<&'a Node>, child: &'a Node) -> RolloutOutcome<'a> {
        let multivisit = self.collision_multivisit();
        child.increment_n_in_flight(multivisit);
        for node in &path {
            node.increment_n_in_flight(multivisit - 1);
        }
        path.push(child);
        RolloutOutcome::Collision { path, multivisit }
    }

    /// Collision visits allowed right now: scaled from 1 to the cap over
    /// the configured total-visit range.
    fn collision_multivisit(&self) -> u32 {
        let cap = self.params.max_collision_visits();
        if cap <= 1 {
            return 1;
        }
        let total = self.tree.current_head().n() as f32;
        let start = self.params.max_collision_visits_scaling_start() as f32;
        let end = self.params.max_collision_visits_scaling_end() as f32;
        if end <= start {
            return cap;
        }
        let t = ((total - start) / (end - start)).clamp(0.0, 1.0);
        let scaled = 1.0 + (cap - 1) as f32 * t.powf(self.params.max_collision_visits_scaling_power());
        scaled as u32
    }

    /// Revisit of a known-terminal leaf: a multivisit of its stored values
    /// without re-entering the evaluator.
    fn complete_terminal_revisit(&self, path: Vec<&'a Node>) -> RolloutOutcome<'a> {
        let node = *path.last().expect("path is never empty");
        let remaining = self
            .target_rollouts
            .saturating_sub(self.counters.rollouts.load(Ordering::Relaxed))
            .clamp(1, u32::MAX as u64) as u32;
        let multivisit = self.collision_multivisit().min(remaining);

        let (v, d, m) = if node.n() > 0 {
            let n = node.n() as f64;
            (node.wl() / n, node.d() / n, node.m() / n)
        } else {
            let result = node.bounds().0;
            (
                result.wl() as f64,
                if result == GameResult::Draw { 1.0 } else { 0.0 },
                node.low_node()
                    .filter(|l| l.n() > 0)
                    .map_or(1.0, |l| l.m() / l.n() as f64 + 1.0),
            )
        };

        for n in &path {
            n.increment_n_in_flight(multivisit - 1);
        }
        if let Some(low) = node.low_node() {
            if low.is_terminal() {
                self.update_correction_history(&low);
                low.finalize_score_update(-v, d, m - 1.0, v * v, multivisit, multivisit as f64);
            }
        }
        self.backup(&path, v, d, m, v * v, multivisit, multivisit as f64);
        self.propagate_bounds(&path);
        self.counters
            .terminal_visits
            .fetch_add(multivisit as u64, Ordering::Relaxed);
        RolloutOutcome::Completed
    }

    /// A fresh leaf: decide it by rule or tablebase, serve it from the TT
    /// or cache, or enqueue it for the evaluator.
    fn handle_leaf(
        &self,
        path: Vec<&'a Node>,
        low: Arc<LowNode>,
        history: PositionHistory<R::Position>,
        computation: &mut CachingComputation<'_, R>,
        ooo_budget: &mut u32,
    ) -> Result<RolloutOutcome<'a>, SearchError> {
        let node = *path.last().expect("path is never empty");
        let position = history.last();
        let rules = self.tree.rules();

        // Decided by rule: deterministic values, no evaluator involved.
        if let Some(result) = rules.game_result(position) {
            low.make_terminal(result, 0.0, Terminal::EndOfGame);
            self.update_correction_history(&low);
            let node_result = result.invert();
            node.set_bounds(node_result, node_result);
            node.set_terminal_type(Terminal::EndOfGame);
            let v = node_result.wl() as f64;
            let d = if result == GameResult::Draw { 1.0 } else { 0.0 };
            self.backup(&path, v, d, 1.0, v * v, 1, 1.0);
            self.propagate_bounds(&path);
            self.counters.terminal_visits.fetch_add(1, Ordering::Relaxed);
            return Ok(RolloutOutcome::Completed);
        }
        if let Some((result, plies)) = rules.probe_tablebase(position) {
            low.make_terminal(result, plies, Terminal::Tablebase);
            self.update_correction_history(&low);
            let node_result = result.invert();
            node.set_bounds(node_result, node_result);
            node.set_terminal_type(Terminal::Tablebase);
            let v = node_result.wl() as f64;
            let d = if result == GameResult::Draw { 1.0 } else { 0.0 };
            self.backup(&path, v, d, plies as f64 + 1.0, v * v, 1, 1.0);
            self.propagate_bounds(&path);
            self.counters.terminal_visits.fetch_add(1, Ordering::Relaxed);
            return Ok(RolloutOutcome::Completed);
        }

        // Shared low node already evaluated through another path.
        if low.is_evaluated() {
            self.counters.tt_hits.fetch_add(1, Ordering::Relaxed);
            self.backup_eval(&path, &low);
            return Ok(RolloutOutcome::Completed);
        }

        let hash = low.hash();
        let before = computation.batch_size();
        computation.add_input(hash, &history);
        let is_hit = computation.is_cache_hit(before);
        if is_hit {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            if self.params.out_of_order_eval() && *ooo_budget > 0 {
                *ooo_budget -= 1;
                self.counters
                    .out_of_order_evals
                    .fetch_add(1, Ordering::Relaxed);
                let eval = computation.eval_of(before);
                computation.pop_cache_hit();
                if !low.is_evaluated() {
                    low.set_nn_eval(&eval);
                }
                self.backup_eval(&path, &low);
                return Ok(RolloutOutcome::Completed);
            }
        }
        Ok(RolloutOutcome::Enqueued {
            path,
            batch_idx: before,
            low,
        })
    }

    /// Backs up a leaf whose low node carries an evaluation: the low node
    /// absorbs the visit first, then the path converts its virtual losses,
    /// flipping perspective and counting one more ply per level.
    fn backup_eval(&self, path: &[&Node], low: &LowNode) {
        let n = low.n();
        let (mut v, d, m) = if n > 0 {
            let n = n as f64;
            (low.wl() / n, low.d() / n, low.m() / n)
        } else {
            (low.v() as f64, low.d(), low.m())
        };

        if n == 0 {
            // First ingestion of this eval: contempt rescale plus the
            // correction-history adjustment.
            let black = self
                .tree
                .rules()
                .is_black_to_move(self.tree.history().last());
            let leaf_black = black ^ (path.len() % 2 == 0);
            let (rv, _rd) = self.wdl_rescale(v, d, leaf_black);
            v = rv;
            v = self.apply_correction(low, v);
        }

        let vs = v * v;
        let weight = self.visit_weight(low);
        low.finalize_score_update(v, d, m, vs, 1, weight);
        self.backup(path, -v, d, m + 1.0, vs, 1, weight);
        self.propagate_bounds(path);
    }

    /// Converts virtual losses into visits along `path`, leaf first. The
    /// leaf node and the low node above it share a perspective, so the
    /// sign flips between a node and its own low node.
    fn backup(
        &self,
        path: &[&Node],
        mut v: f64,
        d: f64,
        mut m: f64,
        vs: f64,
        multivisit: u32,
        weight: f64,
    ) {
        for i in (0..path.len()).rev() {
            path[i].finalize_score_update(v, d, m, vs, multivisit, weight);
            if i > 0 {
                if let Some(parent_low) = path[i - 1].low_node() {
                    parent_low.finalize_score_update(v, d, m, vs, multivisit, weight);
                }
                v = -v;
                m += 1.0;
            }
        }
        self.counters
            .rollouts
            .fetch_add(multivisit as u64, Ordering::Relaxed);
        if self.counters.rollouts.load(Ordering::Relaxed) >= self.target_rollouts {
            self.stop.store(true, Ordering::Release);
        }
    }

    /// Walks the path's low nodes bottom-up re-deriving provable bounds;
    /// stops at the first level that did not change.
    fn propagate_bounds(&self, path: &[&Node]) {
        let sticky = self.params.sticky_endgames();
        for i in (0..path.len().saturating_sub(1)).rev() {
            if let Some(low) = path[i].low_node() {
                if !update_parent_bounds(&low, sticky) {
                    break;
                }
            } else {
                break;
            }
        }
    }

    /// PUCT pick over the low node's edges. Returns the chosen edge index.
    fn pick_child(&self, node: &Node, low: &LowNode, is_root: bool) -> Option<u16> {
        if low.num_edges() == 0 {
            return None;
        }
        let params = &self.params;
        let draw_score = params.draw_score() as f64;

        let parent_started = node.n_started().max(1);
        let mut cpuct = {
            let base = params.cpuct_base(is_root);
            let growth = ((parent_started as f32 + base) / base)
                .powf(params.cpuct_exponent(is_root))
                .ln();
            params.cpuct(is_root) + params.cpuct_factor(is_root) * growth
        };
        let mut fpu_value = params.fpu_value(is_root);

        if params.use_cpuct_uncertainty() {
            let factor = self.uncertainty_factor(low.e());
            if params.just_fpu_uncertainty() {
                fpu_value *= factor;
            } else {
                cpuct *= factor;
            }
        }

        let parent_q = if low.n() > 0 {
            (low.wl() + draw_score * low.d()) / low.n() as f64
        } else {
            low.v() as f64
        };
        let fpu = match params.fpu_strategy(is_root) {
            FpuStrategy::Absolute => fpu_value as f64,
            FpuStrategy::Relative => {
                parent_q - fpu_value as f64 * (node.visited_policy() as f64).sqrt()
            }
        };

        let (desperate, prior_weight) = if params.use_desperation()
            && parent_q >= params.desperation_low() as f64
            && parent_q <= params.desperation_high() as f64
        {
            (true, params.desperation_prior_weight() as f64)
        } else {
            (false, 0.0)
        };

        let u_numerator = cpuct as f64 * (parent_started as f64).sqrt();
        let uniform = 1.0 / low.num_edges() as f64;

        let mut best: Option<(u16, f64)> = None;
        for item in low.edge_iter() {
            let q = match item.node {
                Some(child) if child.n() > 0 => child.q(draw_score),
                _ => fpu,
            };
            let mut p = item.p() as f64;
            if desperate {
                p = (1.0 - prior_weight) * p + prior_weight * uniform;
            }
            let mut u = u_numerator * p / (1.0 + item.n_started() as f64);
            if desperate {
                u *= params.desperation_multiplier() as f64;
            }
            let score = q + u;
            if best.map_or(true, |(_, b)| score > b) {
                best = Some((item.index, score));
            }
        }
        best.map(|(index, _)| index)
    }

    /// Interpolates the cpuct factor across the configured uncertainty
    /// band of the `e` head.
    fn uncertainty_factor(&self, e: f32) -> f32 {
        let params = &self.params;
        let lo = params.cpuct_uncertainty_min_uncertainty();
        let hi = params.cpuct_uncertainty_max_uncertainty();
        if hi <= lo {
            return params.cpuct_uncertainty_max_factor();
        }
        let t = ((e - lo) / (hi - lo)).clamp(0.0, 1.0);
        params.cpuct_uncertainty_min_factor()
            + t * (params.cpuct_uncertainty_max_factor() - params.cpuct_uncertainty_min_factor())
    }

    /// Weight of one visit under uncertainty weighting. Visit variance
    /// widens the effective uncertainty when variance scaling is on.
    fn visit_weight(&self, low: &LowNode) -> f64 {
        let params = &self.params;
        if !params.use_uncertainty_weighting() {
            return 1.0;
        }
        let mut uncertainty = low.e();
        if params.use_variance_scaling() && low.n() > 1 {
            let n = low.n() as f64;
            let mean = low.wl() / n;
            let variance = (low.vs() / n - mean * mean).max(0.0);
            uncertainty = uncertainty.max(variance.sqrt() as f32);
        }
        let lo = params.cpuct_uncertainty_min_uncertainty();
        let hi = params.cpuct_uncertainty_max_uncertainty();
        let clamped = uncertainty.clamp(lo.min(hi), hi.max(lo)).max(1e-4);
        let weight = params.uncertainty_weighting_coefficient()
            * clamped.powf(params.uncertainty_weighting_exponent());
        weight.min(params.uncertainty_weighting_cap()).max(0.0) as f64
    }

    /// Contempt-style rescale of (wl, d) in s-space, applied when an eval
    /// is first ingested.
    fn wdl_rescale(&self, wl: f64, d: f64, leaf_black_to_move: bool) -> (f64, f64) {
        let params = &self.params;
        let ratio = params.wdl_rescale_ratio() as f64;
        let diff = params.wdl_rescale_diff() as f64 * (1.0 - params.wdl_eval_objectivity() as f64);
        if (ratio - 1.0).abs() < 1e-9 && diff.abs() < 1e-9 {
            return (wl, d);
        }
        let sign = match params.contempt_mode() {
            ContemptMode::None => return (wl, d),
            ContemptMode::Play => {
                if leaf_black_to_move == self.tree.is_black_to_move() {
                    1.0
                } else {
                    -1.0
                }
            }
            ContemptMode::White => {
                if leaf_black_to_move {
                    -1.0
                } else {
                    1.0
                }
            }
            ContemptMode::Black => {
                if leaf_black_to_move {
                    1.0
                } else {
                    -1.0
                }
            }
        };

        let w = ((1.0 - d + wl) / 2.0).clamp(1e-6, 1.0 - 1e-6);
        let l = ((1.0 - d - wl) / 2.0).clamp(1e-6, 1.0 - 1e-6);
        let a = ((1.0 - l) / l).ln();
        let b = ((1.0 - w) / w).ln();
        // d == 0 makes a and b cancel exactly; the s-space transform is
        // undefined there, so leave such leaves unrescaled.
        let denom = a + b;
        if denom.abs() < 1e-9 {
            return (wl, d);
        }
        let s = 2.0 / denom;
        let mu = (a - b) / denom;
        let s_new = (s * ratio).min(params.wdl_max_s() as f64);
        let mu_new = mu + sign * s * s * diff;
        let a_new = (1.0 + mu_new) / s_new;
        let b_new = (1.0 - mu_new) / s_new;
        let w_new = 1.0 / (1.0 + b_new.exp());
        let l_new = 1.0 / (1.0 + a_new.exp());
        ((w_new - l_new).clamp(-1.0, 1.0), (1.0 - w_new - l_new).clamp(0.0, 1.0))
    }

    fn correction_bucket(low: &LowNode) -> u16 {
        (low.hash() & 0xffff) as u16
    }

    /// Blends the remembered per-bucket eval error into a leaf value.
    fn apply_correction(&self, low: &LowNode, v: f64) -> f64 {
        if !self.params.use_correction_history() {
            return v;
        }
        let correction = self
            .correction
            .lock()
            .get(&Self::correction_bucket(low))
            .copied()
            .unwrap_or(0.0);
        (v + self.params.correction_history_lambda() as f64 * correction as f64).clamp(-1.0, 1.0)
    }

    /// Updates the per-bucket eval-error average when a position resolves
    /// terminally.
    fn update_correction_history(&self, low: &LowNode) {
        if !self.params.use_correction_history() || !low.is_evaluated() {
            return;
        }
        let result = low.bounds().0;
        let error = result.wl() - low.v();
        let alpha = self.params.correction_history_alpha();
        let mut table = self.correction.lock();
        let entry = table.entry(Self::correction_bucket(low)).or_insert(0.0);
        *entry = (1.0 - alpha) * *entry + alpha * error;
    }

    /// Applies Dirichlet noise and top-policy boosting to the root on an
    /// unshared low node, so the TT entry stays clean.
    fn shape_root_policy(&self) {
        let params = &self.params;
        let eps = params.noise_epsilon();
        if eps <= 0.0 && !params.use_policy_boosting() {
            return;
        }
        let head = self.tree.current_head();
        let low = match head.low_node() {
            Some(low) if low.is_evaluated() => low,
            _ => return,
        };
        let low = if low.is_tt() {
            let clone = self.tree.non_tt_add_clone(&low);
            head.replace_low_node(Arc::clone(&clone));
            clone
        } else {
            low
        };
        let edges = match low.edges() {
            Some(edges) if !edges.is_empty() => edges,
            _ => return,
        };

        // Boost first: the array is still sorted by raw policy, so the
        // prefix is the top of the policy head.
        if params.use_policy_boosting() {
            let tier_one = params.top_policy_num_boost() as usize;
            let tier_two = params.top_policy_tier_two_num_boost() as usize;
            for (i, edge) in edges.iter().enumerate() {
                if i < tier_one {
                    edge.set_p((edge.p() * (1.0 + params.top_policy_boost())).min(1.0));
                } else if i < tier_two {
                    edge.set_p((edge.p() * (1.0 + params.top_policy_tier_two_boost())).min(1.0));
                }
            }
        }

        if eps > 0.0 {
            let gamma = match Gamma::new(params.noise_alpha() as f64, 1.0) {
                Ok(gamma) => gamma,
                Err(_) => return,
            };
            let mut rng = rand::thread_rng();
            let draws: Vec<f64> = edges.iter().map(|_| gamma.sample(&mut rng)).collect();
            let total: f64 = draws.iter().sum();
            if total > 0.0 {
                for (edge, draw) in edges.iter().zip(&draws) {
                    let noise = (draw / total) as f32;
                    edge.set_p(((1.0 - eps) * edge.p() + eps * noise).clamp(0.0, 1.0));
                }
            }
        }

        // Renormalize after both shapers.
        let sum: f32 = edges.iter().map(|e| e.p()).sum();
        if sum > 0.0 {
            for edge in edges {
                edge.set_p(edge.p() / sum);
            }
        }
    }

    /// Root tablebase short-circuit: with fast play enabled and a winning
    /// probe, play the tablebase-best move without searching.
    fn syzygy_fast_play(&self) -> Option<Move> {
        if !self.params.syzygy_fast_play() {
            return None;
        }
        let rules = self.tree.rules();
        let position = self.tree.history().last();
        let (root_result, _) = rules.probe_tablebase(position)?;
        if root_result != GameResult::WhiteWon {
            return None;
        }
        let mut best: Option<(Move, f32)> = None;
        for mv in rules.legal_moves(position) {
            let child = rules.apply_move(position, mv);
            if let Some((result, plies)) = rules.probe_tablebase(&child) {
                // A losing child position is a win for the mover.
                if result == GameResult::BlackWon
                    && best.map_or(true, |(_, best_plies)| plies < best_plies)
                {
                    best = Some((mv, plies));
                }
            }
        }
        best.map(|(mv, _)| mv)
    }

    fn convert_score(&self, q: f64, d: f64) -> f64 {
        match self.params.score_type() {
            ScoreType::Centipawn => 90.0 * (1.5637541897 * q).tan(),
            ScoreType::WinPercentage => 50.0 * (1.0 + q - d / 2.0).min(2.0),
            ScoreType::Q => q,
            ScoreType::WMinusL => q,
        }
    }

    /// Ranked move list at the head: visit count first, value as the tie
    /// break, multi-PV entries.
    pub fn best_move_infos(&self) -> Vec<PvInfo> {
        let head = self.tree.current_head();
        let low = match head.low_node() {
            Some(low) => low,
            None => return Vec::new(),
        };
        let draw_score = self.params.draw_score() as f64;

        let mut infos: Vec<PvInfo> = low
            .visited_iter()
            .map(|child| {
                let n = child.n();
                let q = child.q(draw_score);
                let d = child.d() / n as f64;
                let m = child.m() / n as f64;
                PvInfo {
                    mv: child.get_move().to_string(),
                    n,
                    q,
                    d,
                    m,
                    score: self.convert_score(q, d),
                }
            })
            .collect();
        infos.sort_by(|a, b| {
            b.n.cmp(&a.n)
                .then(b.q.partial_cmp(&a.q).unwrap_or(std::cmp::Ordering::Equal))
        });
        infos.truncate(self.params.multipv() as usize);
        if self.params.per_pv_counters() {
            for (rank, info) in infos.iter_mut().enumerate() {
                log::debug!("pv {} {} n {}", rank + 1, info.mv, info.n);
            }
        }
        infos
    }

    /// Move-selection temperature schedule: below the cutoff move, sample
    /// proportionally to visits^(1/T) among moves close enough to the
    /// best; otherwise play the top visit count.
    fn pick_move_with_temperature(&self, infos: &[PvInfo]) -> Option<String> {
        let first = infos.first()?;
        let params = &self.params;

        let move_number = (self.tree.ply_count() / 2 + 1) as u32;
        let mut temperature = if self.tree.rules().is_endgame(self.tree.history().last())
            && params.temperature_endgame() > 0.0
        {
            params.temperature_endgame()
        } else {
            params.temperature()
        };
        if params.temperature_cutoff_move() > 0 && move_number >= params.temperature_cutoff_move() {
            temperature = 0.0;
        }
        if temperature > 0.0 && params.temp_decay_moves() > 0 {
            let after_delay = move_number.saturating_sub(params.temp_decay_delay_moves());
            let decay = 1.0 - after_delay as f32 / params.temp_decay_moves() as f32;
            temperature *= decay.max(0.0);
        }
        if temperature <= 0.0 {
            return Some(first.mv.clone());
        }

        let best_q = infos
            .iter()
            .map(|i| i.q)
            .fold(f64::NEG_INFINITY, f64::max);
        let q_threshold = best_q - params.temperature_winpct_cutoff() as f64 / 50.0;
        let offset = params.temperature_visit_offset() as f64;
        let weights: Vec<f64> = infos
            .iter()
            .map(|info| {
                if info.q < q_threshold {
                    return 0.0;
                }
                (info.n as f64 + offset).max(0.0).powf(1.0 / temperature as f64)
            })
            .collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return Some(first.mv.clone());
        }
        let mut roll = rand::thread_rng().gen_range(0.0..total);
        for (info, weight) in infos.iter().zip(&weights) {
            if roll < *weight {
                return Some(info.mv.clone());
            }
            roll -= weight;
        }
        Some(first.mv.clone())
    }

    pub fn stats(&self) -> SearchStats {
        let elapsed = (*self.started.lock())
            .map(|s| s.elapsed())
            .unwrap_or_default();
        self.counters.snapshot(elapsed)
    }
}
