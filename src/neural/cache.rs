//! Evaluation cache and the batch collector that folds cache hits and
//! novel positions into a single evaluator request.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;

use crate::chess::{FillEmptyHistory, PositionHistory, Rules, MAX_MOVES};
use crate::mcts::node::Edge;
use crate::neural::network::{EvalError, NNEval, NetworkComputation};

/// A cached evaluation. Immutable once inserted.
#[derive(Debug)]
pub struct CachedNNRequest {
    pub eval: Arc<NNEval>,
}

#[derive(Debug, Default)]
struct CacheInner {
    map: FxHashMap<u64, Arc<CachedNNRequest>>,
    order: VecDeque<u64>,
}

/// Size-bounded position-fingerprint → evaluation cache with FIFO
/// eviction. Entries are pinned by [`NNCacheLock`]s, so a lookup racing
/// with eviction either misses or keeps its entry alive for the duration
/// of consumption.
#[derive(Debug)]
pub struct NNCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl NNCache {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        NNCache {
            capacity,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Pins and returns the entry for `hash` if present.
    pub fn lookup(&self, hash: u64) -> Option<NNCacheLock> {
        let inner = self.inner.lock();
        inner.map.get(&hash).map(|req| NNCacheLock {
            req: Arc::clone(req),
        })
    }

    pub fn contains(&self, hash: u64) -> bool {
        self.inner.lock().map.contains_key(&hash)
    }

    /// Inserts, last-writer-wins: duplicate inserts under one fingerprint
    /// are permitted and leave the cache observationally as if inserted
    /// once.
    pub fn insert(&self, hash: u64, request: CachedNNRequest) {
        let mut inner = self.inner.lock();
        if inner.map.insert(hash, Arc::new(request)).is_none() {
            inner.order.push_back(hash);
            while inner.map.len() > self.capacity {
                if let Some(evicted) = inner.order.pop_front() {
                    inner.map.remove(&evicted);
                } else {
                    break;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.order.clear();
    }
}

/// Scoped pin on a cache entry.
#[derive(Debug, Clone)]
pub struct NNCacheLock {
    req: Arc<CachedNNRequest>,
}

impl NNCacheLock {
    pub fn eval(&self) -> &Arc<NNEval> {
        &self.req.eval
    }
}

impl Deref for NNCacheLock {
    type Target = CachedNNRequest;

    fn deref(&self) -> &Self::Target {
        &self.req
    }
}

#[derive(Debug)]
struct WorkItem {
    hash: u64,
    lock: Option<NNCacheLock>,
    idx_in_parent: Option<usize>,
    edges: Option<Vec<Edge>>,
    done: Option<Arc<NNEval>>,
    transform: u8,
}

/// Wraps a network computation and the cache. Per-query inputs either bind
/// to an existing cache entry (never touching the network) or are encoded
/// and forwarded to the wrapped computation; after the batched call the
/// collector softmaxes policies, sorts edges and fills the cache.
pub struct CachingComputation<'a, R: Rules> {
    parent: Box<dyn NetworkComputation>,
    history_fill: FillEmptyHistory,
    rules: Arc<R>,
    cache: &'a NNCache,
    batch: Vec<WorkItem>,
}

impl<'a, R: Rules> CachingComputation<'a, R> {
    pub fn new(
        parent: Box<dyn NetworkComputation>,
        history_fill: FillEmptyHistory,
        rules: Arc<R>,
        cache: &'a NNCache,
    ) -> Self {
        CachingComputation {
            parent,
            history_fill,
            rules,
            cache,
            batch: Vec::new(),
        }
    }

    /// Avoids repeated reallocation while adding items.
    pub fn reserve(&mut self, batch_size: usize) {
        self.batch.reserve(batch_size);
    }

    /// Inputs that were not found in the cache and go to the network.
    pub fn cache_misses(&self) -> usize {
        self.parent.batch_size()
    }

    /// Total number of successfully added inputs.
    pub fn batch_size(&self) -> usize {
        self.batch.len()
    }

    /// Adds an input by fingerprint only. Returns false (and does nothing)
    /// when the fingerprint is not cached.
    pub fn add_input_by_hash(&mut self, hash: u64) -> bool {
        match self.cache.lookup(hash) {
            Some(lock) => {
                self.add_input_with_lock(hash, lock);
                true
            }
            None => false,
        }
    }

    /// Adds an input bound to an already-held cache pin.
    pub fn add_input_with_lock(&mut self, hash: u64, lock: NNCacheLock) {
        self.batch.push(WorkItem {
            hash,
            lock: Some(lock),
            idx_in_parent: None,
            edges: None,
            done: None,
            transform: 0,
        });
    }

    /// Adds a position: cache hit if possible, otherwise encodes it,
    /// generates its legal moves and forwards the input to the wrapped
    /// computation. A repeat of a novel position within the same batch
    /// shares the earlier item's network slot instead of adding another
    /// input.
    pub fn add_input(&mut self, hash: u64, history: &PositionHistory<R::Position>) {
        if self.add_input_by_hash(hash) {
            return;
        }
        let position = history.last();
        let transform = self.rules.transform(position);
        let moves = self.rules.legal_moves(position);
        debug_assert!(moves.len() <= MAX_MOVES);

        let shared_idx = self
            .batch
            .iter()
            .find_map(|item| (item.hash == hash).then_some(item.idx_in_parent).flatten());
        let idx_in_parent = match shared_idx {
            Some(idx) => idx,
            None => {
                let idx = self.parent.batch_size();
                self.parent.add_input(self.rules.encode(history, self.history_fill));
                idx
            }
        };
        self.batch.push(WorkItem {
            hash,
            lock: None,
            idx_in_parent: Some(idx_in_parent),
            edges: Some(Edge::from_move_list(&moves).into_vec()),
            done: None,
            transform,
        });
    }

    /// Removes the last added input. Only allowed for cache hits.
    pub fn pop_cache_hit(&mut self) {
        let last = self.batch.last().expect("batch is not empty");
        assert!(last.lock.is_some() && last.idx_in_parent.is_none());
        self.batch.pop();
    }

    /// Whether item `idx` was served from the cache.
    pub fn is_cache_hit(&self, idx: usize) -> bool {
        self.batch[idx].lock.is_some()
    }

    /// Runs the wrapped computation once, then softmaxes each novel item's
    /// policy in log space, sorts its edges by policy descending and
    /// inserts the result into the cache.
    pub fn compute_blocking(&mut self, softmax_temp: f32) -> Result<(), EvalError> {
        if self.parent.batch_size() > 0 {
            self.parent.compute_blocking()?;
        }

        // No position has more than MAX_MOVES legal moves, so one scratch
        // buffer serves every item.
        let mut scratch = [0f32; MAX_MOVES];
        for item in &mut self.batch {
            let parent_idx = match item.idx_in_parent {
                Some(idx) => idx,
                None => continue,
            };
            let mut edges = item.edges.take().expect("novel item has edges");

            let mut max_p = f32::NEG_INFINITY;
            for (ct, edge) in edges.iter().enumerate() {
                let nn_index = self.rules.policy_index(edge.get_move(), item.transform);
                let p = self.parent.get_p(parent_idx, nn_index);
                scratch[ct] = p;
                max_p = max_p.max(p);
            }
            let mut total = 0f32;
            for value in scratch.iter_mut().take(edges.len()) {
                // (exp(p - max_p))^(1/T) = exp((p - max_p) / T), computed
                // shifted so the largest logit maps to exp(0).
                let p = ((*value - max_p) / softmax_temp).exp();
                *value = p;
                total += p;
            }
            let scale = if total > 0.0 { 1.0 / total } else { 1.0 };
            for (ct, edge) in edges.iter().enumerate() {
                edge.set_p(scratch[ct] * scale);
            }

            Edge::sort_edges(&mut edges);

            let eval = Arc::new(NNEval {
                q: self.parent.get_q(parent_idx),
                d: self.parent.get_d(parent_idx),
                m: self.parent.get_m(parent_idx),
                e: self.parent.get_e(parent_idx),
                edges: edges.into_boxed_slice(),
            });
            item.done = Some(Arc::clone(&eval));
            self.cache.insert(item.hash, CachedNNRequest { eval });
        }
        Ok(())
    }

    /// Evaluation of batch item `idx`, whichever way it was produced.
    pub fn eval_of(&self, idx: usize) -> Arc<NNEval> {
        let item = &self.batch[idx];
        if let Some(done) = &item.done {
            return Arc::clone(done);
        }
        Arc::clone(item.lock.as_ref().expect("cache hit has a lock").eval())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chess::Move;

    fn dummy_eval(q: f32) -> CachedNNRequest {
        CachedNNRequest {
            eval: Arc::new(NNEval {
                q,
                d: 0.0,
                m: 0.0,
                e: 0.0,
                edges: Edge::from_move_list(&[Move::from_raw(1)]),
            }),
        }
    }

    #[test]
    fn lookup_pins_entry_across_eviction() {
        let cache = NNCache::new(2);
        cache.insert(1, dummy_eval(0.1));
        let lock = cache.lookup(1).unwrap();
        cache.insert(2, dummy_eval(0.2));
        cache.insert(3, dummy_eval(0.3));
        // Entry 1 was evicted but the pin keeps its data alive.
        assert!(cache.lookup(1).is_none());
        assert!((lock.eval().q - 0.1).abs() < 1e-6);
    }

    #[test]
    fn insert_is_idempotent_per_hash() {
        let cache = NNCache::new(4);
        cache.insert(7, dummy_eval(0.5));
        cache.insert(7, dummy_eval(0.5));
        assert_eq!(cache.len(), 1);
        // Re-inserting must not inflate the eviction order either.
        cache.insert(8, dummy_eval(0.1));
        cache.insert(9, dummy_eval(0.2));
        cache.insert(10, dummy_eval(0.3));
        assert_eq!(cache.len(), 4);
        assert!(cache.contains(7) || cache.contains(8));
    }

    #[test]
    fn capacity_is_enforced_fifo() {
        let cache = NNCache::new(2);
        cache.insert(1, dummy_eval(0.1));
        cache.insert(2, dummy_eval(0.2));
        cache.insert(3, dummy_eval(0.3));
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(1));
        assert!(cache.contains(2));
        assert!(cache.contains(3));
    }
}
