//! End-to-end scenarios over the search DAG: concurrent child spawning,
//! terminal propagation, and quiescence after a full batched search.

mod common;

use std::sync::Arc;
use std::thread;

use common::{init_logging, mv, ScriptedNetwork, ToyRules};
use peregrine::chess::{GameResult, Move};
use peregrine::mcts::node::{update_parent_bounds, Edge, LowNode, Node, Terminal};
use peregrine::mcts::params::{OptionsDict, SearchParams};
use peregrine::mcts::search::Search;
use peregrine::mcts::tree::NodeTree;
use peregrine::neural::cache::NNCache;
use peregrine::neural::network::NNEval;

fn evaluated_low(num_edges: u16, q: f32) -> LowNode {
    let moves: Vec<Move> = (0..num_edges).map(|i| Move::from_raw(100 + i)).collect();
    let edges = Edge::from_move_list(&moves);
    for (i, edge) in edges.iter().enumerate() {
        edge.set_p(1.0 / (i + 2) as f32);
    }
    let mut sorted: Vec<Edge> = edges.to_vec();
    Edge::sort_edges(&mut sorted);
    let low = LowNode::new_shell(0xabcd);
    low.set_nn_eval(&NNEval {
        q,
        d: 0.0,
        m: 4.0,
        e: 0.0,
        edges: sorted.into_boxed_slice(),
    });
    low
}

fn spawn_at(low: &LowNode, index: u16) -> *const Node {
    let mut it = low.edge_iter();
    it.seek(index);
    it.get_or_spawn_node() as *const Node
}

#[test]
fn concurrent_spawn_race_yields_one_node() {
    for _ in 0..50 {
        let low = Arc::new(evaluated_low(8, 0.0));
        spawn_at(&low, 3);
        spawn_at(&low, 7);

        let winners: Vec<usize> = thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let low = Arc::clone(&low);
                    scope.spawn(move || spawn_at(&low, 5) as usize)
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(
            winners[0], winners[1],
            "both workers must get the same node"
        );

        let mut chain = Vec::new();
        let mut child = low.child().get();
        while let Some(node) = child {
            chain.push(node.index());
            child = node.sibling().get();
        }
        assert_eq!(chain, vec![3, 5, 7]);
    }
}

#[test]
fn terminal_win_propagates_to_low_node() {
    let low = Arc::new(evaluated_low(3, 0.0));
    let child = unsafe { &*spawn_at(&low, 1) };

    child.make_terminal(GameResult::WhiteWon, 0.0, Terminal::EndOfGame);
    assert_eq!(child.n(), 1);
    assert_eq!(child.wl(), 1.0);
    assert_eq!(child.d(), 0.0);
    assert_eq!(child.m(), 0.0);

    assert!(update_parent_bounds(&low, true));
    assert_eq!(
        low.bounds(),
        (GameResult::WhiteWon, GameResult::WhiteWon)
    );
    assert!(low.is_terminal());
}

#[test]
fn terminal_revisits_multiply_without_reeval() {
    let low = Arc::new(evaluated_low(3, 0.0));
    let child = unsafe { &*spawn_at(&low, 0) };
    child.make_terminal(GameResult::WhiteWon, 0.0, Terminal::EndOfGame);

    // A parent node one level up observes the multivisit as plain sums.
    let parent = Node::new(Edge::new(Move::from_raw(7)), 0);
    parent.set_low_node(Arc::clone(&low));
    assert!(parent.try_start_score_update());
    parent.finalize_score_update(-1.0, 0.0, 1.0, 1.0, 1, 1.0);
    let before_wl = parent.wl();
    let before_n = parent.n();

    let k = 5u32;
    child.increment_n_in_flight(k);
    child.finalize_score_update(1.0, 0.0, 0.0, 1.0, k, k as f64);
    assert_eq!(child.n(), 1 + k);
    assert_eq!(child.wl(), (1 + k) as f64);

    parent.increment_n_in_flight(k);
    parent.finalize_score_update(-1.0, 0.0, 1.0, 1.0, k, k as f64);
    assert_eq!(parent.n(), before_n + k);
    assert_eq!(parent.wl(), before_wl - k as f64);
    assert_eq!(parent.n_in_flight(), 0);
}

#[test]
fn search_leaves_dag_quiescent_after_1024_rollouts() {
    init_logging();
    let rules = Arc::new(ToyRules::transpositional(&[
        "a2a3", "b2b3", "c2c3", "d2d4",
    ]));
    let mut options = OptionsDict::default();
    options.set_int("MinibatchSize", 32);
    let params = SearchParams::new(&options).unwrap();

    let mut tree = NodeTree::new(Arc::clone(&rules), &params);
    tree.reset_to_position("start", &[]).unwrap();
    let cache = NNCache::new(4096);
    let network = ScriptedNetwork::uniform(0.05);

    let search = Search::new(&tree, &cache, network.factory(), params, 1024);
    let result = search.run(4).unwrap();

    assert!(result.stats.rollouts >= 1024);
    assert!(result.best_move.is_some());
    assert!(
        tree.gamebegin_node().unwrap().zero_n_in_flight(),
        "quiescent DAG must have no in-flight visits"
    );
}

#[test]
fn search_ranks_high_prior_move_first() {
    init_logging();
    let menu = ["a2a3", "b2b3", "c2c3"];
    let rules = Arc::new(ToyRules::new(&menu));
    let mut options = OptionsDict::default();
    options.set_int("MinibatchSize", 8);
    let params = SearchParams::new(&options).unwrap();

    let mut tree = NodeTree::new(Arc::clone(&rules), &params);
    tree.reset_to_position("start", &[]).unwrap();
    let cache = NNCache::new(256);

    // Strongly prefer b2b3 in the policy head.
    let mut policy = vec![0.0f32; 4096];
    let favored = mv("b2b3");
    policy[(favored.raw() & 0xfff) as usize] = 4.0;
    let network = ScriptedNetwork::new(0.0, policy);

    let search = Search::new(&tree, &cache, network.factory(), params, 256);
    let result = search.run(2).unwrap();

    let infos = result.infos;
    assert!(!infos.is_empty());
    assert_eq!(infos[0].mv, "b2b3");
    for pair in infos.windows(2) {
        assert!(pair[0].n >= pair[1].n, "infos must be ranked by visits");
    }
    assert!(tree.gamebegin_node().unwrap().zero_n_in_flight());
}

#[test]
fn wdl_rescale_keeps_drawless_evals_finite() {
    init_logging();
    let rules = Arc::new(ToyRules::new(&["a2a3", "b2b3", "c2c3"]));
    let mut options = OptionsDict::default();
    options.set_int("MinibatchSize", 8);
    options.set_float("WDLRescaleRatio", 1.2);
    let params = SearchParams::new(&options).unwrap();

    let mut tree = NodeTree::new(Arc::clone(&rules), &params);
    tree.reset_to_position("start", &[]).unwrap();
    let cache = NNCache::new(256);
    // The scripted evaluator reports d = 0 for every position.
    let network = ScriptedNetwork::uniform(0.3);

    let search = Search::new(&tree, &cache, network.factory(), params, 128);
    let result = search.run(2).unwrap();

    for info in &result.infos {
        assert!(info.q.is_finite());
        assert!(info.d.is_finite());
    }
    let head_low = tree.current_head().low_node().unwrap();
    assert!(head_low.wldm_invariants_hold());
    assert!(tree.gamebegin_node().unwrap().zero_n_in_flight());
}

#[test]
fn transpositions_share_low_nodes() {
    init_logging();
    let rules = Arc::new(ToyRules::transpositional(&["a2a3", "b2b3"]));
    let mut options = OptionsDict::default();
    options.set_int("MinibatchSize", 16);
    let params = SearchParams::new(&options).unwrap();

    let mut tree = NodeTree::new(Arc::clone(&rules), &params);
    tree.reset_to_position("start", &[]).unwrap();
    let cache = NNCache::new(1024);
    let network = ScriptedNetwork::uniform(0.0);

    let search = Search::new(&tree, &cache, network.factory(), params, 512);
    search.run(2).unwrap();

    // a2a3+b2b3 and b2b3+a2a3 hash identically, so at depth two the DAG
    // holds one shared low node with two parents.
    let head_low = tree.current_head().low_node().unwrap();
    let mut shared = 0;
    let mut child = head_low.child().get();
    while let Some(node) = child {
        if let Some(low) = node.low_node() {
            let mut grandchild = low.child().get();
            while let Some(gc) = grandchild {
                if let Some(gc_low) = gc.low_node() {
                    if gc_low.is_transposition() {
                        shared += 1;
                    }
                }
                grandchild = gc.sibling().get();
            }
        }
        child = node.sibling().get();
    }
    assert!(shared > 0, "expected at least one shared low node");
    assert!(tree.gamebegin_node().unwrap().zero_n_in_flight());
}
