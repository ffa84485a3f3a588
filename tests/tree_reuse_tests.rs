//! Tree reuse on position resets: prefix extensions keep the DAG,
//! divergence tears it down and collects the leftovers.

mod common;

use std::sync::Arc;

use common::{init_logging, mv, ToyRules};
use peregrine::mcts::tree::NodeTree;

#[test]
fn prefix_extension_reuses_and_detaches_nothing() {
    let rules = Arc::new(ToyRules::new(&["e2e4", "c7c5", "g1f3", "d2d4"]));
    let mut tree = NodeTree::without_params(Arc::clone(&rules));

    tree.reset_to_position("start", &[mv("e2e4"), mv("c7c5")])
        .unwrap();
    let allocated = tree.allocated_node_count();

    let reused = tree
        .reset_to_position("start", &[mv("e2e4"), mv("c7c5"), mv("g1f3")])
        .unwrap();
    assert!(reused);
    assert_eq!(tree.moves().len(), 3);
    assert_eq!(tree.current_head().get_move(), mv("g1f3"));
    assert!(tree.gc_queue().is_empty(), "no low nodes may be detached");
    assert!(tree.allocated_node_count() > allocated);
}

#[test]
fn identical_position_counts_as_reuse() {
    let rules = Arc::new(ToyRules::new(&["e2e4", "c7c5"]));
    let mut tree = NodeTree::without_params(Arc::clone(&rules));

    tree.reset_to_position("start", &[mv("e2e4")]).unwrap();
    let head_before = tree.current_head() as *const _;
    let reused = tree.reset_to_position("start", &[mv("e2e4")]).unwrap();
    assert!(reused);
    assert!(std::ptr::eq(head_before, tree.current_head()));
}

#[test]
fn divergence_rebuilds_and_flushes_dead_entries() {
    init_logging();
    let rules = Arc::new(ToyRules::new(&["e2e4", "c7c5", "g1f3", "d2d4"]));
    let mut tree = NodeTree::without_params(Arc::clone(&rules));

    tree.reset_to_position("start", &[mv("e2e4"), mv("c7c5")])
        .unwrap();

    let reused = tree.reset_to_position("start", &[mv("d2d4")]).unwrap();
    assert!(!reused);
    assert_eq!(tree.moves(), &[mv("d2d4")]);
    assert!(tree.current_head().has_low_node());

    // The teardown already swept parentless entries, so a full GC pass
    // finds nothing left to do and the table only holds the live line.
    assert!(!tree.tt_gc_some(0));
    assert!(tree.allocated_node_count() <= 3);
}

#[test]
fn shorter_move_list_is_not_a_reuse() {
    let rules = Arc::new(ToyRules::new(&["e2e4", "c7c5"]));
    let mut tree = NodeTree::without_params(Arc::clone(&rules));

    tree.reset_to_position("start", &[mv("e2e4"), mv("c7c5")])
        .unwrap();
    let reused = tree.reset_to_position("start", &[mv("e2e4")]).unwrap();
    assert!(!reused);
    assert_eq!(tree.moves(), &[mv("e2e4")]);
}

#[test]
fn different_start_is_not_a_reuse() {
    let rules = Arc::new(ToyRules::new(&["e2e4"]));
    let mut tree = NodeTree::without_params(Arc::clone(&rules));
    tree.reset_to_position("start", &[]).unwrap();
    assert!(tree.reset_to_position("bogus", &[]).is_err());
}
