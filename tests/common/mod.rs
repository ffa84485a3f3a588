//! Shared test utilities: a deterministic toy rules engine and a scripted
//! evaluator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use peregrine::chess::{
    FillEmptyHistory, GameResult, Move, MoveList, PositionHistory, Rules, RulesError,
};
use peregrine::mcts::search::ComputationFactory;
use peregrine::neural::network::{EncodedPosition, EvalError, NetworkComputation};

/// Routes `log` output into the test harness when `RUST_LOG` is set.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn mix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^ (x >> 27)
}

/// A position in the toy game: the move sequence that reached it.
#[derive(Debug, Clone, PartialEq)]
pub struct Seq(pub Vec<Move>);

/// A rules engine with a fixed move menu in every position. With
/// `transpositional` hashing, move order does not matter, so different
/// orders of the same moves reach the same low node.
pub struct ToyRules {
    menu: Vec<Move>,
    transpositional: bool,
    terminal_after: Option<usize>,
}

impl ToyRules {
    pub fn new(menu: &[&str]) -> Self {
        ToyRules {
            menu: menu.iter().map(|s| s.parse().unwrap()).collect(),
            transpositional: false,
            terminal_after: None,
        }
    }

    pub fn transpositional(menu: &[&str]) -> Self {
        let mut rules = Self::new(menu);
        rules.transpositional = true;
        rules
    }

    /// Every position whose line reaches this length is drawn.
    pub fn with_terminal_after(mut self, plies: usize) -> Self {
        self.terminal_after = Some(plies);
        self
    }
}

impl Rules for ToyRules {
    type Position = Seq;

    fn position_from_fen(&self, fen: &str) -> Result<Seq, RulesError> {
        if fen == "start" {
            Ok(Seq(Vec::new()))
        } else {
            Err(RulesError::InvalidPosition(fen.to_string()))
        }
    }

    fn apply_move(&self, pos: &Seq, mv: Move) -> Seq {
        let mut next = pos.0.clone();
        next.push(mv);
        Seq(next)
    }

    fn legal_moves(&self, pos: &Seq) -> MoveList {
        if self.game_result(pos).is_some() {
            return MoveList::new();
        }
        self.menu.iter().copied().collect()
    }

    fn hash(&self, pos: &Seq) -> u64 {
        if self.transpositional {
            pos.0
                .iter()
                .fold(mix(pos.0.len() as u64), |h, m| {
                    h.wrapping_add(mix(m.raw() as u64 + 1))
                })
        } else {
            pos.0
                .iter()
                .fold(0x5eedu64, |h, m| mix(h ^ (m.raw() as u64 + 1)))
        }
    }

    fn is_black_to_move(&self, pos: &Seq) -> bool {
        pos.0.len() % 2 == 1
    }

    fn game_result(&self, pos: &Seq) -> Option<GameResult> {
        match self.terminal_after {
            Some(limit) if pos.0.len() >= limit => Some(GameResult::Draw),
            _ => None,
        }
    }

    fn policy_index(&self, mv: Move, _transform: u8) -> usize {
        (mv.raw() & 0xfff) as usize
    }

    fn encode(
        &self,
        history: &PositionHistory<Seq>,
        _fill: FillEmptyHistory,
    ) -> EncodedPosition {
        EncodedPosition {
            planes: vec![history.last().0.len() as f32],
        }
    }
}

/// An evaluator returning fixed value heads and a fixed policy vector,
/// counting how many inputs actually reach it.
pub struct ScriptedNetwork {
    pub q: f32,
    pub d: f32,
    pub m: f32,
    pub e: f32,
    pub policy: Arc<Vec<f32>>,
    pub inputs_seen: Arc<AtomicUsize>,
    pub computations: Arc<AtomicUsize>,
}

impl ScriptedNetwork {
    pub fn new(q: f32, policy: Vec<f32>) -> Self {
        ScriptedNetwork {
            q,
            d: 0.0,
            m: 10.0,
            e: 0.0,
            policy: Arc::new(policy),
            inputs_seen: Arc::new(AtomicUsize::new(0)),
            computations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Uniform policy over the whole index space.
    pub fn uniform(q: f32) -> Self {
        ScriptedNetwork::new(q, vec![0.0; 4096])
    }

    pub fn computation(&self) -> ScriptedComputation {
        ScriptedComputation {
            q: self.q,
            d: self.d,
            m: self.m,
            e: self.e,
            policy: Arc::clone(&self.policy),
            inputs_seen: Arc::clone(&self.inputs_seen),
            computations: Arc::clone(&self.computations),
            inputs: 0,
        }
    }

    pub fn factory(&self) -> Arc<ComputationFactory> {
        let (q, d, m, e) = (self.q, self.d, self.m, self.e);
        let policy = Arc::clone(&self.policy);
        let inputs_seen = Arc::clone(&self.inputs_seen);
        let computations = Arc::clone(&self.computations);
        Arc::new(move || {
            Box::new(ScriptedComputation {
                q,
                d,
                m,
                e,
                policy: Arc::clone(&policy),
                inputs_seen: Arc::clone(&inputs_seen),
                computations: Arc::clone(&computations),
                inputs: 0,
            }) as Box<dyn NetworkComputation>
        })
    }
}

pub struct ScriptedComputation {
    q: f32,
    d: f32,
    m: f32,
    e: f32,
    policy: Arc<Vec<f32>>,
    inputs_seen: Arc<AtomicUsize>,
    computations: Arc<AtomicUsize>,
    inputs: usize,
}

impl NetworkComputation for ScriptedComputation {
    fn add_input(&mut self, _input: EncodedPosition) {
        self.inputs += 1;
        self.inputs_seen.fetch_add(1, Ordering::SeqCst);
    }

    fn batch_size(&self) -> usize {
        self.inputs
    }

    fn compute_blocking(&mut self) -> Result<(), EvalError> {
        self.computations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_q(&self, _idx: usize) -> f32 {
        self.q
    }

    fn get_d(&self, _idx: usize) -> f32 {
        self.d
    }

    fn get_m(&self, _idx: usize) -> f32 {
        self.m
    }

    fn get_e(&self, _idx: usize) -> f32 {
        self.e
    }

    fn get_p(&self, _idx: usize, policy_index: usize) -> f32 {
        self.policy.get(policy_index).copied().unwrap_or(0.0)
    }
}

pub fn mv(s: &str) -> Move {
    s.parse().unwrap()
}
