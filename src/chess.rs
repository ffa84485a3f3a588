//! Interface to the chess rules engine.
//!
//! The search core never implements chess itself. Everything it needs from
//! the rules side — legal move generation, position hashing, repetition
//! counting, board transforms, tablebase probes — comes through the
//! [`Rules`] trait, and positions stay opaque behind its associated type.

use smallvec::SmallVec;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::neural::network::EncodedPosition;

/// Hard upper bound on legal moves in any reachable position.
pub const MAX_MOVES: usize = 256;

/// Legal-move list, inline up to a typical middlegame branching factor.
pub type MoveList = SmallVec<[Move; 64]>;

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("invalid position: {0}")]
    InvalidPosition(String),
    #[error("illegal move: {0}")]
    IllegalMove(String),
}

/// A move packed into 16 bits: 6-bit from square, 6-bit to square and a
/// 3-bit promotion tag. From the point of view of the player making it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Move(u16);

impl Move {
    pub fn new(from: u8, to: u8) -> Self {
        Move(((from as u16) << 6) | to as u16)
    }

    pub fn with_promotion(from: u8, to: u8, promotion: u8) -> Self {
        debug_assert!(promotion < 8);
        Move(((promotion as u16) << 12) | ((from as u16) << 6) | to as u16)
    }

    pub fn null() -> Self {
        Move(0)
    }

    pub fn from_raw(raw: u16) -> Self {
        Move(raw)
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    pub fn from_sq(self) -> u8 {
        ((self.0 >> 6) & 0x3f) as u8
    }

    pub fn to_sq(self) -> u8 {
        (self.0 & 0x3f) as u8
    }

    pub fn promotion(self) -> u8 {
        ((self.0 >> 12) & 0x7) as u8
    }
}

const PROMO_CHARS: [char; 8] = ['-', 'n', 'b', 'r', 'q', '?', '?', '?'];

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sq = |s: u8| {
            format!(
                "{}{}",
                (b'a' + (s & 7)) as char,
                (b'1' + (s >> 3)) as char
            )
        };
        write!(f, "{}{}", sq(self.from_sq()), sq(self.to_sq()))?;
        if self.promotion() != 0 {
            write!(f, "{}", PROMO_CHARS[self.promotion() as usize])?;
        }
        Ok(())
    }
}

impl FromStr for Move {
    type Err = RulesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() < 4 || bytes.len() > 5 {
            return Err(RulesError::IllegalMove(s.to_string()));
        }
        let sq = |file: u8, rank: u8| -> Result<u8, RulesError> {
            if !(b'a'..=b'h').contains(&file) || !(b'1'..=b'8').contains(&rank) {
                return Err(RulesError::IllegalMove(s.to_string()));
            }
            Ok((rank - b'1') * 8 + (file - b'a'))
        };
        let from = sq(bytes[0], bytes[1])?;
        let to = sq(bytes[2], bytes[3])?;
        if bytes.len() == 5 {
            let promo = PROMO_CHARS
                .iter()
                .position(|&c| c == bytes[4] as char)
                .filter(|&p| p != 0)
                .ok_or_else(|| RulesError::IllegalMove(s.to_string()))?;
            Ok(Move::with_promotion(from, to, promo as u8))
        } else {
            Ok(Move::new(from, to))
        }
    }
}

/// Decided game outcome. In node bookkeeping results are relative to the
/// player who moved into the position, so `BlackWon` doubles as "loss" and
/// `WhiteWon` as "win"; the ordering loss < draw < win is what bounds
/// comparisons rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GameResult {
    BlackWon,
    Draw,
    WhiteWon,
}

impl GameResult {
    /// W-minus-L value of the result.
    pub fn wl(self) -> f32 {
        match self {
            GameResult::BlackWon => -1.0,
            GameResult::Draw => 0.0,
            GameResult::WhiteWon => 1.0,
        }
    }

    pub fn invert(self) -> Self {
        match self {
            GameResult::BlackWon => GameResult::WhiteWon,
            GameResult::Draw => GameResult::Draw,
            GameResult::WhiteWon => GameResult::BlackWon,
        }
    }
}

/// How to fill NN input planes when the real history is shorter than the
/// encoder's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillEmptyHistory {
    No,
    FenOnly,
    Always,
}

impl FromStr for FillEmptyHistory {
    type Err = RulesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no" => Ok(FillEmptyHistory::No),
            "fen_only" => Ok(FillEmptyHistory::FenOnly),
            "always" => Ok(FillEmptyHistory::Always),
            other => Err(RulesError::InvalidPosition(format!(
                "unknown history fill '{other}'"
            ))),
        }
    }
}

/// The rules engine the search consumes. Implementations must be cheap to
/// share between worker threads.
pub trait Rules: Send + Sync + 'static {
    type Position: Clone + Send + Sync;

    fn position_from_fen(&self, fen: &str) -> Result<Self::Position, RulesError>;
    fn apply_move(&self, pos: &Self::Position, mv: Move) -> Self::Position;
    /// Ordered legal-move list, at most [`MAX_MOVES`] entries.
    fn legal_moves(&self, pos: &Self::Position) -> MoveList;
    /// Single-position fingerprint. History windows are folded on top of
    /// this by [`PositionHistory::hash_last`].
    fn hash(&self, pos: &Self::Position) -> u64;
    fn is_black_to_move(&self, pos: &Self::Position) -> bool;
    /// `Some` when the position is decided by rule (checkmate, stalemate,
    /// 50-move rule, ...), from the perspective of the player to move.
    fn game_result(&self, pos: &Self::Position) -> Option<GameResult>;
    /// Halfmove clock for the 50-move rule.
    fn rule50_ply(&self, _pos: &Self::Position) -> u32 {
        0
    }
    /// Identifier of the canonical board transform used to map this
    /// position into NN input coordinates.
    fn transform(&self, _pos: &Self::Position) -> u8 {
        0
    }
    /// Index of `mv` in the evaluator's policy head, under `transform`.
    fn policy_index(&self, mv: Move, transform: u8) -> usize;
    /// Encodes the most recent positions of `history` for the evaluator.
    fn encode(
        &self,
        history: &PositionHistory<Self::Position>,
        fill: FillEmptyHistory,
    ) -> EncodedPosition;
    /// Endgame tablebase probe: mover-relative result and distance in plies.
    fn probe_tablebase(&self, _pos: &Self::Position) -> Option<(GameResult, f32)> {
        None
    }
    /// Whether the endgame move-selection temperature applies.
    fn is_endgame(&self, _pos: &Self::Position) -> bool {
        false
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Game line as seen by the search: positions plus their per-position
/// fingerprints, pushed in game order.
#[derive(Debug, Clone)]
pub struct PositionHistory<P> {
    positions: Vec<P>,
    hashes: Vec<u64>,
}

impl<P: Clone> PositionHistory<P> {
    pub fn new() -> Self {
        PositionHistory {
            positions: Vec::new(),
            hashes: Vec::new(),
        }
    }

    pub fn push(&mut self, position: P, hash: u64) {
        self.positions.push(position);
        self.hashes.push(hash);
    }

    pub fn pop(&mut self) {
        self.positions.pop();
        self.hashes.pop();
    }

    pub fn truncate(&mut self, len: usize) {
        self.positions.truncate(len);
        self.hashes.truncate(len);
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn last(&self) -> &P {
        self.positions.last().expect("history is never empty")
    }

    pub fn positions(&self) -> &[P] {
        &self.positions
    }

    /// Fingerprint of the last `count` positions (at least one), with the
    /// 50-move counter mixed in when provided. Depends on nothing older
    /// than the window.
    pub fn hash_last(&self, count: usize, r50_ply: Option<u32>) -> u64 {
        let take = count.max(1).min(self.hashes.len());
        let mut h = 0u64;
        for &x in &self.hashes[self.hashes.len() - take..] {
            h = splitmix64(h ^ x);
        }
        if let Some(r50) = r50_ply {
            h = splitmix64(h ^ (r50 as u64).wrapping_shl(1) ^ 1);
        }
        h
    }

    /// Number of earlier positions in the line whose fingerprint equals the
    /// current one.
    pub fn repetitions(&self) -> u32 {
        match self.hashes.split_last() {
            Some((&last, rest)) => rest.iter().filter(|&&h| h == last).count() as u32,
            None => 0,
        }
    }
}

impl<P: Clone> Default for PositionHistory<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_roundtrips_through_uci() {
        for s in ["e2e4", "g1f3", "a7a8q", "h2h1n"] {
            let mv: Move = s.parse().unwrap();
            assert_eq!(mv.to_string(), s);
        }
    }

    #[test]
    fn move_rejects_garbage() {
        assert!("e9e4".parse::<Move>().is_err());
        assert!("e2".parse::<Move>().is_err());
        assert!("e2e4x".parse::<Move>().is_err());
    }

    #[test]
    fn result_ordering_is_loss_draw_win() {
        assert!(GameResult::BlackWon < GameResult::Draw);
        assert!(GameResult::Draw < GameResult::WhiteWon);
        assert_eq!(GameResult::WhiteWon.invert(), GameResult::BlackWon);
    }

    #[test]
    fn hash_window_ignores_older_positions() {
        let mut a: PositionHistory<u8> = PositionHistory::new();
        let mut b: PositionHistory<u8> = PositionHistory::new();
        for h in [11u64, 22, 33, 44] {
            a.push(0, h);
        }
        for h in [99u64, 77, 33, 44] {
            b.push(0, h);
        }
        assert_eq!(a.hash_last(2, None), b.hash_last(2, None));
        assert_ne!(a.hash_last(3, None), b.hash_last(3, None));
        assert_ne!(a.hash_last(2, Some(5)), a.hash_last(2, Some(6)));
        assert_ne!(a.hash_last(2, Some(0)), a.hash_last(2, None));
    }

    #[test]
    fn repetition_count_matches_equal_hashes() {
        let mut h: PositionHistory<u8> = PositionHistory::new();
        h.push(0, 7);
        h.push(0, 8);
        h.push(0, 7);
        assert_eq!(h.repetitions(), 1);
        h.push(0, 9);
        assert_eq!(h.repetitions(), 0);
    }
}
