//! Search tunables: an options map and the frozen snapshot the workers
//! consume.
//!
//! A [`SearchParams`] is built once at the start of a search and never
//! re-reads the options map; changing an option requires a new snapshot.
//! Unknown keys are ignored, invalid enum strings fail construction.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

use crate::chess::FillEmptyHistory;

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("invalid value '{value}' for option {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("option {key} has the wrong type")]
    WrongType { key: &'static str },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// String-keyed option storage, the way the front end hands settings over.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptionsDict {
    values: HashMap<String, OptionValue>,
}

impl OptionsDict {
    pub fn set(&mut self, key: impl Into<String>, value: OptionValue) {
        self.values.insert(key.into(), value);
    }

    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) {
        self.set(key, OptionValue::Bool(value));
    }

    pub fn set_int(&mut self, key: impl Into<String>, value: i64) {
        self.set(key, OptionValue::Int(value));
    }

    pub fn set_float(&mut self, key: impl Into<String>, value: f64) {
        self.set(key, OptionValue::Float(value));
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.set(key, OptionValue::Text(value.into()));
    }

    fn get_bool(&self, key: &'static str, default: bool) -> Result<bool, OptionsError> {
        match self.values.get(key) {
            None => Ok(default),
            Some(OptionValue::Bool(b)) => Ok(*b),
            Some(_) => Err(OptionsError::WrongType { key }),
        }
    }

    fn get_int(&self, key: &'static str, default: i64) -> Result<i64, OptionsError> {
        match self.values.get(key) {
            None => Ok(default),
            Some(OptionValue::Int(i)) => Ok(*i),
            Some(_) => Err(OptionsError::WrongType { key }),
        }
    }

    fn get_float(&self, key: &'static str, default: f64) -> Result<f64, OptionsError> {
        match self.values.get(key) {
            None => Ok(default),
            Some(OptionValue::Float(f)) => Ok(*f),
            Some(OptionValue::Int(i)) => Ok(*i as f64),
            Some(_) => Err(OptionsError::WrongType { key }),
        }
    }

    fn get_str(&self, key: &'static str, default: &str) -> Result<String, OptionsError> {
        match self.values.get(key) {
            None => Ok(default.to_string()),
            Some(OptionValue::Text(s)) => Ok(s.clone()),
            Some(_) => Err(OptionsError::WrongType { key }),
        }
    }
}

/// Whose perspective contempt is applied from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContemptMode {
    Play,
    White,
    Black,
    None,
}

impl FromStr for ContemptMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "play" => Ok(ContemptMode::Play),
            "white_side_analysis" => Ok(ContemptMode::White),
            "black_side_analysis" => Ok(ContemptMode::Black),
            "disable" => Ok(ContemptMode::None),
            _ => Err(()),
        }
    }
}

/// First-play-urgency: what an unvisited child's Q defaults to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpuStrategy {
    Absolute,
    Relative,
}

impl FromStr for FpuStrategy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "absolute" => Ok(FpuStrategy::Absolute),
            "relative" => Ok(FpuStrategy::Relative),
            _ => Err(()),
        }
    }
}

/// How scores are converted for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreType {
    Centipawn,
    WinPercentage,
    Q,
    WMinusL,
}

impl FromStr for ScoreType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "centipawn" => Ok(ScoreType::Centipawn),
            "win_percentage" => Ok(ScoreType::WinPercentage),
            "Q" => Ok(ScoreType::Q),
            "W-L" => Ok(ScoreType::WMinusL),
            _ => Err(()),
        }
    }
}

/// What the reported node count counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportedNodes {
    Nodes,
    Edges,
}

impl FromStr for ReportedNodes {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nodes" => Ok(ReportedNodes::Nodes),
            "edges" => Ok(ReportedNodes::Edges),
            _ => Err(()),
        }
    }
}

fn parse_enum<T: FromStr>(key: &'static str, value: &str) -> Result<T, OptionsError> {
    value.parse().map_err(|_| OptionsError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

/// Immutable snapshot of every tunable the concurrent workers read.
#[derive(Debug, Clone)]
pub struct SearchParams {
    minibatch_size: u32,

    cpuct: f32,
    cpuct_at_root: f32,
    cpuct_base: f32,
    cpuct_base_at_root: f32,
    cpuct_factor: f32,
    cpuct_factor_at_root: f32,
    cpuct_exponent: f32,
    cpuct_exponent_at_root: f32,

    fpu_strategy: FpuStrategy,
    fpu_value: f32,
    fpu_strategy_at_root: FpuStrategy,
    fpu_value_at_root: f32,

    use_cpuct_uncertainty: bool,
    just_fpu_uncertainty: bool,
    cpuct_uncertainty_min_factor: f32,
    cpuct_uncertainty_max_factor: f32,
    cpuct_uncertainty_min_uncertainty: f32,
    cpuct_uncertainty_max_uncertainty: f32,

    use_uncertainty_weighting: bool,
    uncertainty_weighting_cap: f32,
    uncertainty_weighting_coefficient: f32,
    uncertainty_weighting_exponent: f32,
    use_variance_scaling: bool,

    noise_epsilon: f32,
    noise_alpha: f32,
    policy_softmax_temp: f32,
    use_policy_boosting: bool,
    top_policy_boost: f32,
    top_policy_num_boost: u32,
    top_policy_tier_two_boost: f32,
    top_policy_tier_two_num_boost: u32,

    temperature: f32,
    temperature_endgame: f32,
    temperature_visit_offset: f32,
    temp_decay_moves: u32,
    temp_decay_delay_moves: u32,
    temperature_cutoff_move: u32,
    temperature_winpct_cutoff: f32,

    max_collision_events: u32,
    max_collision_visits: u32,
    max_collision_visits_scaling_start: u32,
    max_collision_visits_scaling_end: u32,
    max_collision_visits_scaling_power: f32,
    out_of_order_eval: bool,
    max_out_of_order_evals: u32,
    sticky_endgames: bool,
    two_fold_draws: bool,
    syzygy_fast_play: bool,
    cache_history_length: u32,
    history_fill: FillEmptyHistory,
    move_rule_bucketing: bool,
    search_spin_backoff: bool,

    task_workers_per_search_worker: u32,
    minimum_work_size_for_processing: u32,
    minimum_work_size_for_picking: u32,
    minimum_remaining_work_size_for_picking: u32,
    minimum_work_per_task_for_processing: u32,
    idling_minimum_work: u32,
    thread_idling_threshold: u32,

    contempt_mode: ContemptMode,
    wdl_rescale_ratio: f32,
    wdl_rescale_diff: f32,
    wdl_max_s: f32,
    wdl_eval_objectivity: f32,

    use_correction_history: bool,
    correction_history_alpha: f32,
    correction_history_lambda: f32,

    use_desperation: bool,
    desperation_multiplier: f32,
    desperation_low: f32,
    desperation_high: f32,
    desperation_prior_weight: f32,

    score_type: ScoreType,
    multipv: u32,
    per_pv_counters: bool,
    verbose_stats: bool,
    log_live_stats: bool,
    reported_nodes: ReportedNodes,
    draw_score: f32,
    nps_limit: f64,
}

impl SearchParams {
    pub fn new(options: &OptionsDict) -> Result<Self, OptionsError> {
        let cpuct = options.get_float("CPuct", 1.745)? as f32;
        let cpuct_base = options.get_float("CPuctBase", 38739.0)? as f32;
        let cpuct_factor = options.get_float("CPuctFactor", 3.894)? as f32;
        let cpuct_exponent = options.get_float("CPuctExponent", 1.0)? as f32;
        let fpu_strategy: FpuStrategy =
            parse_enum("FpuStrategy", &options.get_str("FpuStrategy", "relative")?)?;
        let fpu_value = options.get_float("FpuValue", 0.330)? as f32;

        // Root variants default to the regular values.
        let at_root_strategy = options.get_str("FpuStrategyAtRoot", "same")?;
        let fpu_strategy_at_root = if at_root_strategy == "same" {
            fpu_strategy
        } else {
            parse_enum("FpuStrategyAtRoot", &at_root_strategy)?
        };

        Ok(SearchParams {
            minibatch_size: options.get_int("MinibatchSize", 256)? as u32,

            cpuct_at_root: options.get_float("CPuctAtRoot", cpuct as f64)? as f32,
            cpuct,
            cpuct_base_at_root: options.get_float("CPuctBaseAtRoot", cpuct_base as f64)? as f32,
            cpuct_base,
            cpuct_factor_at_root: options.get_float("CPuctFactorAtRoot", cpuct_factor as f64)?
                as f32,
            cpuct_factor,
            cpuct_exponent_at_root: options
                .get_float("CPuctExponentAtRoot", cpuct_exponent as f64)?
                as f32,
            cpuct_exponent,

            fpu_strategy,
            fpu_value,
            fpu_strategy_at_root,
            fpu_value_at_root: options.get_float("FpuValueAtRoot", 1.0)? as f32,

            use_cpuct_uncertainty: options.get_bool("UseCpuctUncertainty", false)?,
            just_fpu_uncertainty: options.get_bool("JustFpuUncertainty", false)?,
            cpuct_uncertainty_min_factor: options.get_float("CpuctUncertaintyMinFactor", 1.0)?
                as f32,
            cpuct_uncertainty_max_factor: options.get_float("CpuctUncertaintyMaxFactor", 1.15)?
                as f32,
            cpuct_uncertainty_min_uncertainty: options
                .get_float("CpuctUncertaintyMinUncertainty", 0.05)?
                as f32,
            cpuct_uncertainty_max_uncertainty: options
                .get_float("CpuctUncertaintyMaxUncertainty", 0.23)?
                as f32,

            use_uncertainty_weighting: options.get_bool("UseUncertaintyWeighting", false)?,
            uncertainty_weighting_cap: options.get_float("UncertaintyWeightingCap", 1.03)? as f32,
            uncertainty_weighting_coefficient: options
                .get_float("UncertaintyWeightingCoefficient", 0.13)?
                as f32,
            uncertainty_weighting_exponent: options
                .get_float("UncertaintyWeightingExponent", -0.76)?
                as f32,
            use_variance_scaling: options.get_bool("UseVarianceScaling", false)?,

            noise_epsilon: options.get_float("DirichletNoiseEpsilon", 0.0)? as f32,
            noise_alpha: options.get_float("DirichletNoiseAlpha", 0.3)? as f32,
            policy_softmax_temp: options.get_float("PolicyTemperature", 1.359)? as f32,
            use_policy_boosting: options.get_bool("UsePolicyBoosting", false)?,
            top_policy_boost: options.get_float("TopPolicyBoost", 0.05)? as f32,
            top_policy_num_boost: options.get_int("TopPolicyNumBoost", 2)? as u32,
            top_policy_tier_two_boost: options.get_float("TopPolicyTierTwoBoost", 0.02)? as f32,
            top_policy_tier_two_num_boost: options.get_int("TopPolicyTierTwoNumBoost", 5)? as u32,

            temperature: options.get_float("Temperature", 0.0)? as f32,
            temperature_endgame: options.get_float("TempEndgame", 0.0)? as f32,
            temperature_visit_offset: options.get_float("TempVisitOffset", 0.0)? as f32,
            temp_decay_moves: options.get_int("TempDecayMoves", 0)? as u32,
            temp_decay_delay_moves: options.get_int("TempDecayDelayMoves", 0)? as u32,
            temperature_cutoff_move: options.get_int("TempCutoffMove", 60)? as u32,
            temperature_winpct_cutoff: options.get_float("TempValueCutoff", 100.0)? as f32,

            max_collision_events: options.get_int("MaxCollisionEvents", 917)? as u32,
            max_collision_visits: options.get_int("MaxCollisionVisits", 80000)? as u32,
            max_collision_visits_scaling_start: options
                .get_int("MaxCollisionVisitsScalingStart", 28)?
                as u32,
            max_collision_visits_scaling_end: options
                .get_int("MaxCollisionVisitsScalingEnd", 145000)?
                as u32,
            max_collision_visits_scaling_power: options
                .get_float("MaxCollisionVisitsScalingPower", 1.25)?
                as f32,
            out_of_order_eval: options.get_bool("OutOfOrderEval", true)?,
            max_out_of_order_evals: options.get_int("MaxOutOfOrderEvals", 614)? as u32,
            sticky_endgames: options.get_bool("StickyEndgames", true)?,
            two_fold_draws: options.get_bool("TwoFoldDraws", true)?,
            syzygy_fast_play: options.get_bool("SyzygyFastPlay", false)?,
            cache_history_length: options.get_int("CacheHistoryLength", 0)? as u32,
            history_fill: parse_enum("HistoryFill", &options.get_str("HistoryFill", "fen_only")?)?,
            move_rule_bucketing: options.get_bool("MoveRuleBucketing", false)?,
            search_spin_backoff: options.get_bool("SearchSpinBackoff", false)?,

            task_workers_per_search_worker: options.get_int("TaskWorkers", 4)? as u32,
            minimum_work_size_for_processing: options.get_int("MinimumProcessingWork", 20)? as u32,
            minimum_work_size_for_picking: options.get_int("MinimumPickingWork", 1)? as u32,
            minimum_remaining_work_size_for_picking: options
                .get_int("MinimumRemainingPickingWork", 0)?
                as u32,
            minimum_work_per_task_for_processing: options.get_int("MinimumPerTaskProcessing", 8)?
                as u32,
            idling_minimum_work: options.get_int("IdlingMinimumWork", 0)? as u32,
            thread_idling_threshold: options.get_int("ThreadIdlingThreshold", 1)? as u32,

            contempt_mode: parse_enum("ContemptMode", &options.get_str("ContemptMode", "play")?)?,
            wdl_rescale_ratio: options.get_float("WDLRescaleRatio", 1.0)? as f32,
            wdl_rescale_diff: options.get_float("WDLRescaleDiff", 0.0)? as f32,
            wdl_max_s: options.get_float("WDLMaxS", 1.4)? as f32,
            wdl_eval_objectivity: options.get_float("WDLEvalObjectivity", 1.0)? as f32,

            use_correction_history: options.get_bool("UseCorrectionHistory", false)?,
            correction_history_alpha: options.get_float("CorrectionHistoryAlpha", 0.15)? as f32,
            correction_history_lambda: options.get_float("CorrectionHistoryLambda", 0.5)? as f32,

            use_desperation: options.get_bool("UseDesperation", false)?,
            desperation_multiplier: options.get_float("DesperationMultiplier", 1.5)? as f32,
            desperation_low: options.get_float("DesperationLow", -0.9)? as f32,
            desperation_high: options.get_float("DesperationHigh", -0.3)? as f32,
            desperation_prior_weight: options.get_float("DesperationPriorWeight", 0.25)? as f32,

            score_type: parse_enum("ScoreType", &options.get_str("ScoreType", "centipawn")?)?,
            multipv: options.get_int("MultiPV", 1)?.max(1) as u32,
            per_pv_counters: options.get_bool("PerPVCounters", false)?,
            verbose_stats: options.get_bool("VerboseMoveStats", false)?,
            log_live_stats: options.get_bool("LogLiveStats", false)?,
            reported_nodes: parse_enum(
                "ReportedNodes",
                &options.get_str("ReportedNodes", "nodes")?,
            )?,
            draw_score: options.get_float("DrawScore", 0.0)? as f32,
            nps_limit: options.get_float("NodesPerSecondLimit", 0.0)?,
        })
    }

    pub fn minibatch_size(&self) -> u32 {
        self.minibatch_size
    }

    pub fn cpuct(&self, at_root: bool) -> f32 {
        if at_root {
            self.cpuct_at_root
        } else {
            self.cpuct
        }
    }

    pub fn cpuct_base(&self, at_root: bool) -> f32 {
        if at_root {
            self.cpuct_base_at_root
        } else {
            self.cpuct_base
        }
    }

    pub fn cpuct_factor(&self, at_root: bool) -> f32 {
        if at_root {
            self.cpuct_factor_at_root
        } else {
            self.cpuct_factor
        }
    }

    pub fn cpuct_exponent(&self, at_root: bool) -> f32 {
        if at_root {
            self.cpuct_exponent_at_root
        } else {
            self.cpuct_exponent
        }
    }

    pub fn fpu_strategy(&self, at_root: bool) -> FpuStrategy {
        if at_root {
            self.fpu_strategy_at_root
        } else {
            self.fpu_strategy
        }
    }

    pub fn fpu_value(&self, at_root: bool) -> f32 {
        if at_root {
            self.fpu_value_at_root
        } else {
            self.fpu_value
        }
    }

    pub fn use_cpuct_uncertainty(&self) -> bool {
        self.use_cpuct_uncertainty
    }

    pub fn just_fpu_uncertainty(&self) -> bool {
        self.just_fpu_uncertainty
    }

    pub fn cpuct_uncertainty_min_factor(&self) -> f32 {
        self.cpuct_uncertainty_min_factor
    }

    pub fn cpuct_uncertainty_max_factor(&self) -> f32 {
        self.cpuct_uncertainty_max_factor
    }

    pub fn cpuct_uncertainty_min_uncertainty(&self) -> f32 {
        self.cpuct_uncertainty_min_uncertainty
    }

    pub fn cpuct_uncertainty_max_uncertainty(&self) -> f32 {
        self.cpuct_uncertainty_max_uncertainty
    }

    pub fn use_uncertainty_weighting(&self) -> bool {
        self.use_uncertainty_weighting
    }

    pub fn uncertainty_weighting_cap(&self) -> f32 {
        self.uncertainty_weighting_cap
    }

    pub fn uncertainty_weighting_coefficient(&self) -> f32 {
        self.uncertainty_weighting_coefficient
    }

    pub fn uncertainty_weighting_exponent(&self) -> f32 {
        self.uncertainty_weighting_exponent
    }

    pub fn use_variance_scaling(&self) -> bool {
        self.use_variance_scaling
    }

    pub fn noise_epsilon(&self) -> f32 {
        self.noise_epsilon
    }

    pub fn noise_alpha(&self) -> f32 {
        self.noise_alpha
    }

    pub fn policy_softmax_temp(&self) -> f32 {
        self.policy_softmax_temp
    }

    pub fn use_policy_boosting(&self) -> bool {
        self.use_policy_boosting
    }

    pub fn top_policy_boost(&self) -> f32 {
        self.top_policy_boost
    }

    pub fn top_policy_num_boost(&self) -> u32 {
        self.top_policy_num_boost
    }

    pub fn top_policy_tier_two_boost(&self) -> f32 {
        self.top_policy_tier_two_boost
    }

    pub fn top_policy_tier_two_num_boost(&self) -> u32 {
        self.top_policy_tier_two_num_boost
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn temperature_endgame(&self) -> f32 {
        self.temperature_endgame
    }

    pub fn temperature_visit_offset(&self) -> f32 {
        self.temperature_visit_offset
    }

    pub fn temp_decay_moves(&self) -> u32 {
        self.temp_decay_moves
    }

    pub fn temp_decay_delay_moves(&self) -> u32 {
        self.temp_decay_delay_moves
    }

    pub fn temperature_cutoff_move(&self) -> u32 {
        self.temperature_cutoff_move
    }

    pub fn temperature_winpct_cutoff(&self) -> f32 {
        self.temperature_winpct_cutoff
    }

    pub fn max_collision_events(&self) -> u32 {
        self.max_collision_events
    }

    pub fn max_collision_visits(&self) -> u32 {
        self.max_collision_visits
    }

    pub fn max_collision_visits_scaling_start(&self) -> u32 {
        self.max_collision_visits_scaling_start
    }

    pub fn max_collision_visits_scaling_end(&self) -> u32 {
        self.max_collision_visits_scaling_end
    }

    pub fn max_collision_visits_scaling_power(&self) -> f32 {
        self.max_collision_visits_scaling_power
    }

    pub fn out_of_order_eval(&self) -> bool {
        self.out_of_order_eval
    }

    pub fn max_out_of_order_evals(&self) -> u32 {
        self.max_out_of_order_evals
    }

    pub fn sticky_endgames(&self) -> bool {
        self.sticky_endgames
    }

    pub fn two_fold_draws(&self) -> bool {
        self.two_fold_draws
    }

    pub fn syzygy_fast_play(&self) -> bool {
        self.syzygy_fast_play
    }

    pub fn cache_history_length(&self) -> u32 {
        self.cache_history_length
    }

    pub fn history_fill(&self) -> FillEmptyHistory {
        self.history_fill
    }

    pub fn move_rule_bucketing(&self) -> bool {
        self.move_rule_bucketing
    }

    pub fn search_spin_backoff(&self) -> bool {
        self.search_spin_backoff
    }

    pub fn task_workers_per_search_worker(&self) -> u32 {
        self.task_workers_per_search_worker
    }

    pub fn minimum_work_size_for_processing(&self) -> u32 {
        self.minimum_work_size_for_processing
    }

    pub fn minimum_work_size_for_picking(&self) -> u32 {
        self.minimum_work_size_for_picking
    }

    pub fn minimum_remaining_work_size_for_picking(&self) -> u32 {
        self.minimum_remaining_work_size_for_picking
    }

    pub fn minimum_work_per_task_for_processing(&self) -> u32 {
        self.minimum_work_per_task_for_processing
    }

    pub fn idling_minimum_work(&self) -> u32 {
        self.idling_minimum_work
    }

    pub fn thread_idling_threshold(&self) -> u32 {
        self.thread_idling_threshold
    }

    pub fn contempt_mode(&self) -> ContemptMode {
        self.contempt_mode
    }

    pub fn wdl_rescale_ratio(&self) -> f32 {
        self.wdl_rescale_ratio
    }

    pub fn wdl_rescale_diff(&self) -> f32 {
        self.wdl_rescale_diff
    }

    pub fn wdl_max_s(&self) -> f32 {
        self.wdl_max_s
    }

    pub fn wdl_eval_objectivity(&self) -> f32 {
        self.wdl_eval_objectivity
    }

    pub fn use_correction_history(&self) -> bool {
        self.use_correction_history
    }

    pub fn correction_history_alpha(&self) -> f32 {
        self.correction_history_alpha
    }

    pub fn correction_history_lambda(&self) -> f32 {
        self.correction_history_lambda
    }

    pub fn use_desperation(&self) -> bool {
        self.use_desperation
    }

    pub fn desperation_multiplier(&self) -> f32 {
        self.desperation_multiplier
    }

    pub fn desperation_low(&self) -> f32 {
        self.desperation_low
    }

    pub fn desperation_high(&self) -> f32 {
        self.desperation_high
    }

    pub fn desperation_prior_weight(&self) -> f32 {
        self.desperation_prior_weight
    }

    pub fn score_type(&self) -> ScoreType {
        self.score_type
    }

    pub fn multipv(&self) -> u32 {
        self.multipv
    }

    pub fn per_pv_counters(&self) -> bool {
        self.per_pv_counters
    }

    pub fn verbose_stats(&self) -> bool {
        self.verbose_stats
    }

    pub fn log_live_stats(&self) -> bool {
        self.log_live_stats
    }

    pub fn reported_nodes(&self) -> ReportedNodes {
        self.reported_nodes
    }

    pub fn draw_score(&self) -> f32 {
        self.draw_score
    }

    pub fn nps_limit(&self) -> f64 {
        self.nps_limit
    }
}

impl Default for SearchParams {
    fn default() -> Self {
        SearchParams::new(&OptionsDict::default()).expect("defaults are valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build() {
        let params = SearchParams::default();
        assert_eq!(params.minibatch_size(), 256);
        assert_eq!(params.fpu_strategy(false), FpuStrategy::Relative);
        assert_eq!(params.fpu_strategy(true), FpuStrategy::Relative);
        assert_eq!(params.contempt_mode(), ContemptMode::Play);
        assert!(params.cpuct(true) == params.cpuct(false));
    }

    #[test]
    fn overrides_and_root_variants() {
        let mut options = OptionsDict::default();
        options.set_float("CPuct", 2.0);
        options.set_float("CPuctAtRoot", 3.0);
        options.set_str("FpuStrategy", "absolute");
        options.set_int("MinibatchSize", 32);
        let params = SearchParams::new(&options).unwrap();
        assert_eq!(params.cpuct(false), 2.0);
        assert_eq!(params.cpuct(true), 3.0);
        assert_eq!(params.fpu_strategy(true), FpuStrategy::Absolute);
        assert_eq!(params.minibatch_size(), 32);
    }

    #[test]
    fn int_coerces_to_float() {
        let mut options = OptionsDict::default();
        options.set_int("CPuct", 2);
        let params = SearchParams::new(&options).unwrap();
        assert_eq!(params.cpuct(false), 2.0);
    }

    #[test]
    fn invalid_enum_is_fatal() {
        let mut options = OptionsDict::default();
        options.set_str("ContemptMode", "aggressive");
        assert!(matches!(
            SearchParams::new(&options),
            Err(OptionsError::InvalidValue { key: "ContemptMode", .. })
        ));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut options = OptionsDict::default();
        options.set_str("NotARealOption", "whatever");
        assert!(SearchParams::new(&options).is_ok());
    }

    #[test]
    fn wrong_type_is_fatal() {
        let mut options = OptionsDict::default();
        options.set_str("MinibatchSize", "lots");
        assert!(matches!(
            SearchParams::new(&options),
            Err(OptionsError::WrongType { key: "MinibatchSize" })
        ));
    }
}
