//! Analysis Engine
//!
//! Read-only statistics over interaction records. Five stages run in a fixed
//! order; each one tolerates missing columns and short runs by leaving the
//! affected metric empty and recording a note, so one bad agent never aborts
//! the report.
//!
//! Every interpretation string is derived from [`InterpretationThresholds`],
//! which is echoed into the report with the rest of [`AnalysisConfig`].

pub mod fit;
pub mod report;
mod stages;
pub mod stats;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::EbarsConfig;
use crate::difficulty::DifficultyMapper;
use crate::error::{EbarsError, Result};
use crate::simulation::InteractionRecord;

pub use fit::{CurveFit, CurveModel};
pub use report::{
    AgentAnalysis, AnalysisReport, ConvergenceAnalysis, EffectivenessMetrics, Estimate,
    LearningCurve, PairwiseComparison, Responsiveness, StageOutcome, StageStatus,
};
pub use stats::CorrectionMethod;

use stages::{AgentSeries, StageContext};

/// Which scores represent an agent in pairwise comparisons.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonSample {
    #[default]
    AllTurns,
    FinalWindow,
}

/// Fixed cut points for the human-readable interpretation strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpretationThresholds {
    pub convergence_rate_fast: f64,
    pub convergence_rate_moderate: f64,
    pub stability_high: f64,
    pub stability_moderate: f64,
    pub adaptation_speed_fast: f64,
    pub adaptation_speed_moderate: f64,
    pub efficiency_rapid: f64,
    pub efficiency_gradual: f64,
    pub efficiency_decline: f64,
    pub hysteresis_clean: f64,
    pub hysteresis_occasional: f64,
    pub lag_prompt: f64,
    pub lag_moderate: f64,
    pub correlation_strong: f64,
    pub correlation_moderate: f64,
    pub correlation_weak: f64,
    pub cliffs_small: f64,
    pub cliffs_medium: f64,
    pub cliffs_large: f64,
    pub hedges_small: f64,
    pub hedges_medium: f64,
    pub hedges_large: f64,
}

impl Default for InterpretationThresholds {
    fn default() -> Self {
        Self {
            convergence_rate_fast: 0.3,
            convergence_rate_moderate: 0.1,
            stability_high: 0.25,
            stability_moderate: 0.05,
            adaptation_speed_fast: 2.0,
            adaptation_speed_moderate: 1.0,
            efficiency_rapid: 0.5,
            efficiency_gradual: 0.05,
            efficiency_decline: -0.05,
            hysteresis_clean: 0.95,
            hysteresis_occasional: 0.8,
            lag_prompt: 1.0,
            lag_moderate: 2.0,
            correlation_strong: 0.7,
            correlation_moderate: 0.4,
            correlation_weak: 0.2,
            // Romano et al. cut points for Cliff's delta
            cliffs_small: 0.147,
            cliffs_medium: 0.33,
            cliffs_large: 0.474,
            hedges_small: 0.2,
            hedges_medium: 0.5,
            hedges_large: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Trailing turns used for stability, asymptote and plateau
    pub final_window: usize,
    /// Trailing turns averaged for final performance
    pub final_performance_window: usize,
    /// Half-width of the convergence band in score points
    pub convergence_tolerance: f64,
    /// |slope| below which the final window counts as a plateau, points per turn
    pub plateau_slope_threshold: f64,
    pub alpha: f64,
    pub correction: CorrectionMethod,
    pub comparison_sample: ComparisonSample,
    pub bootstrap_resamples: usize,
    pub seed: u64,
    /// Reversal window for the hysteresis index; defaults to the controller's minimum turns
    pub oscillation_window: Option<u32>,
    pub thresholds: InterpretationThresholds,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            final_window: 5,
            final_performance_window: 3,
            convergence_tolerance: 5.0,
            plateau_slope_threshold: 0.1,
            alpha: 0.05,
            correction: CorrectionMethod::None,
            comparison_sample: ComparisonSample::AllTurns,
            bootstrap_resamples: 500,
            seed: 42,
            oscillation_window: None,
            thresholds: InterpretationThresholds::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<()> {
        if self.final_window < 2 {
            return Err(EbarsError::InvalidConfig(
                "final_window must be at least 2".to_string(),
            ));
        }
        if self.final_performance_window == 0 {
            return Err(EbarsError::InvalidConfig(
                "final_performance_window must be positive".to_string(),
            ));
        }
        if !self.convergence_tolerance.is_finite() || self.convergence_tolerance <= 0.0 {
            return Err(EbarsError::InvalidConfig(
                "convergence_tolerance must be positive".to_string(),
            ));
        }
        if !self.plateau_slope_threshold.is_finite() || self.plateau_slope_threshold <= 0.0 {
            return Err(EbarsError::InvalidConfig(
                "plateau_slope_threshold must be positive".to_string(),
            ));
        }
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(EbarsError::InvalidConfig(
                "alpha must lie strictly between 0 and 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Analysis stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStage {
    Effectiveness,
    Convergence,
    Responsiveness,
    Comparison,
    LearningCurve,
}

impl AnalysisStage {
    pub const ALL: [AnalysisStage; 5] = [
        AnalysisStage::Effectiveness,
        AnalysisStage::Convergence,
        AnalysisStage::Responsiveness,
        AnalysisStage::Comparison,
        AnalysisStage::LearningCurve,
    ];

    pub fn first() -> Self {
        Self::Effectiveness
    }

    pub fn next(self) -> Option<Self> {
        match self {
            Self::Effectiveness => Some(Self::Convergence),
            Self::Convergence => Some(Self::Responsiveness),
            Self::Responsiveness => Some(Self::Comparison),
            Self::Comparison => Some(Self::LearningCurve),
            Self::LearningCurve => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Effectiveness => "effectiveness",
            Self::Convergence => "convergence",
            Self::Responsiveness => "responsiveness",
            Self::Comparison => "comparison",
            Self::LearningCurve => "learning_curve",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisEngine {
    config: AnalysisConfig,
    mapper: DifficultyMapper,
    oscillation_window: u32,
}

impl AnalysisEngine {
    /// `ebars` supplies the band thresholds and hysteresis window the records were produced with.
    pub fn new(config: AnalysisConfig, ebars: &EbarsConfig) -> Result<Self> {
        config.validate()?;
        ebars.validate()?;
        let oscillation_window = config
            .oscillation_window
            .unwrap_or(ebars.hysteresis.min_turns_before_change);
        Ok(Self {
            config,
            mapper: DifficultyMapper::from_config(ebars),
            oscillation_window,
        })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn analyze(&self, records: &[InteractionRecord]) -> AnalysisReport {
        let mut notes = Vec::new();
        let series = group_by_agent(records, &mut notes);
        let ctx = StageContext {
            config: &self.config,
            mapper: &self.mapper,
            oscillation_window: self.oscillation_window,
        };

        let mut agents: Vec<AgentAnalysis> = series
            .iter()
            .map(|s| AgentAnalysis {
                agent_id: s.agent_id.clone(),
                turns: s.record_count,
                ..Default::default()
            })
            .collect();
        let mut comparisons = Vec::new();
        let mut outcomes = Vec::new();

        let mut stage = Some(AnalysisStage::first());
        while let Some(current) = stage {
            let stage_notes = match current {
                AnalysisStage::Effectiveness => {
                    apply(&mut agents, stages::effectiveness_all(&series, &ctx), |a, m| {
                        a.effectiveness = m
                    })
                }
                AnalysisStage::Convergence => {
                    apply(&mut agents, stages::convergence_all(&series, &ctx), |a, m| {
                        a.convergence = m
                    })
                }
                AnalysisStage::Responsiveness => {
                    apply(&mut agents, stages::responsiveness_all(&series, &ctx), |a, m| {
                        a.responsiveness = m
                    })
                }
                AnalysisStage::Comparison => {
                    let (pairs, pair_notes) = stages::compare_agents(&series, &ctx);
                    comparisons = pairs;
                    pair_notes
                }
                AnalysisStage::LearningCurve => {
                    apply(&mut agents, stages::learning_curve_all(&series, &ctx), |a, m| {
                        a.learning_curve = m
                    })
                }
            };
            outcomes.push(StageOutcome {
                stage: current,
                status: if stage_notes.is_empty() {
                    StageStatus::Completed
                } else {
                    StageStatus::Degraded
                },
                notes: stage_notes,
            });
            stage = current.next();
        }

        AnalysisReport {
            config: self.config.clone(),
            total_records: records.len(),
            agents,
            comparisons,
            stages: outcomes,
            notes,
        }
    }
}

impl Default for AnalysisEngine {
    fn default() -> Self {
        let ebars = EbarsConfig::default();
        Self {
            config: AnalysisConfig::default(),
            mapper: DifficultyMapper::from_config(&ebars),
            oscillation_window: ebars.hysteresis.min_turns_before_change,
        }
    }
}

fn apply<M>(
    agents: &mut [AgentAnalysis],
    results: Vec<(M, Vec<String>)>,
    mut assign: impl FnMut(&mut AgentAnalysis, M),
) -> Vec<String> {
    let mut notes = Vec::new();
    for (agent, (metrics, agent_notes)) in agents.iter_mut().zip(results) {
        assign(agent, metrics);
        notes.extend(agent_notes);
    }
    notes
}

/// Split records per agent in first-seen order, each sorted by turn.
fn group_by_agent(records: &[InteractionRecord], notes: &mut Vec<String>) -> Vec<AgentSeries> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<&InteractionRecord>> = HashMap::new();
    for record in records {
        let id = if record.agent_id.is_empty() {
            "unknown".to_string()
        } else {
            record.agent_id.clone()
        };
        groups
            .entry(id.clone())
            .or_insert_with(|| {
                order.push(id);
                Vec::new()
            })
            .push(record);
    }

    order
        .into_iter()
        .filter_map(|id| {
            let mut rows = groups.remove(&id)?;
            rows.sort_by_key(|r| r.turn_number);
            let series = AgentSeries::from_records(id, &rows);
            if series.missing_scores > 0 {
                notes.push(format!(
                    "{}: {} of {} records have no comprehension score",
                    series.agent_id, series.missing_scores, series.record_count
                ));
            }
            Some(series)
        })
        .collect()
}
