//! Analysis report types and the Markdown rendering.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use super::fit::CurveFit;
use super::AnalysisConfig;
use crate::error::{EbarsError, Result};

/// A point estimate with its uncertainty and a fixed-threshold reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub value: f64,
    pub ci_low: Option<f64>,
    pub ci_high: Option<f64>,
    pub p_value: Option<f64>,
    pub interpretation: String,
}

impl Estimate {
    pub fn new(value: f64, interpretation: impl Into<String>) -> Self {
        Self {
            value,
            ci_low: None,
            ci_high: None,
            p_value: None,
            interpretation: interpretation.into(),
        }
    }

    pub fn with_ci(mut self, ci: Option<(f64, f64)>) -> Self {
        if let Some((lo, hi)) = ci {
            self.ci_low = Some(lo);
            self.ci_high = Some(hi);
        }
        self
    }

    pub fn with_p(mut self, p_value: Option<f64>) -> Self {
        self.p_value = p_value;
        self
    }

    fn render(&self) -> String {
        let mut out = format!("{:.3}", self.value);
        if let (Some(lo), Some(hi)) = (self.ci_low, self.ci_high) {
            let _ = write!(out, " [{lo:.3}, {hi:.3}]");
        }
        if let Some(p) = self.p_value {
            let _ = write!(out, " (p={})", format_p(p));
        }
        let _ = write!(out, " {}", self.interpretation);
        out
    }
}

fn format_p(p: f64) -> String {
    if p < 1e-4 {
        "<0.0001".to_string()
    } else {
        format!("{p:.4}")
    }
}

fn cell(estimate: &Option<Estimate>) -> String {
    estimate
        .as_ref()
        .map(Estimate::render)
        .unwrap_or_else(|| "n/a".to_string())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EffectivenessMetrics {
    /// Rate `k` of the exponential approach fit
    pub convergence_rate: Option<Estimate>,
    /// 1 / (1 + variance of the final window)
    pub stability_index: Option<Estimate>,
    /// Mean absolute score delta
    pub adaptation_speed: Option<Estimate>,
    pub final_performance: Option<Estimate>,
    /// Total improvement per turn
    pub learning_efficiency: Option<Estimate>,
    /// 1 - frequency of quick level reversals
    pub hysteresis_index: Option<Estimate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceAnalysis {
    pub asymptote: Option<Estimate>,
    pub tolerance: f64,
    pub converged: bool,
    /// Turn from which the score stays inside the tolerance band
    pub convergence_turn: Option<Estimate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Responsiveness {
    /// Turns between the score crossing into a new band and the level following it
    pub mean_lag_turns: Option<Estimate>,
    pub lag_episodes: usize,
    /// Crossings the score undid before the level moved
    pub absorbed_crossings: usize,
    pub polarity_delta_correlation: Option<Estimate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearningCurve {
    pub best_fit: Option<CurveFit>,
    pub candidates: Vec<CurveFit>,
    /// Slope of the final window, points per turn
    pub final_slope: Option<Estimate>,
    pub plateaued: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentAnalysis {
    pub agent_id: String,
    pub turns: usize,
    pub effectiveness: EffectivenessMetrics,
    pub convergence: ConvergenceAnalysis,
    pub responsiveness: Responsiveness,
    pub learning_curve: LearningCurve,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairwiseComparison {
    pub agent_a: String,
    pub agent_b: String,
    pub n_a: usize,
    pub n_b: usize,
    pub mann_whitney_u: f64,
    pub z: f64,
    pub p_value: f64,
    pub adjusted_p_value: f64,
    pub significant: bool,
    /// Positive when `agent_a` tends to score higher
    pub cliffs_delta: Estimate,
    pub hedges_g: Option<Estimate>,
    pub interpretation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    /// Ran, but at least one metric fell back to null
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: super::AnalysisStage,
    pub status: StageStatus,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub config: AnalysisConfig,
    pub total_records: usize,
    pub agents: Vec<AgentAnalysis>,
    pub comparisons: Vec<PairwiseComparison>,
    pub stages: Vec<StageOutcome>,
    pub notes: Vec<String>,
}

impl AnalysisReport {
    pub fn agent(&self, agent_id: &str) -> Option<&AgentAnalysis> {
        self.agents.iter().find(|a| a.agent_id == agent_id)
    }

    pub fn comparison(&self, a: &str, b: &str) -> Option<&PairwiseComparison> {
        self.comparisons.iter().find(|c| {
            (c.agent_a == a && c.agent_b == b) || (c.agent_a == b && c.agent_b == a)
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| EbarsError::Interchange(e.to_string()))
    }

    pub fn render_markdown(&self) -> String {
        let mut md = String::new();
        let cfg = &self.config;
        let _ = writeln!(md, "# EBARS Simulation Analysis\n");
        let _ = writeln!(
            md,
            "{} records, {} agents. Final window {} turns, tolerance {:.1} points, alpha {}, correction {}, {} bootstrap resamples (seed {}).\n",
            self.total_records,
            self.agents.len(),
            cfg.final_window,
            cfg.convergence_tolerance,
            cfg.alpha,
            cfg.correction.as_str(),
            cfg.bootstrap_resamples,
            cfg.seed,
        );

        let _ = writeln!(md, "## Adaptation effectiveness\n");
        let _ = writeln!(
            md,
            "| Agent | Convergence rate | Stability | Adaptation speed | Final performance | Efficiency | Hysteresis |"
        );
        let _ = writeln!(md, "|---|---|---|---|---|---|---|");
        for agent in &self.agents {
            let e = &agent.effectiveness;
            let _ = writeln!(
                md,
                "| {} | {} | {} | {} | {} | {} | {} |",
                agent.agent_id,
                cell(&e.convergence_rate),
                cell(&e.stability_index),
                cell(&e.adaptation_speed),
                cell(&e.final_performance),
                cell(&e.learning_efficiency),
                cell(&e.hysteresis_index),
            );
        }

        let _ = writeln!(md, "\n## Convergence\n");
        for agent in &self.agents {
            let c = &agent.convergence;
            let status = if c.converged { "converged" } else { "not converged" };
            let _ = writeln!(
                md,
                "- **{}**: {}; asymptote {}; turn {}",
                agent.agent_id,
                status,
                cell(&c.asymptote),
                cell(&c.convergence_turn),
            );
        }

        let _ = writeln!(md, "\n## Responsiveness\n");
        for agent in &self.agents {
            let r = &agent.responsiveness;
            let _ = writeln!(
                md,
                "- **{}**: lag {} over {} crossings ({} absorbed); polarity/delta correlation {}",
                agent.agent_id,
                cell(&r.mean_lag_turns),
                r.lag_episodes,
                r.absorbed_crossings,
                cell(&r.polarity_delta_correlation),
            );
        }

        if !self.comparisons.is_empty() {
            let _ = writeln!(md, "\n## Cross-profile comparison\n");
            let _ = writeln!(md, "| A | B | U | p | adjusted p | Cliff's delta | Hedges' g |");
            let _ = writeln!(md, "|---|---|---|---|---|---|---|");
            for c in &self.comparisons {
                let _ = writeln!(
                    md,
                    "| {} | {} | {:.1} | {} | {} | {} | {} |",
                    c.agent_a,
                    c.agent_b,
                    c.mann_whitney_u,
                    format_p(c.p_value),
                    format_p(c.adjusted_p_value),
                    c.cliffs_delta.render(),
                    cell(&c.hedges_g),
                );
            }
        }

        let _ = writeln!(md, "\n## Learning curves\n");
        for agent in &self.agents {
            let lc = &agent.learning_curve;
            let best = lc
                .best_fit
                .as_ref()
                .map(|f| format!("{} (R²={:.3})", f.model.as_str(), f.r_squared))
                .unwrap_or_else(|| "n/a".to_string());
            let plateau = match lc.plateaued {
                Some(true) => "plateaued",
                Some(false) => "still moving",
                None => "unknown",
            };
            let _ = writeln!(
                md,
                "- **{}**: best fit {}; final slope {}; {}",
                agent.agent_id,
                best,
                cell(&lc.final_slope),
                plateau
            );
        }

        let _ = writeln!(md, "\n## Stages\n");
        for stage in &self.stages {
            let status = match stage.status {
                StageStatus::Completed => "completed",
                StageStatus::Degraded => "degraded",
            };
            let _ = writeln!(md, "- {}: {}", stage.stage.as_str(), status);
            for note in &stage.notes {
                let _ = writeln!(md, "  - {note}");
            }
        }

        if !self.notes.is_empty() {
            let _ = writeln!(md, "\n## Notes\n");
            for note in &self.notes {
                let _ = writeln!(md, "- {note}");
            }
        }
        md
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_render() {
        let e = Estimate::new(0.5, "moderate")
            .with_ci(Some((0.25, 0.75)))
            .with_p(Some(0.00001));
        assert_eq!(e.render(), "0.500 [0.250, 0.750] (p=<0.0001) moderate");
        assert_eq!(cell(&None), "n/a");
    }
}
