//! Per-stage metric computations.

use rayon::prelude::*;

use super::fit::{fit_all, fit_exponential};
use super::report::{
    ConvergenceAnalysis, EffectivenessMetrics, Estimate, LearningCurve, PairwiseComparison,
    Responsiveness,
};
use super::stats::{
    adjust_p_values, bootstrap_ci, bootstrap_ci_indexed, bootstrap_ci_two_sample, cliffs_delta,
    hedges_g, linear_regression, mann_whitney, mean, pearson, stable_seed, t_interval, variance,
    wilson_interval, z_critical,
};
use super::{AnalysisConfig, ComparisonSample, InterpretationThresholds};
use crate::difficulty::DifficultyMapper;
use crate::simulation::InteractionRecord;
use crate::types::{DifficultyLevel, LevelTransition};

/// Minimum observations per agent for a pairwise comparison
const MIN_COMPARISON_SAMPLE: usize = 3;

pub(crate) struct StageContext<'a> {
    pub config: &'a AnalysisConfig,
    pub mapper: &'a DifficultyMapper,
    pub oscillation_window: u32,
}

impl StageContext<'_> {
    fn seed(&self, agent_id: &str, tag: u64) -> u64 {
        self.config.seed ^ stable_seed(agent_id) ^ tag.wrapping_mul(0x9E37_79B9_7F4A_7C15)
    }

    fn thresholds(&self) -> &InterpretationThresholds {
        &self.config.thresholds
    }
}

#[derive(Debug, Clone, Copy)]
struct LevelPoint {
    turn: u32,
    score: f64,
    level: DifficultyLevel,
}

/// Columns of one agent's run, with unusable cells dropped per metric.
#[derive(Debug, Clone)]
pub(crate) struct AgentSeries {
    pub agent_id: String,
    pub record_count: usize,
    pub missing_scores: usize,
    turns: Vec<f64>,
    scores: Vec<f64>,
    abs_deltas: Vec<f64>,
    polarity: Vec<f64>,
    signed_deltas: Vec<f64>,
    levels: Vec<LevelPoint>,
    level_sequence: Vec<(u32, DifficultyLevel)>,
    logged_transitions: Vec<(u32, LevelTransition)>,
    starting_score: Option<f64>,
}

impl AgentSeries {
    pub fn from_records(agent_id: String, rows: &[&InteractionRecord]) -> Self {
        let mut series = Self {
            agent_id,
            record_count: rows.len(),
            missing_scores: 0,
            turns: Vec::new(),
            scores: Vec::new(),
            abs_deltas: Vec::new(),
            polarity: Vec::new(),
            signed_deltas: Vec::new(),
            levels: Vec::new(),
            level_sequence: Vec::new(),
            logged_transitions: Vec::new(),
            starting_score: None,
        };

        for row in rows {
            match row.comprehension_score {
                Some(score) => {
                    if series.starting_score.is_none() {
                        series.starting_score =
                            Some((score - row.score_delta.unwrap_or(0.0)).clamp(0.0, 100.0));
                    }
                    series.turns.push(row.turn_number as f64);
                    series.scores.push(score);
                    if let Some(level) = row.difficulty_level {
                        series.levels.push(LevelPoint {
                            turn: row.turn_number,
                            score,
                            level,
                        });
                    }
                }
                None => series.missing_scores += 1,
            }
            if let Some(delta) = row.score_delta {
                series.abs_deltas.push(delta.abs());
                if let Some(emoji) = row.emoji_feedback {
                    series.polarity.push(emoji.polarity() as f64);
                    series.signed_deltas.push(delta);
                }
            }
            if let Some(level) = row.difficulty_level {
                series.level_sequence.push((row.turn_number, level));
            }
            if let Some(transition) = row.level_transition {
                series.logged_transitions.push((row.turn_number, transition));
            }
        }
        series
    }

    /// Level changes, preferring the level column over the logged transition column.
    fn transitions(&self) -> Vec<(u32, LevelTransition)> {
        if self.level_sequence.len() >= 2 {
            self.level_sequence
                .windows(2)
                .filter(|w| w[0].1 != w[1].1)
                .map(|w| {
                    (
                        w[1].0,
                        LevelTransition {
                            from: w[0].1,
                            to: w[1].1,
                        },
                    )
                })
                .collect()
        } else {
            self.logged_transitions.clone()
        }
    }

    fn has_level_data(&self) -> bool {
        !self.level_sequence.is_empty() || !self.logged_transitions.is_empty()
    }
}

fn tail<T>(values: &[T], k: usize) -> &[T] {
    &values[values.len().saturating_sub(k)..]
}

fn band(value: f64, high: f64, moderate: f64, labels: [&str; 3]) -> String {
    if value >= high {
        labels[0].to_string()
    } else if value >= moderate {
        labels[1].to_string()
    } else {
        labels[2].to_string()
    }
}

// ==================== Stage 1: adaptation effectiveness ====================

pub(crate) fn effectiveness_all(
    series: &[AgentSeries],
    ctx: &StageContext<'_>,
) -> Vec<(EffectivenessMetrics, Vec<String>)> {
    series.par_iter().map(|s| effectiveness(s, ctx)).collect()
}

fn effectiveness(s: &AgentSeries, ctx: &StageContext<'_>) -> (EffectivenessMetrics, Vec<String>) {
    let cfg = ctx.config;
    let th = ctx.thresholds();
    let id = &s.agent_id;
    let mut notes = Vec::new();
    let n = s.scores.len();

    let convergence_rate = fit_exponential(&s.turns, &s.scores)
        .and_then(|f| f.parameter("k"))
        .map(|k| {
            let ci = bootstrap_ci_indexed(
                n,
                |idx| {
                    let mut idx = idx.to_vec();
                    idx.sort_unstable();
                    let t: Vec<f64> = idx.iter().map(|&i| s.turns[i]).collect();
                    let y: Vec<f64> = idx.iter().map(|&i| s.scores[i]).collect();
                    fit_exponential(&t, &y).and_then(|f| f.parameter("k"))
                },
                cfg.bootstrap_resamples,
                ctx.seed(id, 1),
                cfg.alpha,
            );
            let reading = band(
                k,
                th.convergence_rate_fast,
                th.convergence_rate_moderate,
                ["fast convergence", "moderate convergence", "slow or no convergence"],
            );
            Estimate::new(k, reading).with_ci(ci)
        });
    if convergence_rate.is_none() {
        notes.push(format!("{id}: convergence rate needs at least 4 scored turns"));
    }

    let window = tail(&s.scores, cfg.final_window);
    let stability_of = |w: &[f64]| variance(w).map(|v| 1.0 / (1.0 + v));
    let stability_index = stability_of(window).map(|value| {
        let ci = bootstrap_ci(
            window,
            stability_of,
            cfg.bootstrap_resamples,
            ctx.seed(id, 2),
            cfg.alpha,
        );
        let reading = band(
            value,
            th.stability_high,
            th.stability_moderate,
            ["stable", "moderately stable", "unstable"],
        );
        Estimate::new(value, reading).with_ci(ci)
    });
    if stability_index.is_none() {
        notes.push(format!("{id}: stability index needs at least 2 scored turns"));
    }

    let adaptation_speed = mean(&s.abs_deltas).map(|value| {
        let ci = bootstrap_ci(
            &s.abs_deltas,
            mean,
            cfg.bootstrap_resamples,
            ctx.seed(id, 3),
            cfg.alpha,
        );
        let reading = band(
            value,
            th.adaptation_speed_fast,
            th.adaptation_speed_moderate,
            ["fast adaptation", "moderate adaptation", "slow adaptation"],
        );
        Estimate::new(value, reading).with_ci(ci)
    });
    if adaptation_speed.is_none() {
        notes.push(format!("{id}: adaptation speed needs score deltas"));
    }

    let final_performance = t_interval(tail(&s.scores, cfg.final_performance_window), cfg.alpha)
        .map(|(m, lo, hi)| {
            let level = ctx.mapper.level_for_score(m);
            Estimate::new(m, format!("ends in the {level} band")).with_ci(Some((lo, hi)))
        });
    if final_performance.is_none() {
        notes.push(format!("{id}: final performance needs at least 2 scored turns"));
    }

    let learning_efficiency = match (s.starting_score, s.scores.last()) {
        (Some(start), Some(last)) if n > 0 => {
            let value = (last - start) / n as f64;
            let p_value = linear_regression(&s.turns, &s.scores).and_then(|r| r.p_value);
            let reading = if value >= th.efficiency_rapid {
                "rapid improvement"
            } else if value >= th.efficiency_gradual {
                "gradual improvement"
            } else if value > th.efficiency_decline {
                "flat"
            } else {
                "declining"
            };
            Some(Estimate::new(value, reading).with_p(p_value))
        }
        _ => None,
    };
    if learning_efficiency.is_none() {
        notes.push(format!("{id}: learning efficiency needs scored turns"));
    }

    let hysteresis_index = hysteresis_index(s, ctx);
    if hysteresis_index.is_none() {
        notes.push(format!("{id}: hysteresis index needs level data over at least 2 turns"));
    }

    (
        EffectivenessMetrics {
            convergence_rate,
            stability_index,
            adaptation_speed,
            final_performance,
            learning_efficiency,
            hysteresis_index,
        },
        notes,
    )
}

fn hysteresis_index(s: &AgentSeries, ctx: &StageContext<'_>) -> Option<Estimate> {
    if !s.has_level_data() {
        return None;
    }
    let opportunities = s.record_count.checked_sub(1).filter(|n| *n > 0)?;
    let transitions = s.transitions();
    let oscillations = transitions
        .windows(2)
        .filter(|w| {
            w[0].1.is_reversed_by(&w[1].1) && w[1].0.saturating_sub(w[0].0) < ctx.oscillation_window
        })
        .count()
        .min(opportunities);

    let frequency = oscillations as f64 / opportunities as f64;
    let value = 1.0 - frequency;
    let ci = wilson_interval(oscillations, opportunities, z_critical(ctx.config.alpha))
        .map(|(lo, hi)| (1.0 - hi, 1.0 - lo));
    let th = ctx.thresholds();
    let reading = band(
        value,
        th.hysteresis_clean,
        th.hysteresis_occasional,
        ["no runaway oscillation", "occasional oscillation", "frequent oscillation"],
    );
    Some(Estimate::new(value, reading).with_ci(ci))
}

// ==================== Stage 2: convergence ====================

pub(crate) fn convergence_all(
    series: &[AgentSeries],
    ctx: &StageContext<'_>,
) -> Vec<(ConvergenceAnalysis, Vec<String>)> {
    series.par_iter().map(|s| convergence(s, ctx)).collect()
}

fn convergence(s: &AgentSeries, ctx: &StageContext<'_>) -> (ConvergenceAnalysis, Vec<String>) {
    let cfg = ctx.config;
    let tolerance = cfg.convergence_tolerance;
    let mut result = ConvergenceAnalysis {
        tolerance,
        ..Default::default()
    };

    let n = s.scores.len();
    if n < cfg.final_window {
        return (
            result,
            vec![format!(
                "{}: convergence needs at least {} scored turns, found {n}",
                s.agent_id, cfg.final_window
            )],
        );
    }
    let Some((asymptote, lo, hi)) = t_interval(tail(&s.scores, cfg.final_window), cfg.alpha) else {
        return (
            result,
            vec![format!("{}: final window has no spread estimate", s.agent_id)],
        );
    };
    let level = ctx.mapper.level_for_score(asymptote);
    result.asymptote = Some(
        Estimate::new(asymptote, format!("final-window mean in the {level} band"))
            .with_ci(Some((lo, hi))),
    );

    // first turn of the longest suffix that stays inside the band
    let entry_turn = |target: f64| -> Option<f64> {
        let mut start = n;
        while start > 0 && (s.scores[start - 1] - target).abs() <= tolerance {
            start -= 1;
        }
        (n - start >= cfg.final_window).then(|| s.turns[start])
    };

    if let Some(turn) = entry_turn(asymptote) {
        let candidates: Vec<f64> = [Some(turn), entry_turn(lo), entry_turn(hi)]
            .into_iter()
            .flatten()
            .collect();
        let min = candidates.iter().copied().fold(f64::INFINITY, f64::min);
        let max = candidates.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        result.converged = true;
        result.convergence_turn = Some(
            Estimate::new(
                turn,
                format!("stays within ±{tolerance} of {asymptote:.1} from turn {turn}"),
            )
            .with_ci(Some((min, max))),
        );
    }
    (result, Vec::new())
}

// ==================== Stage 3: responsiveness ====================

pub(crate) fn responsiveness_all(
    series: &[AgentSeries],
    ctx: &StageContext<'_>,
) -> Vec<(Responsiveness, Vec<String>)> {
    series.par_iter().map(|s| responsiveness(s, ctx)).collect()
}

fn responsiveness(s: &AgentSeries, ctx: &StageContext<'_>) -> (Responsiveness, Vec<String>) {
    let cfg = ctx.config;
    let th = ctx.thresholds();
    let id = &s.agent_id;
    let mut notes = Vec::new();
    let mut result = Responsiveness::default();

    if s.levels.len() >= 2 {
        let mut lags: Vec<f64> = Vec::new();
        let mut absorbed = 0;
        let mut open: Option<(u32, DifficultyLevel)> = None;
        let mut previous: Option<DifficultyLevel> = None;

        for point in &s.levels {
            let raw = ctx.mapper.level_for_score(point.score);
            let moved = previous.is_some_and(|p| p != point.level);
            match open {
                Some((start, target)) => {
                    if point.level == target {
                        lags.push(point.turn.saturating_sub(start) as f64);
                        open = None;
                    } else if raw == point.level {
                        absorbed += 1;
                        open = None;
                    } else if raw != target {
                        open = Some((start, raw));
                    }
                }
                None if moved => lags.push(0.0),
                None => {}
            }
            if open.is_none() && raw != point.level {
                open = Some((point.turn, raw));
            }
            previous = Some(point.level);
        }

        result.lag_episodes = lags.len();
        result.absorbed_crossings = absorbed;
        result.mean_lag_turns = mean(&lags).map(|value| {
            let ci = bootstrap_ci(
                &lags,
                mean,
                cfg.bootstrap_resamples,
                ctx.seed(id, 4),
                cfg.alpha,
            );
            let reading = if value <= th.lag_prompt {
                "prompt"
            } else if value <= th.lag_moderate {
                "moderate lag"
            } else {
                "sluggish"
            };
            Estimate::new(value, reading).with_ci(ci)
        });
        if result.mean_lag_turns.is_none() {
            notes.push(format!("{id}: no completed band crossings to measure lag"));
        }
    } else {
        notes.push(format!("{id}: lag needs scores and levels over at least 2 turns"));
    }

    result.polarity_delta_correlation =
        pearson(&s.polarity, &s.signed_deltas, cfg.alpha).map(|c| {
            let strength = if c.r.abs() >= th.correlation_strong {
                "strong"
            } else if c.r.abs() >= th.correlation_moderate {
                "moderate"
            } else if c.r.abs() >= th.correlation_weak {
                "weak"
            } else {
                "negligible"
            };
            let direction = if c.r >= 0.0 { "positive" } else { "negative" };
            Estimate::new(c.r, format!("{strength} {direction} correlation"))
                .with_ci(c.ci_low.zip(c.ci_high))
                .with_p(Some(c.p_value))
        });
    if result.polarity_delta_correlation.is_none() {
        notes.push(format!(
            "{id}: correlation needs at least 3 emoji/delta pairs with spread in both"
        ));
    }

    (result, notes)
}

// ==================== Stage 4: cross-profile comparison ====================

struct RawComparison {
    a: usize,
    b: usize,
    u: f64,
    z: f64,
    p_value: f64,
    cliffs: Estimate,
    hedges: Option<Estimate>,
}

fn effect_label(value: f64, small: f64, medium: f64, large: f64) -> &'static str {
    let v = value.abs();
    if v >= large {
        "large"
    } else if v >= medium {
        "medium"
    } else if v >= small {
        "small"
    } else {
        "negligible"
    }
}

pub(crate) fn compare_agents(
    series: &[AgentSeries],
    ctx: &StageContext<'_>,
) -> (Vec<PairwiseComparison>, Vec<String>) {
    let cfg = ctx.config;
    let th = ctx.thresholds();
    let mut notes = Vec::new();
    if series.len() < 2 {
        notes.push("fewer than two agents, nothing to compare".to_string());
        return (Vec::new(), notes);
    }

    let samples: Vec<&[f64]> = series
        .iter()
        .map(|s| match cfg.comparison_sample {
            ComparisonSample::AllTurns => s.scores.as_slice(),
            ComparisonSample::FinalWindow => tail(&s.scores, cfg.final_window),
        })
        .collect();

    let pairs: Vec<(usize, usize)> = (0..series.len())
        .flat_map(|a| ((a + 1)..series.len()).map(move |b| (a, b)))
        .collect();

    let results: Vec<Option<RawComparison>> = pairs
        .par_iter()
        .map(|&(a, b)| {
            let (xa, xb) = (samples[a], samples[b]);
            if xa.len() < MIN_COMPARISON_SAMPLE || xb.len() < MIN_COMPARISON_SAMPLE {
                return None;
            }
            let mw = mann_whitney(xa, xb)?;
            let delta = cliffs_delta(xa, xb)?;
            let seed = cfg.seed
                ^ stable_seed(&series[a].agent_id)
                ^ stable_seed(&series[b].agent_id).rotate_left(17);
            let ci = bootstrap_ci_two_sample(
                xa,
                xb,
                cliffs_delta,
                cfg.bootstrap_resamples,
                seed,
                cfg.alpha,
            );
            let cliffs = Estimate::new(
                delta,
                format!(
                    "{} effect",
                    effect_label(delta, th.cliffs_small, th.cliffs_medium, th.cliffs_large)
                ),
            )
            .with_ci(ci)
            .with_p(Some(mw.p_value));

            let z = z_critical(cfg.alpha);
            let hedges = hedges_g(xa, xb).map(|h| {
                Estimate::new(
                    h.g,
                    format!(
                        "{} effect",
                        effect_label(h.g, th.hedges_small, th.hedges_medium, th.hedges_large)
                    ),
                )
                .with_ci(Some((h.g - z * h.se, h.g + z * h.se)))
            });

            Some(RawComparison {
                a,
                b,
                u: mw.u,
                z: mw.z,
                p_value: mw.p_value,
                cliffs,
                hedges,
            })
        })
        .collect();

    let mut computed = Vec::new();
    for (&(a, b), result) in pairs.iter().zip(results) {
        match result {
            Some(raw) => computed.push(raw),
            None => notes.push(format!(
                "{} vs {}: each side needs at least {MIN_COMPARISON_SAMPLE} scores",
                series[a].agent_id, series[b].agent_id
            )),
        }
    }

    let raw_p: Vec<f64> = computed.iter().map(|c| c.p_value).collect();
    let adjusted = adjust_p_values(&raw_p, cfg.correction);

    let comparisons = computed
        .into_iter()
        .zip(adjusted)
        .map(|(raw, adjusted_p_value)| {
            let (name_a, name_b) = (&series[raw.a].agent_id, &series[raw.b].agent_id);
            let significant = adjusted_p_value < cfg.alpha;
            let verdict = if significant {
                "significant difference"
            } else {
                "no significant difference"
            };
            let direction = if raw.cliffs.value > 0.0 {
                format!("{name_a} tends to score higher")
            } else if raw.cliffs.value < 0.0 {
                format!("{name_b} tends to score higher")
            } else {
                "neither tends to score higher".to_string()
            };
            PairwiseComparison {
                agent_a: name_a.clone(),
                agent_b: name_b.clone(),
                n_a: samples[raw.a].len(),
                n_b: samples[raw.b].len(),
                mann_whitney_u: raw.u,
                z: raw.z,
                p_value: raw.p_value,
                adjusted_p_value,
                significant,
                interpretation: format!(
                    "{verdict} at alpha {} ({} correction); {}, {direction}",
                    cfg.alpha,
                    cfg.correction.as_str(),
                    raw.cliffs.interpretation
                ),
                cliffs_delta: raw.cliffs,
                hedges_g: raw.hedges,
            }
        })
        .collect();

    (comparisons, notes)
}

// ==================== Stage 5: learning curve ====================

pub(crate) fn learning_curve_all(
    series: &[AgentSeries],
    ctx: &StageContext<'_>,
) -> Vec<(LearningCurve, Vec<String>)> {
    series.par_iter().map(|s| learning_curve(s, ctx)).collect()
}

fn learning_curve(s: &AgentSeries, ctx: &StageContext<'_>) -> (LearningCurve, Vec<String>) {
    let cfg = ctx.config;
    let id = &s.agent_id;
    let mut notes = Vec::new();

    let (candidates, best_fit) = fit_all(&s.turns, &s.scores);
    if best_fit.is_none() {
        notes.push(format!("{id}: curve fitting needs at least 3 scored turns"));
    }

    let window_t = tail(&s.turns, cfg.final_window);
    let window_y = tail(&s.scores, cfg.final_window);
    let final_slope = if window_t.len() >= 3 {
        linear_regression(window_t, window_y).map(|r| {
            let reading = if r.slope.abs() < cfg.plateau_slope_threshold {
                "plateaued"
            } else if r.slope > 0.0 {
                "still improving"
            } else {
                "still declining"
            };
            Estimate::new(r.slope, reading)
                .with_ci(r.slope_interval(cfg.alpha))
                .with_p(r.p_value)
        })
    } else {
        None
    };
    if final_slope.is_none() {
        notes.push(format!("{id}: plateau check needs at least 3 scored turns"));
    }
    let plateaued = final_slope
        .as_ref()
        .map(|e| e.value.abs() < cfg.plateau_slope_threshold);

    (
        LearningCurve {
            best_fit,
            candidates,
            final_slope,
            plateaued,
        },
        notes,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Emoji;

    fn record(turn: u32, score: f64, level: DifficultyLevel) -> InteractionRecord {
        InteractionRecord {
            agent_id: "a".to_string(),
            turn_number: turn,
            emoji_feedback: Some(Emoji::Neutral),
            comprehension_score: Some(score),
            difficulty_level: Some(level),
            score_delta: Some(0.2),
            level_transition: None,
            processing_time_ms: None,
            timestamp: None,
        }
    }

    fn ctx<'a>(config: &'a AnalysisConfig, mapper: &'a DifficultyMapper) -> StageContext<'a> {
        StageContext {
            config,
            mapper,
            oscillation_window: 2,
        }
    }

    #[test]
    fn test_lag_counts_held_crossings() {
        use DifficultyLevel::*;
        // crosses into good at turn 2, level follows at turn 3; dips back below at 5 and recovers
        let rows = vec![
            record(1, 69.0, Normal),
            record(2, 70.5, Normal),
            record(3, 70.7, Good),
            record(4, 71.0, Good),
            record(5, 69.8, Good),
            record(6, 71.2, Good),
        ];
        let refs: Vec<&InteractionRecord> = rows.iter().collect();
        let series = AgentSeries::from_records("a".to_string(), &refs);
        let config = AnalysisConfig::default();
        let mapper = DifficultyMapper::default();
        let (result, _) = responsiveness(&series, &ctx(&config, &mapper));
        assert_eq!(result.lag_episodes, 1);
        assert_eq!(result.absorbed_crossings, 1);
        assert_eq!(result.mean_lag_turns.unwrap().value, 1.0);
    }

    #[test]
    fn test_hysteresis_index_counts_quick_reversals() {
        use DifficultyLevel::*;
        let rows = vec![
            record(1, 50.0, Normal),
            record(2, 72.0, Good),
            record(3, 50.0, Normal),
            record(4, 50.0, Normal),
            record(5, 50.0, Normal),
        ];
        let refs: Vec<&InteractionRecord> = rows.iter().collect();
        let series = AgentSeries::from_records("a".to_string(), &refs);
        let config = AnalysisConfig::default();
        let mapper = DifficultyMapper::default();
        let index = hysteresis_index(&series, &ctx(&config, &mapper)).unwrap();
        assert!((index.value - 0.75).abs() < 1e-12);
        assert_eq!(index.interpretation, "frequent oscillation");
    }

    #[test]
    fn test_series_keeps_rows_without_scores_out_of_fits() {
        let mut rows = vec![record(1, 50.0, DifficultyLevel::Normal)];
        rows.push(InteractionRecord {
            comprehension_score: None,
            ..record(2, 0.0, DifficultyLevel::Normal)
        });
        let refs: Vec<&InteractionRecord> = rows.iter().collect();
        let series = AgentSeries::from_records("a".to_string(), &refs);
        assert_eq!(series.missing_scores, 1);
        assert_eq!(series.scores, vec![50.0]);
        assert!((series.starting_score.unwrap() - 49.8).abs() < 1e-9);
    }
}
