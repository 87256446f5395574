//! Simulation and analysis integration tests
//!
//! - Seeded runs are reproducible and agent-independent
//! - Interchange formats feed the analysis unchanged
//! - Clearly separated profiles compare as significant with a large effect
//! - Logs missing columns still produce a report with nulls and notes

use ebars_algo::analysis::report::StageStatus;
use ebars_algo::simulation::record::{parse_csv, parse_jsonl, to_csv_string, write_jsonl};
use ebars_algo::simulation::{SimulationConfig, EXTENDED_TURNS};
use ebars_algo::{
    AgentProfile, AgentSpec, AnalysisConfig, AnalysisEngine, AnalysisStage, EbarsConfig, Emoji,
    FeedbackProcessor, InteractionRecord, SimulationEngine,
};

// ============================================================================
// Helpers
// ============================================================================

fn engine(seed: u64, turns: u32) -> SimulationEngine {
    SimulationEngine::new(
        FeedbackProcessor::default(),
        SimulationConfig {
            seed,
            turns,
            ..Default::default()
        },
    )
}

fn synthetic(agent_id: &str, centre: f64, spread: f64, turns: u32) -> Vec<InteractionRecord> {
    let mapper = ebars_algo::DifficultyMapper::default();
    let mut previous = centre;
    (1..=turns)
        .map(|turn| {
            let score = centre + spread * (turn as f64 * 1.7).sin();
            let delta = score - previous;
            previous = score;
            InteractionRecord {
                agent_id: agent_id.to_string(),
                turn_number: turn,
                emoji_feedback: Some(if delta >= 0.0 {
                    Emoji::MildPositive
                } else {
                    Emoji::Negative
                }),
                comprehension_score: Some(score),
                difficulty_level: Some(mapper.level_for_score(centre)),
                score_delta: Some(delta),
                level_transition: None,
                processing_time_ms: Some(50.0),
                timestamp: None,
            }
        })
        .collect()
}

// ============================================================================
// Simulation
// ============================================================================

#[test]
fn test_same_seed_same_records() {
    let agents = SimulationEngine::population(&AgentProfile::builtins(), 2);
    let first = engine(7, EXTENDED_TURNS).run_population(&agents).unwrap();
    let second = engine(7, EXTENDED_TURNS).run_population(&agents).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), agents.len() * EXTENDED_TURNS as usize);

    let other = engine(8, EXTENDED_TURNS).run_population(&agents).unwrap();
    assert_ne!(first, other);
}

#[test]
fn test_records_respect_score_bounds_and_transitions() {
    let agents = SimulationEngine::population(&AgentProfile::builtins(), 3);
    let records = engine(42, 30).run_population(&agents).unwrap();
    for agent in &agents {
        let rows: Vec<&InteractionRecord> =
            records.iter().filter(|r| r.agent_id == agent.agent_id).collect();
        assert_eq!(rows.len(), 30);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row.turn_number, i as u32 + 1);
            let score = row.comprehension_score.unwrap();
            assert!((0.0..=100.0).contains(&score));
            if i > 0 {
                let changed = rows[i - 1].difficulty_level != row.difficulty_level;
                assert_eq!(changed, row.level_transition.is_some());
            }
        }
    }
}

#[test]
fn test_profiles_separate_over_time() {
    let e = engine(42, EXTENDED_TURNS);
    let struggling = e.run(&AgentProfile::struggling(), EXTENDED_TURNS).unwrap();
    let fast = e.run(&AgentProfile::fast_learner(), EXTENDED_TURNS).unwrap();
    let last = |rows: &[InteractionRecord]| rows.last().unwrap().comprehension_score.unwrap();
    assert!(last(&fast) > last(&struggling));
}

#[test]
fn test_interchange_preserves_records() {
    let records = engine(3, 12)
        .run_population(&[AgentSpec::new("a", AgentProfile::variable())])
        .unwrap();

    let csv = to_csv_string(&records);
    let from_csv = parse_csv(&csv).unwrap();
    assert_eq!(from_csv.len(), records.len());
    for (a, b) in records.iter().zip(&from_csv) {
        assert_eq!(a.turn_number, b.turn_number);
        assert_eq!(a.emoji_feedback, b.emoji_feedback);
        assert_eq!(a.difficulty_level, b.difficulty_level);
        assert_eq!(a.level_transition, b.level_transition);
        assert!((a.comprehension_score.unwrap() - b.comprehension_score.unwrap()).abs() < 1e-6);
    }

    let mut buf = Vec::new();
    write_jsonl(&records, &mut buf).unwrap();
    let from_jsonl = parse_jsonl(&String::from_utf8(buf).unwrap()).unwrap();
    assert_eq!(from_jsonl.len(), records.len());
    for (a, b) in records.iter().zip(&from_jsonl) {
        assert_eq!(a.agent_id, b.agent_id);
        assert_eq!(a.turn_number, b.turn_number);
        assert_eq!(a.timestamp, b.timestamp);
        assert_eq!(a.level_transition, b.level_transition);
        assert!((a.score_delta.unwrap() - b.score_delta.unwrap()).abs() < 1e-9);
    }
}

// ============================================================================
// Analysis
// ============================================================================

#[test]
fn test_separated_agents_differ_significantly() {
    let mut records = synthetic("low", 40.0, 5.0, 20);
    records.extend(synthetic("high", 85.0, 3.0, 20));

    let report = AnalysisEngine::default().analyze(&records);
    assert_eq!(report.agents.len(), 2);

    let cmp = report.comparison("low", "high").unwrap();
    assert!(cmp.p_value < 0.05, "p = {}", cmp.p_value);
    assert!(cmp.significant);
    assert!((cmp.cliffs_delta.value.abs() - 1.0).abs() < 1e-12);
    assert!(cmp.cliffs_delta.interpretation.contains("large"));
    assert!(cmp.hedges_g.as_ref().unwrap().value.abs() > 0.8);
    assert!(cmp.interpretation.contains("high tends to score higher"));
}

#[test]
fn test_every_estimate_carries_uncertainty_and_reading() {
    let agents = SimulationEngine::population(&AgentProfile::builtins(), 2);
    let records = engine(11, EXTENDED_TURNS).run_population(&agents).unwrap();
    let report = AnalysisEngine::default().analyze(&records);

    assert_eq!(report.agents.len(), agents.len());
    assert_eq!(
        report.stages.iter().map(|s| s.stage).collect::<Vec<_>>(),
        AnalysisStage::ALL.to_vec()
    );
    for agent in &report.agents {
        let e = &agent.effectiveness;
        for estimate in [&e.stability_index, &e.adaptation_speed, &e.final_performance]
            .into_iter()
            .flatten()
        {
            assert!(estimate.ci_low.is_some() && estimate.ci_high.is_some());
            assert!(!estimate.interpretation.is_empty());
        }
        let perf = e.final_performance.as_ref().unwrap();
        assert!(perf.ci_low.unwrap() <= perf.value && perf.value <= perf.ci_high.unwrap());
        assert!(agent.convergence.asymptote.is_some());
        assert!(agent.learning_curve.best_fit.is_some());
    }

    let expected_pairs = agents.len() * (agents.len() - 1) / 2;
    assert_eq!(report.comparisons.len(), expected_pairs);

    let markdown = report.render_markdown();
    assert!(markdown.contains("## Cross-profile comparison"));
    let json = report.to_json().unwrap();
    assert!(json.contains("\"comparisons\""));
}

#[test]
fn test_analysis_is_deterministic_for_a_seed() {
    let records = engine(5, 25)
        .run_population(&SimulationEngine::population(&AgentProfile::builtins(), 1))
        .unwrap();
    let a = AnalysisEngine::default().analyze(&records);
    let b = AnalysisEngine::default().analyze(&records);
    assert_eq!(a, b);
}

#[test]
fn test_missing_columns_degrade_to_nulls() {
    let csv = "agent_id,comprehension_score\n\
               a,50\na,52\na,55\na,56\na,58\na,59\na,60\n\
               b,40\nb,41\nb,39\nb,42\nb,40\nb,41\nb,40\n";
    let records = parse_csv(csv).unwrap();
    assert_eq!(records.len(), 14);
    assert_eq!(records[6].turn_number, 7);

    let report = AnalysisEngine::default().analyze(&records);
    let a = report.agent("a").unwrap();
    assert!(a.effectiveness.hysteresis_index.is_none());
    assert!(a.effectiveness.adaptation_speed.is_none());
    assert!(a.responsiveness.polarity_delta_correlation.is_none());
    assert!(a.effectiveness.final_performance.is_some());
    assert!(a.convergence.asymptote.is_some());

    let effectiveness = &report.stages[0];
    assert_eq!(effectiveness.stage, AnalysisStage::Effectiveness);
    assert_eq!(effectiveness.status, StageStatus::Degraded);
    assert!(effectiveness.notes.iter().any(|n| n.contains("hysteresis")));

    assert!(report.comparison("a", "b").is_some());
}

#[test]
fn test_too_few_turns_leave_convergence_null() {
    let records = synthetic("short", 60.0, 2.0, 3);
    let report = AnalysisEngine::default().analyze(&records);
    let agent = report.agent("short").unwrap();
    assert!(agent.convergence.asymptote.is_none());
    assert!(!agent.convergence.converged);
    assert!(agent.learning_curve.final_slope.is_some());
    assert!(report.comparisons.is_empty());
}

#[test]
fn test_analysis_config_is_validated() {
    let config = AnalysisConfig {
        alpha: 1.5,
        ..Default::default()
    };
    assert!(AnalysisEngine::new(config, &EbarsConfig::default()).is_err());
}
