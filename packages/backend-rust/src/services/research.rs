//! Offline research runs: simulate the configured profiles, analyse the
//! interaction log and write the artifacts to disk.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use ebars_algo::simulation::record::write_csv;
use ebars_algo::{
    AgentProfile, AnalysisConfig, AnalysisEngine, AnalysisReport, EbarsConfig, EbarsError,
    FeedbackProcessor, SimulationConfig, SimulationEngine,
};

use crate::config::SimulationSettings;

pub const INTERACTIONS_FILE: &str = "interactions.csv";
pub const REPORT_JSON_FILE: &str = "report.json";
pub const REPORT_MARKDOWN_FILE: &str = "report.md";

#[derive(Debug, thiserror::Error)]
pub enum ResearchError {
    #[error("unknown simulation profile: {0}")]
    UnknownProfile(String),
    #[error(transparent)]
    Core(#[from] EbarsError),
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub struct ResearchOutput {
    pub report: AnalysisReport,
    pub record_count: usize,
    pub files: Vec<PathBuf>,
}

/// Profiles named in `settings`, or every built-in profile when none are named.
pub fn resolve_profiles(settings: &SimulationSettings) -> Result<Vec<AgentProfile>, ResearchError> {
    if settings.profiles.is_empty() {
        return Ok(AgentProfile::builtins());
    }
    settings
        .profiles
        .iter()
        .map(|name| {
            AgentProfile::builtin(name).ok_or_else(|| ResearchError::UnknownProfile(name.clone()))
        })
        .collect()
}

pub fn run(
    settings: &SimulationSettings,
    ebars: EbarsConfig,
    analysis: AnalysisConfig,
) -> Result<ResearchOutput, ResearchError> {
    let profiles = resolve_profiles(settings)?;
    let analysis_engine = AnalysisEngine::new(analysis, &ebars)?;
    let processor = FeedbackProcessor::new(ebars)?;
    let engine = SimulationEngine::new(
        processor,
        SimulationConfig {
            turns: settings.turns,
            seed: settings.seed,
            ..SimulationConfig::default()
        },
    );

    let agents = SimulationEngine::population(&profiles, settings.agents_per_profile);
    tracing::info!(
        agents = agents.len(),
        turns = settings.turns,
        seed = settings.seed,
        "running simulation"
    );
    let records = engine.run_population(&agents)?;
    let report = analysis_engine.analyze(&records);
    for note in &report.notes {
        tracing::warn!(note = %note, "analysis note");
    }

    let dir = settings.output_dir.as_path();
    std::fs::create_dir_all(dir).map_err(|source| io_error(dir, source))?;

    let csv_path = dir.join(INTERACTIONS_FILE);
    let file = File::create(&csv_path).map_err(|source| io_error(&csv_path, source))?;
    write_csv(&records, BufWriter::new(file))?;

    let json_path = dir.join(REPORT_JSON_FILE);
    std::fs::write(&json_path, report.to_json()?).map_err(|source| io_error(&json_path, source))?;

    let md_path = dir.join(REPORT_MARKDOWN_FILE);
    std::fs::write(&md_path, report.render_markdown())
        .map_err(|source| io_error(&md_path, source))?;

    tracing::info!(dir = %dir.display(), records = records.len(), "simulation artifacts written");
    Ok(ResearchOutput {
        report,
        record_count: records.len(),
        files: vec![csv_path, json_path, md_path],
    })
}

fn io_error(path: &Path, source: std::io::Error) -> ResearchError {
    ResearchError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(dir: &Path, profiles: &[&str]) -> SimulationSettings {
        SimulationSettings {
            turns: 12,
            seed: 7,
            output_dir: dir.to_path_buf(),
            profiles: profiles.iter().map(|p| p.to_string()).collect(),
            agents_per_profile: 2,
        }
    }

    #[test]
    fn test_run_writes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), &["struggling", "fast-learner"]);
        let output = run(&settings, EbarsConfig::default(), AnalysisConfig::default()).unwrap();

        assert_eq!(output.record_count, 4 * 12);
        assert_eq!(output.report.agents.len(), 4);
        for file in &output.files {
            assert!(file.exists(), "{} missing", file.display());
        }
        let csv = std::fs::read_to_string(dir.path().join(INTERACTIONS_FILE)).unwrap();
        assert!(csv.starts_with("agent_id,turn_number,emoji_feedback"));
        assert_eq!(csv.lines().count(), 4 * 12 + 1);
    }

    #[test]
    fn test_unknown_profile() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_profiles(&settings(dir.path(), &["genius"])).unwrap_err();
        assert!(matches!(err, ResearchError::UnknownProfile(name) if name == "genius"));
    }
}
