//! Runs the simulation study and writes `interactions.csv`, `report.json`
//! and `report.md` to `SIM_OUTPUT_DIR`.

use ebars_algo::AnalysisConfig;
use ebars_backend::config::{load_ebars_config, Config, SimulationSettings};
use ebars_backend::logging::init_tracing;
use ebars_backend::services::research;

fn main() {
    let _ = dotenvy::dotenv();
    let config = Config::from_env();
    let _log_guard = init_tracing(&config.log_level, "ebars-simulate.log");

    let settings = SimulationSettings::from_env();
    let ebars = match load_ebars_config() {
        Ok(ebars) => ebars,
        Err(err) => {
            tracing::error!(error = %err, "invalid EBARS configuration");
            std::process::exit(1);
        }
    };
    let analysis = AnalysisConfig {
        seed: settings.seed,
        ..AnalysisConfig::default()
    };

    match research::run(&settings, ebars, analysis) {
        Ok(output) => {
            for file in &output.files {
                println!("{}", file.display());
            }
        }
        Err(err) => {
            tracing::error!(error = %err, "simulation run failed");
            std::process::exit(1);
        }
    }
}
