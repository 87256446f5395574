//! Simulation Engine
//!
//! Drives the feedback processor with synthetic learners. Each agent carries a
//! hidden comprehension that decides which emoji it sends; the tracked score
//! only sees the emojis.
//!
//! Runs are exactly reproducible for a given seed: every agent owns a
//! ChaCha8 stream, so parallel population runs do not depend on scheduling.

pub mod profile;
pub mod record;

use std::f64::consts::PI;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::distributions::{Distribution, WeightedIndex};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{EbarsError, Result};
use crate::feedback::FeedbackProcessor;
use crate::sanitize::{clamp_score, round_to};
use crate::types::{Emoji, StateKey};

pub use profile::{AgentProfile, EmissionBand, EmojiWeights};
pub use record::{InteractionRecord, CSV_COLUMNS};

/// Turns per agent in a standard run
pub const DEFAULT_TURNS: u32 = 20;

/// Turns per agent in an extended run
pub const EXTENDED_TURNS: u32 = 50;

/// Distance between tracked score and hidden comprehension at which content stops helping
const FIT_SCALE: f64 = 50.0;

const PROCESSING_TIME_RANGE_MS: (f64, f64) = (20.0, 120.0);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub turns: u32,
    pub seed: u64,
    /// Timestamp of turn zero; record timestamps are derived from it
    pub start_time: DateTime<Utc>,
    pub turn_interval_secs: i64,
    pub session_id: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            turns: DEFAULT_TURNS,
            seed: 42,
            start_time: Utc
                .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or_default(),
            turn_interval_secs: 30,
            session_id: "simulation".to_string(),
        }
    }
}

/// One agent in a population run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub agent_id: String,
    pub profile: AgentProfile,
}

impl AgentSpec {
    pub fn new(agent_id: impl Into<String>, profile: AgentProfile) -> Self {
        Self {
            agent_id: agent_id.into(),
            profile,
        }
    }
}

/// Per-agent seed derived from the run seed and the agent's position.
pub fn agent_seed(base_seed: u64, index: usize) -> u64 {
    base_seed ^ (index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

#[derive(Debug, Clone)]
pub struct SimulationEngine {
    processor: FeedbackProcessor,
    config: SimulationConfig,
}

impl SimulationEngine {
    pub fn new(processor: FeedbackProcessor, config: SimulationConfig) -> Self {
        Self { processor, config }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn processor(&self) -> &FeedbackProcessor {
        &self.processor
    }

    /// Run one agent named after its profile with the configured seed.
    pub fn run(&self, profile: &AgentProfile, turns: u32) -> Result<Vec<InteractionRecord>> {
        self.run_agent(&profile.name, profile, turns, self.config.seed)
    }

    pub fn run_agent(
        &self,
        agent_id: &str,
        profile: &AgentProfile,
        turns: u32,
        seed: u64,
    ) -> Result<Vec<InteractionRecord>> {
        profile.validate()?;
        let key = StateKey::new(agent_id, self.config.session_id.as_str())?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let (lo, hi) = profile.initial_range;
        let initial = if hi > lo { rng.gen_range(lo..=hi) } else { lo };
        let mut state = self
            .processor
            .seeded_state(&key, initial, self.config.start_time)?;
        let mut comprehension = initial;

        let mut records = Vec::with_capacity(turns as usize);
        for turn in 1..=turns {
            let swing = if profile.oscillation_period > 0 {
                let phase = 2.0 * PI * turn as f64 / profile.oscillation_period as f64;
                profile.oscillation_amplitude * phase.sin()
            } else {
                0.0
            };
            let jitter = rng.gen_range(-1.0..=1.0) * profile.noise_factor * 10.0;
            let perceived = clamp_score(comprehension + swing + jitter);

            let emoji = Self::sample_emoji(profile, perceived, &mut rng)?;
            let processing_time_ms = round_to(
                rng.gen_range(PROCESSING_TIME_RANGE_MS.0..PROCESSING_TIME_RANGE_MS.1),
                3,
            );
            let timestamp = self.config.start_time
                + Duration::seconds(self.config.turn_interval_secs * turn as i64);

            let (next, event) = self.processor.apply_feedback_at(&state, emoji, timestamp)?;

            // content pitched close to the learner's real level helps the most
            let fit = 1.0 - ((next.score - comprehension).abs() / FIT_SCALE).min(1.0);
            comprehension = clamp_score(comprehension + profile.momentum * fit);

            records.push(InteractionRecord {
                agent_id: agent_id.to_string(),
                turn_number: turn,
                emoji_feedback: Some(emoji),
                comprehension_score: Some(event.new_score),
                difficulty_level: Some(event.new_level),
                score_delta: Some(event.score_delta),
                level_transition: event.transition(),
                processing_time_ms: Some(processing_time_ms),
                timestamp: Some(timestamp),
            });
            state = next;
        }

        Ok(records)
    }

    /// Run every agent in parallel. Records come back grouped by agent in input order.
    pub fn run_population(&self, agents: &[AgentSpec]) -> Result<Vec<InteractionRecord>> {
        let per_agent: Vec<Vec<InteractionRecord>> = agents
            .par_iter()
            .enumerate()
            .map(|(index, agent)| {
                self.run_agent(
                    &agent.agent_id,
                    &agent.profile,
                    self.config.turns,
                    agent_seed(self.config.seed, index),
                )
            })
            .collect::<Result<_>>()?;
        Ok(per_agent.into_iter().flatten().collect())
    }

    /// `count` agents per profile, named `<profile>-<n>`.
    pub fn population(profiles: &[AgentProfile], count: usize) -> Vec<AgentSpec> {
        profiles
            .iter()
            .flat_map(|profile| {
                (1..=count).map(move |n| AgentSpec::new(format!("{}-{n}", profile.name), profile.clone()))
            })
            .collect()
    }

    fn sample_emoji(profile: &AgentProfile, perceived: f64, rng: &mut ChaCha8Rng) -> Result<Emoji> {
        let weights = profile.weights_for(perceived).ok_or_else(|| {
            EbarsError::InvalidConfig(format!("profile {} has no emission bands", profile.name))
        })?;
        let dist = WeightedIndex::new(weights.blended(profile.noise_factor))
            .map_err(|e| EbarsError::InvalidConfig(format!("profile {}: {e}", profile.name)))?;
        Ok(Emoji::ALL[dist.sample(rng)])
    }
}

impl Default for SimulationEngine {
    fn default() -> Self {
        Self::new(FeedbackProcessor::default(), SimulationConfig::default())
    }
}
