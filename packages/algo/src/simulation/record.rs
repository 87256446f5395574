//! Interaction records and their interchange formats.
//!
//! One record per (agent, turn). The CSV column order is fixed; readers
//! accept files with missing or extra columns and leave absent values empty.

use std::collections::HashMap;
use std::io::Write;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EbarsError, Result};
use crate::sanitize::finite_or_none;
use crate::types::{DifficultyLevel, Emoji, LevelTransition};

pub const CSV_COLUMNS: [&str; 9] = [
    "agent_id",
    "turn_number",
    "emoji_feedback",
    "comprehension_score",
    "difficulty_level",
    "score_delta",
    "level_transition",
    "processing_time_ms",
    "timestamp",
];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub agent_id: String,
    /// 1-based
    pub turn_number: u32,
    pub emoji_feedback: Option<Emoji>,
    pub comprehension_score: Option<f64>,
    pub difficulty_level: Option<DifficultyLevel>,
    pub score_delta: Option<f64>,
    /// Set only on turns where the level changed
    #[serde(with = "transition_text")]
    pub level_transition: Option<LevelTransition>,
    pub processing_time_ms: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

mod transition_text {
    use super::LevelTransition;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<LevelTransition>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(t) => serializer.serialize_str(&t.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<LevelTransition>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(text) => text.parse().map(Some).map_err(de::Error::custom),
        }
    }
}

/// Loosely typed row used by both readers before turn numbers are resolved.
#[derive(Debug)]
struct RawRecord {
    agent_id: Option<String>,
    turn_number: Option<u32>,
    emoji_feedback: Option<String>,
    comprehension_score: Option<f64>,
    difficulty_level: Option<String>,
    score_delta: Option<f64>,
    level_transition: Option<String>,
    processing_time_ms: Option<f64>,
    timestamp: Option<String>,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn parse_finite(value: Option<&str>) -> Option<f64> {
    non_empty(value)
        .and_then(|v| v.parse::<f64>().ok())
        .and_then(finite_or_none)
}

fn assemble(raw: Vec<RawRecord>) -> Vec<InteractionRecord> {
    let mut seen_per_agent: HashMap<String, u32> = HashMap::new();
    raw.into_iter()
        .map(|row| {
            let agent_id = row.agent_id.map(|a| a.trim().to_string()).unwrap_or_default();
            let position = seen_per_agent.entry(agent_id.clone()).or_insert(0);
            *position += 1;
            InteractionRecord {
                turn_number: row.turn_number.unwrap_or(*position),
                emoji_feedback: non_empty(row.emoji_feedback.as_deref())
                    .and_then(|e| Emoji::parse(e).ok()),
                comprehension_score: row.comprehension_score.and_then(finite_or_none),
                difficulty_level: non_empty(row.difficulty_level.as_deref())
                    .and_then(|l| DifficultyLevel::parse(l).ok()),
                score_delta: row.score_delta.and_then(finite_or_none),
                level_transition: non_empty(row.level_transition.as_deref())
                    .and_then(|t| t.parse().ok()),
                processing_time_ms: row.processing_time_ms.and_then(finite_or_none),
                timestamp: non_empty(row.timestamp.as_deref())
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| t.with_timezone(&Utc)),
                agent_id,
            }
        })
        .collect()
}

// ==================== CSV ====================

fn escape_csv(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

impl InteractionRecord {
    pub fn to_csv_row(&self) -> String {
        let fields = [
            escape_csv(&self.agent_id),
            self.turn_number.to_string(),
            opt(&self.emoji_feedback),
            opt(&self.comprehension_score),
            opt(&self.difficulty_level),
            opt(&self.score_delta),
            opt(&self.level_transition),
            opt(&self.processing_time_ms),
            self.timestamp
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
                .unwrap_or_default(),
        ];
        fields.join(",")
    }
}

pub fn write_csv<W: Write>(records: &[InteractionRecord], mut writer: W) -> Result<()> {
    let io = |e: std::io::Error| EbarsError::Interchange(e.to_string());
    writeln!(writer, "{}", CSV_COLUMNS.join(",")).map_err(io)?;
    for record in records {
        writeln!(writer, "{}", record.to_csv_row()).map_err(io)?;
    }
    writer.flush().map_err(io)
}

pub fn to_csv_string(records: &[InteractionRecord]) -> String {
    let mut out = CSV_COLUMNS.join(",");
    out.push('\n');
    for record in records {
        out.push_str(&record.to_csv_row());
        out.push('\n');
    }
    out
}

fn split_csv_line(line: &str, line_no: usize) -> Result<Vec<String>> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) if chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            ('"', true) => in_quotes = false,
            ('"', false) if field.is_empty() => in_quotes = true,
            (',', false) => fields.push(std::mem::take(&mut field)),
            (other, _) => field.push(other),
        }
    }
    if in_quotes {
        return Err(EbarsError::Interchange(format!(
            "unterminated quoted field on line {line_no}"
        )));
    }
    fields.push(field);
    Ok(fields)
}

fn column<'a>(columns: &HashMap<String, usize>, cells: &'a [String], name: &str) -> Option<&'a str> {
    columns
        .get(name)
        .and_then(|&i| cells.get(i))
        .map(String::as_str)
}

/// Parse CSV produced by [`write_csv`] or by older tooling with a subset of the columns.
pub fn parse_csv(input: &str) -> Result<Vec<InteractionRecord>> {
    let mut lines = input
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty());

    let Some((header_no, header)) = lines.next() else {
        return Ok(Vec::new());
    };
    let header = header.trim_start_matches('\u{feff}');
    let columns: HashMap<String, usize> = split_csv_line(header, header_no + 1)?
        .into_iter()
        .enumerate()
        .map(|(i, name)| (name.trim().to_lowercase(), i))
        .collect();

    let mut raw = Vec::new();
    for (line_no, line) in lines {
        let cells = split_csv_line(line, line_no + 1)?;
        let cell = |name: &'static str| column(&columns, &cells, name);
        raw.push(RawRecord {
            agent_id: non_empty(cell("agent_id")).map(str::to_string),
            turn_number: non_empty(cell("turn_number")).and_then(|v| v.parse().ok()),
            emoji_feedback: non_empty(cell("emoji_feedback")).map(str::to_string),
            comprehension_score: parse_finite(cell("comprehension_score")),
            difficulty_level: non_empty(cell("difficulty_level")).map(str::to_string),
            score_delta: parse_finite(cell("score_delta")),
            level_transition: non_empty(cell("level_transition")).map(str::to_string),
            processing_time_ms: parse_finite(cell("processing_time_ms")),
            timestamp: non_empty(cell("timestamp")).map(str::to_string),
        });
    }
    Ok(assemble(raw))
}

// ==================== JSON lines ====================

pub fn write_jsonl<W: Write>(records: &[InteractionRecord], mut writer: W) -> Result<()> {
    for record in records {
        let line =
            serde_json::to_string(record).map_err(|e| EbarsError::Interchange(e.to_string()))?;
        writeln!(writer, "{line}").map_err(|e| EbarsError::Interchange(e.to_string()))?;
    }
    writer
        .flush()
        .map_err(|e| EbarsError::Interchange(e.to_string()))
}

pub fn parse_jsonl(input: &str) -> Result<Vec<InteractionRecord>> {
    let mut raw = Vec::new();
    for (line_no, line) in input.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(line)
            .map_err(|e| EbarsError::Interchange(format!("line {}: {e}", line_no + 1)))?;
        raw.push(RawRecord {
            agent_id: value.get("agent_id").and_then(|v| v.as_str()).map(str::to_string),
            turn_number: value
                .get("turn_number")
                .and_then(|v| v.as_u64())
                .and_then(|v| u32::try_from(v).ok()),
            emoji_feedback: value
                .get("emoji_feedback")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            comprehension_score: value.get("comprehension_score").and_then(|v| v.as_f64()),
            difficulty_level: value
                .get("difficulty_level")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            score_delta: value.get("score_delta").and_then(|v| v.as_f64()),
            level_transition: value
                .get("level_transition")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            processing_time_ms: value.get("processing_time_ms").and_then(|v| v.as_f64()),
            timestamp: value.get("timestamp").and_then(|v| v.as_str()).map(str::to_string),
        });
    }
    Ok(assemble(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Vec<InteractionRecord> {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap();
        vec![
            InteractionRecord {
                agent_id: "fast_learner-1".to_string(),
                turn_number: 1,
                emoji_feedback: Some(Emoji::StrongPositive),
                comprehension_score: Some(62.5),
                difficulty_level: Some(DifficultyLevel::Normal),
                score_delta: Some(2.5),
                level_transition: None,
                processing_time_ms: Some(48.213),
                timestamp: Some(t0),
            },
            InteractionRecord {
                agent_id: "fast_learner-1".to_string(),
                turn_number: 2,
                emoji_feedback: Some(Emoji::MildPositive),
                comprehension_score: Some(72.3),
                difficulty_level: Some(DifficultyLevel::Good),
                score_delta: Some(1.8),
                level_transition: Some(LevelTransition {
                    from: DifficultyLevel::Normal,
                    to: DifficultyLevel::Good,
                }),
                processing_time_ms: Some(51.0),
                timestamp: Some(t0 + chrono::Duration::seconds(30)),
            },
        ]
    }

    #[test]
    fn test_csv_header_is_stable() {
        let csv = to_csv_string(&sample());
        let header = csv.lines().next().unwrap();
        assert_eq!(
            header,
            "agent_id,turn_number,emoji_feedback,comprehension_score,difficulty_level,score_delta,level_transition,processing_time_ms,timestamp"
        );
        assert!(csv.contains("normal->good"));
        assert!(csv.contains("2024-01-01T00:00:30.000Z"));
    }

    #[test]
    fn test_csv_read_back() {
        let records = sample();
        let parsed = parse_csv(&to_csv_string(&records)).unwrap();
        assert_eq!(parsed, records);

        let mut buf = Vec::new();
        write_csv(&records, &mut buf).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), to_csv_string(&records));
    }

    #[test]
    fn test_csv_tolerates_missing_columns() {
        let input = "turn_number,agent_id,comprehension_score,extra\n\
                     1,a,50.2,x\n\
                     2,a,not-a-number,y\n\
                     ,a,47\n";
        let parsed = parse_csv(input).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].comprehension_score, Some(50.2));
        assert_eq!(parsed[0].emoji_feedback, None);
        assert_eq!(parsed[1].comprehension_score, None);
        assert_eq!(parsed[2].turn_number, 3);
        assert_eq!(parsed[2].difficulty_level, None);
    }

    #[test]
    fn test_non_finite_cells_read_as_empty() {
        let input = "agent_id,comprehension_score,score_delta\n\
                     a,NaN,inf\n\
                     a,48.5,-1.5\n";
        let parsed = parse_csv(input).unwrap();
        assert_eq!(parsed[0].comprehension_score, None);
        assert_eq!(parsed[0].score_delta, None);
        assert_eq!(parsed[1].comprehension_score, Some(48.5));
        assert_eq!(parsed[1].score_delta, Some(-1.5));
    }

    #[test]
    fn test_csv_quoted_fields() {
        let input = "agent_id,turn_number\n\"agent, \"\"quoted\"\"\",4\n";
        let parsed = parse_csv(input).unwrap();
        assert_eq!(parsed[0].agent_id, "agent, \"quoted\"");
        assert_eq!(parsed[0].turn_number, 4);
        assert!(parse_csv("agent_id\n\"open").is_err());
    }

    #[test]
    fn test_jsonl_read_back_and_partial_rows() {
        let records = sample();
        let mut buf = Vec::new();
        write_jsonl(&records, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("\"level_transition\":\"normal->good\""));
        assert_eq!(parse_jsonl(&text).unwrap(), records);

        let partial = parse_jsonl("{\"agent_id\":\"b\",\"score_delta\":-1.5}\n").unwrap();
        assert_eq!(partial[0].turn_number, 1);
        assert_eq!(partial[0].score_delta, Some(-1.5));
        assert_eq!(partial[0].timestamp, None);
    }

    #[test]
    fn test_empty_input() {
        assert!(parse_csv("").unwrap().is_empty());
        assert!(parse_jsonl("\n\n").unwrap().is_empty());
    }
}
