// src/history.rs
//
// Draw history ingestion.
//
// The historical draw store is an external collaborator; rows arrive loosely
// typed and may be malformed. This module turns them into validated
// `DrawRecord`s, skipping rows with the wrong type, count, range or duplicate
// numbers, and orders the result by draw number.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use rand::seq::index::sample;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::config::LotteryConfig;
use crate::error::{EngineError, EngineResult};

/// One validated historical draw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawRecord {
    pub draw_number: u64,
    pub date: String,
    pub field1_numbers: Vec<u32>,
    pub field2_numbers: Vec<u32>,
}

impl DrawRecord {
    /// Check sizes, ranges and uniqueness against a configuration.
    pub fn is_valid_for(&self, cfg: &LotteryConfig) -> bool {
        valid_field(&self.field1_numbers, cfg.field1_size, cfg.field1_max)
            && valid_field(&self.field2_numbers, cfg.field2_size, cfg.field2_max)
    }

    pub fn field1_sum(&self) -> u64 {
        self.field1_numbers.iter().map(|&n| n as u64).sum()
    }
}

fn valid_field(numbers: &[u32], size: usize, max: usize) -> bool {
    if numbers.len() != size {
        return false;
    }
    let mut seen = HashSet::with_capacity(numbers.len());
    numbers
        .iter()
        .all(|&n| n >= 1 && (n as usize) <= max && seen.insert(n))
}

/// Loosely typed row as delivered by the draw store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawDrawRow {
    #[serde(default)]
    pub draw_number: JsonValue,
    #[serde(default)]
    pub date: JsonValue,
    #[serde(default)]
    pub field1_numbers: JsonValue,
    #[serde(default)]
    pub field2_numbers: JsonValue,
}

impl RawDrawRow {
    /// Convert into a `DrawRecord`, or None if the row is malformed.
    pub fn to_record(&self, cfg: &LotteryConfig) -> Option<DrawRecord> {
        let draw_number = json_to_u64(&self.draw_number)?;
        let date = match &self.date {
            JsonValue::String(s) => s.clone(),
            JsonValue::Null => String::new(),
            other => other.to_string(),
        };
        let mut field1_numbers = json_to_numbers(&self.field1_numbers)?;
        let mut field2_numbers = json_to_numbers(&self.field2_numbers)?;
        field1_numbers.sort_unstable();
        field2_numbers.sort_unstable();

        let record = DrawRecord {
            draw_number,
            date,
            field1_numbers,
            field2_numbers,
        };
        record.is_valid_for(cfg).then_some(record)
    }
}

fn json_to_u64(value: &JsonValue) -> Option<u64> {
    match value {
        JsonValue::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_to_numbers(value: &JsonValue) -> Option<Vec<u32>> {
    match value {
        JsonValue::Array(items) => items
            .iter()
            .map(|v| json_to_u64(v).and_then(|n| u32::try_from(n).ok()))
            .collect(),
        // "1,2,3" or "1 2 3"
        JsonValue::String(s) => s
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|tok| !tok.is_empty())
            .map(|tok| tok.parse::<u32>().ok())
            .collect(),
        _ => None,
    }
}

/// Validate, order and de-duplicate a batch of raw rows.
///
/// Malformed rows are skipped with a debug log line; the call never fails.
pub fn sanitize_rows(rows: &[RawDrawRow], cfg: &LotteryConfig) -> Vec<DrawRecord> {
    let mut records: Vec<DrawRecord> = Vec::with_capacity(rows.len());
    let mut skipped = 0usize;
    for row in rows {
        match row.to_record(cfg) {
            Some(r) => records.push(r),
            None => skipped += 1,
        }
    }
    let before = records.len();
    records.sort_by_key(|r| r.draw_number);
    records.dedup_by_key(|r| r.draw_number);
    let duplicates = before - records.len();

    if skipped > 0 || duplicates > 0 {
        log::debug!(
            "[history] kept {} draws, skipped {} malformed rows, {} duplicate draw numbers",
            records.len(),
            skipped,
            duplicates
        );
    }
    records
}

/// Ensure an already-typed history is ordered and valid for `cfg`.
pub fn sanitize_records(records: &[DrawRecord], cfg: &LotteryConfig) -> Vec<DrawRecord> {
    let mut out: Vec<DrawRecord> = records
        .iter()
        .filter(|r| r.is_valid_for(cfg))
        .cloned()
        .map(|mut r| {
            r.field1_numbers.sort_unstable();
            r.field2_numbers.sort_unstable();
            r
        })
        .collect();
    out.sort_by_key(|r| r.draw_number);
    out.dedup_by_key(|r| r.draw_number);
    out
}

/// Read a JSON-lines file of draw rows. Unparseable lines are skipped.
pub fn load_jsonl<P: AsRef<Path>>(path: P, cfg: &LotteryConfig) -> EngineResult<Vec<DrawRecord>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| EngineError::persistence(path, e.to_string()))?;
    let reader = BufReader::new(file);

    let mut rows = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| EngineError::persistence(path, e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RawDrawRow>(&line) {
            Ok(row) => rows.push(row),
            Err(e) => log::debug!("[history] line {}: skipped ({})", idx + 1, e),
        }
    }
    Ok(sanitize_rows(&rows, cfg))
}

/// Write draws as JSON lines.
pub fn write_jsonl<P: AsRef<Path>>(path: P, draws: &[DrawRecord]) -> EngineResult<()> {
    let path = path.as_ref();
    let io_err = |e: std::io::Error| EngineError::persistence(path, e.to_string());
    let file = File::create(path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    for draw in draws {
        let line = serde_json::to_string(draw)
            .map_err(|e| EngineError::persistence(path, e.to_string()))?;
        writeln!(writer, "{}", line).map_err(io_err)?;
    }
    writer.flush().map_err(io_err)
}

/// Deterministic uniform random history, used by the CLI and tests.
pub fn synthetic_history(cfg: &LotteryConfig, count: usize, seed: u64) -> Vec<DrawRecord> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let mut f1: Vec<u32> = sample(&mut rng, cfg.field1_max, cfg.field1_size)
                .into_iter()
                .map(|n| n as u32 + 1)
                .collect();
            let mut f2: Vec<u32> = sample(&mut rng, cfg.field2_max, cfg.field2_size)
                .into_iter()
                .map(|n| n as u32 + 1)
                .collect();
            f1.sort_unstable();
            f2.sort_unstable();
            DrawRecord {
                draw_number: i as u64 + 1,
                date: format!("day-{:05}", i + 1),
                field1_numbers: f1,
                field2_numbers: f2,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(n: JsonValue, f1: JsonValue, f2: JsonValue) -> RawDrawRow {
        RawDrawRow {
            draw_number: n,
            date: json!("2024-01-01"),
            field1_numbers: f1,
            field2_numbers: f2,
        }
    }

    #[test]
    fn malformed_rows_are_skipped() {
        let cfg = LotteryConfig::mini();
        let rows = vec![
            row(json!(1), json!([1, 2, 3, 4]), json!([5, 6, 7, 8])),
            // wrong count
            row(json!(2), json!([1, 2, 3]), json!([5, 6, 7, 8])),
            // duplicate within field
            row(json!(3), json!([1, 1, 3, 4]), json!([5, 6, 7, 8])),
            // out of range
            row(json!(4), json!([1, 2, 3, 40]), json!([5, 6, 7, 8])),
            // wrong type
            row(json!("abc"), json!([1, 2, 3, 4]), json!([5, 6, 7, 8])),
            // string-encoded numbers are accepted
            row(json!("6"), json!("4,3,2,1"), json!("8 7 6 5")),
        ];
        let records = sanitize_rows(&rows, &cfg);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].draw_number, 6);
        assert_eq!(records[1].field1_numbers, vec![1, 2, 3, 4]);
    }

    #[test]
    fn rows_are_ordered_and_deduplicated() {
        let cfg = LotteryConfig::mini();
        let rows = vec![
            row(json!(3), json!([1, 2, 3, 4]), json!([5, 6, 7, 8])),
            row(json!(1), json!([1, 2, 3, 4]), json!([5, 6, 7, 8])),
            row(json!(3), json!([9, 2, 3, 4]), json!([5, 6, 7, 8])),
        ];
        let records = sanitize_rows(&rows, &cfg);
        let numbers: Vec<u64> = records.iter().map(|r| r.draw_number).collect();
        assert_eq!(numbers, vec![1, 3]);
    }

    #[test]
    fn synthetic_history_is_valid_and_deterministic() {
        let cfg = LotteryConfig::euro_style();
        let a = synthetic_history(&cfg, 50, 7);
        let b = synthetic_history(&cfg, 50, 7);
        assert_eq!(a, b);
        assert!(a.iter().all(|d| d.is_valid_for(&cfg)));
    }

    #[test]
    fn jsonl_round_trip_skips_garbage_lines() {
        let cfg = LotteryConfig::mini();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("draws.jsonl");
        let draws = synthetic_history(&cfg, 5, 1);
        write_jsonl(&path, &draws).expect("write");

        let mut contents = std::fs::read_to_string(&path).expect("read");
        contents.push_str("not json at all\n");
        std::fs::write(&path, contents).expect("rewrite");

        let loaded = load_jsonl(&path, &cfg).expect("load");
        assert_eq!(loaded, draws);
    }
}
