//! Tabular per-cycle metrics log.
//!
//! One CSV row per cycle with the fixed prefix
//! `time,writetest_big,writetest_small` followed by the dynamic columns in
//! the order the metrics source returned them. The header row is written
//! exactly once, as the first line of a newly created segment. Schema drift
//! between cycles is not checked here.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use tracing::{debug, info};

use crate::clock;
use crate::rotation::{LogStream, Resolution, RotationPolicy};
use crate::sink::ByteSink;

/// Fixed leading columns of every metrics row.
pub const FIXED_COLUMNS: [&str; 3] = ["time", "writetest_big", "writetest_small"];

/// One metrics row ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsRow {
    pub time: NaiveDateTime,
    pub write_big: Duration,
    pub write_small: Duration,
    pub columns: Vec<(String, String)>,
}

impl MetricsRow {
    /// Header line (newline-terminated).
    pub fn header(&self) -> String {
        let names = FIXED_COLUMNS
            .iter()
            .copied()
            .chain(self.columns.iter().map(|(name, _)| name.as_str()));
        csv_line(names)
    }

    /// Data line (newline-terminated).
    pub fn values(&self) -> String {
        let time = clock::record_time(self.time);
        let big = self.write_big.as_secs_f64().to_string();
        let small = self.write_small.as_secs_f64().to_string();

        let fixed = [time.as_str(), big.as_str(), small.as_str()];
        let values = fixed
            .into_iter()
            .chain(self.columns.iter().map(|(_, value)| value.as_str()));
        csv_line(values)
    }
}

/// Appends metrics rows to date-bucketed, size-rotated CSV segments.
#[derive(Debug, Clone)]
pub struct MetricsLogger {
    policy: RotationPolicy,
}

impl MetricsLogger {
    /// Create a logger writing under `dir` (the `metrics/` directory).
    pub fn new(dir: impl Into<PathBuf>, ceiling: u64) -> Self {
        Self {
            policy: RotationPolicy::new(dir, ceiling),
        }
    }

    pub fn dir(&self) -> &Path {
        self.policy.dir()
    }

    /// Append one row, preceded by the header if the segment is new.
    pub fn record(&self, row: &MetricsRow) -> Result<Resolution> {
        fs::create_dir_all(self.dir())
            .with_context(|| format!("creating metrics directory {}", self.dir().display()))?;

        let stream = LogStream::metrics();
        let resolution = self.policy.resolve(&stream, row.time.date())?;

        let mut block = String::new();
        if resolution.is_new_segment {
            block.push_str(&row.header());
            if resolution.rolled_over() {
                info!(segment = %resolution.path.display(), "metrics segment rolled over");
            }
        }
        block.push_str(&row.values());

        ByteSink::new(&resolution.path).append(block.as_bytes())?;

        debug!(
            segment = %resolution.path.display(),
            columns = FIXED_COLUMNS.len() + row.columns.len(),
            "appended metrics row"
        );

        Ok(resolution)
    }
}

/// Join fields with commas, quoting any that need it.
fn csv_line<'a>(fields: impl Iterator<Item = &'a str>) -> String {
    let mut line = String::new();
    for (i, field) in fields.enumerate() {
        if i > 0 {
            line.push(',');
        }
        if field.contains([',', '"', '\n', '\r']) {
            line.push('"');
            line.push_str(&field.replace('"', "\"\""));
            line.push('"');
        } else {
            line.push_str(field);
        }
    }
    line.push('\n');
    line
}
