//! Date-bucketed, size-capped log segment resolution.
//!
//! A logical stream maps to one physical file per
//! `(kind, name, date, segment_index)`:
//!
//! ```text
//! events/events_<name>_<YYYY-MM-DD>_<NNN>.log
//! metrics/metrics_<YYYY-MM-DD>_<NNN>.csv
//! ```
//!
//! Segment state is never cached. Every call to [`RotationPolicy::resolve`]
//! walks the indices from 0 and stats each candidate, so the filesystem is
//! the only source of truth and a restarted process picks up exactly where
//! the previous one stopped.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;

use crate::clock;
use crate::sink::file_size;

/// Default segment ceiling for both event and metrics streams.
pub const DEFAULT_SEGMENT_CEILING: u64 = 1_000_000;

/// Kind of a logical log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Captured command output, one stream per command.
    Event,
    /// One row per sampling cycle.
    Metrics,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Event => "events",
            Self::Metrics => "metrics",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Self::Event => "log",
            Self::Metrics => "csv",
        }
    }
}

/// A logical stream identified by `(kind, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogStream {
    kind: StreamKind,
    name: Option<String>,
}

impl LogStream {
    /// Event stream for one named command.
    pub fn event(name: impl Into<String>) -> Self {
        Self {
            kind: StreamKind::Event,
            name: Some(name.into()),
        }
    }

    /// The single metrics stream.
    pub fn metrics() -> Self {
        Self {
            kind: StreamKind::Metrics,
            name: None,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// File name of one segment of this stream.
    pub fn segment_file_name(&self, date: NaiveDate, index: u32) -> String {
        let date = clock::date_bucket(date);
        match &self.name {
            Some(name) => format!(
                "{}_{}_{}_{:03}.{}",
                self.kind.as_str(),
                name,
                date,
                index,
                self.kind.extension()
            ),
            None => format!(
                "{}_{}_{:03}.{}",
                self.kind.as_str(),
                date,
                index,
                self.kind.extension()
            ),
        }
    }
}

/// Outcome of resolving where the next record of a stream belongs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Segment that receives the next append.
    pub path: PathBuf,
    /// Index of that segment within the day.
    pub index: u32,
    /// The segment does not exist yet.
    pub is_new_segment: bool,
    /// Segment to compare against: the one just rolled from when a new
    /// segment follows a full one, the target itself when it already
    /// exists, and `None` for the first segment of the day.
    pub previous: Option<PathBuf>,
}

impl Resolution {
    /// A new segment was opened because its predecessor hit the ceiling.
    pub fn rolled_over(&self) -> bool {
        self.is_new_segment && self.previous.is_some()
    }
}

/// Picks the physical segment for a stream, rolling over at a size ceiling.
#[derive(Debug, Clone)]
pub struct RotationPolicy {
    dir: PathBuf,
    ceiling: u64,
}

impl RotationPolicy {
    pub fn new(dir: impl Into<PathBuf>, ceiling: u64) -> Self {
        Self {
            dir: dir.into(),
            ceiling,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Resolve the current segment of `stream` for `date`.
    ///
    /// Starting at index 0: a missing candidate is the target (new); an
    /// existing candidate below the ceiling is the target (reused); an
    /// existing candidate at or over the ceiling is skipped. Nothing is
    /// created here; the caller's append materializes the segment.
    pub fn resolve(&self, stream: &LogStream, date: NaiveDate) -> Result<Resolution> {
        let mut index: u32 = 0;

        loop {
            let path = self.dir.join(stream.segment_file_name(date, index));
            let size = file_size(&path)
                .with_context(|| format!("inspecting segment {}", path.display()))?;

            match size {
                None => {
                    let previous = index
                        .checked_sub(1)
                        .map(|prev| self.dir.join(stream.segment_file_name(date, prev)));

                    return Ok(Resolution {
                        path,
                        index,
                        is_new_segment: true,
                        previous,
                    });
                }
                Some(size) if size < self.ceiling => {
                    return Ok(Resolution {
                        previous: Some(path.clone()),
                        path,
                        index,
                        is_new_segment: false,
                    });
                }
                Some(_) => {
                    index = index
                        .checked_add(1)
                        .context("segment index overflow")?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::sink::ByteSink;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).expect("valid date")
    }

    #[test]
    fn test_segment_file_names() {
        assert_eq!(
            LogStream::event("last_boot").segment_file_name(day(), 0),
            "events_last_boot_2024-03-01_000.log"
        );
        assert_eq!(
            LogStream::metrics().segment_file_name(day(), 12),
            "metrics_2024-03-01_012.csv"
        );
    }

    #[test]
    fn test_resolve_empty_directory_is_new_first_segment() {
        let dir = TempDir::new().expect("temp dir");
        let policy = RotationPolicy::new(dir.path().join("missing"), 100);

        let res = policy.resolve(&LogStream::metrics(), day()).expect("resolve");
        assert_eq!(res.index, 0);
        assert!(res.is_new_segment);
        assert!(res.previous.is_none());
        assert!(!res.rolled_over());
        assert!(!res.path.exists(), "resolution must not create files");
        assert!(!dir.path().join("missing").exists());
    }

    #[test]
    fn test_resolve_reuses_segment_below_ceiling() {
        let dir = TempDir::new().expect("temp dir");
        let policy = RotationPolicy::new(dir.path(), 100);
        let stream = LogStream::event("boot");

        let first = policy.resolve(&stream, day()).expect("resolve");
        fs::write(&first.path, vec![b'x'; 99]).expect("write");

        let res = policy.resolve(&stream, day()).expect("resolve");
        assert_eq!(res.index, 0);
        assert!(!res.is_new_segment);
        assert_eq!(res.previous.as_deref(), Some(first.path.as_path()));
    }

    #[test]
    fn test_resolve_rolls_at_ceiling() {
        let dir = TempDir::new().expect("temp dir");
        let policy = RotationPolicy::new(dir.path(), 100);
        let stream = LogStream::event("boot");

        let first = policy.resolve(&stream, day()).expect("resolve");
        fs::write(&first.path, vec![b'x'; 100]).expect("write");

        let res = policy.resolve(&stream, day()).expect("resolve");
        assert_eq!(res.index, 1);
        assert!(res.is_new_segment);
        assert!(res.rolled_over());
        assert_eq!(res.previous.as_deref(), Some(first.path.as_path()));
        assert!(res
            .path
            .ends_with("events_boot_2024-03-01_001.log"));
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let dir = TempDir::new().expect("temp dir");
        let policy = RotationPolicy::new(dir.path(), 10);
        let stream = LogStream::metrics();

        fs::write(dir.path().join(stream.segment_file_name(day(), 0)), [0u8; 10]).expect("write");

        let a = policy.resolve(&stream, day()).expect("resolve");
        let b = policy.resolve(&stream, day()).expect("resolve");
        assert_eq!(a, b);
    }

    #[test]
    fn test_streams_and_dates_are_independent() {
        let dir = TempDir::new().expect("temp dir");
        let policy = RotationPolicy::new(dir.path(), 10);
        let boot = LogStream::event("boot");
        let crash = LogStream::event("crash");

        fs::write(dir.path().join(boot.segment_file_name(day(), 0)), [0u8; 10]).expect("write");

        assert_eq!(policy.resolve(&boot, day()).expect("resolve").index, 1);
        assert_eq!(policy.resolve(&crash, day()).expect("resolve").index, 0);

        let next_day = day().succ_opt().expect("next day");
        assert_eq!(policy.resolve(&boot, next_day).expect("resolve").index, 0);
    }

    #[test]
    fn test_sequential_appends_produce_contiguous_segments() {
        let dir = TempDir::new().expect("temp dir");
        let ceiling = 50;
        let policy = RotationPolicy::new(dir.path(), ceiling);
        let stream = LogStream::event("seq");
        let record = [b'r'; 20];

        let mut seen = Vec::new();
        for _ in 0..12 {
            let res = policy.resolve(&stream, day()).expect("resolve");
            if seen.last() != Some(&res.index) {
                seen.push(res.index);
            }
            ByteSink::new(&res.path).append(&record).expect("append");
        }

        let expected: Vec<u32> = (0..seen.len() as u32).collect();
        assert_eq!(seen, expected);

        for index in 0..seen.len() as u32 {
            let path = dir.path().join(stream.segment_file_name(day(), index));
            let size = fs::metadata(&path).expect("segment exists").len();
            assert!(size <= ceiling + record.len() as u64, "segment {index} is {size} bytes");
        }
    }

    #[test]
    fn test_superseded_segment_is_never_reopened() {
        let dir = TempDir::new().expect("temp dir");
        let policy = RotationPolicy::new(dir.path(), 30);
        let stream = LogStream::metrics();

        let mut last_index = 0;
        for _ in 0..10 {
            let res = policy.resolve(&stream, day()).expect("resolve");
            assert!(res.index >= last_index);
            last_index = res.index;
            ByteSink::new(&res.path).append(&[b'z'; 16]).expect("append");
        }
        assert!(last_index >= 3);
    }
}
