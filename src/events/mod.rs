//! Deduplicating capture of system event text.
//!
//! Each configured command owns one rotating stream. Per cycle, the
//! freshly captured output is compared against the last [`TAIL_LINES`]
//! lines of the baseline segment and only lines absent from that tail are
//! appended, below a single timestamp line:
//!
//! ```text
//! # output of command: last -FRx3 boot reboot shutdown root
//! 2024-03-01_12:00:05
//! reboot   system boot  6.1.0 ...
//! 2024-03-01_12:01:41
//! shutdown system down  6.1.0 ...
//! ```

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use tracing::{debug, info, warn};

use crate::clock::{self, MARKER_TIME_FORMAT};
use crate::collect::CommandOutputSource;
use crate::config::EventCommand;
use crate::rotation::{LogStream, Resolution, RotationPolicy};
use crate::sink::ByteSink;

/// Number of trailing baseline lines used for deduplication.
pub const TAIL_LINES: usize = 100;

/// File name of the last-completed-capture marker.
pub const MARKER_FILE_NAME: &str = "last_log_events_time.date";

/// Result of recording one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// A timestamped block with this many novel lines was appended.
    Appended { segment: PathBuf, lines: usize },
    /// Every captured line was already present in the baseline tail.
    Unchanged,
}

/// Per-cycle summary of the event subsystem.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventCycleSummary {
    pub streams: usize,
    pub appended_streams: usize,
    pub appended_lines: usize,
}

/// Writes novel lines of captured command output to rotating segments.
#[derive(Debug, Clone)]
pub struct EventLogger {
    policy: RotationPolicy,
}

impl EventLogger {
    /// Create a logger writing under `dir` (the `events/` directory).
    pub fn new(dir: impl Into<PathBuf>, ceiling: u64) -> Self {
        Self {
            policy: RotationPolicy::new(dir, ceiling),
        }
    }

    pub fn dir(&self) -> &Path {
        self.policy.dir()
    }

    pub fn marker_path(&self) -> PathBuf {
        self.policy.dir().join(MARKER_FILE_NAME)
    }

    /// Record one capture of `command` into the stream named `stream_name`.
    pub fn record(
        &self,
        stream_name: &str,
        command: &str,
        captured: &str,
        now: NaiveDateTime,
    ) -> Result<RecordOutcome> {
        let stream = LogStream::event(stream_name);
        let resolution = self.policy.resolve(&stream, now.date())?;
        let sink = ByteSink::new(&resolution.path);

        if resolution.is_new_segment {
            sink.append(segment_header(command).as_bytes())?;

            if resolution.rolled_over() {
                info!(
                    stream = stream_name,
                    segment = %resolution.path.display(),
                    "event segment rolled over"
                );
            }
        }

        let tail = baseline_tail(&resolution)?;
        let novel = novel_lines(captured, &tail);

        if novel.is_empty() {
            debug!(stream = stream_name, "no novel event lines");
            return Ok(RecordOutcome::Unchanged);
        }

        let block = timestamped_block(now, &novel);
        sink.append(block.as_bytes())?;

        debug!(
            stream = stream_name,
            lines = novel.len(),
            segment = %resolution.path.display(),
            "appended event lines"
        );

        Ok(RecordOutcome::Appended {
            segment: resolution.path,
            lines: novel.len(),
        })
    }

    /// Capture and record every command, then advance the marker.
    ///
    /// The marker is written only after all streams succeed. An error on
    /// any stream ends the cycle early and leaves the marker untouched.
    pub fn record_cycle(
        &self,
        commands: &[EventCommand],
        source: &dyn CommandOutputSource,
        now: NaiveDateTime,
    ) -> Result<EventCycleSummary> {
        fs::create_dir_all(self.dir())
            .with_context(|| format!("creating events directory {}", self.dir().display()))?;

        let mut summary = EventCycleSummary {
            streams: commands.len(),
            ..Default::default()
        };

        for cmd in commands {
            let captured = source.capture(cmd);
            let outcome = self
                .record(&cmd.name, &cmd.command, &captured, now)
                .with_context(|| format!("recording event stream {}", cmd.name))?;

            if let RecordOutcome::Appended { lines, .. } = outcome {
                summary.appended_streams += 1;
                summary.appended_lines += lines;
            }
        }

        self.write_marker(now)?;

        Ok(summary)
    }

    /// Time of the last fully completed capture cycle, if any.
    pub fn last_capture_time(&self) -> Result<Option<NaiveDateTime>> {
        let path = self.marker_path();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading marker {}", path.display()));
            }
        };

        let line = text.lines().next().unwrap_or_default().trim();
        match NaiveDateTime::parse_from_str(line, MARKER_TIME_FORMAT) {
            Ok(ts) => Ok(Some(ts)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable capture marker");
                Ok(None)
            }
        }
    }

    fn write_marker(&self, now: NaiveDateTime) -> Result<()> {
        let path = self.marker_path();
        fs::write(&path, now.format(MARKER_TIME_FORMAT).to_string())
            .with_context(|| format!("writing marker {}", path.display()))
    }
}

/// Comment written at the top of every new segment.
fn segment_header(command: &str) -> String {
    format!("# output of command: {command}\n")
}

fn baseline_tail(resolution: &Resolution) -> Result<Vec<String>> {
    match &resolution.previous {
        Some(path) => read_tail(path, TAIL_LINES),
        None => Ok(Vec::new()),
    }
}

/// Last `n` lines of a file; a missing file has no lines.
pub fn read_tail(path: &Path, n: usize) -> Result<Vec<String>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("reading tail of {}", path.display())),
    };

    let text = String::from_utf8_lossy(&bytes);
    let mut tail: Vec<String> = text.lines().rev().take(n).map(str::to_owned).collect();
    tail.reverse();

    Ok(tail)
}

/// Non-blank lines of `captured` not present in `tail`, in their original order.
pub fn novel_lines<'a>(captured: &'a str, tail: &[String]) -> Vec<&'a str> {
    let seen: HashSet<&str> = tail.iter().map(String::as_str).collect();

    captured
        .lines()
        .filter(|line| !line.trim().is_empty() && !seen.contains(line))
        .collect()
}

fn timestamped_block(now: NaiveDateTime, lines: &[&str]) -> String {
    let mut block = clock::record_time(now);
    block.push('\n');
    for line in lines {
        block.push_str(line);
        block.push('\n');
    }
    block
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::NaiveDate;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    use super::*;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_opt(h, m, s))
            .expect("valid timestamp")
    }

    struct FixedOutput(HashMap<String, String>);

    impl CommandOutputSource for FixedOutput {
        fn capture(&self, cmd: &EventCommand) -> String {
            self.0.get(&cmd.name).cloned().unwrap_or_default()
        }
    }

    struct Recording(Mutex<Vec<String>>);

    impl CommandOutputSource for Recording {
        fn capture(&self, cmd: &EventCommand) -> String {
            self.0.lock().push(cmd.name.clone());
            "line".to_string()
        }
    }

    fn segment(dir: &Path, name: &str, index: u32) -> PathBuf {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).expect("valid date");
        dir.join(LogStream::event(name).segment_file_name(date, index))
    }

    #[test]
    fn test_novel_lines_removes_baseline_lines() {
        let tail = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(novel_lines("a\nb\nd", &tail), vec!["d"]);
    }

    #[test]
    fn test_novel_lines_preserves_order_and_duplicates() {
        let tail = vec!["x".to_string()];
        assert_eq!(novel_lines("q\nx\np\nq", &tail), vec!["q", "p", "q"]);
    }

    #[test]
    fn test_novel_lines_skips_blank_lines() {
        let tail = vec!["a".to_string()];
        assert!(novel_lines("\n", &tail).is_empty());
        assert!(novel_lines("  \n\t\n", &[]).is_empty());
        assert_eq!(novel_lines("b\n\nc\n", &tail), vec!["b", "c"]);
    }

    #[test]
    fn test_novel_lines_subset_is_empty() {
        let tail = vec!["a".to_string(), "b".to_string()];
        assert!(novel_lines("b\na\n", &tail).is_empty());
    }

    #[test]
    fn test_read_tail_limits_and_orders() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("t.log");
        let content: String = (0..150).map(|i| format!("line{i}\n")).collect();
        fs::write(&path, content).expect("write");

        let tail = read_tail(&path, TAIL_LINES).expect("tail");
        assert_eq!(tail.len(), 100);
        assert_eq!(tail.first().map(String::as_str), Some("line50"));
        assert_eq!(tail.last().map(String::as_str), Some("line149"));
    }

    #[test]
    fn test_read_tail_missing_file_is_empty() {
        let dir = TempDir::new().expect("temp dir");
        assert!(read_tail(&dir.path().join("nope"), 10).expect("tail").is_empty());
    }

    #[test]
    fn test_first_record_writes_header_and_block() {
        let dir = TempDir::new().expect("temp dir");
        let logger = EventLogger::new(dir.path(), 1_000_000);

        let outcome = logger
            .record("last_boot", "who -b", "system boot 2024-03-01 08:00\n", at(12, 0, 5))
            .expect("record");
        assert!(matches!(outcome, RecordOutcome::Appended { lines: 1, .. }));

        let content = fs::read_to_string(segment(dir.path(), "last_boot", 0)).expect("read");
        assert_eq!(
            content,
            "# output of command: who -b\n2024-03-01_12:00:05\nsystem boot 2024-03-01 08:00\n"
        );
    }

    #[test]
    fn test_repeat_capture_is_suppressed() {
        let dir = TempDir::new().expect("temp dir");
        let logger = EventLogger::new(dir.path(), 1_000_000);

        logger.record("boot", "who -b", "a\nb\nc", at(12, 0, 0)).expect("record");
        let outcome = logger.record("boot", "who -b", "a\nb\nc", at(12, 1, 0)).expect("record");
        assert_eq!(outcome, RecordOutcome::Unchanged);

        let content = fs::read_to_string(segment(dir.path(), "boot", 0)).expect("read");
        assert_eq!(content.matches("2024-03-01_").count(), 1, "no empty timestamp block");
    }

    #[test]
    fn test_only_novel_lines_are_appended() {
        let dir = TempDir::new().expect("temp dir");
        let logger = EventLogger::new(dir.path(), 1_000_000);

        logger.record("boot", "who -b", "a\nb\nc", at(12, 0, 0)).expect("record");
        logger.record("boot", "who -b", "a\nb\nd", at(12, 1, 0)).expect("record");

        let content = fs::read_to_string(segment(dir.path(), "boot", 0)).expect("read");
        assert!(content.ends_with("2024-03-01_12:01:00\nd\n"), "got {content:?}");
    }

    #[test]
    fn test_empty_capture_writes_nothing_but_header() {
        let dir = TempDir::new().expect("temp dir");
        let logger = EventLogger::new(dir.path(), 1_000_000);

        let outcome = logger.record("crash", "last | grep crash", "", at(12, 0, 0)).expect("record");
        assert_eq!(outcome, RecordOutcome::Unchanged);

        let content = fs::read_to_string(segment(dir.path(), "crash", 0)).expect("read");
        assert_eq!(content, "# output of command: last | grep crash\n");
    }

    #[test]
    fn test_blank_capture_appends_no_block() {
        let dir = TempDir::new().expect("temp dir");
        let logger = EventLogger::new(dir.path(), 1_000_000);

        let outcome = logger.record("crash", "last | grep crash", "\n", at(12, 0, 0)).expect("record");
        assert_eq!(outcome, RecordOutcome::Unchanged);

        let content = fs::read_to_string(segment(dir.path(), "crash", 0)).expect("read");
        assert_eq!(content, "# output of command: last | grep crash\n");
    }

    #[test]
    fn test_rollover_deduplicates_against_previous_segment() {
        let dir = TempDir::new().expect("temp dir");
        let logger = EventLogger::new(dir.path(), 40);

        logger
            .record("journal", "journalctl", "kernel: crash one\nkernel: crash two", at(12, 0, 0))
            .expect("record");
        assert!(fs::metadata(segment(dir.path(), "journal", 0)).expect("seg0").len() >= 40);

        let outcome = logger
            .record("journal", "journalctl", "kernel: crash two\nkernel: crash three", at(12, 1, 0))
            .expect("record");
        assert!(matches!(outcome, RecordOutcome::Appended { lines: 1, .. }));

        let rolled = fs::read_to_string(segment(dir.path(), "journal", 1)).expect("seg1");
        assert_eq!(
            rolled,
            "# output of command: journalctl\n2024-03-01_12:01:00\nkernel: crash three\n"
        );
    }

    #[test]
    fn test_record_cycle_writes_marker_after_all_streams() {
        let dir = TempDir::new().expect("temp dir");
        let logger = EventLogger::new(dir.path().join("events"), 1_000_000);
        let commands = vec![
            EventCommand::new("boot", "who -b"),
            EventCommand::new("crash", "last | grep crash"),
        ];
        let source = FixedOutput(HashMap::from([(
            "boot".to_string(),
            "system boot 2024-03-01 08:00".to_string(),
        )]));

        assert_eq!(logger.last_capture_time().expect("marker"), None);

        let summary = logger
            .record_cycle(&commands, &source, at(12, 30, 15))
            .expect("cycle");
        assert_eq!(
            summary,
            EventCycleSummary {
                streams: 2,
                appended_streams: 1,
                appended_lines: 1,
            }
        );

        let marker = fs::read_to_string(logger.marker_path()).expect("marker");
        assert_eq!(marker, "2024-03-01 12:30");
        assert_eq!(
            logger.last_capture_time().expect("marker"),
            Some(at(12, 30, 0))
        );
    }

    #[test]
    fn test_record_cycle_failure_leaves_marker_stale() {
        let dir = TempDir::new().expect("temp dir");
        let events_dir = dir.path().join("events");
        let logger = EventLogger::new(&events_dir, 1_000_000);
        let source = Recording(Mutex::new(Vec::new()));

        logger
            .record_cycle(&[EventCommand::new("a", "true")], &source, at(10, 0, 0))
            .expect("first cycle");

        // A directory squatting on the second stream's segment path makes its append fail.
        fs::create_dir_all(segment(&events_dir, "b", 0)).expect("squat");

        let commands = vec![EventCommand::new("a", "true"), EventCommand::new("b", "true")];
        let result = logger.record_cycle(&commands, &source, at(11, 0, 0));
        assert!(result.is_err());

        assert_eq!(
            logger.last_capture_time().expect("marker"),
            Some(at(10, 0, 0))
        );
        assert_eq!(*source.0.lock(), vec!["a", "a", "b"]);
    }

    #[test]
    fn test_unreadable_marker_is_ignored() {
        let dir = TempDir::new().expect("temp dir");
        let logger = EventLogger::new(dir.path(), 1_000_000);
        fs::write(logger.marker_path(), "garbage").expect("write");
        assert_eq!(logger.last_capture_time().expect("marker"), None);
    }
}
